use amiflow_cloud::Ui;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

/// Spinner showing the current headline, with earlier lines printed above it
pub struct BuildProgress {
    prefix: String,
    progress_bar: ProgressBar,
}

impl BuildProgress {
    pub fn new(builder_name: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.enable_steady_tick(std::time::Duration::from_millis(120));
        pb.set_message(format!("Building {}...", builder_name));

        Self {
            prefix: builder_name.to_string(),
            progress_bar: pb,
        }
    }

    pub fn finish_success(&self, summary: &str) {
        self.progress_bar
            .finish_with_message(format!("{} {}", "Build completed ✓".green(), summary));
    }

    pub fn finish_error(&self, error: &str) {
        self.progress_bar
            .finish_with_message(format!("Build failed: {}", error).red().to_string());
    }
}

impl Ui for BuildProgress {
    fn say(&self, message: &str) {
        tracing::info!(builder = %self.prefix, "{}", message);
        self.progress_bar
            .println(format!("==> {}: {}", self.prefix, message).bold().to_string());
        self.progress_bar.set_message(message.to_string());
    }

    fn message(&self, message: &str) {
        tracing::debug!(builder = %self.prefix, "{}", message);
        self.progress_bar
            .println(format!("    {}: {}", self.prefix, message));
    }

    fn error(&self, message: &str) {
        tracing::error!(builder = %self.prefix, "{}", message);
        self.progress_bar
            .println(format!("==> {}: {}", self.prefix, message).red().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_progress_accepts_lines() {
        let progress = BuildProgress::new("amazon-ebs");
        progress.progress_bar.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        progress.say("Creating temporary keypair...");
        assert_eq!(progress.progress_bar.message(), "Creating temporary keypair...");
        progress.message("Key pair: amiflow_1");
        progress.error("boom");
        progress.finish_error("boom");
        assert!(progress.progress_bar.is_finished());
    }
}
