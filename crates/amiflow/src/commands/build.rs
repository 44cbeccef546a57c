use super::resolve_template;
use amiflow_aws::AwsOptions;
use amiflow_build::{
    Artifact, BuildContext, BuildError, BuildProgress, LocalShell, from_config, run,
};
use amiflow_cloud::{CancellationToken, CloudClients, TracingUi, Ui};
use amiflow_config::{AccessConfig, BuilderEntry, Template};
use colored::Colorize;
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub struct BuildArgs {
    pub template: Option<PathBuf>,
    pub only: Vec<String>,
    pub manifest: Option<PathBuf>,
    pub destroy_on_success: bool,
}

pub async fn handle(args: BuildArgs) -> anyhow::Result<()> {
    let path = resolve_template(args.template)?;
    let template = amiflow_config::load_template(&path)?;
    let entries = select(&template, &args.only)?;
    info!(template = %path.display(), builders = entries.len(), "Loaded template");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!(
                    "{}",
                    "Interrupt received, cancelling and cleaning up...".yellow()
                );
                cancel.cancel();
            }
        });
    }

    let commands = template.commands();
    let mut artifacts: BTreeMap<String, Artifact> = BTreeMap::new();
    let mut failed: Vec<String> = Vec::new();

    for entry in &entries {
        let name = entry.name().to_string();
        match build_one(entry, &commands, &cancel).await {
            Ok(Some(artifact)) => {
                artifacts.insert(name, artifact);
            }
            Ok(None) => {
                println!("{}", format!("==> {}: no image was created", name).bold());
            }
            Err(e) => {
                eprintln!(
                    "{}",
                    format!("Build '{}' errored: {}", name, e.user_message()).red()
                );
                failed.push(name);
                if matches!(e, BuildError::Cancelled) {
                    break;
                }
            }
        }
    }

    if let Some(manifest) = &args.manifest {
        std::fs::write(manifest, serde_json::to_string_pretty(&artifacts)?)?;
        println!("Manifest written to {}", manifest.display().to_string().cyan());
    }

    println!();
    println!("{}", "==> Builds finished.".bold());
    for (name, artifact) in &artifacts {
        println!("--> {}: {}", name.cyan(), artifact);
    }

    if !failed.is_empty() {
        anyhow::bail!(
            "{} of {} builds failed: {}",
            failed.len(),
            entries.len(),
            failed.join(", ")
        );
    }

    if args.destroy_on_success {
        for entry in &entries {
            if let Some(artifact) = artifacts.get(entry.name()) {
                destroy(entry, artifact).await?;
            }
        }
    }
    Ok(())
}

/// Template order, restricted to `only` when given
fn select<'a>(template: &'a Template, only: &[String]) -> anyhow::Result<Vec<&'a BuilderEntry>> {
    for name in only {
        template.builder(name)?;
    }
    Ok(template
        .builders
        .iter()
        .filter(|b| only.is_empty() || only.iter().any(|n| n == b.name()))
        .collect())
}

async fn connect(access: &AccessConfig) -> amiflow_cloud::Result<CloudClients> {
    let options = AwsOptions {
        profile: access.profile.clone(),
        max_retries: access.max_retries,
        ..AwsOptions::new(access.region.clone())
    };
    amiflow_aws::connect(&options).await
}

async fn build_one(
    entry: &BuilderEntry,
    commands: &[String],
    cancel: &CancellationToken,
) -> Result<Option<Artifact>, BuildError> {
    let name = entry.name();
    let clients = connect(entry.kind.access()).await?;

    let progress = std::io::stdout()
        .is_terminal()
        .then(|| Arc::new(BuildProgress::new(name)));
    let ui: Arc<dyn Ui> = match &progress {
        Some(progress) => progress.clone(),
        None => Arc::new(TracingUi::new(name)),
    };

    let builder = from_config(&entry.kind);
    let context = BuildContext {
        clients,
        ui,
        host_shell: Arc::new(LocalShell),
        commands: commands.to_vec(),
        communicator: None,
    };
    let result = run(builder.as_ref(), context, cancel).await;

    if let Some(progress) = progress {
        match &result {
            Ok(Some(artifact)) => progress.finish_success(&artifact.id()),
            Ok(None) => progress.finish_success(""),
            Err(e) => progress.finish_error(&e.to_string()),
        }
    }
    result
}

async fn destroy(entry: &BuilderEntry, artifact: &Artifact) -> anyhow::Result<()> {
    println!("{}", format!("==> {}: Destroying {}", entry.name(), artifact.id()).bold());
    let clients = connect(entry.kind.access()).await?;
    artifact
        .destroy(&CancellationToken::new(), clients.regions.as_ref())
        .await
        .map_err(BuildError::Destroy)?;
    Ok(())
}
