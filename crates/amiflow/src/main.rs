mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "amiflow")]
#[command(about = "Build Amazon Machine Images from a YAML template", long_about = None)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the template's builders
    Build {
        /// Template path (default: AMIFLOW_TEMPLATE or amiflow.yaml lookup)
        #[arg(short, long, env = "AMIFLOW_TEMPLATE")]
        template: Option<PathBuf>,
        /// Only run the builders with these names
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
        /// Write the artifacts as JSON to this file
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Deregister the images again once every builder has succeeded
        #[arg(long)]
        destroy_on_success: bool,
    },
    /// Check the template without calling AWS
    Validate {
        /// Template path (default: AMIFLOW_TEMPLATE or amiflow.yaml lookup)
        #[arg(short, long, env = "AMIFLOW_TEMPLATE")]
        template: Option<PathBuf>,
    },
    /// Show version information
    Version,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Version => {
            println!("amiflow {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Validate { template } => commands::validate::handle(template),
        Commands::Build {
            template,
            only,
            manifest,
            destroy_on_success,
        } => {
            commands::build::handle(commands::build::BuildArgs {
                template,
                only,
                manifest,
                destroy_on_success,
            })
            .await
        }
    }
}
