use anyhow::{bail, Result};
use casesync_core::Region;
use casesync_pipeline::{RegionRegistry, SyncPipeline, SyncSettings};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "casesync-cli")]
#[command(about = "LGA case-count synchronizer command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run synchronization for one region, or every enabled region.
    Sync {
        #[arg(long)]
        region: Option<String>,
    },
    /// List the configured regions.
    Regions,
    /// Serve the HTTP trigger routes.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { region: None }) {
        Commands::Sync { region } => {
            let settings = SyncSettings::from_env();
            let registry = RegionRegistry::load(&settings.registry_path)?;
            let pipeline = SyncPipeline::new(settings)?;

            let targets = match region.as_deref() {
                Some(slug) => {
                    let Some(region) = Region::from_slug(slug) else {
                        bail!("unknown region: {slug}");
                    };
                    let Some(config) = registry.region(region) else {
                        bail!("region not configured: {slug}");
                    };
                    vec![config]
                }
                None => registry.enabled(),
            };

            let mut failed_regions = Vec::new();
            for config in targets {
                match pipeline.run_region(config).await {
                    Ok(summary) => println!(
                        "sync complete: region={} run_id={} records={} matched={} succeeded={} failed={}",
                        summary.region.slug(),
                        summary.run_id,
                        summary.source_records,
                        summary.matched,
                        summary.succeeded,
                        summary.failed
                    ),
                    Err(err) => {
                        error!(region = config.region.slug(), error = %err, "synchronization failed");
                        failed_regions.push(config.region.slug());
                    }
                }
            }
            if !failed_regions.is_empty() {
                bail!("synchronization failed for: {}", failed_regions.join(", "));
            }
        }
        Commands::Regions => {
            let settings = SyncSettings::from_env();
            let registry = RegionRegistry::load(&settings.registry_path)?;
            for config in &registry.regions {
                println!(
                    "{}\tstate={}\tkey={}\tenabled={}",
                    config.region.slug(),
                    config.region.state_name(),
                    match config.region.key_field() {
                        casesync_core::KeyField::LgaCode => "lga-code",
                        casesync_core::KeyField::LgaName => "lga-name",
                    },
                    config.enabled
                );
            }
        }
        Commands::Serve => {
            casesync_web::serve_from_env().await?;
        }
    }

    Ok(())
}
