use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use hastream::client::local::{self, LocalAdminClient, LocalClientFactory};
use hastream::{
    FailoverController, FailoverRegistry, FileRegistry, HaConfig, ProcessEnvExporter,
    ProducerLoop, Role, ShellExporter, ShutdownFlag,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Send messages with automatic failover to a secondary stream",
    long_about = None
)]
struct Args {
    /// JSON configuration file (compiled-in defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of messages to send
    #[arg(short = 'n', long)]
    count: Option<u64>,

    /// Registry file shared with consumers
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Create the primary stream on its endpoint if it does not exist
    #[arg(long)]
    init_primary: bool,

    /// Publish the secondary endpoint with setx / a login shell instead of
    /// only this process's environment
    #[arg(long)]
    shell_export: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HaConfig::load(path).context("Failed to load configuration")?,
        None => HaConfig::default(),
    };
    if let Some(count) = args.count {
        config.producer.message_count = count;
    }
    if let Some(registry) = args.registry {
        config.registry_path = registry;
    }
    config.validate()?;

    if args.init_primary {
        std::fs::create_dir_all(local::endpoint_root(&config.primary.endpoint))
            .context("Failed to create primary endpoint directory")?;
        local::create_stream(&config.primary.endpoint, &config.primary.id, &config.primary.id, 1)
            .context("Failed to create primary stream")?;
    }
    std::fs::create_dir_all(local::endpoint_root(&config.secondary_endpoint))
        .context("Failed to create secondary endpoint directory")?;

    info!("Primary: {}", config.primary);
    info!("Registry: {}", config.registry_path.display());

    let registry: Arc<dyn FailoverRegistry> = Arc::new(FileRegistry::new(&config.registry_path));
    let controller = FailoverController::new(
        Role::Producer,
        config.primary.clone(),
        LocalClientFactory,
        registry,
        config.controller_config(),
    )
    .context("Failed to build producer")?
    .with_admin(LocalAdminClient::new(&config.secondary_endpoint));
    let controller = if args.shell_export {
        controller.with_exporter(ShellExporter)
    } else {
        controller.with_exporter(ProcessEnvExporter)
    };

    let shutdown = ShutdownFlag::with_signals().context("Failed to install signal handlers")?;
    let settings = config.producer.clone();
    let mut producer = ProducerLoop::new(controller, config.producer);
    let report = producer.run(settings.messages(), &shutdown);

    info!(
        "Done: {} delivered, {} undelivered, active target {}",
        report.delivered,
        report.undelivered,
        producer.controller().active_target()
    );
    Ok(())
}
