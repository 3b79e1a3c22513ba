use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hastream::client::local::LocalClientFactory;
use hastream::{
    ConsumerLoop, FailoverController, FailoverRegistry, FileRegistry, HaConfig, Message, Role,
    ShutdownFlag, TargetRef,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Consume a stream, following producers onto their secondary",
    long_about = None
)]
struct Args {
    /// JSON configuration file (compiled-in defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Registry file shared with producers
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Poll interval in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HaConfig::load(path).context("Failed to load configuration")?,
        None => HaConfig::default(),
    };
    if let Some(registry) = args.registry {
        config.registry_path = registry;
    }
    if let Some(poll_ms) = args.poll_ms {
        config.consumer.poll_interval = Duration::from_millis(poll_ms);
    }
    config.validate()?;

    info!("Primary: {}", config.primary);
    info!("Registry: {}", config.registry_path.display());

    let registry: Arc<dyn FailoverRegistry> = Arc::new(FileRegistry::new(&config.registry_path));
    let controller = FailoverController::new(
        Role::Consumer,
        config.primary.clone(),
        LocalClientFactory,
        registry,
        config.controller_config(),
    )
    .context("Failed to build consumer")?;

    let shutdown = ShutdownFlag::with_signals().context("Failed to install signal handlers")?;
    let mut consumer = ConsumerLoop::new(controller, config.consumer);
    let report = consumer.run(&shutdown, &mut |_target: &TargetRef, message: &Message| {
        println!("Consumed: {}", String::from_utf8_lossy(&message.value));
    });

    info!(
        "Stopped after {} polls: {} consumed, {} failed polls",
        report.polls, report.delivered, report.failed_polls
    );
    Ok(())
}
