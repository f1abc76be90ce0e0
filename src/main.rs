//! murmur CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use std::sync::Arc;

use murmur::config::{Config, RuntimeConfig};
use murmur::conversation::{SentMessageLedger, ThreadHistory};
use murmur::llm::{OpenAiBackend, RotationPool};
use murmur::messaging::{ConsoleTransport, MessagingDyn};
use murmur::tools::EchoTools;

#[derive(Parser)]
#[command(name = "murmur")]
#[command(about = "Chat gateway that streams a tag language into chat actions")]
struct Cli {
    /// Path to config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Write logs to a daily rolling file in this directory instead of stderr
    #[arg(long)]
    log_dir: Option<std::path::PathBuf>,

    /// Answer `[tool:...]` spans by echoing the invocation back
    #[arg(long)]
    echo_tools: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _log_guard = match &cli.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)
                .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
            Some(murmur::logging::init_file_tracing(log_dir, cli.debug))
        }
        None => {
            murmur::logging::init_foreground_tracing(cli.debug);
            None
        }
    };

    tracing::info!("starting murmur");

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let slots = config
        .model_slots(|key| std::env::var(key).ok())
        .context("failed to resolve credentials")?;
    let pool = RotationPool::new(slots, config.pool.block_duration())
        .context("failed to build rotation pool")?;
    tracing::info!(models = pool.models().len(), "rotation pool ready");

    let backend = OpenAiBackend::new(config.backend.base_url.clone(), config.backend.timeout())
        .context("failed to initialize generation backend")?;
    let transport: Arc<dyn MessagingDyn> = Arc::new(ConsoleTransport::new());
    let (event_tx, mut event_rx) = tokio::sync::broadcast::channel(256);

    let deps = murmur::GatewayDeps {
        pool: Arc::new(pool),
        backend: Arc::new(backend),
        transport: transport.clone(),
        tools: cli
            .echo_tools
            .then(|| Arc::new(EchoTools) as Arc<dyn murmur::tools::ToolExecutor>),
        ledger: Arc::new(SentMessageLedger::new(config.ledger.capacity)),
        history: Arc::new(ThreadHistory::new(config.ledger.history_capacity)),
        runtime_config: Arc::new(RuntimeConfig::new(&config)),
        event_tx,
    };

    let pool = deps.pool.clone();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(murmur::ProcessEvent::GenerationFailed { thread_id, error, .. }) => {
                    tracing::warn!(
                        %thread_id,
                        %error,
                        pool = ?pool.snapshot(),
                        "generation failed"
                    );
                }
                Ok(event) => tracing::trace!(?event, "process event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event listener lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let scheduler = murmur::agent::ThreadScheduler::new(deps);
    let inbound = transport
        .start()
        .await
        .context("failed to start transport")?;
    tracing::info!(transport = transport.name(), "murmur ready");

    let serve = async {
        scheduler.run(inbound).await;
        tracing::info!("transport closed, finishing in-flight replies");
        scheduler.wait_idle().await;
    };
    tokio::select! {
        _ = serve => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    scheduler.shutdown().await;
    if let Err(error) = transport.shutdown().await {
        tracing::warn!(%error, "transport shutdown failed");
    }
    tracing::info!("murmur stopped");

    Ok(())
}
