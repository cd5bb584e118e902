use args::Args;
use clap::Parser;
use engine::{metrics::describe_metrics, BridgeRegistry, BridgeStatus, ErrorExt, MemoryRelay};
use tokio::{select, signal};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    //if RUST_LOG env is not set, set it to info
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::registry().with(fmt::layer()).with(EnvFilter::from_default_env()).init();
    describe_metrics();

    let rules = args.rules();
    if rules.is_empty() {
        anyhow::bail!("no forward configured, use -L and/or -R");
    }

    // both ends of every relay endpoint live in this process
    let relay = MemoryRelay::new().with_stream_buffer(args.buffer_size);
    let (registry, mut events) = BridgeRegistry::new(relay, args.engine_config(), Some(args.connection_string.clone()));

    let report = registry.start(rules).await?;
    for failure in &report.failed {
        log::error!("[Main] rule {failure}");
    }
    log::info!("[Main] {} bridge(s) started, {} failed", report.started.len(), report.failed.len());

    loop {
        select! {
            _ = signal::ctrl_c() => {
                log::info!("[Main] interrupted, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(event) if event.status == BridgeStatus::Faulted => {
                    log::error!("[Main] bridge {} faulted: {}", event.key, event.detail.unwrap_or_default());
                    registry.stop().await.print_on_err("[Main] stop registry");
                    std::process::exit(1);
                }
                Some(event) => log::debug!("[Main] bridge {} {} => {}", event.key, event.bridge, event.status),
                None => break,
            }
        }
    }

    registry.stop().await?;
    Ok(())
}
