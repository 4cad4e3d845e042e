use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mcconsole_core::auth::{AdminKey, JsonKeyStore};
use mcconsole_core::config::GlobalConfig;
use mcconsole_core::console::SubscriptionFilter;
use mcconsole_core::supervisor::scheduler::RestartScheduler;
use mcconsole_core::Supervisor;

fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MCCONSOLE_CONFIG").ok())
        .unwrap_or_else(|| "config.toml".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let config = GlobalConfig::load(&path).with_context(|| format!("cannot start without {}", path))?;

    // RUST_LOG가 있으면 우선
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!("Console supervisor starting ({} servers configured)", config.servers.len());

    let store = JsonKeyStore::new(&config.general.key_store);
    let (supervisor, admin) = Supervisor::from_config(&config, Box::new(store))
        .context("failed to initialize key storage")?;

    match &admin {
        AdminKey::Generated(issued) => {
            tracing::warn!("Admin API key created, it will not be shown again: {}", issued.secret);
        }
        AdminKey::Existing(key) => tracing::info!("Using existing admin key {}", key.id),
    }

    // 이벤트 로그 (lifecycle 이벤트만, 콘솔 줄은 pump에서 이미 기록)
    let mut events = supervisor.bus().subscribe(SubscriptionFilter::All);
    let event_log = events.canceller();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if event.is_console_line() {
                continue;
            }
            match serde_json::to_string(&*event) {
                Ok(json) => tracing::debug!(target: "events", "{}", json),
                Err(e) => tracing::warn!("Failed to encode event: {}", e),
            }
        }
    });

    let cancel = CancellationToken::new();
    let scheduler = RestartScheduler::spawn(supervisor.clone(), config.general.scheduler_tick(), cancel.clone());

    supervisor.autostart().await;
    tracing::info!(
        "Ready; transport settings {}:{}",
        config.general.host,
        config.general.port
    );

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
    tracing::info!("Shutdown signal received, stopping all instances...");

    cancel.cancel();
    supervisor.shutdown().await;
    event_log.cancel();
    if let Err(e) = scheduler.await {
        tracing::warn!("Scheduler task ended abnormally: {}", e);
    }

    tracing::info!("Console supervisor shut down");
    Ok(())
}
