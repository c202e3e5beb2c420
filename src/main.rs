use mimalloc::MiMalloc;
use rota::{Config, SyncOperator};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Config::from_optional_toml();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.basic.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        instance = %cfg.basic.instance_name,
        database_url = %cfg.store.database_url,
        loglevel = %cfg.basic.loglevel,
        refresh_interval = ?cfg.store.refresh_interval(),
        cleanup_interval = ?cfg.store.cleanup_interval(),
        use_transactions = cfg.store.use_transactions,
    );

    let operator = SyncOperator::new(cfg.store)?;
    operator.connect().await?;
    info!(
        users = operator.users().len(),
        last_updated = %operator.last_updated(),
        "Store ready"
    );

    shutdown_signal().await;
    operator.close().await;
    info!("Store has shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
