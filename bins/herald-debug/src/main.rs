use std::{env, sync::Arc};

use anyhow::Result;
use herald_link::{ConnectionManager, LinkConfig, StaticToken, TungsteniteDialer};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("herald_debug=info".parse()?)
                .add_directive("herald_link=debug".parse()?),
        )
        .init();

    let cfg = LinkConfig {
        base_url: env::var("HERALD_BASE_URL").unwrap_or_else(|_| LinkConfig::default().base_url),
        ..LinkConfig::default()
    };
    let token = env::var("HERALD_TOKEN").ok().filter(|t| !t.is_empty());

    let manager = ConnectionManager::new(
        cfg.clone(),
        Arc::new(StaticToken(token)),
        Arc::new(TungsteniteDialer::default()),
    );

    let notifications = manager.on_notification(|incoming| {
        info!(
            id = %incoming.id,
            kind = incoming.kind.as_str(),
            title = %incoming.title,
            body = %incoming.body,
            timestamp = ?incoming.timestamp,
            "notification"
        );
    });
    let connection = manager.on_connection_change(|connected| {
        info!(connected, "connection changed");
    });

    info!(base_url = %cfg.base_url, path = %cfg.path, "herald-debug connecting");
    manager.connect().await;

    info!("press Ctrl+C to stop");
    signal::ctrl_c().await?;

    manager.disconnect().await;
    notifications.unsubscribe();
    connection.unsubscribe();

    Ok(())
}
