use std::{env, fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use herald_delivery::{DeliveryConfig, DeliveryCoordinator, DeliveryEvent, FilePreferenceStore};
use herald_link::{ConnectionManager, LinkConfig, TokenProvider, TungsteniteDialer};
use herald_types::MAX_NOTIFICATIONS;
use serde::Deserialize;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod desktop;

use desktop::{DesktopPlatform, DesktopSettings};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct AppConfig {
    connection: ConnectionSection,
    delivery: DeliverySection,
    push: PushSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ConnectionSection {
    base_url: String,
    heartbeat_interval_secs: u64,
    reconnect_base_delay_ms: u64,
    max_reconnect_attempts: u32,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        let link = LinkConfig::default();
        Self {
            base_url: link.base_url,
            heartbeat_interval_secs: link.heartbeat_interval.as_secs(),
            reconnect_base_delay_ms: u64::try_from(link.reconnect_base_delay.as_millis())
                .unwrap_or(u64::MAX),
            max_reconnect_attempts: link.max_reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct DeliverySection {
    max_notifications: usize,
    state_dir: Option<PathBuf>,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            max_notifications: MAX_NOTIFICATIONS,
            state_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct PushSection {
    app_name: String,
    request_permission: bool,
    expire_timeout_ms: i32,
    foreground: bool,
    bell: bool,
}

impl Default for PushSection {
    fn default() -> Self {
        Self {
            app_name: "herald".to_string(),
            request_permission: true,
            expire_timeout_ms: -1,
            foreground: false,
            bell: false,
        }
    }
}

impl AppConfig {
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(base_url) = env::var("HERALD_BASE_URL") {
            self.connection.base_url = base_url;
        }
        if let Some(state_dir) = env::var_os("HERALD_STATE_DIR") {
            self.delivery.state_dir = Some(PathBuf::from(state_dir));
        }
        if let Some(attempts) = env::var("HERALD_MAX_RECONNECT_ATTEMPTS")
            .ok()
            .map(|s| s.parse::<u32>())
            .transpose()
            .context("HERALD_MAX_RECONNECT_ATTEMPTS must be a valid u32")?
        {
            self.connection.max_reconnect_attempts = attempts;
        }
        Ok(())
    }

    fn link_config(&self) -> LinkConfig {
        LinkConfig {
            base_url: self.connection.base_url.clone(),
            heartbeat_interval: Duration::from_secs(self.connection.heartbeat_interval_secs.max(1)),
            reconnect_base_delay: Duration::from_millis(self.connection.reconnect_base_delay_ms),
            max_reconnect_attempts: self.connection.max_reconnect_attempts,
            ..LinkConfig::default()
        }
    }

    fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_notifications: self.delivery.max_notifications.max(1),
            ..DeliveryConfig::default()
        }
    }

    fn desktop_settings(&self) -> DesktopSettings {
        DesktopSettings {
            app_name: self.push.app_name.clone(),
            expire_timeout_ms: self.push.expire_timeout_ms,
            foreground: self.push.foreground,
            bell: self.push.bell,
        }
    }

    fn preferences_path(&self) -> PathBuf {
        self.delivery
            .state_dir
            .clone()
            .unwrap_or_else(default_state_dir)
            .join("device.json")
    }
}

/// Reads the bearer token from `HERALD_TOKEN` every time one is needed.
struct EnvToken;

#[async_trait]
impl TokenProvider for EnvToken {
    async fn token(&self) -> Option<String> {
        normalize_token(env::var("HERALD_TOKEN").ok())
    }
}

fn normalize_token(raw: Option<String>) -> Option<String> {
    raw.map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn xdg_dir(var: &str, fallback: &[&str]) -> PathBuf {
    env::var_os(var)
        .map(PathBuf::from)
        .or_else(|| {
            env::var_os("HOME").map(|home| {
                let mut p = PathBuf::from(home);
                p.extend(fallback);
                p
            })
        })
        .unwrap_or_else(|| PathBuf::from("."))
}

fn config_path() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", &[".config"])
        .join("heraldd")
        .join("config.toml")
}

fn default_state_dir() -> PathBuf {
    xdg_dir("XDG_STATE_HOME", &[".local", "state"]).join("heraldd")
}

fn load_config() -> AppConfig {
    let path = config_path();
    let Ok(raw) = fs::read_to_string(&path) else {
        info!(path = %path.display(), "config not found, using defaults");
        return AppConfig::default();
    };

    match toml::from_str::<AppConfig>(&raw) {
        Ok(cfg) => {
            info!(path = %path.display(), "loaded config");
            cfg
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to parse config, using defaults");
            AppConfig::default()
        }
    }
}

fn log_event(event: DeliveryEvent) {
    match event {
        DeliveryEvent::ToastShown(item) => info!(
            id = %item.id,
            kind = item.kind.as_str(),
            title = %item.title,
            body = %item.body,
            "toast"
        ),
        DeliveryEvent::ToastHidden { id, reason } => debug!(%id, ?reason, "toast hidden"),
        DeliveryEvent::ListChanged { len, unread } => {
            info!(len, unread, "notification list updated")
        }
        DeliveryEvent::PushShown { id } => debug!(%id, "push raised"),
        DeliveryEvent::ConnectionChanged(connected) => {
            info!(connected, "notification connection changed")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("heraldd=info".parse()?))
        .init();

    let mut app_cfg = load_config();
    app_cfg.apply_env()?;

    let link = ConnectionManager::new(
        app_cfg.link_config(),
        Arc::new(EnvToken),
        Arc::new(TungsteniteDialer::default()),
    );
    let store_path = app_cfg.preferences_path();
    let store = Arc::new(FilePreferenceStore::new(&store_path));
    let platform = Arc::new(DesktopPlatform::connect(app_cfg.desktop_settings()).await);

    let (coordinator, mut events) =
        DeliveryCoordinator::new(app_cfg.delivery_config(), link, store, platform);

    info!(
        base_url = %app_cfg.connection.base_url,
        preferences = %store_path.display(),
        "starting heraldd"
    );

    if app_cfg.push.request_permission && !coordinator.preferences().await.push_enabled {
        let granted = coordinator.request_push_permission().await;
        info!(granted, "desktop push permission");
    }

    coordinator.start_session().await;

    let mut shutdown = Box::pin(signal::ctrl_c());
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("received Ctrl+C; exiting");
                break;
            }
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else {
                    warn!("delivery event stream ended");
                    break;
                };
                log_event(event);
            }
        }
    }

    coordinator.end_session().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();

        assert_eq!(cfg.connection.base_url, "http://localhost:8080");
        assert_eq!(cfg.connection.heartbeat_interval_secs, 30);
        assert_eq!(cfg.connection.reconnect_base_delay_ms, 1000);
        assert_eq!(cfg.connection.max_reconnect_attempts, 5);
        assert_eq!(cfg.delivery.max_notifications, MAX_NOTIFICATIONS);
        assert!(cfg.push.request_permission);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [connection]
            base_url = "https://api.example.com"
            max_reconnect_attempts = 8

            [push]
            foreground = true
            "#,
        )
        .unwrap();

        let link = cfg.link_config();
        assert_eq!(link.base_url, "https://api.example.com");
        assert_eq!(link.max_reconnect_attempts, 8);
        assert_eq!(link.heartbeat_interval, Duration::from_secs(30));
        assert!(cfg.desktop_settings().foreground);
        assert_eq!(cfg.push.app_name, "herald");
    }

    #[test]
    fn preferences_live_under_state_dir() {
        let cfg = AppConfig {
            delivery: DeliverySection {
                state_dir: Some(PathBuf::from("/var/lib/herald")),
                ..DeliverySection::default()
            },
            ..AppConfig::default()
        };

        assert_eq!(
            cfg.preferences_path(),
            PathBuf::from("/var/lib/herald/device.json")
        );
    }

    #[test]
    fn blank_token_counts_as_absent() {
        assert_eq!(normalize_token(None), None);
        assert_eq!(normalize_token(Some("   ".to_string())), None);
        assert_eq!(
            normalize_token(Some(" abc \n".to_string())),
            Some("abc".to_string())
        );
    }
}
