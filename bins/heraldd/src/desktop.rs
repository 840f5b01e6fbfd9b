use std::{
    collections::HashMap,
    io::Write,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use herald_delivery::{Platform, PlatformError};
use herald_types::{NotificationItem, NotificationType};
use tracing::{info, warn};
use zbus::zvariant;

const DBUS_NAME: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";
const NOTIFY_NAME: &str = "org.freedesktop.Notifications";
const NOTIFY_PATH: &str = "/org/freedesktop/Notifications";

/// Settings for desktop push delivery.
#[derive(Debug, Clone)]
pub struct DesktopSettings {
    pub app_name: String,
    pub expire_timeout_ms: i32,
    pub foreground: bool,
    pub bell: bool,
}

/// Raises OS notifications through the freedesktop notification service.
///
/// Push permission is granted while a notification service owns its bus name.
/// The bus is queried once at connect and again on every permission request.
#[derive(Debug)]
pub struct DesktopPlatform {
    connection: Option<zbus::Connection>,
    settings: DesktopSettings,
    granted: AtomicBool,
}

impl DesktopPlatform {
    pub async fn connect(settings: DesktopSettings) -> Self {
        let connection = match zbus::Connection::session().await {
            Ok(connection) => Some(connection),
            Err(err) => {
                warn!(%err, "session bus unavailable; desktop push disabled");
                None
            }
        };

        let granted = match &connection {
            Some(conn) => permission_from(notification_service_present(conn).await),
            None => false,
        };

        Self {
            connection,
            settings,
            granted: AtomicBool::new(granted),
        }
    }
}

fn permission_from(present: zbus::Result<bool>) -> bool {
    match present {
        Ok(true) => true,
        Ok(false) => {
            info!("no notification service on the session bus");
            false
        }
        Err(err) => {
            warn!(%err, "failed to query notification service");
            false
        }
    }
}

async fn notification_service_present(conn: &zbus::Connection) -> zbus::Result<bool> {
    let reply = conn
        .call_method(
            Some(DBUS_NAME),
            DBUS_PATH,
            Some(DBUS_NAME),
            "NameHasOwner",
            &(NOTIFY_NAME,),
        )
        .await?;
    reply.body().deserialize::<bool>()
}

fn urgency_for(kind: NotificationType) -> u8 {
    match kind {
        NotificationType::Security => 2,
        NotificationType::Marketing => 0,
        _ => 1,
    }
}

fn push_hints(item: &NotificationItem) -> HashMap<String, zvariant::OwnedValue> {
    let mut hints = HashMap::new();
    hints.insert(
        "urgency".to_string(),
        zvariant::OwnedValue::from(urgency_for(item.kind)),
    );
    hints.insert(
        "category".to_string(),
        zvariant::OwnedValue::from(zvariant::Str::from(format!(
            "x-herald.{}",
            item.kind.as_str()
        ))),
    );
    hints
}

#[async_trait]
impl Platform for DesktopPlatform {
    fn push_supported(&self) -> bool {
        self.connection.is_some()
    }

    fn push_permission_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    async fn request_push_permission(&self) -> bool {
        let Some(conn) = &self.connection else {
            return false;
        };

        let granted = permission_from(notification_service_present(conn).await);
        self.granted.store(granted, Ordering::SeqCst);
        granted
    }

    async fn show_push(&self, item: &NotificationItem) -> Result<(), PlatformError> {
        let Some(conn) = &self.connection else {
            return Err(PlatformError::Unsupported);
        };

        let reply = conn
            .call_method(
                Some(NOTIFY_NAME),
                NOTIFY_PATH,
                Some(NOTIFY_NAME),
                "Notify",
                &(
                    self.settings.app_name.as_str(),
                    0_u32,
                    "",
                    item.title.as_str(),
                    item.body.as_str(),
                    Vec::<String>::new(),
                    push_hints(item),
                    self.settings.expire_timeout_ms,
                ),
            )
            .await
            .map_err(|err| PlatformError::Failed(err.to_string()))?;

        let server_id: u32 = reply
            .body()
            .deserialize()
            .map_err(|err| PlatformError::Failed(err.to_string()))?;
        info!(id = %item.id, server_id, "desktop notification shown");
        Ok(())
    }

    async fn play_sound(&self) -> Result<(), PlatformError> {
        if !self.settings.bell {
            return Err(PlatformError::Unsupported);
        }

        let mut stderr = std::io::stderr();
        stderr
            .write_all(b"\x07")
            .and_then(|()| stderr.flush())
            .map_err(|err| PlatformError::Failed(err.to_string()))
    }

    fn is_foreground(&self) -> bool {
        self.settings.foreground
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(kind: NotificationType) -> NotificationItem {
        NotificationItem {
            id: "n1".to_string(),
            kind,
            title: "Login from new device".to_string(),
            body: "Chrome on Linux".to_string(),
            timestamp: 1,
            read: false,
            data: None,
        }
    }

    #[test]
    fn permission_follows_service_presence() {
        assert!(permission_from(Ok(true)));
        assert!(!permission_from(Ok(false)));
        assert!(!permission_from(Err(zbus::Error::Failure(
            "bus unreachable".to_string()
        ))));
    }

    #[test]
    fn security_notifications_are_critical() {
        assert_eq!(urgency_for(NotificationType::Security), 2);
        assert_eq!(urgency_for(NotificationType::Marketing), 0);
        assert_eq!(urgency_for(NotificationType::Wallet), 1);
    }

    #[test]
    fn hints_carry_urgency_and_category() {
        let hints = push_hints(&item(NotificationType::Security));

        let urgency = hints.get("urgency").and_then(|raw| u8::try_from(raw).ok());
        assert_eq!(urgency, Some(2));
        let category = hints
            .get("category")
            .and_then(|raw| <&str>::try_from(raw).ok());
        assert_eq!(category, Some("x-herald.security"));
    }
}
