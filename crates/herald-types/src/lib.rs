use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Upper bound on the number of notifications kept in memory.
pub const MAX_NOTIFICATIONS: usize = 100;

/// Default toast visibility in milliseconds.
pub const DEFAULT_AUTO_HIDE_MS: u64 = 5_000;

/// Notification category as sent by the notification service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    /// Card or wallet transaction activity.
    Transaction,
    /// Login, password and device security events.
    Security,
    /// Crypto wallet and top-up events.
    Wallet,
    /// Service-wide announcements.
    System,
    /// Promotional content.
    Marketing,
    /// Identity verification progress.
    Kyc,
    /// Virtual card lifecycle events.
    Card,
    /// Bill payments and other utilities.
    Utility,
}

impl NotificationType {
    /// Every category, in wire order.
    pub const ALL: [NotificationType; 8] = [
        NotificationType::Transaction,
        NotificationType::Security,
        NotificationType::Wallet,
        NotificationType::System,
        NotificationType::Marketing,
        NotificationType::Kyc,
        NotificationType::Card,
        NotificationType::Utility,
    ];

    /// Wire name of the category.
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationType::Transaction => "transaction",
            NotificationType::Security => "security",
            NotificationType::Wallet => "wallet",
            NotificationType::System => "system",
            NotificationType::Marketing => "marketing",
            NotificationType::Kyc => "kyc",
            NotificationType::Card => "card",
            NotificationType::Utility => "utility",
        }
    }
}

/// Notification payload as received from the server, before it is accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncomingNotification {
    /// Server-assigned identifier.
    pub id: String,
    /// Notification category.
    #[serde(rename = "type")]
    pub kind: NotificationType,
    /// Short headline.
    pub title: String,
    /// Body text.
    #[serde(alias = "message")]
    pub body: String,
    /// Server timestamp in epoch milliseconds, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Opaque metadata (deep links, amounts) passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A delivered notification held in the in-memory list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationItem {
    /// Server-assigned identifier.
    pub id: String,
    /// Notification category.
    #[serde(rename = "type")]
    pub kind: NotificationType,
    /// Short headline.
    pub title: String,
    /// Body text.
    pub body: String,
    /// Epoch milliseconds, server-provided or assigned at receipt.
    pub timestamp: i64,
    /// Whether the user has seen this notification.
    pub read: bool,
    /// Opaque metadata passed through from the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl NotificationItem {
    /// Accepts an incoming payload as an unread item received at `received_at_ms`.
    pub fn from_incoming(incoming: IncomingNotification, received_at_ms: i64) -> Self {
        Self {
            id: incoming.id,
            kind: incoming.kind,
            title: incoming.title,
            body: incoming.body,
            timestamp: incoming.timestamp.unwrap_or(received_at_ms),
            read: false,
            data: incoming.data,
        }
    }
}

/// Per-device notification preferences.
///
/// Every key absent from stored JSON takes its default, so a partially
/// written or older document still loads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationPreferences {
    /// Master switch for every channel and category.
    pub enabled: bool,
    /// Show in-app toasts.
    pub in_app_enabled: bool,
    /// Show OS-level push notifications.
    pub push_enabled: bool,
    /// Play a sound with each toast.
    pub sound: bool,
    pub transaction_alerts: bool,
    pub security_alerts: bool,
    pub wallet_alerts: bool,
    pub system_alerts: bool,
    pub marketing_alerts: bool,
    pub kyc_alerts: bool,
    pub card_alerts: bool,
    pub utility_alerts: bool,
    /// Toast visibility in milliseconds. `0` keeps the toast until it is
    /// dismissed or replaced.
    pub auto_hide_duration: u64,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            in_app_enabled: true,
            push_enabled: false,
            sound: true,
            transaction_alerts: true,
            security_alerts: true,
            wallet_alerts: true,
            system_alerts: true,
            marketing_alerts: true,
            kyc_alerts: true,
            card_alerts: true,
            utility_alerts: true,
            auto_hide_duration: DEFAULT_AUTO_HIDE_MS,
        }
    }
}

impl NotificationPreferences {
    /// Returns the category switch for `kind`.
    pub fn category_switch(&self, kind: NotificationType) -> bool {
        match kind {
            NotificationType::Transaction => self.transaction_alerts,
            NotificationType::Security => self.security_alerts,
            NotificationType::Wallet => self.wallet_alerts,
            NotificationType::System => self.system_alerts,
            NotificationType::Marketing => self.marketing_alerts,
            NotificationType::Kyc => self.kyc_alerts,
            NotificationType::Card => self.card_alerts,
            NotificationType::Utility => self.utility_alerts,
        }
    }

    /// Whether events of `kind` are delivered at all.
    pub fn is_type_enabled(&self, kind: NotificationType) -> bool {
        self.enabled && self.category_switch(kind)
    }

    /// Whether accepted events raise an in-app toast.
    pub fn toasts_enabled(&self) -> bool {
        self.enabled && self.in_app_enabled
    }

    /// Whether accepted events may raise an OS push notification.
    pub fn push_allowed(&self) -> bool {
        self.enabled && self.push_enabled
    }

    /// Merges every field present in `patch`.
    pub fn apply(&mut self, patch: &PreferencesPatch) {
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = patch.$field {
                    self.$field = value;
                })*
            };
        }

        merge!(
            enabled,
            in_app_enabled,
            push_enabled,
            sound,
            transaction_alerts,
            security_alerts,
            wallet_alerts,
            system_alerts,
            marketing_alerts,
            kyc_alerts,
            card_alerts,
            utility_alerts,
            auto_hide_duration,
        );
    }
}

/// Partial preference update; `None` leaves the current value untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PreferencesPatch {
    pub enabled: Option<bool>,
    pub in_app_enabled: Option<bool>,
    pub push_enabled: Option<bool>,
    pub sound: Option<bool>,
    pub transaction_alerts: Option<bool>,
    pub security_alerts: Option<bool>,
    pub wallet_alerts: Option<bool>,
    pub system_alerts: Option<bool>,
    pub marketing_alerts: Option<bool>,
    pub kyc_alerts: Option<bool>,
    pub card_alerts: Option<bool>,
    pub utility_alerts: Option<bool>,
    pub auto_hide_duration: Option<u64>,
}

impl PreferencesPatch {
    /// Patch that toggles a single category switch.
    pub fn category(kind: NotificationType, on: bool) -> Self {
        let mut patch = Self::default();
        let slot = match kind {
            NotificationType::Transaction => &mut patch.transaction_alerts,
            NotificationType::Security => &mut patch.security_alerts,
            NotificationType::Wallet => &mut patch.wallet_alerts,
            NotificationType::System => &mut patch.system_alerts,
            NotificationType::Marketing => &mut patch.marketing_alerts,
            NotificationType::Kyc => &mut patch.kyc_alerts,
            NotificationType::Card => &mut patch.card_alerts,
            NotificationType::Utility => &mut patch.utility_alerts,
        };
        *slot = Some(on);
        patch
    }
}

/// Lifecycle state of the notification socket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket and no pending reconnect.
    #[default]
    Disconnected,
    /// Resolving a token or completing the handshake.
    Connecting,
    /// Socket open.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    ReconnectScheduled,
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_preference_keys_take_defaults() {
        let prefs: NotificationPreferences =
            serde_json::from_str(r#"{"securityAlerts":false,"autoHideDuration":1500}"#).unwrap();

        assert!(prefs.enabled);
        assert!(prefs.in_app_enabled);
        assert!(!prefs.push_enabled);
        assert!(!prefs.security_alerts);
        assert!(prefs.kyc_alerts);
        assert_eq!(prefs.auto_hide_duration, 1500);
    }

    #[test]
    fn global_switch_gates_every_category() {
        let prefs = NotificationPreferences {
            enabled: false,
            ..NotificationPreferences::default()
        };

        for kind in NotificationType::ALL {
            assert!(!prefs.is_type_enabled(kind), "{} still enabled", kind.as_str());
        }
    }

    #[test]
    fn patch_only_touches_present_fields() {
        let mut prefs = NotificationPreferences::default();
        let patch: PreferencesPatch =
            serde_json::from_str(r#"{"sound":false,"walletAlerts":false}"#).unwrap();

        prefs.apply(&patch);

        assert!(!prefs.sound);
        assert!(!prefs.wallet_alerts);
        assert!(prefs.in_app_enabled);
        assert_eq!(prefs.auto_hide_duration, DEFAULT_AUTO_HIDE_MS);
    }

    #[test]
    fn category_patch_targets_matching_switch() {
        let mut prefs = NotificationPreferences::default();
        prefs.apply(&PreferencesPatch::category(NotificationType::Kyc, false));

        assert!(!prefs.is_type_enabled(NotificationType::Kyc));
        assert!(prefs.is_type_enabled(NotificationType::Card));
    }

    #[test]
    fn incoming_without_timestamp_uses_receipt_time() {
        let incoming: IncomingNotification = serde_json::from_str(
            r#"{"id":"n1","type":"card","title":"Card frozen","message":"Your card was frozen","read":true}"#,
        )
        .unwrap();

        let item = NotificationItem::from_incoming(incoming, 42);
        assert_eq!(item.timestamp, 42);
        assert_eq!(item.body, "Your card was frozen");
        assert!(!item.read);
    }
}
