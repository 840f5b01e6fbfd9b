use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use herald_link::{ConnectionManager, Subscription};
use herald_types::{
    IncomingNotification, MAX_NOTIFICATIONS, NotificationItem, NotificationPreferences,
    PreferencesPatch, now_millis,
};
use thiserror::Error;
use tokio::{
    sync::{Mutex, RwLock, mpsc, mpsc::error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

mod store;

pub use store::{
    FilePreferenceStore, MemoryPreferenceStore, PREFERENCES_KEY, PreferenceStore, StoreError,
};

/// Configuration for [`DeliveryCoordinator`].
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Maximum number of notifications kept in memory.
    pub max_notifications: usize,
    /// Capacity of the presentation event channel.
    pub event_capacity: usize,
    /// Capacity of the per-session intake queue fed by the socket.
    pub intake_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_notifications: MAX_NOTIFICATIONS,
            event_capacity: 256,
            intake_capacity: 256,
        }
    }
}

/// Why a toast left the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastHideReason {
    /// The auto-hide timer fired.
    Expired,
    /// The user dismissed it.
    Dismissed,
    /// A newer notification took its slot.
    Replaced,
    /// The session ended.
    Cleared,
}

/// Presentation update emitted by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    /// The notification list changed.
    ListChanged {
        /// Number of notifications held.
        len: usize,
        /// Number of unread notifications.
        unread: usize,
    },
    /// A toast became visible.
    ToastShown(NotificationItem),
    /// The visible toast was hidden.
    ToastHidden {
        /// Id of the hidden notification.
        id: String,
        /// Why it was hidden.
        reason: ToastHideReason,
    },
    /// An OS-level push notification was raised.
    PushShown {
        /// Id of the pushed notification.
        id: String,
    },
    /// The socket connected or disconnected.
    ConnectionChanged(bool),
}

/// Errors reported by a [`Platform`] integration.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The platform has no such capability.
    #[error("not supported on this platform")]
    Unsupported,
    /// The platform call failed.
    #[error("platform call failed: {0}")]
    Failed(String),
}

/// Host capabilities used for OS push and sound.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Whether OS push notifications exist at all on this host.
    fn push_supported(&self) -> bool;

    /// Whether the user has already granted push permission.
    fn push_permission_granted(&self) -> bool;

    /// Prompts for push permission. Returns whether it was granted.
    async fn request_push_permission(&self) -> bool;

    /// Raises an OS-level notification for `item`.
    async fn show_push(&self, item: &NotificationItem) -> Result<(), PlatformError>;

    /// Plays the notification sound.
    async fn play_sound(&self) -> Result<(), PlatformError>;

    /// Whether the host is focused and visible to the user.
    fn is_foreground(&self) -> bool;
}

/// Platform without push or sound that always reports being in the foreground.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessPlatform;

#[async_trait]
impl Platform for HeadlessPlatform {
    fn push_supported(&self) -> bool {
        false
    }

    fn push_permission_granted(&self) -> bool {
        false
    }

    async fn request_push_permission(&self) -> bool {
        false
    }

    async fn show_push(&self, _item: &NotificationItem) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    async fn play_sound(&self) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported)
    }

    fn is_foreground(&self) -> bool {
        true
    }
}

/// Applies preferences to inbound notifications and keeps the in-memory history.
#[derive(Clone)]
pub struct DeliveryCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: DeliveryConfig,
    link: ConnectionManager,
    store: Arc<dyn PreferenceStore>,
    platform: Arc<dyn Platform>,
    sender: mpsc::Sender<DeliveryEvent>,
    state: RwLock<State>,
    session: Mutex<Option<Session>>,
}

struct State {
    notifications: VecDeque<NotificationItem>,
    preferences: NotificationPreferences,
    toast: Option<Toast>,
    toast_generation: u64,
}

impl State {
    fn unread(&self) -> usize {
        self.notifications.iter().filter(|item| !item.read).count()
    }

    fn list_changed(&self) -> DeliveryEvent {
        DeliveryEvent::ListChanged {
            len: self.notifications.len(),
            unread: self.unread(),
        }
    }

    fn take_toast(&mut self) -> Option<NotificationItem> {
        let toast = self.toast.take()?;
        if let Some(timer) = toast.timer {
            timer.abort();
        }
        Some(toast.item)
    }
}

struct Toast {
    item: NotificationItem,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Session {
    notifications: Subscription,
    connection: Subscription,
    intake: JoinHandle<()>,
}

impl DeliveryCoordinator {
    /// Creates a coordinator and returns it with its presentation event receiver.
    ///
    /// Preferences are loaded from `store` once, falling back to defaults.
    pub fn new(
        cfg: DeliveryConfig,
        link: ConnectionManager,
        store: Arc<dyn PreferenceStore>,
        platform: Arc<dyn Platform>,
    ) -> (Self, mpsc::Receiver<DeliveryEvent>) {
        let (sender, receiver) = mpsc::channel(cfg.event_capacity.max(1));
        let preferences = load_preferences(store.as_ref());

        let coordinator = Self {
            inner: Arc::new(Inner {
                cfg,
                link,
                store,
                platform,
                sender,
                state: RwLock::new(State {
                    notifications: VecDeque::new(),
                    preferences,
                    toast: None,
                    toast_generation: 0,
                }),
                session: Mutex::new(None),
            }),
        };

        (coordinator, receiver)
    }

    /// Subscribes to the connection and connects it.
    pub async fn start_session(&self) {
        let mut session = self.inner.session.lock().await;
        if session.is_none() {
            *session = Some(self.subscribe());
            info!("notification session started");
        } else {
            debug!("notification session already active");
        }
        drop(session);

        self.inner.link.connect().await;
    }

    /// Disconnects, unsubscribes, and discards every notification and the toast.
    pub async fn end_session(&self) {
        self.inner.link.disconnect().await;

        let session = self.inner.session.lock().await.take();
        if let Some(session) = session {
            session.notifications.unsubscribe();
            session.connection.unsubscribe();
            session.intake.abort();
            if let Err(err) = session.intake.await
                && !err.is_cancelled()
            {
                warn!(%err, "notification intake task failed");
            }
        }

        let mut state = self.inner.state.write().await;
        state.notifications.clear();
        let hidden = state.take_toast();
        let changed = state.list_changed();
        drop(state);

        self.send_event(changed);
        if let Some(item) = hidden {
            self.send_event(DeliveryEvent::ToastHidden {
                id: item.id,
                reason: ToastHideReason::Cleared,
            });
        }
        info!("notification session ended");
    }

    fn subscribe(&self) -> Session {
        let (intake_tx, mut intake_rx) =
            mpsc::channel::<IncomingNotification>(self.inner.cfg.intake_capacity.max(1));

        let notifications = self.inner.link.on_notification(move |incoming| {
            match intake_tx.try_send(incoming.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => {
                    warn!(id = %dropped.id, "intake queue full; dropping notification");
                }
                Err(TrySendError::Closed(_)) => debug!("intake queue closed"),
            }
        });

        let sender = self.inner.sender.clone();
        let connection = self.inner.link.on_connection_change(move |connected| {
            if let Err(TrySendError::Full(_)) =
                sender.try_send(DeliveryEvent::ConnectionChanged(*connected))
            {
                warn!("event queue full; dropping connection event");
            }
        });

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let intake = tokio::spawn(async move {
            while let Some(incoming) = intake_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                DeliveryCoordinator { inner }.deliver(incoming).await;
            }
        });

        Session {
            notifications,
            connection,
            intake,
        }
    }

    /// Runs one notification through preference filtering and fan-out.
    pub async fn deliver(&self, incoming: IncomingNotification) {
        let item = NotificationItem::from_incoming(incoming, now_millis());

        let mut state = self.inner.state.write().await;
        let preferences = state.preferences.clone();
        if !preferences.is_type_enabled(item.kind) {
            debug!(id = %item.id, kind = item.kind.as_str(), "notification filtered by preferences");
            return;
        }

        state.notifications.push_front(item.clone());
        state.notifications.truncate(self.inner.cfg.max_notifications);
        let changed = state.list_changed();

        let show_toast = preferences.toasts_enabled();
        let replaced = if show_toast {
            let hide_after = Duration::from_millis(preferences.auto_hide_duration);
            self.show_toast(&mut state, item.clone(), hide_after)
        } else {
            None
        };
        drop(state);

        debug!(id = %item.id, kind = item.kind.as_str(), "notification accepted");
        self.send_event(changed);
        if let Some(previous) = replaced {
            self.send_event(DeliveryEvent::ToastHidden {
                id: previous.id,
                reason: ToastHideReason::Replaced,
            });
        }

        if show_toast {
            self.send_event(DeliveryEvent::ToastShown(item.clone()));
            if preferences.sound
                && let Err(err) = self.inner.platform.play_sound().await
            {
                debug!(%err, "notification sound not played");
            }
        }

        let platform = &self.inner.platform;
        if preferences.push_allowed()
            && platform.push_permission_granted()
            && !platform.is_foreground()
        {
            match platform.show_push(&item).await {
                Ok(()) => self.send_event(DeliveryEvent::PushShown { id: item.id }),
                Err(err) => warn!(id = %item.id, %err, "failed to show push notification"),
            }
        }
    }

    fn show_toast(
        &self,
        state: &mut State,
        item: NotificationItem,
        hide_after: Duration,
    ) -> Option<NotificationItem> {
        let previous = state.take_toast();

        state.toast_generation = state.toast_generation.wrapping_add(1);
        let generation = state.toast_generation;

        let timer = (!hide_after.is_zero()).then(|| {
            let coordinator = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(hide_after).await;
                coordinator.expire_toast(generation).await;
            })
        });

        state.toast = Some(Toast {
            item,
            generation,
            timer,
        });
        previous
    }

    async fn expire_toast(&self, generation: u64) {
        let mut state = self.inner.state.write().await;
        let is_current = state
            .toast
            .as_ref()
            .is_some_and(|toast| toast.generation == generation);
        if !is_current {
            return;
        }

        let expired = state.toast.take();
        drop(state);

        if let Some(toast) = expired {
            self.send_event(DeliveryEvent::ToastHidden {
                id: toast.item.id,
                reason: ToastHideReason::Expired,
            });
        }
    }

    /// Hides the current toast immediately.
    pub async fn dismiss_toast(&self) {
        let dismissed = self.inner.state.write().await.take_toast();
        if let Some(item) = dismissed {
            self.send_event(DeliveryEvent::ToastHidden {
                id: item.id,
                reason: ToastHideReason::Dismissed,
            });
        }
    }

    /// Marks one notification read. Unknown or already-read ids are ignored.
    pub async fn mark_as_read(&self, id: &str) {
        let mut state = self.inner.state.write().await;
        let Some(item) = state
            .notifications
            .iter_mut()
            .find(|item| item.id == id && !item.read)
        else {
            return;
        };
        item.read = true;
        let changed = state.list_changed();
        drop(state);

        self.send_event(changed);
    }

    /// Marks every notification read.
    pub async fn mark_all_as_read(&self) {
        let mut state = self.inner.state.write().await;
        let mut touched = false;
        for item in state.notifications.iter_mut().filter(|item| !item.read) {
            item.read = true;
            touched = true;
        }
        if !touched {
            return;
        }
        let changed = state.list_changed();
        drop(state);

        self.send_event(changed);
    }

    /// Removes one notification. Unknown ids are ignored.
    pub async fn remove_notification(&self, id: &str) {
        let mut state = self.inner.state.write().await;
        let before = state.notifications.len();
        state.notifications.retain(|item| item.id != id);
        if state.notifications.len() == before {
            return;
        }
        let changed = state.list_changed();
        drop(state);

        self.send_event(changed);
    }

    /// Removes every notification.
    pub async fn clear_all(&self) {
        let mut state = self.inner.state.write().await;
        if state.notifications.is_empty() {
            return;
        }
        state.notifications.clear();
        let changed = state.list_changed();
        drop(state);

        self.send_event(changed);
    }

    /// Merges `patch` into the preferences and persists the result.
    ///
    /// Only notifications arriving afterwards are affected.
    pub async fn update_preferences(&self, patch: PreferencesPatch) -> NotificationPreferences {
        let mut state = self.inner.state.write().await;
        state.preferences.apply(&patch);
        let preferences = state.preferences.clone();
        drop(state);

        self.persist(&preferences);
        preferences
    }

    /// Asks the platform for push permission, enabling push on grant.
    pub async fn request_push_permission(&self) -> bool {
        let platform = &self.inner.platform;
        if !platform.push_supported() {
            info!("push notifications unsupported on this platform");
            return false;
        }

        let granted = platform.request_push_permission().await;
        if granted {
            self.update_preferences(PreferencesPatch {
                push_enabled: Some(true),
                ..PreferencesPatch::default()
            })
            .await;
            info!("push permission granted");
        } else {
            info!("push permission denied");
        }
        granted
    }

    /// Snapshot of the notification list, newest first.
    pub async fn notifications(&self) -> Vec<NotificationItem> {
        self.inner
            .state
            .read()
            .await
            .notifications
            .iter()
            .cloned()
            .collect()
    }

    /// Number of unread notifications.
    pub async fn unread_count(&self) -> usize {
        self.inner.state.read().await.unread()
    }

    /// The notification currently shown as a toast, if any.
    pub async fn current_toast(&self) -> Option<NotificationItem> {
        self.inner
            .state
            .read()
            .await
            .toast
            .as_ref()
            .map(|toast| toast.item.clone())
    }

    /// Current preferences.
    pub async fn preferences(&self) -> NotificationPreferences {
        self.inner.state.read().await.preferences.clone()
    }

    /// Whether the notification socket is open.
    pub fn is_connected(&self) -> bool {
        self.inner.link.is_connected()
    }

    fn persist(&self, preferences: &NotificationPreferences) {
        let value = match serde_json::to_value(preferences) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "failed to serialize notification preferences");
                return;
            }
        };
        if let Err(err) = self.inner.store.save(&value) {
            warn!(%err, "failed to persist notification preferences");
        }
    }

    fn send_event(&self, event: DeliveryEvent) {
        debug!(?event, "sending delivery event");
        match self.inner.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("event queue full; dropping delivery event"),
            Err(TrySendError::Closed(_)) => debug!("delivery event receiver dropped"),
        }
    }
}

impl std::fmt::Debug for DeliveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryCoordinator")
            .field("link", &self.inner.link)
            .field("cfg", &self.inner.cfg)
            .finish_non_exhaustive()
    }
}

fn load_preferences(store: &dyn PreferenceStore) -> NotificationPreferences {
    match store.load() {
        Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|err| {
            warn!(%err, "stored notification preferences unreadable; using defaults");
            NotificationPreferences::default()
        }),
        Ok(None) => NotificationPreferences::default(),
        Err(err) => {
            warn!(%err, "failed to load notification preferences; using defaults");
            NotificationPreferences::default()
        }
    }
}
