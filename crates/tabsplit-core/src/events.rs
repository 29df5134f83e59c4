use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::types::RecordId;

/// Kinds of notifications consumers can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CalculationCreated,
    CalculationUpdated,
    CalculationDeleted,
    TemplateCreated,
    TemplateUpdated,
    TemplateDeleted,
    SettingsUpdated,
    StorageQuotaWarning,
    StorageCleanup,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::CalculationCreated,
        EventKind::CalculationUpdated,
        EventKind::CalculationDeleted,
        EventKind::TemplateCreated,
        EventKind::TemplateUpdated,
        EventKind::TemplateDeleted,
        EventKind::SettingsUpdated,
        EventKind::StorageQuotaWarning,
        EventKind::StorageCleanup,
    ];

    /// Wire name used by UI bindings.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CalculationCreated => "calculation_created",
            EventKind::CalculationUpdated => "calculation_updated",
            EventKind::CalculationDeleted => "calculation_deleted",
            EventKind::TemplateCreated => "template_created",
            EventKind::TemplateUpdated => "template_updated",
            EventKind::TemplateDeleted => "template_deleted",
            EventKind::SettingsUpdated => "settings_updated",
            EventKind::StorageQuotaWarning => "storage_quota_warning",
            EventKind::StorageCleanup => "storage_cleanup",
        }
    }
}

/// Notifications emitted by the store after a transaction commits.
///
/// Events are consumed by:
/// - Registered per-kind listeners (UI list refresh, badges)
/// - The broadcast channel (async consumers such as a sync indicator)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum StorageEvent {
    CalculationCreated {
        id: RecordId,
        name: String,
        image_count: usize,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },

    CalculationUpdated {
        id: RecordId,
        version: u32,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },

    CalculationDeleted {
        id: RecordId,
        images_removed: usize,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },

    TemplateCreated {
        id: RecordId,
        name: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },

    TemplateUpdated {
        id: RecordId,
        usage_count: u64,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },

    TemplateDeleted {
        id: RecordId,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },

    SettingsUpdated {
        version: u32,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },

    /// The store hit, or is close to, its configured size limit.
    StorageQuotaWarning {
        used_bytes: u64,
        quota_bytes: Option<u64>,
        message: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },

    /// A cleanup run finished.
    StorageCleanup {
        calculations_removed: usize,
        images_removed: usize,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
}

impl StorageEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StorageEvent::CalculationCreated { .. } => EventKind::CalculationCreated,
            StorageEvent::CalculationUpdated { .. } => EventKind::CalculationUpdated,
            StorageEvent::CalculationDeleted { .. } => EventKind::CalculationDeleted,
            StorageEvent::TemplateCreated { .. } => EventKind::TemplateCreated,
            StorageEvent::TemplateUpdated { .. } => EventKind::TemplateUpdated,
            StorageEvent::TemplateDeleted { .. } => EventKind::TemplateDeleted,
            StorageEvent::SettingsUpdated { .. } => EventKind::SettingsUpdated,
            StorageEvent::StorageQuotaWarning { .. } => EventKind::StorageQuotaWarning,
            StorageEvent::StorageCleanup { .. } => EventKind::StorageCleanup,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StorageEvent::CalculationCreated { timestamp, .. }
            | StorageEvent::CalculationUpdated { timestamp, .. }
            | StorageEvent::CalculationDeleted { timestamp, .. }
            | StorageEvent::TemplateCreated { timestamp, .. }
            | StorageEvent::TemplateUpdated { timestamp, .. }
            | StorageEvent::TemplateDeleted { timestamp, .. }
            | StorageEvent::SettingsUpdated { timestamp, .. }
            | StorageEvent::StorageQuotaWarning { timestamp, .. }
            | StorageEvent::StorageCleanup { timestamp, .. } => *timestamp,
        }
    }

    /// Human-readable event name for logging.
    pub fn event_name(&self) -> &'static str {
        self.kind().as_str()
    }
}

/// Callback registered for one event kind.
pub type Listener = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

/// Handle returned by `EventBus::subscribe`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// In-process fan-out of storage events.
///
/// Listeners run synchronously on the emitting task, after the registry lock
/// is released, so a listener may subscribe or unsubscribe. A panicking
/// listener is logged and does not affect other listeners or the caller.
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
    next_id: AtomicU64,
    channel: broadcast::Sender<StorageEvent>,
}

impl EventBus {
    pub fn new(channel_capacity: usize) -> Self {
        let (channel, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            channel,
        }
    }

    /// Register a listener for one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&StorageEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered for `kind`.
    pub fn unsubscribe(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        match listeners.get_mut(&kind) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|(existing, _)| *existing != id);
                entries.len() != before
            }
            None => false,
        }
    }

    /// Receive every event through a broadcast channel.
    pub fn subscribe_all(&self) -> broadcast::Receiver<StorageEvent> {
        self.channel.subscribe()
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        let listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
        listeners.get(&kind).map_or(0, Vec::len)
    }

    /// Deliver an event to listeners of its kind and to the broadcast channel.
    pub fn emit(&self, event: StorageEvent) {
        let kind = event.kind();
        let targets: Vec<Listener> = {
            let listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner());
            listeners
                .get(&kind)
                .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };

        debug!(event = event.event_name(), listeners = targets.len(), "Emitting event");

        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!(event = event.event_name(), "Event listener panicked");
            }
        }

        // No receivers is not an error.
        let _ = self.channel.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn deleted_event() -> StorageEvent {
        StorageEvent::CalculationDeleted {
            id: "calc-1".to_string(),
            images_removed: 2,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_event_kind_names_are_unique() {
        let mut names: Vec<&str> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), EventKind::ALL.len());
    }

    #[test]
    fn test_event_kind_matches_serde_name() {
        for kind in EventKind::ALL {
            let value = serde_json::to_value(kind).unwrap();
            assert_eq!(value, serde_json::json!(kind.as_str()));
        }
    }

    #[test]
    fn test_event_serialization_tagged() {
        let event = deleted_event();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "calculation_deleted");
        assert_eq!(value["images_removed"], 2);

        let back: StorageEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind(), EventKind::CalculationDeleted);
    }

    #[test]
    fn test_subscribe_receives_only_matching_kind() {
        let bus = EventBus::default();
        let deleted = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));

        let d = Arc::clone(&deleted);
        bus.subscribe(EventKind::CalculationDeleted, move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        });
        let c = Arc::clone(&created);
        bus.subscribe(EventKind::CalculationCreated, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(deleted_event());
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = bus.subscribe(EventKind::CalculationDeleted, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.unsubscribe(EventKind::CalculationDeleted, id));
        assert!(!bus.unsubscribe(EventKind::CalculationDeleted, id));
        bus.emit(deleted_event());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(EventKind::CalculationDeleted), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::CalculationDeleted, |_| panic!("listener bug"));
        let h = Arc::clone(&hits);
        bus.subscribe(EventKind::CalculationDeleted, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(deleted_event());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_broadcast_channel_delivers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe_all();
        bus.emit(deleted_event());
        let received = rx.try_recv().unwrap();
        assert_eq!(received.kind(), EventKind::CalculationDeleted);
    }
}
