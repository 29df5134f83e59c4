//! Tabsplit core crate - domain records, errors, configuration and events.
//!
//! Shared by the storage engine and its consumers. Nothing in here touches
//! the database.

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::TabsplitConfig;
pub use error::{Result, TabsplitError};
pub use events::{EventBus, EventKind, ListenerId, StorageEvent};
pub use types::*;
