//! Real-time status streaming and operator notifications.
//!
//! Every job and document transition is published as a full snapshot on a
//! tokio broadcast channel. Clients that miss events poll
//! [`ProgressBroadcaster::query_status`], which returns the same shape.

pub mod notifications;
pub mod progress;
pub mod snapshot;

pub use notifications::{NotificationKind, Notifier, OperatorNotification};
pub use progress::{ProgressBroadcaster, Subscription};
pub use snapshot::{DocumentSnapshot, JobSnapshot, StatusEvent, StatusFilter};
