//! Client-side half of the messaging subsystem: a supervised connection with
//! automatic reconnect, join replay, a durable outbox for offline sends, and
//! a pure reconciliation reducer for optimistic timelines.

pub mod backoff;
pub mod error;
pub mod events;
pub mod outbox;
pub mod reconcile;
pub mod rejoin;
pub mod session;
pub mod store;
pub mod transport;

pub use error::ClientError;
pub use events::{ClientEvent, EventSubscription};
pub use outbox::{FallbackSender, HttpFallback, Outbox, PendingSend};
pub use reconcile::{RoomTimeline, TimelineRow};
pub use session::{ClientHandle, start};
pub use store::{FileStore, LocalStore, MemoryStore};
pub use transport::{Connector, Transport, WsConnector};
