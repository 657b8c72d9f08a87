pub mod api;
pub mod events;
pub mod ids;
pub mod models;
pub mod payload;

pub use ids::{ClientTempId, ConnId, MessageId, RoomId, RoomRole, UserId};
pub use models::{Message, ReactionGroup};
pub use payload::{MediaKind, MessagePayload};
