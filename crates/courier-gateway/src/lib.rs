pub mod connection;
pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod registry;
pub mod rooms;
pub mod storage;

pub use error::GatewayError;
pub use gateway::Gateway;
pub use pipeline::SendOutcome;
pub use registry::ConnectionRegistry;
pub use rooms::RoomTracker;
pub use storage::{Storage, StoreOutcome, group_reactions};

mod mutations;
