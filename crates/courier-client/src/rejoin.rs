use std::collections::HashSet;
use std::sync::Mutex;

use courier_types::RoomId;

/// The rooms this client intends to be joined to, independent of any live
/// connection. The session replays `Join` for each on every (re)connect;
/// server-side joins are idempotent so replays are harmless.
#[derive(Default)]
pub struct RejoinSet {
    rooms: Mutex<HashSet<RoomId>>,
}

impl RejoinSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the room was already intended.
    pub fn intend_join(&self, room_id: RoomId) -> bool {
        self.rooms.lock().map(|mut r| r.insert(room_id)).unwrap_or(false)
    }

    pub fn intend_leave(&self, room_id: RoomId) -> bool {
        self.rooms.lock().map(|mut r| r.remove(&room_id)).unwrap_or(false)
    }

    pub fn rooms(&self) -> Vec<RoomId> {
        self.rooms
            .lock()
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default()
    }
}
