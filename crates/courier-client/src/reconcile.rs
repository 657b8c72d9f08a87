use chrono::{DateTime, Utc};
use courier_types::events::GatewayEvent;
use courier_types::{ClientTempId, Message, MessageId, MessagePayload};

/// One visible timeline entry: either a locally echoed send awaiting its
/// durable record, or the server's copy.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineRow {
    Optimistic {
        client_temp_id: ClientTempId,
        payload: MessagePayload,
        queued_at: DateTime<Utc>,
    },
    Confirmed(Message),
}

impl TimelineRow {
    fn temp_id(&self) -> Option<&ClientTempId> {
        match self {
            TimelineRow::Optimistic { client_temp_id, .. } => Some(client_temp_id),
            TimelineRow::Confirmed(m) => m.client_temp_id.as_ref(),
        }
    }
}

/// Pure reducer for one room's message list. Optimistic rows are keyed by
/// temp id; server events (broadcast echo, save failure) may arrive in any
/// order and the timeline converges to exactly one row per message.
#[derive(Debug, Default)]
pub struct RoomTimeline {
    rows: Vec<TimelineRow>,
}

impl RoomTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> &[TimelineRow] {
        &self.rows
    }

    /// Show a just-sent message immediately. No-op if a row (optimistic or
    /// already-confirmed) with this temp id exists, so a late local echo
    /// after the server broadcast cannot duplicate.
    pub fn add_optimistic(&mut self, client_temp_id: ClientTempId, payload: MessagePayload) {
        if self.rows.iter().any(|r| r.temp_id() == Some(&client_temp_id)) {
            return;
        }
        self.rows.push(TimelineRow::Optimistic {
            client_temp_id,
            payload,
            queued_at: Utc::now(),
        });
    }

    pub fn apply(&mut self, event: &GatewayEvent) {
        match event {
            GatewayEvent::MessageCreate { message } => self.upsert(message),
            GatewayEvent::MessageSaveFailed { client_temp_id } => {
                self.rows.retain(|r| {
                    !matches!(r, TimelineRow::Optimistic { client_temp_id: t, .. } if t == client_temp_id)
                });
            }
            GatewayEvent::PinChanged { message_id, pinned, .. } => {
                if let Some(TimelineRow::Confirmed(m)) = self.row_by_id_mut(*message_id) {
                    m.pinned = *pinned;
                }
            }
            _ => {}
        }
    }

    /// The server's copy replaces an optimistic row in place (keeping its
    /// position), updates an existing confirmed row, or appends.
    fn upsert(&mut self, message: &Message) {
        if let Some(row) = self.row_by_id_mut(message.id) {
            *row = TimelineRow::Confirmed(message.clone());
            return;
        }

        if let Some(temp_id) = &message.client_temp_id {
            if let Some(row) = self
                .rows
                .iter_mut()
                .find(|r| matches!(r, TimelineRow::Optimistic { client_temp_id, .. } if client_temp_id == temp_id))
            {
                *row = TimelineRow::Confirmed(message.clone());
                return;
            }
        }

        self.rows.push(TimelineRow::Confirmed(message.clone()));
    }

    fn row_by_id_mut(&mut self, id: MessageId) -> Option<&mut TimelineRow> {
        self.rows
            .iter_mut()
            .find(|r| matches!(r, TimelineRow::Confirmed(m) if m.id == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_types::{RoomId, UserId};
    use uuid::Uuid;

    fn text(body: &str) -> MessagePayload {
        MessagePayload::Text { body: body.into() }
    }

    fn server_message(id: i64, temp_id: Option<&str>, body: &str) -> Message {
        Message {
            id: MessageId(id),
            room_id: RoomId(Uuid::nil()),
            sender_id: UserId(Uuid::nil()),
            payload: text(body),
            pinned: false,
            deleted: false,
            created_at: Utc::now(),
            client_temp_id: temp_id.map(ClientTempId::new),
        }
    }

    fn confirmed_ids(timeline: &RoomTimeline) -> Vec<i64> {
        timeline
            .rows()
            .iter()
            .filter_map(|r| match r {
                TimelineRow::Confirmed(m) => Some(m.id.0),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn echo_replaces_optimistic_row_in_place() {
        let mut timeline = RoomTimeline::new();
        timeline.add_optimistic(ClientTempId::new("t1"), text("mine"));
        timeline.apply(&GatewayEvent::MessageCreate {
            message: server_message(7, None, "theirs"),
        });
        assert_eq!(timeline.rows().len(), 2);

        // The echoed broadcast copy takes the optimistic row's slot.
        timeline.apply(&GatewayEvent::MessageCreate {
            message: server_message(8, Some("t1"), "mine"),
        });
        assert_eq!(timeline.rows().len(), 2);
        assert!(matches!(
            &timeline.rows()[0],
            TimelineRow::Confirmed(m) if m.id == MessageId(8)
        ));
    }

    #[test]
    fn save_failure_drops_optimistic_row() {
        let mut timeline = RoomTimeline::new();
        timeline.add_optimistic(ClientTempId::new("t1"), text("doomed"));
        timeline.apply(&GatewayEvent::MessageSaveFailed {
            client_temp_id: ClientTempId::new("t1"),
        });
        assert!(timeline.rows().is_empty());
    }

    #[test]
    fn echo_before_optimistic_add_does_not_duplicate() {
        let mut timeline = RoomTimeline::new();
        timeline.apply(&GatewayEvent::MessageCreate {
            message: server_message(3, Some("t1"), "mine"),
        });
        timeline.add_optimistic(ClientTempId::new("t1"), text("mine"));

        assert_eq!(timeline.rows().len(), 1);
        assert_eq!(confirmed_ids(&timeline), vec![3]);
    }

    #[test]
    fn replayed_broadcast_converges_to_one_row() {
        let mut timeline = RoomTimeline::new();
        let message = server_message(5, Some("t1"), "hello");
        timeline.apply(&GatewayEvent::MessageCreate { message: message.clone() });
        timeline.apply(&GatewayEvent::MessageCreate { message });
        assert_eq!(confirmed_ids(&timeline), vec![5]);
    }

    #[test]
    fn pin_change_updates_confirmed_row() {
        let mut timeline = RoomTimeline::new();
        timeline.apply(&GatewayEvent::MessageCreate {
            message: server_message(4, None, "x"),
        });
        timeline.apply(&GatewayEvent::PinChanged {
            room_id: RoomId(Uuid::nil()),
            message_id: MessageId(4),
            pinned: true,
            by: UserId(Uuid::nil()),
        });

        assert!(matches!(
            &timeline.rows()[0],
            TimelineRow::Confirmed(m) if m.pinned
        ));
    }
}
