use serde::{Deserialize, Serialize};

use crate::ids::MessageId;

/// Message body, decoded once at the pipeline boundary. Unknown shapes fail
/// deserialization with a typed error instead of turning into nulls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", deny_unknown_fields)]
pub enum MessagePayload {
    Text {
        body: String,
    },

    Media {
        url: String,
        kind: MediaKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },

    /// A threaded reply to an earlier message in the same room.
    Reply { to: MessageId, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    File,
}

impl MessagePayload {
    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MessagePayload::Text { .. } => "text",
            MessagePayload::Media { kind: MediaKind::Image, .. } => "image",
            MessagePayload::Media { kind: MediaKind::Video, .. } => "video",
            MessagePayload::Media { kind: MediaKind::File, .. } => "file",
            MessagePayload::Reply { .. } => "reply",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_payload_roundtrip() {
        let p = MessagePayload::Text { body: "hello".into() };
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(serde_json::from_str::<MessagePayload>(&json).unwrap(), p);
    }

    #[test]
    fn rejects_unknown_shape() {
        let raw = r#"{"type":"Sticker","data":{"pack":"cats"}}"#;
        assert!(serde_json::from_str::<MessagePayload>(raw).is_err());
    }

    #[test]
    fn media_caption_is_optional() {
        let raw = r#"{"type":"Media","data":{"url":"https://x/y.png","kind":"image"}}"#;
        let p: MessagePayload = serde_json::from_str(raw).unwrap();
        assert_eq!(p.kind(), "image");
    }
}
