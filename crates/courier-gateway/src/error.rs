use courier_types::MessageId;
use thiserror::Error;

/// Server-side error taxonomy. Everything here is surfaced to the calling
/// connection only; a failed operation never produces a partial broadcast.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No identity for the connection, or the user is not a member of the
    /// room (canonical membership, not the live tracker). Terminal; no retry.
    #[error("unauthorized")]
    Unauthorized,

    /// The mutation target does not exist (or was soft-deleted).
    #[error("unknown message {0}")]
    UnknownMessage(MessageId),

    /// Storage collaborator failure. Surfaced to the sender via a targeted
    /// failure event, never broadcast.
    #[error("persistence failure: {0}")]
    Persistence(#[source] anyhow::Error),

    /// Payload failed typed decoding at the pipeline boundary.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}
