//! Interface to the codec that splits messages into fragments.
//!
//! The store never interprets a fragment beyond the identifier of the message it
//! belongs to. Implementations own the wire format.

use thiserror::Error;

/// Length of a [MessageId].
pub const MESSAGE_ID_LENGTH: usize = 16;

/// Identifies the logical message a fragment belongs to.
pub type MessageId = [u8; MESSAGE_ID_LENGTH];

/// Errors returned by a [Fragment] codec.
#[derive(Debug, Error)]
pub enum Error {
    #[error("fragment too short: {0}")]
    TooShort(usize),
    #[error("invalid fragment: {0}")]
    Invalid(String),
}

/// A slice of a larger message.
pub trait Fragment: Sized {
    /// Identifier shared by all fragments of the same message.
    fn message_id(&self) -> MessageId;

    /// Serialize the fragment.
    fn serialize(&self) -> Vec<u8>;

    /// Deserialize a fragment produced by [Fragment::serialize].
    fn deserialize(bytes: &[u8]) -> Result<Self, Error>;
}
