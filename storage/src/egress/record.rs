//! Envelope of an outbound fragment.
//!
//! Records are stored as JSON. Binary fields are hex encoded so the stored form
//! is plain text; address fields are stored as-is.

use super::{BlockId, RECIPIENT_ID_LENGTH, SURB_ID_LENGTH};
use crate::{fragment::Fragment, Error};
use commonware_utils::{from_hex, hex};
use serde::{Deserialize, Serialize};

/// An outbound fragment and everything needed to deliver it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record<F> {
    /// Assigned by [super::Egress::put_egress].
    pub block_id: BlockId,

    /// Identity (e-mail address) of the sender.
    pub sender: String,

    /// Provider of the sender (the part of the address after the `@`).
    pub sender_provider: String,

    /// Identity (e-mail address) of the recipient.
    pub recipient: String,

    /// Provider of the recipient.
    pub recipient_provider: String,

    /// Recipient identifier, padded to a fixed length, used for routing.
    pub recipient_id: [u8; RECIPIENT_ID_LENGTH],

    /// Number of attempts made to deliver the fragment.
    pub send_attempts: u8,

    /// Keys to decrypt a reply sent via a single-use reply block, if one is
    /// expected.
    pub surb_keys: Option<Vec<u8>>,

    /// Correlates a reply with this record.
    pub surb_id: [u8; SURB_ID_LENGTH],

    /// The fragment to deliver.
    pub fragment: F,
}

#[derive(Serialize, Deserialize)]
struct Wire {
    block_id: String,
    sender: String,
    sender_provider: String,
    recipient: String,
    recipient_provider: String,
    recipient_id: String,
    send_attempts: u8,
    surb_keys: Option<String>,
    surb_id: String,
    fragment: String,
}

impl<F: Fragment> Record<F> {
    /// Create a record that has not yet been stored or sent.
    pub fn new(
        sender: impl Into<String>,
        sender_provider: impl Into<String>,
        recipient: impl Into<String>,
        recipient_provider: impl Into<String>,
        recipient_id: [u8; RECIPIENT_ID_LENGTH],
        fragment: F,
    ) -> Self {
        Self {
            block_id: BlockId::default(),
            sender: sender.into(),
            sender_provider: sender_provider.into(),
            recipient: recipient.into(),
            recipient_provider: recipient_provider.into(),
            recipient_id,
            send_attempts: 0,
            surb_keys: None,
            surb_id: [0; SURB_ID_LENGTH],
            fragment,
        }
    }

    /// Count a delivery attempt.
    pub fn attempted(&mut self) {
        self.send_attempts = self.send_attempts.saturating_add(1);
    }

    /// Whether an acknowledgement is expected via a reply block.
    pub fn expects_reply(&self) -> bool {
        self.surb_keys.is_some()
    }

    /// Serialize the record.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        self.encode_as(self.block_id)
    }

    /// Serialize the record as if it were stored at `block_id`.
    pub(crate) fn encode_as(&self, block_id: BlockId) -> Result<Vec<u8>, Error> {
        let wire = Wire {
            block_id: hex(block_id.as_ref()),
            sender: self.sender.clone(),
            sender_provider: self.sender_provider.clone(),
            recipient: self.recipient.clone(),
            recipient_provider: self.recipient_provider.clone(),
            recipient_id: hex(&self.recipient_id),
            send_attempts: self.send_attempts,
            surb_keys: self.surb_keys.as_deref().map(hex),
            surb_id: hex(&self.surb_id),
            fragment: hex(&self.fragment.serialize()),
        };
        serde_json::to_vec(&wire).map_err(|err| Error::MalformedRecord(err.to_string()))
    }

    /// Deserialize a record produced by [Record::encode].
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let wire: Wire =
            serde_json::from_slice(bytes).map_err(|err| Error::MalformedRecord(err.to_string()))?;
        let surb_keys = match wire.surb_keys {
            Some(keys) => Some(field("surb_keys", &keys)?),
            None => None,
        };
        let fragment = F::deserialize(&field("fragment", &wire.fragment)?)
            .map_err(|err| Error::MalformedRecord(format!("fragment: {err}")))?;
        Ok(Self {
            block_id: BlockId::new(fixed("block_id", &wire.block_id)?),
            sender: wire.sender,
            sender_provider: wire.sender_provider,
            recipient: wire.recipient,
            recipient_provider: wire.recipient_provider,
            recipient_id: fixed("recipient_id", &wire.recipient_id)?,
            send_attempts: wire.send_attempts,
            surb_keys,
            surb_id: fixed("surb_id", &wire.surb_id)?,
            fragment,
        })
    }
}

fn field(name: &str, value: &str) -> Result<Vec<u8>, Error> {
    from_hex(value).ok_or_else(|| Error::MalformedRecord(format!("{name} is not hex")))
}

fn fixed<const N: usize>(name: &str, value: &str) -> Result<[u8; N], Error> {
    field(name, value)?.try_into().map_err(|raw: Vec<u8>| {
        Error::MalformedRecord(format!("{name} has length {} (expected {N})", raw.len()))
    })
}
