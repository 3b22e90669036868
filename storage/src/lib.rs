//! Durably hold mixnet message fragments while they are in flight.
//!
//! A mixnet client splits every outgoing message into fragments, sends each
//! fragment (possibly many times) until it is acknowledged, and collects incoming
//! fragments until a complete message can be reassembled and handed to a mail
//! client. This crate persists all of that state in a single [engine::Engine]
//! shared by three capability-scoped stores:
//!
//! - [egress::Egress]: outbound fragments awaiting delivery or retry (bucket
//!   `outgoing`).
//! - [ingress::Ingress]: per-account inbound fragments awaiting reassembly
//!   (bucket `<account>_ingress_blocks`).
//! - [mailbox::Mailbox]: per-account reassembled messages awaiting retrieval
//!   (bucket `<account>_pop3`).
//!
//! All keys are 8-byte big-endian sequence numbers drawn from the bucket they
//! are stored in, so iteration order is insertion order.
//!
//! # Delivery Semantics
//!
//! Each store operation is atomic, but workflows spanning multiple operations
//! are not. A crash between reassembling a message and removing its fragments
//! leaves both behind (the message will be reassembled again), and a crash
//! between sending a fragment and updating (or removing) its record causes it to
//! be sent again. Consumers must tolerate duplicates. [Store::deliver_reassembled]
//! performs the reassembly handoff in a single transaction for callers that
//! prefer not to.

pub mod config;
pub mod egress;
pub mod engine;
pub mod fragment;
pub mod ingress;
pub mod mailbox;
mod store;

pub use config::Config;
pub use store::Store;

use thiserror::Error;

/// Length of the key of every stored entry.
pub const KEY_LENGTH: usize = 8;

/// Errors that can occur when interacting with the store.
#[derive(Debug, Error)]
pub enum Error {
    #[error("engine error: {0}")]
    Engine(engine::Error),
    #[error("partition not found: {0}")]
    NotFound(String),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),
    #[error("invalid config: {0}")]
    Config(String),
}

impl From<engine::Error> for Error {
    fn from(err: engine::Error) -> Self {
        match err {
            engine::Error::BucketExists(name) => Error::DuplicateRegistration(name),
            err => Error::Engine(err),
        }
    }
}

/// Encode a sequence number as a key.
pub(crate) fn key(sequence: u64) -> [u8; KEY_LENGTH] {
    sequence.to_be_bytes()
}

/// Decode a key produced by [key].
pub(crate) fn sequence(key: &[u8]) -> Result<u64, Error> {
    let raw: [u8; KEY_LENGTH] = key
        .try_into()
        .map_err(|_| Error::MalformedRecord(format!("key has length {}", key.len())))?;
    Ok(u64::from_be_bytes(raw))
}
