//! Per-account reassembled messages awaiting retrieval.
//!
//! Messages are stored in the account's `<account>_pop3` bucket (created along
//! with the account's fragment partition, see
//! [crate::ingress::Ingress::ensure_account_partitions]) and keyed by the
//! bucket's sequence, so they are listed in the order they were reassembled.

use crate::{
    engine::{Engine, WriteTx},
    key, sequence, Error,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, Span};

/// Name of the bucket storing messages for `account`.
pub fn partition(account: &str) -> String {
    format!("{account}_pop3")
}

/// Reassembled messages awaiting retrieval.
pub struct Mailbox {
    span: Span,
    engine: Arc<Engine>,
}

impl Mailbox {
    pub fn new(span: Span, engine: Arc<Engine>) -> Self {
        Self { span, engine }
    }

    /// Store `message` for `account`, returning the index it was stored at.
    pub fn put_message(&self, account: &str, message: &[u8]) -> Result<u64, Error> {
        let name = partition(account);
        let index = self.engine.with_write(|tx| put(tx, &name, message))?;
        debug!(
            parent: &self.span,
            account,
            index,
            len = message.len(),
            "stored message"
        );
        Ok(index)
    }

    /// All messages of `account`, in the order they were stored.
    pub fn list_messages(&self, account: &str) -> Result<Vec<Bytes>, Error> {
        Ok(self
            .entries(account)?
            .into_iter()
            .map(|(_, message)| message)
            .collect())
    }

    /// All messages of `account` along with the indices they are stored at.
    pub fn entries(&self, account: &str) -> Result<Vec<(u64, Bytes)>, Error> {
        let name = partition(account);
        self.engine.with_read(|tx| {
            let bucket = tx
                .bucket(&name)?
                .ok_or_else(|| Error::NotFound(name.clone()))?;
            bucket
                .entries()?
                .into_iter()
                .map(|(key, value)| sequence(&key).map(|index| (index, value)))
                .collect()
        })
    }

    /// Delete the messages of `account` stored at `indices`, in order.
    ///
    /// Each deletion is its own transaction: if one fails, deletions before it
    /// are kept and the rest are not attempted. Missing indices are ignored.
    pub fn delete_messages(&self, account: &str, indices: &[u64]) -> Result<(), Error> {
        let name = partition(account);
        for &index in indices {
            self.engine.with_write(|tx| {
                let mut bucket = tx
                    .bucket_mut(&name)?
                    .ok_or_else(|| Error::NotFound(name.clone()))?;
                bucket.delete(&key(index))?;
                Ok::<_, Error>(())
            })?;
            debug!(parent: &self.span, account, index, "deleted message");
        }
        Ok(())
    }
}

pub(crate) fn put(tx: &mut WriteTx<'_>, name: &str, message: &[u8]) -> Result<u64, Error> {
    let mut bucket = tx
        .bucket_mut(name)?
        .ok_or_else(|| Error::NotFound(name.to_string()))?;
    let index = bucket.next_sequence()?;
    bucket.put(&key(index), message)?;
    Ok(index)
}
