//! Per-account inbound fragments awaiting reassembly.
//!
//! Fragments arrive in any order and are stored as they arrive in the
//! account's `<account>_ingress_blocks` bucket, keyed by the bucket's sequence.
//! A reassembly process collects all fragments sharing a [MessageId] with
//! [Ingress::get_fragments_for_message], reassembles the message, stores it in
//! the account's mailbox and finally removes the consumed fragments with
//! [Ingress::remove_fragments].
//!
//! An account's partitions must be created (see
//! [Ingress::ensure_account_partitions]) before anything is stored for it.

use crate::{
    engine::{Engine, WriteTx},
    fragment::{Fragment, MessageId},
    key, mailbox, sequence, Error,
};
use commonware_utils::hex;
use std::{collections::HashMap, marker::PhantomData, sync::Arc};
use tracing::{debug, info, Span};

/// Name of the bucket storing inbound fragments for `account`.
pub fn partition(account: &str) -> String {
    format!("{account}_ingress_blocks")
}

/// Inbound fragments awaiting reassembly.
pub struct Ingress<F: Fragment> {
    span: Span,
    engine: Arc<Engine>,

    _phantom: PhantomData<F>,
}

impl<F: Fragment> Ingress<F> {
    pub fn new(span: Span, engine: Arc<Engine>) -> Self {
        Self {
            span,
            engine,
            _phantom: PhantomData,
        }
    }

    /// Create the fragment and mailbox partitions of each account, if they
    /// do not already exist.
    ///
    /// Each partition is created in its own transaction. If creating one fails,
    /// partitions created before it are kept.
    pub fn ensure_account_partitions<S: AsRef<str>>(&self, accounts: &[S]) -> Result<(), Error> {
        for account in accounts {
            let account = account.as_ref();
            for name in [partition(account), mailbox::partition(account)] {
                self.engine.with_write(|tx| {
                    tx.create_bucket_if_not_exists(&name)?;
                    Ok::<_, Error>(())
                })?;
            }
            debug!(parent: &self.span, account, "ensured account partitions");
        }
        Ok(())
    }

    /// Create the partitions of a new account.
    ///
    /// Fails with [Error::DuplicateRegistration] if either partition already
    /// exists, in which case neither is created.
    pub fn register_account(&self, account: &str) -> Result<(), Error> {
        self.engine.with_write(|tx| {
            tx.create_bucket(&partition(account))?;
            tx.create_bucket(&mailbox::partition(account))?;
            Ok::<_, Error>(())
        })?;
        info!(parent: &self.span, account, "registered account");
        Ok(())
    }

    /// Store `fragment` for `account`, returning the index it was stored at.
    pub fn put_fragment(&self, account: &str, fragment: &F) -> Result<u64, Error> {
        let name = partition(account);
        let index = self.engine.with_write(|tx| put(tx, &name, fragment))?;
        debug!(
            parent: &self.span,
            account,
            index,
            message_id = hex(&fragment.message_id()),
            "stored ingress fragment"
        );
        Ok(index)
    }

    /// Collect every fragment of `account` belonging to `message_id`, along
    /// with the indices they are stored at (both in index order).
    ///
    /// Fails with [Error::MalformedRecord] if any stored fragment (of any
    /// message) cannot be decoded.
    pub fn get_fragments_for_message(
        &self,
        account: &str,
        message_id: &MessageId,
    ) -> Result<(Vec<F>, Vec<u64>), Error> {
        let name = partition(account);
        self.engine.with_read(|tx| {
            let bucket = tx
                .bucket(&name)?
                .ok_or_else(|| Error::NotFound(name.clone()))?;
            let mut fragments = Vec::new();
            let mut indices = Vec::new();
            for (key, value) in bucket.entries()? {
                let fragment = decode::<F>(&value)?;
                if &fragment.message_id() != message_id {
                    continue;
                }
                fragments.push(fragment);
                indices.push(sequence(&key)?);
            }
            Ok((fragments, indices))
        })
    }

    /// Remove the fragments of `account` stored at `indices` in a single
    /// transaction. Missing indices are ignored.
    pub fn remove_fragments(&self, account: &str, indices: &[u64]) -> Result<(), Error> {
        let name = partition(account);
        self.engine.with_write(|tx| remove(tx, &name, indices))?;
        debug!(
            parent: &self.span,
            account,
            count = indices.len(),
            "removed ingress fragments"
        );
        Ok(())
    }

    /// Distinct messages with stored fragments and how many fragments each has,
    /// in the order they were first seen.
    pub fn pending_messages(&self, account: &str) -> Result<Vec<(MessageId, usize)>, Error> {
        let name = partition(account);
        self.engine.with_read(|tx| {
            let bucket = tx
                .bucket(&name)?
                .ok_or_else(|| Error::NotFound(name.clone()))?;
            let mut pending: Vec<(MessageId, usize)> = Vec::new();
            let mut positions: HashMap<MessageId, usize> = HashMap::new();
            for (_, value) in bucket.entries()? {
                let message_id = decode::<F>(&value)?.message_id();
                match positions.get(&message_id) {
                    Some(&position) => pending[position].1 += 1,
                    None => {
                        positions.insert(message_id, pending.len());
                        pending.push((message_id, 1));
                    }
                }
            }
            Ok(pending)
        })
    }
}

fn decode<F: Fragment>(value: &[u8]) -> Result<F, Error> {
    F::deserialize(value).map_err(|err| Error::MalformedRecord(err.to_string()))
}

pub(crate) fn put<F: Fragment>(
    tx: &mut WriteTx<'_>,
    name: &str,
    fragment: &F,
) -> Result<u64, Error> {
    let mut bucket = tx
        .bucket_mut(name)?
        .ok_or_else(|| Error::NotFound(name.to_string()))?;
    let index = bucket.next_sequence()?;
    bucket.put(&key(index), &fragment.serialize())?;
    Ok(index)
}

pub(crate) fn remove(tx: &mut WriteTx<'_>, name: &str, indices: &[u64]) -> Result<(), Error> {
    let mut bucket = tx
        .bucket_mut(name)?
        .ok_or_else(|| Error::NotFound(name.to_string()))?;
    for index in indices {
        bucket.delete(&key(*index))?;
    }
    Ok(())
}
