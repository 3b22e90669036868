use super::{BlockId, Record, BUCKET, SURB_ID_LENGTH};
use crate::{engine::Engine, fragment::Fragment, Error};
use bytes::Bytes;
use std::{marker::PhantomData, sync::Arc};
use tracing::{debug, Span};

/// Outbound fragments awaiting delivery.
pub struct Egress<F: Fragment> {
    span: Span,
    engine: Arc<Engine>,

    _phantom: PhantomData<F>,
}

impl<F: Fragment> Egress<F> {
    pub fn new(span: Span, engine: Arc<Engine>) -> Self {
        Self {
            span,
            engine,
            _phantom: PhantomData,
        }
    }

    /// Persist `record`, returning the [BlockId] assigned to it.
    ///
    /// Once stored, the assigned identifier is also written to `record.block_id`.
    /// If storing fails, `record` is left unchanged.
    pub fn put_egress(&self, record: &mut Record<F>) -> Result<BlockId, Error> {
        let block_id = self.engine.with_write(|tx| {
            let mut bucket = tx.create_bucket_if_not_exists(BUCKET)?;
            let block_id = BlockId::from_sequence(bucket.next_sequence()?);
            bucket.put(block_id.as_ref(), &record.encode_as(block_id)?)?;
            Ok::<_, Error>(block_id)
        })?;
        record.block_id = block_id;
        debug!(
            parent: &self.span,
            %block_id,
            recipient = %record.recipient,
            "stored egress block"
        );
        Ok(block_id)
    }

    /// Overwrite the record stored at `block_id`.
    ///
    /// This is an upsert: if nothing is stored at `block_id`, `record` is stored
    /// there. Fails with [Error::NotFound] only if the `outgoing` partition does
    /// not exist yet (it is created by the first [Egress::put_egress]).
    pub fn update(&self, block_id: BlockId, record: &Record<F>) -> Result<(), Error> {
        self.engine.with_write(|tx| {
            let mut bucket = tx
                .bucket_mut(BUCKET)?
                .ok_or_else(|| Error::NotFound(BUCKET.to_string()))?;
            bucket.put(block_id.as_ref(), &record.encode()?)?;
            Ok::<_, Error>(())
        })?;
        debug!(
            parent: &self.span,
            %block_id,
            send_attempts = record.send_attempts,
            "updated egress block"
        );
        Ok(())
    }

    /// Identifiers of all stored records, in the order they were stored.
    pub fn list_ids(&self) -> Result<Vec<BlockId>, Error> {
        self.engine.with_read(|tx| {
            let Some(bucket) = tx.bucket(BUCKET)? else {
                return Ok(Vec::new());
            };
            bucket
                .entries()?
                .iter()
                .map(|(key, _)| BlockId::try_from(&key[..]))
                .collect()
        })
    }

    /// Get the serialized record stored at `block_id`.
    ///
    /// Returns an empty buffer if nothing is stored there.
    pub fn get(&self, block_id: BlockId) -> Result<Bytes, Error> {
        self.engine.with_read(|tx| {
            let Some(bucket) = tx.bucket(BUCKET)? else {
                return Ok(Bytes::new());
            };
            Ok(bucket.get(block_id.as_ref())?.unwrap_or_default())
        })
    }

    /// Get and decode the record stored at `block_id`, if any.
    pub fn fetch(&self, block_id: BlockId) -> Result<Option<Record<F>>, Error> {
        let raw = self.get(block_id)?;
        if raw.is_empty() {
            return Ok(None);
        }
        Record::decode(&raw).map(Some)
    }

    /// Find the record a reply with `surb_id` correlates to.
    pub fn find_by_surb_id(
        &self,
        surb_id: &[u8; SURB_ID_LENGTH],
    ) -> Result<Option<Record<F>>, Error> {
        self.engine.with_read(|tx| {
            let Some(bucket) = tx.bucket(BUCKET)? else {
                return Ok(None);
            };
            for (_, value) in bucket.entries()? {
                let record = Record::<F>::decode(&value)?;
                if record.expects_reply() && &record.surb_id == surb_id {
                    return Ok(Some(record));
                }
            }
            Ok(None)
        })
    }

    /// Remove the record stored at `block_id`. Removing a missing record is a
    /// no-op.
    pub fn remove(&self, block_id: BlockId) -> Result<(), Error> {
        self.engine.with_write(|tx| {
            if let Some(mut bucket) = tx.bucket_mut(BUCKET)? {
                bucket.delete(block_id.as_ref())?;
            }
            Ok::<_, Error>(())
        })?;
        debug!(parent: &self.span, %block_id, "removed egress block");
        Ok(())
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<usize, Error> {
        Ok(self.engine.with_read(|tx| match tx.bucket(BUCKET)? {
            Some(bucket) => bucket.len(),
            None => Ok(0),
        })?)
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        self.len().map(|len| len == 0)
    }
}
