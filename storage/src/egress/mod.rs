//! Outbound fragments awaiting delivery or retry.
//!
//! Every fragment handed to the mixnet is first persisted as a [Record] in the
//! `outgoing` bucket. A delivery process periodically lists the stored
//! [BlockId]s, fetches each record, attempts to send it and then either removes
//! the record (delivered or acknowledged) or updates it (for example, to count
//! the attempt). Sending and updating are separate operations, so a crash in
//! between causes the fragment to be sent again.
//!
//! [BlockId]s are drawn from the bucket's sequence and encoded big-endian, so
//! [Egress::list_ids] returns records in the order they were stored.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut record = Record::new("alice@acme.com", "acme.com", "bob@nsa.gov", "nsa.gov", recipient_id, fragment);
//! let id = egress.put_egress(&mut record)?;
//! for id in egress.list_ids()? {
//!     let Some(mut record) = egress.fetch(id)? else { continue };
//!     if send(&record).is_ok() {
//!         egress.remove(id)?;
//!     } else {
//!         record.attempted();
//!         egress.update(id, &record)?;
//!     }
//! }
//! ```

mod record;
mod storage;

pub use record::Record;
pub use storage::Egress;

use crate::{Error, KEY_LENGTH};
use commonware_utils::{from_hex, hex};
use std::{fmt, str::FromStr};

/// Name of the bucket storing outbound fragments.
pub const BUCKET: &str = "outgoing";

/// Length of a [BlockId].
pub const BLOCK_ID_LENGTH: usize = KEY_LENGTH;

/// Length of a padded recipient identifier.
pub const RECIPIENT_ID_LENGTH: usize = 64;

/// Length of the identifier of a single-use reply block.
pub const SURB_ID_LENGTH: usize = 16;

/// Identifies a stored [Record].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId([u8; BLOCK_ID_LENGTH]);

impl BlockId {
    pub const fn new(raw: [u8; BLOCK_ID_LENGTH]) -> Self {
        Self(raw)
    }

    /// The identifier assigned to the record stored with `sequence`.
    pub const fn from_sequence(sequence: u64) -> Self {
        Self(sequence.to_be_bytes())
    }

    pub const fn sequence(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl AsRef<[u8]> for BlockId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for BlockId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Error> {
        value.try_into().map(Self).map_err(|_| {
            Error::MalformedRecord(format!("block id has length {}", value.len()))
        })
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

impl FromStr for BlockId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let raw = from_hex(s)
            .ok_or_else(|| Error::MalformedRecord(format!("block id is not hex: {s}")))?;
        Self::try_from(raw.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{self, Engine},
        fragment::{mocks::Block, MESSAGE_ID_LENGTH},
    };
    use commonware_macros::test_traced;
    use std::{path::Path, sync::Arc, time::Duration};
    use tracing::Span;

    fn open(dir: &Path) -> Arc<Engine> {
        let cfg = engine::Config {
            path: dir.join("store.db"),
            connect_timeout: Duration::from_millis(100),
            compact_after: None,
        };
        Arc::new(Engine::open(Span::current(), cfg).unwrap())
    }

    fn record(payload: &[u8]) -> Record<Block> {
        let mut recipient_id = [0u8; RECIPIENT_ID_LENGTH];
        recipient_id[..4].copy_from_slice(&[1, 2, 3, 4]);
        Record::new(
            "",
            "acme.com",
            "",
            "nsa.gov",
            recipient_id,
            Block::new([1; MESSAGE_ID_LENGTH], 0, 1, payload),
        )
    }

    #[test]
    fn test_block_id() {
        let id = BlockId::from_sequence(258);
        assert_eq!(id.as_ref(), &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(id.sequence(), 258);
        assert_eq!(id.to_string(), "0000000000000102");
        assert_eq!("0000000000000102".parse::<BlockId>().unwrap(), id);
        assert!("0102".parse::<BlockId>().is_err());
        assert!("not hex".parse::<BlockId>().is_err());
        assert!(BlockId::from_sequence(9) < BlockId::from_sequence(10));
    }

    #[test_traced]
    fn test_put_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let egress = Egress::<Block>::new(Span::current(), engine.clone());

        // Nothing pending before the partition exists
        assert!(egress.list_ids().unwrap().is_empty());

        let mut record = record(br#""The time has come," the Walrus said"#);
        assert_eq!(record.send_attempts, 0);
        let id = egress.put_egress(&mut record).unwrap();
        assert_eq!(record.block_id, id);

        let ids = egress.list_ids().unwrap();
        assert_eq!(ids, vec![id]);

        egress.remove(ids[0]).unwrap();
        assert!(egress.list_ids().unwrap().is_empty());

        // Removing again is a no-op
        egress.remove(ids[0]).unwrap();
        engine.close().unwrap();
    }

    #[test_traced]
    fn test_put_get_decode() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let egress = Egress::<Block>::new(Span::current(), engine.clone());

        let original = record(b"hello");
        let mut stored = original.clone();
        stored.surb_keys = Some(vec![7; 48]);
        let id = egress.put_egress(&mut stored).unwrap();

        let raw = egress.get(id).unwrap();
        let decoded = Record::<Block>::decode(&raw).unwrap();
        assert_eq!(decoded.block_id, id);
        assert_ne!(original.block_id, id);
        assert_eq!(
            Record {
                block_id: original.block_id,
                surb_keys: original.surb_keys.clone(),
                ..decoded.clone()
            },
            original
        );
        assert_eq!(egress.fetch(id).unwrap(), Some(decoded));
        engine.close().unwrap();
    }

    #[test_traced]
    fn test_ids_strictly_increasing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let egress = Egress::<Block>::new(Span::current(), engine.clone());

        let mut ids = Vec::new();
        for i in 0..20u8 {
            ids.push(egress.put_egress(&mut record(&[i])).unwrap());
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(egress.list_ids().unwrap(), ids);

        // Removed identifiers are not reused, even after a restart
        for id in &ids {
            egress.remove(*id).unwrap();
        }
        engine.close().unwrap();
        let engine = open(dir.path());
        let egress = Egress::<Block>::new(Span::current(), engine.clone());
        let next = egress.put_egress(&mut record(b"next")).unwrap();
        assert!(next > *ids.last().unwrap());
        engine.close().unwrap();
    }

    #[test_traced]
    fn test_put_egress_failure_leaves_record() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let egress = Egress::<Block>::new(Span::current(), engine.clone());
        let first = egress.put_egress(&mut record(b"first")).unwrap();

        // Reject every new entry
        let conn = rusqlite::Connection::open(dir.path().join("store.db")).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject BEFORE INSERT ON entries BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();
        let mut rejected = record(b"second");
        assert!(matches!(
            egress.put_egress(&mut rejected),
            Err(Error::Engine(engine::Error::Database(_)))
        ));
        assert_eq!(rejected.block_id, BlockId::default());
        assert_eq!(egress.list_ids().unwrap(), vec![first]);

        // The identifier was not consumed either
        conn.execute_batch("DROP TRIGGER reject").unwrap();
        drop(conn);
        let id = egress.put_egress(&mut rejected).unwrap();
        assert_eq!(rejected.block_id, id);
        assert_eq!(id.sequence(), first.sequence() + 1);
        engine.close().unwrap();
    }

    #[test_traced]
    fn test_get_missing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let egress = Egress::<Block>::new(Span::current(), engine.clone());

        // Missing partition
        let id = BlockId::from_sequence(1);
        assert!(egress.get(id).unwrap().is_empty());
        assert!(egress.fetch(id).unwrap().is_none());

        // Missing key
        egress.put_egress(&mut record(b"hello")).unwrap();
        let id = BlockId::from_sequence(2);
        assert!(egress.get(id).unwrap().is_empty());
        assert!(egress.fetch(id).unwrap().is_none());
        engine.close().unwrap();
    }

    #[test_traced]
    fn test_update() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let egress = Egress::<Block>::new(Span::current(), engine.clone());

        // No partition
        let result = egress.update(BlockId::from_sequence(1), &record(b"hello"));
        assert!(matches!(result, Err(Error::NotFound(name)) if name == BUCKET));

        // Count an attempt
        let mut stored = record(b"hello");
        let id = egress.put_egress(&mut stored).unwrap();
        stored.attempted();
        egress.update(id, &stored).unwrap();
        assert_eq!(egress.fetch(id).unwrap().unwrap().send_attempts, 1);

        // Upsert of a missing identifier
        let missing = BlockId::from_sequence(99);
        egress.update(missing, &stored).unwrap();
        assert!(egress.fetch(missing).unwrap().is_some());
        assert_eq!(egress.list_ids().unwrap(), vec![id, missing]);

        // The partition outlives its records
        egress.remove(id).unwrap();
        egress.remove(missing).unwrap();
        assert!(egress.is_empty().unwrap());
        egress.update(id, &stored).unwrap();
        assert_eq!(egress.list_ids().unwrap(), vec![id]);
        engine.close().unwrap();
    }

    #[test_traced]
    fn test_find_by_surb_id() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let egress = Egress::<Block>::new(Span::current(), engine.clone());
        assert!(egress.find_by_surb_id(&[3; SURB_ID_LENGTH]).unwrap().is_none());

        // Without keys, a record does not expect a reply
        let mut unacked = record(b"first");
        unacked.surb_id = [3; SURB_ID_LENGTH];
        egress.put_egress(&mut unacked).unwrap();

        let mut acked = record(b"second");
        acked.surb_id = [3; SURB_ID_LENGTH];
        acked.surb_keys = Some(vec![1; 32]);
        let id = egress.put_egress(&mut acked).unwrap();

        let found = egress.find_by_surb_id(&[3; SURB_ID_LENGTH]).unwrap().unwrap();
        assert_eq!(found.block_id, id);
        assert!(egress.find_by_surb_id(&[4; SURB_ID_LENGTH]).unwrap().is_none());
        engine.close().unwrap();
    }

    #[test_traced]
    fn test_fetch_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let egress = Egress::<Block>::new(Span::current(), engine.clone());
        let id = egress.put_egress(&mut record(b"hello")).unwrap();

        engine
            .with_write(|tx| {
                tx.bucket_mut(BUCKET)?.unwrap().put(id.as_ref(), b"{}")?;
                Ok::<_, Error>(())
            })
            .unwrap();
        assert!(matches!(egress.fetch(id), Err(Error::MalformedRecord(_))));
        assert_eq!(egress.get(id).unwrap(), &b"{}"[..]);
        engine.close().unwrap();
    }

    #[test_traced]
    fn test_scenario_acme_to_nsa() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open(dir.path());
        let egress = Egress::<Block>::new(Span::current(), engine.clone());

        let mut record = record(b"payload");
        assert_eq!(record.sender_provider, "acme.com");
        assert_eq!(record.recipient_provider, "nsa.gov");
        egress.put_egress(&mut record).unwrap();

        let ids = egress.list_ids().unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(egress.len().unwrap(), 1);
        egress.remove(ids[0]).unwrap();
        assert!(egress.list_ids().unwrap().is_empty());
        assert!(egress.is_empty().unwrap());
        engine.close().unwrap();
    }
}
