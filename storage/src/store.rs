use crate::{
    egress::Egress,
    engine::Engine,
    fragment::Fragment,
    ingress::{self, Ingress},
    mailbox::{self, Mailbox},
    Config, Error,
};
use std::sync::Arc;
use tracing::{debug, info, info_span, Span};

/// The egress, ingress and mailbox stores of a client, sharing one [Engine].
pub struct Store<F: Fragment> {
    span: Span,
    engine: Arc<Engine>,
    egress: Egress<F>,
    ingress: Ingress<F>,
    mailbox: Mailbox,
}

impl<F: Fragment> Store<F> {
    /// Open the store described by `cfg` and create the partitions of its
    /// configured accounts.
    pub fn open(cfg: &Config) -> Result<Self, Error> {
        cfg.validate()?;
        let span = info_span!("store", path = %cfg.database.display());
        let engine = Arc::new(Engine::open(
            info_span!(parent: &span, "engine"),
            cfg.engine(),
        )?);
        let store = Self {
            egress: Egress::new(info_span!(parent: &span, "egress"), engine.clone()),
            ingress: Ingress::new(info_span!(parent: &span, "ingress"), engine.clone()),
            mailbox: Mailbox::new(info_span!(parent: &span, "mailbox"), engine.clone()),
            engine,
            span,
        };
        store.ingress.ensure_account_partitions(cfg.accounts.as_slice())?;
        info!(
            parent: &store.span,
            accounts = cfg.accounts.len(),
            "opened store"
        );
        Ok(store)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn egress(&self) -> &Egress<F> {
        &self.egress
    }

    pub fn ingress(&self) -> &Ingress<F> {
        &self.ingress
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Store a reassembled `message` for `account` and remove the fragments it
    /// was reassembled from (stored at `indices`) in a single transaction.
    ///
    /// Returns the index the message was stored at.
    pub fn deliver_reassembled(
        &self,
        account: &str,
        message: &[u8],
        indices: &[u64],
    ) -> Result<u64, Error> {
        let messages = mailbox::partition(account);
        let fragments = ingress::partition(account);
        let index = self.engine.with_write(|tx| {
            let index = mailbox::put(tx, &messages, message)?;
            ingress::remove(tx, &fragments, indices)?;
            Ok::<_, Error>(index)
        })?;
        debug!(
            parent: &self.span,
            account,
            index,
            fragments = indices.len(),
            "delivered reassembled message"
        );
        Ok(index)
    }

    /// Sync and release the store. Operations after `close` fail.
    pub fn close(&self) -> Result<(), Error> {
        self.engine.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        egress::{Record, RECIPIENT_ID_LENGTH},
        engine,
        fragment::{mocks::Block, MESSAGE_ID_LENGTH},
    };
    use commonware_macros::test_traced;
    use prometheus_client::{encoding::text::encode, registry::Registry};
    use std::path::Path;

    const M1: [u8; MESSAGE_ID_LENGTH] = [1; MESSAGE_ID_LENGTH];

    fn config(dir: &Path) -> Config {
        let mut cfg = Config::new(dir.join("store.db"));
        cfg.connect_timeout_ms = 100;
        cfg.accounts = vec!["alice".into(), "bob".into()];
        cfg
    }

    #[test_traced]
    fn test_open_creates_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::<Block>::open(&config(dir.path())).unwrap();
        assert_eq!(
            store.engine().buckets().unwrap(),
            vec![
                "alice_ingress_blocks",
                "alice_pop3",
                "bob_ingress_blocks",
                "bob_pop3"
            ]
        );
        store.close().unwrap();

        // Reopening with the same accounts is fine
        let store = Store::<Block>::open(&config(dir.path())).unwrap();
        assert_eq!(store.engine().buckets().unwrap().len(), 4);
        store.close().unwrap();
    }

    #[test_traced]
    fn test_open_duplicate_account() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.accounts.push("alice".into());
        assert!(matches!(
            Store::<Block>::open(&cfg),
            Err(Error::DuplicateRegistration(name)) if name == "alice"
        ));
    }

    #[test_traced]
    fn test_open_locked() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::<Block>::open(&config(dir.path())).unwrap();
        assert!(matches!(
            Store::<Block>::open(&config(dir.path())),
            Err(Error::Engine(engine::Error::Locked(_)))
        ));
        store.close().unwrap();
    }

    #[test_traced]
    fn test_reassembly_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::<Block>::open(&config(dir.path())).unwrap();

        // Bob receives the two fragments of a message
        let ingress = store.ingress();
        ingress.put_fragment("bob", &Block::new(M1, 0, 2, b"hello ")).unwrap();
        ingress.put_fragment("bob", &Block::new(M1, 1, 2, b"world")).unwrap();
        let (fragments, indices) = ingress.get_fragments_for_message("bob", &M1).unwrap();
        assert_eq!(fragments.len(), 2);

        // Reassemble and hand it to the mailbox
        let message: Vec<u8> = fragments.iter().flat_map(|f| f.payload.clone()).collect();
        store.mailbox().put_message("bob", &message).unwrap();
        ingress.remove_fragments("bob", &indices).unwrap();

        assert_eq!(store.mailbox().list_messages("bob").unwrap(), vec![&b"hello world"[..]]);
        assert!(ingress.pending_messages("bob").unwrap().is_empty());
        assert!(store.mailbox().list_messages("alice").unwrap().is_empty());
        store.close().unwrap();
    }

    #[test_traced]
    fn test_deliver_reassembled() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::<Block>::open(&config(dir.path())).unwrap();
        let ingress = store.ingress();
        ingress.put_fragment("bob", &Block::new(M1, 0, 1, b"hi")).unwrap();
        let (_, indices) = ingress.get_fragments_for_message("bob", &M1).unwrap();

        let index = store.deliver_reassembled("bob", b"hi", &indices).unwrap();
        assert_eq!(
            store.mailbox().entries("bob").unwrap(),
            vec![(index, bytes::Bytes::from_static(b"hi"))]
        );
        assert!(ingress.pending_messages("bob").unwrap().is_empty());

        // Unknown account changes nothing
        assert!(matches!(
            store.deliver_reassembled("carol", b"hi", &[1]),
            Err(Error::NotFound(name)) if name == "carol_pop3"
        ));

        // Both changes are rolled back if the fragments cannot be removed
        store
            .engine()
            .with_write(|tx| {
                tx.create_bucket("dave_pop3")?;
                Ok::<_, Error>(())
            })
            .unwrap();
        assert!(matches!(
            store.deliver_reassembled("dave", b"lost", &[1]),
            Err(Error::NotFound(name)) if name == "dave_ingress_blocks"
        ));
        assert!(store.mailbox().list_messages("dave").unwrap().is_empty());
        store.close().unwrap();
    }

    #[test_traced]
    fn test_egress_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::<Block>::open(&config(dir.path())).unwrap();
        let mut record = Record::new(
            "alice@acme.com",
            "acme.com",
            "bob@nsa.gov",
            "nsa.gov",
            [0; RECIPIENT_ID_LENGTH],
            Block::new(M1, 0, 1, b"payload"),
        );
        let id = store.egress().put_egress(&mut record).unwrap();
        store.close().unwrap();
        assert!(matches!(
            store.egress().list_ids(),
            Err(Error::Engine(engine::Error::Closed))
        ));

        let store = Store::<Block>::open(&config(dir.path())).unwrap();
        assert_eq!(store.egress().list_ids().unwrap(), vec![id]);
        assert_eq!(store.egress().fetch(id).unwrap(), Some(record));
        store.close().unwrap();
    }

    #[test_traced]
    fn test_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::<Block>::open(&config(dir.path())).unwrap();
        let mut registry = Registry::default();
        store.engine().register(&mut registry);

        // One commit per partition created on open
        store.mailbox().put_message("alice", b"hi").unwrap();
        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("commits_total 5"));
        assert!(buffer.contains("buckets 4"));
        store.close().unwrap();
    }
}
