//! Subcommands of `mixclient`.

use commonware_utils::hex;
use mixclient_storage::{
    egress::{BlockId, Record},
    fragment::{self, Fragment, MessageId, MESSAGE_ID_LENGTH},
    Config, Error, Store,
};
use std::path::Path;
use tracing::info;

pub const BUCKETS_CMD: &str = "buckets";
pub const EGRESS_CMD: &str = "egress";
pub const LIST_CMD: &str = "list";
pub const SHOW_CMD: &str = "show";
pub const REMOVE_CMD: &str = "remove";
pub const MAILBOX_CMD: &str = "mailbox";
pub const ACCOUNTS_CMD: &str = "accounts";
pub const REGISTER_CMD: &str = "register";
pub const COMPACT_CMD: &str = "compact";

/// A fragment this tool does not interpret beyond its leading [MessageId].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Opaque(Vec<u8>);

impl Fragment for Opaque {
    fn message_id(&self) -> MessageId {
        let mut message_id = [0u8; MESSAGE_ID_LENGTH];
        message_id.copy_from_slice(&self.0[..MESSAGE_ID_LENGTH]);
        message_id
    }

    fn serialize(&self) -> Vec<u8> {
        self.0.clone()
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, fragment::Error> {
        if bytes.len() < MESSAGE_ID_LENGTH {
            return Err(fragment::Error::TooShort(bytes.len()));
        }
        Ok(Self(bytes.to_vec()))
    }
}

fn open(config: &Path) -> Result<Store<Opaque>, Error> {
    Store::open(&Config::load(config)?)
}

/// Run `f` against the store described by `config`, closing it afterwards.
fn with_store<R>(
    config: &Path,
    f: impl FnOnce(&Store<Opaque>) -> Result<R, Error>,
) -> Result<R, Error> {
    let store = open(config)?;
    let result = f(&store);
    store.close()?;
    result
}

/// Log the name of every bucket.
pub fn buckets(config: &Path) -> Result<Vec<String>, Error> {
    let buckets = with_store(config, |store| Ok(store.engine().buckets()?))?;
    for name in &buckets {
        info!(name, "bucket");
    }
    Ok(buckets)
}

/// Log a summary of every pending egress record.
pub fn egress_list(config: &Path) -> Result<Vec<BlockId>, Error> {
    with_store(config, |store| {
        let egress = store.egress();
        let ids = egress.list_ids()?;
        for id in &ids {
            let Some(record) = egress.fetch(*id)? else {
                continue;
            };
            info!(
                %id,
                recipient = %record.recipient,
                send_attempts = record.send_attempts,
                expects_reply = record.expects_reply(),
                "pending"
            );
        }
        info!(count = ids.len(), "listed egress records");
        Ok(ids)
    })
}

/// Log the egress record stored at `id`.
pub fn egress_show(config: &Path, id: BlockId) -> Result<Record<Opaque>, Error> {
    with_store(config, |store| {
        let record = store
            .egress()
            .fetch(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        info!(
            %id,
            sender = %record.sender,
            sender_provider = %record.sender_provider,
            recipient = %record.recipient,
            recipient_provider = %record.recipient_provider,
            recipient_id = hex(&record.recipient_id),
            send_attempts = record.send_attempts,
            surb_id = hex(&record.surb_id),
            expects_reply = record.expects_reply(),
            message_id = hex(&record.fragment.message_id()),
            fragment_len = record.fragment.0.len(),
            "egress record"
        );
        Ok(record)
    })
}

/// Remove the egress record stored at `id`.
pub fn egress_remove(config: &Path, id: BlockId) -> Result<(), Error> {
    with_store(config, |store| store.egress().remove(id))?;
    info!(%id, "removed egress record");
    Ok(())
}

/// Log every message in the mailbox of `account`.
pub fn mailbox_list(config: &Path, account: &str) -> Result<Vec<u64>, Error> {
    with_store(config, |store| {
        let entries = store.mailbox().entries(account)?;
        for (index, message) in &entries {
            info!(account, index, len = message.len(), "message");
        }
        Ok(entries.into_iter().map(|(index, _)| index).collect())
    })
}

/// Create the partitions of a new account.
pub fn accounts_register(config: &Path, account: &str) -> Result<(), Error> {
    with_store(config, |store| store.ingress().register_account(account))?;
    info!(account, "registered account");
    Ok(())
}

/// Rebuild the database, dropping all free pages.
pub fn compact(config: &Path) -> Result<(), Error> {
    with_store(config, |store| Ok(store.engine().compact()?))?;
    info!("compacted store");
    Ok(())
}
