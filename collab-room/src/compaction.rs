//! Optional log compaction through the external merge library.
//!
//! The room never interprets update blobs itself; a [`Compactor`] is the
//! one place where the CRDT library may fold a log into a single update.

use yrs::updates::decoder::Decode;
use yrs::{ReadTxn, Transact};

/// Merges an ordered list of update blobs into one equivalent blob.
pub trait Compactor: Send + Sync {
    /// Returns `None` when the blobs cannot be merged; the log is then kept as is.
    fn compact(&self, blobs: &[&[u8]]) -> Option<Vec<u8>>;
}

/// Compactor for Yjs v1 updates backed by `yrs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct YrsCompactor;

impl Compactor for YrsCompactor {
    fn compact(&self, blobs: &[&[u8]]) -> Option<Vec<u8>> {
        let doc = yrs::Doc::new();
        {
            let mut txn = doc.transact_mut();
            for blob in blobs {
                let update = yrs::Update::decode_v1(blob).ok()?;
                txn.apply_update(update).ok()?;
            }
        }
        let txn = doc.transact();
        Some(txn.encode_state_as_update_v1(&yrs::StateVector::default()))
    }
}
