//! Delta algebra capability.
//!
//! The hub never interprets edit operations itself. It hands the current
//! snapshot and an incoming operation to a [`DeltaAlgebra`] and stores
//! whatever state comes back. Convergence is the algebra's job; ordering is
//! the hub's.

use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

/// Composition rejected by the algebra.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedOperation(pub String);

impl std::fmt::Display for MalformedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Malformed operation: {}", self.0)
    }
}

impl std::error::Error for MalformedOperation {}

/// Injected edit-operation algebra.
pub trait DeltaAlgebra: Send + Sync + 'static {
    /// Snapshot of a document nobody has written to yet.
    fn empty(&self) -> Vec<u8>;

    /// Cheap structural check, run before composing.
    fn applicable(&self, operation: &[u8]) -> bool;

    /// Apply `operation` on top of `state`, returning the new state.
    fn compose(&self, state: &[u8], operation: &[u8]) -> Result<Vec<u8>, MalformedOperation>;
}

/// Yrs-backed algebra: snapshots and operations are v1 update encodings.
#[derive(Debug, Clone, Copy, Default)]
pub struct YrsAlgebra;

impl YrsAlgebra {
    fn decode(bytes: &[u8], what: &str) -> Result<Update, MalformedOperation> {
        Update::decode_v1(bytes).map_err(|e| MalformedOperation(format!("{what}: {e}")))
    }
}

impl DeltaAlgebra for YrsAlgebra {
    fn empty(&self) -> Vec<u8> {
        let doc = Doc::new();
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn applicable(&self, operation: &[u8]) -> bool {
        Update::decode_v1(operation).is_ok()
    }

    fn compose(&self, state: &[u8], operation: &[u8]) -> Result<Vec<u8>, MalformedOperation> {
        // Decode both first so a bad operation never touches the doc
        let base = Self::decode(state, "snapshot")?;
        let update = Self::decode(operation, "operation")?;

        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(base)
                .map_err(|e| MalformedOperation(format!("snapshot: {e}")))?;
            txn.apply_update(update)
                .map_err(|e| MalformedOperation(format!("operation: {e}")))?;
        }
        let txn = doc.transact();
        Ok(txn.encode_state_as_update_v1(&StateVector::default()))
    }
}
