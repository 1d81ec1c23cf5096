//! The external per-item status store. The runner only ever writes to it.

use crate::model::{ItemKey, ItemStatus, LedgerRef};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("History ledger write for {ledger_ref} failed: {reason}")]
pub struct LedgerError {
    pub ledger_ref: LedgerRef,
    pub reason: String,
}

/// Each call is one independent write; no transaction spans several items.
pub trait HistoryLedger: Send + Sync {
    fn update_item(
        &self,
        ledger_ref: LedgerRef,
        item_key: &ItemKey,
        status: ItemStatus,
    ) -> Result<(), LedgerError>;

    fn update_all(&self, ledger_ref: LedgerRef, status: ItemStatus) -> Result<(), LedgerError>;
}

/// For embedders that track progress elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLedger;

impl HistoryLedger for NoopLedger {
    fn update_item(
        &self,
        ledger_ref: LedgerRef,
        item_key: &ItemKey,
        status: ItemStatus,
    ) -> Result<(), LedgerError> {
        tracing::trace!("ledger {}: item '{}' -> {}", ledger_ref, item_key, status);
        Ok(())
    }

    fn update_all(&self, ledger_ref: LedgerRef, status: ItemStatus) -> Result<(), LedgerError> {
        tracing::trace!("ledger {}: all items -> {}", ledger_ref, status);
        Ok(())
    }
}
