use fractal_core::ledger::{HistoryLedger, LedgerError};
use fractal_core::model::{ItemKey, ItemStatus, LedgerRef};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerWrite {
    Item {
        ledger_ref: LedgerRef,
        key: ItemKey,
        status: ItemStatus,
    },
    All {
        ledger_ref: LedgerRef,
        status: ItemStatus,
    },
}

/// Keeps every write, in order.
#[derive(Debug, Default)]
pub struct RecordingLedger {
    writes: Mutex<Vec<LedgerWrite>>,
}

impl RecordingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LedgerWrite>> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn writes(&self) -> Vec<LedgerWrite> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Every status written per item key.
    pub fn item_history(&self) -> BTreeMap<String, Vec<ItemStatus>> {
        let mut history: BTreeMap<String, Vec<ItemStatus>> = BTreeMap::new();
        for write in self.lock().iter() {
            if let LedgerWrite::Item { key, status, .. } = write {
                history.entry(key.0.clone()).or_default().push(*status);
            }
        }
        history
    }
}

impl HistoryLedger for RecordingLedger {
    fn update_item(
        &self,
        ledger_ref: LedgerRef,
        item_key: &ItemKey,
        status: ItemStatus,
    ) -> Result<(), LedgerError> {
        self.lock().push(LedgerWrite::Item {
            ledger_ref,
            key: item_key.clone(),
            status,
        });
        Ok(())
    }

    fn update_all(&self, ledger_ref: LedgerRef, status: ItemStatus) -> Result<(), LedgerError> {
        self.lock().push(LedgerWrite::All { ledger_ref, status });
        Ok(())
    }
}
