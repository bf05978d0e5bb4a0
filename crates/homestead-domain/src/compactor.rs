use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::error::DomainResult;
use crate::record::{RecordId, TelemetryRecord, UnsetOp};
use crate::store::RecordStore;
use crate::value::{is_redundant, leaf_paths, value_at};

/// How many records the incremental form looks back over per key path.
const HISTORY_WINDOW: usize = 3;
/// Records pulled per page during a batch rescan.
const SCAN_PAGE: usize = 500;
/// Queued unsets are flushed to the store in groups of this size.
const DEFAULT_FLUSH_BATCH: usize = 1000;

/// Outcome of a batch rescan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionReport {
    pub records_scanned: u64,
    pub values_removed: u64,
}

/// Strips interior values out of constant runs, per key path.
///
/// For any run of three or more consecutive equal values of one leaf
/// key, only the first and last occurrence need to survive: the
/// interior repeats carry no information, and a value's lifetime is
/// still recoverable from the two endpoints. Removal always unsets the
/// single leaf, never the record, so other keys on the same record are
/// untouched.
pub struct Compactor {
    records: Arc<dyn RecordStore>,
    flush_batch: usize,
}

impl Compactor {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            records,
            flush_batch: DEFAULT_FLUSH_BATCH,
        }
    }

    /// Smaller flush groups, for tests and cautious deployments.
    pub fn with_flush_batch(mut self, flush_batch: usize) -> Self {
        self.flush_batch = flush_batch.max(1);
        self
    }

    /// Incremental form, run after each insert: for every leaf key the
    /// new record carries, look at the last three records still
    /// holding that key and unset it on the middle one when all three
    /// values are equal. Repeated application converges to the same
    /// first-and-last shape the batch form produces.
    #[instrument(skip(self, record), fields(device_id = %device_id))]
    pub async fn compact_inserted(
        &self,
        device_id: &str,
        record: &TelemetryRecord,
    ) -> DomainResult<u64> {
        let mut removed = 0;
        for leaf in leaf_paths(&record.data) {
            let key_path = format!("data.{leaf}");
            let recent = self
                .records
                .recent_with_path(device_id, &key_path, HISTORY_WINDOW)
                .await?;
            if recent.len() < HISTORY_WINDOW {
                continue;
            }
            // Newest first: recent[0] is the record just inserted.
            let (Some(newest), Some(middle), Some(oldest)) = (
                value_at(&recent[0].doc, &key_path),
                value_at(&recent[1].doc, &key_path),
                value_at(&recent[2].doc, &key_path),
            ) else {
                continue;
            };
            if is_redundant(oldest, middle, newest) {
                self.records
                    .unset_path(device_id, recent[1].id, &key_path)
                    .await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "compacted redundant values");
        }
        Ok(removed)
    }

    /// Batch form: one ascending pass over the device's whole history,
    /// tracking a two-kept-point window per key path. When the next
    /// value equals both kept points, the younger kept point's leaf is
    /// queued for removal and the new occurrence takes its place;
    /// otherwise the window shifts forward.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub async fn compact_device(&self, device_id: &str) -> DomainResult<CompactionReport> {
        let mut windows: HashMap<String, KeptPair> = HashMap::new();
        let mut pending: Vec<UnsetOp> = Vec::new();
        let mut report = CompactionReport::default();
        let mut cursor: Option<RecordId> = None;

        loop {
            let page = self.records.scan_page(device_id, cursor, SCAN_PAGE).await?;
            let Some(last) = page.last() else { break };
            cursor = Some(last.id);

            for record in &page {
                report.records_scanned += 1;
                for key_path in leaf_paths(&record.doc) {
                    let Some(value) = value_at(&record.doc, &key_path) else {
                        continue;
                    };
                    match windows.entry(key_path) {
                        Entry::Vacant(slot) => {
                            slot.insert(KeptPair::first(record.id, value.clone()));
                        }
                        Entry::Occupied(mut slot) => {
                            if let Some(removed_id) = slot.get_mut().advance(record.id, value) {
                                pending.push(UnsetOp {
                                    record_id: removed_id,
                                    key_path: slot.key().clone(),
                                });
                                report.values_removed += 1;
                            }
                        }
                    }
                }
                if pending.len() >= self.flush_batch {
                    self.records.unset_paths(device_id, &pending).await?;
                    info!(
                        flushed = pending.len(),
                        scanned = report.records_scanned,
                        "flushed compaction batch"
                    );
                    pending.clear();
                }
            }
        }

        if !pending.is_empty() {
            self.records.unset_paths(device_id, &pending).await?;
        }
        info!(
            scanned = report.records_scanned,
            removed = report.values_removed,
            "batch compaction finished"
        );
        Ok(report)
    }
}

#[derive(Debug, Clone)]
struct KeptPoint {
    record_id: RecordId,
    value: Value,
}

/// The two survivors of the current constant run for one key path.
#[derive(Debug, Clone)]
struct KeptPair {
    older: KeptPoint,
    newer: Option<KeptPoint>,
}

impl KeptPair {
    fn first(record_id: RecordId, value: Value) -> Self {
        Self {
            older: KeptPoint { record_id, value },
            newer: None,
        }
    }

    /// Feeds the next occurrence into the window. Returns the record
    /// whose leaf became redundant, if any.
    fn advance(&mut self, record_id: RecordId, value: &Value) -> Option<RecordId> {
        match self.newer.take() {
            None => {
                self.newer = Some(KeptPoint {
                    record_id,
                    value: value.clone(),
                });
                None
            }
            Some(mut newer) => {
                let removed = if is_redundant(&self.older.value, &newer.value, value) {
                    let removed_id = newer.record_id;
                    newer = KeptPoint {
                        record_id,
                        value: value.clone(),
                    };
                    Some(removed_id)
                } else {
                    self.older = std::mem::replace(
                        &mut newer,
                        KeptPoint {
                            record_id,
                            value: value.clone(),
                        },
                    );
                    None
                };
                self.newer = Some(newer);
                removed
            }
        }
    }
}
