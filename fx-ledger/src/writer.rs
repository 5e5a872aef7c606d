//! Writer-role assignment
//!
//! One observable record names the worker allowed to persist. Every
//! change bumps the epoch; promotion is a compare-and-set on the epoch,
//! so concurrent promotion attempts converge on a single writer.

use crate::{types::WorkerId, Error, Result};
use serde::Serialize;
use tokio::sync::watch;

/// Current writer and the epoch of the last change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriterRecord {
    /// Worker holding the role, if any
    pub writer: Option<WorkerId>,
    /// Incremented on every assignment change
    pub epoch: u64,
}

/// Writer-role record shared by the coordinator, the supervisor and workers
#[derive(Debug)]
pub struct WriterAssignment {
    record: watch::Sender<WriterRecord>,
}

impl Default for WriterAssignment {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterAssignment {
    /// Record with no writer at epoch 0
    pub fn new() -> Self {
        let (record, _) = watch::channel(WriterRecord {
            writer: None,
            epoch: 0,
        });
        Self { record }
    }

    /// Current record
    pub fn current(&self) -> WriterRecord {
        *self.record.borrow()
    }

    /// Whether `id` holds the writer role right now
    pub fn is_writer(&self, id: WorkerId) -> bool {
        self.record.borrow().writer == Some(id)
    }

    /// Hand the role to `id` if the record is still at `expected_epoch`.
    ///
    /// Returns the new epoch.
    pub fn promote(&self, expected_epoch: u64, id: WorkerId) -> Result<u64> {
        let mut epoch = None;
        self.record.send_if_modified(|record| {
            if record.epoch != expected_epoch {
                return false;
            }
            record.writer = Some(id);
            record.epoch += 1;
            epoch = Some(record.epoch);
            true
        });

        match epoch {
            Some(epoch) => {
                tracing::info!(writer = %id, epoch, "Writer role assigned");
                Ok(epoch)
            }
            None => Err(Error::Concurrency(format!(
                "writer record moved past epoch {}",
                expected_epoch
            ))),
        }
    }

    /// Clear the role if `id` holds it; returns the new epoch when it did.
    pub fn revoke(&self, id: WorkerId) -> Option<u64> {
        let mut epoch = None;
        self.record.send_if_modified(|record| {
            if record.writer != Some(id) {
                return false;
            }
            record.writer = None;
            record.epoch += 1;
            epoch = Some(record.epoch);
            true
        });

        if let Some(epoch) = epoch {
            tracing::warn!(writer = %id, epoch, "Writer role revoked");
        }
        epoch
    }

    /// Wait until a writer is assigned at an epoch >= `min_epoch`.
    ///
    /// Callers bound this with a timeout.
    pub async fn wait_for_writer(&self, min_epoch: u64) -> Result<(WorkerId, u64)> {
        let mut rx = self.record.subscribe();
        loop {
            let record = *rx.borrow_and_update();
            if let Some(writer) = record.writer {
                if record.epoch >= min_epoch {
                    return Ok((writer, record.epoch));
                }
            }
            rx.changed()
                .await
                .map_err(|_| Error::Concurrency("writer record dropped".to_string()))?;
        }
    }
}
