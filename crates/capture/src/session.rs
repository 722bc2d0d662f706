//! Capturing session
//!
//! Wraps one `StoreSession` and fires the capture hooks around every
//! mutation: pre before the store sees the write, post once the key is
//! known. Set-based helpers and native statements run directly against the
//! datasource (outside the session overlay) and are captured in one shot
//! with their pre-images, collected before the statement executes.
//!
//! With capture disabled the wrapper is a plain passthrough, which is what
//! the coordinator uses when the master switch is off.

use crate::context::QueryInfo;
use crate::engine::CaptureEngine;
use serde_json::Value;
use std::sync::Arc;
use tandem_core::{
    DataSource, DataSourceError, EntitySnapshot, OperationType, StoreSession, TandemResult, TxId,
};

/// A store session with capture hooks.
pub struct CapturingSession {
    engine: Arc<CaptureEngine>,
    tx_id: TxId,
    source: Arc<dyn DataSource>,
    session: Box<dyn StoreSession>,
    capture: bool,
}

impl CapturingSession {
    /// Open a session on `source`, capturing into `engine` when `capture`
    /// is set.
    pub fn open(
        engine: Arc<CaptureEngine>,
        tx_id: TxId,
        source: Arc<dyn DataSource>,
        capture: bool,
    ) -> Self {
        let session = source.begin();
        CapturingSession {
            engine,
            tx_id,
            source,
            session,
            capture,
        }
    }

    /// Logical name of the underlying datasource.
    pub fn datasource_name(&self) -> &str {
        self.source.name()
    }

    /// Read a row as this session sees it.
    pub fn get(&self, entity_class: &str, entity_id: &str) -> TandemResult<Option<EntitySnapshot>> {
        Ok(self.session.get(entity_class, entity_id)?)
    }

    /// Insert a row. Returns the (possibly store-assigned) primary key.
    pub fn insert(&mut self, entity_class: &str, row: EntitySnapshot) -> TandemResult<String> {
        if self.capture {
            // INSERT has no before-image; the pre entry reserves the slot
            self.engine.record_pre(
                self.tx_id,
                self.source.name(),
                OperationType::Insert,
                entity_class,
                None,
                None,
            );
        }
        let entity_id = self.session.stage_insert(entity_class, row)?;
        if self.capture {
            self.engine
                .confirm(self.tx_id, OperationType::Insert, entity_class, &entity_id);
        }
        Ok(entity_id)
    }

    /// Update a row by applying `apply` to its current state.
    pub fn update(
        &mut self,
        entity_class: &str,
        entity_id: &str,
        apply: impl FnOnce(&mut EntitySnapshot),
    ) -> TandemResult<()> {
        let current = self
            .session
            .get(entity_class, entity_id)?
            .ok_or_else(|| {
                DataSourceError::not_found(
                    self.source.name(),
                    format!("{}/{} does not exist", entity_class, entity_id),
                )
            })?;

        if self.capture {
            self.engine.record_pre(
                self.tx_id,
                self.source.name(),
                OperationType::Update,
                entity_class,
                Some(entity_id.to_string()),
                Some(&current),
            );
        }

        let mut next = current;
        apply(&mut next);
        self.session.stage_update(entity_class, entity_id, next)?;

        if self.capture {
            self.engine
                .confirm(self.tx_id, OperationType::Update, entity_class, entity_id);
        }
        Ok(())
    }

    /// Delete a row.
    pub fn delete(&mut self, entity_class: &str, entity_id: &str) -> TandemResult<()> {
        let current = self
            .session
            .get(entity_class, entity_id)?
            .ok_or_else(|| {
                DataSourceError::not_found(
                    self.source.name(),
                    format!("{}/{} does not exist", entity_class, entity_id),
                )
            })?;

        if self.capture {
            self.engine.record_pre(
                self.tx_id,
                self.source.name(),
                OperationType::Delete,
                entity_class,
                Some(entity_id.to_string()),
                Some(&current),
            );
        }

        self.session.stage_delete(entity_class, entity_id)?;

        if self.capture {
            self.engine
                .confirm(self.tx_id, OperationType::Delete, entity_class, entity_id);
        }
        Ok(())
    }

    /// Set-based update: apply `apply` to every row matching `filter`.
    ///
    /// Runs immediately against the datasource, outside the session
    /// overlay. Pre-images of every affected row are captured before the
    /// first write. Returns the affected row count.
    pub fn update_where(
        &mut self,
        entity_class: &str,
        filter: impl Fn(&EntitySnapshot) -> bool,
        apply: impl Fn(&mut EntitySnapshot),
    ) -> TandemResult<u64> {
        let touched: Vec<(String, EntitySnapshot)> = self
            .source
            .scan(entity_class)?
            .into_iter()
            .filter(|(_, row)| filter(row))
            .collect();

        // A statement that touches nothing needs no inverse
        if self.capture && !touched.is_empty() {
            let pre_images = touched.iter().map(|(_, row)| row.clone()).collect();
            self.engine.record_bulk(
                self.tx_id,
                self.source.name(),
                OperationType::BulkUpdate,
                entity_class,
                pre_images,
                QueryInfo::default(),
            );
        }

        let count = touched.len() as u64;
        for (entity_id, row) in touched {
            let mut next = row;
            apply(&mut next);
            self.source.merge_row(entity_class, &entity_id, next)?;
        }
        Ok(count)
    }

    /// Set-based delete of every row matching `filter`.
    ///
    /// Immediate like `update_where`; pre-images captured first.
    pub fn delete_where(
        &mut self,
        entity_class: &str,
        filter: impl Fn(&EntitySnapshot) -> bool,
    ) -> TandemResult<u64> {
        let touched: Vec<(String, EntitySnapshot)> = self
            .source
            .scan(entity_class)?
            .into_iter()
            .filter(|(_, row)| filter(row))
            .collect();

        // A statement that touches nothing needs no inverse
        if self.capture && !touched.is_empty() {
            let pre_images = touched.iter().map(|(_, row)| row.clone()).collect();
            self.engine.record_bulk(
                self.tx_id,
                self.source.name(),
                OperationType::BulkDelete,
                entity_class,
                pre_images,
                QueryInfo::default(),
            );
        }

        let count = touched.len() as u64;
        for (entity_id, _) in touched {
            self.source.delete_row(entity_class, &entity_id)?;
        }
        Ok(count)
    }

    /// Execute a native parameterized statement, capturing it with the
    /// caller-supplied inverse and pre-images from `info`.
    pub fn execute_native(
        &mut self,
        entity_class: &str,
        statement: &str,
        params: &[Value],
        mut info: QueryInfo,
    ) -> TandemResult<u64> {
        if self.capture {
            info.statement = Some(statement.to_string());
            let affected = std::mem::take(&mut info.affected);
            self.engine.record_bulk(
                self.tx_id,
                self.source.name(),
                OperationType::NativeQuery,
                entity_class,
                affected,
                info,
            );
        }
        Ok(self.source.execute_raw(statement, params)?)
    }

    /// Invoke a stored procedure, capturing it with the caller-supplied
    /// inverse procedure and pre-images from `info`.
    pub fn call_procedure(
        &mut self,
        entity_class: &str,
        procedure: &str,
        params: &[Value],
        mut info: QueryInfo,
    ) -> TandemResult<()> {
        if self.capture {
            info.statement = Some(procedure.to_string());
            let affected = std::mem::take(&mut info.affected);
            self.engine.record_bulk(
                self.tx_id,
                self.source.name(),
                OperationType::StoredProcedure,
                entity_class,
                affected,
                info,
            );
        }
        Ok(self.source.call_procedure(procedure, params)?)
    }

    /// Flush the underlying session so generated state materializes.
    pub fn flush(&mut self) -> TandemResult<()> {
        Ok(self.session.flush()?)
    }

    /// Commit the underlying local transaction.
    pub fn commit(&mut self) -> TandemResult<()> {
        Ok(self.session.commit()?)
    }

    /// Roll back the underlying local transaction and discard any
    /// unconfirmed pre entries.
    pub fn rollback(&mut self) {
        self.session.rollback();
        if self.capture {
            self.engine.discard_pending(self.tx_id);
        }
    }
}
