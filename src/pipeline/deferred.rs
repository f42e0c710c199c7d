//! Submissions coupled to a database transaction.
//!
//! Work deferred on a [`CoupledTransaction`] is enqueued only after the
//! transaction commits, so the pipeline never sees state that could still
//! roll back. Equal index items deferred in one transaction coalesce.

use std::collections::HashSet;
use std::sync::Arc;

use sqlx::{Sqlite, Transaction};

use crawldex_core::models::{ItemKey, Priority};

use super::item::Work;
use super::task::IndexTask;
use super::Pipeline;

struct Deferred {
    work: Work,
    priority: Priority,
    task: Option<Arc<IndexTask>>,
}

pub struct CoupledTransaction {
    tx: Transaction<'static, Sqlite>,
    pipeline: Arc<Pipeline>,
    pending: Vec<Deferred>,
    seen: HashSet<ItemKey>,
}

impl CoupledTransaction {
    pub fn new(tx: Transaction<'static, Sqlite>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            tx,
            pipeline,
            pending: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn tx(&mut self) -> &mut Transaction<'static, Sqlite> {
        &mut self.tx
    }

    /// Queues `work` for after commit. Returns false when an equal item is
    /// already deferred.
    pub fn defer(&mut self, work: Work, priority: Priority, task: Option<&Arc<IndexTask>>) -> bool {
        if let Some(key) = work.key() {
            if !self.seen.insert(key) {
                return false;
            }
        }
        self.pending.push(Deferred {
            work,
            priority,
            task: task.cloned(),
        });
        true
    }

    pub fn deferred_len(&self) -> usize {
        self.pending.len()
    }

    /// Commits, then hands the deferred work to the pipeline. Returns how
    /// many items were enqueued.
    pub async fn commit(self) -> sqlx::Result<usize> {
        let Self {
            tx,
            pipeline,
            pending,
            ..
        } = self;
        tx.commit().await?;
        let n = pending.len();
        for Deferred {
            work,
            priority,
            task,
        } in pending
        {
            match task {
                Some(task) => {
                    task.add_work(work, priority);
                }
                None => pipeline.submit(work, priority),
            }
        }
        Ok(n)
    }

    /// Rolls back and discards the deferred work.
    pub async fn rollback(self) -> sqlx::Result<()> {
        self.tx.rollback().await
    }
}
