//! Units of pipeline work.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crawldex_core::models::{IndexOperation, ItemKey, Priority};

use super::task::IndexTask;
use crate::resource::Resource;

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A background job for the run queue.
pub type Job = Box<dyn FnOnce() -> JobFuture + Send>;

/// Wraps an async closure as a [`Job`].
pub fn job<F, Fut>(f: F) -> Job
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Box::new(move || Box::pin(f()) as JobFuture)
}

pub enum Work {
    /// `id` is a resource path for adds and a document id for deletes.
    /// `resource` short-circuits resolution when the submitter already
    /// holds it.
    Index {
        op: IndexOperation,
        id: String,
        resource: Option<Arc<dyn Resource>>,
    },
    /// Every document whose uid starts with `prefix`.
    DeletePrefix { prefix: String },
    DeleteContainer { container: String },
    Run {
        description: String,
        job: Job,
    },
}

impl Work {
    pub fn add(resource: Arc<dyn Resource>) -> Self {
        Work::Index {
            op: IndexOperation::Add,
            id: resource.path().to_string(),
            resource: Some(resource),
        }
    }

    pub fn add_name_only(resource: Arc<dyn Resource>) -> Self {
        Work::Index {
            op: IndexOperation::AddNameOnly,
            id: resource.path().to_string(),
            resource: Some(resource),
        }
    }

    pub fn delete(doc_id: impl Into<String>) -> Self {
        Work::Index {
            op: IndexOperation::Delete,
            id: doc_id.into(),
            resource: None,
        }
    }

    pub fn run<F, Fut>(description: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Work::Run {
            description: description.into(),
            job: job(f),
        }
    }

    /// Coalescing key. Only single-resource items coalesce.
    pub fn key(&self) -> Option<ItemKey> {
        match self {
            Work::Index { op, id, .. } => Some(ItemKey::new(*op, id.clone())),
            _ => None,
        }
    }

    /// Deletes and jobs go to the run queue, everything else through
    /// preprocessing.
    pub fn runs_on_run_queue(&self) -> bool {
        !matches!(
            self,
            Work::Index {
                op: IndexOperation::Add | IndexOperation::AddNameOnly,
                ..
            }
        )
    }

    pub fn describe(&self) -> String {
        match self {
            Work::Index { op, id, .. } => ItemKey::new(*op, id.clone()).to_string(),
            Work::DeletePrefix { prefix } => format!("DeletePrefix:{prefix}"),
            Work::DeleteContainer { container } => format!("DeleteContainer:{container}"),
            Work::Run { description, .. } => description.clone(),
        }
    }
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

pub struct Item {
    pub seq: u64,
    pub priority: Priority,
    pub work: Work,
    completion: Completion,
}

impl Item {
    pub fn new(work: Work, priority: Priority, task: Option<Arc<IndexTask>>) -> Self {
        let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            seq,
            priority,
            work,
            completion: Completion {
                task,
                seq,
                reported: false,
            },
        }
    }

    /// Splits off the completion handle so the work can be consumed.
    pub fn into_parts(self) -> (Work, Completion) {
        (self.work, self.completion)
    }
}

/// Reports an item's outcome to its task exactly once. Dropping an
/// unreported handle counts as a failure.
pub struct Completion {
    task: Option<Arc<IndexTask>>,
    seq: u64,
    reported: bool,
}

impl Completion {
    pub fn succeeded(mut self) {
        self.report(true);
    }

    pub fn failed(mut self) {
        self.report(false);
    }

    fn report(&mut self, ok: bool) {
        if std::mem::replace(&mut self.reported, true) {
            return;
        }
        if let Some(task) = self.task.take() {
            task.item_done(self.seq, ok);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.report(false);
    }
}
