//! Index tasks: completion accounting over a group of submitted items.
//!
//! A task counts every item added to it and tracks which are still in
//! flight. It is done once the submitter has called [`IndexTask::set_ready`]
//! and the in-flight set is empty; at that moment waiters are released and
//! the task leaves the [`TaskRegistry`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crawldex_core::models::{IndexOperation, Priority};

use super::item::{Item, Work};

/// Where a task sends its items. Implemented by the pipeline.
pub trait ItemSink: Send + Sync {
    fn enqueue(&self, item: Item);

    fn task_finished(&self, id: Uuid);
}

#[derive(Debug, Default)]
struct TaskState {
    estimated: usize,
    indexed: usize,
    failed: usize,
    in_flight: HashSet<u64>,
    ready: bool,
    completed_at: Option<DateTime<Utc>>,
}

/// Point-in-time progress of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub id: Uuid,
    pub description: String,
    pub estimated: usize,
    pub indexed: usize,
    pub failed: usize,
    pub ready: bool,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct IndexTask {
    id: Uuid,
    description: String,
    created_at: DateTime<Utc>,
    state: Mutex<TaskState>,
    done: watch::Sender<bool>,
    cancelled: AtomicBool,
    sink: Weak<dyn ItemSink>,
}

impl IndexTask {
    pub(crate) fn new(description: impl Into<String>, sink: Weak<dyn ItemSink>) -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4(),
            description: description.into(),
            created_at: Utc::now(),
            state: Mutex::new(TaskState::default()),
            done,
            cancelled: AtomicBool::new(false),
            sink,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Queues the resource at `id` for (re)indexing.
    pub fn add_resource(self: &Arc<Self>, id: impl Into<String>, priority: Priority) -> bool {
        self.add_work(
            Work::Index {
                op: IndexOperation::Add,
                id: id.into(),
                resource: None,
            },
            priority,
        )
    }

    pub fn add_runnable(self: &Arc<Self>, work: Work, priority: Priority) -> bool {
        debug_assert!(matches!(work, Work::Run { .. }));
        self.add_work(work, priority)
    }

    /// Adds one item. Returns false when the task no longer accepts work.
    pub fn add_work(self: &Arc<Self>, work: Work, priority: Priority) -> bool {
        let item = {
            let mut state = self.state.lock().unwrap();
            if self.cancelled.load(Ordering::SeqCst) || state.completed_at.is_some() {
                tracing::debug!(task = %self.id, item = %work.describe(), "task is closed; item dropped");
                return false;
            }
            let item = Item::new(work, priority, Some(self.clone()));
            state.estimated += 1;
            state.in_flight.insert(item.seq);
            item
        };
        match self.sink.upgrade() {
            Some(sink) => sink.enqueue(item),
            // Dropping the item reports it failed.
            None => drop(item),
        }
        true
    }

    /// Declares that no more items will be added.
    pub fn set_ready(&self) {
        let finished = {
            let mut state = self.state.lock().unwrap();
            state.ready = true;
            self.check_done(&mut state)
        };
        if finished {
            self.finish();
        }
    }

    /// Stops accounting. Items already queued still run; their outcomes
    /// are ignored.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let newly_done = {
            let mut state = self.state.lock().unwrap();
            state.in_flight.clear();
            state.completed_at.is_none() && {
                state.completed_at = Some(Utc::now());
                true
            }
        };
        if newly_done {
            self.finish();
        }
    }

    pub(crate) fn item_done(&self, seq: u64, ok: bool) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let finished = {
            let mut state = self.state.lock().unwrap();
            if !state.in_flight.remove(&seq) {
                return;
            }
            if ok {
                state.indexed += 1;
            } else {
                state.failed += 1;
            }
            self.check_done(&mut state)
        };
        if finished {
            self.finish();
        }
    }

    fn check_done(&self, state: &mut TaskState) -> bool {
        if state.ready && state.in_flight.is_empty() && state.completed_at.is_none() {
            state.completed_at = Some(Utc::now());
            return true;
        }
        false
    }

    fn finish(&self) {
        self.done.send_replace(true);
        if let Some(sink) = self.sink.upgrade() {
            sink.task_finished(self.id);
        }
    }

    pub fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Waits until the task is done.
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives in `self`, so this cannot fail while we wait.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Waits up to `timeout`; returns whether the task is done.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    pub fn estimated_count(&self) -> usize {
        self.state.lock().unwrap().estimated
    }

    pub fn indexed_count(&self) -> usize {
        self.state.lock().unwrap().indexed
    }

    pub fn failed_count(&self) -> usize {
        self.state.lock().unwrap().failed
    }

    pub fn progress(&self) -> TaskProgress {
        let state = self.state.lock().unwrap();
        TaskProgress {
            id: self.id,
            description: self.description.clone(),
            estimated: state.estimated,
            indexed: state.indexed,
            failed: state.failed,
            ready: state.ready,
            cancelled: self.is_cancelled(),
            created_at: self.created_at,
            completed_at: state.completed_at,
        }
    }
}

/// Tasks that are not done yet.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<Uuid, Arc<IndexTask>>>,
}

impl TaskRegistry {
    pub fn register(&self, task: Arc<IndexTask>) {
        self.tasks.lock().unwrap().insert(task.id(), task);
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<IndexTask>> {
        self.tasks.lock().unwrap().remove(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<IndexTask>> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn progress(&self) -> Vec<TaskProgress> {
        let mut all: Vec<TaskProgress> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .map(|t| t.progress())
            .collect();
        all.sort_by_key(|p| p.created_at);
        all
    }
}
