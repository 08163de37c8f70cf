//! Throttled, bounded-parallelism queue of row-range fetches.
//!
//! The queue does no I/O. [`FetchQueue::poll`] hands out tasks to start and
//! the caller reports each one back with [`FetchQueue::finish`].

use std::collections::{BTreeSet, VecDeque};

use tracing::debug;

use gridsync_core::{interval_set::RowRange, time::Millis};

use crate::config::{DequeueOrder, FetchQueueConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Cancelled,
    Expired,
}

/// A fetch the caller wants queued.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest<M> {
    pub range: RowRange,
    pub meta: M,
    /// Overrides the configured timeout.
    pub timeout_ms: Option<Millis>,
    pub cancellable: bool,
    pub mergeable: bool,
}

impl<M> FetchRequest<M> {
    pub fn new(range: RowRange, meta: M) -> Self {
        Self {
            range,
            meta,
            timeout_ms: None,
            cancellable: true,
            mergeable: true,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: Millis) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Neither cancellable nor merged with other requests.
    pub fn pinned(mut self) -> Self {
        self.cancellable = false;
        self.mergeable = false;
        self
    }
}

#[derive(Debug, Clone)]
struct FetchTask<M> {
    id: TaskId,
    range: RowRange,
    meta: M,
    expires_at: Option<Millis>,
    cancellable: bool,
    mergeable: bool,
    state: TaskState,
}

/// A task handed out by [`FetchQueue::poll`]. `range` is after transformation.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedFetch<M> {
    pub id: TaskId,
    pub range: RowRange,
    pub meta: M,
}

#[derive(Debug)]
pub struct FetchQueue<M> {
    config: FetchQueueConfig,
    queue: VecDeque<FetchTask<M>>,
    running: BTreeSet<TaskId>,
    working: usize,
    next_id: u64,
    last_round: Option<Millis>,
}

impl<M: Clone> FetchQueue<M> {
    pub fn new(config: FetchQueueConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            running: BTreeSet::new(),
            working: 0,
            next_id: 0,
            last_round: None,
        }
    }

    /// Queue a fetch, merging it into the newest queued task when both are
    /// mergeable, the ranges are within `merge_gap` rows and the union stays
    /// under `max_merged_rows`. Returns the id of the task now covering it.
    pub fn add(&mut self, request: FetchRequest<M>, now: Millis) -> TaskId {
        let timeout = request.timeout_ms.or(self.config.task_timeout_ms);
        let expires_at = timeout.map(|t| now.saturating_add(t));

        if request.mergeable {
            if let Some(last) = self
                .queue
                .back_mut()
                .filter(|t| t.state == TaskState::Queued && t.mergeable)
            {
                let gap = last.range.gap_to(&request.range).unwrap_or(0);
                let merged = last.range.union(&request.range);
                if gap <= self.config.merge_gap && merged.len() <= self.config.max_merged_rows {
                    debug!(task = %last.id, from = %last.range, to = %merged, "merged fetch request");
                    last.range = merged;
                    last.meta = request.meta;
                    last.expires_at = match (last.expires_at, expires_at) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        _ => None,
                    };
                    return last.id;
                }
            }
        }

        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.queue.push_back(FetchTask {
            id,
            range: request.range,
            meta: request.meta,
            expires_at,
            cancellable: request.cancellable,
            mergeable: request.mergeable,
            state: TaskState::Queued,
        });
        id
    }

    /// Cancel a queued task. Started and non-cancellable tasks are untouched.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        match self.queue.iter_mut().find(|t| t.id == id) {
            Some(task) if task.state == TaskState::Queued && task.cancellable => {
                task.state = TaskState::Cancelled;
                true
            }
            _ => false,
        }
    }

    /// Start as many tasks as free slots allow, at most once per tick
    /// interval. `transform` may narrow a range before it starts, or return
    /// `None` to drop the task.
    pub fn poll(
        &mut self,
        now: Millis,
        mut transform: impl FnMut(RowRange) -> Option<RowRange>,
    ) -> Vec<StartedFetch<M>> {
        if let Some(last) = self.last_round {
            if now < last.saturating_add(self.config.tick_interval_ms) {
                return Vec::new();
            }
        }
        self.last_round = Some(now);

        let mut started = Vec::new();
        while self.working < self.config.parallel {
            let next = match self.config.order {
                DequeueOrder::Fifo => self.queue.pop_front(),
                DequeueOrder::Lifo => self.queue.pop_back(),
            };
            let Some(mut task) = next else {
                break;
            };
            if task.state != TaskState::Queued {
                continue;
            }
            if task.expires_at.is_some_and(|at| now >= at) {
                task.state = TaskState::Expired;
                debug!(task = %task.id, range = %task.range, "fetch expired before start");
                continue;
            }
            let Some(range) = transform(task.range) else {
                debug!(task = %task.id, range = %task.range, "fetch no longer needed");
                continue;
            };
            task.state = TaskState::Running;
            self.working += 1;
            self.running.insert(task.id);
            started.push(StartedFetch {
                id: task.id,
                range,
                meta: task.meta,
            });
        }
        started
    }

    /// Report a started task as done, successful or not.
    pub fn finish(&mut self, id: TaskId) -> TaskState {
        if self.running.remove(&id) {
            self.working = self.working.saturating_sub(1);
            TaskState::Completed
        } else {
            TaskState::Cancelled
        }
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        if self.running.contains(&id) {
            return Some(TaskState::Running);
        }
        self.queue.iter().find(|t| t.id == id).map(|t| t.state)
    }

    /// Tasks still waiting to start.
    pub fn queued(&self) -> usize {
        self.queue
            .iter()
            .filter(|t| t.state == TaskState::Queued)
            .count()
    }

    pub fn working(&self) -> usize {
        self.working
    }

    pub fn is_idle(&self) -> bool {
        self.working == 0 && self.queued() == 0
    }
}
