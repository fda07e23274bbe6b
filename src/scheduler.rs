// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Task Scheduler
//!
//! Fire-and-forget delayed actions used for broker reconnects and delayed
//! republishes. Tasks run on the tokio runtime after their delay, so tests can
//! drive them with a paused clock (`tokio::time::advance`). Pending tasks can be
//! fired early with `flush` or dropped with `abort_all`.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{runtime::Handle, sync::Notify, task::JoinHandle, time::Instant};
use tracing::{debug, error};

struct ScheduledTask {
    fire_now: Arc<Notify>,
    handle: JoinHandle<()>,
}

struct Inner {
    runtime: Option<Handle>,
    tasks: Mutex<Vec<ScheduledTask>>,
    closed: AtomicBool,
}

/// Runs futures after a delay. Clones share the same task set.
///
/// The runtime handle is captured at construction so tasks can be scheduled
/// from callbacks running on threads outside the runtime (e.g. lapin's
/// connection error hooks).
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            inner: Arc::new(Inner {
                runtime: Handle::try_current().ok(),
                tasks: Mutex::new(vec![]),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<ScheduledTask>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedules `task` to run once `delay` has elapsed.
    ///
    /// Returns `false` when the scheduler has been closed and the task was
    /// dropped.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            debug!("scheduler closed, dropping task");
            return false;
        }

        // Deadline is fixed here, not when the spawned task is first polled.
        let deadline = Instant::now() + delay;
        let fire_now = Arc::new(Notify::new());
        let trigger = fire_now.clone();
        let delayed = async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = trigger.notified() => {}
            }
            task.await;
        };
        let handle = match &self.inner.runtime {
            Some(runtime) => runtime.spawn(delayed),
            None => tokio::spawn(delayed),
        };

        let mut tasks = self.tasks();
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(ScheduledTask { fire_now, handle });
        true
    }

    /// Number of tasks that have not completed yet.
    pub fn pending(&self) -> usize {
        self.tasks()
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    /// Runs every pending task now and waits for them to complete.
    pub async fn flush(&self) {
        let tasks = std::mem::take(&mut *self.tasks());
        debug!(tasks = tasks.len(), "flushing scheduled tasks");

        for task in &tasks {
            // A stored permit covers tasks that have not reached their select yet.
            task.fire_now.notify_one();
        }

        for task in tasks {
            if let Err(err) = task.handle.await {
                error!(error = err.to_string(), "scheduled task failed");
            }
        }
    }

    /// Refuses new tasks from now on.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Cancels every pending task.
    pub fn abort_all(&self) {
        for task in std::mem::take(&mut *self.tasks()) {
            task.handle.abort();
        }
    }
}
