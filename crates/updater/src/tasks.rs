//! Tick-driven FIFO task queue.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use tokio::runtime::Handle;
use tokio::sync::oneshot::{self, error::TryRecvError};

/// Where a task stands after a call to [`Task::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_done(self) -> bool {
        self != TaskStatus::Running
    }
}

/// A unit of work advanced a little on every tick.
pub trait Task: Send {
    fn process(&mut self) -> TaskStatus;

    /// Drop any resources held. Called when the queue is cleared.
    fn release(&mut self) {}
}

type ResultCallback = Box<dyn FnOnce(TaskStatus) + Send>;

struct Queued {
    task: Box<dyn Task>,
    status: TaskStatus,
    on_result: Option<ResultCallback>,
}

/// Runs tasks strictly one after another.
///
/// Only the front task is processed; it is popped, and its callback fired,
/// in the tick that sees it finish.
#[derive(Default)]
pub struct TaskQueue {
    tasks: VecDeque<Queued>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: impl Task + 'static) {
        self.enqueue(Box::new(task), None);
    }

    /// Queue `task` and call `on_result` once it finishes.
    pub fn push_with(
        &mut self,
        task: impl Task + 'static,
        on_result: impl FnOnce(TaskStatus) + Send + 'static,
    ) {
        self.enqueue(Box::new(task), Some(Box::new(on_result)));
    }

    fn enqueue(&mut self, task: Box<dyn Task>, on_result: Option<ResultCallback>) {
        self.tasks.push_back(Queued {
            task,
            status: TaskStatus::Running,
            on_result,
        });
    }

    /// Advance the front task by one step.
    pub fn process(&mut self) {
        let Some(front) = self.tasks.front_mut() else {
            return;
        };
        if !front.status.is_done() {
            front.status = front.task.process();
        }
        if front.status.is_done() {
            if let Some(mut done) = self.tasks.pop_front() {
                if let Some(callback) = done.on_result.take() {
                    callback(done.status);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Drop every queued task without firing callbacks.
    pub fn clear(&mut self) {
        for queued in self.tasks.iter_mut() {
            queued.task.release();
        }
        self.tasks.clear();
    }
}

/// Reads a whole file on the blocking pool.
///
/// A missing or empty file fails the task.
pub struct ReadFileTask {
    path: PathBuf,
    runtime: Handle,
    pending: Option<oneshot::Receiver<io::Result<Vec<u8>>>>,
    on_loaded: Option<Box<dyn FnOnce(Vec<u8>) + Send>>,
}

impl ReadFileTask {
    pub fn new(
        path: impl Into<PathBuf>,
        runtime: Handle,
        on_loaded: impl FnOnce(Vec<u8>) + Send + 'static,
    ) -> Self {
        Self {
            path: path.into(),
            runtime,
            pending: None,
            on_loaded: Some(Box::new(on_loaded)),
        }
    }

    fn spawn(&mut self) {
        let (tx, rx) = oneshot::channel();
        let path = self.path.clone();
        self.runtime.spawn_blocking(move || {
            let _ = tx.send(std::fs::read(path));
        });
        self.pending = Some(rx);
    }
}

impl Task for ReadFileTask {
    fn process(&mut self) -> TaskStatus {
        if self.pending.is_none() {
            self.spawn();
        }
        let Some(rx) = self.pending.as_mut() else {
            return TaskStatus::Failed;
        };

        match rx.try_recv() {
            Err(TryRecvError::Empty) => TaskStatus::Running,
            Err(TryRecvError::Closed) => TaskStatus::Failed,
            Ok(Ok(bytes)) if !bytes.is_empty() => {
                if let Some(on_loaded) = self.on_loaded.take() {
                    on_loaded(bytes);
                }
                TaskStatus::Succeeded
            }
            Ok(Ok(_)) => {
                tracing::debug!("{:?} is empty", self.path);
                TaskStatus::Failed
            }
            Ok(Err(err)) => {
                tracing::debug!("failed to read {:?}: {}", self.path, err);
                TaskStatus::Failed
            }
        }
    }

    fn release(&mut self) {
        self.pending = None;
        self.on_loaded = None;
    }
}
