//! Run tasks in the same process as the orchestrator. This is only really useful for unit tests,
//! where the task function stands in for an external tool.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::{SpawnedTask, Spawner, TaskCommand, TaskError, TaskId};

/// Sends lines of output from an in-process task.
#[derive(Clone)]
pub struct LineSender(flume::Sender<String>);

impl LineSender {
    pub fn line(&self, line: impl Into<String>) {
        self.0.send(line.into()).ok();
    }
}

pub struct InProcessTaskInfo {
    pub task_id: TaskId,
    pub command: TaskCommand,
    pub output: LineSender,
}

pub struct InProcessSpawner<F, FUNC>
where
    F: Future<Output = i32> + Send + 'static,
    FUNC: Fn(InProcessTaskInfo) -> F + Send + Sync + Clone + 'static,
{
    task_fn: FUNC,
    /// Every command that was spawned, in order.
    pub spawned: Arc<Mutex<Vec<(TaskId, TaskCommand)>>>,
}

impl<F, FUNC> InProcessSpawner<F, FUNC>
where
    F: Future<Output = i32> + Send + 'static,
    FUNC: Fn(InProcessTaskInfo) -> F + Send + Sync + Clone + 'static,
{
    pub fn new(task_fn: FUNC) -> Self {
        Self {
            task_fn,
            spawned: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl<F, FUNC> Spawner for InProcessSpawner<F, FUNC>
where
    F: Future<Output = i32> + Send + 'static,
    FUNC: Fn(InProcessTaskInfo) -> F + Send + Sync + Clone + 'static,
{
    type SpawnedTask = InProcessSpawnedTask;

    async fn spawn(
        &self,
        task_id: TaskId,
        command: &TaskCommand,
    ) -> Result<Self::SpawnedTask, Report<TaskError>> {
        self.spawned.lock().push((task_id, command.clone()));

        let (tx, rx) = flume::unbounded();
        let info = InProcessTaskInfo {
            task_id,
            command: command.clone(),
            output: LineSender(tx),
        };

        let task_fn = self.task_fn.clone();
        let task = InProcessSpawnedTask {
            task_id,
            lines: rx,
            task: Some(tokio::task::spawn(async move { (task_fn)(info).await })),
        };

        Ok(task)
    }
}

pub struct InProcessSpawnedTask {
    task_id: TaskId,
    lines: flume::Receiver<String>,
    task: Option<JoinHandle<i32>>,
}

#[async_trait]
impl SpawnedTask for InProcessSpawnedTask {
    async fn runtime_id(&self) -> Result<String, TaskError> {
        Ok(self.task_id.to_string())
    }

    async fn next_line(&mut self) -> Option<String> {
        self.lines.recv_async().await.ok()
    }

    async fn kill(&mut self) -> Result<(), Report<TaskError>> {
        if let Some(task) = self.task.as_ref() {
            task.abort();
        }

        Ok(())
    }

    async fn wait(&mut self) -> Result<i32, Report<TaskError>> {
        let Some(task) = self.task.take() else {
            return Err(Report::new(TaskError::Lost)).attach_printable("Task was already awaited");
        };

        task.await
            .change_context(TaskError::Lost)
            .attach_printable_lazy(|| format!("Task {}", self.task_id))
    }
}
