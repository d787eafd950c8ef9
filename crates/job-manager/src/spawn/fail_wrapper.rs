use async_trait::async_trait;
use error_stack::Report;

use super::{Spawner, TaskCommand, TaskError, TaskId};

/// Wrap a spawner so that a test can make chosen tasks fail to start.
pub struct FailingSpawner<
    SPAWNER: Spawner,
    FAILFUNC: Fn(&TaskId, &TaskCommand) -> Result<(), TaskError> + Send + Sync + 'static,
> {
    inner: SPAWNER,
    fail_func: FAILFUNC,
}

impl<
        SPAWNER: Spawner,
        FAILFUNC: Fn(&TaskId, &TaskCommand) -> Result<(), TaskError> + Send + Sync + 'static,
    > FailingSpawner<SPAWNER, FAILFUNC>
{
    pub fn new(inner: SPAWNER, fail_func: FAILFUNC) -> Self {
        Self { fail_func, inner }
    }
}

#[async_trait]
impl<
        SPAWNER: Spawner,
        FAILFUNC: Fn(&TaskId, &TaskCommand) -> Result<(), TaskError> + Send + Sync + 'static,
    > Spawner for FailingSpawner<SPAWNER, FAILFUNC>
{
    type SpawnedTask = SPAWNER::SpawnedTask;

    async fn spawn(
        &self,
        task_id: TaskId,
        command: &TaskCommand,
    ) -> Result<Self::SpawnedTask, Report<TaskError>> {
        (self.fail_func)(&task_id, command)
            .map_err(|e| Report::new(e).attach_printable(format!("Task {task_id}")))?;

        self.inner.spawn(task_id, command).await
    }
}
