use std::{collections::VecDeque, time::Duration};

use error_stack::{Report, ResultExt};
use tracing::{event, instrument, Level};

use crate::{
    scheduler::TaskSlots,
    spawn::{RecentLog, SpawnedTask, Spawner, TaskCommand, TaskError, TaskId},
};

pub(crate) struct TaskLimits<'a> {
    pub slots: &'a TaskSlots,
    pub timeout: Option<Duration>,
    /// The number of output lines to keep for the error report.
    pub tail_lines: usize,
}

/// Run an external task to completion, passing each line of its output to `on_line` as it
/// arrives.
#[instrument(level = Level::DEBUG, skip(spawner, limits, command, on_line), fields(%task_id, program = %command.program))]
pub(crate) async fn run_task<SPAWNER: Spawner>(
    spawner: &SPAWNER,
    limits: TaskLimits<'_>,
    task_id: TaskId,
    command: &TaskCommand,
    mut on_line: impl FnMut(&str) + Send,
) -> Result<(), Report<TaskError>> {
    let Some(_slot) = limits.slots.acquire().await else {
        return Err(Report::new(TaskError::DidNotStart))
            .attach_printable("The task limiter was closed");
    };

    let mut task = spawner
        .spawn(task_id, command)
        .await
        .attach_printable_lazy(|| format!("Command: {command}"))?;
    let runtime_id = task
        .runtime_id()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    event!(Level::DEBUG, %runtime_id, "Spawned task");

    let mut tail = VecDeque::with_capacity(limits.tail_lines);
    let finished = match limits.timeout {
        Some(timeout) => tokio::time::timeout(
            timeout,
            drain_and_wait(&mut task, &mut tail, limits.tail_lines, &mut on_line),
        )
        .await
        .ok(),
        None => Some(drain_and_wait(&mut task, &mut tail, limits.tail_lines, &mut on_line).await),
    };

    let Some(exit) = finished else {
        let timeout = limits.timeout.unwrap_or_default();
        event!(Level::WARN, %runtime_id, ?timeout, "Task timed out");
        task.kill().await.ok();
        return Err(Report::new(TaskError::Timeout(timeout)))
            .attach(RecentLog(tail.into()))
            .attach_printable_lazy(|| format!("Command: {command}"));
    };

    let code = exit.attach_printable_lazy(|| format!("Command: {command}"))?;
    if code != 0 {
        event!(Level::WARN, %runtime_id, code, "Task failed");
        return Err(Report::new(TaskError::ExternalTaskFailed(code)))
            .attach(RecentLog(tail.into()))
            .attach_printable_lazy(|| format!("Command: {command}"));
    }

    Ok(())
}

async fn drain_and_wait<TASK: SpawnedTask>(
    task: &mut TASK,
    tail: &mut VecDeque<String>,
    tail_lines: usize,
    on_line: &mut (impl FnMut(&str) + Send),
) -> Result<i32, Report<TaskError>> {
    while let Some(line) = task.next_line().await {
        on_line(&line);

        if tail_lines > 0 {
            if tail.len() >= tail_lines {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }

    task.wait().await
}

/// Find the output lines attached to a task error.
pub fn recent_log(report: &Report<TaskError>) -> Option<&RecentLog> {
    report.frames().find_map(|frame| frame.downcast_ref::<RecentLog>())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        job::JobId,
        spawn::{fail_wrapper::FailingSpawner, inprocess::InProcessSpawner},
        stage::Stage,
    };

    fn task_id() -> TaskId {
        TaskId {
            job: JobId::new(),
            stage: Stage::Preprocessing,
            index: 0,
        }
    }

    fn command() -> TaskCommand {
        TaskCommand {
            program: "pipeline".to_string(),
            args: vec!["paper.pdf".to_string()],
            work_dir: std::env::temp_dir(),
            env: Vec::new(),
        }
    }

    fn limits(slots: &TaskSlots) -> TaskLimits<'_> {
        TaskLimits {
            slots,
            timeout: None,
            tail_lines: 2,
        }
    }

    #[tokio::test]
    async fn lines_in_order() {
        let spawner = InProcessSpawner::new(|info| async move {
            for i in 0..5 {
                info.output.line(format!("line {i}"));
            }
            0
        });

        let slots = TaskSlots::new(None);
        let mut lines = Vec::new();
        run_task(&spawner, limits(&slots), task_id(), &command(), |line| {
            lines.push(line.to_string())
        })
        .await
        .expect("task succeeds");

        assert_eq!(
            lines,
            vec!["line 0", "line 1", "line 2", "line 3", "line 4"]
        );
    }

    #[tokio::test]
    async fn nonzero_exit_carries_tail() {
        let spawner = InProcessSpawner::new(|info| async move {
            info.output.line("Step 1: extracting");
            info.output.line("Traceback (most recent call last):");
            info.output.line("ValueError: bad pdf");
            1
        });

        let slots = TaskSlots::new(None);
        let err = run_task(&spawner, limits(&slots), task_id(), &command(), |_| {})
            .await
            .expect_err("task fails");

        assert_eq!(err.current_context(), &TaskError::ExternalTaskFailed(1));
        let tail = recent_log(&err).expect("recent log attached");
        assert_eq!(
            tail.0,
            vec!["Traceback (most recent call last):", "ValueError: bad pdf"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_kills_task() {
        let finished = Arc::new(Mutex::new(false));
        let spawner = {
            let finished = finished.clone();
            InProcessSpawner::new(move |info| {
                let finished = finished.clone();
                async move {
                    info.output.line("Step 8: rendering");
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    *finished.lock() = true;
                    0
                }
            })
        };

        let slots = TaskSlots::new(None);
        let mut lines = 0;
        let err = run_task(
            &spawner,
            TaskLimits {
                slots: &slots,
                timeout: Some(Duration::from_secs(60)),
                tail_lines: 5,
            },
            task_id(),
            &command(),
            |_| lines += 1,
        )
        .await
        .expect_err("task times out");

        assert_eq!(
            err.current_context(),
            &TaskError::Timeout(Duration::from_secs(60))
        );
        assert_eq!(lines, 1);
        assert_eq!(
            recent_log(&err).map(|log| log.0.clone()),
            Some(vec!["Step 8: rendering".to_string()])
        );

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert!(!*finished.lock(), "task was killed");
    }

    #[tokio::test]
    async fn very_long_timeout() {
        let spawner = InProcessSpawner::new(|info| async move {
            info.output.line("Step 9: merging");
            0
        });

        let slots = TaskSlots::new(None);
        let mut lines = Vec::new();
        run_task(
            &spawner,
            TaskLimits {
                slots: &slots,
                timeout: Some(Duration::from_secs(u64::MAX)),
                tail_lines: 2,
            },
            task_id(),
            &command(),
            |line| lines.push(line.to_string()),
        )
        .await
        .expect("task succeeds");

        assert_eq!(lines, vec!["Step 9: merging"]);
    }

    #[tokio::test]
    async fn failed_to_spawn() {
        let spawner = FailingSpawner::new(
            InProcessSpawner::new(|_| async move { 0 }),
            |_, _| Err(TaskError::DidNotStart),
        );

        let slots = TaskSlots::new(None);
        let err = run_task(&spawner, limits(&slots), task_id(), &command(), |_| {})
            .await
            .expect_err("spawn fails");
        assert_eq!(err.current_context(), &TaskError::DidNotStart);
    }

    #[tokio::test]
    async fn waits_for_task_slot() {
        let spawner = Arc::new(InProcessSpawner::new(|_| async move { 0 }));
        let slots = TaskSlots::new(Some(1));
        let held = slots.acquire().await.expect("slot");

        let task = {
            let spawner = spawner.clone();
            let slots = slots.clone();
            tokio::spawn(async move {
                run_task(
                    spawner.as_ref(),
                    limits(&slots),
                    task_id(),
                    &command(),
                    |_| {},
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished(), "task waits for a slot");
        assert!(spawner.spawned.lock().is_empty(), "task did not spawn yet");

        drop(held);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("task did not time out")
            .expect("task should not panic")
            .expect("task result should be Ok");
        assert_eq!(spawner.spawned.lock().len(), 1);
    }
}
