//! Run tools as child processes. Standard output and standard error share a single pipe, so the
//! lines arrive in the order the tool wrote them.

use std::{
    io::{BufRead, BufReader, PipeReader},
    process::Stdio,
};

use error_stack::{Report, ResultExt};
use paperflow_job_manager::{SpawnedTask, Spawner, TaskCommand, TaskError, TaskId};
use tracing::{event, Level};

/// Spawn a local process for each task.
#[derive(Debug, Default)]
pub struct LocalSpawner {
    /// If true, the program is a shell script run with `sh -c`, and the arguments are passed to
    /// the script as `$1`, `$2`, and so on.
    pub shell: bool,
}

impl LocalSpawner {
    /// Spawn the provided command. This gives more control over the spawned process
    /// than the method provided by the [Spawner] trait.
    ///
    /// On Unix the process starts in a new process group, and killing the task kills the whole
    /// group, including any processes the tool started itself.
    pub fn spawn_command(
        &self,
        task_id: TaskId,
        mut command: std::process::Command,
    ) -> Result<LocalSpawnedTask, Report<TaskError>> {
        let (reader, writer) = std::io::pipe()
            .change_context(TaskError::DidNotStart)
            .attach_printable("Creating output pipe")?;
        let stderr_writer = writer
            .try_clone()
            .change_context(TaskError::DidNotStart)
            .attach_printable("Creating output pipe")?;

        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(stderr_writer));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut command = tokio::process::Command::from(command);
        command.kill_on_drop(true);

        let spawned = command
            .spawn()
            .change_context(TaskError::DidNotStart)
            .attach_printable_lazy(|| format!("Task {task_id}"));
        // The command holds our copies of the pipe's write end. They have to be closed before the
        // reader can see the end of the output.
        drop(command);
        let child_process = spawned?;

        let (tx, lines) = flume::unbounded();
        forward_lines(task_id, reader, tx);

        Ok(LocalSpawnedTask {
            task_id,
            process_group: child_process.id(),
            child_process,
            reaped: false,
            lines,
        })
    }
}

/// Read the merged output on a blocking thread until every writer has closed the pipe. Bytes
/// that are not valid UTF-8 are replaced, and reading continues.
fn forward_lines(task_id: TaskId, reader: PipeReader, tx: flume::Sender<String>) {
    tokio::task::spawn_blocking(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = buf
                        .strip_suffix(b"\n")
                        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
                        .unwrap_or(&buf);
                    if tx.send(String::from_utf8_lossy(line).into_owned()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    event!(Level::WARN, %task_id, error = %e, "Failed to read task output");
                    break;
                }
            }
        }
    });
}

#[async_trait::async_trait]
impl Spawner for LocalSpawner {
    type SpawnedTask = LocalSpawnedTask;

    async fn spawn(
        &self,
        task_id: TaskId,
        command: &TaskCommand,
    ) -> Result<Self::SpawnedTask, Report<TaskError>> {
        let mut process = if self.shell {
            let mut process = std::process::Command::new("sh");
            process.arg("-c").arg(&command.program).arg("sh");
            process
        } else {
            std::process::Command::new(&command.program)
        };

        process
            .args(&command.args)
            .current_dir(&command.work_dir)
            .envs(command.env.iter().map(|(k, v)| (k, v)));

        event!(Level::DEBUG, %task_id, %command, work_dir = %command.work_dir.display(), "Spawning process");
        self.spawn_command(task_id, process)
            .attach_printable_lazy(|| format!("Command: {command}"))
    }
}

pub struct LocalSpawnedTask {
    task_id: TaskId,
    child_process: tokio::process::Child,
    /// The ID of the process group led by the child.
    process_group: Option<u32>,
    /// Set once the child's exit status has been collected. After that its ID may be reused, so
    /// the group is no longer signalled.
    reaped: bool,
    lines: flume::Receiver<String>,
}

impl LocalSpawnedTask {
    fn kill_process_group(&self) {
        if self.reaped {
            return;
        }

        if let Some(group) = self.process_group {
            kill_process_group(self.task_id, group);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(task_id: TaskId, group: u32) {
    use nix::{
        errno::Errno,
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };

    let Ok(group) = i32::try_from(group) else {
        return;
    };

    match killpg(Pid::from_raw(group), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            event!(Level::WARN, %task_id, error = %e, "Failed to kill process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_task_id: TaskId, _group: u32) {}

impl Drop for LocalSpawnedTask {
    fn drop(&mut self) {
        self.kill_process_group();
    }
}

#[async_trait::async_trait]
impl SpawnedTask for LocalSpawnedTask {
    async fn runtime_id(&self) -> Result<String, TaskError> {
        self.child_process
            .id()
            .map(|id| id.to_string())
            .ok_or(TaskError::Lost)
    }

    async fn next_line(&mut self) -> Option<String> {
        self.lines.recv_async().await.ok()
    }

    async fn kill(&mut self) -> Result<(), Report<TaskError>> {
        self.kill_process_group();
        self.child_process
            .kill()
            .await
            .change_context(TaskError::Lost)
            .attach_printable_lazy(|| format!("Killing task {}", self.task_id))?;
        self.reaped = true;
        Ok(())
    }

    async fn wait(&mut self) -> Result<i32, Report<TaskError>> {
        let status = self
            .child_process
            .wait()
            .await
            .change_context(TaskError::Lost)
            .attach_printable_lazy(|| format!("Task {}", self.task_id))?;
        self.reaped = true;

        // A process killed by a signal has no exit code.
        Ok(status.code().unwrap_or(-1))
    }
}
