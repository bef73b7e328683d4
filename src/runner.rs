use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::AbortHandle;
use tracing::debug;

/// Cap on captured bytes per stream.
const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;

/// Result of a command that ran to completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Failed to start command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Command timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Runs a job's command and reports how it exited.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput, RunError>;
}

/// Runs commands through the platform shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl ShellRunner {
    fn command(command: &str) -> Command {
        #[cfg(windows)]
        {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        }
        #[cfg(not(windows))]
        {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            // Own process group, so a timeout can kill background children too.
            cmd.process_group(0);
            cmd
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput, RunError> {
        let mut cmd = Self::command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));
        let readers = [stdout_task.abort_handle(), stderr_task.abort_handle()];

        // The deadline covers draining the pipes as well: a background child
        // can hold them open after the shell itself has exited.
        let finish = async {
            let status = child.wait().await?;
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            Ok::<_, std::io::Error>((status, stdout, stderr))
        };

        let finished = match timeout {
            Some(duration) => {
                let result = tokio::time::timeout(duration, finish).await;
                match result {
                    Ok(finished) => finished,
                    Err(_) => {
                        kill_tree(&mut child, pid).await;
                        readers.iter().for_each(AbortHandle::abort);
                        return Err(RunError::Timeout(duration));
                    }
                }
            }
            None => finish.await,
        };

        let (status, stdout, stderr) = finished?;
        let exit_code = status.code().unwrap_or(-1);

        debug!(command, exit_code, "Command finished");

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

/// Kill the command and everything it started in its process group.
async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pgid) = pid.and_then(|id| i32::try_from(id).ok()) {
            // SAFETY: kill(2) has no memory-safety preconditions.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    let _ = child.kill().await;
}

async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).await;
    }
    buf
}
