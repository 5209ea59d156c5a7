//! Worker process handles
//!
//! Spawns the current executable in worker mode and pumps its framed stdout
//! and raw stderr into the dispatcher's event channel.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::config::RunConfig;
use crate::generate::TestGroup;
use crate::protocol::{read_frame, write_frame, ParentMessage, WorkerMessage};
use crate::worker::WORKER_ENV;

/// Events flowing from every worker into the dispatcher loop.
#[derive(Debug)]
pub enum WorkerEvent {
    Message(u32, WorkerMessage),
    /// A line from the child's raw stderr; attributed to the nearest test.
    StderrLine(u32, String),
    /// The child's protocol stream closed; the process exited or crashed.
    Closed(u32),
}

/// Variant identity a worker is bound to at init.
pub type VariantKey = (usize, usize);

pub struct WorkerHandle {
    pub index: u32,
    pub variant_key: VariantKey,
    child: Child,
    stdin: ChildStdin,
}

impl WorkerHandle {
    /// Spawn a worker for the variant of `group` and send its `init` frame.
    pub async fn spawn(
        index: u32,
        config: &RunConfig,
        fixture_files: &[PathBuf],
        group: &TestGroup,
        events: UnboundedSender<WorkerEvent>,
    ) -> Result<Self> {
        let exe = std::env::current_exe().context("cannot locate current executable")?;
        let mut child = Command::new(exe)
            .env(WORKER_ENV, index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn worker process")?;

        let stdout = child.stdout.take().context("worker stdout missing")?;
        let stderr = child.stderr.take().context("worker stderr missing")?;
        let mut stdin = child.stdin.take().context("worker stdin missing")?;

        let init = ParentMessage::Init {
            worker_index: index,
            config: config.clone(),
            variant_tag: group.variant_tag.clone(),
            variant: group.variant.clone(),
            fixture_files: fixture_files.to_vec(),
        };
        write_frame(&mut stdin, &init).await?;

        let frame_events = events.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                match read_frame::<_, WorkerMessage>(&mut reader).await {
                    Ok(Some(message)) => {
                        if frame_events.send(WorkerEvent::Message(index, message)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        debug!("worker {index} stream error: {error:#}");
                        break;
                    }
                }
            }
            let _ = frame_events.send(WorkerEvent::Closed(index));
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if events.send(WorkerEvent::StderrLine(index, line)).is_err() {
                    break;
                }
            }
        });

        debug!("spawned worker {index} for variant {:?}", group.variant_tag);
        Ok(Self {
            index,
            variant_key: (group.source_factory, group.variant_index),
            child,
            stdin,
        })
    }

    pub async fn run(&mut self, group: TestGroup) -> Result<()> {
        write_frame(&mut self.stdin, &ParentMessage::Run { group }).await
    }

    pub async fn stop(&mut self) -> Result<()> {
        write_frame(&mut self.stdin, &ParentMessage::Stop).await
    }

    pub fn kill(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Reap the child and describe how it went down. Kills the process if it
    /// lingers past a short grace period.
    pub async fn wait_exit(&mut self) -> String {
        match tokio::time::timeout(Duration::from_secs(5), self.child.wait()).await {
            Ok(Ok(status)) => describe_exit(status),
            Ok(Err(error)) => format!("wait failed: {error}"),
            Err(_) => {
                self.kill();
                "did not exit; killed".to_string()
            }
        }
    }
}

fn describe_exit(status: std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }
    "unknown exit".to_string()
}
