//! Worker process runtime
//!
//! A worker is a re-execution of the current binary selected by the
//! `SPECRUN_WORKER` environment variable. It speaks the framed protocol on
//! stdin/stdout: `init` once, then `run` per group, then `stop`.

mod deadline;
mod exec;

pub use deadline::{expired, supervise, Supervised, Watchdog, OVERRUN_EXIT_CODE};
pub use exec::WorkerRuntime;

use anyhow::{bail, Result};
use tokio::io::BufReader;
use tokio::sync::mpsc::unbounded_channel;
use tracing::debug;

use crate::load::FileRegistry;
use crate::models::{TestError, WorkerInfo};
use crate::protocol::{read_frame, write_frame, ParentMessage, WorkerMessage};

/// Set by the dispatcher on spawned children.
pub const WORKER_ENV: &str = "SPECRUN_WORKER";

pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// Worker-mode main loop. Returns the process exit code.
pub async fn worker_main(registry: FileRegistry) -> Result<i32> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    let init = read_frame::<_, ParentMessage>(&mut stdin).await?;
    let Some(ParentMessage::Init {
        worker_index,
        config,
        variant_tag,
        variant,
        fixture_files,
    }) = init
    else {
        bail!("expected init as the first message");
    };
    debug!("worker {worker_index} initializing ({variant_tag:?})");

    let (sink, mut outbox) = unbounded_channel::<WorkerMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            if write_frame(&mut stdout, &message).await.is_err() {
                break;
            }
        }
    });

    let worker = WorkerInfo {
        worker_index,
        variant_tag,
        variant,
    };
    let mut runtime =
        WorkerRuntime::new(registry, config, worker, sink.clone()).with_watchdog();

    let mut exit_code = 0;
    if let Err(error) = runtime.load_fixtures(&fixture_files) {
        let _ = sink.send(WorkerMessage::FatalError {
            error: TestError::from_anyhow(&error),
        });
        exit_code = 1;
    } else {
        let _ = sink.send(WorkerMessage::Ready);

        loop {
            match read_frame::<_, ParentMessage>(&mut stdin).await {
                Ok(Some(ParentMessage::Run { group })) => {
                    if let Err(error) = runtime.run_group(&group).await {
                        let _ = sink.send(WorkerMessage::FatalError {
                            error: TestError::from_anyhow(&error),
                        });
                        exit_code = 1;
                        break;
                    }
                }
                Ok(Some(ParentMessage::Stop)) | Ok(None) => {
                    runtime.shutdown().await;
                    break;
                }
                Ok(Some(ParentMessage::Init { .. })) => {
                    let _ = sink.send(WorkerMessage::FatalError {
                        error: TestError::new("duplicate init"),
                    });
                    exit_code = 1;
                    break;
                }
                Err(error) => {
                    let _ = sink.send(WorkerMessage::FatalError {
                        error: TestError::from_anyhow(&error),
                    });
                    exit_code = 1;
                    break;
                }
            }
        }
    }

    // Release every sender so the writer drains and exits.
    drop(runtime);
    drop(sink);
    let _ = writer.await;
    Ok(exit_code)
}
