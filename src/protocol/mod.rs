//! Parent-worker protocol
//!
//! Length-framed JSON messages over the child's stdin/stdout. Each frame is a
//! big-endian u32 byte length followed by one serialized message. The child's
//! raw stderr is not framed; the parent attributes it to the nearest running
//! test.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::RunConfig;
use crate::generate::TestGroup;
use crate::models::{StateBag, TestError, TestId, TestResult};

/// Frames above this size indicate a corrupted stream.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Messages from the dispatcher to a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ParentMessage {
    /// Sent once at startup.
    Init {
        worker_index: u32,
        config: RunConfig,
        variant_tag: String,
        variant: StateBag,
        /// Loaded by the worker before any test file.
        fixture_files: Vec<std::path::PathBuf>,
    },
    /// Run one test group; the worker loads the file on first sight.
    Run { group: TestGroup },
    /// Cooperative shutdown: drain `afterAll`s, then exit 0.
    Stop,
}

/// Messages from a worker to the dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(
    tag = "method",
    content = "params",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum WorkerMessage {
    Ready,
    TestBegin {
        test_id: TestId,
        start_wall_clock: DateTime<Utc>,
    },
    Stdout {
        test_id: Option<TestId>,
        text: String,
    },
    Stderr {
        test_id: Option<TestId>,
        text: String,
    },
    TestEnd {
        test_id: TestId,
        result: TestResult,
    },
    /// Group finished cleanly, `afterAll` included.
    Done { group_id: u32 },
    /// Unrecoverable; the parent treats the worker as crashed.
    FatalError { error: TestError },
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message).context("failed to encode frame")?;
    let len = u32::try_from(payload.len()).context("frame too large")?;
    if len > MAX_FRAME_BYTES {
        bail!("frame of {len} bytes exceeds limit");
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the stream ended cleanly between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame length"),
    }
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        bail!("incoming frame of {len} bytes exceeds limit");
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .context("failed to read frame payload")?;
    let message = serde_json::from_slice(&payload).context("failed to decode frame")?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TestStatus;

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let sent = WorkerMessage::TestBegin {
            test_id: TestId(7),
            start_wall_clock: Utc::now(),
        };
        write_frame(&mut a, &sent).await.unwrap();
        write_frame(&mut a, &WorkerMessage::Done { group_id: 3 })
            .await
            .unwrap();
        drop(a);

        let first: WorkerMessage = read_frame(&mut b).await.unwrap().unwrap();
        assert!(matches!(
            first,
            WorkerMessage::TestBegin { test_id: TestId(7), .. }
        ));
        let second: WorkerMessage = read_frame(&mut b).await.unwrap().unwrap();
        assert!(matches!(second, WorkerMessage::Done { group_id: 3 }));
        let eof: Option<WorkerMessage> = read_frame(&mut b).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn parent_messages_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        let init = ParentMessage::Init {
            worker_index: 2,
            config: RunConfig::default(),
            variant_tag: "chromium".into(),
            variant: StateBag::new(),
            fixture_files: vec!["env.fixture.rs".into()],
        };
        write_frame(&mut a, &init).await.unwrap();
        write_frame(&mut a, &ParentMessage::Stop).await.unwrap();

        let first: ParentMessage = read_frame(&mut b).await.unwrap().unwrap();
        match first {
            ParentMessage::Init {
                worker_index,
                variant_tag,
                ..
            } => {
                assert_eq!(worker_index, 2);
                assert_eq!(variant_tag, "chromium");
            }
            other => panic!("expected init, got {other:?}"),
        }
        let second: ParentMessage = read_frame(&mut b).await.unwrap().unwrap();
        assert!(matches!(second, ParentMessage::Stop));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Write a poisoned length prefix by hand.
        tokio::io::AsyncWriteExt::write_all(&mut a, &u32::MAX.to_be_bytes())
            .await
            .unwrap();
        drop(a);
        let result: Result<Option<WorkerMessage>> = read_frame(&mut b).await;
        assert!(result.is_err());
    }

    #[test]
    fn message_wire_shape_is_method_params() {
        let json = serde_json::to_value(WorkerMessage::TestEnd {
            test_id: TestId(1),
            result: TestResult::new(0, TestStatus::Passed),
        })
        .unwrap();
        assert_eq!(json["method"], "testEnd");
        assert_eq!(json["params"]["result"]["status"], "passed");

        let ready = serde_json::to_value(WorkerMessage::Ready).unwrap();
        assert_eq!(ready["method"], "ready");
    }
}
