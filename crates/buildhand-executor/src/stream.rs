//! Per-container log streaming.
//!
//! One streamer task per container. The task owns the tail handle
//! exclusively and is the only writer of the container's log record, which
//! makes log uploads for one container totally ordered. Its lifetime is
//! the container's: it ends on the tail's EOF when the container
//! terminates, not when the step's wait returns. Tails that outlive their
//! step are reaped by the engine's stream token at teardown.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use buildhand_core::Container;
use buildhand_runtime::Runtime;

use crate::reporter::Reporter;
use crate::{ExecutorResult, LogHandle};

/// Flush the local buffer once it holds more than this many bytes.
pub(crate) const FLUSH_THRESHOLD: usize = 1000;

/// Which control-plane log resource the container reports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogKind {
    /// Step logs
    Step,
    /// Service logs
    Service,
}

/// Runs the streamer to completion, logging rather than propagating
/// failures: by the time the final flush can fail the container has
/// already terminated and been accounted for.
pub(crate) async fn run(
    runtime: Arc<dyn Runtime>,
    reporter: Reporter,
    log: LogHandle,
    ctn: Container,
    kind: LogKind,
    token: CancellationToken,
) {
    if let Err(e) = stream_logs(runtime, reporter, log, &ctn, kind, token).await {
        warn!(container = %ctn.name, %e, "log streamer finished with error");
    }
}

async fn stream_logs(
    runtime: Arc<dyn Runtime>,
    reporter: Reporter,
    log: LogHandle,
    ctn: &Container,
    kind: LogKind,
    token: CancellationToken,
) -> ExecutorResult {
    debug!(container = %ctn.name, "tailing container");
    let tail = runtime.tail_container(ctn, token).await?;
    let mut reader = BufReader::new(tail);

    let mut buffer: Vec<u8> = Vec::with_capacity(FLUSH_THRESHOLD * 2);
    let mut line: Vec<u8> = Vec::new();

    loop {
        line.clear();
        let read = match reader.read_until(b'\n', &mut line).await {
            Ok(n) => n,
            Err(e) => {
                warn!(container = %ctn.name, %e, "tail read failed, treating as end of stream");
                break;
            }
        };
        if read == 0 {
            break;
        }

        buffer.extend_from_slice(&line);

        if buffer.len() > FLUSH_THRESHOLD {
            flush(&reporter, &log, &mut buffer, kind, ctn, false).await;
        }
    }

    // the remainder; at-least-once, so a mid-stream failure is made up for
    // here because uploads carry the cumulative record data
    flush(&reporter, &log, &mut buffer, kind, ctn, true).await;
    Ok(())
}

/// Appends the buffer to the record and uploads it.
///
/// Mid-stream failures are logged and reading continues; the appended
/// bytes stay in the record and ride along with the next upload. The
/// final flush retries with backoff through the reporter.
async fn flush(
    reporter: &Reporter,
    log: &LogHandle,
    buffer: &mut Vec<u8>,
    kind: LogKind,
    ctn: &Container,
    last: bool,
) {
    {
        let mut record = log.lock().await;
        record.append(buffer);
    }
    buffer.clear();

    debug!(container = %ctn.name, "appending logs");
    let result = if last {
        match kind {
            LogKind::Step => reporter.upload_step_log(log).await,
            LogKind::Service => reporter.upload_service_log(log).await,
        }
    } else {
        let snapshot = log.lock().await.clone();
        let api = reporter.api();
        match kind {
            LogKind::Step => api.update_step_log(&snapshot).await.map(|_| ()).map_err(Into::into),
            LogKind::Service => api
                .update_service_log(&snapshot)
                .await
                .map(|_| ())
                .map_err(Into::into),
        }
    };

    if let Err(e) = result {
        warn!(container = %ctn.name, %e, "log upload failed");
    }
}
