//! Builds the per-client event stream for `/submit-stream` and `/jobs/{id}/stream`.
//!
//! Modeled as a lazy finite sequence: a background task pushes [`StreamEvent`]s onto an `mpsc`
//! channel, the HTTP handler wraps the receiver as the response body. Dropping the receiver
//! (client disconnect) makes every subsequent `send` fail, which unwinds the task. That channel
//! closure is what turns a disconnect into cancellation, in place of a `Drop` impl on the stream.

use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::api::ApiState;
use crate::model::{JobStatus, StreamEvent};

/// Upper bound on how long we'll poll the Store waiting for a running job to reach a terminal
/// status after its log stream ends, guarding against a wedged Controller.
const TERMINAL_POLL_BOUND: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_millis(300);

pub fn open(
    state: ApiState,
    job_id: Uuid,
    from_beginning: bool,
    announce_job_id: bool,
) -> ReceiverStream<StreamEvent> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        produce(state, job_id, from_beginning, announce_job_id, tx).await;
    });
    ReceiverStream::new(rx)
}

async fn produce(
    state: ApiState,
    job_id: Uuid,
    from_beginning: bool,
    announce_job_id: bool,
    tx: mpsc::Sender<StreamEvent>,
) {
    if announce_job_id && tx.send(StreamEvent::JobId { job_id }).await.is_err() {
        return;
    }

    let mut job = match state.store.get_job(job_id, None).await {
        Ok(Some(job)) => job,
        _ => {
            let _ = tx.send(StreamEvent::Complete { success: false }).await;
            return;
        }
    };

    if job.status == JobStatus::Queued {
        let deadline = Instant::now() + state.queued_stream_timeout;
        loop {
            if Instant::now() >= deadline {
                let _ = tx
                    .send(StreamEvent::Log {
                        data: "timed out waiting for job to start".to_string(),
                    })
                    .await;
                let _ = tx.send(StreamEvent::Complete { success: false }).await;
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            job = match state.store.get_job(job_id, None).await {
                Ok(Some(job)) => job,
                _ => return,
            };
            if job.status != JobStatus::Queued {
                break;
            }
        }
    }

    if job.status == JobStatus::Running {
        let name = job.container_name(&state.namespace_prefix);
        let mut logs = state.runtime.stream_logs(&name, true);
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(data) => {
                    if tx.send(StreamEvent::Log { data }).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(StreamEvent::Log {
                            data: format!("log stream error: {e}"),
                        })
                        .await;
                    break;
                }
            }
        }

        job = wait_for_terminal(&state, job_id, job).await;
    } else if job.status.is_terminal() && from_beginning {
        let name = job.container_name(&state.namespace_prefix);
        if matches!(state.runtime.status(&name).await, Ok(Some(_))) {
            let mut logs = state.runtime.stream_logs(&name, false);
            while let Some(chunk) = logs.next().await {
                if let Ok(data) = chunk {
                    if tx.send(StreamEvent::Log { data }).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    let success = job.success.unwrap_or(false);
    let _ = tx.send(StreamEvent::Complete { success }).await;
}

/// Poll the Store until the job leaves `running`, bounded so a stalled Controller can't hang a
/// client forever. Returns the last-observed job row either way.
async fn wait_for_terminal(
    state: &ApiState,
    job_id: Uuid,
    mut job: crate::model::Job,
) -> crate::model::Job {
    let deadline = Instant::now() + TERMINAL_POLL_BOUND;
    while job.status == JobStatus::Running && Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;
        job = match state.store.get_job(job_id, None).await {
            Ok(Some(job)) => job,
            _ => return job,
        };
    }
    job
}
