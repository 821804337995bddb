use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::judge::Judge;
use crate::queue::{JobMessage, JobQueue};

/// One slot of the concurrency budget: takes a job, supervises it to the end, repeats
pub async fn worker(
    id: usize,
    judge: Arc<Judge>,
    queue: Arc<JobQueue>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            job_message = queue.pop() => {
                let session_id = job_message.id().to_string();
                log::info!("Worker {id} got session {session_id} from queue");

                match job_message {
                    JobMessage::Interactive { session } => {
                        judge.run_interactive(&session).await;
                    }
                    JobMessage::Blocking { session, responder } => {
                        let report = judge.run_batch(&session).await;
                        if responder.send(report).is_err() {
                            log::warn!("Caller of batch session {session_id} is gone, report dropped");
                        } else {
                            log::debug!("Batch session {session_id} report sent back from worker {id}");
                        }
                    }
                }

                log::info!("Session {session_id} finished on worker {id}");
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}
