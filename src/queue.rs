use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, oneshot};

use crate::error::{JudgeError, Result};
use crate::judge::ExecutionReport;
use crate::session::Session;

/// A unit of work handed to a worker
pub enum JobMessage {
    /// Playground session; output flows into the session's buffer
    Interactive { session: Arc<Session> },
    /// Batch execution; the caller waits for the report
    Blocking {
        session: Arc<Session>,
        responder: oneshot::Sender<Result<ExecutionReport>>,
    },
}

impl JobMessage {
    pub fn session(&self) -> &Arc<Session> {
        match self {
            Self::Interactive { session } => session,
            Self::Blocking { session, .. } => session,
        }
    }

    pub fn id(&self) -> &str {
        self.session().id()
    }
}

/// Bounded FIFO of admitted jobs shared by the worker pool
///
/// A job is admitted when an idle worker can take it or when fewer than
/// `capacity` jobs are already waiting; otherwise `push` fails with
/// [`JudgeError::Overloaded`].
pub struct JobQueue {
    queue: Mutex<VecDeque<JobMessage>>,
    notify: Notify,
    capacity: usize,
    idle_workers: AtomicUsize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            idle_workers: AtomicUsize::new(0),
        }
    }

    pub async fn push(&self, job: JobMessage) -> Result<()> {
        let mut queue = self.queue.lock().await;
        let admissible = self.capacity + self.idle_workers.load(Ordering::SeqCst);
        if queue.len() >= admissible {
            log::warn!(
                "Rejected session {}: {} jobs waiting, capacity {}",
                job.id(),
                queue.len(),
                self.capacity
            );
            return Err(JudgeError::Overloaded);
        }
        queue.push_back(job);
        drop(queue);
        self.notify.notify_one();
        Ok(())
    }

    /// Waits for the next job; the caller counts as idle while waiting
    pub async fn pop(&self) -> JobMessage {
        let _idle = IdleGuard::enter(&self.idle_workers);
        loop {
            if let Some(job) = self.queue.lock().await.pop_front() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    /// Removes a job that no worker has taken yet
    pub async fn cancel(&self, session_id: &str) -> bool {
        let mut queue = self.queue.lock().await;
        let before_len = queue.len();
        queue.retain(|j| j.id() != session_id);
        before_len != queue.len()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn idle_workers(&self) -> usize {
        self.idle_workers.load(Ordering::SeqCst)
    }
}

struct IdleGuard<'a>(&'a AtomicUsize);

impl<'a> IdleGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::interactive_session;
    use std::time::Duration;

    fn job() -> JobMessage {
        JobMessage::Interactive {
            session: interactive_session(),
        }
    }

    #[tokio::test]
    async fn test_rejects_beyond_capacity() {
        let queue = JobQueue::new(2);
        queue.push(job()).await.unwrap();
        queue.push(job()).await.unwrap();
        assert!(matches!(queue.push(job()).await, Err(JudgeError::Overloaded)));
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_idle_worker_extends_admission() {
        let queue = Arc::new(JobQueue::new(0));
        assert!(queue.push(job()).await.is_err());

        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.pop().await.id().to_string() }
        });
        while queue.idle_workers() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let first = job();
        let id = first.id().to_string();
        queue.push(first).await.unwrap();
        assert_eq!(waiter.await.unwrap(), id);
        assert_eq!(queue.idle_workers(), 0);
    }

    #[tokio::test]
    async fn test_fifo_and_cancel() {
        let queue = JobQueue::new(4);
        let (a, b, c) = (job(), job(), job());
        let (a_id, b_id, c_id) = (
            a.id().to_string(),
            b.id().to_string(),
            c.id().to_string(),
        );
        for j in [a, b, c] {
            queue.push(j).await.unwrap();
        }

        assert!(queue.cancel(&b_id).await);
        assert!(!queue.cancel(&b_id).await);
        assert_eq!(queue.pop().await.id(), a_id);
        assert_eq!(queue.pop().await.id(), c_id);
    }
}
