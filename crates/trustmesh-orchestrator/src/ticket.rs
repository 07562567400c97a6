use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use trustmesh_types::{Result, TaskId, TaskResult, TaskState, TrustmeshError};

/// Terminal notification for one task, delivered exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNotice {
    pub task_id: TaskId,
    pub result: TaskResult,
}

impl TaskNotice {
    pub fn state(&self) -> TaskState {
        self.result.state
    }
}

/// Handle returned by task submission.
#[derive(Debug)]
pub struct TaskTicket {
    pub task_id: TaskId,
    rx: oneshot::Receiver<TaskNotice>,
}

impl TaskTicket {
    pub(crate) fn new(task_id: TaskId) -> (Self, oneshot::Sender<TaskNotice>) {
        let (tx, rx) = oneshot::channel();
        (Self { task_id, rx }, tx)
    }

    /// Wait for the task to reach a terminal state.
    ///
    /// A timeout or cancellation leaves the task running; only the wait ends.
    pub async fn wait(self, timeout: Duration, cancel: &CancellationToken) -> Result<TaskNotice> {
        let task_id = self.task_id;
        tokio::select! {
            notice = tokio::time::timeout(timeout, self.rx) => match notice {
                Ok(Ok(notice)) => Ok(notice),
                Ok(Err(_)) => Err(TrustmeshError::Internal(format!(
                    "orchestrator dropped the notification for task {task_id}"
                ))),
                Err(_) => Err(TrustmeshError::Timeout(format!(
                    "task {task_id} not terminal within {} ms",
                    timeout.as_millis()
                ))),
            },
            _ = cancel.cancelled() => Err(TrustmeshError::Cancelled(format!("wait for task {task_id}"))),
        }
    }

    /// The notice if it has already arrived.
    pub fn try_take(&mut self) -> Option<TaskNotice> {
        self.rx.try_recv().ok()
    }
}

/// Wait for every ticket under one shared timeout.
///
/// Each ticket gets its own result, in input order, so one slow task does not
/// hide the notices of the others.
pub async fn wait_all(
    tickets: Vec<TaskTicket>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Vec<Result<TaskNotice>> {
    let started = tokio::time::Instant::now();
    let mut notices = Vec::with_capacity(tickets.len());
    for ticket in tickets {
        let remaining = timeout.saturating_sub(started.elapsed());
        notices.push(ticket.wait(remaining, cancel).await);
    }
    notices
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_wait_receives_notice() {
        let (ticket, tx) = TaskTicket::new(Uuid::new_v4());
        let notice = TaskNotice {
            task_id: ticket.task_id,
            result: TaskResult::success(Uuid::new_v4(), vec![], 1),
        };
        tx.send(notice.clone()).unwrap();
        let received = ticket
            .wait(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(received, notice);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let (ticket, _tx) = TaskTicket::new(Uuid::new_v4());
        let err = ticket
            .wait(Duration::from_millis(10), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TrustmeshError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let (ticket, _tx) = TaskTicket::new(Uuid::new_v4());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ticket.wait(Duration::from_secs(10), &cancel).await.unwrap_err();
        assert!(matches!(err, TrustmeshError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_wait_all_keeps_order_and_reports_stragglers() {
        let (first, first_tx) = TaskTicket::new(Uuid::new_v4());
        let (slow, _slow_tx) = TaskTicket::new(Uuid::new_v4());
        let (last, last_tx) = TaskTicket::new(Uuid::new_v4());
        let (first_id, last_id) = (first.task_id, last.task_id);
        first_tx
            .send(TaskNotice {
                task_id: first_id,
                result: TaskResult::success(Uuid::new_v4(), vec![], 1),
            })
            .unwrap();
        last_tx
            .send(TaskNotice {
                task_id: last_id,
                result: TaskResult::failure(TaskState::Failed, None, "bad input", 1),
            })
            .unwrap();

        let started = tokio::time::Instant::now();
        let results = wait_all(
            vec![first, slow, last],
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await;
        assert!(started.elapsed() < Duration::from_secs(1), "one shared timeout");

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().state(), TaskState::Completed);
        assert!(matches!(results[1], Err(TrustmeshError::Timeout(_))));
        let last = results[2].as_ref().expect("arrived before the wait ran out");
        assert_eq!(last.task_id, last_id);
        assert_eq!(last.state(), TaskState::Failed);
    }
}
