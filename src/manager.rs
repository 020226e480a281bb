//! Shared task registry.
//!
//! [`TasksManager`] owns the fixed task list and, behind one mutex, the
//! status and last known result of every task. Connection handlers claim
//! tasks from it and report back; the listener watches it for completion.
//!
//! Per index the state machine is
//! `Pending --claim--> InProgress --report(success)--> Done` and
//! `InProgress --report(failure)--> Pending`. Nothing leaves `Done`.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::TaskError;
use crate::task::{Task, TaskResult};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
}

/// What a connection handler learned about a claimed task.
#[derive(Debug)]
pub enum TaskOutcome {
    /// The worker delivered a result.
    Succeeded(TaskResult),
    /// The exchange broke before a result arrived.
    Failed,
}

/// Counts derived from a status snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ProgressSummary {
    pub total: usize,
    pub done: usize,
    pub in_progress: usize,
}

impl ProgressSummary {
    pub fn from_statuses(statuses: &[TaskStatus]) -> Self {
        statuses.iter().fold(
            ProgressSummary {
                total: statuses.len(),
                ..Default::default()
            },
            |mut summary, status| {
                match status {
                    TaskStatus::Done => summary.done += 1,
                    TaskStatus::InProgress => summary.in_progress += 1,
                    TaskStatus::Pending => {}
                }
                summary
            },
        )
    }

    pub fn pending(&self) -> usize {
        self.total - self.done - self.in_progress
    }

    pub fn is_finished(&self) -> bool {
        self.done == self.total
    }

    /// Fraction of tasks done, `1.0` for an empty task list.
    pub fn done_ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}

impl fmt::Display for ProgressSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} done, {} in progress ({:.2} %)",
            self.done,
            self.total,
            self.in_progress,
            self.done_ratio() * 100.0
        )
    }
}

struct Ledger {
    status: Vec<TaskStatus>,
    results: Vec<Option<TaskResult>>,
}

impl Ledger {
    fn all_done(&self) -> bool {
        self.status.iter().all(|s| *s == TaskStatus::Done)
    }

    fn claim(&mut self) -> Option<usize> {
        let index = self.status.iter().position(|s| *s == TaskStatus::Pending)?;
        self.status[index] = TaskStatus::InProgress;
        Some(index)
    }

    fn expect_claimed(&self, index: usize) {
        assert_eq!(
            self.status[index],
            TaskStatus::InProgress,
            "task {index} reported without being claimed"
        );
    }
}

enum Attempt {
    Claimed(usize),
    Finished,
    Wait,
}

/// Concurrency-safe registry of tasks and their progress.
///
/// The lock only ever guards in-memory transitions. Network and disk I/O
/// happen outside of it, so one slow worker never holds up the others.
pub struct TasksManager {
    tasks: Vec<Task>,
    ledger: Mutex<Ledger>,
    changed: Notify,
}

impl TasksManager {
    pub fn new(tasks: Vec<Task>) -> Self {
        let n = tasks.len();
        Self {
            tasks,
            ledger: Mutex::new(Ledger {
                status: vec![TaskStatus::Pending; n],
                results: vec![None; n],
            }),
            changed: Notify::new(),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, index: usize) -> Option<&Task> {
        self.tasks.get(index)
    }

    /// True once every task is `Done`. Stays true from then on.
    pub fn all_done(&self) -> bool {
        self.ledger().all_done()
    }

    /// Claims the lowest-indexed `Pending` task, if any.
    ///
    /// `None` does not mean the run is over: other tasks may still be
    /// `InProgress` and come back. Check [`all_done`](Self::all_done) or use
    /// [`next_claim`](Self::next_claim).
    pub fn claim_next(&self) -> Option<(usize, &Task)> {
        let index = self.ledger().claim()?;
        Some((index, &self.tasks[index]))
    }

    fn attempt(&self) -> Attempt {
        let mut ledger = self.ledger();
        if ledger.all_done() {
            return Attempt::Finished;
        }
        match ledger.claim() {
            Some(index) => Attempt::Claimed(index),
            None => Attempt::Wait,
        }
    }

    /// Claims the next task, waiting while every remaining task is held by
    /// another handler. Returns `None` once all tasks are done.
    pub async fn next_claim(&self) -> Option<(usize, &Task)> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.attempt() {
                Attempt::Claimed(index) => return Some((index, &self.tasks[index])),
                Attempt::Finished => return None,
                Attempt::Wait => notified.await,
            }
        }
    }

    /// Resolves once every task is done.
    pub async fn wait_all_done(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.all_done() {
                return;
            }
            notified.await;
        }
    }

    /// Records the outcome of a claimed task.
    ///
    /// A failure puts the task back in the pool. A success is first persisted
    /// through [`Task::save_result`] while the task is still held, and only
    /// then marked `Done`. If persisting fails the task goes back to
    /// `Pending` and the error is returned.
    ///
    /// # Panics
    /// If `index` is not currently `InProgress`.
    pub async fn report(&self, index: usize, outcome: TaskOutcome) -> Result<(), TaskError> {
        self.ledger().expect_claimed(index);

        let result = match outcome {
            TaskOutcome::Failed => {
                self.release(index);
                warn!(task = index, "task returned to the pool");
                return Ok(());
            }
            TaskOutcome::Succeeded(result) => result,
        };

        match self.tasks[index].save_result(result).await {
            Ok(saved) => {
                let progress = {
                    let mut ledger = self.ledger();
                    ledger.expect_claimed(index);
                    ledger.status[index] = TaskStatus::Done;
                    ledger.results[index] = Some(saved);
                    ProgressSummary::from_statuses(&ledger.status)
                };
                self.changed.notify_waiters();
                info!(task = index, %progress, "task done");
                Ok(())
            }
            Err(e) => {
                self.release(index);
                Err(e)
            }
        }
    }

    fn release(&self, index: usize) {
        {
            let mut ledger = self.ledger();
            ledger.expect_claimed(index);
            ledger.status[index] = TaskStatus::Pending;
        }
        self.changed.notify_waiters();
    }

    pub fn status_snapshot(&self) -> Vec<TaskStatus> {
        self.ledger().status.clone()
    }

    pub fn progress(&self) -> ProgressSummary {
        ProgressSummary::from_statuses(&self.ledger().status)
    }

    /// Last result accepted for `index`.
    pub fn result(&self, index: usize) -> Option<TaskResult> {
        self.ledger().results.get(index).cloned().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::task::TaskKind;

    fn manager(n: usize) -> TasksManager {
        TasksManager::new(
            (0..n)
                .map(|i| Task::new(format!("echo {i}"), TaskKind::StandardOutput))
                .collect(),
        )
    }

    fn text(s: &str) -> TaskOutcome {
        TaskOutcome::Succeeded(TaskResult::Text(s.to_string()))
    }

    #[test]
    fn empty_task_list_is_done() {
        let m = manager(0);
        assert!(m.all_done());
        assert!(m.claim_next().is_none());
        assert!(m.progress().is_finished());
    }

    #[test]
    fn claims_lowest_index_first() {
        let m = manager(3);
        let claimed: Vec<usize> = std::iter::from_fn(|| m.claim_next().map(|(i, _)| i)).collect();
        assert_eq!(claimed, [0, 1, 2]);
        assert!(!m.all_done());
        assert_eq!(
            m.progress(),
            ProgressSummary {
                total: 3,
                done: 0,
                in_progress: 3
            }
        );
    }

    #[tokio::test]
    async fn failed_task_is_claimable_again_and_result_untouched() {
        let m = manager(2);
        let (first, _) = m.claim_next().unwrap();
        m.report(first, text("first\n")).await.unwrap();

        let (second, _) = m.claim_next().unwrap();
        assert_eq!(second, 1);
        m.report(second, TaskOutcome::Failed).await.unwrap();

        assert_eq!(m.status_snapshot(), [TaskStatus::Done, TaskStatus::Pending]);
        assert_eq!(m.result(1), None);
        assert_eq!(m.claim_next().map(|(i, _)| i), Some(1));
    }

    #[tokio::test]
    async fn done_is_monotonic() {
        let m = manager(2);
        while let Some((i, _)) = m.claim_next() {
            m.report(i, text("ok")).await.unwrap();
        }
        assert!(m.all_done());
        assert!(m.claim_next().is_none());
        assert!(m.next_claim().await.is_none());
        assert!(m.all_done());
        assert_eq!(m.result(0), Some(TaskResult::Text("ok".into())));
    }

    #[tokio::test]
    #[should_panic(expected = "without being claimed")]
    async fn reporting_unclaimed_task_panics() {
        let m = manager(1);
        let _ = m.report(0, TaskOutcome::Failed).await;
    }

    #[tokio::test]
    async fn failed_save_returns_task_to_pool() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("missing").join("out.txt");
        let m = TasksManager::new(vec![
            Task::new("echo 0", TaskKind::StandardOutput).with_destination(&bad),
        ]);

        let (i, _) = m.claim_next().unwrap();
        assert!(m.report(i, text("0\n")).await.is_err());
        assert_eq!(m.status_snapshot(), [TaskStatus::Pending]);
        assert!(!m.all_done());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_overlap() {
        const TASKS: usize = 200;
        const CLAIMERS: usize = 16;

        let m = Arc::new(manager(TASKS));
        let mut handles = Vec::new();
        for _ in 0..CLAIMERS {
            let m = Arc::clone(&m);
            handles.push(tokio::spawn(async move {
                let mut held = Vec::new();
                while let Some((i, _)) = m.claim_next() {
                    held.push(i);
                    tokio::task::yield_now().await;
                }
                held
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for i in handle.await.unwrap() {
                assert!(seen.insert(i), "task {i} claimed twice");
            }
        }
        assert_eq!(seen.len(), TASKS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiting_claimer_wakes_when_task_is_released() {
        let m = Arc::new(manager(1));
        let (i, _) = m.claim_next().unwrap();

        let waiter = {
            let m = Arc::clone(&m);
            tokio::spawn(async move { m.next_claim().await.map(|(i, _)| i) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        m.report(i, TaskOutcome::Failed).await.unwrap();
        let reclaimed = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed, Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_see_completion() {
        let m = Arc::new(manager(1));
        let (i, _) = m.claim_next().unwrap();

        let claimer = {
            let m = Arc::clone(&m);
            tokio::spawn(async move { m.next_claim().await.is_none() })
        };
        let watcher = {
            let m = Arc::clone(&m);
            tokio::spawn(async move { m.wait_all_done().await })
        };

        m.report(i, text("0\n")).await.unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(5), claimer)
            .await
            .unwrap()
            .unwrap();
        assert!(finished);
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn summary_counts_statuses() {
        let summary = ProgressSummary::from_statuses(&[
            TaskStatus::Done,
            TaskStatus::InProgress,
            TaskStatus::Pending,
            TaskStatus::Done,
        ]);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.done, 2);
        assert_eq!(summary.in_progress, 1);
        assert_eq!(summary.pending(), 1);
        assert_eq!(summary.to_string(), "2/4 done, 1 in progress (50.00 %)");
    }
}
