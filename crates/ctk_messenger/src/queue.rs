//! Durable job queue.
//!
//! Every unit of send/receive work is persisted (encrypted) before it
//! becomes runnable, so a crash between enqueue and execution loses nothing
//! and a retried send re-emits the identical envelope. One task executes at
//! a time per queue; tasks may enqueue further tasks, which append to the
//! tail.
//!
//! Scheduling rules, in order:
//!   1. skip jobs whose `delayed_until` is in the future
//!   2. prefer the head, but a background job yields to any runnable
//!      foreground job
//!   3. when only future-delayed jobs remain, sleep until the earliest one
//!   4. a task requiring connectivity while the transport is down fails with
//!      `Offline` and goes through its retry policy like any other failure

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ctk_proto::{DeviceId, Envelope, MultiRecipientEnvelope, Username};
use ctk_store::{JobRow, MessengerStore, StoreKey};

use crate::error::MessengerError;
use crate::messenger::{CypherMessenger, MessengerInner};

/// Fixed requeue delay for `RetryMode::Always` failures.
const ALWAYS_RETRY_DELAY_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Lowest,
    Lower,
    Normal,
    Higher,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Swallow the failure (after the `on_delayed` hook) and drop the job.
    Never,
    /// Requeue with a fixed delay, forever.
    Always,
    /// Requeue after `delay_secs`, cancelling once `max_attempts` is reached.
    RetryAfter {
        delay_secs: u64,
        max_attempts: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Received,
    Read,
}

// ── Tasks ────────────────────────────────────────────────────────────────────

/// Ship one pre-built envelope to one device. The envelope is sealed at
/// enqueue time so retries emit byte-identical traffic under the same
/// message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageTask {
    pub envelope: Envelope,
    pub recipient: Username,
    pub recipient_device: DeviceId,
    /// Local chat message whose delivery state tracks this send.
    pub local_message_id: Option<Uuid>,
    pub retry: RetryMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMultiRecipientTask {
    pub envelope: MultiRecipientEnvelope,
    pub local_message_id: Option<Uuid>,
    pub retry: RetryMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveMessageTask {
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveMultiRecipientTask {
    pub envelope: MultiRecipientEnvelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceiptTask {
    pub kind: ReceiptKind,
    pub remote_id: String,
    pub to: Username,
    pub retry: RetryMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoredTask {
    SendMessage(SendMessageTask),
    SendMultiRecipient(SendMultiRecipientTask),
    ReceiveMessage(ReceiveMessageTask),
    ReceiveMultiRecipient(ReceiveMultiRecipientTask),
    SendReceipt(SendReceiptTask),
}

impl StoredTask {
    pub fn requires_connectivity(&self) -> bool {
        matches!(
            self,
            StoredTask::SendMessage(_)
                | StoredTask::SendMultiRecipient(_)
                | StoredTask::SendReceipt(_)
        )
    }

    pub fn retry_mode(&self) -> RetryMode {
        match self {
            StoredTask::SendMessage(task) => task.retry,
            StoredTask::SendMultiRecipient(task) => task.retry,
            StoredTask::SendReceipt(task) => task.retry,
            // A failed decrypt is fatal for the affected envelope.
            StoredTask::ReceiveMessage(_) | StoredTask::ReceiveMultiRecipient(_) => {
                RetryMode::Never
            }
        }
    }

    pub fn priority(&self) -> TaskPriority {
        match self {
            StoredTask::ReceiveMessage(_) | StoredTask::ReceiveMultiRecipient(_) => {
                TaskPriority::Higher
            }
            StoredTask::SendMessage(_) | StoredTask::SendMultiRecipient(_) => TaskPriority::Normal,
            StoredTask::SendReceipt(_) => TaskPriority::Lower,
        }
    }

    pub fn is_background(&self) -> bool {
        matches!(self, StoredTask::SendReceipt(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            StoredTask::SendMessage(_) => "send_message",
            StoredTask::SendMultiRecipient(_) => "send_multi_recipient",
            StoredTask::ReceiveMessage(_) => "receive_message",
            StoredTask::ReceiveMultiRecipient(_) => "receive_multi_recipient",
            StoredTask::SendReceipt(_) => "send_receipt",
        }
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub task: StoredTask,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: u32,
    pub delayed_until: Option<DateTime<Utc>>,
}

impl Job {
    fn new(task: StoredTask) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            scheduled_at: Utc::now(),
            attempts: 0,
            delayed_until: None,
        }
    }

    fn runnable_at(&self, now: DateTime<Utc>) -> bool {
        self.delayed_until.map_or(true, |until| until <= now)
    }
}

enum Selection {
    Run(usize),
    WaitUntil(DateTime<Utc>),
    Empty,
}

fn select_job(jobs: &VecDeque<Job>, now: DateTime<Utc>) -> Selection {
    let head = jobs.iter().position(|job| job.runnable_at(now));
    match head {
        Some(index) => {
            if jobs[index].task.is_background() {
                // A foreground job anywhere in the queue takes precedence.
                if let Some(foreground) = jobs
                    .iter()
                    .position(|job| job.runnable_at(now) && !job.task.is_background())
                {
                    return Selection::Run(foreground);
                }
            }
            Selection::Run(index)
        }
        None => match jobs.iter().filter_map(|job| job.delayed_until).min() {
            Some(earliest) => Selection::WaitUntil(earliest),
            None => Selection::Empty,
        },
    }
}

// ── Queue ────────────────────────────────────────────────────────────────────

pub(crate) struct JobQueue {
    store: Arc<dyn MessengerStore>,
    store_key: StoreKey,
    jobs: parking_lot::Mutex<VecDeque<Job>>,
    notify: Notify,
    paused: AtomicBool,
    worker_running: AtomicBool,
    idle_tx: watch::Sender<bool>,
    idle_rx: watch::Receiver<bool>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn MessengerStore>, store_key: StoreKey) -> Self {
        let (idle_tx, idle_rx) = watch::channel(true);
        Self {
            store,
            store_key,
            jobs: parking_lot::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            paused: AtomicBool::new(false),
            worker_running: AtomicBool::new(false),
            idle_tx,
            idle_rx,
        }
    }

    /// Load persisted jobs, oldest `scheduled_at` first.
    pub async fn load_persisted(&self) -> Result<usize, MessengerError> {
        let rows = self.store.list_jobs().await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            match self.store_key.open_value::<Job>(&row.blob) {
                Ok(job) => jobs.push(job),
                Err(error) => {
                    warn!(job = %row.id, %error, "dropping undecodable job row");
                    self.store.remove_job(row.id).await?;
                }
            }
        }
        jobs.sort_by_key(|job| job.scheduled_at);
        let count = jobs.len();
        let mut queue = self.jobs.lock();
        queue.clear();
        queue.extend(jobs);
        if count > 0 {
            let _ = self.idle_tx.send(false);
        }
        Ok(count)
    }

    /// Persist a task, then make it runnable. Safe to call from inside an
    /// executing task.
    pub async fn queue_task(&self, task: StoredTask) -> Result<Uuid, MessengerError> {
        let job = Job::new(task);
        let row = JobRow { id: job.id, blob: self.store_key.seal_value(&job)? };
        self.store.create_job(row).await?;
        debug!(job = %job.id, task = job.task.label(), "job queued");

        let id = job.id;
        self.jobs.lock().push_back(job);
        let _ = self.idle_tx.send(false);
        self.notify.notify_one();
        Ok(id)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Un-gate the scheduler and make sure a worker is running.
    pub fn resume(self: &Arc<Self>, messenger: Weak<MessengerInner>) {
        self.paused.store(false, Ordering::SeqCst);
        if !self.worker_running.swap(true, Ordering::SeqCst) {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.run(messenger).await;
                queue.worker_running.store(false, Ordering::SeqCst);
            });
        }
        self.notify.notify_one();
    }

    /// Resolves when no runnable job remains (queue empty or all delayed).
    pub async fn await_done_processing(&self) {
        let mut rx = self.idle_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.lock().len()
    }

    // ── Worker ───────────────────────────────────────────────────────────

    async fn run(self: &Arc<Self>, messenger: Weak<MessengerInner>) {
        loop {
            if messenger.strong_count() == 0 {
                return;
            }
            if self.paused.load(Ordering::SeqCst) {
                let _ = self.idle_tx.send(true);
                self.notify.notified().await;
                continue;
            }

            let now = Utc::now();
            let selection = select_job(&self.jobs.lock(), now);
            match selection {
                Selection::Empty => {
                    let _ = self.idle_tx.send(true);
                    self.notify.notified().await;
                }
                Selection::WaitUntil(earliest) => {
                    let _ = self.idle_tx.send(true);
                    let wait = (earliest - now).to_std().unwrap_or_default();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                Selection::Run(index) => {
                    let job = {
                        let mut jobs = self.jobs.lock();
                        match jobs.remove(index) {
                            Some(job) => job,
                            None => continue,
                        }
                    };
                    let _ = self.idle_tx.send(false);
                    let Some(inner) = messenger.upgrade() else {
                        return;
                    };
                    let messenger = CypherMessenger::from_inner(inner);
                    self.execute(job, &messenger).await;
                }
            }
        }
    }

    async fn execute(&self, job: Job, messenger: &CypherMessenger) {
        let label = job.task.label();

        let result = if job.task.requires_connectivity()
            && !messenger.connectivity_for(&job.task)
        {
            Err(MessengerError::Offline)
        } else {
            job.task.execute(messenger).await
        };

        match result {
            Ok(()) => {
                info!(job = %job.id, task = label, "job succeeded");
                if let Err(error) = self.store.remove_job(job.id).await {
                    warn!(job = %job.id, %error, "failed to remove finished job");
                }
            }
            Err(error) => {
                warn!(job = %job.id, task = label, %error, "job failed");
                self.handle_failure(job, messenger).await;
            }
        }
    }

    /// Consult the task's retry mode. Failures never escape the scheduler.
    async fn handle_failure(&self, mut job: Job, messenger: &CypherMessenger) {
        job.task.on_delayed(messenger).await;

        match job.task.retry_mode() {
            RetryMode::Never => {
                debug!(job = %job.id, "retry disabled; dropping job");
                if let Err(error) = self.store.remove_job(job.id).await {
                    warn!(job = %job.id, %error, "failed to remove job");
                }
            }
            RetryMode::Always => {
                job.delayed_until =
                    Some(Utc::now() + chrono::Duration::seconds(ALWAYS_RETRY_DELAY_SECS as i64));
                self.requeue(job).await;
            }
            RetryMode::RetryAfter { delay_secs, max_attempts } => {
                job.attempts += 1;
                if max_attempts.is_some_and(|max| job.attempts >= max) {
                    info!(job = %job.id, attempts = job.attempts, "job cancelled after retries");
                    if let Err(error) = self.store.remove_job(job.id).await {
                        warn!(job = %job.id, %error, "failed to remove cancelled job");
                    }
                    return;
                }
                job.delayed_until =
                    Some(Utc::now() + chrono::Duration::seconds(delay_secs as i64));
                self.requeue(job).await;
            }
        }
    }

    async fn requeue(&self, job: Job) {
        match self.store_key.seal_value(&job) {
            Ok(blob) => {
                if let Err(error) = self.store.update_job(JobRow { id: job.id, blob }).await {
                    warn!(job = %job.id, %error, "failed to persist delayed job");
                }
            }
            Err(error) => warn!(job = %job.id, %error, "failed to seal delayed job"),
        }
        self.jobs.lock().push_back(job);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt_job(delayed_secs: Option<i64>) -> Job {
        let mut job = Job::new(StoredTask::SendReceipt(SendReceiptTask {
            kind: ReceiptKind::Received,
            remote_id: "r".into(),
            to: Username::new("alice"),
            retry: RetryMode::Never,
        }));
        job.delayed_until = delayed_secs.map(|s| Utc::now() + chrono::Duration::seconds(s));
        job
    }

    fn receive_job() -> Job {
        let peer = ctk_crypto::AgreementKeyPair::generate();
        let mut state = ctk_crypto::RatchetState::initialize_sender(
            ctk_crypto::RatchetConfig::default(),
            &[3u8; 32],
            peer.public(),
        )
        .unwrap();
        let message = state.encrypt(b"x").unwrap();
        let identity = ctk_crypto::SigningKeyPair::generate();
        let envelope = Envelope::seal(
            "m".into(),
            Username::new("alice"),
            DeviceId::new("d0"),
            &message,
            &identity,
            false,
        )
        .unwrap();
        Job::new(StoredTask::ReceiveMessage(ReceiveMessageTask { envelope }))
    }

    #[test]
    fn background_head_yields_to_foreground() {
        let mut jobs = VecDeque::new();
        jobs.push_back(receipt_job(None));
        jobs.push_back(receive_job());

        match select_job(&jobs, Utc::now()) {
            Selection::Run(index) => assert_eq!(index, 1),
            _ => panic!("expected a runnable job"),
        }
    }

    #[test]
    fn delayed_jobs_are_skipped() {
        let mut jobs = VecDeque::new();
        jobs.push_back(receipt_job(Some(60)));
        jobs.push_back(receive_job());

        match select_job(&jobs, Utc::now()) {
            Selection::Run(index) => assert_eq!(index, 1),
            _ => panic!("expected a runnable job"),
        }
    }

    #[test]
    fn all_delayed_waits_for_earliest() {
        let mut jobs = VecDeque::new();
        jobs.push_back(receipt_job(Some(120)));
        jobs.push_back(receipt_job(Some(60)));

        match select_job(&jobs, Utc::now()) {
            Selection::WaitUntil(until) => {
                let expected = jobs[1].delayed_until.unwrap();
                assert_eq!(until, expected);
            }
            _ => panic!("expected a wait"),
        }
    }

    #[test]
    fn empty_queue_reports_empty() {
        assert!(matches!(select_job(&VecDeque::new(), Utc::now()), Selection::Empty));
    }
}
