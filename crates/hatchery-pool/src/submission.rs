//! Internal submission bookkeeping and the caller-facing handle.
//!
//! The pool wraps every accepted submission in an [`InternalSubmission`]
//! that layers timing, the acceptance rendezvous, cancellation, and the
//! outcome cell on top of the client's callbacks. The caller gets a
//! [`SubmissionHandle`], a cloneable future-like view over the outcome.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use hatchery_types::{BoxError, Command, PoolError, Submission};

use crate::pool::PoolShared;

/// Cloneable rendering of a failed outcome. `PoolError` itself carries
/// `io::Error` and so cannot live inside a watch cell.
#[derive(Debug, Clone)]
enum FailureRepr {
    Cancelled,
    ProcessExited,
    StreamIo(String),
    Callback(String),
}

impl FailureRepr {
    fn from_error(error: &PoolError) -> Self {
        match error {
            PoolError::Cancelled => FailureRepr::Cancelled,
            PoolError::ProcessExited => FailureRepr::ProcessExited,
            PoolError::StreamIo(e) => FailureRepr::StreamIo(e.to_string()),
            PoolError::Callback(e) => FailureRepr::Callback(e.to_string()),
            other => FailureRepr::Callback(other.to_string()),
        }
    }

    fn to_error(&self) -> PoolError {
        match self {
            FailureRepr::Cancelled => PoolError::Cancelled,
            FailureRepr::ProcessExited => PoolError::ProcessExited,
            FailureRepr::StreamIo(msg) => PoolError::StreamIo(io::Error::other(msg.clone())),
            FailureRepr::Callback(msg) => PoolError::Callback(msg.clone().into()),
        }
    }
}

type Outcome = Result<Duration, FailureRepr>;

// Claim arbitration between the dispatcher starting a submission and a
// cancel racing it out of the queue. Whoever wins the CAS owns the
// submission's fate.
const CLAIM_QUEUED: u8 = 0;
const CLAIM_STARTED: u8 = 1;
const CLAIM_CANCELLED: u8 = 2;

pub(crate) struct InternalSubmission {
    inner: Arc<dyn Submission>,
    pool: Weak<PoolShared>,
    received: Instant,
    submitted: OnceLock<Instant>,
    processed: OnceLock<Instant>,
    claim: AtomicU8,
    slot_taken: AtomicBool,
    slot_released: AtomicBool,
    token: CancellationToken,
    ack: Mutex<Option<oneshot::Sender<bool>>>,
    outcome: watch::Sender<Option<Outcome>>,
}

impl InternalSubmission {
    pub(crate) fn new(inner: Arc<dyn Submission>, pool: Weak<PoolShared>) -> Arc<Self> {
        let (outcome, _) = watch::channel(None);
        Arc::new(Self {
            inner,
            pool,
            received: Instant::now(),
            submitted: OnceLock::new(),
            processed: OnceLock::new(),
            claim: AtomicU8::new(CLAIM_QUEUED),
            slot_taken: AtomicBool::new(false),
            slot_released: AtomicBool::new(false),
            token: CancellationToken::new(),
            ack: Mutex::new(None),
            outcome,
        })
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Arm the acceptance rendezvous for one dispatch attempt.
    pub(crate) fn arm_ack(&self, tx: oneshot::Sender<bool>) {
        *self.ack.lock().expect("ack lock") = Some(tx);
    }

    /// Fire the rendezvous once; later calls are no-ops.
    pub(crate) fn send_ack(&self, accepted: bool) {
        if let Some(tx) = self.ack.lock().expect("ack lock").take() {
            let _ = tx.send(accepted);
        }
    }

    /// Try to pull the submission out of the queued state for
    /// cancellation. Fails if a shell already started it.
    pub(crate) fn claim_cancel_queued(&self) -> bool {
        self.claim
            .compare_exchange(
                CLAIM_QUEUED,
                CLAIM_CANCELLED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Whether a shell has committed to running this submission.
    pub(crate) fn is_started(&self) -> bool {
        self.claim.load(Ordering::SeqCst) == CLAIM_STARTED
    }

    pub(crate) fn is_done(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub(crate) fn resolve_cancelled(&self) {
        self.resolve(Err(FailureRepr::Cancelled));
    }

    /// Record a failed execution: resolves the outcome and returns the
    /// execution slot if one was taken.
    pub(crate) fn settle_failure(&self, error: &PoolError) {
        self.release_slot();
        self.resolve(Err(FailureRepr::from_error(error)));
    }

    /// Queue delay and execution time, once both are known.
    pub(crate) fn timings(&self) -> Option<(Duration, Duration)> {
        let submitted = *self.submitted.get()?;
        let processed = *self.processed.get()?;
        Some((submitted - self.received, processed - submitted))
    }

    fn resolve(&self, outcome: Outcome) {
        let mut outcome = Some(outcome);
        self.outcome.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome.take().expect("outcome set once"));
                true
            } else {
                false
            }
        });
    }

    fn release_slot(&self) {
        if self.slot_taken.load(Ordering::SeqCst) && !self.slot_released.swap(true, Ordering::SeqCst)
        {
            if let Some(pool) = self.pool.upgrade() {
                pool.submission_finished();
            }
        }
    }

    fn duration(&self) -> Duration {
        let processed = self.processed.get().copied().unwrap_or_else(Instant::now);
        processed - self.received
    }
}

impl Submission for InternalSubmission {
    fn commands(&self) -> &[Box<dyn Command>] {
        self.inner.commands()
    }

    fn terminate_process_afterwards(&self) -> bool {
        self.inner.terminate_process_afterwards()
    }

    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
            || self.inner.is_cancelled()
            || self.pool.upgrade().is_none_or(|pool| pool.is_closing())
    }

    fn on_started_processing(&self) -> Result<(), BoxError> {
        // Claim before any side effects so a cancel racing us cannot see
        // both "cancelled" and "started".
        if self
            .claim
            .compare_exchange(
                CLAIM_QUEUED,
                CLAIM_STARTED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(PoolError::Cancelled.into());
        }
        self.inner.on_started_processing()?;
        let _ = self.submitted.set(Instant::now());
        if let Some(pool) = self.pool.upgrade() {
            pool.submission_started();
            self.slot_taken.store(true, Ordering::SeqCst);
        }
        self.send_ack(true);
        Ok(())
    }

    fn on_finished_processing(&self) -> Result<(), BoxError> {
        let result = self.inner.on_finished_processing();
        let _ = self.processed.set(Instant::now());
        self.release_slot();
        if result.is_ok() {
            self.resolve(Ok(self.duration()));
        }
        result
    }
}

/// Caller-facing view of an accepted submission.
///
/// Cloneable; every clone observes the same outcome. The resolved
/// duration is queue delay plus execution time
/// (`processed − received`).
#[derive(Clone)]
pub struct SubmissionHandle {
    sub: Arc<InternalSubmission>,
    pool: Weak<PoolShared>,
    rx: watch::Receiver<Option<Outcome>>,
}

impl SubmissionHandle {
    pub(crate) fn new(sub: Arc<InternalSubmission>, pool: Weak<PoolShared>) -> Self {
        let rx = sub.outcome.subscribe();
        Self { sub, pool, rx }
    }

    /// Wait until the submission completes, fails, or is cancelled.
    pub async fn wait(&self) -> Result<Duration, PoolError> {
        let mut rx = self.rx.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().as_ref() {
                return match outcome {
                    Ok(duration) => Ok(*duration),
                    Err(repr) => Err(repr.to_error()),
                };
            }
            if rx.changed().await.is_err() {
                return Err(PoolError::Closed);
            }
        }
    }

    /// Like [`wait`](Self::wait), with a deadline.
    pub async fn wait_timeout(&self, limit: Duration) -> Result<Duration, PoolError> {
        tokio::time::timeout(limit, self.wait())
            .await
            .map_err(|_| PoolError::WaitTimeout)?
    }

    /// Cancel the submission.
    ///
    /// Removes it from the queue when still queued; once it is running,
    /// cancellation is best-effort: the shell observes it at its next
    /// cancellation point and no further instructions are written. The
    /// child process is never signalled directly. Returns whether the
    /// cancellation took effect.
    pub fn cancel(&self) -> bool {
        if self.sub.is_done() {
            return false;
        }
        self.sub.token.cancel();
        if self.sub.claim_cancel_queued() {
            if let Some(pool) = self.pool.upgrade() {
                pool.remove_queued(&self.sub);
            }
            self.sub.resolve_cancelled();
            return true;
        }
        !self.sub.is_done()
    }

    /// Whether the submission has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        if self.sub.token.is_cancelled() {
            return true;
        }
        matches!(
            self.rx.borrow().as_ref(),
            Some(Err(FailureRepr::Cancelled))
        )
    }

    /// Whether the submission has completed, failed, or been cancelled.
    pub fn is_done(&self) -> bool {
        self.sub.is_done()
    }
}

impl std::fmt::Debug for SubmissionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionHandle")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatchery_types::{SimpleCommand, SimpleSubmission};

    fn internal(submission: SimpleSubmission) -> Arc<InternalSubmission> {
        InternalSubmission::new(Arc::new(submission), Weak::new())
    }

    fn ping() -> SimpleSubmission {
        SimpleSubmission::single(SimpleCommand::new("ping", |l| l == "done"))
    }

    #[tokio::test]
    async fn handle_resolves_after_finish() {
        let sub = internal(ping());
        let handle = SubmissionHandle::new(sub.clone(), Weak::new());
        assert!(!handle.is_done());

        sub.on_started_processing().unwrap();
        sub.on_finished_processing().unwrap();

        let duration = handle.wait().await.unwrap();
        assert!(duration >= Duration::ZERO);
        assert!(handle.is_done());
        assert!(!handle.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_while_queued_resolves_cancelled() {
        let sub = internal(ping());
        let handle = SubmissionHandle::new(sub.clone(), Weak::new());

        assert!(handle.cancel());
        assert!(handle.is_cancelled());
        assert!(matches!(handle.wait().await, Err(PoolError::Cancelled)));
        // A started claim can no longer be taken.
        assert!(sub.on_started_processing().is_err());
        // Cancelling twice reports no further effect.
        assert!(!handle.cancel());
    }

    #[tokio::test]
    async fn started_submission_wins_the_claim_race() {
        let sub = internal(ping());
        let handle = SubmissionHandle::new(sub.clone(), Weak::new());

        sub.on_started_processing().unwrap();
        assert!(!sub.claim_cancel_queued());
        // Best-effort cancel still reports effect (the token is set).
        assert!(handle.cancel());
        assert!(sub.is_cancelled());
    }

    #[tokio::test]
    async fn wait_timeout_expires() {
        let sub = internal(ping());
        let handle = SubmissionHandle::new(sub, Weak::new());
        let result = handle.wait_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(PoolError::WaitTimeout)));
    }

    #[tokio::test]
    async fn acceptance_rendezvous_fires_once() {
        let sub = internal(ping());
        let (tx, rx) = oneshot::channel();
        sub.arm_ack(tx);
        sub.on_started_processing().unwrap();
        assert!(matches!(rx.await, Ok(true)));
        // Second send is a no-op.
        sub.send_ack(false);
    }

    #[tokio::test]
    async fn timing_invariant_holds() {
        let sub = internal(ping());
        sub.on_started_processing().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        sub.on_finished_processing().unwrap();

        let (queue_delay, execution) = sub.timings().unwrap();
        assert!(queue_delay >= Duration::ZERO);
        assert!(execution >= Duration::from_millis(4));
    }
}
