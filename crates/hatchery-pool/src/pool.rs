//! The pool manager — sizing, dispatch, and lifecycle.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ProcessPool                           │
//! │  submit() ──▶ [pending queue] ──▶ dispatcher task            │
//! │                                       │ offer head           │
//! │                  ┌────────────────────┼──────────────┐       │
//! │                  ▼                    ▼              ▼       │
//! │             ProcessShell         ProcessShell   ProcessShell │
//! │             (child + pumps)      ...            ...          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The dispatcher offers the queue head to ready shells one at a time.
//! Acceptance is a rendezvous over a per-attempt oneshot channel: the
//! submission's `on_started_processing` fires `true` the moment a shell
//! commits, and the attempt wrapper fires `false` when the shell
//! declines, so a submission can never be double-assigned.
//!
//! Sizing follows `clamp(max(min, executing + queued + reserve), 0, max)`
//! and is re-evaluated on submission arrival, shell termination, and
//! every dispatch pass. Shells are never culled to shrink the pool;
//! shrinkage happens only through each shell's own idle timeout.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::process::Child;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hatchery_types::{BoxError, PoolConfig, PoolError, PoolStats, ShellId, ShellState, Submission};

use crate::manager::{ProcessManager, ProcessManagerFactory};
use crate::shell::{ProcessShell, ShellConsole, ShellOptions};
use crate::submission::{InternalSubmission, SubmissionHandle};

/// A warm pool of interactive child processes.
///
/// Construction blocks until the initial shells (the greater of
/// `min_size` and `reserve_size`) have started up. Submissions are
/// queued FIFO and dispatched to idle shells; results surface through
/// [`SubmissionHandle`]s.
pub struct ProcessPool {
    shared: Arc<PoolShared>,
    dispatcher: JoinHandle<()>,
}

#[derive(Default)]
struct PoolIndex {
    all: HashMap<ShellId, ProcessShell>,
    ready: HashSet<ShellId>,
    /// Spawns decided but not yet inserted; counted so concurrent sizing
    /// passes cannot overshoot `max_size`.
    pending_spawns: usize,
}

enum StartupEvent {
    Ready,
    Failed,
}

pub(crate) struct PoolShared {
    /// Self-reference handed to shells and submissions; a dead pool
    /// reads as closed.
    weak: Weak<PoolShared>,
    config: PoolConfig,
    factory: Box<dyn ProcessManagerFactory>,
    index: Mutex<PoolIndex>,
    queue: Mutex<VecDeque<Arc<InternalSubmission>>>,
    queue_wake: Arc<Notify>,
    drained: Notify,
    executing: AtomicUsize,
    closing: AtomicBool,
    next_shell_id: AtomicU64,
    /// Present only during construction; carries start-up progress.
    startup: Mutex<Option<mpsc::UnboundedSender<StartupEvent>>>,
}

impl ProcessPool {
    /// Build a pool and wait for its initial shells to become ready.
    pub async fn new(
        factory: impl ProcessManagerFactory + 'static,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let (startup_tx, mut startup_rx) = mpsc::unbounded_channel();
        let shared = Arc::new_cyclic(|weak| PoolShared {
            weak: weak.clone(),
            config,
            factory: Box::new(factory),
            index: Mutex::new(PoolIndex::default()),
            queue: Mutex::new(VecDeque::new()),
            queue_wake: Arc::new(Notify::new()),
            drained: Notify::new(),
            executing: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            next_shell_id: AtomicU64::new(1),
            startup: Mutex::new(Some(startup_tx)),
        });

        let initial = shared.config.initial_size();
        for _ in 0..initial {
            shared.reserve_slot();
            if let Err(e) = shared.spawn_shell() {
                shared.close_and_drain().await;
                return Err(e);
            }
        }
        let mut ready = 0;
        while ready < initial {
            match startup_rx.recv().await {
                Some(StartupEvent::Ready) => ready += 1,
                Some(StartupEvent::Failed) | None => {
                    shared.close_and_drain().await;
                    return Err(PoolError::Spawn(io::Error::other(
                        "a pooled process exited during start-up",
                    )));
                }
            }
        }
        *shared.startup.lock().expect("startup lock") = None;

        let dispatcher = tokio::spawn(dispatch_loop(shared.clone()));
        Ok(Self { shared, dispatcher })
    }

    /// Queue a submission for execution on any idle shell.
    ///
    /// Returns a handle resolving to the submission's total latency
    /// (queue delay plus execution time).
    pub fn submit(
        &self,
        submission: impl Submission + 'static,
    ) -> Result<SubmissionHandle, PoolError> {
        self.submit_shared(Arc::new(submission))
    }

    fn submit_shared(&self, submission: Arc<dyn Submission>) -> Result<SubmissionHandle, PoolError> {
        let shared = &self.shared;
        if shared.is_closing() {
            return Err(PoolError::Closed);
        }
        if submission.commands().is_empty() {
            return Err(PoolError::InvalidConfig(
                "a submission must contain at least one command".into(),
            ));
        }
        let sub = InternalSubmission::new(submission, Arc::downgrade(shared));
        let handle = SubmissionHandle::new(sub.clone(), Arc::downgrade(shared));
        shared.queue.lock().expect("queue lock").push_back(sub.clone());
        shared.queue_wake.notify_one();
        shared.ensure_capacity();
        // Shutdown may have raced the enqueue past its queue drain.
        if shared.is_closing() {
            shared.remove_queued(&sub);
            if sub.claim_cancel_queued() {
                sub.resolve_cancelled();
                return Err(PoolError::Closed);
            }
            if !sub.is_started() {
                // The shutdown drain claimed and cancelled it first.
                return Err(PoolError::Closed);
            }
            // A shell accepted the submission before the close took
            // effect; hand back the handle so the result stays
            // observable.
        }
        Ok(handle)
    }

    /// Shut the pool down: refuse new submissions, cancel queued ones,
    /// terminate every shell, and wait for the children to be reaped.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        shared.closing.store(true, Ordering::SeqCst);
        shared.queue_wake.notify_one();

        let pending: Vec<_> = shared
            .queue
            .lock()
            .expect("queue lock")
            .drain(..)
            .collect();
        for sub in pending {
            // Entries already started resolve through their execution.
            if sub.claim_cancel_queued() {
                sub.resolve_cancelled();
            }
        }

        let shells: Vec<ProcessShell> = {
            let index = shared.index.lock().expect("index lock");
            index.all.values().cloned().collect()
        };
        for shell in shells {
            shell.request_terminate();
        }
        shared.wait_drained().await;
        debug!("pool shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been initiated.
    pub fn is_shut_down(&self) -> bool {
        self.shared.is_closing()
    }

    /// Number of live shells.
    pub fn shell_count(&self) -> usize {
        self.shared.index.lock().expect("index lock").all.len()
    }

    /// Number of submissions waiting in the queue.
    pub fn queued_count(&self) -> usize {
        self.shared.queue.lock().expect("queue lock").len()
    }

    /// A point-in-time occupancy snapshot.
    pub fn stats(&self) -> PoolStats {
        let (shells, ready) = {
            let index = self.shared.index.lock().expect("index lock");
            let ready = index
                .all
                .values()
                .filter(|shell| shell.state() == ShellState::Ready)
                .count();
            (index.all.len(), ready)
        };
        PoolStats {
            shells,
            ready,
            queued: self.queued_count(),
            executing: self.shared.executing.load(Ordering::SeqCst),
        }
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        // Best-effort teardown for pools dropped without shutdown().
        if !self.shared.is_closing() {
            self.shared.closing.store(true, Ordering::SeqCst);
            self.shared.queue_wake.notify_one();
            let pending: Vec<_> = self
                .shared
                .queue
                .lock()
                .expect("queue lock")
                .drain(..)
                .collect();
            for sub in pending {
                if sub.claim_cancel_queued() {
                    sub.resolve_cancelled();
                }
            }
            let index = self.shared.index.lock().expect("index lock");
            for shell in index.all.values() {
                shell.request_terminate();
            }
        }
        self.dispatcher.abort();
    }
}

impl PoolShared {
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn submission_started(&self) {
        self.executing.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn submission_finished(&self) {
        self.executing.fetch_sub(1, Ordering::SeqCst);
    }

    /// Drop a submission from the queue. Returns whether it was present.
    pub(crate) fn remove_queued(&self, sub: &Arc<InternalSubmission>) -> bool {
        let mut queue = self.queue.lock().expect("queue lock");
        let before = queue.len();
        queue.retain(|queued| !Arc::ptr_eq(queued, sub));
        let removed = before != queue.len();
        if removed {
            self.queue_wake.notify_one();
        }
        removed
    }

    /// Spawn shells until the sizing rule is satisfied (or a spawn
    /// fails, which is retried on the next demand change).
    fn ensure_capacity(&self) {
        if self.is_closing() {
            return;
        }
        loop {
            {
                let mut index = self.index.lock().expect("index lock");
                let queued = self.queue.lock().expect("queue lock").len();
                let executing = self.executing.load(Ordering::SeqCst);
                let desired = self.config.desired_size(executing, queued);
                if index.all.len() + index.pending_spawns >= desired {
                    return;
                }
                index.pending_spawns += 1;
            }
            if self.spawn_shell().is_err() {
                return;
            }
        }
    }

    fn reserve_slot(&self) {
        self.index.lock().expect("index lock").pending_spawns += 1;
    }

    /// Start one shell against a previously reserved slot.
    fn spawn_shell(&self) -> Result<(), PoolError> {
        let id = ShellId(self.next_shell_id.fetch_add(1, Ordering::SeqCst));
        let manager = self.factory.new_process_manager();
        let adapter = Arc::new(PooledManager {
            inner: manager,
            pool: self.weak.clone(),
            shell_id: id,
            started: AtomicBool::new(false),
        });
        let opts = ShellOptions {
            charset: self.config.charset,
            keep_alive: self.config.effective_keep_alive(),
            wake: self.queue_wake.clone(),
        };
        match ProcessShell::start(id, adapter, opts) {
            Ok(shell) => {
                let mut index = self.index.lock().expect("index lock");
                index.pending_spawns = index.pending_spawns.saturating_sub(1);
                index.all.insert(id, shell);
                debug!(shell = %id, "spawned pooled process");
                Ok(())
            }
            Err(e) => {
                let mut index = self.index.lock().expect("index lock");
                index.pending_spawns = index.pending_spawns.saturating_sub(1);
                warn!(shell = %id, error = %e, "failed to spawn pooled process");
                Err(e)
            }
        }
    }

    fn shell_ready(&self, id: ShellId) {
        self.index.lock().expect("index lock").ready.insert(id);
        if let Some(tx) = self.startup.lock().expect("startup lock").as_ref() {
            let _ = tx.send(StartupEvent::Ready);
        }
        self.queue_wake.notify_one();
    }

    fn shell_terminated(&self, id: ShellId, started: bool) {
        {
            let mut index = self.index.lock().expect("index lock");
            index.ready.remove(&id);
            index.all.remove(&id);
        }
        if !started {
            if let Some(tx) = self.startup.lock().expect("startup lock").as_ref() {
                let _ = tx.send(StartupEvent::Failed);
            }
        }
        self.ensure_capacity();
        self.drained.notify_waiters();
        self.queue_wake.notify_one();
    }

    async fn close_and_drain(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let shells: Vec<ProcessShell> = {
            let index = self.index.lock().expect("index lock");
            index.all.values().cloned().collect()
        };
        for shell in shells {
            shell.request_terminate();
        }
        self.wait_drained().await;
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.index.lock().expect("index lock").all.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Wraps the client's manager so the pool can maintain its indices and
/// the start-up latch around the client's callbacks, without the client
/// being aware.
struct PooledManager {
    inner: Box<dyn ProcessManager>,
    pool: Weak<PoolShared>,
    shell_id: ShellId,
    started: AtomicBool,
}

#[async_trait]
impl ProcessManager for PooledManager {
    fn start_process(&self) -> io::Result<Child> {
        self.inner.start_process()
    }

    fn starts_up_instantly(&self) -> bool {
        self.inner.starts_up_instantly()
    }

    fn is_started_up(&self, line: &str, stdout: bool) -> bool {
        self.inner.is_started_up(line, stdout)
    }

    async fn on_startup(&self, shell: &mut ShellConsole<'_>) -> Result<(), BoxError> {
        // Delegate first: client priming completes before the shell is
        // published, so externally submitted work cannot run ahead of it.
        self.inner.on_startup(shell).await?;
        self.started.store(true, Ordering::SeqCst);
        if let Some(pool) = self.pool.upgrade() {
            pool.shell_ready(self.shell_id);
        }
        Ok(())
    }

    async fn terminate(&self, shell: &mut ShellConsole<'_>) -> Result<bool, BoxError> {
        self.inner.terminate(shell).await
    }

    async fn on_termination(&self, exit_code: Option<i32>) {
        // De-index first, then delegate.
        if let Some(pool) = self.pool.upgrade() {
            pool.shell_terminated(self.shell_id, self.started.load(Ordering::SeqCst));
        }
        self.inner.on_termination(exit_code).await;
    }
}

/// The dispatcher: offers the queue head to ready shells until one
/// commits.
async fn dispatch_loop(shared: Arc<PoolShared>) {
    debug!("dispatcher started");
    loop {
        if shared.is_closing() {
            return;
        }

        let (head, dropped) = {
            let mut queue = shared.queue.lock().expect("queue lock");
            let mut dropped = Vec::new();
            let head = loop {
                match queue.front() {
                    None => break None,
                    Some(sub) => {
                        if sub.is_cancelled() && sub.claim_cancel_queued() {
                            dropped.push(queue.pop_front().expect("queue head"));
                        } else {
                            break Some(sub.clone());
                        }
                    }
                }
            };
            (head, dropped)
        };
        for sub in dropped {
            sub.resolve_cancelled();
        }

        let Some(sub) = head else {
            shared.queue_wake.notified().await;
            continue;
        };

        let candidates: Vec<ProcessShell> = {
            let index = shared.index.lock().expect("index lock");
            index
                .ready
                .iter()
                .filter_map(|id| index.all.get(id))
                .filter(|shell| shell.state() == ShellState::Ready)
                .cloned()
                .collect()
        };

        let mut handled = false;
        for shell in candidates {
            let (ack_tx, ack_rx) = oneshot::channel();
            sub.arm_ack(ack_tx);
            tokio::spawn(run_attempt(shell, sub.clone(), shared.clone()));
            let committed = matches!(ack_rx.await, Ok(true));
            if committed || sub.is_done() {
                shared.remove_queued(&sub);
                handled = true;
                break;
            }
            // The shell turned non-ready between the snapshot and the
            // attempt; forward the opportunity to the next one.
        }

        shared.ensure_capacity();

        if !handled {
            shared.queue_wake.notified().await;
        }
    }
}

/// One execute attempt, detached so the dispatcher can move on as soon
/// as the acceptance rendezvous fires.
async fn run_attempt(shell: ProcessShell, sub: Arc<InternalSubmission>, shared: Arc<PoolShared>) {
    let result = shell.execute_with_cancel(&*sub, Some(sub.token())).await;
    match result {
        Ok(true) => {
            if shared.config.verbose {
                if let Some((queue_delay, execution)) = sub.timings() {
                    info!(
                        shell = %shell.id(),
                        queue_delay_ms = queue_delay.as_millis() as u64,
                        execution_ms = execution.as_millis() as u64,
                        "submission processed"
                    );
                }
            }
        }
        Ok(false) => sub.send_ack(false),
        Err(e) => {
            debug!(shell = %shell.id(), error = %e, "submission failed");
            // Settle before releasing the rendezvous so the dispatcher
            // sees a resolved submission and does not re-offer it.
            sub.settle_failure(&e);
            sub.send_ack(false);
        }
    }
    shared.queue_wake.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hatchery_types::{SimpleCommand, SimpleSubmission};

    use crate::manager::SimpleProcessManager;

    fn cat_factory() -> impl ProcessManagerFactory {
        SimpleProcessManager::new("cat").into_factory()
    }

    fn echo(line: &'static str) -> SimpleSubmission {
        SimpleSubmission::single(SimpleCommand::new(line, move |l| l == line))
    }

    #[tokio::test]
    async fn constructor_waits_for_initial_shells() {
        let pool = ProcessPool::new(cat_factory(), PoolConfig::fixed(2))
            .await
            .unwrap();
        let stats = pool.stats();
        assert_eq!(stats.shells, 2);
        assert_eq!(stats.ready, 2);
        pool.shutdown().await;
        assert_eq!(pool.shell_count(), 0);
    }

    #[tokio::test]
    async fn submissions_round_trip_through_cat() {
        let pool = ProcessPool::new(cat_factory(), PoolConfig::fixed(1))
            .await
            .unwrap();
        for _ in 0..5 {
            let handle = pool.submit(echo("ping")).unwrap();
            let latency = handle.wait().await.unwrap();
            assert!(latency > Duration::ZERO);
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_submissions_share_the_pool() {
        let pool = std::sync::Arc::new(
            ProcessPool::new(cat_factory(), PoolConfig::elastic(0, 4, 0))
                .await
                .unwrap(),
        );
        let handles: Vec<_> = (0..8)
            .map(|i| pool.submit(echo(if i % 2 == 0 { "even" } else { "odd" })).unwrap())
            .collect();
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert!(pool.shell_count() <= 4);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn empty_pool_spawns_on_demand() {
        let pool = ProcessPool::new(cat_factory(), PoolConfig::elastic(0, 2, 0))
            .await
            .unwrap();
        assert_eq!(pool.shell_count(), 0);
        let handle = pool.submit(echo("hello")).unwrap();
        handle.wait().await.unwrap();
        assert!(pool.shell_count() >= 1);
        pool.shutdown().await;
    }
}
