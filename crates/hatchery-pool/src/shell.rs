//! The process shell — owns one child process and executes submissions
//! against it.
//!
//! ```text
//!   NEW ─▶ STARTING ─▶ READY ⇄ BUSY
//!                        │       │
//!                        └──▶ TERMINATING ─▶ TERMINATED
//! ```
//!
//! Each shell runs three tasks: a pump per output stream and a driver.
//! The driver performs the start-up sequence, supervises the idle
//! timeout and spontaneous child death, and runs the reap endgame
//! (`child.wait()` followed by exactly one `on_termination`). Submission
//! execution happens on whatever task calls [`ProcessShell::execute`],
//! serialized by the shell's exec lock; at most one submission runs at a
//! time.
//!
//! Manager callbacks that need to run submissions themselves
//! (`on_startup` priming, orderly `terminate`) receive a
//! [`ShellConsole`] borrowing the already-held exec lock, so they can
//! drive the child without re-entering the lock.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, debug_span, warn};

use hatchery_types::{BoxError, Charset, Command, PoolError, ShellId, ShellState, Submission};

use crate::manager::ProcessManager;
use crate::pump::{LinePump, PumpEvent, StreamKind};

/// Options the pool hands to every shell it creates.
#[derive(Clone)]
pub(crate) struct ShellOptions {
    pub(crate) charset: Charset,
    pub(crate) keep_alive: Option<Duration>,
    /// Notified whenever the shell may have become available for
    /// dispatch.
    pub(crate) wake: Arc<Notify>,
}

enum Control {
    /// Ask the driver to terminate the shell (orderly attempt first).
    Terminate,
    /// The orderly stage is done; reap the child.
    Reap { force: bool },
}

/// How to retire a child.
enum TerminateMode {
    /// Give the manager an orderly attempt; force-kill if it declines.
    Orderly,
    /// Skip the orderly attempt and kill.
    Force,
    /// The child is already gone; just reap it.
    Dead,
}

struct ExecState {
    stdin: Option<ChildStdin>,
    stdout_pump: LinePump,
    stderr_pump: LinePump,
}

struct ShellInner {
    id: ShellId,
    manager: Arc<dyn ProcessManager>,
    opts: ShellOptions,
    /// Every task touching this shell (driver, pumps, executes) runs
    /// inside this span.
    span: Span,
    state: watch::Sender<ShellState>,
    exec: AsyncMutex<ExecState>,
    control: mpsc::UnboundedSender<Control>,
}

/// Handle to a pooled child process. Cheap to clone.
#[derive(Clone)]
pub struct ProcessShell {
    inner: Arc<ShellInner>,
}

/// Outcome of running a submission's command loop.
enum RunError {
    StreamIo(io::Error),
    ProcessExited,
    /// Cancellation seen between commands; nothing is in flight.
    CancelledAtBoundary,
    /// Cancellation interrupted a line wait; the child's response state
    /// is unknown.
    CancelledMidCommand,
    Callback(BoxError),
}

impl RunError {
    fn into_pool_error(self) -> PoolError {
        match self {
            RunError::StreamIo(e) => PoolError::StreamIo(e),
            RunError::ProcessExited => PoolError::ProcessExited,
            RunError::CancelledAtBoundary | RunError::CancelledMidCommand => PoolError::Cancelled,
            RunError::Callback(e) => PoolError::Callback(e),
        }
    }
}

impl ProcessShell {
    /// Spawn the child and the shell's tasks.
    pub(crate) fn start(
        id: ShellId,
        manager: Arc<dyn ProcessManager>,
        opts: ShellOptions,
    ) -> Result<Self, PoolError> {
        let mut child = manager.start_process().map_err(PoolError::Spawn)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Spawn(io::Error::other("child stdin is not piped")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::Spawn(io::Error::other("child stdout is not piped")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PoolError::Spawn(io::Error::other("child stderr is not piped")))?;

        let span = debug_span!("shell", id = %id);
        let stdout_pump = LinePump::spawn(stdout, StreamKind::Stdout, opts.charset, span.clone());
        let stderr_pump = LinePump::spawn(stderr, StreamKind::Stderr, opts.charset, span.clone());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ShellState::New);

        let inner = Arc::new(ShellInner {
            id,
            manager,
            opts,
            span: span.clone(),
            state: state_tx,
            exec: AsyncMutex::new(ExecState {
                stdin: Some(stdin),
                stdout_pump,
                stderr_pump,
            }),
            control: control_tx,
        });
        let shell = Self { inner };
        shell.set_state(ShellState::Starting);

        let driver = shell.clone();
        tokio::spawn(
            async move {
                driver.drive(child, control_rx).await;
            }
            .instrument(span),
        );
        Ok(shell)
    }

    /// Stable identifier of this shell.
    pub fn id(&self) -> ShellId {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ShellState {
        *self.inner.state.borrow()
    }

    /// Execute `submission` if the shell is idle.
    ///
    /// Acceptance is non-blocking: returns `Ok(false)` without side
    /// effects when the shell is busy or not ready, `Ok(true)` when the
    /// submission ran to completion, and `Err` when the shell accepted
    /// the submission but it failed.
    pub async fn execute(&self, submission: &dyn Submission) -> Result<bool, PoolError> {
        self.execute_with_cancel(submission, None).await
    }

    pub(crate) async fn execute_with_cancel(
        &self,
        submission: &dyn Submission,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, PoolError> {
        let span = self.inner.span.clone();
        async {
            let Ok(mut exec) = self.inner.exec.try_lock() else {
                return Ok(false);
            };
            if self.state() != ShellState::Ready {
                return Ok(false);
            }
            self.set_state(ShellState::Busy);

            let result = run_submission(self, &mut exec, submission, cancel).await;
            match result {
                Ok(()) => {
                    if submission.terminate_process_afterwards() {
                        self.terminate_locked(&mut exec, TerminateMode::Orderly).await;
                    } else {
                        self.set_state(ShellState::Ready);
                    }
                    Ok(true)
                }
                Err(RunError::CancelledAtBoundary) => {
                    // Nothing was in flight; the shell is still clean.
                    self.set_state(ShellState::Ready);
                    Err(PoolError::Cancelled)
                }
                Err(RunError::CancelledMidCommand) => {
                    // The child's response state is unknown; retire it rather
                    // than hand leftover output to the next submission.
                    self.terminate_locked(&mut exec, TerminateMode::Orderly).await;
                    Err(PoolError::Cancelled)
                }
                Err(RunError::ProcessExited) => {
                    self.terminate_locked(&mut exec, TerminateMode::Dead).await;
                    Err(PoolError::ProcessExited)
                }
                Err(e) => {
                    self.terminate_locked(&mut exec, TerminateMode::Force).await;
                    Err(e.into_pool_error())
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Ask the driver to terminate this shell. An idle shell gets an
    /// orderly attempt; a busy one has its child killed out from under
    /// the executing submission.
    pub(crate) fn request_terminate(&self) {
        let _ = self.inner.control.send(Control::Terminate);
    }

    fn set_state(&self, state: ShellState) {
        self.inner.state.send_replace(state);
    }

    /// Orderly-then-forceful termination. Requires the exec lock; safe to
    /// call when already terminating (it becomes a no-op).
    async fn terminate_locked(&self, exec: &mut ExecState, mode: TerminateMode) {
        let state = self.state();
        if state == ShellState::Terminating || state == ShellState::Terminated {
            return;
        }
        self.set_state(ShellState::Terminating);

        let force = match mode {
            TerminateMode::Dead => false,
            TerminateMode::Force => true,
            TerminateMode::Orderly => {
                let mut console = ShellConsole {
                    shell: self,
                    exec: &mut *exec,
                };
                match self.inner.manager.terminate(&mut console).await {
                    Ok(true) => false,
                    Ok(false) => true,
                    Err(e) => {
                        warn!(error = %e, "terminate callback failed");
                        true
                    }
                }
            }
        };

        // Closing stdin signals EOF; some children exit on that alone.
        exec.stdin.take();
        let _ = self.inner.control.send(Control::Reap { force });
    }

    /// The driver task: start-up, supervision, and the reap endgame.
    async fn drive(self, mut child: Child, mut control_rx: mpsc::UnboundedReceiver<Control>) {
        let inner = self.inner.clone();
        let mut exec = inner.exec.lock().await;
        let mut stdout_closed = exec.stdout_pump.closed_receiver();

        match self.await_startup(&mut exec, &mut control_rx).await {
            StartupOutcome::Started => {}
            StartupOutcome::Died => {
                warn!("child exited before start-up completed");
                self.set_state(ShellState::Terminating);
                exec.stdin.take();
                drop(exec);
                self.reap(&mut child, false).await;
                return;
            }
            StartupOutcome::Aborted => {
                debug!("shell terminated during start-up");
                self.set_state(ShellState::Terminating);
                exec.stdin.take();
                drop(exec);
                self.reap(&mut child, true).await;
                return;
            }
        }

        self.set_state(ShellState::Ready);
        debug!("shell ready");
        let startup = {
            let mut console = ShellConsole {
                shell: &self,
                exec: &mut *exec,
            };
            inner.manager.on_startup(&mut console).await
        };
        match startup {
            Ok(()) => {
                drop(exec);
                inner.opts.wake.notify_one();
            }
            Err(e) => {
                warn!(error = %e, "start-up callback failed; terminating shell");
                self.terminate_locked(&mut exec, TerminateMode::Force).await;
                drop(exec);
            }
        }

        let mut state_rx = inner.state.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            if state == ShellState::Terminated {
                return;
            }
            let idle = state == ShellState::Ready;

            if idle && *stdout_closed.borrow_and_update() {
                // Child died while idle. If an execute grabbed the lock in
                // the meantime it will observe the closed stream itself.
                if let Ok(mut exec) = inner.exec.try_lock() {
                    if self.state() == ShellState::Ready {
                        debug!("child exited while idle");
                        self.terminate_locked(&mut exec, TerminateMode::Dead).await;
                    }
                }
            }

            let watch_death = idle && !*stdout_closed.borrow();
            let idle_limit = if idle { inner.opts.keep_alive } else { None };

            tokio::select! {
                ctl = control_rx.recv() => match ctl {
                    Some(Control::Terminate) => {
                        match inner.exec.try_lock() {
                            Ok(mut exec) => {
                                self.terminate_locked(&mut exec, TerminateMode::Orderly).await;
                            }
                            Err(_) => {
                                // A submission is executing and may be blocked
                                // waiting for lines that will never come. Kill
                                // the child out from under it; the pumps
                                // deliver Closed and the executor unwinds.
                                debug!("terminate requested while busy; killing child");
                                let _ = child.start_kill();
                            }
                        }
                    }
                    Some(Control::Reap { force }) => {
                        self.reap(&mut child, force).await;
                        return;
                    }
                    None => return,
                },
                res = state_rx.changed() => {
                    if res.is_err() {
                        return;
                    }
                }
                _ = stdout_closed.changed(), if watch_death => {}
                _ = sleep(idle_limit.unwrap_or(Duration::MAX)), if idle_limit.is_some() => {
                    if let Ok(mut exec) = inner.exec.try_lock() {
                        if self.state() == ShellState::Ready {
                            debug!("idle timeout; terminating shell");
                            self.terminate_locked(&mut exec, TerminateMode::Orderly).await;
                        }
                    }
                }
            }
        }
    }

    async fn await_startup(
        &self,
        exec: &mut ExecState,
        control_rx: &mut mpsc::UnboundedReceiver<Control>,
    ) -> StartupOutcome {
        let inner = &self.inner;
        if inner.manager.starts_up_instantly() {
            return StartupOutcome::Started;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        exec.stdout_pump.register(tx.clone());
        exec.stderr_pump.register(tx);
        let outcome = loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some((kind, PumpEvent::Line(line))) => {
                        if inner.manager.is_started_up(&line, kind.is_stdout()) {
                            break StartupOutcome::Started;
                        }
                    }
                    Some((_, PumpEvent::Closed)) | None => break StartupOutcome::Died,
                },
                ctl = control_rx.recv() => match ctl {
                    Some(Control::Terminate) | None => break StartupOutcome::Aborted,
                    Some(Control::Reap { .. }) => break StartupOutcome::Aborted,
                },
            }
        };
        exec.stdout_pump.unregister();
        exec.stderr_pump.unregister();
        outcome
    }

    /// Kill (if asked), wait for the exit code, and fire `on_termination`
    /// exactly once.
    async fn reap(&self, child: &mut Child, force: bool) {
        let inner = &self.inner;
        if force {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "kill failed (child already exited?)");
            }
        }
        let exit_code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(error = %e, "failed to reap child");
                None
            }
        };
        debug!(?exit_code, "child terminated");
        self.set_state(ShellState::Terminated);
        inner.manager.on_termination(exit_code).await;
    }
}

impl std::fmt::Debug for ProcessShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessShell")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

enum StartupOutcome {
    Started,
    Died,
    Aborted,
}

/// Exclusive access to a shell's child for manager callbacks.
///
/// Handed to [`ProcessManager::on_startup`] and
/// [`ProcessManager::terminate`] so they can run priming or exit
/// submissions while the shell's exec lock is already held.
pub struct ShellConsole<'a> {
    shell: &'a ProcessShell,
    exec: &'a mut ExecState,
}

impl ShellConsole<'_> {
    /// The shell this console belongs to.
    pub fn id(&self) -> ShellId {
        self.shell.id()
    }

    /// Run a submission against the child, start to finish.
    pub async fn run(&mut self, submission: &dyn Submission) -> Result<(), PoolError> {
        let was_ready = self.shell.state() == ShellState::Ready;
        if was_ready {
            self.shell.set_state(ShellState::Busy);
        }
        let result = run_submission(self.shell, self.exec, submission, None).await;
        match result {
            Ok(()) => {
                if submission.terminate_process_afterwards() {
                    self.shell
                        .terminate_locked(self.exec, TerminateMode::Orderly)
                        .await;
                } else if was_ready {
                    self.shell.set_state(ShellState::Ready);
                }
                Ok(())
            }
            Err(e) => {
                if was_ready {
                    self.shell.set_state(ShellState::Ready);
                }
                Err(e.into_pool_error())
            }
        }
    }
}

/// Drive one submission: callbacks, command loop, completion waits.
async fn run_submission(
    shell: &ProcessShell,
    exec: &mut ExecState,
    submission: &dyn Submission,
    cancel: Option<&CancellationToken>,
) -> Result<(), RunError> {
    let cancelled = || {
        submission.is_cancelled() || cancel.is_some_and(|token| token.is_cancelled())
    };
    if cancelled() {
        return Err(RunError::CancelledAtBoundary);
    }
    submission.on_started_processing().map_err(|e| {
        match e.downcast::<PoolError>() {
            Ok(pool_error) if matches!(*pool_error, PoolError::Cancelled) => {
                RunError::CancelledAtBoundary
            }
            Ok(pool_error) => RunError::Callback(pool_error),
            Err(other) => RunError::Callback(other),
        }
    })?;

    for command in submission.commands() {
        if cancelled() {
            return Err(RunError::CancelledAtBoundary);
        }
        run_command(shell, exec, submission, command.as_ref(), cancel).await?;
    }

    submission
        .on_finished_processing()
        .map_err(RunError::Callback)?;
    Ok(())
}

/// One request/response turn: register listeners, write the instruction,
/// await a completion predicate.
async fn run_command(
    shell: &ProcessShell,
    exec: &mut ExecState,
    submission: &dyn Submission,
    command: &dyn Command,
    cancel: Option<&CancellationToken>,
) -> Result<(), RunError> {
    let mut payload = shell
        .inner
        .opts
        .charset
        .encode(command.instruction())
        .map_err(RunError::StreamIo)?;
    payload.push(b'\n');

    // Listeners go in before the write so no response line can race past.
    let (tx, mut rx) = mpsc::unbounded_channel();
    exec.stdout_pump.register(tx.clone());
    exec.stderr_pump.register(tx);

    let outcome = async {
        let stdin = exec
            .stdin
            .as_mut()
            .ok_or_else(|| RunError::StreamIo(io::Error::other("child stdin already closed")))?;
        stdin.write_all(&payload).await.map_err(RunError::StreamIo)?;
        stdin.flush().await.map_err(RunError::StreamIo)?;

        if !command.generates_output() {
            return Ok(());
        }
        await_completion(submission, command, &mut rx, cancel).await
    }
    .await;

    exec.stdout_pump.unregister();
    exec.stderr_pump.unregister();
    outcome
}

async fn await_completion(
    submission: &dyn Submission,
    command: &dyn Command,
    rx: &mut mpsc::UnboundedReceiver<(StreamKind, PumpEvent)>,
    cancel: Option<&CancellationToken>,
) -> Result<(), RunError> {
    loop {
        let event = match cancel {
            Some(token) => tokio::select! {
                event = rx.recv() => event,
                _ = token.cancelled() => return Err(RunError::CancelledMidCommand),
            },
            None => rx.recv().await,
        };
        match event {
            Some((kind, PumpEvent::Line(line))) => {
                if submission.is_cancelled() {
                    return Err(RunError::CancelledMidCommand);
                }
                let complete = match kind {
                    StreamKind::Stdout => command.is_completed_stdout(&line),
                    StreamKind::Stderr => command.is_completed_stderr(&line),
                };
                if complete {
                    return Ok(());
                }
            }
            Some((_, PumpEvent::Closed)) | None => return Err(RunError::ProcessExited),
        }
    }
}
