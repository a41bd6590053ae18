//! Process lifecycle management — the client-implemented side of a pool.
//!
//! A [`ProcessManager`] owns the *policy* for one child process: how to
//! spawn it, how to recognize its start-up announcement, how to prime it
//! once ready, and how to ask it to exit. The pool owns the mechanics
//! (pumps, dispatch, sizing) and drives the manager through these hooks.

use std::io;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::{Child, Command as ChildCommand};

use hatchery_types::{BoxError, Submission};

use crate::shell::ShellConsole;

/// Client-implemented lifecycle hooks for one pooled child process.
///
/// Every shell gets its own manager instance from a
/// [`ProcessManagerFactory`]; a manager is never shared across shells
/// unless the implementation makes itself shareable.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Spawn the child process.
    ///
    /// stdin, stdout, and stderr must all be piped; the pool takes the
    /// three handles immediately after spawn.
    fn start_process(&self) -> io::Result<Child>;

    /// `true` if the child accepts instructions immediately after spawn,
    /// without announcing readiness on its output streams.
    fn starts_up_instantly(&self) -> bool;

    /// Consulted for every output line while the shell is starting.
    /// Return `true` when `line` is the child's start-up announcement.
    /// `stdout` tells which stream the line arrived on.
    fn is_started_up(&self, line: &str, stdout: bool) -> bool;

    /// Priming hook, invoked once the shell reaches the ready state and
    /// before it is published to the pool. May run submissions through
    /// `shell` (they count as the shell's first work). Returning `Err`
    /// retires the shell.
    async fn on_startup(&self, shell: &mut ShellConsole<'_>) -> Result<(), BoxError> {
        let _ = shell;
        Ok(())
    }

    /// Attempt orderly termination, typically by running an exit command
    /// through `shell`. Return `Ok(true)` if the attempt is believed to
    /// have succeeded; on `Ok(false)` or `Err` the pool force-kills the
    /// child.
    async fn terminate(&self, shell: &mut ShellConsole<'_>) -> Result<bool, BoxError> {
        let _ = shell;
        Ok(false)
    }

    /// Called exactly once after the child has been reaped. `exit_code`
    /// is `None` when the child was killed by a signal.
    async fn on_termination(&self, exit_code: Option<i32>) {
        let _ = exit_code;
    }
}

#[async_trait]
impl<T: ProcessManager + ?Sized> ProcessManager for Arc<T> {
    fn start_process(&self) -> io::Result<Child> {
        (**self).start_process()
    }

    fn starts_up_instantly(&self) -> bool {
        (**self).starts_up_instantly()
    }

    fn is_started_up(&self, line: &str, stdout: bool) -> bool {
        (**self).is_started_up(line, stdout)
    }

    async fn on_startup(&self, shell: &mut ShellConsole<'_>) -> Result<(), BoxError> {
        (**self).on_startup(shell).await
    }

    async fn terminate(&self, shell: &mut ShellConsole<'_>) -> Result<bool, BoxError> {
        (**self).terminate(shell).await
    }

    async fn on_termination(&self, exit_code: Option<i32>) {
        (**self).on_termination(exit_code).await
    }
}

/// Produces a fresh [`ProcessManager`] for every shell the pool creates.
pub trait ProcessManagerFactory: Send + Sync {
    fn new_process_manager(&self) -> Box<dyn ProcessManager>;
}

/// Any `Fn() -> Box<dyn ProcessManager>` closure is a factory.
impl<F> ProcessManagerFactory for F
where
    F: Fn() -> Box<dyn ProcessManager> + Send + Sync,
{
    fn new_process_manager(&self) -> Box<dyn ProcessManager> {
        self()
    }
}

type StartupPredicate = Box<dyn Fn(&str, bool) -> bool + Send + Sync>;
type ExitHook = Box<dyn Fn(Option<i32>) + Send + Sync>;

/// Closure-configured [`ProcessManager`] for children with simple line
/// protocols.
///
/// ```no_run
/// use hatchery_pool::{SimpleCommand, SimpleProcessManager, SimpleSubmission};
///
/// let manager = SimpleProcessManager::new("my-engine")
///     .arg("--interactive")
///     .started_up_when(|line, stdout| stdout && line == "hi")
///     .prime_with(SimpleSubmission::single(SimpleCommand::new(
///         "init",
///         |line| line == "done",
///     )))
///     .terminate_with(SimpleSubmission::single(SimpleCommand::new(
///         "exit",
///         |line| line == "bye",
///     )));
/// let factory = manager.into_factory();
/// ```
pub struct SimpleProcessManager {
    program: String,
    args: Vec<String>,
    startup: Option<StartupPredicate>,
    primer: Option<Arc<dyn Submission>>,
    exit_submission: Option<Arc<dyn Submission>>,
    exit_hook: Option<ExitHook>,
}

impl SimpleProcessManager {
    /// A manager spawning `program` with no arguments, starting up
    /// instantly.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            startup: None,
            primer: None,
            exit_submission: None,
            exit_hook: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Wait for a start-up announcement instead of assuming instant
    /// readiness. The predicate receives each output line and whether it
    /// arrived on stdout.
    pub fn started_up_when(
        mut self,
        predicate: impl Fn(&str, bool) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.startup = Some(Box::new(predicate));
        self
    }

    /// Run `submission` as the shell's first work, before it is published
    /// to the pool.
    pub fn prime_with(mut self, submission: impl Submission + 'static) -> Self {
        self.primer = Some(Arc::new(submission));
        self
    }

    /// Run `submission` as the orderly-termination request. Termination
    /// is considered successful when the submission completes.
    pub fn terminate_with(mut self, submission: impl Submission + 'static) -> Self {
        self.exit_submission = Some(Arc::new(submission));
        self
    }

    /// Observe the child's exit code after it has been reaped.
    pub fn on_exit(mut self, hook: impl Fn(Option<i32>) + Send + Sync + 'static) -> Self {
        self.exit_hook = Some(Box::new(hook));
        self
    }

    /// Wrap into a factory handing every shell a shared handle to this
    /// manager. Safe because `SimpleProcessManager` keeps no per-shell
    /// state.
    pub fn into_factory(self) -> impl ProcessManagerFactory {
        let shared = Arc::new(self);
        move || -> Box<dyn ProcessManager> { Box::new(shared.clone()) }
    }
}

#[async_trait]
impl ProcessManager for SimpleProcessManager {
    fn start_process(&self) -> io::Result<Child> {
        ChildCommand::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    fn starts_up_instantly(&self) -> bool {
        self.startup.is_none()
    }

    fn is_started_up(&self, line: &str, stdout: bool) -> bool {
        self.startup.as_ref().is_some_and(|p| p(line, stdout))
    }

    async fn on_startup(&self, shell: &mut ShellConsole<'_>) -> Result<(), BoxError> {
        if let Some(primer) = &self.primer {
            shell.run(primer.as_ref()).await?;
        }
        Ok(())
    }

    async fn terminate(&self, shell: &mut ShellConsole<'_>) -> Result<bool, BoxError> {
        match &self.exit_submission {
            Some(submission) => Ok(shell.run(submission.as_ref()).await.is_ok()),
            None => Ok(false),
        }
    }

    async fn on_termination(&self, exit_code: Option<i32>) {
        if let Some(hook) = &self.exit_hook {
            hook(exit_code);
        }
    }
}

impl std::fmt::Debug for SimpleProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleProcessManager")
            .field("program", &self.program)
            .field("args", &self.args)
            .finish()
    }
}
