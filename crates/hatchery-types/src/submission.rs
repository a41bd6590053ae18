//! The submission contract: an ordered command sequence plus lifecycle
//! callbacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::command::Command;
use crate::error::BoxError;

/// An ordered, non-empty sequence of commands to run on one pooled child,
/// plus the callbacks the pool drives while running it.
///
/// A shell runs the commands strictly in order, writing the next
/// instruction only after the previous command's completion predicate
/// has fired. At most one submission executes on a shell at a time.
///
/// Lifecycle callbacks are fallible: returning `Err` fails the
/// submission and retires the shell that was running it.
pub trait Submission: Send + Sync {
    /// The commands to run, in order. Must be non-empty.
    fn commands(&self) -> &[Box<dyn Command>];

    /// Whether the child must be terminated once the last command
    /// completes.
    fn terminate_process_afterwards(&self) -> bool {
        false
    }

    /// Client-side cancellation signal, polled at command boundaries and
    /// on every line event. Once it returns `true`, no further
    /// instructions are written.
    fn is_cancelled(&self) -> bool {
        false
    }

    /// Invoked once the shell has committed to running the submission.
    fn on_started_processing(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Invoked after the last command completes.
    fn on_finished_processing(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

impl<T: Submission + ?Sized> Submission for Arc<T> {
    fn commands(&self) -> &[Box<dyn Command>] {
        (**self).commands()
    }

    fn terminate_process_afterwards(&self) -> bool {
        (**self).terminate_process_afterwards()
    }

    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }

    fn on_started_processing(&self) -> Result<(), BoxError> {
        (**self).on_started_processing()
    }

    fn on_finished_processing(&self) -> Result<(), BoxError> {
        (**self).on_finished_processing()
    }
}

/// Plain [`Submission`] over a command list, with an optional
/// terminate-afterwards flag and a client-side cancel switch.
pub struct SimpleSubmission {
    commands: Vec<Box<dyn Command>>,
    terminate_afterwards: bool,
    cancelled: AtomicBool,
}

impl SimpleSubmission {
    /// A submission over the given commands.
    pub fn new(commands: Vec<Box<dyn Command>>) -> Self {
        Self {
            commands,
            terminate_afterwards: false,
            cancelled: AtomicBool::new(false),
        }
    }

    /// A single-command submission.
    pub fn single(command: impl Command + 'static) -> Self {
        Self::new(vec![Box::new(command)])
    }

    /// Terminate the child once the last command completes.
    pub fn terminate_afterwards(mut self) -> Self {
        self.terminate_afterwards = true;
        self
    }

    /// Flip the client-side cancellation signal. Share the submission via
    /// `Arc` to keep a handle for this after submitting.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Submission for SimpleSubmission {
    fn commands(&self) -> &[Box<dyn Command>] {
        &self.commands
    }

    fn terminate_process_afterwards(&self) -> bool {
        self.terminate_afterwards
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
