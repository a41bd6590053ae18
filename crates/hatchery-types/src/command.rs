//! The per-command client contract: one instruction and its completion
//! predicates.

use std::fmt;

/// One request/response turn against a pooled child process.
///
/// The shell writes `instruction` (newline-terminated) to the child's
/// stdin, then feeds every subsequent stdout/stderr line to the
/// completion predicates until one of them returns `true`. The pool
/// never interprets the child's protocol itself — the predicates are the
/// only thing that knows when a response is over.
///
/// Predicates take `&self`; implementations that accumulate state across
/// lines should use interior mutability.
pub trait Command: Send + Sync {
    /// The line to write to the child's stdin. Must not contain `\n`.
    fn instruction(&self) -> &str;

    /// Whether the child produces output in response to the instruction.
    ///
    /// When `false`, the command is considered complete as soon as the
    /// instruction has been written and neither predicate is consulted.
    fn generates_output(&self) -> bool {
        true
    }

    /// Called for each stdout line produced in response. Returning `true`
    /// marks the command complete.
    fn is_completed_stdout(&self, line: &str) -> bool;

    /// Called for each stderr line. Returning `true` also marks the
    /// command complete; clients typically use this as an error signal.
    fn is_completed_stderr(&self, line: &str) -> bool {
        let _ = line;
        false
    }
}

type Predicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Closure-backed [`Command`] for simple line protocols.
pub struct SimpleCommand {
    instruction: String,
    stdout_done: Predicate,
    stderr_done: Predicate,
    generates_output: bool,
}

impl SimpleCommand {
    /// A command completed when `stdout_done` matches a stdout line.
    pub fn new(
        instruction: impl Into<String>,
        stdout_done: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            instruction: instruction.into(),
            stdout_done: Box::new(stdout_done),
            stderr_done: Box::new(|_| false),
            generates_output: true,
        }
    }

    /// A command that produces no output; complete once written.
    pub fn fire_and_forget(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            stdout_done: Box::new(|_| false),
            stderr_done: Box::new(|_| false),
            generates_output: false,
        }
    }

    /// Also complete when `stderr_done` matches a stderr line.
    pub fn with_stderr(
        mut self,
        stderr_done: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.stderr_done = Box::new(stderr_done);
        self
    }
}

impl Command for SimpleCommand {
    fn instruction(&self) -> &str {
        &self.instruction
    }

    fn generates_output(&self) -> bool {
        self.generates_output
    }

    fn is_completed_stdout(&self, line: &str) -> bool {
        (self.stdout_done)(line)
    }

    fn is_completed_stderr(&self, line: &str) -> bool {
        (self.stderr_done)(line)
    }
}

impl fmt::Debug for SimpleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleCommand")
            .field("instruction", &self.instruction)
            .field("generates_output", &self.generates_output)
            .finish()
    }
}
