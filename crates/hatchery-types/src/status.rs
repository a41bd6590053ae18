//! Shell identity, lifecycle states, and pool statistics.

/// Unique identifier for a pooled shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShellId(pub u64);

impl std::fmt::Display for ShellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a process shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    /// Constructed, child not spawned yet.
    New,
    /// Child spawned; awaiting the start-up announcement.
    Starting,
    /// Idle; may accept a submission.
    Ready,
    /// Executing a submission.
    Busy,
    /// Orderly termination or force-kill in progress.
    Terminating,
    /// Child reaped; the shell is gone from the pool.
    Terminated,
}

impl ShellState {
    /// Whether the shell still counts toward the pool size.
    pub fn is_live(&self) -> bool {
        !matches!(self, ShellState::Terminated)
    }
}

impl std::fmt::Display for ShellState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShellState::New => "New",
            ShellState::Starting => "Starting",
            ShellState::Ready => "Ready",
            ShellState::Busy => "Busy",
            ShellState::Terminating => "Terminating",
            ShellState::Terminated => "Terminated",
        };
        write!(f, "{name}")
    }
}

/// A point-in-time snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Live shells, in any state.
    pub shells: usize,
    /// Shells currently idle and accepting work.
    pub ready: usize,
    /// Submissions waiting in the queue.
    pub queued: usize,
    /// Submissions currently executing on some shell.
    pub executing: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_is_not_live() {
        assert!(ShellState::Ready.is_live());
        assert!(ShellState::Terminating.is_live());
        assert!(!ShellState::Terminated.is_live());
    }

    #[test]
    fn shell_id_displays_bare_number() {
        assert_eq!(ShellId(42).to_string(), "42");
    }
}
