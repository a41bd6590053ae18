//! End-to-end tests against real child processes.
//!
//! The "engine" child is a small `sh` script speaking a line protocol:
//! it announces `hi` on start-up, echoes every instruction followed by
//! `done`, sleeps before `done` for `sleep` instructions, and answers
//! `exit` with `bye` before exiting.

#![cfg(unix)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::time::sleep;

use hatchery_pool::{
    BoxError, Command, PoolConfig, PoolError, ProcessManagerFactory, ProcessPool, SimpleCommand,
    SimpleProcessManager, SimpleSubmission, Submission,
};

const ENGINE: &str = r#"
echo hi
while IFS= read -r line; do
  case "$line" in
    sleep*) sleep 0.2; echo done ;;
    exit) echo bye; exit 0 ;;
    *) echo "$line"; echo done ;;
  esac
done
"#;

/// An engine child that never honours `exit`.
const STUBBORN_ENGINE: &str = r#"
echo hi
while IFS= read -r line; do
  echo "$line"
  echo done
done
"#;

fn engine_manager(script: &'static str) -> SimpleProcessManager {
    SimpleProcessManager::new("sh")
        .args(["-c", script])
        .started_up_when(|line, stdout| stdout && line == "hi")
}

fn engine_factory(script: &'static str) -> impl ProcessManagerFactory {
    engine_manager(script).into_factory()
}

fn ping() -> SimpleSubmission {
    SimpleSubmission::single(SimpleCommand::new("ping", |line| line == "done"))
}

fn sleeper() -> SimpleSubmission {
    SimpleSubmission::single(SimpleCommand::new("sleep", |line| line == "done"))
}

async fn eventually(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Submission wrapper recording whether and in which order it started.
struct Recording {
    inner: SimpleSubmission,
    index: usize,
    order: Arc<Mutex<Vec<usize>>>,
    started: Arc<AtomicBool>,
}

impl Recording {
    fn new(inner: SimpleSubmission, index: usize, order: Arc<Mutex<Vec<usize>>>) -> Self {
        Self {
            inner,
            index,
            order,
            started: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Submission for Recording {
    fn commands(&self) -> &[Box<dyn Command>] {
        self.inner.commands()
    }

    fn on_started_processing(&self) -> Result<(), BoxError> {
        self.started.store(true, Ordering::SeqCst);
        self.order.lock().unwrap().push(self.index);
        Ok(())
    }
}

// S1: start-up announcement, priming, then a client submission.
#[tokio::test]
async fn start_prime_execute() -> Result<()> {
    let primed = Arc::new(AtomicUsize::new(0));
    let primes = primed.clone();
    let factory = move || -> Box<dyn hatchery_pool::ProcessManager> {
        let primes = primes.clone();
        Box::new(
            engine_manager(ENGINE).prime_with(SimpleSubmission::single(SimpleCommand::new(
                "init",
                move |line| {
                    if line == "done" {
                        primes.fetch_add(1, Ordering::SeqCst);
                        true
                    } else {
                        false
                    }
                },
            ))),
        )
    };
    let pool = ProcessPool::new(factory, PoolConfig::fixed(1)).await?;
    assert_eq!(primed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.shell_count(), 1);

    let handle = pool.submit(ping())?;
    let latency = handle.wait().await?;
    assert!(latency > Duration::ZERO);

    // The shell returns to the ready set and takes more work.
    let handle = pool.submit(ping())?;
    handle.wait().await?;
    let stats = pool.stats();
    assert_eq!(stats.shells, 1);
    assert_eq!(stats.executing, 0);

    pool.shutdown().await;
    Ok(())
}

// S2: terminate-after submission; orderly exit observed, replacement
// spawned to satisfy the minimum size.
#[tokio::test]
async fn terminate_afterwards_with_orderly_exit() -> Result<()> {
    let exits = Arc::new(Mutex::new(Vec::new()));
    let seen = exits.clone();
    let factory = move || -> Box<dyn hatchery_pool::ProcessManager> {
        let seen = seen.clone();
        Box::new(
            engine_manager(ENGINE)
                .terminate_with(SimpleSubmission::single(SimpleCommand::new("exit", |l| {
                    l == "bye"
                })))
                .on_exit(move |code| seen.lock().unwrap().push(code)),
        )
    };
    let pool = ProcessPool::new(factory, PoolConfig::fixed(1)).await?;

    let handle = pool.submit(ping().terminate_afterwards())?;
    handle.wait().await?;

    eventually(|| exits.lock().unwrap().first() == Some(&Some(0)), "orderly exit").await;
    // The sizing rule replaces the retired shell.
    eventually(|| pool.shell_count() == 1, "replacement shell").await;

    pool.shutdown().await;
    Ok(())
}

// S3: the child ignores the exit request; the manager's orderly attempt
// fails and the pool force-kills.
#[tokio::test]
async fn force_kill_when_orderly_termination_fails() -> Result<()> {
    let exits = Arc::new(Mutex::new(Vec::new()));
    let seen = exits.clone();
    let factory = move || -> Box<dyn hatchery_pool::ProcessManager> {
        let seen = seen.clone();
        // No terminate submission: the orderly attempt always declines.
        Box::new(
            engine_manager(STUBBORN_ENGINE).on_exit(move |code| seen.lock().unwrap().push(code)),
        )
    };
    let pool = ProcessPool::new(factory, PoolConfig::fixed(1)).await?;

    let handle = pool.submit(ping().terminate_afterwards())?;
    handle.wait().await?;

    eventually(|| !exits.lock().unwrap().is_empty(), "forced exit").await;
    // SIGKILL leaves no exit code.
    assert_ne!(exits.lock().unwrap()[0], Some(0));
    eventually(|| pool.shell_count() == 1, "replacement shell").await;

    pool.shutdown().await;
    Ok(())
}

// S4: idle shells terminate after the keep-alive interval and are not
// replaced when nothing needs them.
#[tokio::test]
async fn idle_timeout_drains_the_pool() -> Result<()> {
    let config = PoolConfig::elastic(0, 2, 0).keep_alive(Duration::from_millis(200));
    let pool = ProcessPool::new(engine_factory(ENGINE), config).await?;
    assert_eq!(pool.shell_count(), 0);

    let handle = pool.submit(ping())?;
    handle.wait().await?;
    assert!(pool.shell_count() >= 1);

    sleep(Duration::from_millis(600)).await;
    assert_eq!(pool.shell_count(), 0);

    pool.shutdown().await;
    Ok(())
}

// S5: a burst grows the pool up to the maximum and every submission
// completes.
#[tokio::test]
async fn burst_respects_max_size() -> Result<()> {
    let config = PoolConfig::elastic(2, 4, 2);
    let pool = ProcessPool::new(engine_factory(ENGINE), config).await?;

    let handles: Vec<_> = (0..10)
        .map(|_| pool.submit(sleeper()))
        .collect::<Result<_, _>>()?;
    assert!(pool.shell_count() <= 4);

    for handle in &handles {
        handle.wait().await?;
        assert!(pool.shell_count() <= 4);
    }

    pool.shutdown().await;
    Ok(())
}

// Queued submissions start in FIFO order on a single shell.
#[tokio::test]
async fn fifo_order_on_a_single_shell() -> Result<()> {
    let pool = ProcessPool::new(engine_factory(ENGINE), PoolConfig::fixed(1)).await?;
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..3)
        .map(|i| pool.submit(Recording::new(sleeper(), i, order.clone())))
        .collect::<Result<_, _>>()?;
    for handle in &handles {
        handle.wait().await?;
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

    pool.shutdown().await;
    Ok(())
}

// S6: cancelling a queued submission removes it before it ever runs.
#[tokio::test]
async fn cancel_while_queued_never_executes() -> Result<()> {
    let pool = ProcessPool::new(engine_factory(ENGINE), PoolConfig::fixed(1)).await?;
    let order = Arc::new(Mutex::new(Vec::new()));

    let blocker = pool.submit(sleeper())?;
    let victim = Recording::new(ping(), 99, order.clone());
    let started = victim.started.clone();
    let queued = pool.submit(victim)?;

    assert!(queued.cancel());
    assert!(queued.is_cancelled());
    assert!(matches!(queued.wait().await, Err(PoolError::Cancelled)));

    blocker.wait().await?;
    // Give the dispatcher a beat: the cancelled entry must never start.
    sleep(Duration::from_millis(100)).await;
    assert!(!started.load(Ordering::SeqCst));

    pool.shutdown().await;
    Ok(())
}

// reserve == max keeps the pool saturated while it is open.
#[tokio::test]
async fn full_reserve_keeps_pool_at_max() -> Result<()> {
    let pool = ProcessPool::new(engine_factory(ENGINE), PoolConfig::elastic(0, 3, 3)).await?;
    assert_eq!(pool.shell_count(), 3);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.shell_count(), 3);

    pool.shutdown().await;
    assert_eq!(pool.shell_count(), 0);
    Ok(())
}

#[tokio::test]
async fn shutdown_is_idempotent_and_closes_submissions() -> Result<()> {
    let pool = ProcessPool::new(engine_factory(ENGINE), PoolConfig::fixed(2)).await?;
    pool.shutdown().await;
    pool.shutdown().await;
    assert!(pool.is_shut_down());
    assert!(matches!(pool.submit(ping()), Err(PoolError::Closed)));
    Ok(())
}

#[tokio::test]
async fn wait_timeout_fires_on_slow_submissions() -> Result<()> {
    let pool = ProcessPool::new(engine_factory(ENGINE), PoolConfig::fixed(1)).await?;
    let handle = pool.submit(sleeper())?;
    assert!(matches!(
        handle.wait_timeout(Duration::from_millis(10)).await,
        Err(PoolError::WaitTimeout)
    ));
    // The submission itself still completes.
    handle.wait().await?;
    pool.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn empty_submission_is_rejected() -> Result<()> {
    let pool = ProcessPool::new(engine_factory(ENGINE), PoolConfig::fixed(1)).await?;
    let result = pool.submit(SimpleSubmission::new(Vec::new()));
    assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
    pool.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn invalid_config_is_rejected_up_front() {
    let result = ProcessPool::new(engine_factory(ENGINE), PoolConfig::elastic(4, 2, 0)).await;
    assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
}

#[tokio::test]
async fn spawn_failure_surfaces_from_constructor() {
    let factory = SimpleProcessManager::new("/nonexistent/definitely-not-a-binary").into_factory();
    let result = ProcessPool::new(factory, PoolConfig::fixed(1)).await;
    assert!(matches!(result, Err(PoolError::Spawn(_))));
}

// A failing client callback fails the submission and retires the shell;
// the pool keeps working.
#[tokio::test]
async fn callback_failure_is_isolated_to_its_shell() -> Result<()> {
    struct FailingFinish(SimpleSubmission);
    impl Submission for FailingFinish {
        fn commands(&self) -> &[Box<dyn Command>] {
            self.0.commands()
        }
        fn on_finished_processing(&self) -> Result<(), BoxError> {
            Err("client bookkeeping exploded".into())
        }
    }

    let pool = ProcessPool::new(engine_factory(ENGINE), PoolConfig::fixed(1)).await?;
    let handle = pool.submit(FailingFinish(ping()))?;
    assert!(matches!(
        handle.wait().await,
        Err(PoolError::Callback(_))
    ));

    // The pool replaced the shell and still serves work.
    eventually(|| pool.shell_count() == 1, "replacement shell").await;
    let handle = pool.submit(ping())?;
    handle.wait().await?;

    pool.shutdown().await;
    Ok(())
}

// Cancellation mid-execution stops further instructions and retires the
// shell, but never strands the pool.
#[tokio::test]
async fn cancel_mid_execution_retires_the_shell() -> Result<()> {
    let pool = ProcessPool::new(engine_factory(ENGINE), PoolConfig::fixed(1)).await?;

    // The predicate never fires, so this submission blocks its shell.
    let stuck = pool.submit(SimpleSubmission::single(SimpleCommand::new(
        "hold",
        |_| false,
    )))?;
    eventually(|| pool.stats().executing == 1, "submission to start").await;

    assert!(stuck.cancel());
    assert!(matches!(stuck.wait().await, Err(PoolError::Cancelled)));

    // A fresh shell replaces the retired one and the pool keeps serving.
    eventually(|| pool.stats().ready == 1, "replacement shell").await;
    let handle = pool.submit(ping())?;
    handle.wait().await?;

    pool.shutdown().await;
    Ok(())
}
