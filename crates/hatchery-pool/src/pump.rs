//! Line extraction from a child's output streams.
//!
//! Each child stream (stdout, stderr) gets one pump task that turns raw
//! bytes into whole lines and hands them to whoever is currently
//! listening:
//!
//! ```text
//!   child stdout ──▶ pump task ──▶ [listener slot] ──▶ executing command
//!   child stderr ──▶ pump task ──┘        │
//!                                         └── no listener → line dropped
//! ```
//!
//! The slot holds at most one listener. During start-up the shell driver
//! listens; during a command the executing task listens; in between,
//! lines are silently drained (the same contract as a closed pipe).
//! EOF delivers a final `Closed` event and flips a watch flag so that
//! late registrants never wait on a dead stream.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, warn};

use hatchery_types::Charset;

/// Which child stream a pump is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub(crate) fn is_stdout(self) -> bool {
        matches!(self, StreamKind::Stdout)
    }
}

/// An event delivered to the registered line listener.
#[derive(Debug, Clone)]
pub(crate) enum PumpEvent {
    /// A whole line, with the trailing `\r?\n` stripped.
    Line(String),
    /// The stream reached EOF (or failed); no more lines will follow.
    Closed,
}

pub(crate) type Listener = mpsc::UnboundedSender<(StreamKind, PumpEvent)>;

type Slot = Arc<Mutex<Option<Listener>>>;

/// Handle to one stream's pump: listener registration plus the closed
/// flag. Dropping the handle aborts the pump task.
pub(crate) struct LinePump {
    kind: StreamKind,
    slot: Slot,
    closed_rx: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl LinePump {
    /// Spawn a pump task over `reader`, inside the owning shell's span.
    pub(crate) fn spawn<R>(reader: R, kind: StreamKind, charset: Charset, span: Span) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let slot: Slot = Arc::new(Mutex::new(None));
        let (closed_tx, closed_rx) = watch::channel(false);
        let pump_slot = slot.clone();
        let task = tokio::spawn(
            async move {
                pump_lines(reader, kind, charset, pump_slot, closed_tx).await;
            }
            .instrument(span),
        );
        Self {
            kind,
            slot,
            closed_rx,
            task,
        }
    }

    /// Install `tx` as the line listener, replacing any previous one.
    ///
    /// If the stream already hit EOF, `Closed` is delivered immediately
    /// so the listener never blocks on a dead stream.
    pub(crate) fn register(&self, tx: Listener) {
        let mut slot = self.slot.lock().expect("pump listener lock");
        if *self.closed_rx.borrow() {
            let _ = tx.send((self.kind, PumpEvent::Closed));
        }
        *slot = Some(tx);
    }

    /// Remove the current listener; subsequent lines are drained.
    pub(crate) fn unregister(&self) {
        *self.slot.lock().expect("pump listener lock") = None;
    }

    /// A watch receiver that flips to `true` at EOF.
    pub(crate) fn closed_receiver(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }
}

impl Drop for LinePump {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn pump_lines<R>(
    reader: R,
    kind: StreamKind,
    charset: Charset,
    slot: Slot,
    closed_tx: watch::Sender<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                }
                // Without a terminator this is the residual before EOF;
                // read_until never returns it empty.
                deliver(&slot, kind, PumpEvent::Line(charset.decode(&buf)));
            }
            Err(e) => {
                warn!(?kind, error = %e, "pump read failed");
                break;
            }
        }
    }
    // Flip the closed flag and deliver the final event under the slot
    // lock so a concurrent register() sees exactly one of the two.
    let slot = slot.lock().expect("pump listener lock");
    let _ = closed_tx.send(true);
    if let Some(tx) = slot.as_ref() {
        let _ = tx.send((kind, PumpEvent::Closed));
    }
}

fn deliver(slot: &Slot, kind: StreamKind, event: PumpEvent) {
    if let Some(tx) = slot.lock().expect("pump listener lock").as_ref() {
        // A dropped receiver means the listener is mid-teardown; the
        // line is discarded just as if nobody had been registered.
        let _ = tx.send((kind, event));
    }
}
