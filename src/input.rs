//! Input routing between the operator and the running session.
//!
//! An input string goes to exactly one of two places:
//!
//! 1. a pending internal question the worker is blocked on
//!    ([`InputRouter::wait_for_reply`]), or
//! 2. the benchmark's terminal, with a trailing newline.
//!
//! Each wait gets its own one-shot channel, so a reply can never be consumed
//! by a later wait or lost because it arrived before the worker blocked.

use std::io::Write;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::bridge::TerminalWriter;

/// What the worker receives when a wait resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputReply {
    /// The operator answered.
    Text(String),
    /// The wait was abandoned (the session is stopping).
    Cancelled,
}

/// Where [`InputRouter::deliver`] sent the input.
#[derive(Debug)]
pub enum Delivery {
    /// Consumed by the pending wait.
    Reply,
    /// Written to the terminal.
    Terminal,
    /// Nothing was listening.
    NoProcess,
    /// The terminal write failed; the session carries on.
    WriteFailed(std::io::Error),
}

/// Receiving side of one pending wait.
pub struct PendingReply {
    rx: Receiver<InputReply>,
}

impl PendingReply {
    /// Block until the wait is answered or cancelled.
    pub fn wait(self) -> InputReply {
        // A dropped sender means the router discarded the wait.
        self.rx.recv().unwrap_or(InputReply::Cancelled)
    }
}

type SharedWriter = Arc<Mutex<TerminalWriter>>;

/// Routes inbound text to a pending wait or the terminal.
///
/// The wait slot and the writer sit behind separate locks. A terminal write
/// holds only the writer's own lock, so the wait slot stays available to
/// `is_waiting` and `cancel_pending` while a write is stuck.
#[derive(Default)]
pub struct InputRouter {
    pending: Mutex<Option<SyncSender<InputReply>>>,
    writer: Mutex<Option<SharedWriter>>,
}

impl InputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait. Any older wait still pending is cancelled first.
    pub fn wait_for_reply(&self) -> PendingReply {
        let (tx, rx) = mpsc::sync_channel(1);
        let previous = lock(&self.pending).replace(tx);
        if let Some(previous) = previous {
            let _ = previous.try_send(InputReply::Cancelled);
        }
        PendingReply { rx }
    }

    /// Whether the worker is currently blocked wanting input.
    pub fn is_waiting(&self) -> bool {
        lock(&self.pending).is_some()
    }

    /// Resolve a pending wait with [`InputReply::Cancelled`].
    ///
    /// Returns false when nothing was waiting.
    pub fn cancel_pending(&self) -> bool {
        let taken = lock(&self.pending).take();
        match taken {
            Some(tx) => {
                let _ = tx.try_send(InputReply::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Attach the terminal writer for pass-through input.
    pub fn attach(&self, writer: TerminalWriter) {
        *lock(&self.writer) = Some(Arc::new(Mutex::new(writer)));
    }

    /// Stop passing input through. A write already in flight finishes on
    /// its own. Returns false when no writer was attached.
    pub fn detach(&self) -> bool {
        lock(&self.writer).take().is_some()
    }

    #[cfg(test)]
    fn has_terminal(&self) -> bool {
        lock(&self.writer).is_some()
    }

    /// Route `text` to the pending wait if there is one, else to the
    /// terminal, else nowhere.
    pub fn deliver(&self, text: &str) -> Delivery {
        let pending = lock(&self.pending).take();
        if let Some(tx) = pending {
            // Capacity 1 and a fresh channel per wait: the slot is free.
            let _ = tx.try_send(InputReply::Text(text.to_string()));
            debug!(length = text.len(), "input answered pending question");
            return Delivery::Reply;
        }

        let attached = lock(&self.writer).clone();
        let Some(shared) = attached else {
            debug!("no active process to receive input");
            return Delivery::NoProcess;
        };

        let mut writer = lock(&shared);
        let result = writer
            .write_all(format!("{text}\n").as_bytes())
            .and_then(|()| writer.flush());
        match result {
            Ok(()) => {
                debug!(length = text.len(), "input forwarded to terminal");
                Delivery::Terminal
            }
            Err(e) => {
                warn!(error = %e, "failed to write to pty");
                Delivery::WriteFailed(e)
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::thread;
    use std::time::Duration;

    /// Writer that records everything written to it.
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "pty closed"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn reply_goes_to_pending_wait_then_terminal() {
        let router = InputRouter::new();
        let capture = Capture::default();
        router.attach(Box::new(capture.clone()));

        let pending = router.wait_for_reply();
        assert!(router.is_waiting());

        assert!(matches!(router.deliver("y"), Delivery::Reply));
        assert!(!router.is_waiting());
        assert_eq!(pending.wait(), InputReply::Text("y".to_string()));

        assert!(matches!(router.deliver("z"), Delivery::Terminal));
        assert_eq!(capture.text(), "z\n");
    }

    #[test]
    fn reply_wakes_blocked_waiter() {
        let router = Arc::new(InputRouter::new());
        let pending = router.wait_for_reply();

        let waiter = thread::spawn(move || pending.wait());
        thread::sleep(Duration::from_millis(50));
        router.deliver("continue");

        assert_eq!(
            waiter.join().unwrap(),
            InputReply::Text("continue".to_string())
        );
    }

    #[test]
    fn reply_before_block_is_not_lost() {
        let router = InputRouter::new();
        let pending = router.wait_for_reply();
        router.deliver("early");
        assert_eq!(pending.wait(), InputReply::Text("early".to_string()));
    }

    #[test]
    fn cancel_resolves_wait_with_sentinel() {
        let router = InputRouter::new();
        let pending = router.wait_for_reply();
        assert!(router.cancel_pending());
        assert!(!router.cancel_pending());
        assert_eq!(pending.wait(), InputReply::Cancelled);
    }

    #[test]
    fn newer_wait_cancels_older_one() {
        let router = InputRouter::new();
        let first = router.wait_for_reply();
        let second = router.wait_for_reply();
        router.deliver("answer");
        assert_eq!(first.wait(), InputReply::Cancelled);
        assert_eq!(second.wait(), InputReply::Text("answer".to_string()));
    }

    #[test]
    fn no_terminal_and_no_wait_is_a_noop() {
        let router = InputRouter::new();
        assert!(matches!(router.deliver("ignored"), Delivery::NoProcess));
    }

    #[test]
    fn write_failure_is_reported_not_raised() {
        let router = InputRouter::new();
        router.attach(Box::new(Broken));
        assert!(matches!(router.deliver("y"), Delivery::WriteFailed(_)));
        // The writer stays attached; the session is not torn down.
        assert!(router.has_terminal());
    }

    #[test]
    fn detach_stops_pass_through() {
        let router = InputRouter::new();
        let capture = Capture::default();
        router.attach(Box::new(capture.clone()));
        assert!(router.detach());
        assert!(!router.detach());
        assert!(!router.has_terminal());
        assert!(matches!(router.deliver("late"), Delivery::NoProcess));
        assert_eq!(capture.text(), "");
    }

    /// Writer whose writes block until the test releases them.
    struct Gated {
        entered: mpsc::SyncSender<()>,
        release: mpsc::Receiver<()>,
    }

    impl Write for Gated {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let _ = self.entered.try_send(());
            let _ = self.release.recv();
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stuck_terminal_write_leaves_wait_slot_available() {
        let router = Arc::new(InputRouter::new());
        let (entered_tx, entered_rx) = mpsc::sync_channel(1);
        let (release_tx, release_rx) = mpsc::channel();
        router.attach(Box::new(Gated {
            entered: entered_tx,
            release: release_rx,
        }));

        let sender = Arc::clone(&router);
        let stuck = thread::spawn(move || sender.deliver("big paste"));
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("write never started");

        let (done_tx, done_rx) = mpsc::channel();
        let other = Arc::clone(&router);
        thread::spawn(move || {
            assert!(!other.is_waiting());
            let pending = other.wait_for_reply();
            assert!(other.is_waiting());
            assert!(other.cancel_pending());
            assert_eq!(pending.wait(), InputReply::Cancelled);
            assert!(other.detach());
            done_tx.send(()).unwrap();
        });
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("router blocked behind a terminal write");

        release_tx.send(()).unwrap();
        assert!(matches!(stuck.join().unwrap(), Delivery::Terminal));
    }
}
