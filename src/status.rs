//! Status Channel
//!
//! The training worker publishes human-readable status lines into an unbounded
//! FIFO queue; the control thread drains it on a timer. One logical producer
//! (the worker and its collaborators), one consumer. Ordering is the only
//! guarantee; there is no structured schema.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

/// Cloneable producer half of the status channel.
///
/// Pushing never blocks and never fails visibly: once the consumer is gone the
/// line is silently dropped, so collaborators can report status without caring
/// whether anyone is still listening.
#[derive(Clone)]
pub struct StatusSender {
    tx: Sender<String>,
}

impl StatusSender {
    /// Publish one status line.
    pub fn push(&self, line: impl Into<String>) {
        let _ = self.tx.send(line.into());
    }

    /// A sender whose lines go nowhere, for tests and headless runs.
    pub fn sink() -> Self {
        let (tx, _rx) = unbounded();
        Self { tx }
    }
}

/// Consumer half of the status channel.
pub struct StatusReceiver {
    rx: Receiver<String>,
}

impl StatusReceiver {
    /// Drain all lines currently queued without blocking.
    pub fn drain(&self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(line) => lines.push(line),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        lines
    }

    /// Block for at most `timeout` waiting for the next line.
    ///
    /// Returns `None` on timeout or when all senders have hung up.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<String> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// Create a connected status channel pair.
pub fn status_channel() -> (StatusSender, StatusReceiver) {
    let (tx, rx) = unbounded();
    (StatusSender { tx }, StatusReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_ordering() {
        let (tx, rx) = status_channel();
        tx.push("first");
        tx.push("second");
        tx.push("third");

        let lines = rx.drain();
        assert_eq!(lines, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_drain_empty() {
        let (_tx, rx) = status_channel();
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn test_push_after_receiver_dropped() {
        let (tx, rx) = status_channel();
        drop(rx);
        // Must not panic.
        tx.push("into the void");
    }

    #[test]
    fn test_sink_sender() {
        let tx = StatusSender::sink();
        tx.push("dropped");
    }

    #[test]
    fn test_recv_timeout() {
        let (tx, rx) = status_channel();
        tx.push("hello");
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(10)),
            Some("hello".to_string())
        );
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), None);
    }
}
