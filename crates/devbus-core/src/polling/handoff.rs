//! Single-slot command hand-off to a worker thread.
//!
//! A sender blocks until the worker has taken *and* acknowledged its
//! command, or the timeout elapses. The slot is exclusive: a second sender
//! waits for the first hand-off to finish instead of overwriting it.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandoffError {
    #[error("worker did not acknowledge in time")]
    TimedOut,
    #[error("worker is gone")]
    Disconnected,
}

/// Acknowledgement token handed to the worker with each command.
#[derive(Debug)]
pub struct Ack(Sender<()>);

impl Ack {
    pub fn done(self) {
        let _ = self.0.send(());
    }
}

#[derive(Debug)]
pub struct Envelope<C> {
    pub command: C,
    pub ack: Ack,
}

#[derive(Debug)]
pub struct Handoff<C> {
    tx: Sender<Envelope<C>>,
    slot: Mutex<()>,
    timeout: Duration,
}

/// Create a hand-off and the worker's receiving end.
pub fn handoff<C>(timeout: Duration) -> (Handoff<C>, Receiver<Envelope<C>>) {
    let (tx, rx) = bounded(1);
    (
        Handoff {
            tx,
            slot: Mutex::new(()),
            timeout,
        },
        rx,
    )
}

impl<C> Handoff<C> {
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Deliver `command` and wait for the worker's acknowledgement.
    pub fn send(&self, command: C) -> Result<(), HandoffError> {
        let deadline = Instant::now() + self.timeout;
        let Some(_slot) = self.slot.try_lock_for(self.timeout) else {
            return Err(HandoffError::TimedOut);
        };

        let (ack_tx, ack_rx) = bounded(1);
        let envelope = Envelope {
            command,
            ack: Ack(ack_tx),
        };
        match self.tx.send_timeout(envelope, remaining(deadline)) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Err(HandoffError::TimedOut),
            Err(SendTimeoutError::Disconnected(_)) => return Err(HandoffError::Disconnected),
        }

        match ack_rx.recv_timeout(remaining(deadline)) {
            Ok(()) => Ok(()),
            Err(RecvTimeoutError::Timeout) => Err(HandoffError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(HandoffError::Disconnected),
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn concurrent_senders_are_serialized() {
        let (tx, rx) = handoff::<u32>(Duration::from_secs(2));
        let tx = Arc::new(tx);
        let worker = thread::spawn(move || {
            let mut seen = Vec::new();
            while let Ok(env) = rx.recv() {
                thread::sleep(Duration::from_millis(30));
                seen.push(env.command);
                env.ack.done();
            }
            seen
        });

        let senders: Vec<_> = (1..=2)
            .map(|n| {
                let tx = Arc::clone(&tx);
                thread::spawn(move || tx.send(n))
            })
            .collect();
        for s in senders {
            assert_eq!(s.join().unwrap(), Ok(()));
        }

        drop(tx);
        let mut seen = worker.join().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn silent_worker_times_out() {
        let (tx, rx) = handoff::<()>(Duration::from_millis(50));
        let started = Instant::now();
        assert_eq!(tx.send(()), Err(HandoffError::TimedOut));
        assert!(started.elapsed() >= Duration::from_millis(50));
        drop(rx);
    }

    #[test]
    fn dropped_ack_is_a_disconnect() {
        let (tx, rx) = handoff::<()>(Duration::from_secs(2));
        let worker = thread::spawn(move || {
            let env = rx.recv().unwrap();
            drop(env);
        });
        assert_eq!(tx.send(()), Err(HandoffError::Disconnected));
        worker.join().unwrap();
    }

    #[test]
    fn gone_worker_is_a_disconnect() {
        let (tx, rx) = handoff::<()>(Duration::from_secs(2));
        drop(rx);
        assert_eq!(tx.send(()), Err(HandoffError::Disconnected));
    }
}
