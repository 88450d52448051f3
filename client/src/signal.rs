//! Per-content readiness, written once by the stream receiver and awaited by
//! any number of filesystem callers.

use std::sync::atomic::{AtomicBool, Ordering};

use layerlift_delta::Error;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    /// The stream ended before the content arrived.
    Aborted,
}

pub struct ReadySignal {
    tx: watch::Sender<Readiness>,
    requested: AtomicBool,
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self {
            tx: watch::Sender::new(Readiness::Pending),
            requested: AtomicBool::new(false),
        }
    }
}

impl ReadySignal {
    pub fn ready() -> Self {
        Self {
            tx: watch::Sender::new(Readiness::Ready),
            requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> Readiness {
        *self.tx.borrow()
    }

    /// Moves a pending signal to `to`, waking every waiter. Returns false if
    /// the signal had already been resolved.
    fn resolve(&self, to: Readiness) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == Readiness::Pending {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    pub fn fire(&self) -> bool {
        self.resolve(Readiness::Ready)
    }

    pub fn abort(&self) -> bool {
        self.resolve(Readiness::Aborted)
    }

    /// True for the first caller only.
    pub fn mark_requested(&self) -> bool {
        !self.requested.swap(true, Ordering::SeqCst)
    }

    pub async fn wait(&self) -> Result<(), Error> {
        let mut rx = self.tx.subscribe();
        let state = *rx
            .wait_for(|state| *state != Readiness::Pending)
            .await
            .map_err(|_| Error::Transport("readiness signal dropped".into()))?;

        match state {
            Readiness::Ready => Ok(()),
            _ => Err(Error::Transport("transfer aborted".into())),
        }
    }
}

/// The signals of one delta, indexed by output queue position.
#[derive(Default)]
pub struct SignalTable {
    signals: Vec<ReadySignal>,
}

impl SignalTable {
    pub fn new(len: usize) -> Self {
        Self {
            signals: (0..len).map(|_| ReadySignal::default()).collect(),
        }
    }

    pub fn get(&self, order: u32) -> Option<&ReadySignal> {
        self.signals.get(order as usize)
    }

    pub fn fire(&self, order: u32) -> bool {
        self.get(order).map(|s| s.fire()).unwrap_or(false)
    }

    /// Fails every signal that has not fired yet. Returns how many there were.
    pub fn abort_pending(&self) -> usize {
        self.signals.iter().filter(|s| s.abort()).count()
    }

    pub fn pending(&self) -> usize {
        self.signals
            .iter()
            .filter(|s| s.state() == Readiness::Pending)
            .count()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}
