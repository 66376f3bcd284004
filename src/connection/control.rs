//! Pending control-request registry
//!
//! At most one acknowledgment listener exists per request kind. Registering a
//! new listener supersedes the old one, which resolves with
//! [`Error::Superseded`]. Prompt acknowledgments are correlated by the echoed
//! prompt text; an ack whose echo matches no listener is ignored as a
//! leftover from a superseded request. The waiter unregisters itself on drop,
//! so a timed-out or cancelled wait never leaks an entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ControlKind {
    Prompt,
    Image,
}

impl std::fmt::Display for ControlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlKind::Prompt => write!(f, "prompt"),
            ControlKind::Image => write!(f, "image"),
        }
    }
}

struct Pending {
    seq: u64,
    /// For prompt requests, the text the ack must echo
    match_text: Option<String>,
    tx: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
pub(crate) struct ControlRegistry {
    pending: Mutex<HashMap<ControlKind, Pending>>,
    next_seq: AtomicU64,
}

impl ControlRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a listener, superseding any outstanding one of the same kind
    pub(crate) fn register(
        self: &Arc<Self>,
        kind: ControlKind,
        match_text: Option<String>,
    ) -> AckWaiter {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.contains_key(&kind) {
            debug!(%kind, "superseding outstanding control request");
        }
        // Dropping the old sender resolves the old waiter as superseded.
        pending.insert(
            kind,
            Pending {
                seq,
                match_text,
                tx,
            },
        );
        AckWaiter {
            registry: self.clone(),
            kind,
            seq,
            rx: Some(rx),
        }
    }

    /// Resolve the outstanding listener of `kind`, if the echo matches
    pub(crate) fn resolve(&self, kind: ControlKind, echo: Option<&str>, outcome: Result<()>) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let matches = pending
            .get(&kind)
            .map(|p| match (&p.match_text, echo) {
                (Some(expected), Some(actual)) => expected == actual,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .unwrap_or(false);
        if !matches {
            debug!(%kind, ?echo, "acknowledgment matched no outstanding request");
            return;
        }
        if let Some(entry) = pending.remove(&kind) {
            let _ = entry.tx.send(outcome);
        }
    }

    /// Fail every outstanding listener, used on teardown
    pub(crate) fn fail_all(&self, reason: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in pending.drain() {
            let _ = entry.tx.send(Err(Error::NotConnected(reason.to_string())));
        }
    }

    fn unregister(&self, kind: ControlKind, seq: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.get(&kind).map(|p| p.seq) == Some(seq) {
            pending.remove(&kind);
        }
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Waits for one acknowledgment; unregisters on drop
pub(crate) struct AckWaiter {
    registry: Arc<ControlRegistry>,
    kind: ControlKind,
    seq: u64,
    rx: Option<oneshot::Receiver<Result<()>>>,
}

impl AckWaiter {
    /// Wait for the acknowledgment, bounded by `timeout`
    pub(crate) async fn wait(mut self, timeout: Duration) -> Result<()> {
        let rx = match self.rx.take() {
            Some(rx) => rx,
            None => return Err(Error::Superseded),
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped: a newer request of the same kind replaced us.
            Ok(Err(_)) => Err(Error::Superseded),
            Err(_) => Err(Error::Timeout(format!("{} acknowledgment", self.kind))),
        }
    }
}

impl Drop for AckWaiter {
    fn drop(&mut self) {
        self.registry.unregister(self.kind, self.seq);
    }
}
