//! Session diagnostics
//!
//! Purely observational: a configured sink receives named events (phase
//! timings, ICE candidate sightings, reconnect outcomes, state transitions)
//! and a periodic counter report. Nothing here affects session correctness;
//! sink invocations are plain calls, never awaited.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// Callback receiving diagnostics events
pub type DiagnosticsSink = Arc<dyn Fn(DiagnosticsEvent) + Send + Sync>;

/// Named diagnostics events
#[derive(Debug, Clone)]
pub enum DiagnosticsEvent {
    /// One handshake phase finished
    PhaseTiming {
        /// Phase name (`transport`, `prehandshake`, `media`)
        phase: &'static str,
        /// Whether the phase completed successfully
        ok: bool,
        /// Elapsed time for the phase
        duration: Duration,
    },
    /// A local or remote ICE candidate was observed
    IceCandidate {
        /// `local` or `remote`
        direction: &'static str,
    },
    /// One reconnect attempt settled
    ReconnectAttempt {
        /// Reconnect generation the attempt belonged to
        generation: u64,
        /// Attempt number within the cycle (1-based)
        attempt: u32,
        /// Whether the attempt reached connected
        ok: bool,
    },
    /// Peer / ICE / signaling state transition
    StateTransition {
        /// Which state machine transitioned
        scope: &'static str,
        /// New state, rendered as text
        state: String,
    },
    /// Periodic counter report
    Report {
        /// ICE candidates seen since session start
        ice_candidates: u64,
        /// Reconnect attempts since session start
        reconnect_attempts: u64,
        /// Completed handshake phases since session start
        phases_completed: u64,
    },
}

/// Diagnostics collector bound to one session
///
/// Holds the optional sink plus running counters for the periodic report.
pub struct Diagnostics {
    sink: Option<DiagnosticsSink>,
    ice_candidates: AtomicU64,
    reconnect_attempts: AtomicU64,
    phases_completed: AtomicU64,
}

impl Diagnostics {
    /// Create a collector with an optional sink
    pub fn new(sink: Option<DiagnosticsSink>) -> Self {
        Self {
            sink,
            ice_candidates: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            phases_completed: AtomicU64::new(0),
        }
    }

    /// Collector that drops everything
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Whether a sink is configured
    pub fn enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Emit an event to the sink (if any) and bump counters
    pub fn emit(&self, event: DiagnosticsEvent) {
        match &event {
            DiagnosticsEvent::IceCandidate { .. } => {
                self.ice_candidates.fetch_add(1, Ordering::Relaxed);
            }
            DiagnosticsEvent::ReconnectAttempt { .. } => {
                self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            }
            DiagnosticsEvent::PhaseTiming { .. } => {
                self.phases_completed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        if let Some(sink) = &self.sink {
            sink(event);
        }
    }

    /// Emit the periodic counter report
    pub fn report(&self) {
        self.emit(DiagnosticsEvent::Report {
            ice_candidates: self.ice_candidates.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            phases_completed: self.phases_completed.load(Ordering::Relaxed),
        });
    }

    /// Spawn the periodic reporter task. Returns a handle the owner aborts on
    /// teardown. No-op (immediately finished) when no sink is configured.
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if !this.enabled() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; skip it so the first report has data.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                this.report();
            }
        })
    }
}

/// Measures one handshake phase and emits its timing on settle
pub(crate) struct PhaseTimer<'a> {
    diagnostics: &'a Diagnostics,
    phase: &'static str,
    started: Instant,
}

impl<'a> PhaseTimer<'a> {
    pub(crate) fn start(diagnostics: &'a Diagnostics, phase: &'static str) -> Self {
        debug!(phase, "handshake phase started");
        Self {
            diagnostics,
            phase,
            started: Instant::now(),
        }
    }

    pub(crate) fn finish(self, ok: bool) {
        let duration = self.started.elapsed();
        debug!(phase = self.phase, ok, ?duration, "handshake phase finished");
        self.diagnostics.emit(DiagnosticsEvent::PhaseTiming {
            phase: self.phase,
            ok,
            duration,
        });
    }
}
