//! Realtime session manager
//!
//! [`RealtimeSession`] wraps the per-attempt [`Connection`] machinery with a
//! retry loop, reconnection on unexpected drops, and a stable external view:
//! callers observe `connected` / `reconnecting` / `disconnected` while the
//! per-attempt flapping underneath stays hidden. Every piece of in-flight
//! work carries the generation number it was started under; bumping the
//! generation (new connect, disconnect) strands older work so it can never
//! mutate the session it no longer owns.

pub mod retry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::diagnostics::{Diagnostics, DiagnosticsEvent, DiagnosticsSink};
use crate::media::{LocalMediaSource, MediaSessionFactory, RtcMediaSessionFactory};
use crate::{Error, Result};

pub use crate::connection::{ConnectionState, SessionEvent};

/// Stream of session events, returned by [`RealtimeSession::connect`]
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Interval between periodic diagnostics reports
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Options for [`RealtimeSession::set_image`]
#[derive(Debug, Clone, Default)]
pub struct SetImageOptions {
    /// Prompt to apply together with the image
    pub prompt: Option<String>,
    /// Enhance flag for the accompanying prompt
    pub enhance: Option<bool>,
    /// Acknowledgment deadline for this call; falls back to the configured
    /// image timeout
    pub timeout: Option<Duration>,
}

/// Partial update for [`RealtimeSession::set`]; at least one of `prompt`
/// and `image` must be present
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    /// New prompt text
    pub prompt: Option<String>,
    /// New reference image (base64)
    pub image: Option<String>,
    /// Enhance flag for the prompt
    pub enhance: Option<bool>,
}

struct SessionInner {
    config: Arc<ClientConfig>,
    factory: Arc<dyn MediaSessionFactory>,
    diagnostics: Arc<Diagnostics>,
    state_tx: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    intentional: AtomicBool,
    connection: RwLock<Option<Arc<Connection>>>,
    local: Mutex<Option<LocalMediaSource>>,
    conn_events_tx: mpsc::UnboundedSender<SessionEvent>,
    conn_events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    out_tx: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    reporter_started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Client session for streaming media to a model and receiving the
/// transformed result
pub struct RealtimeSession {
    inner: Arc<SessionInner>,
}

impl RealtimeSession {
    /// Create a session backed by real WebRTC media
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_factory(config, Arc::new(RtcMediaSessionFactory::new()), None)
    }

    /// Create a session with a custom media factory and diagnostics sink.
    /// The factory seam exists for embedders with their own media stack and
    /// for scripted tests.
    pub fn with_factory(
        config: ClientConfig,
        factory: Arc<dyn MediaSessionFactory>,
        diagnostics: Option<DiagnosticsSink>,
    ) -> Result<Self> {
        config.validate()?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (conn_events_tx, conn_events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(SessionInner {
                config: Arc::new(config),
                factory,
                diagnostics: Arc::new(Diagnostics::new(diagnostics)),
                state_tx,
                generation: AtomicU64::new(0),
                intentional: AtomicBool::new(false),
                connection: RwLock::new(None),
                local: Mutex::new(None),
                conn_events_tx,
                conn_events_rx: Mutex::new(Some(conn_events_rx)),
                out_tx: Mutex::new(None),
                reporter_started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Current externally visible state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.subscribe().borrow()
    }

    /// Watch for externally visible state changes
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Server-assigned session identifier, once announced
    pub async fn session_id(&self) -> Option<String> {
        let guard = self.inner.connection.read().await;
        guard.as_ref().and_then(|conn| conn.session_id())
    }

    /// Connect, attaching the caller's local tracks by reference.
    ///
    /// Resolves once media is established, returning the event stream.
    /// Events raised during the handshake are buffered and delivered through
    /// the stream in arrival order. Transient failures are retried under the
    /// configured policy; permanent failures surface immediately.
    pub async fn connect(&self, local: Option<LocalMediaSource>) -> Result<SessionEvents> {
        let inner = &self.inner;

        if !matches!(self.state(), ConnectionState::Disconnected) {
            return Err(Error::AlreadyConnected);
        }
        if inner.connection.read().await.is_some() {
            return Err(Error::AlreadyConnected);
        }

        inner.intentional.store(false, Ordering::SeqCst);
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&inner.local) = local;

        self.ensure_background_tasks();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *lock(&inner.out_tx) = Some(out_tx);

        set_external(inner, ConnectionState::Connecting);

        match run_attempts(inner, generation).await {
            Ok(conn) => {
                // A disconnect issued mid-handshake outranks the attempt.
                if stale(inner, generation) {
                    conn.teardown().await;
                    return Err(Error::Superseded);
                }
                *inner.connection.write().await = Some(conn.clone());
                set_external(inner, conn.state());
                spawn_monitor(inner, conn, generation);
                Ok(out_rx)
            }
            Err(e) => {
                if !stale(inner, generation) {
                    *lock(&inner.out_tx) = None;
                    set_external(inner, ConnectionState::Disconnected);
                }
                Err(e)
            }
        }
    }

    /// Disconnect and tear everything down; idempotent
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        info!("disconnect requested");
        inner.intentional.store(true, Ordering::SeqCst);
        inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(conn) = inner.connection.write().await.take() {
            conn.teardown().await;
        }
        set_external(inner, ConnectionState::Disconnected);
    }

    /// Update the generation prompt; resolves on server acknowledgment
    pub async fn set_prompt(&self, text: &str, enhance: bool) -> Result<()> {
        let conn = self.require_active().await?;
        conn.set_prompt(text, enhance, self.inner.config.prompt_timeout)
            .await
    }

    /// Update the reference image; `None` clears it
    pub async fn set_image(&self, image: Option<String>, options: SetImageOptions) -> Result<()> {
        if let Some(image) = &image {
            crate::config::validate_base64_image(image)?;
        }
        let conn = self.require_active().await?;
        let timeout = options.timeout.unwrap_or(self.inner.config.image_timeout);
        conn.set_image(image, options.prompt, options.enhance, timeout)
            .await
    }

    /// Apply a partial update of prompt and/or image in one request
    pub async fn set(&self, update: SessionUpdate) -> Result<()> {
        if update.prompt.is_none() && update.image.is_none() {
            return Err(Error::InvalidConfig(
                "update requires a prompt or an image".to_string(),
            ));
        }
        if let Some(image) = &update.image {
            crate::config::validate_base64_image(image)?;
        }
        let conn = self.require_active().await?;
        // Prompt-only updates ride the image-set message with a null image.
        conn.set_image(
            update.image,
            update.prompt,
            update.enhance,
            self.inner.config.image_timeout,
        )
        .await
    }

    /// Control requests require an established connection; while connecting,
    /// reconnecting, or disconnected they reject without sending anything
    async fn require_active(&self) -> Result<Arc<Connection>> {
        let state = self.state();
        if !matches!(
            state,
            ConnectionState::Connected | ConnectionState::Generating
        ) {
            return Err(Error::NotConnected(state.to_string()));
        }
        self.inner
            .connection
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::NotConnected(state.to_string()))
    }

    /// Start the event forwarder and diagnostics reporter, once
    fn ensure_background_tasks(&self) {
        let inner = &self.inner;
        if let Some(rx) = lock(&inner.conn_events_rx).take() {
            let weak = Arc::downgrade(inner);
            push_task(inner, tokio::spawn(forward_events(rx, weak)));
        }
        if inner.diagnostics.enabled() && !inner.reporter_started.swap(true, Ordering::SeqCst) {
            push_task(inner, inner.diagnostics.spawn_reporter(REPORT_INTERVAL));
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(conn) = self.connection.get_mut().take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { conn.teardown().await });
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Whether work started under `generation` has been outranked by a newer
/// cycle or an explicit disconnect
fn stale(inner: &SessionInner, generation: u64) -> bool {
    inner.generation.load(Ordering::SeqCst) != generation
        || inner.intentional.load(Ordering::SeqCst)
}

/// Track a background task, dropping handles of tasks that already finished
fn push_task(inner: &SessionInner, handle: JoinHandle<()>) {
    let mut tasks = lock(&inner.tasks);
    tasks.retain(|t| !t.is_finished());
    tasks.push(handle);
}

/// Update the external state and push the transition onto the event stream.
/// The shared event channel keeps state transitions ordered with connection
/// events.
fn set_external(inner: &SessionInner, state: ConnectionState) {
    let changed = inner.state_tx.send_if_modified(|current| {
        if *current != state {
            *current = state;
            true
        } else {
            false
        }
    });
    if changed {
        info!(%state, "session state");
        inner.diagnostics.emit(DiagnosticsEvent::StateTransition {
            scope: "session",
            state: state.to_string(),
        });
        let _ = inner.conn_events_tx.send(SessionEvent::State(state));
    }
}

/// Run connection attempts under the retry policy until one succeeds, the
/// budget runs out, a permanent error surfaces, or the generation goes stale
async fn run_attempts(inner: &Arc<SessionInner>, generation: u64) -> Result<Arc<Connection>> {
    let policy = inner.config.retry.clone();
    let local = lock(&inner.local).clone();
    let mut attempt: u32 = 0;

    loop {
        if stale(inner, generation) {
            return Err(Error::Superseded);
        }

        attempt += 1;
        let conn = Connection::new(
            inner.config.clone(),
            inner.factory.clone(),
            inner.diagnostics.clone(),
            inner.conn_events_tx.clone(),
        );

        match conn.connect(local.clone()).await {
            Ok(()) => {
                inner.diagnostics.emit(DiagnosticsEvent::ReconnectAttempt {
                    generation,
                    attempt,
                    ok: true,
                });
                // The cycle may have been outranked while this attempt was
                // still handshaking.
                if stale(inner, generation) {
                    conn.teardown().await;
                    return Err(Error::Superseded);
                }
                return Ok(conn);
            }
            Err(e) => {
                inner.diagnostics.emit(DiagnosticsEvent::ReconnectAttempt {
                    generation,
                    attempt,
                    ok: false,
                });
                if e.is_permanent() {
                    warn!(error = %e, "connect failed permanently; not retrying");
                    return Err(e);
                }
                if !policy.should_retry(attempt) {
                    warn!(attempt, error = %e, "retry budget exhausted");
                    return Err(e);
                }
                let backoff = policy.calculate_backoff(attempt - 1);
                debug!(attempt, ?backoff, error = %e, "connect attempt failed; backing off");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn spawn_monitor(inner: &Arc<SessionInner>, conn: Arc<Connection>, generation: u64) {
    let weak = Arc::downgrade(inner);
    push_task(inner, tokio::spawn(monitor(weak, conn, generation)));
}

/// Mirror the connection's state into the external view and run the
/// reconnect cycle when the connection drops unexpectedly
async fn monitor(weak: Weak<SessionInner>, conn: Arc<Connection>, generation: u64) {
    let mut rx = conn.state_watch();

    loop {
        let state = *rx.borrow_and_update();
        let inner = match weak.upgrade() {
            Some(inner) => inner,
            None => {
                conn.teardown().await;
                return;
            }
        };
        if stale(&inner, generation) {
            return;
        }
        match state {
            ConnectionState::Connected => set_external(&inner, ConnectionState::Connected),
            ConnectionState::Generating => set_external(&inner, ConnectionState::Generating),
            ConnectionState::Disconnected => break,
            _ => {}
        }
        drop(inner);
        if rx.changed().await.is_err() {
            break;
        }
    }

    // Unexpected drop: the old connection is discarded whole and a fresh
    // cycle starts under a new generation.
    let inner = match weak.upgrade() {
        Some(inner) => inner,
        None => {
            conn.teardown().await;
            return;
        }
    };
    if stale(&inner, generation) {
        return;
    }

    warn!("connection dropped; starting reconnect cycle");
    conn.teardown().await;
    *inner.connection.write().await = None;

    let new_generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
    set_external(&inner, ConnectionState::Reconnecting);

    match run_attempts(&inner, new_generation).await {
        Ok(new_conn) => {
            if stale(&inner, new_generation) {
                new_conn.teardown().await;
                return;
            }
            *inner.connection.write().await = Some(new_conn.clone());
            set_external(&inner, new_conn.state());
            spawn_monitor(&inner, new_conn, new_generation);
        }
        Err(e) => {
            if !stale(&inner, new_generation) {
                warn!(error = %e, "reconnect failed; giving up");
                let _ = inner
                    .conn_events_tx
                    .send(SessionEvent::Error(e.to_string()));
                set_external(&inner, ConnectionState::Disconnected);
            }
        }
    }
}

/// Drain connection events into the caller's stream. Events accumulate here
/// while `connect` is still resolving and flush in order once the caller
/// holds the receiver.
async fn forward_events(mut rx: mpsc::UnboundedReceiver<SessionEvent>, weak: Weak<SessionInner>) {
    while let Some(event) = rx.recv().await {
        match weak.upgrade() {
            Some(inner) => {
                let out = lock(&inner.out_tx).clone();
                if let Some(out) = out {
                    let _ = out.send(event);
                }
            }
            None => break,
        }
    }
    debug!("event forwarder stopped");
}
