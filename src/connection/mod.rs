//! Single connection attempt lifecycle
//!
//! A [`Connection`] owns one signaling transport and one media session and
//! drives the three-phase handshake: open the transport, deliver any initial
//! prompt/image over the control channel, then negotiate media. The phases
//! share one abort signal, so a transport closure or server error during any
//! phase cuts the whole attempt immediately rather than waiting out a
//! timeout. Reconnection lives above this type, in
//! [`crate::session::RealtimeSession`]; a failed or dropped `Connection` is
//! discarded, never repaired.

pub(crate) mod control;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::track::track_remote::TrackRemote;

use crate::config::ClientConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsEvent, PhaseTimer};
use crate::media::{
    IceServerEntry, LocalMediaSource, MediaSession, MediaSessionConfig, MediaSessionEvent,
    MediaSessionFactory, MediaSessionState,
};
use crate::sdp;
use crate::signaling::{ClientMessage, ServerMessage, SignalingTransport, TransportEvent};
use crate::{Error, Result};
use control::{ControlKind, ControlRegistry};

/// Connection state as observed by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No active connection
    Disconnected,
    /// Initial handshake in progress
    Connecting,
    /// Media session established
    Connected,
    /// Connected and actively generating transformed media
    Generating,
    /// Connection lost; a reconnect cycle is running
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Generating => "generating",
            ConnectionState::Reconnecting => "reconnecting",
        };
        write!(f, "{}", s)
    }
}

/// Events delivered to the session's event stream
#[derive(Clone)]
pub enum SessionEvent {
    /// Externally visible state transition
    State(ConnectionState),
    /// A remote track carrying transformed media arrived
    RemoteTrack(Arc<TrackRemote>),
    /// The server started generating
    GenerationStarted,
    /// The server stopped generating; the session stays connected
    GenerationEnded,
    /// Server-assigned session identifier
    SessionId(String),
    /// Non-fatal error surfaced mid-session
    Error(String),
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::State(s) => write!(f, "State({})", s),
            SessionEvent::RemoteTrack(_) => write!(f, "RemoteTrack"),
            SessionEvent::GenerationStarted => write!(f, "GenerationStarted"),
            SessionEvent::GenerationEnded => write!(f, "GenerationEnded"),
            SessionEvent::SessionId(id) => write!(f, "SessionId({})", id),
            SessionEvent::Error(e) => write!(f, "Error({})", e),
        }
    }
}

/// Shared abort signal; once fired it stays fired
#[derive(Clone)]
pub(crate) struct Abort {
    tx: Arc<watch::Sender<bool>>,
}

impl Abort {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn fire(&self) {
        let _ = self.tx.send(true);
    }

    pub(crate) async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// One connection attempt: transport + media session + dispatch tasks
pub(crate) struct Connection {
    /// Attempt identifier, used only for log correlation
    attempt_id: uuid::Uuid,
    config: Arc<ClientConfig>,
    factory: Arc<dyn MediaSessionFactory>,
    diagnostics: Arc<Diagnostics>,
    control: Arc<ControlRegistry>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    transport: RwLock<Option<SignalingTransport>>,
    media: RwLock<Option<Arc<dyn MediaSession>>>,
    media_events_tx: mpsc::UnboundedSender<MediaSessionEvent>,
    media_events_rx: Mutex<Option<mpsc::UnboundedReceiver<MediaSessionEvent>>>,
    local: Mutex<Option<LocalMediaSource>>,
    session_id: Mutex<Option<String>>,
    abort: Abort,
    failure: Mutex<Option<Error>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        factory: Arc<dyn MediaSessionFactory>,
        diagnostics: Arc<Diagnostics>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (media_events_tx, media_events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            attempt_id: uuid::Uuid::new_v4(),
            config,
            factory,
            diagnostics,
            control: ControlRegistry::new(),
            events,
            state_tx,
            transport: RwLock::new(None),
            media: RwLock::new(None),
            media_events_tx,
            media_events_rx: Mutex::new(Some(media_events_rx)),
            local: Mutex::new(None),
            session_id: Mutex::new(None),
            abort: Abort::new(),
            failure: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.subscribe().borrow()
    }

    pub(crate) fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run the full handshake, bounded by the configured connect timeout.
    /// On any failure the transport and media session are torn down before
    /// the error is returned.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        local: Option<LocalMediaSource>,
    ) -> Result<()> {
        debug!(attempt = %self.attempt_id, "starting connection attempt");
        *self.local.lock().unwrap_or_else(|e| e.into_inner()) = local;
        self.set_state(ConnectionState::Connecting);

        let deadline = self.config.connect_timeout;
        let result = match tokio::time::timeout(deadline, self.run_handshake()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("connection establishment".to_string())),
        };

        if let Err(e) = result {
            warn!(error = %e, "connection attempt failed");
            self.teardown().await;
            return Err(e);
        }

        info!("connection established");
        Ok(())
    }

    async fn run_handshake(self: &Arc<Self>) -> Result<()> {
        // Phase 1: signaling transport.
        let timer = PhaseTimer::start(&self.diagnostics, "transport");
        let url = self.config.signaling_url()?;
        let (transport, transport_rx) =
            match SignalingTransport::open(&url, self.config.connect_timeout).await {
                Ok(pair) => {
                    timer.finish(true);
                    pair
                }
                Err(e) => {
                    timer.finish(false);
                    return Err(e);
                }
            };
        *self.transport.write().await = Some(transport);
        self.spawn(signaling_pump(self.clone(), transport_rx));

        // Phases 2 and 3 race the shared abort so a transport closure or
        // server error cuts them immediately.
        let this = self.clone();
        tokio::select! {
            _ = self.abort.aborted() => Err(self.take_failure()),
            result = async move {
                this.run_prehandshake().await?;
                this.negotiate_media().await
            } => result,
        }
    }

    async fn run_prehandshake(self: &Arc<Self>) -> Result<()> {
        if self.config.initial_image.is_none() && self.config.initial_prompt.is_none() {
            return Ok(());
        }
        let timer = PhaseTimer::start(&self.diagnostics, "prehandshake");
        let result = async {
            if let Some(image) = &self.config.initial_image {
                self.set_image(Some(image.clone()), None, None, self.config.image_timeout)
                    .await?;
            }
            if let Some(prompt) = &self.config.initial_prompt {
                self.set_prompt(&prompt.text, prompt.enhance, self.config.prompt_timeout)
                    .await?;
            }
            Ok(())
        }
        .await;
        timer.finish(result.is_ok());
        result
    }

    async fn negotiate_media(self: &Arc<Self>) -> Result<()> {
        let timer = PhaseTimer::start(&self.diagnostics, "media");
        let result = async {
            let media_rx = self
                .media_events_rx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .ok_or_else(|| Error::MediaSessionError("media pump already started".to_string()))?;
            self.spawn(media_pump(self.clone(), media_rx));

            self.build_media_session(None).await?;
            self.send(&ClientMessage::Ready).await?;

            // The server now directs the offer/answer exchange; wait for
            // media to come up.
            let mut rx = self.state_tx.subscribe();
            loop {
                {
                    let state = *rx.borrow_and_update();
                    if matches!(
                        state,
                        ConnectionState::Connected | ConnectionState::Generating
                    ) {
                        return Ok(());
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(Error::MediaSessionError("connection dropped".to_string()));
                }
            }
        }
        .await;
        timer.finish(result.is_ok());
        result
    }

    /// Build (or rebuild) the media session. `restart` carries the
    /// attempt-scoped relay credentials from an ice-restart directive; they
    /// apply to this build only and never persist into the configuration.
    async fn build_media_session(self: &Arc<Self>, restart: Option<IceServerEntry>) -> Result<()> {
        if let Some(old) = self.media.write().await.take() {
            if let Err(e) = old.close().await {
                debug!("closing previous media session failed: {}", e);
            }
        }

        let mut ice_servers: Vec<IceServerEntry> = self
            .config
            .stun_servers
            .iter()
            .map(IceServerEntry::stun)
            .collect();
        for turn in &self.config.turn_servers {
            ice_servers.push(IceServerEntry::turn(
                &turn.url,
                &turn.username,
                &turn.credential,
            ));
        }
        if let Some(entry) = restart {
            ice_servers.push(entry);
        }

        let local = self.local.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let session = self
            .factory
            .create(
                MediaSessionConfig { ice_servers },
                local.as_ref(),
                self.media_events_tx.clone(),
            )
            .await?;
        *self.media.write().await = Some(session);
        Ok(())
    }

    async fn media(&self) -> Result<Arc<dyn MediaSession>> {
        self.media
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::MediaSessionError("no media session".to_string()))
    }

    async fn send(&self, msg: &ClientMessage) -> Result<()> {
        let guard = self.transport.read().await;
        match guard.as_ref() {
            Some(transport) => transport.send(msg),
            None => Err(Error::NotConnected("disconnected".to_string())),
        }
    }

    /// Send a prompt update and wait for its acknowledgment
    pub(crate) async fn set_prompt(
        &self,
        text: &str,
        enhance: bool,
        timeout: Duration,
    ) -> Result<()> {
        let waiter = self
            .control
            .register(ControlKind::Prompt, Some(text.to_string()));
        self.send(&ClientMessage::SetPrompt {
            prompt: text.to_string(),
            enhance,
        })
        .await?;
        waiter.wait(timeout).await
    }

    /// Send an image update (None clears) and wait for its acknowledgment
    pub(crate) async fn set_image(
        &self,
        image: Option<String>,
        prompt: Option<String>,
        enhance: Option<bool>,
        timeout: Duration,
    ) -> Result<()> {
        let waiter = self.control.register(ControlKind::Image, None);
        self.send(&ClientMessage::SetImage {
            image,
            prompt,
            enhance,
        })
        .await?;
        waiter.wait(timeout).await
    }

    /// Tear everything down; idempotent
    pub(crate) async fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("tearing down connection");
        self.abort.fire();
        self.control.fail_all("connection closed");

        if let Some(media) = self.media.write().await.take() {
            if let Err(e) = media.close().await {
                debug!("media close failed: {}", e);
            }
        }
        if let Some(transport) = self.transport.write().await.take() {
            transport.close();
        }

        self.set_state(ConnectionState::Disconnected);

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }

    fn spawn(&self, future: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(future);
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(%state, "connection state");
            self.diagnostics.emit(DiagnosticsEvent::StateTransition {
                scope: "connection",
                state: state.to_string(),
            });
        }
    }

    fn is_connecting(&self) -> bool {
        matches!(self.state(), ConnectionState::Connecting)
    }

    /// Record a failure and fire the shared abort; the first failure wins
    fn fail(&self, error: Error) {
        {
            let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        self.abort.fire();
    }

    fn take_failure(&self) -> Error {
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_else(|| Error::SignalingClosed("connection aborted".to_string()))
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn handle_frame(self: &Arc<Self>, msg: ServerMessage) -> Result<()> {
        match msg {
            ServerMessage::Ready => {
                let media = self.media().await?;
                let mut sdp = media.create_offer().await?;
                if let Some(kbps) = self.config.effective_bitrate_kbps() {
                    sdp = sdp::apply_video_bitrate(&sdp, kbps);
                }
                if let Some(codec) = self.config.preferred_video_codec {
                    sdp = sdp::prefer_video_codec(&sdp, codec);
                }
                self.send(&ClientMessage::Offer { sdp }).await
            }
            ServerMessage::Offer { sdp } => {
                let media = self.media().await?;
                let answer = media.accept_offer(&sdp).await?;
                self.send(&ClientMessage::Answer { sdp: answer }).await
            }
            ServerMessage::Answer { sdp } => {
                let media = self.media().await?;
                media.accept_answer(&sdp).await
            }
            ServerMessage::IceCandidate { candidate } => {
                self.diagnostics
                    .emit(DiagnosticsEvent::IceCandidate { direction: "remote" });
                let media = self.media().await?;
                media.add_remote_candidate(candidate).await
            }
            ServerMessage::IceRestart {
                url,
                username,
                credential,
            } => {
                info!("server requested ICE restart");
                self.build_media_session(Some(IceServerEntry::turn(url, username, credential)))
                    .await?;
                self.send(&ClientMessage::Ready).await
            }
            ServerMessage::Error { message } => {
                warn!(%message, "server error");
                if self.is_connecting() {
                    self.fail(Error::ServerError(message));
                } else {
                    self.emit(SessionEvent::Error(message));
                }
                Ok(())
            }
            ServerMessage::PromptAck {
                prompt,
                success,
                error,
            } => {
                let outcome = if success {
                    Ok(())
                } else {
                    Err(Error::ControlRejected(
                        error.unwrap_or_else(|| "prompt update rejected".to_string()),
                    ))
                };
                self.control
                    .resolve(ControlKind::Prompt, Some(prompt.as_str()), outcome);
                Ok(())
            }
            ServerMessage::ImageAck { success, error } => {
                let outcome = if success {
                    Ok(())
                } else {
                    Err(Error::ControlRejected(
                        error.unwrap_or_else(|| "image update rejected".to_string()),
                    ))
                };
                self.control.resolve(ControlKind::Image, None, outcome);
                Ok(())
            }
            ServerMessage::GenerationStarted => {
                self.set_state(ConnectionState::Generating);
                self.emit(SessionEvent::GenerationStarted);
                Ok(())
            }
            ServerMessage::GenerationEnded => {
                if self.state() == ConnectionState::Generating {
                    self.set_state(ConnectionState::Connected);
                }
                self.emit(SessionEvent::GenerationEnded);
                Ok(())
            }
            ServerMessage::SessionId { session_id } => {
                debug!(%session_id, "session id assigned");
                *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(session_id.clone());
                self.emit(SessionEvent::SessionId(session_id));
                Ok(())
            }
        }
    }

    fn handle_media_event(self: &Arc<Self>, event: MediaSessionEvent) {
        match event {
            MediaSessionEvent::StateChanged(state) => {
                self.diagnostics.emit(DiagnosticsEvent::StateTransition {
                    scope: "media",
                    state: format!("{:?}", state),
                });
                match state {
                    MediaSessionState::Connected => {
                        if self.is_connecting() {
                            self.set_state(ConnectionState::Connected);
                        }
                    }
                    MediaSessionState::Failed => {
                        if self.is_connecting() {
                            self.fail(Error::MediaSessionError(
                                "media negotiation failed".to_string(),
                            ));
                        } else {
                            self.emit(SessionEvent::Error(
                                "media session failed".to_string(),
                            ));
                            self.set_state(ConnectionState::Disconnected);
                        }
                    }
                    MediaSessionState::Disconnected => {
                        // During the handshake a brief ICE disconnect may
                        // recover; once connected it marks the drop.
                        if !self.is_connecting() {
                            self.set_state(ConnectionState::Disconnected);
                        }
                    }
                    MediaSessionState::Connecting | MediaSessionState::Closed => {}
                }
            }
            MediaSessionEvent::LocalIceCandidate(candidate) => {
                self.diagnostics
                    .emit(DiagnosticsEvent::IceCandidate { direction: "local" });
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.send(&ClientMessage::IceCandidate { candidate }).await {
                        debug!("failed to forward local candidate: {}", e);
                    }
                });
            }
            MediaSessionEvent::RemoteTrack(track) => {
                self.emit(SessionEvent::RemoteTrack(track));
            }
        }
    }
}

async fn signaling_pump(
    conn: Arc<Connection>,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = conn.abort.aborted() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            TransportEvent::Frame(msg) => {
                if let Err(e) = conn.handle_frame(msg).await {
                    if conn.is_connecting() {
                        conn.fail(e);
                    } else {
                        warn!("signaling handler error: {}", e);
                        conn.emit(SessionEvent::Error(e.to_string()));
                    }
                }
            }
            TransportEvent::Invalid(e) => {
                conn.emit(SessionEvent::Error(e.to_string()));
            }
            TransportEvent::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "closed by server".to_string());
                debug!(%reason, "signaling transport closed");
                if conn.is_connecting() {
                    conn.fail(Error::SignalingClosed(reason));
                } else {
                    conn.set_state(ConnectionState::Disconnected);
                }
                break;
            }
        }
    }
    debug!("signaling pump stopped");
}

async fn media_pump(conn: Arc<Connection>, mut rx: mpsc::UnboundedReceiver<MediaSessionEvent>) {
    loop {
        tokio::select! {
            _ = conn.abort.aborted() => break,
            event = rx.recv() => match event {
                Some(event) => conn.handle_media_event(event),
                None => break,
            },
        }
    }
    debug!("media pump stopped");
}
