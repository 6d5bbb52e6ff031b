use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flare_proto::{
    CallRejection, CallReply, ClientMessage, GatewayCall, ParticipantId, ParticipantInfo,
    RejectionCode, ServerMessage, SessionId,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),
    #[error("websocket connect failed: {0}")]
    Connect(#[source] Box<WsError>),
    #[error("gateway connection closed")]
    Closed,
    #[error("gateway rejected {method} ({code:?}): {message}")]
    Rejected {
        method: &'static str,
        code: RejectionCode,
        message: String,
    },
    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),
    #[error("gateway event stream already taken")]
    EventsTaken,
}

impl SignalingError {
    pub fn rejection_code(&self) -> Option<RejectionCode> {
        match self {
            SignalingError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Outbound relay used by negotiation engines.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send_session_description(
        &self,
        destination: ParticipantId,
        payload: String,
    ) -> Result<(), SignalingError>;

    async fn send_ice_candidate(
        &self,
        destination: ParticipantId,
        payload: String,
    ) -> Result<(), SignalingError>;
}

/// Pushed notifications from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    ParticipantJoined {
        participant_id: ParticipantId,
        info: ParticipantInfo,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    IceCandidate {
        origin: ParticipantId,
        payload: String,
    },
    SessionDescription {
        origin: ParticipantId,
        payload: String,
        info: ParticipantInfo,
    },
    Closed {
        reason: CloseReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection of the same participant took over.
    Superseded,
    /// The socket dropped or the gateway went away.
    Lost,
}

/// Close-frame reason the gateway sends to a displaced connection.
const SUPERSEDED_REASON: &str = "superseded";

type ReplySender = oneshot::Sender<Result<CallReply, CallRejection>>;

/// In-flight calls by invocation id. The closed flag lives under the same
/// lock, so a call is either registered before close drains the table or
/// refused after it.
#[derive(Default)]
struct CallTable {
    inner: Mutex<CallTableState>,
}

#[derive(Default)]
struct CallTableState {
    closed: bool,
    calls: HashMap<u64, ReplySender>,
}

impl CallTable {
    fn register(
        &self,
        invocation_id: u64,
    ) -> Result<oneshot::Receiver<Result<CallReply, CallRejection>>, SignalingError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(SignalingError::Closed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        state.calls.insert(invocation_id, reply_tx);
        Ok(reply_rx)
    }

    fn complete(&self, invocation_id: u64, result: Result<CallReply, CallRejection>) -> bool {
        match self.inner.lock().calls.remove(&invocation_id) {
            Some(reply) => {
                let _ = reply.send(result);
                true
            }
            None => false,
        }
    }

    fn cancel(&self, invocation_id: u64) {
        self.inner.lock().calls.remove(&invocation_id);
    }

    /// Refuses new calls and drops every pending reply sender.
    fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        state.calls.clear();
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }
}

/// Client end of the gateway websocket: request/response calls correlated by
/// invocation id plus a one-shot stream of pushed events.
pub struct GatewayConnection {
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    calls: Arc<CallTable>,
    next_invocation: AtomicU64,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<GatewayEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayConnection {
    pub async fn connect(
        gateway_url: &str,
        token: &str,
        heartbeat: Duration,
    ) -> Result<Arc<Self>, SignalingError> {
        let url = derive_websocket_url(gateway_url, token)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(Box::new(err)))?;
        debug!(gateway = %redact_token(&url), "gateway websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<GatewayEvent>();
        let calls = Arc::new(CallTable::default());

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to encode gateway message"),
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_calls = Arc::clone(&calls);
        let reader = tokio::spawn(async move {
            let mut reason = CloseReason::Lost;
            while let Some(frame) = ws_read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        trace!(len = text.len(), "gateway frame received");
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(message) => dispatch(message, &reader_calls, &events_tx),
                            Err(err) => warn!(error = %err, "unrecognised gateway frame"),
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let text = frame.map(|f| f.reason.to_string());
                        if text.as_deref() == Some(SUPERSEDED_REASON) {
                            reason = CloseReason::Superseded;
                        }
                        debug!(reason = ?text, "gateway closed websocket");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!("gateway websocket closed: {err}");
                            }
                            _ => warn!("gateway websocket error: {err}"),
                        }
                        break;
                    }
                }
            }
            reader_calls.close();
            let _ = events_tx.send(GatewayEvent::Closed { reason });
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        Ok(Arc::new(Self {
            send_tx,
            calls,
            next_invocation: AtomicU64::new(1),
            events_rx: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(vec![writer, reader, heartbeat_task]),
        }))
    }

    /// Takes the pushed event stream. Only the first caller gets it.
    pub fn events(&self) -> Result<mpsc::UnboundedReceiver<GatewayEvent>, SignalingError> {
        self.events_rx.lock().take().ok_or(SignalingError::EventsTaken)
    }

    pub fn is_closed(&self) -> bool {
        self.calls.is_closed()
    }

    pub async fn join_session(&self, session_id: SessionId) -> Result<(), SignalingError> {
        self.expect_ack(GatewayCall::JoinSession { session_id }).await
    }

    pub async fn leave_session(&self) -> Result<(), SignalingError> {
        self.expect_ack(GatewayCall::LeaveCurrentSession).await
    }

    pub async fn participant_info(
        &self,
        participant_id: ParticipantId,
    ) -> Result<ParticipantInfo, SignalingError> {
        match self
            .invoke(GatewayCall::GetParticipant { participant_id })
            .await?
        {
            CallReply::Participant { info } => Ok(info),
            CallReply::Ack => Err(SignalingError::UnexpectedReply("get_participant")),
        }
    }

    /// Stops the background tasks; pending and later calls resolve as closed.
    pub fn close(&self) {
        self.calls.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn expect_ack(&self, call: GatewayCall) -> Result<(), SignalingError> {
        let method = call.method();
        match self.invoke(call).await? {
            CallReply::Ack => Ok(()),
            CallReply::Participant { .. } => Err(SignalingError::UnexpectedReply(method)),
        }
    }

    async fn invoke(&self, call: GatewayCall) -> Result<CallReply, SignalingError> {
        let method = call.method();
        let invocation_id = self.next_invocation.fetch_add(1, Ordering::SeqCst);
        let reply_rx = self.calls.register(invocation_id)?;

        if self
            .send_tx
            .send(ClientMessage::Invoke {
                invocation_id,
                call,
            })
            .is_err()
        {
            self.calls.cancel(invocation_id);
            return Err(SignalingError::Closed);
        }

        match reply_rx.await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(rejection)) => Err(SignalingError::Rejected {
                method,
                code: rejection.code,
                message: rejection.message,
            }),
            Err(_) => Err(SignalingError::Closed),
        }
    }
}

impl Drop for GatewayConnection {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingChannel for GatewayConnection {
    async fn send_session_description(
        &self,
        destination: ParticipantId,
        payload: String,
    ) -> Result<(), SignalingError> {
        self.expect_ack(GatewayCall::SendSessionDescription {
            destination,
            payload,
        })
        .await
    }

    async fn send_ice_candidate(
        &self,
        destination: ParticipantId,
        payload: String,
    ) -> Result<(), SignalingError> {
        self.expect_ack(GatewayCall::SendIceCandidate {
            destination,
            payload,
        })
        .await
    }
}

fn dispatch(
    message: ServerMessage,
    calls: &CallTable,
    events: &mpsc::UnboundedSender<GatewayEvent>,
) {
    let event = match message {
        ServerMessage::Completion {
            invocation_id,
            result,
        } => {
            if !calls.complete(invocation_id, result) {
                debug!(invocation_id, "completion for unknown invocation");
            }
            return;
        }
        ServerMessage::ParticipantJoined {
            participant_id,
            info,
        } => GatewayEvent::ParticipantJoined {
            participant_id,
            info,
        },
        ServerMessage::ParticipantLeft { participant_id } => {
            GatewayEvent::ParticipantLeft { participant_id }
        }
        ServerMessage::IceCandidate { origin, payload } => {
            GatewayEvent::IceCandidate { origin, payload }
        }
        ServerMessage::SessionDescription {
            origin,
            payload,
            info,
        } => GatewayEvent::SessionDescription {
            origin,
            payload,
            info,
        },
        ServerMessage::Pong => {
            trace!("gateway heartbeat acknowledged");
            return;
        }
        ServerMessage::Error { message } => {
            warn!(%message, "gateway reported an error");
            return;
        }
    };
    let _ = events.send(event);
}

/// Backoff for re-establishing a lost gateway connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Pause after the given failed attempt (1-based), doubling up to the cap.
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(16) as u32;
        self.initial_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}

/// Everything needed to open, and later reopen, a gateway connection.
#[derive(Debug, Clone)]
pub struct GatewayConnector {
    gateway_url: String,
    token: String,
    heartbeat: Duration,
    policy: ReconnectPolicy,
}

impl GatewayConnector {
    pub fn new(gateway_url: impl Into<String>, token: impl Into<String>, heartbeat: Duration) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            token: token.into(),
            heartbeat,
            policy: ReconnectPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub async fn connect(&self) -> Result<Arc<GatewayConnection>, SignalingError> {
        GatewayConnection::connect(&self.gateway_url, &self.token, self.heartbeat).await
    }

    /// Opens a fresh connection and joins `session_id` again, backing off
    /// between failed attempts. A rejection from the gateway ends the loop
    /// at once since retrying cannot change it.
    pub async fn rejoin(
        &self,
        session_id: SessionId,
    ) -> Result<(Arc<GatewayConnection>, mpsc::UnboundedReceiver<GatewayEvent>), SignalingError>
    {
        let mut last_error = SignalingError::Closed;
        for attempt in 1..=self.policy.max_attempts {
            match self.try_rejoin(session_id).await {
                Ok(joined) => {
                    info!(session_id = %session_id, attempt, "rejoined session");
                    return Ok(joined);
                }
                Err(err) if err.rejection_code().is_some() => {
                    warn!(session_id = %session_id, attempt, error = %err, "gateway refused rejoin");
                    return Err(err);
                }
                Err(err) => {
                    warn!(session_id = %session_id, attempt, error = %err, "reconnect attempt failed");
                    last_error = err;
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay_after(attempt)).await;
                    }
                }
            }
        }
        error!(
            session_id = %session_id,
            attempts = self.policy.max_attempts,
            error = %last_error,
            "giving up on gateway reconnect"
        );
        Err(last_error)
    }

    async fn try_rejoin(
        &self,
        session_id: SessionId,
    ) -> Result<(Arc<GatewayConnection>, mpsc::UnboundedReceiver<GatewayEvent>), SignalingError>
    {
        let connection = self.connect().await?;
        let events = connection.events()?;
        if let Err(err) = connection.join_session(session_id).await {
            connection.close();
            return Err(err);
        }
        Ok((connection, events))
    }
}

/// Accepts `http(s)://host[:port][/prefix]` or a websocket url and points it
/// at the gateway's `/ws` endpoint with the token attached.
pub fn derive_websocket_url(gateway_url: &str, token: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(gateway_url)
        .map_err(|err| SignalingError::InvalidUrl(format!("{gateway_url}: {err}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(format!("cannot switch {gateway_url} to {scheme}")))?;
    if !url.path().ends_with("/ws") {
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
    }
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

fn redact_token(url: &Url) -> String {
    let mut redacted = url.clone();
    redacted.set_query(None);
    redacted.to_string()
}
