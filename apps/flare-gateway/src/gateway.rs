use std::sync::Arc;

use flare_proto::{
    CallRejection, CallReply, ConnectionId, GatewayCall, ParticipantId, ParticipantInfo,
    RejectionCode, RelayKind, ServerMessage, SessionId,
};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::access::Access;
use crate::directory::SessionDirectory;
use crate::registry::{ConnectionHandle, ConnectionRegistry, JoinOutcome};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("participant {participant} is not authorized for session {session}")]
    Unauthorized {
        participant: ParticipantId,
        session: SessionId,
    },
    #[error("connection has not joined a session")]
    NoActiveSession,
    #[error("participant {0} is not connected to this session")]
    DestinationNotFound(ParticipantId),
    #[error("participant {0} is unknown")]
    ParticipantNotFound(ParticipantId),
    #[error("connection {connection} no longer represents participant {participant}")]
    StaleConnection {
        participant: ParticipantId,
        connection: ConnectionId,
    },
}

impl GatewayError {
    /// Rejection sent back to the caller. `None` means the connection must be
    /// terminated instead of answered.
    pub fn rejection(&self) -> Option<CallRejection> {
        let code = match self {
            GatewayError::Unauthorized { .. } => RejectionCode::Unauthorized,
            GatewayError::NoActiveSession => RejectionCode::NoActiveSession,
            GatewayError::DestinationNotFound(_) => RejectionCode::DestinationNotFound,
            GatewayError::ParticipantNotFound(_) => RejectionCode::ParticipantNotFound,
            GatewayError::StaleConnection { .. } => return None,
        };
        Some(CallRejection::new(code, self.to_string()))
    }

    fn metric_label(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized { .. } => "unauthorized",
            GatewayError::NoActiveSession => "no_active_session",
            GatewayError::DestinationNotFound(_) => "destination_not_found",
            GatewayError::ParticipantNotFound(_) => "participant_not_found",
            GatewayError::StaleConnection { .. } => "stale_connection",
        }
    }
}

/// Shared gateway state: the session directory plus the access collaborators.
#[derive(Clone)]
pub struct Gateway {
    directory: SessionDirectory,
    access: Access,
}

impl Gateway {
    pub fn new(access: Access) -> Self {
        Self {
            directory: SessionDirectory::new(),
            access,
        }
    }

    pub fn directory(&self) -> &SessionDirectory {
        &self.directory
    }

    pub fn access(&self) -> &Access {
        &self.access
    }

    /// Per-connection protocol state for an authenticated participant.
    pub fn connect(&self, participant: ParticipantId, handle: ConnectionHandle) -> Connection {
        counter!("flare_gateway_connections_total", 1);
        Connection {
            gateway: self.clone(),
            participant,
            handle,
            session: None,
        }
    }
}

/// Protocol handler for one transport connection.
pub struct Connection {
    gateway: Gateway,
    participant: ParticipantId,
    handle: ConnectionHandle,
    session: Option<Arc<ConnectionRegistry>>,
}

impl Connection {
    pub fn participant_id(&self) -> ParticipantId {
        self.participant
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|registry| registry.session_id())
    }

    pub async fn dispatch(&mut self, call: GatewayCall) -> Result<CallReply, GatewayError> {
        let method = call.method();
        counter!("flare_gateway_calls_total", 1, "method" => method);

        let result = match call {
            GatewayCall::JoinSession { session_id } => {
                self.join_session(session_id).await.map(|_| CallReply::Ack)
            }
            GatewayCall::LeaveCurrentSession => self.leave_session().await.map(|_| CallReply::Ack),
            GatewayCall::SendIceCandidate {
                destination,
                payload,
            } => self
                .relay(destination, RelayKind::IceCandidate, payload)
                .await
                .map(|_| CallReply::Ack),
            GatewayCall::SendSessionDescription {
                destination,
                payload,
            } => self
                .relay(destination, RelayKind::SessionDescription, payload)
                .await
                .map(|_| CallReply::Ack),
            GatewayCall::GetParticipant { participant_id } => self
                .participant_info(participant_id)
                .await
                .map(|info| CallReply::Participant { info }),
        };

        if let Err(err) = &result {
            counter!(
                "flare_gateway_calls_failed_total",
                1,
                "method" => method,
                "reason" => err.metric_label()
            );
        }
        result
    }

    pub async fn join_session(&mut self, session_id: SessionId) -> Result<(), GatewayError> {
        self.ensure_singleton()?;

        let access = self.gateway.access.clone();
        if !access
            .authorizer
            .is_authorized(self.participant, session_id)
            .await
        {
            return Err(GatewayError::Unauthorized {
                participant: self.participant,
                session: session_id,
            });
        }
        let info = self.own_info().await;

        if let Some(current) = self.session.take() {
            if current.session_id() != session_id {
                self.depart(&current);
            }
        }

        let registry = self.gateway.directory.get_or_create(session_id);
        let joined = registry
            .join(self.participant, self.handle.clone(), true)
            .map_err(|_| GatewayError::StaleConnection {
                participant: self.participant,
                connection: self.handle.id(),
            })?;
        self.session = Some(Arc::clone(&registry));

        match joined.outcome {
            JoinOutcome::AlreadyJoined => {
                debug!(
                    session_id = %session_id,
                    participant_id = %self.participant,
                    "connection re-joined its current session"
                );
                return Ok(());
            }
            JoinOutcome::Replaced(previous) => {
                warn!(
                    session_id = %session_id,
                    participant_id = %self.participant,
                    previous_connection = %previous.id(),
                    connection_id = %self.handle.id(),
                    "newer connection displaced previous one"
                );
                previous.close("superseded");
            }
            JoinOutcome::Inserted => {}
        }

        let notified = broadcast(
            &joined.others,
            ServerMessage::ParticipantJoined {
                participant_id: self.participant,
                info,
            },
        );
        counter!("flare_gateway_joins_total", 1);
        info!(
            session_id = %session_id,
            participant_id = %self.participant,
            connection_id = %self.handle.id(),
            notified,
            "participant joined session"
        );
        Ok(())
    }

    pub async fn leave_session(&mut self) -> Result<(), GatewayError> {
        self.ensure_singleton()?;
        let registry = self.session.take().ok_or(GatewayError::NoActiveSession)?;
        self.depart(&registry);
        Ok(())
    }

    pub async fn relay(
        &mut self,
        destination: ParticipantId,
        kind: RelayKind,
        payload: String,
    ) -> Result<(), GatewayError> {
        self.ensure_singleton()?;
        let registry = self.session.as_ref().ok_or(GatewayError::NoActiveSession)?;
        let target = registry
            .resolve(destination)
            .ok_or(GatewayError::DestinationNotFound(destination))?;

        let message = match kind {
            RelayKind::IceCandidate => ServerMessage::IceCandidate {
                origin: self.participant,
                payload,
            },
            RelayKind::SessionDescription => ServerMessage::SessionDescription {
                origin: self.participant,
                payload,
                info: self.own_info().await,
            },
        };

        if !target.deliver(message) {
            return Err(GatewayError::DestinationNotFound(destination));
        }
        counter!("flare_gateway_relays_total", 1, "kind" => kind.label());
        debug!(
            kind = kind.label(),
            origin = %self.participant,
            destination = %destination,
            "relayed payload"
        );
        Ok(())
    }

    pub async fn participant_info(
        &self,
        participant: ParticipantId,
    ) -> Result<ParticipantInfo, GatewayError> {
        self.gateway
            .access
            .profiles
            .display_info(participant)
            .await
            .ok_or(GatewayError::ParticipantNotFound(participant))
    }

    /// Transport-level disconnect. Acts as a leave while this connection is
    /// still the registered one for its participant.
    pub fn disconnected(&mut self) {
        if let Some(registry) = self.session.take() {
            if self.depart(&registry) {
                debug!(
                    session_id = %registry.session_id(),
                    participant_id = %self.participant,
                    "disconnect treated as leave"
                );
            }
        }
    }

    fn ensure_singleton(&self) -> Result<(), GatewayError> {
        match &self.session {
            Some(registry) if !registry.is_current(self.participant, self.handle.id()) => {
                counter!("flare_gateway_stale_aborts_total", 1);
                Err(GatewayError::StaleConnection {
                    participant: self.participant,
                    connection: self.handle.id(),
                })
            }
            _ => Ok(()),
        }
    }

    fn depart(&self, registry: &ConnectionRegistry) -> bool {
        let Some(remaining) = registry.leave_if_current(self.participant, self.handle.id()) else {
            return false;
        };
        let notified = broadcast(
            &remaining,
            ServerMessage::ParticipantLeft {
                participant_id: self.participant,
            },
        );
        counter!("flare_gateway_leaves_total", 1);
        info!(
            session_id = %registry.session_id(),
            participant_id = %self.participant,
            notified,
            "participant left session"
        );
        true
    }

    async fn own_info(&self) -> ParticipantInfo {
        self.gateway
            .access
            .profiles
            .display_info(self.participant)
            .await
            .unwrap_or_else(|| ParticipantInfo::new(self.participant.to_string()))
    }
}

/// Delivers to the members captured by the registry operation itself, so the
/// recipients match the membership the join or leave actually observed.
fn broadcast(recipients: &[ConnectionHandle], message: ServerMessage) -> usize {
    recipients
        .iter()
        .filter(|handle| handle.deliver(message.clone()))
        .count()
}
