use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flare_gateway::telemetry::detached_metrics_handle;
use flare_gateway::registry::ConnectionRegistry;
use flare_gateway::{Access, AppState, Gateway, StaticRoster};
use flare_proto::{
    CallRejection, CallReply, ClientMessage, GatewayCall, ParticipantId, ParticipantInfo,
    RejectionCode, ServerMessage, SessionId,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct Roster {
    session: SessionId,
    alice: ParticipantId,
    bob: ParticipantId,
}

fn roster() -> (StaticRoster, Roster) {
    let ids = Roster {
        session: SessionId::new(),
        alice: ParticipantId::new(),
        bob: ParticipantId::new(),
    };
    let mut roster = StaticRoster::new(false);
    roster.add_participant(ids.alice, "alice-token", "alice").unwrap();
    roster.add_participant(ids.bob, "bob-token", "bob").unwrap();
    roster.grant(ids.session, ids.alice);
    roster.grant(ids.session, ids.bob);
    (roster, ids)
}

async fn spawn_gateway(roster: StaticRoster) -> (SocketAddr, Arc<AppState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(AppState::new(
        Gateway::new(Access::from_roster(roster)),
        detached_metrics_handle(),
    ));
    tokio::spawn(flare_gateway::serve(
        listener,
        state.clone(),
        std::future::pending(),
    ));
    (addr, state)
}

fn live_registry(state: &AppState, session: SessionId) -> Option<Arc<ConnectionRegistry>> {
    state
        .gateway
        .directory()
        .live_sessions()
        .into_iter()
        .find(|registry| registry.session_id() == session)
}

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_invocation: u64,
    backlog: VecDeque<ServerMessage>,
}

impl TestClient {
    async fn connect(addr: SocketAddr, token: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token={token}"))
            .await
            .expect("websocket connect");
        Self {
            ws,
            next_invocation: 1,
            backlog: VecDeque::new(),
        }
    }

    async fn send(&mut self, message: &ClientMessage) {
        let text = serde_json::to_string(message).unwrap();
        self.ws.send(Message::Text(text)).await.unwrap();
    }

    async fn recv_frame(&mut self) -> Message {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if !matches!(frame, Message::Ping(_) | Message::Pong(_)) {
                return frame;
            }
        }
    }

    async fn recv(&mut self) -> ServerMessage {
        match self.recv_frame().await {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    async fn call(&mut self, call: GatewayCall) -> Result<CallReply, CallRejection> {
        let invocation_id = self.next_invocation;
        self.next_invocation += 1;
        self.send(&ClientMessage::Invoke {
            invocation_id,
            call,
        })
        .await;
        loop {
            match self.recv().await {
                ServerMessage::Completion {
                    invocation_id: id,
                    result,
                } if id == invocation_id => return result,
                other => self.backlog.push_back(other),
            }
        }
    }

    async fn next_event(&mut self) -> ServerMessage {
        match self.backlog.pop_front() {
            Some(message) => message,
            None => self.recv().await,
        }
    }

    async fn join(&mut self, session_id: SessionId) {
        let reply = self.call(GatewayCall::JoinSession { session_id }).await;
        assert_eq!(reply, Ok(CallReply::Ack));
    }
}

#[test_timeout::tokio_timeout_test]
async fn unknown_token_is_refused_before_upgrade() {
    let (roster, _) = roster();
    let (addr, _state) = spawn_gateway(roster).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=nope"))
        .await
        .unwrap_err();

    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 401),
        other => panic!("expected http rejection, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn join_announces_presence_and_relays_descriptions() {
    let (roster, ids) = roster();
    let (addr, state) = spawn_gateway(roster).await;
    let mut alice = TestClient::connect(addr, "alice-token").await;
    let mut bob = TestClient::connect(addr, "bob-token").await;

    alice.join(ids.session).await;
    bob.join(ids.session).await;

    assert_eq!(
        alice.next_event().await,
        ServerMessage::ParticipantJoined {
            participant_id: ids.bob,
            info: ParticipantInfo::new("bob"),
        }
    );

    let sent = alice
        .call(GatewayCall::SendSessionDescription {
            destination: ids.bob,
            payload: r#"{"type":"offer","sdp":"v=0"}"#.into(),
        })
        .await;
    assert_eq!(sent, Ok(CallReply::Ack));
    assert_eq!(
        bob.next_event().await,
        ServerMessage::SessionDescription {
            origin: ids.alice,
            payload: r#"{"type":"offer","sdp":"v=0"}"#.into(),
            info: ParticipantInfo::new("alice"),
        }
    );

    let registry = live_registry(&state, ids.session).unwrap();
    assert_eq!(registry.len(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn relay_to_absent_participant_is_rejected() {
    let (roster, ids) = roster();
    let (addr, _state) = spawn_gateway(roster).await;
    let mut alice = TestClient::connect(addr, "alice-token").await;
    alice.join(ids.session).await;

    let reply = alice
        .call(GatewayCall::SendIceCandidate {
            destination: ids.bob,
            payload: "{}".into(),
        })
        .await;

    assert_eq!(reply.unwrap_err().code, RejectionCode::DestinationNotFound);
}

#[test_timeout::tokio_timeout_test]
async fn reconnect_supersedes_previous_connection() {
    let (roster, ids) = roster();
    let (addr, _state) = spawn_gateway(roster).await;
    let mut first = TestClient::connect(addr, "alice-token").await;
    let mut bob = TestClient::connect(addr, "bob-token").await;
    first.join(ids.session).await;
    bob.join(ids.session).await;

    let mut second = TestClient::connect(addr, "alice-token").await;
    second.join(ids.session).await;

    loop {
        match first.recv_frame().await {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Policy);
                assert_eq!(frame.reason, "superseded");
                break;
            }
            Message::Text(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    assert_eq!(
        bob.next_event().await,
        ServerMessage::ParticipantJoined {
            participant_id: ids.alice,
            info: ParticipantInfo::new("alice"),
        }
    );
    let sent = bob
        .call(GatewayCall::SendIceCandidate {
            destination: ids.alice,
            payload: "cand".into(),
        })
        .await;
    assert_eq!(sent, Ok(CallReply::Ack));
    assert_eq!(
        second.next_event().await,
        ServerMessage::IceCandidate {
            origin: ids.bob,
            payload: "cand".into(),
        }
    );
}

#[test_timeout::tokio_timeout_test]
async fn dropped_socket_broadcasts_leave() {
    let (roster, ids) = roster();
    let (addr, state) = spawn_gateway(roster).await;
    let mut alice = TestClient::connect(addr, "alice-token").await;
    let mut bob = TestClient::connect(addr, "bob-token").await;
    alice.join(ids.session).await;
    bob.join(ids.session).await;
    alice.next_event().await;

    drop(bob);

    assert_eq!(
        alice.next_event().await,
        ServerMessage::ParticipantLeft {
            participant_id: ids.bob
        }
    );
    let registry = live_registry(&state, ids.session).unwrap();
    let members: Vec<ParticipantId> = registry
        .snapshot()
        .into_iter()
        .map(|(participant, _)| participant)
        .collect();
    assert_eq!(members, vec![ids.alice]);
}

#[test_timeout::tokio_timeout_test]
async fn heartbeat_and_malformed_frames() {
    let (roster, _) = roster();
    let (addr, _state) = spawn_gateway(roster).await;
    let mut alice = TestClient::connect(addr, "alice-token").await;

    alice.send(&ClientMessage::Ping).await;
    assert_eq!(alice.recv().await, ServerMessage::Pong);

    alice
        .ws
        .send(Message::Text("{\"type\":\"bogus\"}".into()))
        .await
        .unwrap();
    assert!(matches!(alice.recv().await, ServerMessage::Error { .. }));

    alice.send(&ClientMessage::Ping).await;
    assert_eq!(alice.recv().await, ServerMessage::Pong);
}

#[test_timeout::tokio_timeout_test]
async fn undecodable_call_is_answered_with_bad_request() {
    let (roster, _) = roster();
    let (addr, _state) = spawn_gateway(roster).await;
    let mut alice = TestClient::connect(addr, "alice-token").await;

    for (invocation_id, call) in [
        (42, r#"{"method":"send_offer"}"#),
        (43, r#"{"method":"send_ice_candidate","destination":"nope"}"#),
    ] {
        let frame = format!(r#"{{"type":"invoke","invocation_id":{invocation_id},"call":{call}}}"#);
        alice.ws.send(Message::Text(frame)).await.unwrap();

        match alice.recv().await {
            ServerMessage::Completion {
                invocation_id: id,
                result: Err(rejection),
            } => {
                assert_eq!(id, invocation_id);
                assert_eq!(rejection.code, RejectionCode::BadRequest);
            }
            other => panic!("expected bad request completion, got {other:?}"),
        }
    }

    let info = alice
        .call(GatewayCall::GetParticipant {
            participant_id: ParticipantId::new(),
        })
        .await;
    assert_eq!(info.unwrap_err().code, RejectionCode::ParticipantNotFound);
}

#[test_timeout::tokio_timeout_test]
async fn unauthorized_session_is_rejected() {
    let (roster, _) = roster();
    let (addr, state) = spawn_gateway(roster).await;
    let mut alice = TestClient::connect(addr, "alice-token").await;
    let elsewhere = SessionId::new();

    let reply = alice
        .call(GatewayCall::JoinSession {
            session_id: elsewhere,
        })
        .await;

    assert_eq!(reply.unwrap_err().code, RejectionCode::Unauthorized);
    assert!(live_registry(&state, elsewhere).is_none());
}
