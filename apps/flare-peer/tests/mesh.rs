use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flare_gateway::telemetry::detached_metrics_handle;
use flare_gateway::{Access, AppState, Gateway, StaticRoster};
use flare_peer::transport::MemoryFactory;
use flare_peer::{
    ClientEvent, ConnectionState, GatewayClient, GatewayConnection, GatewayConnector, LocalTrack,
    ReconnectPolicy, Role, TrackKind,
};
use flare_proto::{ParticipantId, RejectionCode, SessionId};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(10);
const HEARTBEAT: Duration = Duration::from_secs(30);

struct Members {
    session: SessionId,
    alice: ParticipantId,
    bob: ParticipantId,
    carol: ParticipantId,
}

async fn spawn_gateway() -> (SocketAddr, Members) {
    let members = Members {
        session: SessionId::new(),
        alice: ParticipantId::new(),
        bob: ParticipantId::new(),
        carol: ParticipantId::new(),
    };
    let mut roster = StaticRoster::new(false);
    for (id, name) in [
        (members.alice, "alice"),
        (members.bob, "bob"),
        (members.carol, "carol"),
    ] {
        roster
            .add_participant(id, &format!("{name}-token"), name)
            .unwrap();
        roster.grant(members.session, id);
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(AppState::new(
        Gateway::new(Access::from_roster(roster)),
        detached_metrics_handle(),
    ));
    tokio::spawn(flare_gateway::serve(listener, state, std::future::pending()));
    (addr, members)
}

/// TCP relay in front of the gateway whose live links can be cut at will.
struct Proxy {
    addr: SocketAddr,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Proxy {
    async fn spawn(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let links = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::clone(&links);
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let link = tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(upstream).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
                accepted.lock().push(link);
            }
        });
        Self { addr, links }
    }

    fn cut(&self) {
        for link in self.links.lock().drain(..) {
            link.abort();
        }
    }
}

struct Peer {
    connection: Arc<GatewayConnection>,
    client: GatewayClient,
    events: UnboundedReceiver<ClientEvent>,
    factory: Arc<MemoryFactory>,
}

impl Peer {
    async fn join(addr: SocketAddr, token: &str, session: SessionId) -> Self {
        let connection = GatewayConnection::connect(&format!("ws://{addr}"), token, HEARTBEAT)
            .await
            .expect("connect to gateway");
        let factory = Arc::new(MemoryFactory::new());
        let (client, events) = GatewayClient::join(connection.clone(), factory.clone(), session, true)
            .await
            .expect("join session");
        Self {
            connection,
            client,
            events,
            factory,
        }
    }

    async fn connect(connector: GatewayConnector, session: SessionId) -> Self {
        let factory = Arc::new(MemoryFactory::new());
        let (client, events) = GatewayClient::connect(connector, factory.clone(), session, true)
            .await
            .expect("join session");
        Self {
            connection: client.connection(),
            client,
            events,
            factory,
        }
    }

    /// Consumes events until every expected one has been observed.
    async fn expect_all(&mut self, expected: Vec<ClientEvent>) {
        let mut missing: Vec<ClientEvent> = expected;
        tokio::time::timeout(WAIT, async {
            while !missing.is_empty() {
                let event = self.events.recv().await.expect("client event stream ended");
                missing.retain(|wanted| *wanted != event);
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {missing:?}"));
    }
}

fn ready(participant_id: ParticipantId) -> ClientEvent {
    ClientEvent::PeerStateChanged {
        participant_id,
        state: ConnectionState::Ready,
    }
}

fn added(participant_id: ParticipantId, role: Role) -> ClientEvent {
    ClientEvent::PeerAdded {
        participant_id,
        role,
    }
}

#[test_timeout::tokio_timeout_test]
async fn three_participants_form_a_full_mesh() {
    let (addr, members) = spawn_gateway().await;

    let mut alice = Peer::join(addr, "alice-token", members.session).await;
    let mut bob = Peer::join(addr, "bob-token", members.session).await;

    alice
        .expect_all(vec![added(members.bob, Role::Impolite), ready(members.bob)])
        .await;
    bob.expect_all(vec![added(members.alice, Role::Polite), ready(members.alice)])
        .await;

    let mut carol = Peer::join(addr, "carol-token", members.session).await;

    alice
        .expect_all(vec![added(members.carol, Role::Impolite), ready(members.carol)])
        .await;
    bob.expect_all(vec![added(members.carol, Role::Impolite), ready(members.carol)])
        .await;
    carol
        .expect_all(vec![
            added(members.alice, Role::Polite),
            added(members.bob, Role::Polite),
            ready(members.alice),
            ready(members.bob),
        ])
        .await;

    let peers: HashSet<ParticipantId> = carol
        .client
        .peers()
        .await
        .into_iter()
        .map(|peer| {
            assert_eq!(peer.state, ConnectionState::Ready);
            peer.participant_id
        })
        .collect();
    assert_eq!(peers, HashSet::from([members.alice, members.bob]));
}

#[test_timeout::tokio_timeout_test]
async fn joiner_learns_screen_names_of_existing_members() {
    let (addr, members) = spawn_gateway().await;

    let mut alice = Peer::join(addr, "alice-token", members.session).await;
    let mut bob = Peer::join(addr, "bob-token", members.session).await;

    alice.expect_all(vec![ready(members.bob)]).await;
    bob.expect_all(vec![ready(members.alice)]).await;

    let info = bob.client.participant_info(members.alice).await.unwrap();
    assert_eq!(info.screen_name, "alice");
}

#[test_timeout::tokio_timeout_test]
async fn leaving_participant_is_removed_everywhere() {
    let (addr, members) = spawn_gateway().await;

    let mut alice = Peer::join(addr, "alice-token", members.session).await;
    let mut bob = Peer::join(addr, "bob-token", members.session).await;
    let mut carol = Peer::join(addr, "carol-token", members.session).await;

    alice
        .expect_all(vec![ready(members.bob), ready(members.carol)])
        .await;
    carol
        .expect_all(vec![ready(members.alice), ready(members.bob)])
        .await;
    bob.expect_all(vec![ready(members.alice), ready(members.carol)])
        .await;

    let Peer {
        connection: bob_connection,
        client: bob_client,
        events: mut bob_events,
        ..
    } = bob;
    bob_client.leave().await.unwrap();

    let removed = |participant_id| ClientEvent::PeerRemoved { participant_id };
    alice.expect_all(vec![removed(members.bob)]).await;
    carol.expect_all(vec![removed(members.bob)]).await;

    let mut locally_removed = HashSet::new();
    while let Ok(event) = bob_events.try_recv() {
        if let ClientEvent::PeerRemoved { participant_id } = event {
            locally_removed.insert(participant_id);
        }
    }
    assert_eq!(
        locally_removed,
        HashSet::from([members.alice, members.carol])
    );

    assert_eq!(
        alice
            .client
            .peers()
            .await
            .into_iter()
            .map(|peer| peer.participant_id)
            .collect::<Vec<_>>(),
        vec![members.carol]
    );
    bob_connection.close();
}

#[test_timeout::tokio_timeout_test]
async fn joining_a_foreign_session_is_rejected() {
    let (addr, _members) = spawn_gateway().await;

    let connection = GatewayConnection::connect(&format!("ws://{addr}"), "alice-token", HEARTBEAT)
        .await
        .unwrap();
    let err = GatewayClient::join(
        connection,
        Arc::new(MemoryFactory::new()),
        SessionId::new(),
        true,
    )
    .await
    .err()
    .expect("join must fail");

    assert_eq!(err.rejection_code(), Some(RejectionCode::Unauthorized));
}

#[test_timeout::tokio_timeout_test]
async fn gateway_loss_is_reported() {
    let (addr, members) = spawn_gateway().await;

    let mut alice = Peer::join(addr, "alice-token", members.session).await;
    let mut bob = Peer::join(addr, "bob-token", members.session).await;
    alice.expect_all(vec![ready(members.bob)]).await;
    bob.expect_all(vec![ready(members.alice)]).await;

    // A second connection for bob supersedes the first one.
    let _replacement = Peer::join(addr, "bob-token", members.session).await;

    bob.expect_all(vec![
        ClientEvent::PeerRemoved {
            participant_id: members.alice,
        },
        ClientEvent::GatewayClosed,
    ])
    .await;
    assert!(bob.connection.is_closed());
}

#[test_timeout::tokio_timeout_test]
async fn severed_transport_drops_only_that_peer() {
    let (addr, members) = spawn_gateway().await;

    let mut alice = Peer::join(addr, "alice-token", members.session).await;
    let mut bob = Peer::join(addr, "bob-token", members.session).await;
    let mut carol = Peer::join(addr, "carol-token", members.session).await;
    alice
        .expect_all(vec![ready(members.bob), ready(members.carol)])
        .await;
    bob.expect_all(vec![ready(members.alice)]).await;
    carol.expect_all(vec![ready(members.alice)]).await;

    alice
        .factory
        .transport_for(members.bob)
        .expect("transport towards bob")
        .sever();

    alice
        .expect_all(vec![
            ClientEvent::PeerStateChanged {
                participant_id: members.bob,
                state: ConnectionState::Disconnected,
            },
            ClientEvent::PeerRemoved {
                participant_id: members.bob,
            },
        ])
        .await;
    let remaining: Vec<ParticipantId> = alice
        .client
        .peers()
        .await
        .into_iter()
        .map(|peer| peer.participant_id)
        .collect();
    assert_eq!(remaining, vec![members.carol]);
}

#[test_timeout::tokio_timeout_test]
async fn tracks_reach_current_and_later_peers() {
    let (addr, members) = spawn_gateway().await;

    let mut alice = Peer::join(addr, "alice-token", members.session).await;
    let mut bob = Peer::join(addr, "bob-token", members.session).await;
    alice.expect_all(vec![ready(members.bob)]).await;
    bob.expect_all(vec![ready(members.alice)]).await;

    alice
        .client
        .set_tracks(vec![LocalTrack::new("mic", TrackKind::Audio)]);
    let mic = ClientEvent::RemoteTrack {
        participant_id: members.alice,
        track_id: "mic".into(),
        kind: "audio".into(),
    };
    bob.expect_all(vec![mic.clone()]).await;

    let mut carol = Peer::join(addr, "carol-token", members.session).await;
    carol.expect_all(vec![ready(members.alice), mic]).await;
}

#[test_timeout::tokio_timeout_test]
async fn lost_gateway_link_is_rejoined() {
    let (addr, members) = spawn_gateway().await;
    let proxy = Proxy::spawn(addr).await;

    let mut alice = Peer::join(addr, "alice-token", members.session).await;
    let connector = GatewayConnector::new(format!("ws://{}", proxy.addr), "bob-token", HEARTBEAT)
        .with_policy(ReconnectPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
        });
    let mut bob = Peer::connect(connector, members.session).await;
    alice.expect_all(vec![ready(members.bob)]).await;
    bob.expect_all(vec![ready(members.alice)]).await;
    let first_connection = bob.client.connection();

    proxy.cut();

    bob.expect_all(vec![
        ClientEvent::PeerRemoved {
            participant_id: members.alice,
        },
        ClientEvent::Reconnecting,
        ClientEvent::Reconnected,
        ready(members.alice),
    ])
    .await;
    alice.expect_all(vec![ready(members.bob)]).await;

    assert!(first_connection.is_closed());
    assert!(!Arc::ptr_eq(&first_connection, &bob.client.connection()));
    assert_eq!(bob.client.peers().await.len(), 1);
}

