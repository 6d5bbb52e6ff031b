//! Collaborators the gateway consults but does not own: who a token belongs
//! to, whether that participant may enter a session, and how to display them.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flare_proto::{ParticipantId, ParticipantInfo, SessionId};
use serde::Deserialize;
use thiserror::Error;

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, token: &str) -> Option<ParticipantId>;
}

#[async_trait]
pub trait SessionAuthorizer: Send + Sync {
    async fn is_authorized(&self, participant: ParticipantId, session: SessionId) -> bool;
}

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn display_info(&self, participant: ParticipantId) -> Option<ParticipantInfo>;
}

/// The three collaborators bundled for the gateway.
#[derive(Clone)]
pub struct Access {
    pub identity: Arc<dyn IdentityResolver>,
    pub authorizer: Arc<dyn SessionAuthorizer>,
    pub profiles: Arc<dyn ProfileDirectory>,
}

impl Access {
    pub fn from_roster(roster: StaticRoster) -> Self {
        let roster = Arc::new(roster);
        Self {
            identity: roster.clone(),
            authorizer: roster.clone(),
            profiles: roster,
        }
    }
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("failed to read roster {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid roster: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("token for participant {0} is already assigned")]
    DuplicateToken(ParticipantId),
    #[error("participant {0} is listed twice")]
    DuplicateParticipant(ParticipantId),
    #[error("session {session} grants unknown participant {participant}")]
    UnknownMember {
        session: SessionId,
        participant: ParticipantId,
    },
}

#[derive(Debug, Deserialize)]
struct RosterFile {
    #[serde(default)]
    open_sessions: bool,
    #[serde(default)]
    participants: Vec<RosterParticipant>,
    #[serde(default)]
    sessions: Vec<RosterSession>,
}

#[derive(Debug, Deserialize)]
struct RosterParticipant {
    id: ParticipantId,
    token: String,
    screen_name: String,
}

#[derive(Debug, Deserialize)]
struct RosterSession {
    id: SessionId,
    #[serde(default)]
    members: Vec<ParticipantId>,
}

/// In-memory roster: tokens, display names and session grants.
#[derive(Debug, Default)]
pub struct StaticRoster {
    open_sessions: bool,
    tokens: HashMap<String, ParticipantId>,
    profiles: HashMap<ParticipantId, ParticipantInfo>,
    grants: HashMap<SessionId, HashSet<ParticipantId>>,
}

impl StaticRoster {
    /// With `open_sessions` every known participant may join any session.
    pub fn new(open_sessions: bool) -> Self {
        Self {
            open_sessions,
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, AccessError> {
        let raw = std::fs::read_to_string(path).map_err(|source| AccessError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, AccessError> {
        let file: RosterFile = toml::from_str(raw)?;
        let mut roster = Self::new(file.open_sessions);
        for participant in file.participants {
            roster.add_participant(participant.id, participant.token, participant.screen_name)?;
        }
        for session in file.sessions {
            for member in session.members {
                if !roster.profiles.contains_key(&member) {
                    return Err(AccessError::UnknownMember {
                        session: session.id,
                        participant: member,
                    });
                }
                roster.grant(session.id, member);
            }
        }
        Ok(roster)
    }

    pub fn add_participant(
        &mut self,
        id: ParticipantId,
        token: impl Into<String>,
        screen_name: impl Into<String>,
    ) -> Result<(), AccessError> {
        let token = token.into();
        if self.profiles.contains_key(&id) {
            return Err(AccessError::DuplicateParticipant(id));
        }
        if self.tokens.contains_key(&token) {
            return Err(AccessError::DuplicateToken(id));
        }
        self.tokens.insert(token, id);
        self.profiles.insert(id, ParticipantInfo::new(screen_name));
        Ok(())
    }

    pub fn set_open_sessions(&mut self, open: bool) {
        self.open_sessions = open;
    }

    pub fn grant(&mut self, session: SessionId, participant: ParticipantId) {
        self.grants.entry(session).or_default().insert(participant);
    }

    pub fn participant_count(&self) -> usize {
        self.profiles.len()
    }
}

#[async_trait]
impl IdentityResolver for StaticRoster {
    async fn resolve(&self, token: &str) -> Option<ParticipantId> {
        self.tokens.get(token).copied()
    }
}

#[async_trait]
impl SessionAuthorizer for StaticRoster {
    async fn is_authorized(&self, participant: ParticipantId, session: SessionId) -> bool {
        if !self.profiles.contains_key(&participant) {
            return false;
        }
        self.open_sessions
            || self
                .grants
                .get(&session)
                .is_some_and(|members| members.contains(&participant))
    }
}

#[async_trait]
impl ProfileDirectory for StaticRoster {
    async fn display_info(&self, participant: ParticipantId) -> Option<ParticipantInfo> {
        self.profiles.get(&participant).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "0d9b4a52-8c5c-4f0e-9a51-5b7c6f6c1a01";
    const BOB: &str = "0d9b4a52-8c5c-4f0e-9a51-5b7c6f6c1a02";
    const STANDUP: &str = "5e0c7b0e-2f7a-4b53-8d3c-0b1c9b6a7f10";

    fn sample() -> String {
        format!(
            r#"
[[participants]]
id = "{ALICE}"
token = "alice-token"
screen_name = "alice"

[[participants]]
id = "{BOB}"
token = "bob-token"
screen_name = "bob"

[[sessions]]
id = "{STANDUP}"
members = ["{ALICE}"]
"#
        )
    }

    #[test_timeout::tokio_timeout_test]
    async fn grants_follow_roster() {
        let roster = StaticRoster::from_toml(&sample()).unwrap();
        let alice: ParticipantId = ALICE.parse().unwrap();
        let bob: ParticipantId = BOB.parse().unwrap();
        let standup: SessionId = STANDUP.parse().unwrap();

        assert_eq!(roster.resolve("alice-token").await, Some(alice));
        assert_eq!(roster.resolve("nobody").await, None);
        assert!(roster.is_authorized(alice, standup).await);
        assert!(!roster.is_authorized(bob, standup).await);
        assert_eq!(
            roster.display_info(bob).await,
            Some(ParticipantInfo::new("bob"))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn open_sessions_admit_known_participants_only() {
        let mut roster = StaticRoster::new(true);
        let known = ParticipantId::new();
        roster.add_participant(known, "t", "known").unwrap();

        assert!(roster.is_authorized(known, SessionId::new()).await);
        assert!(!roster.is_authorized(ParticipantId::new(), SessionId::new()).await);
    }

    #[test_timeout::timeout]
    fn rejects_grant_for_unknown_member() {
        let raw = format!(
            r#"
[[sessions]]
id = "{STANDUP}"
members = ["{ALICE}"]
"#
        );
        let err = StaticRoster::from_toml(&raw).unwrap_err();
        assert!(matches!(err, AccessError::UnknownMember { .. }));
    }

    #[test_timeout::timeout]
    fn rejects_duplicate_tokens() {
        let mut roster = StaticRoster::new(false);
        roster
            .add_participant(ParticipantId::new(), "same", "a")
            .unwrap();
        let err = roster
            .add_participant(ParticipantId::new(), "same", "b")
            .unwrap_err();
        assert!(matches!(err, AccessError::DuplicateToken(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejects_duplicate_participant_ids() {
        let mut roster = StaticRoster::new(false);
        let id = ParticipantId::new();
        roster.add_participant(id, "first", "a").unwrap();

        let err = roster.add_participant(id, "second", "b").unwrap_err();

        assert!(matches!(err, AccessError::DuplicateParticipant(dup) if dup == id));
        assert_eq!(roster.resolve("second").await, None);
        assert_eq!(roster.display_info(id).await, Some(ParticipantInfo::new("a")));
    }

    #[test_timeout::tokio_timeout_test]
    async fn example_roster_loads() {
        let roster =
            StaticRoster::from_toml(include_str!("../flare-roster.example.toml")).unwrap();
        let bob = roster.resolve("bob-dev-token").await.unwrap();

        assert_eq!(roster.participant_count(), 2);
        assert!(
            roster
                .is_authorized(bob, "6a1f7c0e-0f3b-4c1e-9d55-0d2a5b0c8e11".parse().unwrap())
                .await
        );
    }
}
