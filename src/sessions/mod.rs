// src/sessions/mod.rs — Session lifecycle states and transition table

use serde::{Deserialize, Serialize};

/// Lifecycle state of a metered session.
///
/// `Active` is the only state in which billing ticks apply. Entering
/// `Paused` always carries a grace deadline; expiry of that deadline is
/// driven by the scheduler, never by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Waiting,
    Active,
    Paused,
    Reconnecting,
    Ended,
    Finalized,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Waiting => "waiting",
            SessionState::Active => "active",
            SessionState::Paused => "paused",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Ended => "ended",
            SessionState::Finalized => "finalized",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(SessionState::Created),
            "waiting" => Some(SessionState::Waiting),
            "active" => Some(SessionState::Active),
            "paused" => Some(SessionState::Paused),
            "reconnecting" => Some(SessionState::Reconnecting),
            "ended" => Some(SessionState::Ended),
            "finalized" => Some(SessionState::Finalized),
            _ => None,
        }
    }

    /// The legal transition table. Everything not listed here is rejected.
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Created, Waiting)
                | (Waiting, Active)
                | (Waiting, Ended)
                | (Active, Paused)
                | (Active, Ended)
                | (Paused, Reconnecting)
                | (Paused, Active)
                | (Paused, Ended)
                | (Reconnecting, Active)
                | (Reconnecting, Ended)
                | (Ended, Finalized)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Finalized)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session is conducted. The rate is locked per modality at
/// session creation and never changes mid-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Voice,
    Video,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Voice => "voice",
            Modality::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Modality::Text),
            "voice" => Some(Modality::Voice),
            "video" => Some(Modality::Video),
            _ => None,
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_edges() {
        use SessionState::*;
        assert!(Created.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Active));
        assert!(Waiting.can_transition_to(Ended));
        assert!(Active.can_transition_to(Paused));
        assert!(Active.can_transition_to(Ended));
        assert!(Paused.can_transition_to(Reconnecting));
        assert!(Paused.can_transition_to(Active));
        assert!(Paused.can_transition_to(Ended));
        assert!(Reconnecting.can_transition_to(Active));
        assert!(Reconnecting.can_transition_to(Ended));
        assert!(Ended.can_transition_to(Finalized));
    }

    #[test]
    fn test_illegal_edges() {
        use SessionState::*;
        // No skipping forward
        assert!(!Created.can_transition_to(Active));
        assert!(!Created.can_transition_to(Ended));
        assert!(!Waiting.can_transition_to(Paused));
        // No going backward
        assert!(!Active.can_transition_to(Waiting));
        assert!(!Ended.can_transition_to(Active));
        assert!(!Finalized.can_transition_to(Ended));
        // Terminal states stay terminal
        assert!(!Finalized.can_transition_to(Active));
        // Billing can never resurrect a session
        assert!(!Ended.can_transition_to(Paused));
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            SessionState::Created,
            SessionState::Waiting,
            SessionState::Active,
            SessionState::Paused,
            SessionState::Reconnecting,
            SessionState::Ended,
            SessionState::Finalized,
        ] {
            assert_eq!(SessionState::parse(state.as_str()), Some(state));
        }
        assert_eq!(SessionState::parse("bogus"), None);
    }

    #[test]
    fn test_modality_round_trip() {
        for m in [Modality::Text, Modality::Voice, Modality::Video] {
            assert_eq!(Modality::parse(m.as_str()), Some(m));
        }
        assert_eq!(Modality::parse(""), None);
    }
}
