//! Entity records synchronized across a space.
//!
//! Two kinds share the sync machinery: [`Being`] (a participant-like
//! record) and [`Intention`] (a message-like action record with a
//! lifecycle). Both carry the timestamps the catch-up resolver compares
//! against, and both serialize to the JSON bodies that ride inside
//! snapshot and delta frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

/// Identifier of a space (the broadcast scope).
pub type SpaceId = Uuid;

/// The two synchronized model types.
///
/// Wire names (`"beings"` / `"intentions"`) double as the values of the
/// `types` connect parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    Beings,
    Intentions,
}

impl Model {
    pub const ALL: [Model; 2] = [Model::Beings, Model::Intentions];

    pub fn as_str(&self) -> &'static str {
        match self {
            Model::Beings => "beings",
            Model::Intentions => "intentions",
        }
    }

    /// Parse a wire name. Unknown names return `None` rather than erroring
    /// so that an unrecognized `types` filter entry is simply skipped.
    pub fn parse(s: &str) -> Option<Model> {
        match s.trim() {
            "beings" => Some(Model::Beings),
            "intentions" => Some(Model::Intentions),
            _ => None,
        }
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to an entity, as reported to the delta batcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Participant kind tag.
///
/// `Room` and `Agent` beings are considered always online by the
/// presence deriver; only `Human` presence is derived from live
/// connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeingKind {
    Human,
    Agent,
    Room,
}

/// A participant-like record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Being {
    pub id: Uuid,
    pub name: String,
    pub kind: BeingKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Uuid>,
    pub space_id: SpaceId,
    /// Free-form metadata. The presence deriver injects an `online` flag
    /// here when serializing for the wire.
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub modified_at: DateTime<Utc>,
}

impl Being {
    pub fn new(name: impl Into<String>, kind: BeingKind, space_id: SpaceId) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            owner: None,
            space_id,
            metadata: serde_json::Value::Null,
            modified_at: Utc::now(),
        }
    }

    pub fn with_owner(mut self, owner: Uuid) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Bump the modification timestamp after a mutation.
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

/// Lifecycle state of an [`Intention`].
///
/// `Complete`, `Cancelled` and `Failed` are terminal: no further
/// transitions are accepted once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentionStatus {
    Draft,
    Active,
    Paused,
    Complete,
    Cancelled,
    Failed,
}

impl IntentionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentionStatus::Complete | IntentionStatus::Cancelled | IntentionStatus::Failed
        )
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition(self, next: IntentionStatus) -> bool {
        use IntentionStatus::*;
        match self {
            Draft => matches!(next, Active | Cancelled),
            Active => matches!(next, Paused | Complete | Cancelled | Failed),
            Paused => matches!(next, Active | Cancelled | Failed),
            Complete | Cancelled | Failed => false,
        }
    }
}

impl std::fmt::Display for IntentionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IntentionStatus::Draft => "draft",
            IntentionStatus::Active => "active",
            IntentionStatus::Paused => "paused",
            IntentionStatus::Complete => "complete",
            IntentionStatus::Cancelled => "cancelled",
            IntentionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An action record: the message-like entity of a space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intention {
    pub id: Uuid,
    pub kind: String,
    pub status: IntentionStatus,
    /// Ordered content payload. The streaming relay owns the final
    /// segment while a generation is in flight.
    pub content: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Uuid>,
    pub space_id: SpaceId,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Intention {
    pub fn new(kind: impl Into<String>, space_id: SpaceId) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            status: IntentionStatus::Draft,
            content: Vec::new(),
            owner: None,
            space_id,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_owner(mut self, owner: Uuid) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_content(mut self, content: Vec<String>) -> Self {
        self.content = content;
        self
    }

    /// Apply a lifecycle transition, rejecting illegal ones.
    pub fn transition(&mut self, next: IntentionStatus) -> Result<(), SyncError> {
        if !self.status.can_transition(next) {
            return Err(SyncError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.modified_at = Utc::now();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_wire_names() {
        assert_eq!(Model::Beings.as_str(), "beings");
        assert_eq!(Model::Intentions.as_str(), "intentions");
        assert_eq!(Model::parse("beings"), Some(Model::Beings));
        assert_eq!(Model::parse(" intentions "), Some(Model::Intentions));
        assert_eq!(Model::parse("widgets"), None);
    }

    #[test]
    fn test_model_serde() {
        let json = serde_json::to_string(&Model::Intentions).unwrap();
        assert_eq!(json, "\"intentions\"");
        let back: Model = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Model::Intentions);
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let space = Uuid::new_v4();
        let mut intention = Intention::new("chat", space);
        assert_eq!(intention.status, IntentionStatus::Draft);

        intention.transition(IntentionStatus::Active).unwrap();
        intention.transition(IntentionStatus::Paused).unwrap();
        intention.transition(IntentionStatus::Active).unwrap();
        intention.transition(IntentionStatus::Complete).unwrap();
        assert!(intention.status.is_terminal());
    }

    #[test]
    fn test_lifecycle_direct_active_to_failed() {
        let mut intention = Intention::new("chat", Uuid::new_v4());
        intention.transition(IntentionStatus::Active).unwrap();
        intention.transition(IntentionStatus::Failed).unwrap();
        assert_eq!(intention.status, IntentionStatus::Failed);
    }

    #[test]
    fn test_lifecycle_rejects_illegal_transitions() {
        let mut intention = Intention::new("chat", Uuid::new_v4());

        // Draft cannot complete without activating first.
        let err = intention.transition(IntentionStatus::Complete).unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));
        assert_eq!(intention.status, IntentionStatus::Draft);

        intention.transition(IntentionStatus::Active).unwrap();
        intention.transition(IntentionStatus::Complete).unwrap();

        // Terminal states accept nothing.
        for next in [
            IntentionStatus::Draft,
            IntentionStatus::Active,
            IntentionStatus::Paused,
            IntentionStatus::Cancelled,
        ] {
            assert!(intention.transition(next).is_err());
        }
    }

    #[test]
    fn test_transition_updates_modified_at() {
        let mut intention = Intention::new("chat", Uuid::new_v4());
        let before = intention.modified_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        intention.transition(IntentionStatus::Active).unwrap();
        assert!(intention.modified_at > before);
    }

    #[test]
    fn test_being_serde_roundtrip() {
        let space = Uuid::new_v4();
        let being = Being::new("Ada", BeingKind::Human, space).with_owner(Uuid::new_v4());

        let json = serde_json::to_value(&being).unwrap();
        assert_eq!(json["kind"], "human");
        assert_eq!(json["name"], "Ada");

        let back: Being = serde_json::from_value(json).unwrap();
        assert_eq!(back, being);
    }

    #[test]
    fn test_intention_serde_roundtrip() {
        let intention = Intention::new("chat", Uuid::new_v4())
            .with_content(vec!["hello".to_string()]);

        let json = serde_json::to_value(&intention).unwrap();
        assert_eq!(json["status"], "draft");
        assert_eq!(json["content"][0], "hello");

        let back: Intention = serde_json::from_value(json).unwrap();
        assert_eq!(back, intention);
    }

    #[test]
    fn test_status_terminal_set() {
        assert!(IntentionStatus::Complete.is_terminal());
        assert!(IntentionStatus::Cancelled.is_terminal());
        assert!(IntentionStatus::Failed.is_terminal());
        assert!(!IntentionStatus::Draft.is_terminal());
        assert!(!IntentionStatus::Active.is_terminal());
        assert!(!IntentionStatus::Paused.is_terminal());
    }
}
