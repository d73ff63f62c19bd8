//! Typed catalog of the worker's actions.
//!
//! The wire carries plain strings; `Action` gives callers a checked name and the
//! param structs below give them checked payloads. Optional fields are omitted
//! from the JSON when unset so the worker applies its own defaults.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    VaultCreateNote,
    VaultUpdateNote,
    VaultGetNote,
    VaultGetAllNotes,
    VaultDeleteNote,
    VaultSearch,
    VaultFindRelated,
    VaultGetNotesByTag,
    VaultGetAllTags,
    DecisionCreate,
    DecisionGet,
    DecisionGetAll,
    DecisionDelete,
    DecisionAddChoice,
    DecisionAddFactor,
    DecisionSetScore,
    DecisionSimulate,
    Ping,
    Shutdown,
}

impl Action {
    pub const ALL: &'static [Action] = &[
        Action::VaultCreateNote,
        Action::VaultUpdateNote,
        Action::VaultGetNote,
        Action::VaultGetAllNotes,
        Action::VaultDeleteNote,
        Action::VaultSearch,
        Action::VaultFindRelated,
        Action::VaultGetNotesByTag,
        Action::VaultGetAllTags,
        Action::DecisionCreate,
        Action::DecisionGet,
        Action::DecisionGetAll,
        Action::DecisionDelete,
        Action::DecisionAddChoice,
        Action::DecisionAddFactor,
        Action::DecisionSetScore,
        Action::DecisionSimulate,
        Action::Ping,
        Action::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VaultCreateNote => "vault.create_note",
            Self::VaultUpdateNote => "vault.update_note",
            Self::VaultGetNote => "vault.get_note",
            Self::VaultGetAllNotes => "vault.get_all_notes",
            Self::VaultDeleteNote => "vault.delete_note",
            Self::VaultSearch => "vault.search",
            Self::VaultFindRelated => "vault.find_related",
            Self::VaultGetNotesByTag => "vault.get_notes_by_tag",
            Self::VaultGetAllTags => "vault.get_all_tags",
            Self::DecisionCreate => "decision.create",
            Self::DecisionGet => "decision.get",
            Self::DecisionGetAll => "decision.get_all",
            Self::DecisionDelete => "decision.delete",
            Self::DecisionAddChoice => "decision.add_choice",
            Self::DecisionAddFactor => "decision.add_factor",
            Self::DecisionSetScore => "decision.set_score",
            Self::DecisionSimulate => "decision.simulate",
            Self::Ping => "ping",
            Self::Shutdown => "shutdown",
        }
    }

    /// Namespace before the first dot; `None` for system actions.
    pub fn namespace(&self) -> Option<&'static str> {
        self.as_str().split_once('.').map(|(ns, _)| ns)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

impl AsRef<str> for Action {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

// Knowledge vault

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateNote {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_generate_tags: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateNote {
    pub note_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// Params of `vault.get_note`, `vault.delete_note`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRef {
    pub note_id: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListNotes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Search {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_similarity: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindRelated {
    pub note_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotesByTag {
    pub tag: String,
}

// Decisions

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDecision {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Params of `decision.get`, `decision.delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRef {
    pub decision_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListDecisions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddChoice {
    pub decision_id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddFactor {
    pub decision_id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetScore {
    pub choice_id: i64,
    pub factor_id: i64,
    pub score: f64,
    /// Standard deviation used when sampling the score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncertainty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Simulate {
    pub decision_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_runs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_results: Option<bool>,
}
