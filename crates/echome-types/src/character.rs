//! Character profile definitions.
//!
//! Characters are owned by the character-management collaborator. The
//! gateway only reads the persona text and the voice selection fields.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a character. Transitions belong to the management
/// service; the gateway only checks for `Disabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterStatus {
    #[default]
    PendingReview,
    Approved,
    Disabled,
}

/// A conversational persona with an optional cloned voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    /// System prompt describing how the character speaks and behaves.
    #[serde(default)]
    pub persona: String,
    /// Voice identifier returned by voice enrollment, if any.
    #[serde(default)]
    pub voice_id: Option<String>,
    /// Whether synthesis should use `voice_id` instead of the default voice.
    #[serde(default)]
    pub uses_cloned_voice: bool,
    #[serde(default)]
    pub status: CharacterStatus,
}

impl Character {
    /// Returns the cloned voice to synthesize with, if the character opted in
    /// and actually has one.
    pub fn cloned_voice(&self) -> Option<&str> {
        if !self.uses_cloned_voice {
            return None;
        }
        self.voice_id
            .as_deref()
            .map(str::trim)
            .filter(|voice| !voice.is_empty())
    }

    pub fn is_disabled(&self) -> bool {
        self.status == CharacterStatus::Disabled
    }
}
