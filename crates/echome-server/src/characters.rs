//! Read-only character lookup.

use async_trait::async_trait;
use echome_types::Character;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("character store unavailable: {0}")]
    Unavailable(String),
}

/// Resolves the character a conversation is held with.
#[async_trait]
pub trait CharacterLookup: Send + Sync {
    async fn find(&self, id: Uuid) -> Result<Option<Character>, LookupError>;
}

/// Lookup over a fixed set of characters, loaded from configuration.
#[derive(Debug, Default)]
pub struct InMemoryCharacters {
    by_id: HashMap<Uuid, Character>,
}

impl InMemoryCharacters {
    pub fn new(characters: impl IntoIterator<Item = Character>) -> Self {
        Self {
            by_id: characters.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[async_trait]
impl CharacterLookup for InMemoryCharacters {
    async fn find(&self, id: Uuid) -> Result<Option<Character>, LookupError> {
        Ok(self.by_id.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echome_types::CharacterStatus;

    fn character(name: &str) -> Character {
        Character {
            id: Uuid::new_v4(),
            name: name.to_string(),
            persona: format!("{} persona", name),
            voice_id: None,
            uses_cloned_voice: false,
            status: CharacterStatus::Approved,
        }
    }

    #[tokio::test]
    async fn finds_configured_characters_only() {
        let known = character("Ada");
        let lookup = InMemoryCharacters::new([known.clone(), character("Bo")]);
        assert_eq!(lookup.len(), 2);

        assert_eq!(lookup.find(known.id).await.unwrap(), Some(known));
        assert_eq!(lookup.find(Uuid::new_v4()).await.unwrap(), None);
    }
}
