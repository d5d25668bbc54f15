use crate::error::{ConsistencyError, Result};

/// A validated reference to one shared entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    entity_type: String,
    entity_id: String,
}

impl EntityRef {
    /// Creates a reference, rejecting empty type or id.
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Result<Self> {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        if entity_type.trim().is_empty() {
            return Err(ConsistencyError::InvalidArgument(
                "entity type must not be empty".to_string(),
            ));
        }
        if entity_id.trim().is_empty() {
            return Err(ConsistencyError::InvalidArgument(
                "entity id must not be empty".to_string(),
            ));
        }
        Ok(Self {
            entity_type,
            entity_id,
        })
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Store key of the entity's version marker.
    pub fn version_key(&self) -> String {
        format!("version:{}:{}", self.entity_type, self.entity_id)
    }

    /// Store key of the entity's advisory lock.
    pub fn lock_key(&self) -> String {
        format!("lock:{}:{}", self.entity_type, self.entity_id)
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}
