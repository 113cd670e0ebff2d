//! Entity names, standard/custom scope, and the selector catalog.
//!
//! Custom entities are recognised by the `__c` API-name suffix; all
//! other names are treated as standard entities.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// API-name suffix carried by every custom entity.
pub const CUSTOM_ENTITY_SUFFIX: &str = "__c";

/// Whether an entity ships with the platform or was defined by the org.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityScope {
    Standard,
    Custom,
}

impl EntityScope {
    /// Lowercase name used in endpoint paths and option values.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for EntityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// API name of an entity (e.g. `Account`, `Invoice__c`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityName(String);

impl EntityName {
    /// Validate and wrap an entity API name.
    ///
    /// Leading/trailing whitespace is trimmed; empty names and names
    /// containing inner whitespace are rejected.
    pub fn new(name: impl Into<String>) -> Result<Self, CoreError> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(CoreError::Validation("entity name must not be empty".into()));
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(CoreError::Validation(format!(
                "entity name '{trimmed}' must not contain whitespace"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scope(&self) -> EntityScope {
        if self.0.ends_with(CUSTOM_ENTITY_SUFFIX) {
            EntityScope::Custom
        } else {
            EntityScope::Standard
        }
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EntityName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityName> for String {
    fn from(name: EntityName) -> Self {
        name.0
    }
}

/// Entity names split by scope, each list sorted for display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityCatalog {
    pub standard: Vec<EntityName>,
    pub custom: Vec<EntityName>,
}

impl EntityCatalog {
    /// Classify raw names returned by the job service.
    ///
    /// Invalid names are skipped with a warning. Both lists are sorted
    /// case-insensitively, ties broken by the exact name.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut catalog = Self::default();

        for raw in names {
            match EntityName::new(raw) {
                Ok(name) => match name.scope() {
                    EntityScope::Standard => catalog.standard.push(name),
                    EntityScope::Custom => catalog.custom.push(name),
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping invalid entity name");
                }
            }
        }

        sort_for_display(&mut catalog.standard);
        sort_for_display(&mut catalog.custom);
        catalog
    }

    pub fn len(&self) -> usize {
        self.standard.len() + self.custom.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sort_for_display(names: &mut [EntityName]) {
    names.sort_by(|a, b| {
        a.as_str()
            .to_lowercase()
            .cmp(&b.as_str().to_lowercase())
            .then_with(|| a.cmp(b))
    });
}
