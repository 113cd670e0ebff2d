//! Job requests and the aggregated metadata result.
//!
//! A completed job reports a [`MetadataResult`] fragment as JSON with
//! the shape `{"fieldMetadata": [...], "validationRules": [...],
//! "recordTypes": [...]}`. Fragments are merged into the session
//! aggregate by appending each category in arrival order.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{EntityName, EntityScope};
use crate::error::CoreError;

// ---------------------------------------------------------------------------
// MetadataKind
// ---------------------------------------------------------------------------

/// A category of metadata a job can be asked to extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKind {
    Field,
    ValidationRule,
    RecordType,
}

impl MetadataKind {
    pub const ALL: [MetadataKind; 3] = [Self::Field, Self::ValidationRule, Self::RecordType];

    /// Option value understood by the job service for this kind, e.g.
    /// `standardFieldMetadata` or `customValidationRulesMetadata`.
    pub fn option_value(self, scope: EntityScope) -> String {
        let suffix = match self {
            Self::Field => "FieldMetadata",
            Self::ValidationRule => "ValidationRulesMetadata",
            Self::RecordType => "RecordTypeMetadata",
        };
        format!("{}{suffix}", scope.as_str())
    }

    /// Human-readable label shown next to the option in a selector.
    pub fn label(self) -> &'static str {
        match self {
            Self::Field => "Retrieve Field metadata",
            Self::ValidationRule => "Retrieve Validation Rules metadata",
            Self::RecordType => "Retrieve Record Type metadata",
        }
    }
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Field => "field",
            Self::ValidationRule => "validation_rule",
            Self::RecordType => "record_type",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// JobRequest
// ---------------------------------------------------------------------------

/// An extraction request for a set of entities and metadata kinds.
///
/// Immutable once built; both sets must be non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRequest {
    target_entities: BTreeSet<EntityName>,
    requested_kinds: BTreeSet<MetadataKind>,
}

impl JobRequest {
    pub fn new<E, K>(entities: E, kinds: K) -> Result<Self, CoreError>
    where
        E: IntoIterator<Item = EntityName>,
        K: IntoIterator<Item = MetadataKind>,
    {
        let target_entities: BTreeSet<EntityName> = entities.into_iter().collect();
        let requested_kinds: BTreeSet<MetadataKind> = kinds.into_iter().collect();

        if target_entities.is_empty() {
            return Err(CoreError::Validation(
                "at least one target entity is required".into(),
            ));
        }
        if requested_kinds.is_empty() {
            return Err(CoreError::Validation(
                "at least one metadata kind is required".into(),
            ));
        }

        Ok(Self {
            target_entities,
            requested_kinds,
        })
    }

    pub fn target_entities(&self) -> &BTreeSet<EntityName> {
        &self.target_entities
    }

    pub fn requested_kinds(&self) -> &BTreeSet<MetadataKind> {
        &self.requested_kinds
    }

    /// The single scope shared by every target entity, or `None` when
    /// the request mixes standard and custom entities.
    pub fn scope(&self) -> Option<EntityScope> {
        let mut scopes = self.target_entities.iter().map(EntityName::scope);
        let first = scopes.next()?;
        scopes.all(|s| s == first).then_some(first)
    }

    /// Split into one request per entity scope (standard first).
    ///
    /// Each part keeps the full set of requested kinds.
    pub fn split_by_scope(self) -> Vec<JobRequest> {
        let (custom, standard): (BTreeSet<_>, BTreeSet<_>) = self
            .target_entities
            .into_iter()
            .partition(|e| e.scope() == EntityScope::Custom);

        [standard, custom]
            .into_iter()
            .filter(|entities| !entities.is_empty())
            .map(|target_entities| JobRequest {
                target_entities,
                requested_kinds: self.requested_kinds.clone(),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Keys tried, in order, when looking for an entry's display name.
const NAME_KEYS: [&str; 4] = ["name", "fullName", "DeveloperName", "ValidationName"];

/// One metadata entry reported by a completed job.
///
/// Entries are opaque JSON objects; the job service decides which
/// attributes they carry. [`name`](Self::name) is a best-effort lookup
/// for display and never required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Descriptor {
    /// Entry with a single `name` attribute.
    pub fn named(name: impl Into<String>) -> Self {
        let mut attributes = serde_json::Map::new();
        attributes.insert("name".into(), serde_json::Value::String(name.into()));
        Self { attributes }
    }

    /// First string among `name`, `fullName`, `DeveloperName`,
    /// `ValidationName`.
    pub fn name(&self) -> Option<&str> {
        NAME_KEYS
            .iter()
            .find_map(|key| self.attributes.get(*key).and_then(|v| v.as_str()))
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }
}

pub type FieldDescriptor = Descriptor;
pub type ValidationRuleDescriptor = Descriptor;
pub type RecordTypeDescriptor = Descriptor;

// ---------------------------------------------------------------------------
// MetadataResult
// ---------------------------------------------------------------------------

/// Cumulative metadata for every job correlated so far.
///
/// Missing categories in a fragment deserialize as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataResult {
    #[serde(default)]
    pub field_metadata: Vec<FieldDescriptor>,
    #[serde(default)]
    pub validation_rules: Vec<ValidationRuleDescriptor>,
    #[serde(default)]
    pub record_types: Vec<RecordTypeDescriptor>,
}

impl MetadataResult {
    /// Parse a result fragment from the JSON text carried by a
    /// completion event.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Append every entry of `fragment`, category by category.
    ///
    /// Entries are never deduplicated.
    pub fn merge(&mut self, fragment: MetadataResult) {
        self.field_metadata.extend(fragment.field_metadata);
        self.validation_rules.extend(fragment.validation_rules);
        self.record_types.extend(fragment.record_types);
    }

    /// True iff at least one category has an entry.
    pub fn has_results(&self) -> bool {
        !self.field_metadata.is_empty()
            || !self.validation_rules.is_empty()
            || !self.record_types.is_empty()
    }

    /// Total number of entries across all categories.
    pub fn entry_count(&self) -> usize {
        self.field_metadata.len() + self.validation_rules.len() + self.record_types.len()
    }
}
