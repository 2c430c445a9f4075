//! User defined activity categories.
//!
//! The taxonomy is edited by the configuration surface ([store::FileTaxonomyStore]) and read by
//! the pipeline exactly once per run as an immutable [TaxonomySnapshot]. The classification output
//! schema is built from the snapshot, so edits made while a run is in flight never affect it.

pub mod store;

use std::{collections::HashSet, fmt::Display, sync::Arc};

use serde::{Deserialize, Serialize};

/// Reserved id produced by idle detection. No user category may take it.
pub const IDLE_ACTIVITY_ID: &str = "idle";

pub const MAX_NAME_LENGTH: usize = 50;
pub const MAX_DESCRIPTION_LENGTH: usize = 200;
/// Every definition ends up in the classification prompt and schema, which caps the taxonomy size.
pub const MAX_ACTIVITY_TYPES: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ActivityCategory {
    Work,
    Personal,
}

impl Display for ActivityCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityCategory::Work => write!(f, "work"),
            ActivityCategory::Personal => write!(f, "personal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityTypeDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: ActivityCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaxonomyError {
    #[error("activity name must not be empty")]
    EmptyName,
    #[error("activity name {name:?} is {length} characters long, at most {} are allowed", MAX_NAME_LENGTH)]
    NameTooLong { name: String, length: usize },
    #[error("activity name {0:?} contains no letters or digits")]
    NameWithoutId(String),
    #[error("description of {0:?} must not be empty")]
    EmptyDescription(String),
    #[error("description of {name:?} is {length} characters long, at most {} are allowed", MAX_DESCRIPTION_LENGTH)]
    DescriptionTooLong { name: String, length: usize },
    #[error("id {0:?} is reserved")]
    ReservedId(String),
    #[error("id {0:?} is used by more than one activity")]
    DuplicateId(String),
    #[error("id {id:?} doesn't match its name {name:?}")]
    IdMismatch { id: String, name: String },
    #[error("at least one {0} activity is required")]
    MissingCategory(ActivityCategory),
    #[error("{0} activities defined, at most {} are allowed", MAX_ACTIVITY_TYPES)]
    TooMany(usize),
    #[error("stored taxonomy can't be parsed: {0}")]
    Unparseable(String),
    #[error("no activity with id {0:?}")]
    UnknownId(String),
}

/// Derives an activity id from its display name: lowercase, every run of non alphanumeric
/// characters collapsed into a single underscore, no leading or trailing underscores.
pub fn generate_id(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    let mut pending_separator = false;
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            if pending_separator && !id.is_empty() {
                id.push('_');
            }
            pending_separator = false;
            id.push(c);
        } else {
            pending_separator = true;
        }
    }
    id
}

impl ActivityTypeDefinition {
    /// Creates a definition with an id derived from `name`, validating field limits.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: ActivityCategory,
    ) -> Result<Self, TaxonomyError> {
        let name = name.into().trim().to_string();
        let definition = Self {
            id: generate_id(&name),
            name,
            description: description.into().trim().to_string(),
            category,
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Checks the invariants of a single definition.
    pub fn validate(&self) -> Result<(), TaxonomyError> {
        let name_length = self.name.chars().count();
        if self.name.trim().is_empty() {
            return Err(TaxonomyError::EmptyName);
        }
        if name_length > MAX_NAME_LENGTH {
            return Err(TaxonomyError::NameTooLong {
                name: self.name.clone(),
                length: name_length,
            });
        }
        if self.id.is_empty() {
            return Err(TaxonomyError::NameWithoutId(self.name.clone()));
        }
        if self.id != generate_id(&self.name) {
            return Err(TaxonomyError::IdMismatch {
                id: self.id.clone(),
                name: self.name.clone(),
            });
        }
        if self.id == IDLE_ACTIVITY_ID {
            return Err(TaxonomyError::ReservedId(self.id.clone()));
        }
        let description_length = self.description.chars().count();
        if self.description.trim().is_empty() {
            return Err(TaxonomyError::EmptyDescription(self.name.clone()));
        }
        if description_length > MAX_DESCRIPTION_LENGTH {
            return Err(TaxonomyError::DescriptionTooLong {
                name: self.name.clone(),
                length: description_length,
            });
        }
        Ok(())
    }
}

/// Validated, immutable copy of the taxonomy. Cloning is cheap and never observes later edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonomySnapshot {
    types: Arc<[ActivityTypeDefinition]>,
}

impl TaxonomySnapshot {
    pub fn new(types: Vec<ActivityTypeDefinition>) -> Result<Self, TaxonomyError> {
        validate_taxonomy(&types)?;
        Ok(Self {
            types: types.into(),
        })
    }

    /// Snapshot of the built-in categories.
    pub fn default_taxonomy() -> Self {
        Self {
            types: default_activity_types().into(),
        }
    }

    pub fn in_category(
        &self,
        category: ActivityCategory,
    ) -> impl Iterator<Item = &ActivityTypeDefinition> {
        self.types.iter().filter(move |v| v.category == category)
    }

    pub fn get(&self, id: &str) -> Option<&ActivityTypeDefinition> {
        self.types.iter().find(|v| v.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Every id a classification may legally produce: the taxonomy ids in order plus `idle`.
    pub fn allowed_ids(&self) -> Vec<&str> {
        self.types
            .iter()
            .map(|v| v.id.as_str())
            .chain(std::iter::once(IDLE_ACTIVITY_ID))
            .collect()
    }

    pub fn allows(&self, id: &str) -> bool {
        id == IDLE_ACTIVITY_ID || self.contains(id)
    }
}

/// Checks the invariants of a whole taxonomy: per definition limits, unique ids, at least one
/// work and one personal activity, and the size ceiling.
pub fn validate_taxonomy(types: &[ActivityTypeDefinition]) -> Result<(), TaxonomyError> {
    if types.len() > MAX_ACTIVITY_TYPES {
        return Err(TaxonomyError::TooMany(types.len()));
    }
    let mut ids = HashSet::new();
    for definition in types {
        definition.validate()?;
        if !ids.insert(definition.id.as_str()) {
            return Err(TaxonomyError::DuplicateId(definition.id.clone()));
        }
    }
    for category in [ActivityCategory::Work, ActivityCategory::Personal] {
        if !types.iter().any(|v| v.category == category) {
            return Err(TaxonomyError::MissingCategory(category));
        }
    }
    Ok(())
}

#[rustfmt::skip]
const DEFAULT_ACTIVITY_TYPES: [(&str, &str, ActivityCategory); 16] = [
    ("Personal Browsing", "User is browsing the web for personal purposes.", ActivityCategory::Personal),
    ("Social Media", "User is browsing or interacting on social media platforms.", ActivityCategory::Personal),
    ("YouTube Entertainment", "User is watching videos on YouTube for entertainment.", ActivityCategory::Personal),
    ("Personal Email", "User is reading or composing personal emails.", ActivityCategory::Personal),
    ("Personal AI Use", "User is interacting with AI tools such as ChatGPT or Claude for personal use.", ActivityCategory::Personal),
    ("Personal Finances", "User is managing personal finances or banking.", ActivityCategory::Personal),
    ("Professional Development", "User is learning new skills, attending webinars or reading technical content not related to their current job.", ActivityCategory::Personal),
    ("Online Shopping", "User is browsing or purchasing items online.", ActivityCategory::Personal),
    ("Personal Calendar", "User is checking or managing their personal calendar.", ActivityCategory::Personal),
    ("Entertainment", "User is watching movies, playing games, listening to music or doing other leisure activities.", ActivityCategory::Personal),
    ("Slack", "User is actively using Slack for communication.", ActivityCategory::Work),
    ("Work Email", "User is reading or composing work related emails.", ActivityCategory::Work),
    ("Zoom Meeting", "User is in a Zoom meeting or call.", ActivityCategory::Work),
    ("Work Coding", "User is writing or reviewing code related to their job.", ActivityCategory::Work),
    ("Work Browsing", "User is browsing the web for work purposes: research, issue trackers, documentation.", ActivityCategory::Work),
    ("Work Calendar", "User is checking or managing their work calendar.", ActivityCategory::Work),
];

/// The categories used until the user defines their own.
pub fn default_activity_types() -> Vec<ActivityTypeDefinition> {
    DEFAULT_ACTIVITY_TYPES
        .iter()
        .map(|(name, description, category)| ActivityTypeDefinition {
            id: generate_id(name),
            name: name.to_string(),
            description: description.to_string(),
            category: *category,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(name: &str, category: ActivityCategory) -> ActivityTypeDefinition {
        ActivityTypeDefinition::new(name, format!("{name} description"), category).unwrap()
    }

    #[test]
    fn ids_are_normalized_slugs() {
        assert_eq!(generate_id("Work Coding"), "work_coding");
        assert_eq!(generate_id("  Deep -- Work!! "), "deep_work");
        assert_eq!(generate_id("Personal AI/ML use"), "personal_ai_ml_use");
        assert_eq!(generate_id("YouTube"), "youtube");
        assert_eq!(generate_id("___"), "");
    }

    #[test]
    fn id_generation_is_stable() {
        for name in ["Work Coding", "a  b", "Émail Café", "x_y-z", "__lead", "trail__"] {
            let id = generate_id(name);
            assert_eq!(generate_id(name), id);
            assert_eq!(generate_id(&id), id);
        }
    }

    #[test]
    fn names_collide_iff_they_normalize_identically() {
        assert_eq!(generate_id("Work  Coding"), generate_id("work-coding"));
        assert_ne!(generate_id("Work Coding"), generate_id("Work Codings"));
    }

    #[test]
    fn definition_limits_are_enforced() {
        assert_eq!(
            ActivityTypeDefinition::new("  ", "x", ActivityCategory::Work),
            Err(TaxonomyError::EmptyName)
        );
        assert!(matches!(
            ActivityTypeDefinition::new("a".repeat(51), "x", ActivityCategory::Work),
            Err(TaxonomyError::NameTooLong { length: 51, .. })
        ));
        assert!(ActivityTypeDefinition::new("a".repeat(50), "x", ActivityCategory::Work).is_ok());
        assert!(matches!(
            ActivityTypeDefinition::new("Reading", "d".repeat(201), ActivityCategory::Work),
            Err(TaxonomyError::DescriptionTooLong { length: 201, .. })
        ));
        assert_eq!(
            ActivityTypeDefinition::new("Reading", "", ActivityCategory::Work),
            Err(TaxonomyError::EmptyDescription("Reading".into()))
        );
        assert_eq!(
            ActivityTypeDefinition::new("IDLE", "away", ActivityCategory::Personal),
            Err(TaxonomyError::ReservedId("idle".into()))
        );
        assert_eq!(
            ActivityTypeDefinition::new("!!!", "symbols", ActivityCategory::Personal),
            Err(TaxonomyError::NameWithoutId("!!!".into()))
        );
    }

    #[test]
    fn taxonomy_requires_both_categories() {
        let only_work = vec![definition("Coding", ActivityCategory::Work)];
        assert_eq!(
            TaxonomySnapshot::new(only_work),
            Err(TaxonomyError::MissingCategory(ActivityCategory::Personal))
        );
        let only_personal = vec![definition("Games", ActivityCategory::Personal)];
        assert_eq!(
            TaxonomySnapshot::new(only_personal),
            Err(TaxonomyError::MissingCategory(ActivityCategory::Work))
        );
    }

    #[test]
    fn taxonomy_rejects_duplicates_and_oversize() {
        let duplicated = vec![
            definition("Coding", ActivityCategory::Work),
            definition("coding!", ActivityCategory::Personal),
        ];
        assert_eq!(
            TaxonomySnapshot::new(duplicated),
            Err(TaxonomyError::DuplicateId("coding".into()))
        );

        let mut many = vec![definition("Personal", ActivityCategory::Personal)];
        many.extend((0..30).map(|i| definition(&format!("Work {i}"), ActivityCategory::Work)));
        assert_eq!(TaxonomySnapshot::new(many), Err(TaxonomyError::TooMany(31)));
    }

    #[test]
    fn tampered_ids_are_rejected() {
        let mut tampered = definition("Coding", ActivityCategory::Work);
        tampered.id = "deep_work".into();
        let types = vec![tampered, definition("Games", ActivityCategory::Personal)];
        assert!(matches!(
            TaxonomySnapshot::new(types),
            Err(TaxonomyError::IdMismatch { .. })
        ));
    }

    #[test]
    fn default_taxonomy_is_valid() {
        let types = default_activity_types();
        assert_eq!(types.len(), 16);
        let snapshot = TaxonomySnapshot::new(types).unwrap();
        assert_eq!(snapshot, TaxonomySnapshot::default_taxonomy());
        assert!(snapshot.contains("youtube_entertainment"));
        assert!(snapshot.contains("personal_ai_use"));
        assert_eq!(snapshot.in_category(ActivityCategory::Work).count(), 6);
    }

    #[test]
    fn allowed_ids_include_idle_once() {
        let snapshot = TaxonomySnapshot::new(vec![
            definition("Work Coding", ActivityCategory::Work),
            definition("Personal Browsing", ActivityCategory::Personal),
        ])
        .unwrap();
        assert_eq!(
            snapshot.allowed_ids(),
            vec!["work_coding", "personal_browsing", "idle"]
        );
        assert!(snapshot.allows("idle"));
        assert!(!snapshot.contains("idle"));
        assert!(!snapshot.allows("deep_work"));
    }
}
