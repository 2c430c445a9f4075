use std::{io::ErrorKind, path::PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{
    default_activity_types, validate_taxonomy, ActivityCategory, ActivityTypeDefinition,
    TaxonomyError, TaxonomySnapshot,
};

/// Read side of the taxonomy. The pipeline treats whatever this returns as authoritative and
/// validates it while building a [super::TaxonomySnapshot].
#[async_trait]
pub trait TaxonomySource: Send + Sync {
    async fn activity_types(&self) -> Result<Vec<ActivityTypeDefinition>>;
}

/// Keeps the taxonomy as a JSON array in a single file. Writes go through a temporary file that
/// is renamed over the original, so readers see either the old or the new taxonomy.
pub struct FileTaxonomyStore {
    path: PathBuf,
}

impl FileTaxonomyStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn load(&self) -> Result<Vec<ActivityTypeDefinition>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                anyhow::Error::from(TaxonomyError::Unparseable(format!(
                    "{} {e}",
                    self.path.display()
                )))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No taxonomy at {:?}, using defaults", self.path);
                Ok(default_activity_types())
            }
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read taxonomy from {}", self.path.display())),
        }
    }

    /// Validates `types` as a whole and replaces the stored taxonomy with it.
    pub async fn save(&self, types: &[ActivityTypeDefinition]) -> Result<()> {
        validate_taxonomy(types)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temporary = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&temporary).await?;
        file.write_all(&serde_json::to_vec_pretty(types)?).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temporary, &self.path).await?;
        info!("Saved taxonomy with {} activities", types.len());
        Ok(())
    }

    /// Adds a new activity type, returning it with its generated id.
    pub async fn add(
        &self,
        name: &str,
        description: &str,
        category: ActivityCategory,
    ) -> Result<ActivityTypeDefinition> {
        let definition = ActivityTypeDefinition::new(name, description, category)?;
        let mut types = self.load().await?;
        types.push(definition.clone());
        self.save(&types).await?;
        Ok(definition)
    }

    /// Removes the activity type with `id`. Recorded entries that use it are left untouched.
    pub async fn remove(&self, id: &str) -> Result<ActivityTypeDefinition> {
        let mut types = self.load().await?;
        let position = types
            .iter()
            .position(|v| v.id == id)
            .ok_or_else(|| TaxonomyError::UnknownId(id.to_string()))?;
        let removed = types.remove(position);
        self.save(&types).await?;
        Ok(removed)
    }

    /// Restores the built-in taxonomy.
    pub async fn reset(&self) -> Result<()> {
        self.save(&default_activity_types()).await
    }
}

#[async_trait]
impl TaxonomySource for FileTaxonomyStore {
    async fn activity_types(&self) -> Result<Vec<ActivityTypeDefinition>> {
        self.load().await
    }
}

fn fallback_snapshot(error: TaxonomyError) -> TaxonomySnapshot {
    warn!("ConfigurationInvalid: stored taxonomy is invalid, using the defaults. {error}");
    TaxonomySnapshot::default_taxonomy()
}

/// Takes a snapshot of `source`. A taxonomy that can't be parsed or validated is reported and
/// replaced by the built-in one, only failing to read it at all is an error.
pub async fn load_snapshot(source: &dyn TaxonomySource) -> Result<TaxonomySnapshot> {
    let types = match source.activity_types().await {
        Ok(types) => types,
        Err(e) => return e.downcast::<TaxonomyError>().map(fallback_snapshot),
    };
    Ok(TaxonomySnapshot::new(types).unwrap_or_else(fallback_snapshot))
}
