//! Upgrades of older export payloads to the current payload version.

use std::collections::HashSet;

use rollout_common::{Error, Result};
use tracing::{debug, info};

use crate::export::{CURRENT_EXPORT_VERSION, ExportData, LEGACY_EXPORT_VERSION};

/// Moves a payload from one export version to the next.
pub trait ExportTransformer: Send + Sync {
    fn can_transform(&self, version: &str) -> bool;

    /// Version of the payload after `transform`.
    fn target_version(&self) -> &str;

    fn transform(&self, data: ExportData) -> Result<ExportData>;
}

/// `1.0` payloads carried the game system only at the top level. Stamp it on
/// every record that lacks one.
#[derive(Debug, Default, Clone, Copy)]
pub struct GameSystemStampTransformer;

impl ExportTransformer for GameSystemStampTransformer {
    fn can_transform(&self, version: &str) -> bool {
        version == LEGACY_EXPORT_VERSION
    }

    fn target_version(&self) -> &str {
        "1.1"
    }

    fn transform(&self, mut data: ExportData) -> Result<ExportData> {
        if data.game_system.is_empty() {
            return Ok(data);
        }

        let mut stamped = 0;
        for records in data.data.values_mut() {
            for record in records.iter_mut().filter(|r| r.game_system.is_none()) {
                record.game_system = Some(data.game_system.clone());
                stamped += 1;
            }
        }
        debug!("stamped game system {} on {stamped} record(s)", data.game_system);
        Ok(data)
    }
}

pub struct TransformerRegistry {
    current_version: String,
    transformers: Vec<Box<dyn ExportTransformer>>,
}

impl TransformerRegistry {
    pub fn new(current_version: impl Into<String>) -> Self {
        Self {
            current_version: current_version.into(),
            transformers: Vec::new(),
        }
    }

    /// Registry targeting this build's export version with every built-in
    /// transformer.
    pub fn builtin() -> Self {
        let mut registry = Self::new(CURRENT_EXPORT_VERSION);
        registry.register(Box::new(GameSystemStampTransformer));
        registry
    }

    pub fn register(&mut self, transformer: Box<dyn ExportTransformer>) {
        self.transformers.push(transformer);
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// Apply matching transformers until the payload reaches the current
    /// version.
    pub fn transform_to_current(&self, mut data: ExportData) -> Result<ExportData> {
        if data.export_version.is_empty() {
            data.export_version = LEGACY_EXPORT_VERSION.to_string();
        }

        let mut seen = HashSet::new();
        while data.export_version != self.current_version {
            let version = data.export_version.clone();
            if !seen.insert(version.clone()) {
                return Err(Error::Export(format!(
                    "transformer chain loops at version {version}"
                )));
            }

            let transformer = self
                .transformers
                .iter()
                .find(|t| t.can_transform(&version))
                .ok_or_else(|| {
                    Error::Export(format!("no transformer found for version {version}"))
                })?;

            let target = transformer.target_version().to_string();
            info!("transforming export data from {version} to {target}");
            data = transformer.transform(data)?;
            data.export_version = target;
        }

        Ok(data)
    }
}
