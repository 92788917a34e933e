//! Destination index preparation: settings, shards and mappings copied from the source.
//!
//! Runs once before the data moves. Refresh is switched off on prepared
//! indexes during the load and [`PreparedIndexes::restore`] puts the source
//! interval back afterwards.

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::IndexSetupOptions;
use crate::connectors::elasticsearch::ElasticsearchClient;
use crate::error::{Error, Result};

/// Index-level settings that belong to one concrete index and cannot be copied.
const INSTANCE_SETTINGS: [&str; 4] = ["creation_date", "uuid", "version", "provided_name"];

/// Settings that can only be given at creation time.
const CREATION_ONLY_SETTINGS: [&str; 2] = ["number_of_shards", "number_of_routing_shards"];

/// Whether an index takes part in a copy. System-like names need `copy_all`.
#[must_use]
pub fn is_copied(name: &str, copy_all: bool) -> bool {
    copy_all || !(name.starts_with('.') || name.starts_with('_'))
}

/// Drops instance-specific keys from `{"settings": {"index": {..}}}`.
pub fn clean_settings(body: &mut Value) {
    if let Some(index) = index_section(body) {
        for key in INSTANCE_SETTINGS {
            index.remove(key);
        }
    }
}

/// The `settings.index` object, created on demand.
fn index_section(body: &mut Value) -> Option<&mut Map<String, Value>> {
    let root = body.as_object_mut()?;
    let settings = root
        .entry("settings")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()?;
    settings
        .entry("index")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}

fn refresh_interval_of(body: &Value) -> Value {
    body.pointer("/settings/index/refresh_interval")
        .cloned()
        .unwrap_or(Value::Null)
}

/// Moves the entry of a single source index under the target name.
fn rename_single(entries: &mut Map<String, Value>, source: &str, target: Option<&str>) {
    let Some(target) = target.filter(|t| *t != source) else {
        return;
    };
    if entries.len() != 1 {
        return;
    }
    if let Some(value) = entries.shift_remove(source) {
        debug!("Single index {} is written as {}", source, target);
        entries.insert(target.to_string(), value);
    }
}

/// Wraps bare mapping bodies (very old clusters) in a `mappings` key.
fn normalize_mappings(mut mappings: Map<String, Value>) -> Map<String, Value> {
    for value in mappings.values_mut() {
        let wrapped = value.get("mappings").is_some();
        if !wrapped {
            *value = json!({ "mappings": value.take() });
        }
    }
    mappings
}

/// Splits an index's `mappings` into the bodies to PUT, one per type on typed clusters.
fn mapping_bodies(mappings: &Value, typed: bool) -> Vec<(Option<String>, Value)> {
    match mappings.as_object() {
        Some(types) if typed => types
            .iter()
            .map(|(doc_type, body)| (Some(doc_type.clone()), body.clone()))
            .collect(),
        Some(body) if !body.is_empty() => vec![(None, mappings.clone())],
        _ => Vec::new(),
    }
}

/// Result of resolving the source index expression.
#[derive(Debug, Clone, Default)]
pub struct ResolvedIndexes {
    /// Concrete index names, in response order.
    pub names: Vec<String>,
    /// Mappings keyed by index name, each wrapped in a `mappings` key.
    pub mappings: Map<String, Value>,
}

impl ResolvedIndexes {
    /// Comma separated names, suitable as a scroll target.
    #[must_use]
    pub fn expression(&self) -> String {
        self.names.join(",")
    }
}

/// Indexes touched by setup, with what must be put back once the copy ends.
#[derive(Debug, Clone, Default)]
pub struct PreparedIndexes {
    /// Concrete source index expression to scroll.
    pub source_indexes: String,
    /// Destination indexes prepared, with the refresh interval to restore.
    pub refresh_intervals: Vec<(String, Value)>,
    /// Destination indexes to refresh at the end.
    pub refresh: Vec<String>,
}

impl PreparedIndexes {
    /// Restores refresh intervals and refreshes the destination.
    ///
    /// Failures are logged; the data is already written at this point.
    pub async fn restore(&self, target: &ElasticsearchClient) {
        for (name, interval) in &self.refresh_intervals {
            let body = json!({ "index": { "refresh_interval": interval } });
            if let Err(e) = target.update_settings(name, &body).await {
                warn!("Failed to restore refresh interval of {}: {}", name, e);
            }
        }
        for name in &self.refresh {
            match target.refresh(name).await {
                Ok(()) => info!("Refreshed {}", name),
                Err(e) => warn!("Failed to refresh {}: {}", name, e),
            }
        }
    }
}

/// Copies index definitions from a source cluster to a destination cluster.
pub struct IndexSetup<'a> {
    source: &'a ElasticsearchClient,
    target: &'a ElasticsearchClient,
    options: &'a IndexSetupOptions,
}

impl<'a> IndexSetup<'a> {
    /// Creates a setup step between two clusters.
    pub fn new(
        source: &'a ElasticsearchClient,
        target: &'a ElasticsearchClient,
        options: &'a IndexSetupOptions,
    ) -> Self {
        Self {
            source,
            target,
            options,
        }
    }

    /// Resolves an index expression through the source mappings.
    ///
    /// # Errors
    ///
    /// Returns an error if the mappings cannot be read or nothing matches.
    pub async fn resolve(&self, expression: &str) -> Result<ResolvedIndexes> {
        let mappings = normalize_mappings(self.source.index_mappings(expression).await?);
        let mappings: Map<String, Value> = mappings
            .into_iter()
            .filter(|(name, _)| {
                let copied = is_copied(name, self.options.copy_all_indexes);
                if !copied {
                    debug!("Skipping index {}", name);
                }
                copied
            })
            .collect();
        if mappings.is_empty() {
            return Err(Error::Config(format!("no index matches '{}'", expression)));
        }
        Ok(ResolvedIndexes {
            names: mappings.keys().cloned().collect(),
            mappings,
        })
    }

    /// Prepares destination indexes for the copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read, mappings would be
    /// copied across major versions, or a mapping is rejected. Settings
    /// failures on single indexes are logged and skipped.
    pub async fn prepare(
        &self,
        expression: &str,
        target_index: Option<&str>,
    ) -> Result<PreparedIndexes> {
        if self.options.copy_mappings && self.source.version() != self.target.version() {
            return Err(Error::Config(format!(
                "cannot copy mappings from {} to {}, update the mapping manually",
                self.source.version(),
                self.target.version()
            )));
        }

        let resolved = self.resolve(expression).await?;
        let source_indexes = resolved.expression();
        info!("Resolved {} to {} indexes", expression, resolved.names.len());

        let mut prepared = PreparedIndexes {
            source_indexes: source_indexes.clone(),
            ..PreparedIndexes::default()
        };

        if self.options.is_active() {
            prepared.refresh_intervals = self
                .copy_settings(&source_indexes, target_index)
                .await?;
        }
        if self.options.copy_mappings {
            let mut mappings = resolved.mappings;
            rename_single(&mut mappings, &source_indexes, target_index);
            self.copy_mappings(&mappings).await?;
        }
        if self.options.refresh {
            prepared.refresh = match target_index {
                Some(target) => vec![target.to_string()],
                None => resolved.names,
            };
        }
        Ok(prepared)
    }

    async fn copy_settings(
        &self,
        source_indexes: &str,
        target_index: Option<&str>,
    ) -> Result<Vec<(String, Value)>> {
        info!("Copying index settings");
        let mut source_settings = self.source.index_settings(source_indexes).await?;
        rename_single(&mut source_settings, source_indexes, target_index);

        let target_names = target_index.unwrap_or(source_indexes);
        let target_settings = match self.target.index_settings(target_names).await {
            Ok(settings) => settings,
            Err(e) => {
                debug!("No settings for {} on the destination: {}", target_names, e);
                Map::new()
            }
        };

        let mut intervals = Vec::with_capacity(source_settings.len());
        for (name, source_body) in source_settings {
            let mut exists = target_settings.contains_key(&name);
            if exists && self.options.recreate {
                self.target.delete_index(&name).await?;
                exists = false;
            }

            let mut body = if self.options.copy_settings {
                source_body.clone()
            } else if exists {
                target_settings.get(&name).cloned().unwrap_or_else(|| json!({}))
            } else {
                json!({})
            };
            clean_settings(&mut body);
            intervals.push((name.clone(), refresh_interval_of(&source_body)));

            let Some(index) = index_section(&mut body) else {
                warn!("Settings of {} are not an object, skipping", name);
                continue;
            };
            index.insert("refresh_interval".to_string(), json!("-1"));

            if exists {
                for key in CREATION_ONLY_SETTINGS {
                    index.remove(key);
                }
                if self.options.shards.is_some_and(|s| s > 0) {
                    warn!("{} already exists, its shard count is left unchanged", name);
                }
                let update = body.get("settings").cloned().unwrap_or_else(|| json!({}));
                if let Err(e) = self.target.update_settings(&name, &update).await {
                    error!("Failed to update settings of {}: {}", name, e);
                }
            } else {
                if let Some(shards) = self.options.shards.filter(|s| *s > 0) {
                    index.insert("number_of_shards".to_string(), json!(shards));
                }
                let create = json!({ "settings": body.get("settings").cloned().unwrap_or_default() });
                if let Err(e) = self.target.create_index(&name, &create).await {
                    error!("Failed to create index {}: {}", name, e);
                }
            }
        }
        Ok(intervals)
    }

    async fn copy_mappings(&self, mappings: &Map<String, Value>) -> Result<()> {
        let typed = self.source.version().typed_mappings();
        for (name, entry) in mappings {
            let Some(index_mappings) = entry.get("mappings") else {
                continue;
            };
            for (doc_type, body) in mapping_bodies(index_mappings, typed) {
                debug!("Putting mapping of {} ({:?})", name, doc_type);
                self.target
                    .update_mapping(name, doc_type.as_deref(), &body)
                    .await?;
            }
        }
        info!("Copied mappings of {} indexes", mappings.len());
        Ok(())
    }
}
