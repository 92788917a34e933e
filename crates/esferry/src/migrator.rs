//! Wires endpoints, index setup and the copy or sync engine from a [`MigrationConfig`].

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{EndpointConfig, MigrationConfig};
use crate::connectors::dump_file::DumpFileSource;
use crate::connectors::elasticsearch::ElasticsearchClient;
use crate::connectors::{ScrollRequest, ScrollSource};
use crate::error::{Error, Result};
use crate::index_setup::{IndexSetup, PreparedIndexes};
use crate::pipeline::{MigrationStats, Output, Pipeline};
use crate::progress::{Progress, ProgressReporter};
use crate::retry::RetryConfig;
use crate::sync::{SyncEngine, SyncStats};
use crate::transform::Transformer;

/// How often cluster health is polled while waiting for readiness.
pub const READINESS_INTERVAL: Duration = Duration::from_secs(3);

/// Outcome of a run.
#[derive(Debug, Clone)]
pub enum RunReport {
    /// A plain copy.
    Migration(MigrationStats),
    /// An incremental sync.
    Sync(SyncStats),
}

/// Slices actually used for a read.
///
/// Files serve a single slice and clusters without sliced scroll would
/// return every document to every slice.
#[must_use]
pub fn effective_slices(requested: usize, file_input: bool, supports_slices: bool) -> usize {
    let requested = requested.max(1);
    if requested == 1 {
        return 1;
    }
    if file_input {
        warn!("File input is read with a single slice, ignoring {} slices", requested);
        return 1;
    }
    if !supports_slices {
        warn!("Source does not support sliced scroll, ignoring {} slices", requested);
        return 1;
    }
    requested
}

/// Builds the cursor request for `indexes` from the scroll options.
#[must_use]
pub fn scroll_request(
    config: &MigrationConfig,
    indexes: &str,
    sort_field: Option<&str>,
) -> ScrollRequest {
    let mut request = ScrollRequest::new(indexes, config.scroll.page_size);
    request.keep_alive = config.scroll.scroll_time.clone();
    request.query = config.scroll.effective_query();
    request.fields = config.scroll.fields.clone();
    request.sort_field = sort_field.filter(|f| !f.is_empty()).map(str::to_string);
    request
}

/// Runs one configured migration or sync.
pub struct Migrator {
    config: MigrationConfig,
    show_progress: bool,
    handshake: RetryConfig,
    readiness_interval: Duration,
}

impl Migrator {
    /// Creates a migrator for a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: MigrationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            show_progress: false,
            handshake: RetryConfig::for_handshake(),
            readiness_interval: READINESS_INTERVAL,
        })
    }

    /// Draws progress bars while running.
    #[must_use]
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Overrides the retry policy used to reach clusters at startup.
    #[must_use]
    pub fn with_handshake_retry(mut self, retry: RetryConfig) -> Self {
        self.handshake = retry;
        self
    }

    /// The configuration being run.
    #[must_use]
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Arc<ElasticsearchClient>> {
        let client = ElasticsearchClient::connect(endpoint, &self.handshake).await?;
        client
            .wait_until_ready(
                self.config.wait_for_green,
                self.readiness_interval,
                &RetryConfig::default(),
            )
            .await?;
        Ok(Arc::new(client))
    }

    async fn connect_optional(
        &self,
        endpoint: Option<&EndpointConfig>,
    ) -> Result<Option<Arc<ElasticsearchClient>>> {
        match endpoint {
            Some(endpoint) => Ok(Some(self.connect(endpoint).await?)),
            None => Ok(None),
        }
    }

    /// Runs the configured copy or sync to completion.
    ///
    /// # Errors
    ///
    /// Returns an error on handshake, index setup, source cursor (sync) or
    /// output file failures.
    pub async fn run(&self) -> Result<RunReport> {
        let source = self.connect_optional(self.config.source.as_ref()).await?;
        let target = self.connect_optional(self.config.target.as_ref()).await?;

        if self.config.sync.enabled {
            let (Some(source), Some(target)) = (source, target) else {
                return Err(Error::Config(
                    "sync needs both a source and a target cluster".to_string(),
                ));
            };
            return self.run_sync(source, target).await.map(RunReport::Sync);
        }
        self.run_copy(source, target).await.map(RunReport::Migration)
    }

    async fn prepare_indexes(
        &self,
        source: &ElasticsearchClient,
        target: &ElasticsearchClient,
        indexes: &str,
        target_index: Option<&str>,
    ) -> Result<PreparedIndexes> {
        IndexSetup::new(source, target, &self.config.index_setup)
            .prepare(indexes, target_index)
            .await
    }

    async fn run_copy(
        &self,
        source: Option<Arc<ElasticsearchClient>>,
        target: Option<Arc<ElasticsearchClient>>,
    ) -> Result<MigrationStats> {
        let target_endpoint = self.config.target.as_ref();
        let target_index = target_endpoint.and_then(EndpointConfig::target_index);

        let (reader, indexes, slices): (Arc<dyn ScrollSource>, String, usize) =
            match (&source, &self.config.input_file) {
                (Some(client), _) => {
                    let indexes = self
                        .config
                        .source
                        .as_ref()
                        .map_or("_all", EndpointConfig::source_indexes)
                        .to_string();
                    let slices = effective_slices(
                        self.config.scroll.slices,
                        false,
                        client.version().supports_slices(),
                    );
                    let reader: Arc<dyn ScrollSource> = client.clone();
                    (reader, indexes, slices)
                }
                (None, Some(input)) => {
                    let file = DumpFileSource::new(
                        input.path.clone(),
                        input.format,
                        target_index.map(str::to_string),
                    );
                    let slices = effective_slices(self.config.scroll.slices, true, false);
                    let reader: Arc<dyn ScrollSource> = Arc::new(file);
                    (reader, input.path.display().to_string(), slices)
                }
                (None, None) => {
                    return Err(Error::Config(
                        "no input: set a source cluster or an input file".to_string(),
                    ))
                }
            };

        let prepared = match (&source, &target) {
            (Some(source), Some(target)) => Some(
                self.prepare_indexes(source, target, &indexes, target_index)
                    .await?,
            ),
            _ => None,
        };
        let indexes = prepared
            .as_ref()
            .map_or(indexes, |p| p.source_indexes.clone());

        let sort_field = self
            .config
            .source
            .as_ref()
            .and_then(|s| s.sort_field.as_deref());
        let request = scroll_request(&self.config, &indexes, sort_field);

        let (output, requires_type, label) = match (&target, &self.config.output_file) {
            (Some(client), _) => (
                Output::Bulk(client.clone()),
                client.version().requires_type(),
                "Bulk",
            ),
            (None, Some(file)) => (Output::File(file.clone()), false, "Output"),
            (None, None) => {
                return Err(Error::Config(
                    "no output: set a target cluster or an output file".to_string(),
                ))
            }
        };

        let repeat_times = self.config.transform.repeat_times;
        if repeat_times > 1 && !self.config.transform.regenerate_id {
            warn!(
                "Repeating {} times without regenerate_id, later rounds overwrite earlier ones",
                repeat_times
            );
        }

        let transformer = Transformer::new(&self.config.transform, target_index, requires_type);
        let progress = Progress::new();
        let pipeline = Pipeline::new(
            reader,
            output,
            request,
            self.config.bulk.clone(),
            transformer,
        )
        .with_slices(slices)
        .with_repeat(repeat_times)
        .with_progress(progress.clone());

        info!("Starting data migration");
        let reporter = ProgressReporter::start(progress, self.show_progress, label);
        let outcome = pipeline.run().await;
        reporter.finish().await;

        if let (Some(prepared), Some(target)) = (&prepared, &target) {
            prepared.restore(target).await;
        }
        outcome
    }

    async fn run_sync(
        &self,
        source: Arc<ElasticsearchClient>,
        target: Arc<ElasticsearchClient>,
    ) -> Result<SyncStats> {
        let (Some(source_endpoint), Some(target_endpoint)) =
            (self.config.source.as_ref(), self.config.target.as_ref())
        else {
            return Err(Error::Config(
                "sync needs both a source and a target cluster".to_string(),
            ));
        };
        let source_index = source_endpoint.source_indexes();
        let target_index = target_endpoint.target_index().ok_or_else(|| {
            Error::Config("sync needs a target index".to_string())
        })?;

        let setup = &self.config.index_setup;
        let prepared = if setup.is_active() || setup.copy_mappings || setup.refresh {
            Some(
                self.prepare_indexes(&source, &target, source_index, Some(target_index))
                    .await?,
            )
        } else {
            None
        };

        let source_sort = source_endpoint
            .sort_field
            .as_deref()
            .unwrap_or(source.version().default_sort_field());
        let target_sort = target_endpoint
            .sort_field
            .as_deref()
            .unwrap_or(target.version().default_sort_field());
        info!("Source sort field {}, destination sort field {}", source_sort, target_sort);

        let progress = Progress::new();
        let engine = SyncEngine::new(
            source.clone(),
            target.clone(),
            target.clone(),
            scroll_request(&self.config, source_index, Some(source_sort)),
            scroll_request(&self.config, target_index, Some(target_sort)),
        )
        .with_delete(self.config.sync.enable_delete)
        .with_bulk_size(self.config.bulk.bulk_size_bytes())
        .with_sleep_after_bulk(self.config.bulk.sleep_after_bulk())
        .with_progress(progress.clone());

        let reporter = ProgressReporter::start(progress, self.show_progress, "Sync");
        let outcome = engine.run().await;
        reporter.finish().await;

        if let Some(prepared) = &prepared {
            prepared.restore(&target).await;
        }
        outcome
    }
}
