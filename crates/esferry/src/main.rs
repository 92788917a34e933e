//! esferry CLI
//!
//! Copies documents between Elasticsearch/OpenSearch clusters and files, or
//! keeps a destination index in sync with a source index.

// CLI tool - relax pedantic lints for ergonomics
#![allow(clippy::pedantic)]

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use esferry::config::{FieldRename, InputFileConfig, InputFormat, OutputFileConfig};
use esferry::connectors::common::parse_auth;
use esferry::{EndpointConfig, MigrationConfig, Migrator, RunReport};

#[derive(Parser)]
#[command(name = "esferry")]
#[command(version)]
#[command(
    about = "Move documents between Elasticsearch/OpenSearch clusters and keep indexes in sync",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level: trace, debug, info, warn or error (RUST_LOG wins when set)
    #[arg(short = 'v', long = "log", global = true, default_value = "info")]
    log: String,

    /// Verbose output (same as --log debug)
    #[arg(long, global = true)]
    verbose: bool,

    /// Never draw progress bars
    #[arg(long = "no-progress", global = true)]
    no_progress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy documents from a cluster or file to a cluster or file
    Run(MigrateArgs),

    /// Make the destination index converge on the source index
    Sync(MigrateArgs),

    /// Validate a configuration (file plus flags) without running it
    Validate(MigrateArgs),

    /// Generate an example configuration
    Init {
        /// Output file path
        #[arg(short, long, default_value = "esferry.yaml")]
        output: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum InputFileType {
    /// One search hit per line, as written by --output_file
    Dump,
    /// One plain JSON object per line
    #[value(name = "json_line")]
    JsonLine,
}

impl From<InputFileType> for InputFormat {
    fn from(value: InputFileType) -> Self {
        match value {
            InputFileType::Dump => Self::Dump,
            InputFileType::JsonLine => Self::JsonLine,
        }
    }
}

/// Flags shared by `run`, `sync` and `validate`. Every flag overrides the file.
#[derive(Args, Default)]
struct MigrateArgs {
    /// Configuration file path
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Source cluster, e.g. http://localhost:9200
    #[arg(short = 's', long = "source", env = "ESFERRY_SOURCE")]
    source: Option<String>,

    /// Destination cluster, e.g. http://localhost:9201
    #[arg(short = 'd', long = "dest", env = "ESFERRY_DEST")]
    dest: Option<String>,

    /// Source indexes: name, comma separated list or pattern
    #[arg(short = 'x', long = "src_indexes")]
    src_indexes: Option<String>,

    /// Destination index (defaults to each document's source index)
    #[arg(short = 'y', long = "dest_index")]
    dest_index: Option<String>,

    /// Basic auth of the source cluster, user:pass
    #[arg(short = 'm', long = "source_auth", env = "ESFERRY_SOURCE_AUTH")]
    source_auth: Option<String>,

    /// Basic auth of the destination cluster, user:pass
    #[arg(short = 'n', long = "dest_auth", env = "ESFERRY_DEST_AUTH")]
    dest_auth: Option<String>,

    /// HTTP proxy for the source cluster
    #[arg(long = "source_proxy")]
    source_proxy: Option<String>,

    /// HTTP proxy for the destination cluster
    #[arg(long = "dest_proxy")]
    dest_proxy: Option<String>,

    /// Query-string filter applied to the source, e.g. name:kim
    #[arg(short = 'q', long = "query")]
    query: Option<String>,

    /// Extra clause for incremental runs, e.g. modifiedDate:>=1727712000000
    #[arg(long = "stamp")]
    stamp: Option<String>,

    /// Source sort field (sync defaults to _id, or _uid before 6.x)
    #[arg(long = "ssort")]
    source_sort: Option<String>,

    /// Destination sort field, used by sync
    #[arg(long = "dsort")]
    dest_sort: Option<String>,

    /// Documents per scroll page
    #[arg(short = 'c', long = "count")]
    count: Option<usize>,

    /// Documents buffered between scroll and bulk
    #[arg(long = "buffer_count")]
    buffer_count: Option<usize>,

    /// Number of bulk workers
    #[arg(short = 'w', long = "workers")]
    workers: Option<usize>,

    /// Bulk request size in MB
    #[arg(short = 'b', long = "bulk_size")]
    bulk_size: Option<usize>,

    /// Scroll keep-alive
    #[arg(short = 't', long = "time")]
    time: Option<String>,

    /// Number of parallel scroll slices
    #[arg(long = "sliced_scroll_size")]
    sliced_scroll_size: Option<usize>,

    /// Delete destination indexes before copying
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// Include indexes starting with . and _
    #[arg(short = 'a', long = "all")]
    all: bool,

    /// Copy index settings from the source
    #[arg(long = "copy_settings")]
    copy_settings: bool,

    /// Copy index mappings from the source
    #[arg(long = "copy_mappings")]
    copy_mappings: bool,

    /// Number of shards of created indexes
    #[arg(long = "shards")]
    shards: Option<u32>,

    /// Refresh the destination once the copy finishes
    #[arg(long = "refresh")]
    refresh: bool,

    /// Force every document to this type
    #[arg(short = 'u', long = "type_override")]
    type_override: Option<String>,

    /// Wait for both clusters to be green (yellow is fine otherwise)
    #[arg(long = "green")]
    green: bool,

    /// Write documents to this file instead of a cluster
    #[arg(short = 'o', long = "output_file")]
    output_file: Option<PathBuf>,

    /// Truncate the output file first
    #[arg(long = "truncate_output")]
    truncate_output: bool,

    /// Read documents from this file instead of a cluster
    #[arg(short = 'i', long = "input_file")]
    input_file: Option<PathBuf>,

    /// Format of the input file
    #[arg(long = "input_file_type", value_enum)]
    input_file_type: Option<InputFileType>,

    /// Delete destination documents missing from the source (sync only)
    #[arg(long = "enable_delete")]
    enable_delete: bool,

    /// Source fields to copy, comma separated
    #[arg(long = "fields", value_delimiter = ',')]
    fields: Vec<String>,

    /// Source fields to drop, comma separated
    #[arg(long = "skip", value_delimiter = ',')]
    skip: Vec<String>,

    /// Field renames, e.g. _type:type,name:myname
    #[arg(long = "rename")]
    rename: Option<String>,

    /// Replay the source N times into the destination
    #[arg(long = "repeat_times")]
    repeat_times: Option<usize>,

    /// Let the destination generate new document ids
    #[arg(short = 'r', long = "regenerate_id")]
    regenerate_id: bool,

    /// Seconds to sleep after each bulk request
    #[arg(short = 'p', long = "sleep")]
    sleep: Option<u64>,

    /// Seconds without input before a partial batch is flushed
    #[arg(long = "idle_timeout")]
    idle_timeout: Option<u64>,

    /// Seconds without input before a bulk worker stops (0 = never)
    #[arg(long = "task_timeout")]
    task_timeout: Option<u64>,
}

/// Returns the endpoint in `slot`, creating or re-pointing it when `url` is given.
fn endpoint_slot(
    slot: &mut Option<EndpointConfig>,
    url: Option<String>,
) -> Option<&mut EndpointConfig> {
    if let Some(url) = url {
        match slot {
            Some(endpoint) => endpoint.url = url,
            None => *slot = Some(EndpointConfig::new(url)),
        }
    }
    slot.as_mut()
}

fn apply_endpoint(
    endpoint: Option<&mut EndpointConfig>,
    flag: &str,
    index: Option<String>,
    auth: Option<String>,
    proxy: Option<String>,
    sort_field: Option<String>,
) -> anyhow::Result<()> {
    let Some(endpoint) = endpoint else {
        if index.is_some() || auth.is_some() || proxy.is_some() || sort_field.is_some() {
            anyhow::bail!("endpoint options given without --{}", flag);
        }
        return Ok(());
    };
    if index.is_some() {
        endpoint.index = index;
    }
    if let Some(auth) = auth {
        let (username, password) =
            parse_auth(&auth).ok_or_else(|| anyhow::anyhow!("auth must look like user:pass"))?;
        endpoint.username = Some(username);
        endpoint.password = password;
    }
    if proxy.is_some() {
        endpoint.proxy = proxy;
    }
    if sort_field.is_some() {
        endpoint.sort_field = sort_field;
    }
    Ok(())
}

impl MigrateArgs {
    /// Loads the file (if any) and applies the flags on top.
    fn into_config(self, sync: bool) -> anyhow::Result<MigrationConfig> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from {:?}", path);
                MigrationConfig::from_file(path)?
            }
            None => MigrationConfig::default(),
        };

        apply_endpoint(
            endpoint_slot(&mut config.source, self.source),
            "source",
            self.src_indexes,
            self.source_auth,
            self.source_proxy,
            self.source_sort,
        )?;
        apply_endpoint(
            endpoint_slot(&mut config.target, self.dest),
            "dest",
            self.dest_index,
            self.dest_auth,
            self.dest_proxy,
            self.dest_sort,
        )?;

        if let Some(path) = self.input_file {
            config.input_file = Some(InputFileConfig {
                path,
                format: self.input_file_type.map(Into::into).unwrap_or_default(),
            });
        } else if let (Some(input), Some(kind)) = (config.input_file.as_mut(), self.input_file_type)
        {
            input.format = kind.into();
        }
        if let Some(path) = self.output_file {
            config.output_file = Some(OutputFileConfig {
                path,
                truncate: self.truncate_output,
            });
        } else if let Some(output) = config.output_file.as_mut() {
            output.truncate |= self.truncate_output;
        }

        let scroll = &mut config.scroll;
        if self.query.is_some() {
            scroll.query = self.query;
        }
        if self.stamp.is_some() {
            scroll.stamp = self.stamp;
        }
        if !self.fields.is_empty() {
            scroll.fields = self.fields;
        }
        if let Some(count) = self.count {
            scroll.page_size = count;
        }
        if let Some(time) = self.time {
            scroll.scroll_time = time;
        }
        if let Some(slices) = self.sliced_scroll_size {
            scroll.slices = slices;
        }

        let bulk = &mut config.bulk;
        if let Some(capacity) = self.buffer_count {
            bulk.queue_capacity = capacity;
        }
        if let Some(workers) = self.workers {
            bulk.workers = workers;
        }
        if let Some(size) = self.bulk_size {
            bulk.bulk_size_mb = size;
        }
        if let Some(sleep) = self.sleep {
            bulk.sleep_after_bulk_secs = sleep;
        }
        if let Some(idle) = self.idle_timeout {
            bulk.idle_timeout_secs = idle;
        }
        if let Some(task) = self.task_timeout {
            bulk.task_timeout_secs = task;
        }

        let transform = &mut config.transform;
        if self.type_override.is_some() {
            transform.type_override = self.type_override;
        }
        transform.regenerate_id |= self.regenerate_id;
        if let Some(rename) = self.rename {
            transform.rename_fields = FieldRename::parse_list(&rename)?;
        }
        if !self.skip.is_empty() {
            transform.skip_fields = self.skip;
        }
        if let Some(times) = self.repeat_times {
            transform.repeat_times = times;
        }

        let setup = &mut config.index_setup;
        setup.recreate |= self.force;
        setup.copy_all_indexes |= self.all;
        setup.copy_settings |= self.copy_settings;
        setup.copy_mappings |= self.copy_mappings;
        setup.refresh |= self.refresh;
        if self.shards.is_some() {
            setup.shards = self.shards;
        }

        config.wait_for_green |= self.green;
        config.sync.enabled |= sync;
        config.sync.enable_delete |= self.enable_delete;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log.to_lowercase()))
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let show_progress = !cli.no_progress && std::io::stdout().is_terminal();

    match cli.command {
        Commands::Run(args) => run(args.into_config(false)?, show_progress).await?,
        Commands::Sync(args) => run(args.into_config(true)?, show_progress).await?,
        Commands::Validate(args) => validate_config(&args.into_config(false)?)?,
        Commands::Init { output } => generate_config(&output)?,
    }

    Ok(())
}

async fn run(config: MigrationConfig, show_progress: bool) -> anyhow::Result<()> {
    let migrator = Migrator::new(config)?.with_progress(show_progress);
    info!("Starting...");

    match migrator.run().await? {
        RunReport::Migration(stats) => {
            println!("\n✅ Migration Complete!");
            println!("   Scrolled:       {}", stats.scrolled);
            println!("   Written:        {}", stats.written);
            println!("   Bulk requests:  {}", stats.bulk_requests);
            println!("   Failed batches: {}", stats.failed_batches);
            println!("   Failed items:   {}", stats.failed_items);
            if stats.malformed > 0 {
                println!("   Malformed:      {}", stats.malformed);
            }
            if stats.rounds > 1 {
                println!("   Rounds:         {}", stats.rounds);
            }
            println!("   Duration:       {:.2}s", stats.duration_secs);
            println!("   Throughput:     {:.0} docs/sec", stats.throughput());
        }
        RunReport::Sync(stats) => {
            println!("\n✅ Sync Complete!");
            println!("   Source docs:    {}", stats.source_docs);
            println!("   Dest docs:      {}", stats.dest_docs);
            println!("   Added:          {}", stats.added);
            println!("   Updated:        {}", stats.updated);
            println!("   Deleted:        {}", stats.deleted);
            if stats.orphaned > 0 {
                println!(
                    "   Orphaned:       {} (rerun with --enable_delete to remove)",
                    stats.orphaned
                );
            }
            println!("   Failed batches: {}", stats.failed_batches);
            println!("   Duration:       {:.2}s", stats.duration_secs);
        }
    }

    Ok(())
}

fn describe(endpoint: Option<&EndpointConfig>, file: Option<&Path>) -> String {
    match (endpoint, file) {
        (Some(endpoint), _) => format!(
            "{} [{}]",
            endpoint.url,
            endpoint.index.as_deref().unwrap_or("-")
        ),
        (None, Some(path)) => format!("file {}", path.display()),
        (None, None) => "none".to_string(),
    }
}

fn validate_config(config: &MigrationConfig) -> anyhow::Result<()> {
    config.validate()?;

    println!("✅ Configuration is valid!");
    println!(
        "   Input:   {}",
        describe(
            config.source.as_ref(),
            config.input_file.as_ref().map(|f| f.path.as_path())
        )
    );
    println!(
        "   Output:  {}",
        describe(
            config.target.as_ref(),
            config.output_file.as_ref().map(|f| f.path.as_path())
        )
    );
    println!(
        "   Mode:    {}",
        if config.sync.enabled { "sync" } else { "copy" }
    );
    println!(
        "   Slices:  {}  Workers: {}  Bulk: {}MB",
        config.scroll.slices, config.bulk.workers, config.bulk.bulk_size_mb
    );

    Ok(())
}

fn generate_config(output: &Path) -> anyhow::Result<()> {
    std::fs::write(output, CONFIG_TEMPLATE)?;
    println!("✅ Generated configuration: {:?}", output);
    println!("   Edit the file and run: esferry run --config {:?}", output);

    Ok(())
}

const CONFIG_TEMPLATE: &str = r#"# esferry configuration
source:
  url: http://localhost:9200
  index: my_index            # name, comma separated list or pattern (default _all)
  # username: elastic
  # password: changeme
  # proxy: http://127.0.0.1:8080
  # sort_field: _id          # sync only

target:
  url: http://localhost:9201
  index: my_index_copy       # omit to keep each document's source index
  # username: elastic
  # password: changeme

# input_file:
#   path: ./dump.json
#   format: dump             # dump or json_line
# output_file:
#   path: ./dump.json
#   truncate: false

scroll:
  page_size: 10000
  scroll_time: 1m
  slices: 1
  # query: "status:active"
  # stamp: "modifiedDate:>=1727712000000"
  # fields: [title, price]

bulk:
  workers: 1
  bulk_size_mb: 5
  queue_capacity: 1000000
  idle_timeout_secs: 5
  task_timeout_secs: 300     # 0 = workers never give up waiting
  sleep_after_bulk_secs: 0

transform:
  regenerate_id: false
  repeat_times: 1
  # type_override: _doc
  # rename_fields:
  #   - from: name
  #     to: title
  # skip_fields: [internal]

index_setup:
  copy_settings: false
  copy_mappings: false
  recreate: false
  copy_all_indexes: false
  refresh: false
  # shards: 3

sync:
  enabled: false
  enable_delete: false

wait_for_green: false
"#;
