// logsieve - main.rs
//
// Command-line entry point. Handles:
// 1. CLI argument parsing
// 2. Config loading and logging initialisation (debug mode support)
// 3. Pipeline construction: session, source, filters, combiner
// 4. Ingesting newline-delimited JSON records and printing the filtered view

use clap::Parser;
use logsieve::app::combiner::Combiner;
use logsieve::app::log_filter::{LogFilter, LogFilterOptions};
use logsieve::app::session::Session;
use logsieve::core::filter::FilterCriteria;
use logsieve::core::model::{CombinationMode, Level, Record};
use logsieve::core::policy::MemoryUsagePolicy;
use logsieve::core::processor::{ProcessingPriority, Processor};
use logsieve::core::source::SourceSequence;
use logsieve::platform::config::{self, AppConfig, PlatformPaths};
use logsieve::util::constants;
use logsieve::util::error::{LogSieveError, Result};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::time::Duration;

/// logsieve - concurrent, incremental log filtering.
///
/// Reads newline-delimited JSON records, runs one background filter per
/// criterion, merges their results and prints the filtered records in
/// source order.
#[derive(Parser, Debug)]
#[command(name = "logsieve", version, about)]
struct Cli {
    /// JSONL input file (reads stdin if omitted).
    input: Option<PathBuf>,

    /// Keep records at this level (repeatable; forms one filter).
    #[arg(short = 'l', long = "level")]
    levels: Vec<Level>,

    /// Keep records whose message matches this regex (repeatable; one filter each).
    #[arg(short = 'p', long = "pattern")]
    patterns: Vec<String>,

    /// Drop records whose message matches this regex (repeatable; forms one filter).
    #[arg(short = 'x', long = "exclude")]
    excludes: Vec<String>,

    /// Case-insensitive substring search (forms one filter).
    #[arg(short = 's', long = "search")]
    search: Option<String>,

    /// How filter results are merged: intersection or union.
    #[arg(short = 'm', long = "mode", default_value = "intersection")]
    mode: CombinationMode,

    /// Scheduling priority of the filters.
    #[arg(long = "priority", value_enum, default_value = "default")]
    priority: PriorityArg,

    /// Memory usage policy (overrides config).
    #[arg(long = "policy", value_enum)]
    policy: Option<PolicyArg>,

    /// Quota for the fixed policy, in MiB.
    #[arg(long = "quota-mb", default_value_t = constants::DEFAULT_QUOTA_MB)]
    quota_mb: u64,

    /// Share of available memory for the adaptive policy, in percent.
    #[arg(long = "adaptive-percent", default_value_t = constants::DEFAULT_ADAPTIVE_PERCENT)]
    adaptive_percent: u8,

    /// Explicit config file (defaults to the platform config directory).
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Enable debug logging (equivalent to RUST_LOG=debug).
    #[arg(short = 'd', long = "debug")]
    debug: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PriorityArg {
    Realtime,
    Default,
    Background,
}

impl From<PriorityArg> for ProcessingPriority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Realtime => ProcessingPriority::Realtime,
            PriorityArg::Default => ProcessingPriority::Default,
            PriorityArg::Background => ProcessingPriority::Background,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    Unlimited,
    Fixed,
    Adaptive,
}

impl Cli {
    fn memory_policy(&self) -> Option<MemoryUsagePolicy> {
        self.policy.map(|policy| match policy {
            PolicyArg::Unlimited => MemoryUsagePolicy::Unlimited,
            PolicyArg::Fixed => MemoryUsagePolicy::Fixed {
                quota_bytes: self.quota_mb.saturating_mul(1_024 * 1_024),
            },
            PolicyArg::Adaptive => MemoryUsagePolicy::Adaptive {
                percent: self.adaptive_percent.clamp(
                    constants::MIN_ADAPTIVE_PERCENT,
                    constants::MAX_ADAPTIVE_PERCENT,
                ),
            },
        })
    }

    /// One criteria value per filter the CLI asks for.
    fn criteria(&self) -> Result<Vec<FilterCriteria>> {
        let mut all = Vec::new();
        if !self.levels.is_empty() {
            all.push(FilterCriteria::levels(self.levels.iter().copied()));
        }
        for pattern in &self.patterns {
            let mut criteria = FilterCriteria::new();
            criteria.add_inclusive_pattern(pattern)?;
            all.push(criteria);
        }
        if !self.excludes.is_empty() {
            let mut criteria = FilterCriteria::new();
            criteria.set_exclusive_patterns(self.excludes.as_slice())?;
            all.push(criteria);
        }
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            all.push(FilterCriteria::new().with_text_search(search));
        }
        Ok(all)
    }
}

fn load_settings(cli: &Cli) -> Result<(AppConfig, Vec<String>)> {
    match &cli.config {
        Some(path) => Ok(config::load_config_file(path)?),
        None => Ok(config::load_config(&PlatformPaths::resolve().config_dir)),
    }
}

fn preview(line: &str) -> &str {
    match line.char_indices().nth(constants::DEBUG_MAX_LINE_PREVIEW) {
        Some((end, _)) => &line[..end],
        None => line,
    }
}

/// Parse JSONL from `reader`, appending to `source` in batches. Returns
/// (records ingested, lines skipped).
fn ingest(
    reader: impl BufRead,
    session: &Session,
    source: &SourceSequence,
    origin: &str,
) -> Result<(usize, usize)> {
    let mut batch: Vec<Record> = Vec::with_capacity(constants::INGEST_BATCH_SIZE);
    let mut ingested = 0usize;
    let mut skipped = 0usize;

    let flush = |batch: &mut Vec<Record>| -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let entities = session.wrap_all(batch.drain(..))?;
        let count = entities.len();
        source.append(entities);
        Ok(count)
    };

    for (number, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| LogSieveError::Io {
            path: PathBuf::from(origin),
            operation: "read input",
            source: e,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(&line) {
            Ok(record) => batch.push(record),
            Err(e) => {
                skipped += 1;
                tracing::warn!(
                    line = number + 1,
                    error = %e,
                    preview = preview(&line),
                    "Skipping malformed record"
                );
            }
        }
        if batch.len() >= constants::INGEST_BATCH_SIZE {
            ingested += flush(&mut batch)?;
        }
    }
    ingested += flush(&mut batch)?;
    Ok((ingested, skipped))
}

fn format_record(record: &Record) -> String {
    let timestamp = record
        .timestamp
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{timestamp} {:<4} {}",
        record.level.short_label(),
        record.message
    )
}

fn run(cli: Cli) -> Result<()> {
    let (mut settings, warnings) = load_settings(&cli)?;
    logsieve::util::logging::init(
        cli.debug,
        settings.log_level.as_deref(),
        settings.log_file.as_deref(),
    );
    tracing::info!(
        version = constants::APP_VERSION,
        debug = cli.debug,
        "logsieve starting"
    );
    for warning in &warnings {
        tracing::warn!(warning = %warning, "Config warning");
    }
    if let Some(policy) = cli.memory_policy() {
        settings.memory_policy = policy;
    }

    let criteria = cli.criteria()?;
    let session = Session::from_config(&settings);
    let source = SourceSequence::new();
    let combiner = Combiner::new(&source, cli.mode, settings.queue_capacity);
    let options = LogFilterOptions::from_config(&settings, cli.priority.into());

    // Register every filter before any of them produces output.
    let mut filters = Vec::with_capacity(criteria.len());
    for criteria in criteria {
        let mut filter = LogFilter::new(session.accessor(), combiner.sink(), criteria, options);
        filter.attach(&source)?;
        filters.push(filter);
    }
    for filter in &mut filters {
        filter.process()?;
    }
    tracing::info!(
        filters = filters.len(),
        mode = %cli.mode,
        policy = %settings.memory_policy,
        "Pipeline ready"
    );

    let (ingested, skipped) = match &cli.input {
        Some(path) => {
            let file = std::fs::File::open(path).map_err(|e| LogSieveError::Io {
                path: path.clone(),
                operation: "open input",
                source: e,
            })?;
            ingest(
                BufReader::new(file),
                &session,
                &source,
                &path.display().to_string(),
            )?
        }
        None => ingest(std::io::stdin().lock(), &session, &source, "<stdin>")?,
    };
    tracing::info!(ingested, skipped, "Input read");

    if !combiner.wait_until_settled(Duration::from_secs(constants::SETTLE_TIMEOUT_SECS)) {
        tracing::warn!("Filters did not settle in time; printing the partial view");
    }
    for filter in &filters {
        if filter.skipped() > 0 {
            tracing::warn!(processor = %filter.id(), skipped = filter.skipped(), "Filter skipped entities");
        }
    }

    let view = combiner.view();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for entity in view.snapshot() {
        let record = entity.record()?;
        if let Err(e) = writeln!(out, "{}", format_record(record)) {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                break;
            }
            return Err(LogSieveError::Io {
                path: PathBuf::from("<stdout>"),
                operation: "write output",
                source: e,
            });
        }
    }
    tracing::info!(
        matched = view.len(),
        total = source.len(),
        memory_bytes = session.memory_usage(),
        "Done"
    );
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "logsieve failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
