use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::ASCII_FULL, Table};
use pagewatch_core::{
    builtin_rule_catalog, sha256_hex, validate_config, AlertRouter, AlertSink, Diagnostic,
    DiagnosticLevel, DispatchedAlert, EventResult, JsonLinesSink, MemorySink, Pipeline,
    PipelineConfig, RawScanEvent, RuleDescriptor, ScanId, ScanQueueJob, ScanSummary,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Replay and inspect web-page scan event streams")]
struct PagewatchCli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay newline-delimited raw scan events through a fresh pipeline
    Replay {
        /// File with one raw event JSON object per line
        input: PathBuf,
        /// Pipeline configuration (YAML or JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Job name recorded for every replayed scan
        #[arg(long, default_value = "replay")]
        job_name: String,
        /// Treat every replayed scan as a test scan
        #[arg(long)]
        test: bool,
        /// Append production alerts to this file as JSON lines
        #[arg(long)]
        prod_out: Option<PathBuf>,
        /// Append test alerts to this file as JSON lines
        #[arg(long)]
        test_out: Option<PathBuf>,
        /// Output JSON instead of a human-readable report
        #[arg(long)]
        json: bool,
    },
    /// Export the builtin rule catalog
    Rules {
        /// Filter by rule name
        #[arg(long)]
        rule: Option<String>,
        /// Output format
        #[arg(long, default_value_t = CatalogFormat::Json)]
        format: CatalogFormat,
        /// Pipeline configuration used for levels and enablement
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate a pipeline configuration file
    Check {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print the content digest the store would key a file on
    Hash { input: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = PagewatchCli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Replay {
            input,
            config,
            job_name,
            test,
            prod_out,
            test_out,
            json,
        } => {
            let config = load_config(config.as_deref())?;
            let prod_sink = open_sink("production", prod_out.as_deref())?;
            let test_sink = open_sink("test", test_out.as_deref())?;
            let pipeline = Pipeline::new(config, AlertRouter::new(prod_sink, test_sink))?;
            let reader = BufReader::new(
                File::open(&input).with_context(|| format!("failed to open {}", input.display()))?,
            );
            let options = ReplayOptions {
                job_name,
                source_id: input.display().to_string(),
                test,
            };
            let report = replay(&pipeline, reader, &options)?;
            output_replay(&report, json)?;
        }
        Command::Rules {
            rule,
            format,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            output_catalog(&config, rule, format)?;
        }
        Command::Check { config, json } => {
            let parsed = load_config(Some(&config))?;
            let diagnostics = validate_config(&parsed);
            if json {
                println!("{}", serde_json::to_string_pretty(&diagnostics)?);
            } else if diagnostics.is_empty() {
                println!("{}: ok", config.display());
            } else {
                print_diagnostics(&diagnostics);
            }
            if diagnostics.iter().any(Diagnostic::is_error) {
                anyhow::bail!("validation failed");
            }
        }
        Command::Hash { input } => {
            let bytes =
                fs::read(&input).with_context(|| format!("failed to read {}", input.display()))?;
            println!("{}  {}", sha256_hex(&bytes), input.display());
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Reads YAML or JSON by extension; no path means defaults.
fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    let Some(path) = path else {
        return Ok(PipelineConfig::default());
    };
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let config = if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("invalid JSON config {}", path.display()))?
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("invalid YAML config {}", path.display()))?
    };
    Ok(config)
}

fn open_sink(name: &str, path: Option<&Path>) -> anyhow::Result<Arc<dyn AlertSink>> {
    let sink: Arc<dyn AlertSink> = match path {
        Some(path) => {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open alert output {}", path.display()))?;
            Arc::new(JsonLinesSink::new(name, file))
        }
        None => Arc::new(MemorySink::new(name)),
    };
    Ok(sink)
}

struct ReplayOptions {
    job_name: String,
    source_id: String,
    test: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ReplayReport {
    results: Vec<EventResult>,
    alerts: Vec<DispatchedAlert>,
    summaries: Vec<ScanSummary>,
    skipped_lines: usize,
    rejected_events: usize,
}

fn replay(
    pipeline: &Pipeline,
    reader: impl BufRead,
    options: &ReplayOptions,
) -> anyhow::Result<ReplayReport> {
    let mut report = ReplayReport::default();
    let mut opened: HashSet<ScanId> = HashSet::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.context("failed to read event stream")?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let raw: RawScanEvent = match serde_json::from_str(trimmed) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(line = index + 1, error = %err, "skipping unparseable event line");
                report.skipped_lines += 1;
                continue;
            }
        };

        if !raw.scan_id.is_blank() && opened.insert(raw.scan_id.clone()) {
            let job = ScanQueueJob {
                name: options.job_name.clone(),
                scan_id: raw.scan_id.clone(),
                source_id: options.source_id.clone(),
                test: options.test,
            };
            if let Err(err) = pipeline.open_scan(&job) {
                warn!(scan_id = %job.scan_id, error = %err, "could not open scan");
            }
        }

        match pipeline.ingest(raw) {
            Ok(outcome) => {
                if outcome.state.is_terminal() {
                    report.summaries.extend(pipeline.summary(&outcome.scan_id));
                }
                report.results.extend(outcome.results);
                report.alerts.extend(outcome.alerts);
            }
            Err(err) => {
                warn!(line = index + 1, error = %err, "event rejected");
                report.rejected_events += 1;
            }
        }
    }

    for scan_id in pipeline.active_scans() {
        match pipeline.cancel(&scan_id, "replay input ended") {
            Ok(outcome) => {
                report.summaries.extend(pipeline.summary(&scan_id));
                report.results.extend(outcome.results);
                report.alerts.extend(outcome.alerts);
            }
            Err(err) => warn!(scan_id = %scan_id, error = %err, "could not close scan"),
        }
    }

    report.summaries.sort_by(|a, b| a.scan_id.cmp(&b.scan_id));
    info!(
        events = report.results.len(),
        alerts = report.alerts.len(),
        scans = report.summaries.len(),
        "replay finished"
    );
    Ok(report)
}

fn output_replay(report: &ReplayReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "Replayed {} events ({} lines skipped, {} events rejected)\n",
        report.results.len(),
        report.skipped_lines,
        report.rejected_events
    );
    if report.alerts.is_empty() {
        println!("No alerts.\n");
    } else {
        println!("{}\n", alert_table(&report.alerts));
    }
    for summary in &report.summaries {
        println!("{summary}");
    }
    Ok(())
}

fn alert_table(alerts: &[DispatchedAlert]) -> Table {
    let mut display = Table::new();
    display.load_preset(ASCII_FULL);
    display.set_header(vec!["scan", "rule", "level", "destination", "message"]);
    for DispatchedAlert { alert, dispatch } in alerts {
        let destination = match (&dispatch.destination, &dispatch.error) {
            (Some(destination), None) => destination.to_string(),
            (Some(destination), Some(error)) => format!("{destination} (failed: {error})"),
            (None, _) => "not sent".to_string(),
        };
        display.add_row(vec![
            alert.scan_id.to_string(),
            alert.rule.clone(),
            alert.event.level.to_string(),
            destination,
            alert.event.message.clone().unwrap_or_default(),
        ]);
    }
    display
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CatalogFormat {
    Json,
    Yaml,
}

impl std::fmt::Display for CatalogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            CatalogFormat::Json => "json",
            CatalogFormat::Yaml => "yaml",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogResponse {
    version: String,
    generated_at: String,
    rules: Vec<RuleDescriptor>,
}

fn output_catalog(
    config: &PipelineConfig,
    rule: Option<String>,
    format: CatalogFormat,
) -> anyhow::Result<()> {
    let catalog = builtin_rule_catalog(&config.rules);
    let mut rules = catalog.rules;

    if let Some(filter) = rule {
        rules.retain(|descriptor| descriptor.name == filter);
        if rules.is_empty() {
            anyhow::bail!("unknown rule '{filter}'");
        }
    }

    let response = CatalogResponse {
        version: catalog.version,
        generated_at: catalog.generated_at,
        rules,
    };

    match format {
        CatalogFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        CatalogFormat::Yaml => {
            let yaml = serde_yaml::to_string(&response)?;
            print!("{yaml}");
        }
    }

    Ok(())
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    println!("Diagnostics:");
    for diagnostic in diagnostics {
        let level = match diagnostic.level {
            DiagnosticLevel::Error => "error",
            DiagnosticLevel::Warning => "warn",
        };
        println!("  - [{level}] {diagnostic}");
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagewatch_core::{AlertLevel, Destination, ScanState};
    use std::io::{Cursor, Write};

    const SCAN_LINES: &str = r#"
# request then a blocklisted script
{"scanID": "S1", "type": "request", "payload": {"url": "https://a.test/x.js"}}
{"scanID": "S1", "type": "script-response", "payload": {"url": "https://a.test/x.js", "sha256": "abc123"}}
not json at all
{"scanID": "S1", "type": "complete", "payload": {}}
{"scanID": "S1", "type": "log-message", "payload": "too late"}
"#;

    fn options(test: bool) -> ReplayOptions {
        ReplayOptions {
            job_name: "unit".to_string(),
            source_id: "inline".to_string(),
            test,
        }
    }

    fn blocklist_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.rules.blocked_script_digests.insert("abc123".to_string());
        config
    }

    fn pipeline(config: PipelineConfig) -> (Pipeline, Arc<MemorySink>, Arc<MemorySink>) {
        let prod = Arc::new(MemorySink::new("prod"));
        let test = Arc::new(MemorySink::new("test"));
        let pipeline =
            Pipeline::new(config, AlertRouter::new(prod.clone(), test.clone())).expect("pipeline");
        (pipeline, prod, test)
    }

    #[test]
    fn replay_routes_blocklist_alert_to_production() {
        let (pipeline, prod, test) = pipeline(blocklist_config());
        let report =
            replay(&pipeline, Cursor::new(SCAN_LINES), &options(false)).expect("replay");

        assert_eq!(report.skipped_lines, 1);
        assert_eq!(report.rejected_events, 1);
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(
            report.alerts[0].dispatch.destination,
            Some(Destination::Production)
        );
        assert_eq!(prod.len(), 1);
        assert!(test.is_empty());
        assert_eq!(report.summaries.len(), 1);
        assert_eq!(report.summaries[0].state, ScanState::Complete);

        let table = alert_table(&report.alerts).to_string();
        assert!(table.contains("third-party-script-from-blocklist"));
    }

    #[test]
    fn replay_with_test_flag_never_touches_production() {
        let (pipeline, prod, test) = pipeline(blocklist_config());
        let report = replay(&pipeline, Cursor::new(SCAN_LINES), &options(true)).expect("replay");
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].alert.event.level, AlertLevel::Prod);
        assert!(prod.is_empty());
        assert_eq!(test.len(), 1);
    }

    #[test]
    fn unfinished_scans_are_cancelled_at_end_of_input() {
        let (pipeline, _, _) = pipeline(PipelineConfig::default());
        let lines = r#"{"scanID": "S2", "type": "log-message", "payload": "hello"}"#;
        let report = replay(&pipeline, Cursor::new(lines), &options(false)).expect("replay");
        assert_eq!(report.summaries.len(), 1);
        assert_eq!(report.summaries[0].state, ScanState::Failed);
        assert!(pipeline.active_scans().is_empty());
    }

    #[test]
    fn load_config_reads_yaml_and_json() {
        let mut yaml = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("yaml tempfile");
        writeln!(yaml, "recent_event_capacity: 16\nrules:\n  max_third_party_origins: 2")
            .expect("write yaml");
        let parsed = load_config(Some(yaml.path())).expect("yaml config");
        assert_eq!(parsed.recent_event_capacity, 16);
        assert_eq!(parsed.rules.max_third_party_origins, 2);

        let mut json = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .expect("json tempfile");
        write!(json, r#"{{"retain_content": true}}"#).expect("write json");
        let parsed = load_config(Some(json.path())).expect("json config");
        assert!(parsed.retain_content);

        assert_eq!(load_config(None).expect("defaults"), PipelineConfig::default());
    }

    #[test]
    fn json_lines_sink_file_receives_alerts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("prod.jsonl");
        let prod = open_sink("production", Some(&path)).expect("prod sink");
        let test = open_sink("test", None).expect("test sink");
        let pipeline =
            Pipeline::new(blocklist_config(), AlertRouter::new(prod, test)).expect("pipeline");
        replay(&pipeline, Cursor::new(SCAN_LINES), &options(false)).expect("replay");

        let written = fs::read_to_string(&path).expect("read alerts");
        assert_eq!(written.lines().count(), 1);
        assert!(written.contains("\"entry\":\"rule-alert\""));
    }
}
