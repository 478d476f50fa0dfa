//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use knowcrawl_clients::{ChatClient, WebRetriever};
use knowcrawl_core::{
    EntityOutcome, JsonDirSink, Outcome, Pipeline, PipelineOptions, PromptSet, RUN_REPORT_FILE,
    RunProgress, RunReport, Selection, Stage, load_entities, select_entities, template_slots,
};
use knowcrawl_schema::{Schema, Validator};
use knowcrawl_shared::{
    AppConfig, Assignment, Entity, ResponseFormat, init_config, load_config, load_config_from,
    resolve_api_key,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// knowcrawl: build knowledge-graph records with an LLM.
#[derive(Parser)]
#[command(
    name = "knowcrawl",
    version,
    about = "Extract schema-validated knowledge-graph records for a list of entities.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.knowcrawl/knowcrawl.toml).
    #[arg(long = "config", value_name = "FILE", global = true)]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run extraction over an entity list.
    Run(RunArgs),

    /// Validate record files against the configured schema.
    Validate {
        /// Record JSON files.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print the configured prompt steps in execution order.
    Steps,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
pub(crate) struct RunArgs {
    /// Entity list: one name per line, optional id in a second CSV/TSV column.
    #[arg(short, long)]
    pub entities: PathBuf,

    /// Process at most N entities.
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Only process the named entity (repeatable).
    #[arg(long, value_name = "NAME")]
    pub only: Vec<String>,

    /// Re-process entities that did not persist in an earlier run report.
    #[arg(long, value_name = "REPORT")]
    pub retry_from: Option<PathBuf>,

    /// Output directory (defaults to `defaults.output_dir`).
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "knowcrawl=info",
        1 => "knowcrawl=debug",
        _ => "knowcrawl=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config_path.as_deref();
    match cli.command {
        Command::Run(args) => cmd_run(config_path, args).await,
        Command::Validate { files } => cmd_validate(config_path, &files),
        Command::Steps => cmd_steps(config_path),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn app_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    })
}

fn build_validator(config: &AppConfig) -> Result<Validator> {
    let schema = match &config.validation.schema_path {
        Some(path) => Schema::load(Path::new(path))?,
        None => Schema::master(),
    };
    Ok(Validator::new(schema, config.validation.extra_fields))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, args: RunArgs) -> Result<()> {
    let config = app_config(config_path)?;

    // Fail on configuration problems before touching the network.
    let prompts = PromptSet::new(config.steps.clone())?;
    let validator = build_validator(&config)?;
    let api_key = resolve_api_key(&config.llm)?;

    let entities = load_entities(&args.entities)?;
    let retry_from = args
        .retry_from
        .as_deref()
        .map(RunReport::load)
        .transpose()?;
    let selection = Selection {
        limit: args.limit.or(config.defaults.limit),
        only: args.only,
        retry_from,
    };
    let batch = select_entities(&entities, &selection);
    if batch.is_empty() {
        println!("No entities selected.");
        return Ok(());
    }

    let out_dir = args
        .out
        .unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir));

    let mut options = PipelineOptions::from_config(&config);
    options.all_entities = entities.iter().map(|e| e.name.clone()).collect();
    if options.assemble.source_file.is_none() {
        options.assemble.source_file = args
            .entities
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
    }

    let pipeline = Pipeline::new(
        prompts,
        validator,
        options,
        ChatClient::new(&config.llm, api_key)?,
        WebRetriever::new(&config.retrieval)?,
        JsonDirSink::new(&out_dir),
    )?;

    info!(
        entities = batch.len(),
        model = %config.llm.model,
        out = %out_dir.display(),
        "starting extraction"
    );

    let cancel = Arc::new(AtomicBool::new(false));
    spawn_interrupt_handler(Arc::clone(&cancel));

    let reporter = CliProgress::new();
    let report = pipeline.run(&batch, &reporter, &cancel).await;

    let report_path = pipeline.sink().dir().join(RUN_REPORT_FILE);
    report.write(&report_path)?;

    print_summary(&report, &report_path);

    if report.persisted() < report.outcomes.len() {
        return Err(eyre!(
            "{} of {} entities did not persist; re-run with --retry-from {}",
            report.outcomes.len() - report.persisted(),
            report.outcomes.len(),
            report_path.display()
        ));
    }
    Ok(())
}

/// First Ctrl-C stops after the current entity; a second one exits.
fn spawn_interrupt_handler(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received, finishing the current entity (Ctrl-C again to abort)");
        cancel.store(true, Ordering::SeqCst);

        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

fn print_summary(report: &RunReport, report_path: &Path) {
    println!();
    println!("  Run {}", report.run_id);
    println!("  Persisted: {}", report.persisted());
    println!("  Rejected:  {}", report.rejected());
    println!("  Failed:    {}", report.failed());
    if report.cancelled {
        println!("  Cancelled: {}", report.skipped());
    }
    println!(
        "  Time:      {:.1}s",
        (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0
    );
    println!("  Report:    {}", report_path.display());

    let problems: Vec<&EntityOutcome> = report
        .outcomes
        .iter()
        .filter(|o| matches!(o.outcome, Outcome::Rejected { .. } | Outcome::Failed { .. }))
        .collect();
    if !problems.is_empty() {
        println!();
        for o in problems {
            println!("  ✗ {}: {}", o.entity.name, o.outcome);
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl RunProgress for CliProgress {
    fn entity_started(&self, entity: &Entity, current: usize, total: usize) {
        self.spinner.set_prefix(format!("[{current}/{total}]"));
        self.spinner.set_message(entity.name.clone());
    }

    fn stage(&self, entity: &Entity, stage: Stage, step: Option<&str>) {
        let message = match step {
            Some(step) => format!("{entity}: {stage} ({step})"),
            None => format!("{entity}: {stage}"),
        };
        self.spinner.set_message(message);
    }

    fn entity_finished(&self, outcome: &EntityOutcome) {
        let mark = match outcome.outcome {
            Outcome::Persisted { .. } => "✓",
            Outcome::Cancelled => "-",
            _ => "✗",
        };
        self.spinner.println(format!(
            "  {mark} {} ({}, {:.1}s)",
            outcome.entity.name,
            outcome.outcome.label(),
            outcome.elapsed_ms as f64 / 1000.0
        ));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// validate / steps / config
// ---------------------------------------------------------------------------

fn cmd_validate(config_path: Option<&Path>, files: &[PathBuf]) -> Result<()> {
    let config = app_config(config_path)?;
    let validator = build_validator(&config)?;
    let mut invalid = 0usize;

    for file in files {
        let content = std::fs::read_to_string(file)
            .map_err(|e| eyre!("cannot read {}: {e}", file.display()))?;

        let record: serde_json::Value = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                invalid += 1;
                println!("✗ {}: not JSON ({e})", file.display());
                continue;
            }
        };

        let report = validator.validate(&record);
        if report.valid {
            println!("✓ {}", file.display());
        } else {
            invalid += 1;
            println!("✗ {}", file.display());
            for violation in &report.violations {
                println!("    {violation}");
            }
        }
    }

    if invalid > 0 {
        return Err(eyre!("{invalid} of {} records invalid", files.len()));
    }
    Ok(())
}

fn cmd_steps(config_path: Option<&Path>) -> Result<()> {
    let config = app_config(config_path)?;
    let prompts = PromptSet::new(config.steps.clone())?;

    for (i, step) in prompts.steps_in_order().iter().enumerate() {
        let format = match step.format {
            ResponseFormat::Text => "text",
            ResponseFormat::Json => "json",
        };
        let assignment = match step.assignment()? {
            Assignment::Target { path, append: true } => format!("append → {path}"),
            Assignment::Target { path, append: false } => format!("→ {path}"),
            Assignment::Spread(keys) => format!("spread → {}", keys.join(", ")),
        };
        let slots = template_slots(&step.name, &step.template)?;

        println!("{}. {} [{format}] {assignment}", i + 1, step.name);
        println!("   slots: {}", slots.join(", "));
    }

    if config.retrieval.augment {
        println!("queries: augmented, then {}", config.retrieval.queries.join(" | "));
    } else {
        println!("queries: {}", config.retrieval.queries.join(" | "));
    }
    if config.review.enabled {
        println!("review: enabled");
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = app_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_args_parse() {
        let cli = Cli::try_parse_from([
            "knowcrawl",
            "run",
            "--entities",
            "entities.csv",
            "--only",
            "水资源",
            "--only",
            "防洪",
            "--limit",
            "2",
            "--config",
            "custom.toml",
        ])
        .unwrap();

        assert_eq!(cli.config_path, Some(PathBuf::from("custom.toml")));
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.entities, PathBuf::from("entities.csv"));
                assert_eq!(args.only, ["水资源", "防洪"]);
                assert_eq!(args.limit, Some(2));
                assert!(args.retry_from.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn validate_requires_files() {
        assert!(Cli::try_parse_from(["knowcrawl", "validate"]).is_err());
    }

    #[test]
    fn validate_command_reports_invalid_records() {
        let dir = std::env::temp_dir().join(format!("kc-cli-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("knowcrawl.toml");
        std::fs::write(&config_path, "").unwrap();

        let good = dir.join("good.json");
        std::fs::copy("../../fixtures/json/record.fixture.json", &good).unwrap();
        assert!(cmd_validate(Some(config_path.as_path()), std::slice::from_ref(&good)).is_ok());

        let bad = dir.join("bad.json");
        std::fs::write(&bad, r#"{"label": "水资源"}"#).unwrap();
        assert!(cmd_validate(Some(config_path.as_path()), &[good, bad]).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
