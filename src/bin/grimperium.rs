use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use grimperium::batch::{
    BatchValidator, NotFoundList, OnDuplicate, OnNotFound, OnUnresolved, PolicyDecisions,
    ValidationOutcome, load_identifier_list,
};
use grimperium::config::{ConfigLoader, ResolvedConfig};
use grimperium::convert::OpenBabelConverter;
use grimperium::datastore::Datastore;
use grimperium::error::GrimError;
use grimperium::exec::{ProcessRunner, SystemRunner};
use grimperium::output::{BatchResult, ConsoleProgress, InfoResult, JsonOutput, OutputMode};
use grimperium::pipeline::{BatchSummary, Pipeline, ProgressSink, RunReport, SetupReport};
use grimperium::prompt::{terminal_available, validation_decisions};
use grimperium::pubchem::PubchemHttpClient;
use grimperium::report::{FullReport, full_report};
use grimperium::retry::RetryPolicy;

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[derive(Parser)]
#[command(name = "grimperium")]
#[command(about = "PM7 heat-of-formation pipeline: PubChem, Open Babel, CREST and MOPAC")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, short, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the full pipeline for one molecule")]
    Run(RunArgs),
    #[command(about = "Validate and run a list of molecules, one per line")]
    Batch(BatchArgs),
    #[command(about = "Show configuration and external tool status")]
    Info,
    #[command(about = "Compare PM7 results with the CBS reference store")]
    Report(ReportArgs),
}

#[derive(Args)]
struct RunArgs {
    identifier: String,

    #[arg(long)]
    overwrite: bool,

    #[arg(long, help = "Extra attempts for a failed run")]
    retries: Option<u32>,
}

#[derive(Args)]
struct BatchArgs {
    #[arg(help = "List file; bare names are also looked up in general_settings.lists_directory")]
    list: PathBuf,

    #[arg(long, value_enum, default_value_t = OnDuplicate::Skip)]
    on_duplicate: OnDuplicate,

    #[arg(long, value_enum, default_value_t = OnUnresolved::Drop)]
    on_unresolved: OnUnresolved,

    #[arg(long, value_enum, default_value_t = OnNotFound::Record)]
    on_not_found: OnNotFound,

    #[arg(long, help = "Keep identifiers already on the not-found list")]
    retry_not_found: bool,

    #[arg(long)]
    dry_run: bool,

    #[arg(long, help = "Extra attempts for each failed molecule")]
    retries: Option<u32>,
}

#[derive(Args)]
struct ReportArgs {
    #[arg(long)]
    detailed: bool,

    #[arg(long, value_name = "N")]
    missing: Option<usize>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(grim) = report.downcast_ref::<GrimError>() {
            return ExitCode::from(map_exit_code(grim));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &GrimError) -> u8 {
    match error {
        GrimError::ConfigRead(_)
        | GrimError::CompoundNotFound(_)
        | GrimError::ListRead(_) => 2,
        GrimError::ExecutableNotFound(_)
        | GrimError::PubchemHttp(_)
        | GrimError::PubchemStatus { .. } => 3,
        GrimError::StageFailure { .. } | GrimError::BatchFailed { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    let default_level = if cli.verbose || config.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    match cli.command {
        Commands::Run(args) => run_single(args, &config, output_mode),
        Commands::Batch(args) => run_batch(args, &config, output_mode),
        Commands::Info => run_info(&config, output_mode),
        Commands::Report(args) => run_report(args, &config, output_mode),
    }
}

fn build_pipeline(
    config: &ResolvedConfig,
) -> miette::Result<Pipeline<PubchemHttpClient, OpenBabelConverter>> {
    let runner: Arc<dyn ProcessRunner> = Arc::new(SystemRunner);
    let registry = PubchemHttpClient::new()?;
    let converter = OpenBabelConverter::new(
        Arc::clone(&runner),
        config.executables.obabel.clone(),
        config.timeouts.conversion,
    );
    Ok(Pipeline::new(config, registry, converter, runner))
}

fn retry_policy(config: &ResolvedConfig, retries: Option<u32>) -> RetryPolicy {
    match retries {
        Some(extra) => RetryPolicy::new(
            extra.saturating_add(1),
            config.retry.delay,
            config.retry.backoff,
        ),
        None => config.retry,
    }
}

fn require_tools(setup: &SetupReport) -> Result<(), GrimError> {
    let missing = setup
        .missing()
        .iter()
        .map(|tool| tool.executable.clone())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(GrimError::ExecutableNotFound(missing.join(", ")));
    }
    if !setup.repository_ready {
        return Err(GrimError::Filesystem(format!(
            "repository {} is not writable",
            setup.repository.display()
        )));
    }
    Ok(())
}

fn sink_for(output_mode: OutputMode) -> Box<dyn ProgressSink> {
    match output_mode {
        OutputMode::Json => Box::new(JsonOutput),
        OutputMode::Text => Box::new(ConsoleProgress),
    }
}

fn run_single(
    args: RunArgs,
    config: &ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let identifier = args.identifier.trim();
    if identifier.is_empty() {
        return Err(GrimError::InvalidIdentifier(args.identifier.clone()).into());
    }

    let pipeline = build_pipeline(config)?;
    require_tools(&pipeline.check_setup())?;

    let policy = retry_policy(config, args.retries);
    let sink = sink_for(output_mode);
    let report = pipeline.run_with_retry(identifier, args.overwrite, &policy, sink.as_ref());

    match output_mode {
        OutputMode::Json => JsonOutput::print_run(&report).into_diagnostic()?,
        OutputMode::Text => print_run_summary(&report),
    }
    report.into_result()?;
    Ok(())
}

fn run_batch(
    args: BatchArgs,
    config: &ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let list = config.resolve_list_path(&args.list);
    let identifiers = load_identifier_list(&list)?;
    if identifiers.is_empty() {
        warn!(path = %list.display(), "identifier list is empty");
    }

    let pipeline = build_pipeline(config)?;
    if !args.dry_run {
        require_tools(&pipeline.check_setup())?;
    }

    let not_found = NotFoundList::new(config.not_found_list_path().as_std_path());
    let validator = BatchValidator::new(
        &pipeline,
        pipeline.registry(),
        pipeline.datastore(),
        &not_found,
    )
    .retry_not_found(args.retry_not_found);

    let policy = PolicyDecisions {
        on_duplicate: args.on_duplicate,
        on_unresolved: args.on_unresolved,
        on_not_found: args.on_not_found,
    };
    let interactive = matches!(output_mode, OutputMode::Text) && terminal_available();
    let mut decisions = validation_decisions(policy, interactive);
    let validation = validator.validate(&identifiers, decisions.as_mut())?;

    let summary = match &validation {
        ValidationOutcome::Ready(report) if !args.dry_run => {
            let policy = retry_policy(config, args.retries);
            let sink = sink_for(output_mode);
            Some(pipeline.run_batch(&report.items, &policy, sink.as_ref()))
        }
        _ => None,
    };

    let result = BatchResult {
        validation,
        summary,
    };
    match output_mode {
        OutputMode::Json => JsonOutput::print_batch(&result).into_diagnostic()?,
        OutputMode::Text => print_batch_summary(&result),
    }

    if let ValidationOutcome::Aborted { stage } = &result.validation {
        return Err(GrimError::ValidationAborted(stage.to_string()).into());
    }
    if let Some(summary) = &result.summary {
        if !summary.all_succeeded() {
            return Err(GrimError::BatchFailed {
                failed: summary.failed,
                total: summary.total,
            }
            .into());
        }
    }
    Ok(())
}

fn run_info(config: &ResolvedConfig, output_mode: OutputMode) -> miette::Result<()> {
    let pipeline = build_pipeline(config)?;
    let setup = pipeline.check_setup();
    let schema = pipeline.datastore().check_schema();
    let result = InfoResult::new(config, setup, schema);
    match output_mode {
        OutputMode::Json => JsonOutput::print_info(&result).into_diagnostic()?,
        OutputMode::Text => print_info(&result),
    }
    Ok(())
}

fn run_report(
    args: ReportArgs,
    config: &ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let cbs = Datastore::new(config.cbs_db_path.as_std_path());
    let pm7 = Datastore::new(config.pm7_db_path.as_std_path());
    let report = full_report(&cbs, &pm7, args.detailed, args.missing);
    match output_mode {
        OutputMode::Json => JsonOutput::print_report(&report).into_diagnostic()?,
        OutputMode::Text => print_report(&report),
    }
    Ok(())
}

fn print_run_summary(report: &RunReport) {
    match &report.failure {
        None => {
            println!(
                "{GREEN}✅ {} completed in {:.1}s{RESET}",
                report.identifier, report.elapsed
            );
            if let Some(smiles) = &report.smiles {
                println!("   SMILES: {smiles}");
            }
            if let Some(energy) = report.pm7_energy {
                println!("   PM7 heat of formation: {energy} kcal/mol");
            }
        }
        Some(failure) => {
            println!(
                "{RED}❌ {} failed at {}: {}{RESET}",
                report.identifier, failure.stage, failure.reason
            );
        }
    }
    println!("   work directory: {}", report.work.workdir.display());
}

fn print_batch_summary(result: &BatchResult) {
    match &result.validation {
        ValidationOutcome::Aborted { stage } => {
            println!("{YELLOW}⚠️ batch cancelled during {stage}{RESET}");
        }
        ValidationOutcome::Ready(report) => {
            println!("{CYAN}📋 validation{RESET}");
            println!("   to run: {}", report.items.len());
            for item in &report.items {
                let mode = if item.overwrite { " (overwrite)" } else { "" };
                println!("   • {}{mode}", item.identifier);
            }
            if !report.pruned.is_empty() {
                println!("   on not-found list: {}", report.pruned.len());
            }
            if !report.unresolved.is_empty() {
                println!("{YELLOW}   without SMILES: {}{RESET}", report.unresolved.len());
            }
            if !report.skipped.is_empty() {
                println!("   skipped duplicates: {}", report.skipped.len());
            }
            if !report.not_found.is_empty() {
                println!("{YELLOW}   not in PubChem: {}{RESET}", report.not_found.len());
            }
        }
    }
    if let Some(summary) = &result.summary {
        print_totals(summary);
    }
}

fn print_totals(summary: &BatchSummary) {
    println!("{CYAN}📦 batch summary{RESET}");
    println!("{GREEN}✅ succeeded: {}{RESET}", summary.succeeded);
    if summary.failed > 0 {
        println!("{RED}❌ failed: {}{RESET}", summary.failed);
        for report in summary.results.iter().filter(|report| !report.success()) {
            println!("{RED}   • {report}{RESET}");
        }
    }
    println!(
        "   total: {} ({:.1}% success)",
        summary.total, summary.success_percentage
    );
}

fn print_info(result: &InfoResult) {
    println!("{CYAN}⚗️ grimperium {}{RESET}", env!("CARGO_PKG_VERSION"));
    match &result.config_source {
        Some(path) => println!("   config: {path}"),
        None => println!("   config: built-in defaults"),
    }
    println!("   repository: {}", result.repository_base_path);
    println!("   PM7 store: {} ({:?})", result.pm7_db_path, result.pm7_schema);
    println!("   CBS store: {}", result.cbs_db_path);
    println!("   CREST keywords: {}", result.crest_keywords);
    println!("   MOPAC keywords: {}", result.mopac_keywords);
    for tool in &result.setup.tools {
        match &tool.status {
            grimperium::exec::ToolStatus::Available { path, version } => println!(
                "{GREEN}✅ {}: {} {}{RESET}",
                tool.name,
                path.display(),
                version.as_deref().unwrap_or("")
            ),
            grimperium::exec::ToolStatus::Missing => {
                println!("{RED}❌ {}: '{}' not found{RESET}", tool.name, tool.executable)
            }
        }
    }
    let formats = result
        .formats
        .iter()
        .map(|format| format.extension)
        .collect::<Vec<_>>();
    println!("   formats: {}", formats.join(", "));
}

fn print_report(report: &FullReport) {
    let progress = &report.progress;
    println!("{CYAN}📊 progress report{RESET}");
    if !progress.cbs_exists {
        println!("{YELLOW}⚠️ CBS store not found: {}{RESET}", progress.cbs_db_path);
    }
    if !progress.pm7_exists {
        println!("{YELLOW}⚠️ PM7 store not found: {}{RESET}", progress.pm7_db_path);
    }
    println!("   CBS molecules: {}", progress.total_cbs);
    println!("   PM7 molecules: {}", progress.total_pm7);
    println!("   in both: {}", progress.common_count);
    println!("   remaining: {}", progress.missing_count);
    println!("   extra: {}", progress.extra_count);
    println!(
        "{GREEN}   progress: {:.2}%{RESET}",
        progress.progress_percentage
    );
    println!("   ETA: {}", report.eta.eta_human);

    for analysis in [&report.cbs_analysis, &report.pm7_analysis].into_iter().flatten() {
        println!("{CYAN}🗃️  {}{RESET}", analysis.path);
        println!(
            "   entries: {} (unique {}), {:.2} MB, quality {:?}",
            analysis.total_entries,
            analysis.unique_keys,
            analysis.file_size_mb,
            analysis.data_quality
        );
    }

    if !report.missing.is_empty() {
        println!("{CYAN}🔎 next to calculate{RESET}");
        for smiles in &report.missing {
            println!("   • {smiles}");
        }
    }
}
