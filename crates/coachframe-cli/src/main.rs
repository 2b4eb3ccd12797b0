use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use coachframe_contracts::layout::ContentLayout;
use coachframe_contracts::summary::{BatchSummary, ExerciseSummary};
use coachframe_engine::{ExerciseOrchestrator, ExerciseReport, PipelineConfig, RunOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EXIT_READY: i32 = 0;
const EXIT_NOT_READY: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "coachframe",
    version,
    about = "Validate, refine and regenerate exercise video shots"
)]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the quality loop over one exercise or all of them.
    Validate(ValidateArgs),
    /// Print persisted summaries without calling any model.
    Status(StatusArgs),
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct Target {
    #[arg(long, value_parser = parse_exercise_name)]
    exercise: Option<String>,
    #[arg(long)]
    all: bool,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[command(flatten)]
    target: Target,
    #[arg(long)]
    root: Option<PathBuf>,
    /// Flag failing shots immediately instead of refining them.
    #[arg(long)]
    skip_regeneration: bool,
    /// Ignore saved prompts, images and approvals.
    #[arg(long)]
    force: bool,
    #[arg(long)]
    max_iterations: Option<u32>,
    #[arg(long)]
    pass_threshold: Option<f64>,
    #[arg(long)]
    require_all_criteria: bool,
    #[arg(long)]
    delay_ms: Option<u64>,
    /// Use offline judge, refiner and editor.
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[command(flatten)]
    target: Target,
    #[arg(long)]
    root: Option<PathBuf>,
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("coachframe error: {err:#}");
            std::process::exit(EXIT_NOT_READY);
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Validate(args) => run_validate(args),
        Command::Status(args) => run_status(args),
    }
}

fn run_validate(args: ValidateArgs) -> Result<i32> {
    let loaded = PipelineConfig::from_env().and_then(|config| apply_overrides(config, &args));
    let config = match loaded {
        Ok(config) => config,
        Err(err) => {
            eprintln!("coachframe config error: {err:#}");
            return Ok(EXIT_USAGE);
        }
    };
    let mut orchestrator = match ExerciseOrchestrator::from_config(&config) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            eprintln!("coachframe config error: {err:#}");
            return Ok(EXIT_USAGE);
        }
    };
    tracing::info!(
        run_id = orchestrator.run_id(),
        root = %config.root.display(),
        dryrun = config.dryrun,
        "starting validation run"
    );

    let options = RunOptions {
        force: args.force,
        skip_regeneration: args.skip_regeneration,
    };
    match args.target.exercise.as_deref() {
        Some(exercise) if !args.target.all => {
            let report = orchestrator.run_exercise(exercise, options)?;
            print!("{}", render_report(&report));
            Ok(exit_code(report.ready_for_assembly()))
        }
        _ => {
            let batch = orchestrator.run_batch(options)?;
            for report in &batch.reports {
                print!("{}", render_report(report));
            }
            print!("{}", render_batch(&batch.summary));
            Ok(exit_code(batch.summary.succeeded()))
        }
    }
}

fn run_status(args: StatusArgs) -> Result<i32> {
    let root = match args.root {
        Some(root) => root,
        None => match PipelineConfig::from_env() {
            Ok(config) => config.root,
            Err(err) => {
                eprintln!("coachframe config error: {err:#}");
                return Ok(EXIT_USAGE);
            }
        },
    };
    let layout = ContentLayout::new(root);
    let exercises = match args.target.exercise {
        Some(exercise) if !args.target.all => vec![exercise],
        _ => layout.exercises()?,
    };

    let mut all_ready = !exercises.is_empty();
    for exercise in &exercises {
        match ExerciseSummary::load(&layout.summary_path(exercise))? {
            Some(summary) => {
                all_ready &= summary.ready_for_assembly;
                print!("{}", render_summary(&summary));
            }
            None => {
                all_ready = false;
                println!("{exercise}: not validated yet");
            }
        }
    }
    Ok(exit_code(all_ready))
}

fn apply_overrides(mut config: PipelineConfig, args: &ValidateArgs) -> Result<PipelineConfig> {
    if let Some(root) = args.root.as_ref() {
        config.root = root.clone();
    }
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }
    if let Some(pass_threshold) = args.pass_threshold {
        config.pass_threshold = pass_threshold;
    }
    if let Some(delay_ms) = args.delay_ms {
        config.request_delay = Duration::from_millis(delay_ms);
    }
    config.require_all_criteria |= args.require_all_criteria;
    config.dryrun |= args.dryrun;
    config.validated()
}

/// Exercise names become a directory under `exercises/`, so they may not
/// contain separators or be `.`/`..`.
fn parse_exercise_name(raw: &str) -> Result<String, String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err("exercise name is empty".to_string());
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(format!("'{name}' is not a valid exercise directory name"));
    }
    Ok(name.to_string())
}

fn exit_code(ready: bool) -> i32 {
    if ready {
        EXIT_READY
    } else {
        EXIT_NOT_READY
    }
}

fn render_report(report: &ExerciseReport) -> String {
    render_summary(&report.summary)
}

fn render_summary(summary: &ExerciseSummary) -> String {
    let mut out = format!(
        "{}: {}/{} approved, {} flagged, {} errored -> {}\n",
        summary.exercise,
        summary.approved,
        summary.total,
        summary.flagged,
        summary.errored,
        if summary.ready_for_assembly {
            "ready for assembly"
        } else {
            "needs review"
        }
    );
    for row in &summary.shots {
        let confidence = row
            .confidence
            .map(|value| format!("{value:.2}"))
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "  {:<28} {:<8} iterations={} confidence={}\n",
            row.shot_id,
            row.status.as_str(),
            row.iterations_used,
            confidence
        ));
    }
    for issue in &summary.blocking_issues {
        out.push_str(&format!(
            "  ! {} [{}] {}\n",
            issue.shot_id, issue.status, issue.reason
        ));
    }
    out
}

fn render_batch(summary: &BatchSummary) -> String {
    let mut out = String::new();
    for row in summary.exercises.iter().filter(|row| row.error.is_some()) {
        out.push_str(&format!(
            "{}: failed: {}\n",
            row.exercise,
            row.error.as_deref().unwrap_or_default()
        ));
    }
    let ready = summary
        .exercises
        .iter()
        .filter(|row| row.ready_for_assembly)
        .count();
    out.push_str(&format!(
        "batch {}: {}/{} exercises ready for assembly\n",
        summary.run_id,
        ready,
        summary.exercises.len()
    ));
    out
}
