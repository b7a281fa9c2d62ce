use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_bile_acids::app::{
    AnnotateOptions, AnnotateResult, AnnotateSource, App, ClassifyResult,
};
use kira_bile_acids::config::ConfigLoader;
use kira_bile_acids::domain::{QuerySubset, TaskId};
use kira_bile_acids::engine::MassqlCliEngine;
use kira_bile_acids::error::KiraError;
use kira_bile_acids::gnps::GnpsHttpClient;
use kira_bile_acids::output::{
    self, JsonOutput, OutputMode, TextProgress, format_path, write_annotation_tables,
};
use kira_bile_acids::store::Store;

#[derive(Parser)]
#[command(name = "kira-ba")]
#[command(about = "Multi-step MassQL bile acid isomer annotation for GNPS2 FBMN tasks")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Config file (defaults to ./kira-ba.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the staged query pipeline and classify every scan")]
    Annotate(AnnotateArgs),
    #[command(about = "Classify a previously exported full_table.csv")]
    Classify(ClassifyArgs),
    #[command(about = "List the query catalog")]
    Queries(QueriesArgs),
    #[command(about = "List every classification path")]
    Paths,
    #[command(about = "Inspect or clear the task cache")]
    Cache(CacheArgs),
}

#[derive(Args)]
struct AnnotateArgs {
    /// GNPS2 FBMN task id (32 hex digits)
    #[arg(required_unless_present = "mgf", conflicts_with = "mgf")]
    task: Option<String>,

    /// Local MGF file instead of a GNPS2 task
    #[arg(long)]
    mgf: Option<PathBuf>,

    /// Library-match TSV accompanying --mgf
    #[arg(long, requires = "mgf")]
    library: Option<PathBuf>,

    /// Directory for CSV exports
    #[arg(long)]
    out: Option<PathBuf>,

    #[arg(long)]
    no_cache: bool,

    /// Query engine executable, overriding the config
    #[arg(long)]
    engine: Option<String>,

    /// Queries dispatched at once, overriding the config
    #[arg(long)]
    concurrency: Option<usize>,
}

#[derive(Args)]
struct ClassifyArgs {
    table: PathBuf,

    /// Write classified.csv into this directory
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
struct QueriesArgs {
    #[arg(long)]
    subset: Option<QuerySubset>,
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand)]
enum CacheCommand {
    #[command(about = "List cached tasks")]
    List,
    #[command(about = "Remove every cached task")]
    Clear,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::InvalidTaskId(_)
        | KiraError::InvalidScanId(_)
        | KiraError::InvalidSubset(_)
        | KiraError::Format(_)
        | KiraError::SourceUnreadable(_)
        | KiraError::ConfigRead(_) => 2,
        KiraError::EngineUnavailable(_)
        | KiraError::GnpsHttp(_)
        | KiraError::GnpsStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Commands::Annotate(args) = &cli.command {
        if let Some(program) = &args.engine {
            config.engine_program = PathBuf::from(program);
        }
        if let Some(concurrency) = args.concurrency {
            if concurrency == 0 {
                return Err(miette::Report::msg("--concurrency must be at least 1"));
            }
            config.run_options.concurrency = Some(concurrency);
        }
    }

    let store = Store::new()?;
    let engine = MassqlCliEngine::new(&config.engine_program.to_string_lossy());
    let provider = GnpsHttpClient::new()?;
    let app = App::new(store, provider, engine, config);

    match cli.command {
        Commands::Annotate(args) => run_annotate(args, &app, output_mode),
        Commands::Classify(args) => run_classify(args, &app, output_mode),
        Commands::Queries(args) => {
            let result = app.queries(args.subset);
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_queries(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    for query in &result.queries {
                        println!("{}\t{}", query.name, query.pattern);
                    }
                    Ok(())
                }
            }
        }
        Commands::Paths => {
            let result = app.paths();
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_paths(&result).into_diagnostic(),
                OutputMode::Interactive => {
                    for path in &result.paths {
                        println!("{}", format_path(path));
                    }
                    Ok(())
                }
            }
        }
        Commands::Cache(args) => match args.command {
            CacheCommand::List => match output_mode {
                OutputMode::NonInteractive => {
                    let result = app.cache_list(&JsonOutput)?;
                    JsonOutput::print_cache_list(&result).into_diagnostic()
                }
                OutputMode::Interactive => {
                    let result = app.cache_list(&TextProgress)?;
                    for task in &result.tasks {
                        println!("{}\t{}\t{}", task.task_id, task.downloaded_at, task.tool);
                    }
                    Ok(())
                }
            },
            CacheCommand::Clear => match output_mode {
                OutputMode::NonInteractive => {
                    let result = app.cache_clear(&JsonOutput)?;
                    JsonOutput::print_clear(&result).into_diagnostic()
                }
                OutputMode::Interactive => {
                    app.cache_clear(&TextProgress)?;
                    println!("task cache cleared");
                    Ok(())
                }
            },
        },
    }
}

fn run_annotate(
    args: AnnotateArgs,
    app: &App<GnpsHttpClient, MassqlCliEngine>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let source = match (args.task, args.mgf) {
        (Some(task), _) => AnnotateSource::Task(task.parse::<TaskId>()?),
        (None, Some(spectra)) => AnnotateSource::Files {
            spectra,
            library: args.library,
        },
        (None, None) => return Err(miette::Report::msg("a task id or --mgf is required")),
    };
    let options = AnnotateOptions {
        no_cache: args.no_cache,
    };

    let result = match output_mode {
        OutputMode::NonInteractive => app.annotate(source, options, &JsonOutput)?,
        OutputMode::Interactive => app.annotate(source, options, &TextProgress)?,
    };

    let written = match &args.out {
        Some(dir) => write_annotation_tables(dir, &result)?,
        None => Vec::new(),
    };

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_annotate(&result).into_diagnostic(),
        OutputMode::Interactive => {
            print_annotate_summary(&result, &written);
            Ok(())
        }
    }
}

fn run_classify(
    args: ClassifyArgs,
    app: &App<GnpsHttpClient, MassqlCliEngine>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let result = match output_mode {
        OutputMode::NonInteractive => app.classify_table(args.table, &JsonOutput)?,
        OutputMode::Interactive => app.classify_table(args.table, &TextProgress)?,
    };

    let mut written = Vec::new();
    if let Some(dir) = &args.out {
        std::fs::create_dir_all(dir).into_diagnostic()?;
        let path = dir.join("classified.csv");
        output::write_classified(&path, &result.library_columns, &result.classified)?;
        written.push(path);
    }

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_classify(&result).into_diagnostic(),
        OutputMode::Interactive => {
            print_classify_summary(&result, &written);
            Ok(())
        }
    }
}

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

fn print_annotate_summary(result: &AnnotateResult, written: &[PathBuf]) {
    println!("{CYAN}KIRA-BA summary: {} ({}){RESET}", result.source, result.action);
    println!("{GREEN}Scans: {}{RESET}", result.total_scans);
    println!(
        "{GREEN}Passed stage 1: {}{RESET}",
        result.stage1_passed
    );
    println!(
        "{YELLOW}Excluded at stage 1: {}{RESET}",
        result.total_scans.saturating_sub(result.stage1_passed)
    );
    println!(
        "{GREEN}Library matches: {}{RESET}",
        result.aggregation.library_only.len()
    );
    print_classified(&result.classified, &result.features);
    for path in written {
        println!("{CYAN}   wrote {}{RESET}", path.display());
    }
}

fn print_classify_summary(result: &ClassifyResult, written: &[PathBuf]) {
    println!("{CYAN}KIRA-BA classify: {}{RESET}", result.table);
    println!("{GREEN}Records: {}{RESET}", result.total_records);
    print_classified(&result.classified, &result.features);
    for path in written {
        println!("{CYAN}   wrote {}{RESET}", path.display());
    }
}

fn print_classified(
    classified: &[kira_bile_acids::aggregate::ClassifiedRecord],
    features: &[(String, kira_bile_acids::domain::ScanId)],
) {
    println!("{GREEN}Classified: {}{RESET}", classified.len());
    for (compound, scan) in features {
        let Some(item) = classified.iter().find(|item| item.record.scan_id == *scan) else {
            continue;
        };
        let color = if item.classification.is_chimeric() {
            YELLOW
        } else {
            GREEN
        };
        let paths = item
            .classification
            .satisfied_paths
            .iter()
            .map(format_path)
            .collect::<Vec<_>>()
            .join(" | ");
        println!("{color}   {scan}\t{compound}\t{paths}{RESET}");
    }
}
