//! checklocks CLI

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use checklocks::error::report_error;
use checklocks::{CheckError, Config};

#[derive(Parser)]
#[command(name = "checklocks", version, about = "Static lock and atomic contract checker")]
struct Cli {
    /// Log at debug level (overrides CHECKLOCKS_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check lock contracts in source files
    Check {
        /// Source files, each checked as its own compilation unit
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Configuration file (default: ./checklocks.toml when present)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Plain)]
        format: Format,
    },
    /// Dump the contract registry (debug)
    Contracts {
        file: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Lower function bodies and dump MIR (debug)
    Mir {
        file: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Parse and dump AST (debug)
    Parse {
        /// Source file to parse
        file: PathBuf,
    },
    /// Tokenize and dump tokens (debug)
    Tokens {
        /// Source file to tokenize
        file: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Plain,
    Pretty,
    Json,
}

/// Outcome of a successful run
enum Status {
    Clean,
    Findings,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Check { files, config, format } => check_files(&files, config.as_deref(), format),
        Command::Contracts { file, config } => dump_contracts(&file, config.as_deref()),
        Command::Mir { file, config } => dump_mir(&file, config.as_deref()),
        Command::Parse { file } => parse_file(&file),
        Command::Tokens { file } => tokenize_file(&file),
    };

    match result {
        Ok(Status::Clean) => ExitCode::SUCCESS,
        Ok(Status::Findings) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("CHECKLOCKS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn read_source(path: &Path) -> Result<String, CheckError> {
    std::fs::read_to_string(path)
        .map_err(|e| CheckError::io_error(format!("failed to read {}: {e}", path.display())))
}

/// Front end errors are rendered against the source before being returned
fn parse_program(filename: &str, source: &str) -> Result<checklocks::ast::Program, CheckError> {
    let parsed = checklocks::lexer::tokenize(source)
        .and_then(|tokens| checklocks::parser::parse(filename, source, tokens));
    parsed.inspect_err(|e| report_error(filename, source, e))
}

fn check_files(files: &[PathBuf], config: Option<&Path>, format: Format) -> Result<Status, Box<dyn std::error::Error>> {
    let config = Config::discover(config)?;
    let mut total = 0;
    let mut json_reports = Vec::new();

    for path in files {
        let source = read_source(path)?;
        let filename = path.display().to_string();

        let report = checklocks::check_source(&filename, &source, &config)
            .inspect_err(|e| report_error(&filename, &source, e))?;
        total += report.len();

        match format {
            Format::Plain => print!("{}", report.render_plain(&filename, &source)),
            Format::Pretty => print!("{}", report.render_pretty(&filename, &source)),
            Format::Json => json_reports.push(serde_json::from_str::<serde_json::Value>(
                &report.render_json(&filename, &source)?,
            )?),
        }
    }

    if let Format::Json = format {
        let merged: Vec<serde_json::Value> = json_reports
            .into_iter()
            .flat_map(|v| match v {
                serde_json::Value::Array(items) => items,
                other => vec![other],
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&merged)?);
    }

    Ok(if total == 0 { Status::Clean } else { Status::Findings })
}

fn dump_contracts(path: &Path, config: Option<&Path>) -> Result<Status, Box<dyn std::error::Error>> {
    let config = Config::discover(config)?;
    let source = read_source(path)?;
    let filename = path.display().to_string();
    let program = parse_program(&filename, &source)?;

    let (registry, errors) = checklocks::contract::Registry::build(&program, &config);
    print!("{}", registry.describe());

    let report = checklocks::Report { diagnostics: errors };
    eprint!("{}", report.render_plain(&filename, &source));
    Ok(if report.is_clean() { Status::Clean } else { Status::Findings })
}

fn dump_mir(path: &Path, config: Option<&Path>) -> Result<Status, Box<dyn std::error::Error>> {
    let config = Config::discover(config)?;
    let source = read_source(path)?;
    let filename = path.display().to_string();
    let program = parse_program(&filename, &source)?;

    let functions: Vec<_> = program
        .functions()
        .map(|def| checklocks::mir::lower_function(def, &config).0)
        .collect();
    print!("{}", checklocks::mir::format_mir(&functions));
    Ok(Status::Clean)
}

fn parse_file(path: &Path) -> Result<Status, Box<dyn std::error::Error>> {
    let source = read_source(path)?;
    let filename = path.display().to_string();
    let program = parse_program(&filename, &source)?;

    println!("{}", serde_json::to_string_pretty(&program)?);
    Ok(Status::Clean)
}

fn tokenize_file(path: &Path) -> Result<Status, Box<dyn std::error::Error>> {
    let source = read_source(path)?;

    let tokens = checklocks::lexer::tokenize(&source)?;
    for (tok, span) in &tokens {
        println!("{:?} @ {}..{}", tok, span.start, span.end);
    }

    Ok(Status::Clean)
}
