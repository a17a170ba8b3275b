//! CLI entrypoint for the modcheck test runner.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use modcheck_core::ModuleLoader;
use modcheck_harness::structured_log::{
    LogEmitter, LogEntry, LogLevel, Outcome, validate_log_file,
};
use modcheck_harness::{ExpectationSet, SessionReport, TestSession};

/// Test runner for dynamically loaded native modules.
#[derive(Debug, Parser)]
#[command(name = "modcheck")]
#[command(about = "Load a native module, call its entry points, and judge the results")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an expectation set against a module.
    Run {
        /// Shared object to load.
        #[arg(long)]
        module: PathBuf,
        /// Expectation set JSON.
        #[arg(long)]
        expectations: PathBuf,
        /// Output report path (markdown).
        #[arg(long)]
        report: Option<PathBuf>,
        /// Output report path (JSON).
        #[arg(long)]
        json: Option<PathBuf>,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Run identifier used as the trace ID prefix.
        #[arg(long, default_value = "modcheck")]
        run_id: String,
    },
    /// Parse an expectation set and check every entry's signature.
    CheckExpectations {
        /// Expectation set JSON.
        #[arg(long)]
        file: PathBuf,
    },
    /// Validate a structured JSONL log against the log schema.
    ValidateLog {
        /// Structured JSONL log path.
        #[arg(long)]
        log: PathBuf,
    },
    /// Load a module, report which symbols it exports, and unload it.
    Probe {
        /// Shared object to load.
        #[arg(long)]
        module: PathBuf,
        /// Symbol names to look up.
        #[arg(long = "symbol", required = true)]
        symbols: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}

/// `Ok(passed)` for completed commands; `Err` for unusable input.
fn run(command: Command) -> Result<bool, Box<dyn std::error::Error>> {
    match command {
        Command::Run {
            module,
            expectations,
            report,
            json,
            log,
            run_id,
        } => {
            let set = ExpectationSet::from_file(&expectations)?;
            let problems = set.lint();
            if !problems.is_empty() {
                return Err(format!(
                    "{} is malformed:\n  {}",
                    expectations.display(),
                    problems.join("\n  ")
                )
                .into());
            }
            eprintln!(
                "Running {} ({} entries) against {}",
                set.fixture,
                set.entries.len(),
                module.display()
            );

            let title = format!("modcheck: {}", set.fixture);
            let mut emitter = log
                .as_deref()
                .map(|path| LogEmitter::to_file(path, &run_id))
                .transpose()?;
            if let Some(emitter) = emitter.as_mut() {
                emitter.emit(LogLevel::Info, "run_start")?;
            }
            let mut session = TestSession::new(&module, set);
            if let Some(emitter) = emitter.as_mut() {
                session = session.with_log(emitter);
            }
            let verdict = session.run();

            eprintln!(
                "Session complete: state={}, passed={}, failed={}, skipped={}",
                verdict.final_state(),
                verdict.passed_count(),
                verdict.failed_count(),
                verdict.skipped_count()
            );
            if let Some(failure) = verdict.failure() {
                eprintln!("Failure: {failure}");
            }
            for entry in verdict.failed_entries() {
                eprintln!("  {} {}", entry.status.label(), entry.symbol);
            }

            let passed = verdict.passed();
            let report_doc = SessionReport::new(title, verdict);
            if let Some(path) = &report {
                eprintln!("Writing report to {}", path.display());
                std::fs::write(&path, report_doc.to_markdown())?;
            }
            if let Some(path) = &json {
                eprintln!("Writing JSON report to {}", path.display());
                std::fs::write(&path, report_doc.to_json())?;
            }
            if report.is_none() && json.is_none() {
                print!("{}", report_doc.to_markdown());
            }

            if let Some(emitter) = emitter.as_mut() {
                let (outcome, exit_code) = if passed {
                    (Outcome::Pass, 0)
                } else {
                    (Outcome::Fail, 1)
                };
                emitter.emit_entry(
                    LogEntry::new("", LogLevel::Info, "run_complete")
                        .with_module(module.display().to_string())
                        .with_outcome(outcome)
                        .with_exit_code(exit_code),
                )?;
                emitter.flush()?;
            }
            Ok(passed)
        }
        Command::CheckExpectations { file } => {
            let set = ExpectationSet::from_file(&file)?;
            let problems = set.lint();
            if problems.is_empty() {
                eprintln!(
                    "{}: {} entries for fixture {}, all well-formed",
                    file.display(),
                    set.entries.len(),
                    set.fixture
                );
                return Ok(true);
            }
            for problem in &problems {
                eprintln!("{}: {problem}", file.display());
            }
            Err(format!("{} problem(s) in {}", problems.len(), file.display()).into())
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for err in &errors {
                eprintln!("{}: {err}", log.display());
            }
            eprintln!(
                "Validated {lines} line(s) in {}: {} error(s)",
                log.display(),
                errors.len()
            );
            Ok(errors.is_empty())
        }
        Command::Probe { module, symbols } => {
            let mut loader = ModuleLoader::new();
            let handle = loader.load(&module)?;
            let init_output = loader.init_output(handle)?.to_string();
            if !init_output.is_empty() {
                eprintln!("Initializer output:\n{}", init_output.trim_end());
            }

            let mut all_found = true;
            for name in &symbols {
                match loader.resolve(handle, name) {
                    Ok(_) => println!("{name}: exported"),
                    Err(err) => {
                        all_found = false;
                        println!("{name}: missing ({err})");
                    }
                }
            }

            let teardown = loader.unload(handle)?;
            if !teardown.finalizer_output.is_empty() {
                eprintln!(
                    "Finalizer output:\n{}",
                    teardown.finalizer_output.trim_end()
                );
            }
            Ok(all_found)
        }
    }
}
