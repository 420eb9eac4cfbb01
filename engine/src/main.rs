//! Command-line front end for the response engine.
//!
//! Reads a model response from a file or stdin and escapes, parses, checks or
//! applies it. Model invocation stays outside this binary.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use dyad_engine::apply::{Collaborators, apply_operations};
use dyad_engine::core::escape::escape;
use dyad_engine::core::parser::{chat_summary, has_unclosed_write, parse_raw, strip_tags};
use dyad_engine::core::types::{ChatMode, Operation};
use dyad_engine::exit_codes;
use dyad_engine::io::checker::{CheckerWorker, ProblemChecker, TscChecker};
use dyad_engine::io::config::{EngineConfig, load_config, write_config};
use dyad_engine::io::installer::ShellInstaller;
use dyad_engine::logging;
use dyad_engine::session::TurnSession;

#[derive(Parser)]
#[command(
    name = "dyad-engine",
    version,
    about = "Parse and apply dyad-tagged model responses"
)]
struct Cli {
    /// Engine config (TOML). Defaults apply when missing.
    #[arg(long, global = true, default_value = "dyad-engine.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default engine config to the `--config` path.
    Init {
        /// Overwrite an existing config.
        #[arg(long)]
        force: bool,
    },
    /// Print the response with tag attribute values escaped.
    Escape { file: Option<PathBuf> },
    /// Print the operations found in a response as JSON.
    Parse {
        file: Option<PathBuf>,
        /// Print the text with every complete tag removed instead.
        #[arg(long)]
        plain: bool,
    },
    /// Type-check the project as it would look after the response's operations.
    Check {
        #[arg(long)]
        root: PathBuf,
        file: Option<PathBuf>,
    },
    /// Apply the response's completed operations and commit them.
    Apply {
        #[arg(long)]
        root: PathBuf,
        file: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        chat_id: i64,
        #[arg(long, default_value_t = 0)]
        message_id: i64,
    },
}

#[derive(Serialize)]
struct ParseReport<'a> {
    operations: Vec<Operation>,
    in_progress: Vec<&'a Operation>,
    truncated: bool,
    chat_summary: Option<String>,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Escape { file } => {
            print!("{}", escape(&read_input(file.as_deref())?));
            Ok(exit_codes::OK)
        }
        Command::Parse { file, plain } => cmd_parse(&read_input(file.as_deref())?, plain),
        Command::Check { root, file } => {
            let config = load_config(&cli.config)?;
            cmd_check(&config, &root, file.as_deref())
        }
        Command::Apply {
            root,
            file,
            chat_id,
            message_id,
        } => {
            let config = load_config(&cli.config)?;
            let text = read_input(file.as_deref())?;
            cmd_apply(&config, &root, &text, chat_id, message_id)
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    write_config(path, &EngineConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_parse(text: &str, plain: bool) -> Result<i32> {
    if plain {
        println!("{}", strip_tags(text));
        return Ok(exit_codes::OK);
    }
    let parsed = parse_raw(text);
    let report = ParseReport {
        operations: parsed.completed_operations(),
        in_progress: parsed.in_progress(),
        truncated: has_unclosed_write(&escape(text)),
        chat_summary: chat_summary(text),
    };
    print_json(&report)?;
    Ok(exit_codes::OK)
}

fn cmd_check(config: &EngineConfig, root: &Path, file: Option<&Path>) -> Result<i32> {
    let operations = match file {
        Some(path) => parse_raw(&read_file(path)?).completed_operations(),
        None => Vec::new(),
    };
    let checker = CheckerWorker::new(
        Arc::new(TscChecker::new(config.checker.clone())),
        Duration::from_secs(config.checker.timeout_secs),
    );
    let report = checker.check(root, &operations)?;
    print_json(&report)?;
    Ok(if report.is_clean() {
        exit_codes::OK
    } else {
        exit_codes::PROBLEMS
    })
}

fn cmd_apply(
    config: &EngineConfig,
    root: &Path,
    text: &str,
    chat_id: i64,
    message_id: i64,
) -> Result<i32> {
    let session = TurnSession::detached(chat_id, message_id, ChatMode::Build);
    let installer = ShellInstaller::new(config.install.clone());
    let operations = parse_raw(text).completed_operations();
    let outcome = apply_operations(
        root,
        &session,
        &operations,
        chat_summary(text).as_deref(),
        config,
        Collaborators {
            installer: &installer,
            sql: None,
        },
    );
    print_json(&outcome)?;
    Ok(if outcome.error.is_some() {
        exit_codes::INVALID
    } else {
        exit_codes::OK
    })
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => read_file(path),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            Ok(buf)
        }
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize json")?
    );
    Ok(())
}
