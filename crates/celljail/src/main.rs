//! `cj`: drive celljail sessions from the command line.
//!
//! Every command prints exactly one line on stdout: a result envelope, an
//! error envelope, or raw RPC response text. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use celljail_core::config::{Config, LogFormat};
use celljail_core::logging::{LogError, init_logging};
use celljail_core::{CallError, Jail, MethodRouter, make_error, make_result};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};

#[derive(Parser)]
#[command(name = "cj")]
#[command(version, about = "Run Lua session scripts against a JSON-RPC dispatch bridge", long_about = None)]
struct Cli {
    /// Path to celljail.toml
    #[arg(long, global = true, env = "CELLJAIL_CONFIG")]
    config: Option<PathBuf>,

    /// Session id to operate on
    #[arg(long, global = true, default_value = "default")]
    session: String,

    /// Bootstrap script run in new cells (overrides the config file)
    #[arg(long, global = true)]
    bootstrap: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "CELLJAIL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a session with a script and print its catalog
    Init {
        /// Lua source file
        script: PathBuf,
    },

    /// Initialize a session, then call a function in it
    Invoke {
        /// Lua source file
        script: PathBuf,

        /// Dotted path of the function to call
        path: String,

        /// JSON passed as the first argument
        #[arg(long)]
        this: Option<String>,

        /// JSON arguments; an array spreads into positional arguments
        #[arg(long, default_value = "")]
        args: String,
    },

    /// Dispatch a raw JSON-RPC payload (object or array)
    Rpc {
        /// Request payload
        payload: String,

        /// Initialize the session with this script first
        #[arg(long)]
        script: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("cj: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match init_logging(&config.logging) {
        Ok(()) | Err(LogError::AlreadyInitialized) => {}
        Err(err) => return Err(err).context("failed to initialize logging"),
    }

    let jail = Jail::from_config(&config, Arc::new(cli_router()))
        .context("failed to build session jail")?;
    if let Some(path) = &cli.bootstrap {
        jail.set_bootstrap(read_script(path)?);
    }

    let outcome = match &cli.command {
        Commands::Init { script } => jail
            .try_init_session(&cli.session, &read_script(script)?)
            .map(|catalog| make_result(&catalog)),
        Commands::Invoke {
            script,
            path,
            this,
            args,
        } => jail
            .try_init_session(&cli.session, &read_script(script)?)
            .and_then(|_| jail.try_invoke(&cli.session, path, this.as_deref(), args))
            .map(|raw| make_result(&raw)),
        Commands::Rpc { payload, script } => {
            let init = match script {
                Some(script) => jail
                    .try_init_session(&cli.session, &read_script(script)?)
                    .map(|_| ()),
                None => Ok(()),
            };
            init.and_then(|()| jail.dispatch(&cli.session, payload))
        }
    };

    match outcome {
        Ok(text) => {
            println!("{text}");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            tracing::debug!(error = %err, fatal = err.is_fatal(), "command failed");
            println!("{}", make_error(&err.to_string()));
            Ok(ExitCode::from(1))
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read script {}", path.display()))
}

/// Methods served by the CLI: `echo` returns its params, `ping` answers `"pong"`.
fn cli_router() -> MethodRouter {
    MethodRouter::new()
        .with_method("echo", |call, _| Ok(Value::Array(call.params.clone())))
        .with_method("ping", |_, _| Ok(json!("pong")))
        .with_method("halt", |call, _| {
            let reason = call
                .params
                .first()
                .and_then(Value::as_str)
                .unwrap_or("halted");
            Err(CallError::fatal(reason))
        })
}
