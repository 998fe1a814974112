// cellar/src/main.rs
use std::fs;
use std::process;
use std::sync::Arc;

use cellar_common::cache::Cache;
use cellar_common::config::Config;
use cellar_common::error::CellarError;
use cellar_common::model::BuildSelections;
use clap::Parser;
use colored::Colorize;
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

mod cli;
mod pipeline;
use cli::CliArgs;

/// Pulls `--with-*` / `--without-*` out of `args`; clap sees the rest.
fn split_variant_args(args: impl IntoIterator<Item = String>) -> (BuildSelections, Vec<String>) {
    let mut selections = BuildSelections::default();
    let mut rest = Vec::new();
    let mut passthrough = false;
    for arg in args {
        if passthrough {
            rest.push(arg);
            continue;
        }
        if arg == "--" {
            passthrough = true;
            rest.push(arg);
            continue;
        }
        if !selections.push_flag(&arg) {
            rest.push(arg);
        }
    }
    (selections, rest)
}

fn init_logging(config: &Config, verbose: u8) {
    let level_filter = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let max_log_level = level_filter.into_level().unwrap_or(tracing::Level::WARN);

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .with_env_var("CELLAR_LOG")
        .from_env_lossy();

    let log_dir = config.logs_dir();
    if verbose == 0 {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .without_time()
            .try_init();
        return;
    }
    if let Err(e) = fs::create_dir_all(&log_dir) {
        eprintln!(
            "{} Failed to create log directory {}: {}",
            "Error:".red().bold(),
            log_dir.display(),
            e
        );
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .without_time()
            .try_init();
        return;
    }

    let file_appender = tracing_appender::rolling::daily(&log_dir, "cellar.log");
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);
    let stderr_writer = std::io::stderr.with_max_level(max_log_level);
    let file_writer = non_blocking_appender.with_max_level(max_log_level);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(stderr_writer.and(file_writer))
        .with_ansi(true)
        .without_time()
        .try_init();

    // The writer flushes on drop; keep it for the life of the process.
    Box::leak(Box::new(guard));
    debug!(
        "Verbose logging enabled. Writing logs to: {}/cellar.log",
        log_dir.display()
    );
}

fn fail(err: &CellarError) -> ! {
    error!("Command failed: {:#}", err);
    eprintln!("{}: {:#}", "Error".red().bold(), err);
    process::exit(err.exit_code());
}

#[tokio::main]
async fn main() {
    let (variants, args) = split_variant_args(std::env::args());
    let cli_args = CliArgs::parse_from(args);

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => fail(&e),
    };
    init_logging(&config, cli_args.verbose);

    let cache = match Cache::new(&config) {
        Ok(cache) => Arc::new(cache),
        Err(e) => fail(&CellarError::Config(format!(
            "Could not initialize cache at {}: {e}",
            config.cache_dir().display()
        ))),
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling running builds");
            let _ = cancel_tx.send(true);
        }
    });

    if let Err(e) = cli_args
        .command
        .run(&config, cache, &variants, cancel_rx)
        .await
    {
        fail(&e);
    }
    debug!("Command completed successfully.");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn variant_flags_are_split_from_clap_args() {
        let (sel, rest) = split_variant_args(args(&[
            "cellar",
            "install",
            "--with-demos",
            "nektar",
            "--without-mpi",
            "--force",
        ]));
        assert!(sel.with.contains("demos"));
        assert!(sel.without.contains("mpi"));
        assert_eq!(rest, args(&["cellar", "install", "nektar", "--force"]));
    }

    #[test]
    fn later_flag_wins_and_double_dash_stops_splitting() {
        let (sel, rest) = split_variant_args(args(&[
            "cellar",
            "install",
            "--with-mpi",
            "--without-mpi",
            "--",
            "--with-petsc",
        ]));
        assert!(!sel.is_enabled("mpi"));
        assert!(sel.with.is_empty());
        assert_eq!(rest, args(&["cellar", "install", "--", "--with-petsc"]));
    }

    #[test]
    fn cli_parses_install_switches() {
        let cli = CliArgs::try_parse_from(args(&[
            "cellar", "-v", "install", "--HEAD", "--force", "-j", "3", "nektar",
        ]))
        .unwrap();
        assert_eq!(cli.verbose, 1);
        assert!(matches!(cli.command, cli::Command::Install(_)));
    }
}
