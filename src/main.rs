// ABOUTME: Entry point for the sshpipe CLI application.
// ABOUTME: Parses arguments, loads config and dispatches to the SSH client.

mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use sshpipe::config::Config;
use sshpipe::error::{Error, Result};
use sshpipe::ssh::{self, Client, ExecStream, Outcome};
use std::env;
use std::io::Write;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Exit status used when a command is cut off by its timeout, as with timeout(1).
const EXIT_TIMEOUT: u8 = 124;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing subscriber based on verbose flag
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let client = Client::new(config.session_config()?);

    match cli.command {
        Commands::Run { command, timeout } => {
            let timeout = timeout.unwrap_or(client.config().command_timeout);
            let output = client.run_with_timeout(&command, timeout).await?;

            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            Ok(exit_code(&output.outcome))
        }
        Commands::Stream { command, timeout } => {
            let timeout = timeout.unwrap_or(client.config().command_timeout);
            let stream = client.stream_with_timeout(&command, timeout).await?;
            stream_lines(stream).await
        }
        Commands::Scp { source, target } => {
            client.scp(&source, &target).await?;
            tracing::debug!("uploaded {} to {}", source.display(), target);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let cwd = env::current_dir()?;
            match Config::discover(&cwd) {
                Ok(config) => config,
                // A server on the command line is enough to get going.
                Err(Error::ConfigNotFound(_)) if cli.server.is_some() => Config::default(),
                Err(e) => return Err(e),
            }
        }
    };

    match &cli.server {
        Some(server) => config.with_server(server),
        None => Ok(config),
    }
}

/// Print lines as they arrive, then report how the command ended.
async fn stream_lines(mut stream: ExecStream) -> Result<ExitCode> {
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut out = std::io::stdout();

    loop {
        tokio::select! {
            line = stream.stdout.recv(), if stdout_open => match line {
                Some(line) => {
                    writeln!(out, "out: {}", line)?;
                    out.flush()?;
                }
                None => stdout_open = false,
            },
            line = stream.stderr.recv(), if stderr_open => match line {
                Some(line) => {
                    writeln!(out, "err: {}", line)?;
                    out.flush()?;
                }
                None => stderr_open = false,
            },
            else => break,
        }
    }

    let completed = stream.done.await.unwrap_or(false);
    let result = stream.error.await;

    let outcome = match (completed, result) {
        (false, Ok(Err(e))) if e.is_timeout() => {
            eprintln!("{}", e);
            Outcome::TimedOut
        }
        (_, Ok(Ok(()))) => Outcome::Success,
        (_, Ok(Err(e))) => Outcome::Failed(e),
        (_, Err(_)) => Outcome::Failed(ssh::Error::ChannelClosed),
    };
    Ok(exit_code(&outcome))
}

fn exit_code(outcome: &Outcome) -> ExitCode {
    match outcome {
        Outcome::Success => ExitCode::SUCCESS,
        Outcome::TimedOut => ExitCode::from(EXIT_TIMEOUT),
        Outcome::Failed(ssh::Error::ExitStatus(code)) => {
            ExitCode::from(u8::try_from(*code).unwrap_or(u8::MAX))
        }
        Outcome::Failed(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
