// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines the subcommands and their arguments.

use clap::{Parser, Subcommand};
use humantime_serde::re::humantime;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sshpipe")]
#[command(about = "Run commands and upload files over SSH, through bastions and HTTP proxies")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file (default: sshpipe.yml in the current directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Target server as [user@]host[:port], overriding the config file
    #[arg(short, long, global = true)]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command and print its output once it finishes
    Run {
        /// Command line passed to the remote shell
        command: String,

        /// Give up after this long (e.g. "30s", "5m")
        #[arg(short, long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
    },

    /// Run a command and print each output line as it arrives
    Stream {
        /// Command line passed to the remote shell
        command: String,

        /// Give up after this long (e.g. "30s", "5m")
        #[arg(short, long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
    },

    /// Upload a local file to the remote host
    Scp {
        /// Local file
        source: PathBuf,

        /// Remote path, including the file name
        target: String,
    },
}
