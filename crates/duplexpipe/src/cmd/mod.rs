use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use duplexpipe_transport::{PipeIdentity, LOCAL_HOST};

use crate::exit::{io_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod info;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept clients on a pipe, print what they send and relay it to everyone.
    Serve(ServeArgs),
    /// Connect, send one message and optionally wait for a reply.
    Send(SendArgs),
    /// Connect, report the private channel that was negotiated, and disconnect.
    Info(InfoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => block_on(serve::run(args, format)),
        Command::Send(args) => block_on(send::run(args, format)),
        Command::Info(args) => block_on(info::run(args, format)),
        Command::Version(args) => version::run(args),
    }
}

fn block_on<F>(future: F) -> CliResult<i32>
where
    F: Future<Output = CliResult<i32>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("failed to start async runtime", err))?;
    runtime.block_on(future)
}

/// Rendezvous pipe selection shared by every networked command.
#[derive(Args, Debug)]
pub struct PipeArgs {
    /// Pipe name (Unix: an absolute socket path is used as-is).
    pub pipe: String,
    /// Server host; "." is this machine.
    #[arg(long, default_value = LOCAL_HOST)]
    pub host: String,
}

impl PipeArgs {
    pub fn identity(&self) -> PipeIdentity {
        PipeIdentity::new(self.pipe.clone(), self.host.clone())
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub pipe: PipeArgs,
    /// Only print received messages; do not relay them to connected clients.
    #[arg(long)]
    pub no_relay: bool,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
    /// Socket file permission bits in octal (Unix).
    #[arg(long, value_name = "OCTAL", default_value = "600")]
    pub mode: String,
    /// Maximum concurrent sends while relaying.
    #[arg(long, default_value_t = duplexpipe_peer::DEFAULT_BROADCAST_CONCURRENCY)]
    pub concurrency: usize,
    /// Disconnect a client that takes longer than this to accept a relayed message.
    #[arg(long, default_value = "30s")]
    pub send_timeout: String,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub pipe: PipeArgs,
    /// JSON payload (validated before sending).
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Wait for one message back and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the reply when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
    /// Maximum time to wait for the server to accept (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub connect_timeout: String,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub pipe: PipeArgs,
    /// Connection timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

pub fn parse_mode(input: &str) -> CliResult<u32> {
    let digits = input.trim().trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o777)
        .ok_or_else(|| CliError::new(USAGE, format!("invalid octal mode: {input}")))
}
