use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::error;

use tnfsd::tnfs_abi::{SESSION_TIMEOUT, TNFSD_PORT};
use tnfsd::{Tnfsd, Transport};

/// Serve a directory tree over the Trivial Network File System protocol.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Directory to serve; clients cannot reach anything outside it.
    root: PathBuf,

    /// UDP/TCP port to listen on.
    #[arg(short, long, default_value_t = TNFSD_PORT)]
    port: u16,

    /// Also accept TCP connections on the same port.
    #[arg(long)]
    tcp: bool,

    /// Session inactivity timeout in seconds; 0 disables the sweep.
    #[arg(long, default_value_t = SESSION_TIMEOUT.as_secs())]
    session_timeout: u64,

    /// Append the log to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(log_file: Option<&PathBuf>) -> Result<(), String> {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(path) = log_file {
        let file = File::options()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| format!("cannot open log file {}: {err}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn run(args: &Args) -> Result<(), String> {
    let timeout = match args.session_timeout {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let mut server = Tnfsd::with_timeout(&args.root, timeout)
        .map_err(|err| format!("cannot serve {}: {err}", args.root.display()))?;
    let mut transport = Transport::bind(args.port, args.tcp)
        .map_err(|err| format!("cannot bind port {}: {err}", args.port))?;
    transport
        .run(&mut server)
        .map_err(|err| format!("event loop failed: {err}"))
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = init_logging(args.log_file.as_ref()) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("tnfsd: {err}");
            ExitCode::FAILURE
        }
    }
}
