//! QuorumKV test client entry point.
//!
//! One-shot mode (`--cmd "PUT:key:value"`) or a line-oriented REPL on stdin.
//! `KILL:<addr>` and `REVIVE:<addr>` lines are sent directly to the named
//! replica for fault injection during manual testing.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use quorumkv::client::parse_command;
use quorumkv::{logger_init, pf_error, KvClient, KvError, NodeRequest, ME};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::runtime::Builder;
use tokio::time::Duration;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Address of the coordinator's API socket.
    #[arg(short = 'a', long, default_value = "127.0.0.1:8080")]
    coordinator: String,

    /// One command to run (e.g. "PUT:key:value"); if absent, starts a REPL.
    #[arg(short = 'm', long)]
    cmd: Option<String>,

    /// Time limit on each request-reply exchange, in milliseconds.
    #[arg(short, long, default_value_t = 5000)]
    timeout_ms: u64,
}

impl CliArgs {
    /// Sanitize command line arguments, return the parsed coordinator
    /// address on success or `Err(KvError)` on any error.
    fn sanitize(&self) -> Result<SocketAddr, KvError> {
        if self.timeout_ms == 0 {
            return Err(KvError::msg("invalid timeout_ms 0"));
        }
        Ok(self.coordinator.parse()?)
    }
}

/// Runs one command line and prints the rendered reply. Returns false if the
/// line was a quit request.
async fn run_line(client: &KvClient, line: &str) -> Result<bool, KvError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(true);
    }
    if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
        return Ok(false);
    }

    // fault-injection lines target a replica directly
    if let Some(addr) = line.strip_prefix("KILL:") {
        let reply = client
            .fault_inject(addr.trim().parse()?, &NodeRequest::Kill)
            .await?;
        println!("{}", reply);
        return Ok(true);
    }
    if let Some(addr) = line.strip_prefix("REVIVE:") {
        let reply = client
            .fault_inject(addr.trim().parse()?, &NodeRequest::Revive)
            .await?;
        println!("{}", reply);
        return Ok(true);
    }

    match parse_command(line) {
        Ok(req) => {
            let reply = client.request(&req).await?;
            println!("{}", reply);
        }
        Err(reply) => {
            println!("{}", reply);
        }
    }
    Ok(true)
}

/// Actual main function of the test client.
fn client_main() -> Result<(), KvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let coord_addr = args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("tokio-worker-client")
        .build()?;

    runtime.block_on(async move {
        let client = KvClient::new(
            coord_addr,
            Duration::from_millis(args.timeout_ms),
        );

        if let Some(cmd) = &args.cmd {
            // one-shot mode
            run_line(&client, cmd).await?;
            return Ok(());
        }

        // REPL mode
        let mut lines = BufReader::new(io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if !run_line(&client, &line).await? {
                break;
            }
        }
        Ok::<(), KvError>(())
    })
}

/// Main function of the test client.
fn main() -> ExitCode {
    logger_init();
    let _ = ME.set("client".into());

    if let Err(ref e) = client_main() {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
