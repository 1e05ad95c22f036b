//! QuorumKV storage replica entry point.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use quorumkv::{logger_init, pf_error, KvError, Replica, ME};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Replica name (e.g. "NodeA"); must match the coordinator's membership.
    #[arg(short, long)]
    id: String,

    /// Local IP to use for binding the listening socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Serving port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 8081)]
    port: u16,

    /// Configuration in TOML format string (keys: backer_path, seed_path).
    #[arg(short, long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(KvError)` on any error.
    fn sanitize(&self) -> Result<(), KvError> {
        if self.id.is_empty() {
            Err(KvError::msg("empty replica id"))
        } else if self.port <= 1024 {
            Err(KvError::msg(format!("invalid port {}", self.port)))
        } else if self.threads < 2 {
            Err(KvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of the replica.
fn replica_main() -> Result<(), KvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // parse serving address
    let addr: SocketAddr = format!("{}:{}", args.bind_ip, args.port)
        .parse()
        .map_err(|e| {
            KvError::msg(format!(
                "failed to parse addr: bind_ip {} port {}: {}",
                args.bind_ip, args.port, e
            ))
        })?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-replica")
            .build()?;

        // enter tokio runtime, set up the replica, and start the main event
        // loop logic
        runtime.block_on(async move {
            let mut replica =
                Replica::new_and_setup(&args.id, addr, args.config.as_deref())
                    .await?;

            replica.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), KvError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the replica.
fn main() -> ExitCode {
    logger_init();
    let args = std::env::args().collect::<Vec<_>>();
    // identity prefix from the --id argument when present, before full parse
    let me = args
        .iter()
        .position(|a| a == "--id" || a == "-i")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "replica".into());
    let _ = ME.set(me);

    if let Err(ref e) = replica_main() {
        pf_error!("replica_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
