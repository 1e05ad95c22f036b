//! QuorumKV coordinator entry point.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use quorumkv::{logger_init, pf_error, Coordinator, KvError, ReplicaInfo, ME};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening socket.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Client-facing API port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 8080)]
    api_port: u16,

    /// Replica in the cluster as 'name=host:port'; repeat once per replica.
    /// Defaults to NodeA/NodeB/NodeC on localhost ports 8081-8083.
    #[arg(short, long)]
    replica: Vec<String>,

    /// Configuration in TOML format string.
    #[arg(short, long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return the parsed cluster membership
    /// on success or `Err(KvError)` on any error.
    fn sanitize(&self) -> Result<Vec<ReplicaInfo>, KvError> {
        if self.api_port <= 1024 {
            return Err(KvError::msg(format!(
                "invalid api_port {}",
                self.api_port
            )));
        }
        if self.threads < 2 {
            return Err(KvError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        let specs: Vec<String> = if self.replica.is_empty() {
            vec![
                "NodeA=127.0.0.1:8081".into(),
                "NodeB=127.0.0.1:8082".into(),
                "NodeC=127.0.0.1:8083".into(),
            ]
        } else {
            self.replica.clone()
        };

        let mut replicas = Vec::with_capacity(specs.len());
        for spec in &specs {
            let (name, addr) = spec.split_once('=').ok_or_else(|| {
                KvError::msg(format!("invalid replica spec '{}'", spec))
            })?;
            if name.is_empty() {
                return Err(KvError::msg(format!(
                    "empty replica name in '{}'",
                    spec
                )));
            }
            if replicas.iter().any(|r: &ReplicaInfo| r.name == name) {
                return Err(KvError::msg(format!(
                    "duplicate replica name '{}'",
                    name
                )));
            }
            replicas.push(ReplicaInfo {
                name: name.into(),
                addr: addr.parse()?,
            });
        }
        Ok(replicas)
    }
}

/// Actual main function of the coordinator.
fn coordinator_main() -> Result<(), KvError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let replicas = args.sanitize()?;

    // parse client-facing API address
    let api_addr: SocketAddr = format!("{}:{}", args.bind_ip, args.api_port)
        .parse()
        .map_err(|e| {
            KvError::msg(format!(
                "failed to parse api_addr: bind_ip {} port {}: {}",
                args.bind_ip, args.api_port, e
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
            .thread_name("tokio-worker-coordinator")
            .build()?;

        // enter tokio runtime, set up the coordinator, and start the main
        // event loop logic
        runtime.block_on(async move {
            let mut coordinator = Coordinator::new_and_setup(
                api_addr,
                replicas,
                args.config.as_deref(),
            )
            .await?;

            coordinator.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), KvError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the coordinator.
fn main() -> ExitCode {
    logger_init();
    let _ = ME.set("coord".into());

    if let Err(ref e) = coordinator_main() {
        pf_error!("coordinator_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
