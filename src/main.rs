use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bully_election::cli::{Cli, Command};
use bully_election::engine::Timing;
use bully_election::gcd::GcdServer;
use bully_election::identity::Identity;
use bully_election::node::{NodeConfig, spawn_node};

fn main() -> Result<()> {
    // Couriers, handlers and the listener are all named threads; showing the
    // name is what keeps interleaved election logs readable.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bully_election=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Node(args) => {
            let handle = spawn_node(NodeConfig {
                gcd: args.gcd,
                listen: args.listen,
                identity: Identity::new(args.days, args.student_id),
                timing: Timing::default(),
                probe_leader: args.probe_leader,
                feign_failures: args.feign_failures,
            })?;
            info!(listen = %handle.listen_addr(), "node running, Ctrl-C to stop");
            loop {
                std::thread::park();
            }
        }
        Command::Gcd(args) => {
            let server = GcdServer::spawn(&args.listen)?;
            info!(listen = %server.local_addr(), "coordinator running, Ctrl-C to stop");
            loop {
                std::thread::park();
            }
        }
    }
}
