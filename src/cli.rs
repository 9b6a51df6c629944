use clap::{Args, Parser, Subcommand};

use crate::identity::ListenAddress;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one election participant.
    Node(NodeArgs),
    /// Run the group coordinator daemon that participants rendezvous at.
    Gcd(GcdArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Address of the group coordinator, e.g. 127.0.0.1:50600.
    #[arg(long)]
    pub gcd: ListenAddress,

    /// Address to accept peer connections on. Port 0 picks a free port.
    #[arg(long, default_value = "127.0.0.1:0")]
    pub listen: ListenAddress,

    /// Days until the mother's birthday; the first identity component.
    #[arg(long)]
    pub days: u32,

    /// Student ID; breaks ties between equal day counts.
    #[arg(long)]
    pub student_id: u64,

    /// Probe the leader and re-elect when it stops answering.
    #[arg(long)]
    pub probe_leader: bool,

    /// Randomly feign failure and recover, like a crashing process.
    #[arg(long)]
    pub feign_failures: bool,
}

#[derive(Args, Debug, Clone)]
pub struct GcdArgs {
    /// Socket address the coordinator should bind to.
    #[arg(long, default_value = "127.0.0.1:50600")]
    pub listen: ListenAddress,
}
