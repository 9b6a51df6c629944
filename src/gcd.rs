//! The Group Coordinator Daemon and its client half.
//!
//! Nodes rendezvous through the coordinator: a HOWDY carries the joiner's
//! identity and listen address, and the reply is the full membership table,
//! dead entries included. Only [`join`] is part of the node proper; the
//! server backs the `gcd` subcommand and the integration tests.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::engine::Timing;
use crate::identity::{Identity, ListenAddress};
use crate::membership::MembershipTable;
use crate::message::{self, PeerMessage};

/// Sends HOWDY and returns the coordinator's view of the group, with this
/// node folded in whether or not the coordinator already knew it.
pub fn join(
    gcd: &ListenAddress,
    identity: Identity,
    listen: &ListenAddress,
    timing: &Timing,
) -> Result<MembershipTable> {
    let addr = gcd.socket_addr()?;
    let mut stream = TcpStream::connect_timeout(&addr, timing.t_connect)
        .with_context(|| format!("cannot reach coordinator at {gcd}"))?;
    stream.set_read_timeout(Some(timing.t_bully))?;
    stream.set_write_timeout(Some(timing.t_bully))?;

    message::write_message(
        &mut stream,
        &PeerMessage::Howdy {
            identity,
            listen: listen.clone(),
        },
    )
    .context("failed to send HOWDY")?;
    let mut members: MembershipTable =
        message::read_json(&mut stream).context("bad membership reply from coordinator")?;
    members.insert(listen.clone(), identity);
    Ok(members)
}

/// A minimal coordinator: remembers every address that ever joined and
/// answers each HOWDY with the accumulated table.
pub struct GcdServer {
    local_addr: ListenAddress,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GcdServer {
    pub fn spawn(addr: &ListenAddress) -> Result<Self> {
        let tcp = TcpListener::bind((addr.host.as_str(), addr.port))
            .with_context(|| format!("failed to bind coordinator on {addr}"))?;
        let port = tcp
            .local_addr()
            .context("coordinator has no local address")?
            .port();
        let local_addr = ListenAddress::new(addr.host.clone(), port);

        let members = Arc::new(Mutex::new(MembershipTable::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("gcd-{local_addr}"))
            .spawn(move || {
                for stream in tcp.incoming() {
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            let members = Arc::clone(&members);
                            thread::spawn(move || {
                                if let Err(err) = handle_join(stream, &members) {
                                    debug!(error = %err, "coordinator connection failed");
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "coordinator accept failed"),
                    }
                }
            })
            .context("failed to spawn coordinator thread")?;

        Ok(Self {
            local_addr,
            stop,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> &ListenAddress {
        &self.local_addr
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Ok(addr) = self.local_addr.socket_addr() {
            let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(100));
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_join(mut stream: TcpStream, members: &Mutex<MembershipTable>) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;
    match message::read_message(&mut stream)? {
        PeerMessage::Howdy { identity, listen } => {
            let table = {
                let mut members = members.lock().unwrap();
                if members.insert(listen.clone(), identity) {
                    info!(member = %listen, %identity, total = members.len(), "member joined");
                }
                members.clone()
            };
            message::write_json(&mut stream, &table)
        }
        other => {
            warn!(?other, "coordinator ignoring a non-HOWDY message");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_accumulates_and_echoes_membership() {
        let server = GcdServer::spawn(&ListenAddress::new("127.0.0.1", 0)).expect("spawn gcd");
        let gcd_addr = server.local_addr().clone();
        let timing = Timing::default();

        let a_addr = ListenAddress::new("127.0.0.1", 61001);
        let b_addr = ListenAddress::new("127.0.0.1", 61002);

        let first = join(&gcd_addr, Identity::new(10, 100), &a_addr, &timing).expect("join a");
        assert_eq!(first.len(), 1);

        let second = join(&gcd_addr, Identity::new(5, 200), &b_addr, &timing).expect("join b");
        assert_eq!(second.len(), 2);
        assert_eq!(second.addresses_of(Identity::new(10, 100)), vec![a_addr]);

        server.stop();
    }

    #[test]
    fn join_includes_self_even_on_an_empty_reply() {
        let server = GcdServer::spawn(&ListenAddress::new("127.0.0.1", 0)).expect("spawn gcd");
        let gcd_addr = server.local_addr().clone();

        let addr = ListenAddress::new("127.0.0.1", 61003);
        let table = join(&gcd_addr, Identity::new(1, 1), &addr, &Timing::default()).expect("join");
        assert_eq!(table.addresses_of(Identity::new(1, 1)), vec![addr]);

        server.stop();
    }
}
