//! Outbound couriers.
//!
//! Every peer exchange runs on its own short-lived thread, so one dead or
//! slow peer never delays the engine or another peer. A courier opens a
//! fresh connection, writes one message, optionally reads the one-word
//! acknowledgement, and reports back through the engine lock. Transport
//! failures are the expected way of discovering a dead peer and are logged
//! at debug only.

use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

use tracing::debug;

use crate::engine::{Engine, Timing};
use crate::identity::{Identity, ListenAddress};
use crate::membership::MembershipTable;
use crate::message::{self, PeerMessage};

/// Sends one ELECT to one higher peer and reports whether it answered
/// GOT_IT. The report is dropped by the engine if the election has moved on.
pub(crate) fn spawn_elect(
    engine: Arc<Engine>,
    epoch: u64,
    peer: ListenAddress,
    peer_id: Identity,
    members: MembershipTable,
) {
    thread::Builder::new()
        .name(format!("elect-{peer}"))
        .spawn(move || {
            if engine.is_failed() {
                return;
            }
            let message = PeerMessage::Elect { members };
            let got_it = match exchange(&peer, engine.timing(), &message) {
                Ok(acked) => acked,
                Err(err) => {
                    debug!(%peer, %peer_id, error = %err, "election message failed");
                    false
                }
            };
            engine.on_elect_ack(epoch, &peer, got_it);
        })
        .expect("failed to spawn elect courier");
}

/// Broadcast half of winning: one I_AM_LEADER per peer, no reply expected.
pub(crate) fn spawn_announce(engine: Arc<Engine>, peer: ListenAddress) {
    thread::Builder::new()
        .name(format!("announce-{peer}"))
        .spawn(move || {
            if engine.is_failed() {
                return;
            }
            let message = PeerMessage::IAmLeader {
                identity: engine.identity(),
            };
            if let Err(err) = send_only(&peer, engine.timing(), &message) {
                debug!(%peer, error = %err, "leader announcement failed");
            }
        })
        .expect("failed to spawn announce courier");
}

/// Synchronous liveness check used by the failure detector, which already
/// runs on its own thread.
pub fn probe(peer: &ListenAddress, timing: &Timing) -> bool {
    matches!(exchange(peer, timing, &PeerMessage::Probe), Ok(true))
}

fn connect(peer: &ListenAddress, timing: &Timing) -> io::Result<TcpStream> {
    let addr = peer
        .socket_addr()
        .map_err(|err| io::Error::new(io::ErrorKind::AddrNotAvailable, err.to_string()))?;
    let stream = TcpStream::connect_timeout(&addr, timing.t_connect)?;
    stream.set_read_timeout(Some(timing.t_bully))?;
    stream.set_write_timeout(Some(timing.t_bully))?;
    Ok(stream)
}

fn exchange(peer: &ListenAddress, timing: &Timing, message: &PeerMessage) -> io::Result<bool> {
    let mut stream = connect(peer, timing)?;
    message::write_message(&mut stream, message)?;
    message::read_ack(&mut stream)
}

fn send_only(peer: &ListenAddress, timing: &Timing, message: &PeerMessage) -> io::Result<()> {
    let mut stream = connect(peer, timing)?;
    message::write_message(&mut stream, message)
}
