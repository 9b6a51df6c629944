//! Inbound TCP listener and message dispatch.
//!
//! The accept loop hands every connection to a fresh handler thread, so the
//! listener keeps serving while an election is in flight - which is exactly
//! when acknowledgements and competing ELECTs arrive. A handler reads one
//! frame, writes the reply where the protocol has one, and hands the message
//! to the engine. Malformed frames drop the connection and leave the engine
//! untouched.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::identity::ListenAddress;
use crate::message::{self, PeerMessage};

/// A bound socket that is not accepting yet. Binding first lets the caller
/// learn the OS-assigned port before the engine that handlers need exists.
pub struct PendingListener {
    tcp: TcpListener,
    local_addr: ListenAddress,
}

impl PendingListener {
    pub fn local_addr(&self) -> &ListenAddress {
        &self.local_addr
    }

    /// Starts the accept loop.
    pub fn start(self, engine: Arc<Engine>) -> Result<Listener> {
        let PendingListener { tcp, local_addr } = self;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("listener-{local_addr}"))
            .spawn(move || {
                for stream in tcp.incoming() {
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            let engine = Arc::clone(&engine);
                            thread::spawn(move || {
                                if let Err(err) = handle_connection(stream, &engine) {
                                    debug!(error = %err, "connection handler failed");
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
            })
            .context("failed to spawn listener thread")?;
        Ok(Listener {
            local_addr,
            stop,
            handle: Some(handle),
        })
    }
}

/// The accept loop plus the knob to stop it, so feigned failure can take the
/// port down and recovery can bind a fresh one.
pub struct Listener {
    local_addr: ListenAddress,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    /// Binds `addr`; port 0 asks the OS for a free port, visible through
    /// [`PendingListener::local_addr`].
    pub fn bind(addr: &ListenAddress) -> Result<PendingListener> {
        let tcp = TcpListener::bind((addr.host.as_str(), addr.port))
            .with_context(|| format!("failed to bind listener on {addr}"))?;
        let port = tcp
            .local_addr()
            .context("listener has no local address")?
            .port();
        Ok(PendingListener {
            tcp,
            local_addr: ListenAddress::new(addr.host.clone(), port),
        })
    }

    pub fn local_addr(&self) -> &ListenAddress {
        &self.local_addr
    }

    /// Stops the accept loop and releases the port.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // The loop is parked in accept; poke it so it observes the flag.
        if let Ok(addr) = self.local_addr.socket_addr() {
            let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(100));
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_connection(mut stream: TcpStream, engine: &Arc<Engine>) -> io::Result<()> {
    if engine.is_failed() {
        // A feigning node must look exactly like a crashed one: no reply.
        return Ok(());
    }
    stream.set_read_timeout(Some(engine.timing().t_bully))?;
    stream.set_write_timeout(Some(engine.timing().t_bully))?;
    let message = message::read_message(&mut stream)?;
    dispatch(stream, message, engine)
}

fn dispatch(mut stream: TcpStream, message: PeerMessage, engine: &Arc<Engine>) -> io::Result<()> {
    match message {
        PeerMessage::Elect { members } => {
            // Acknowledge before any election work, so the sender's read
            // deadline only ever measures the network.
            message::write_ack(&mut stream)?;
            drop(stream);
            engine.on_elect_received(&members);
        }
        PeerMessage::IAmLeader { identity } => {
            drop(stream);
            engine.on_leader_announced(identity);
        }
        PeerMessage::Probe => {
            message::write_ack(&mut stream)?;
        }
        PeerMessage::Howdy { .. } => {
            warn!("unexpected HOWDY from a peer; this node is not a coordinator");
        }
    }
    Ok(())
}
