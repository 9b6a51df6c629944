//! Node runtime: wires the listener, the engine, and the background loops
//! together.
//!
//! `spawn_node` binds the listener first (so an OS-assigned port is known),
//! joins the group through the coordinator, and kicks off the initial
//! election. A small ticker thread re-checks the engine's deadlines; courier
//! reports are the other path that advances them, so a deadline is never
//! missed by more than one tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{info, warn};

use crate::engine::{Engine, NodeStatus, Timing};
use crate::failure;
use crate::gcd;
use crate::identity::{Identity, ListenAddress};
use crate::listener::Listener;

/// How often the ticker re-checks election and follower deadlines. Small
/// against every supported `t_bully`, so expiry latency stays negligible.
const TICK_INTERVAL: Duration = Duration::from_millis(25);

/// Everything needed to start one participant.
pub struct NodeConfig {
    /// Address of the group coordinator daemon.
    pub gcd: ListenAddress,
    /// Address to accept peer connections on; port 0 picks a free port.
    pub listen: ListenAddress,
    pub identity: Identity,
    pub timing: Timing,
    /// Probe the leader and re-elect when it stops answering.
    pub probe_leader: bool,
    /// Randomly feign failure and recover.
    pub feign_failures: bool,
}

pub(crate) struct Node {
    engine: Arc<Engine>,
    gcd: ListenAddress,
    listener: Mutex<Option<Listener>>,
    shutdown: AtomicBool,
    ticker_stop: Sender<()>,
}

impl Node {
    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Fetches a fresh table from the coordinator and merges it. Failures
    /// are tolerated; the next probe cycle retries.
    pub(crate) fn refresh_membership(&self) {
        let listen = self.engine.listen_addr();
        match gcd::join(&self.gcd, self.engine.identity(), &listen, self.engine.timing()) {
            Ok(members) => self.engine.merge_members(&members),
            Err(err) => warn!(error = %err, "re-join with the coordinator failed"),
        }
    }

    pub(crate) fn rejoin_and_elect(&self, reason: &str) {
        self.refresh_membership();
        self.engine.start_election(reason);
    }

    /// Takes the node down: the listener stops accepting and couriers are
    /// inhibited. To peers this is indistinguishable from a crash.
    pub(crate) fn fail(&self) {
        if self.engine.is_failed() {
            return;
        }
        info!(identity = %self.engine.identity(), "feigning failure");
        self.engine.set_failed(true);
        let listener = self.listener.lock().unwrap().take();
        if let Some(listener) = listener {
            listener.stop();
        }
    }

    /// Brings the node back on a fresh port, as a restarted process would:
    /// engine reset to idle, re-join, fresh election.
    pub(crate) fn recover(&self) -> Result<()> {
        if !self.engine.is_failed() {
            return Ok(());
        }
        let host = self.engine.listen_addr().host;
        let pending = Listener::bind(&ListenAddress::new(host, 0))?;
        let local = pending.local_addr().clone();
        let listener = pending.start(Arc::clone(&self.engine))?;
        *self.listener.lock().unwrap() = Some(listener);

        self.engine.reset_after_recovery(local.clone());
        self.engine.set_failed(false);
        info!(listen = %local, "recovered from feigned failure");
        self.rejoin_and_elect("recovered");
        Ok(())
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        // Inhibit couriers and handlers first so the node goes quiet, then
        // release the port and stop the ticker.
        self.engine.set_failed(true);
        let listener = self.listener.lock().unwrap().take();
        if let Some(listener) = listener {
            listener.stop();
        }
        let _ = self.ticker_stop.send(());
        info!(identity = %self.engine.identity(), "node shut down");
    }
}

/// Handle for observing and controlling a running node.
pub struct NodeHandle {
    node: Arc<Node>,
}

impl NodeHandle {
    pub fn status(&self) -> NodeStatus {
        self.node.engine.status()
    }

    pub fn identity(&self) -> Identity {
        self.node.engine.identity()
    }

    pub fn listen_addr(&self) -> ListenAddress {
        self.node.engine.listen_addr()
    }

    /// Feigns failure now. The randomized driver uses the same primitive.
    pub fn fail(&self) {
        self.node.fail();
    }

    /// Recovers from a feigned failure now.
    pub fn recover(&self) -> Result<()> {
        self.node.recover()
    }

    /// Stops the listener, the ticker and the background loops. Idempotent.
    pub fn shutdown(&self) {
        self.node.shutdown();
    }
}

/// Starts a node: listener, coordinator join, initial election, background
/// loops. Fails fast when the listener cannot bind or the coordinator is
/// unreachable.
pub fn spawn_node(config: NodeConfig) -> Result<NodeHandle> {
    let pending = Listener::bind(&config.listen)?;
    let local = pending.local_addr().clone();
    let engine = Arc::new(Engine::new(config.identity, local.clone(), config.timing));
    let listener = pending.start(Arc::clone(&engine))?;
    info!(listen = %local, identity = %config.identity, "listening");

    let members = gcd::join(&config.gcd, config.identity, &local, engine.timing())
        .context("initial join with the coordinator failed")?;
    engine.merge_members(&members);

    let (ticker_stop, ticker_stop_rx) = unbounded();
    spawn_ticker(Arc::clone(&engine), ticker_stop_rx)?;

    let node = Arc::new(Node {
        engine: Arc::clone(&engine),
        gcd: config.gcd,
        listener: Mutex::new(Some(listener)),
        shutdown: AtomicBool::new(false),
        ticker_stop,
    });

    engine.start_election("join");

    if config.probe_leader {
        failure::spawn_probe_loop(Arc::clone(&node));
    }
    if config.feign_failures {
        failure::spawn_failure_driver(Arc::clone(&node));
    }

    Ok(NodeHandle { node })
}

fn spawn_ticker(engine: Arc<Engine>, stop: Receiver<()>) -> Result<()> {
    std::thread::Builder::new()
        .name("election-ticker".into())
        .spawn(move || {
            let mut last_tick = Instant::now();
            loop {
                // Sleep out the remainder of the interval, but wake early if
                // shutdown arrives.
                let timeout = TICK_INTERVAL
                    .checked_sub(last_tick.elapsed())
                    .unwrap_or(Duration::from_secs(0));
                crossbeam_channel::select! {
                    recv(stop) -> _ => break,
                    default(timeout) => {}
                }
                if last_tick.elapsed() >= TICK_INTERVAL {
                    engine.check_deadlines();
                    last_tick = Instant::now();
                }
            }
        })
        .context("failed to spawn election ticker")?;
    Ok(())
}
