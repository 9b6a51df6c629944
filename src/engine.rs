//! The election state machine.
//!
//! One mutex guards the membership table, the phase, and the current leader;
//! every transition happens under it. Socket I/O never runs while the lock is
//! held: the engine dispatches couriers and returns, and couriers take the
//! lock only to report their result. Each election carries an epoch number so
//! reports and deadlines from an abandoned round are ignored instead of
//! cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::courier;
use crate::identity::{Identity, ListenAddress};
use crate::membership::MembershipTable;

/// Where the node stands in the current election round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    /// Fresh or reset; no election has run yet.
    Idle,
    /// An election wave is out and the acknowledgement deadline is armed.
    Electing,
    /// This node won and has announced itself.
    Leader,
    /// A higher peer acknowledged; waiting for its leader announcement.
    Follower,
}

/// Timeout and scheduling knobs.
///
/// The defaults follow the design recommendations: the acknowledgement wait
/// comfortably covers a few network round trips, a follower waits three times
/// that for the leader announcement, and connects give up well before the
/// acknowledgement deadline so a dead peer costs less than a slow one.
#[derive(Debug, Clone)]
pub struct Timing {
    /// How long an election initiator waits for any GOT_IT.
    pub t_bully: Duration,
    /// How long a follower waits for I_AM_LEADER before re-electing.
    pub t_follower: Duration,
    /// Per-peer TCP connect timeout.
    pub t_connect: Duration,
    /// Bounds of the uniformly random pause between leader probes.
    pub probe_min: Duration,
    pub probe_max: Duration,
    /// Upper bound of the random delay before a feigned failure.
    pub fail_max: Duration,
    /// Bounds of the random outage length before recovery.
    pub recover_min: Duration,
    pub recover_max: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        let t_bully = Duration::from_millis(1500);
        Self {
            t_bully,
            t_follower: 3 * t_bully,
            t_connect: t_bully / 2,
            probe_min: Duration::from_millis(500),
            probe_max: Duration::from_millis(3000),
            fail_max: Duration::from_secs(10),
            recover_min: Duration::from_secs(1),
            recover_max: Duration::from_secs(4),
        }
    }
}

struct EngineState {
    phase: ElectionPhase,
    members: MembershipTable,
    self_addr: ListenAddress,
    current_leader: Option<Identity>,
    /// Bumped whenever election bookkeeping is cleared; stale courier
    /// reports and timers carry an older value and are dropped.
    epoch: u64,
    election_deadline: Option<Instant>,
    follower_deadline: Option<Instant>,
    /// Higher peers whose exchange has not settled yet.
    pending_acks: usize,
}

/// Snapshot of a node's externally visible election state.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub identity: Identity,
    pub listen_addr: ListenAddress,
    pub phase: ElectionPhase,
    pub leader: Option<Identity>,
    pub members: usize,
}

pub struct Engine {
    identity: Identity,
    timing: Timing,
    /// Set while the node feigns failure; inbound is dropped and outbound
    /// couriers refuse to run.
    failed: AtomicBool,
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(identity: Identity, listen_addr: ListenAddress, timing: Timing) -> Self {
        let mut members = MembershipTable::new();
        members.insert(listen_addr.clone(), identity);
        Self {
            identity,
            timing,
            failed: AtomicBool::new(false),
            state: Mutex::new(EngineState {
                phase: ElectionPhase::Idle,
                members,
                self_addr: listen_addr,
                current_leader: None,
                epoch: 0,
                election_deadline: None,
                follower_deadline: None,
                pending_acks: 0,
            }),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn set_failed(&self, failed: bool) {
        self.failed.store(failed, Ordering::SeqCst);
    }

    pub fn listen_addr(&self) -> ListenAddress {
        self.state.lock().unwrap().self_addr.clone()
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.state.lock().unwrap();
        NodeStatus {
            identity: self.identity,
            listen_addr: state.self_addr.clone(),
            phase: state.phase,
            leader: state.current_leader,
            members: state.members.len(),
        }
    }

    /// The current leader and every address it is known under, for the
    /// failure detector. `None` until some election has settled.
    pub fn leader_view(&self) -> Option<(Identity, Vec<ListenAddress>)> {
        let state = self.state.lock().unwrap();
        let leader = state.current_leader?;
        Some((leader, state.members.addresses_of(leader)))
    }

    /// Folds a freshly fetched coordinator table into the membership table.
    pub fn merge_members(&self, other: &MembershipTable) {
        let mut state = self.state.lock().unwrap();
        let added = state.members.merge(other);
        if added > 0 {
            debug!(added, total = state.members.len(), "membership merged");
        }
    }

    /// Triggers an election unless one is already in progress.
    pub fn start_election(self: &Arc<Self>, reason: &str) {
        let mut state = self.state.lock().unwrap();
        if state.phase == ElectionPhase::Electing {
            debug!(reason, "election already in progress");
            return;
        }
        self.begin_election(&mut state, reason);
    }

    /// A peer's ELECT arrived: merge its table, and start our own election
    /// unless one is already running. The GOT_IT reply has already been
    /// written by the dispatcher.
    pub fn on_elect_received(self: &Arc<Self>, members: &MembershipTable) {
        let mut state = self.state.lock().unwrap();
        state.members.merge(members);
        if state.phase == ElectionPhase::Electing {
            // Re-entrancy rule: never launch a second wave mid-election.
            return;
        }
        self.begin_election(&mut state, "peer started an election");
    }

    /// Adopts an announced leader, ours or not.
    pub fn on_leader_announced(&self, leader: Identity) {
        let mut state = self.state.lock().unwrap();
        if leader < self.identity {
            // Adopted as announced; if the announcer is really weaker and
            // dead wrong, probing fails against it and re-elects.
            warn!(%leader, "adopting a leader below our own identity");
        }
        state.current_leader = Some(leader);
        state.phase = if leader == self.identity {
            ElectionPhase::Leader
        } else {
            ElectionPhase::Follower
        };
        state.epoch += 1;
        state.election_deadline = None;
        state.follower_deadline = None;
        state.pending_acks = 0;
        info!(%leader, "leader announced");
    }

    /// A courier settled one ELECT exchange.
    pub fn on_elect_ack(self: &Arc<Self>, epoch: u64, peer: &ListenAddress, got_it: bool) {
        let mut state = self.state.lock().unwrap();
        if epoch != state.epoch || state.phase != ElectionPhase::Electing {
            debug!(%peer, "stale election reply ignored");
            return;
        }
        if got_it {
            info!(%peer, "higher peer acknowledged, yielding");
            state.phase = ElectionPhase::Follower;
            state.election_deadline = None;
            state.pending_acks = 0;
            state.follower_deadline = Some(Instant::now() + self.timing.t_follower);
        } else {
            state.pending_acks = state.pending_acks.saturating_sub(1);
            debug!(%peer, remaining = state.pending_acks, "higher peer unreachable");
            let deadline_passed = state
                .election_deadline
                .is_some_and(|deadline| Instant::now() >= deadline);
            if state.pending_acks == 0 || deadline_passed {
                // Either the whole higher set is dead or the deadline has
                // already lapsed; no reason to wait for the next tick.
                self.become_leader(&mut state);
            }
        }
    }

    /// Called by the ticker and compared against wall-clock deadlines.
    pub fn check_deadlines(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        match state.phase {
            ElectionPhase::Electing => {
                if state.election_deadline.is_some_and(|deadline| now >= deadline) {
                    info!("no acknowledgement before the deadline");
                    self.become_leader(&mut state);
                }
            }
            ElectionPhase::Follower => {
                if state.follower_deadline.is_some_and(|deadline| now >= deadline) {
                    warn!("acknowledged peer never announced a leader");
                    self.begin_election(&mut state, "leader announcement timed out");
                }
            }
            _ => {}
        }
    }

    /// Puts the engine back to a just-started state under a fresh listen
    /// address. Old addresses stay in the table as dead entries.
    pub fn reset_after_recovery(&self, new_addr: ListenAddress) {
        let mut state = self.state.lock().unwrap();
        state.phase = ElectionPhase::Idle;
        state.current_leader = None;
        state.epoch += 1;
        state.election_deadline = None;
        state.follower_deadline = None;
        state.pending_acks = 0;
        state.members.insert(new_addr.clone(), self.identity);
        state.self_addr = new_addr;
    }

    fn begin_election(self: &Arc<Self>, state: &mut EngineState, reason: &str) {
        state.epoch += 1;
        state.phase = ElectionPhase::Electing;
        state.current_leader = None;
        state.follower_deadline = None;

        let higher = state.members.higher_peers(self.identity);
        info!(reason, higher = higher.len(), "election started");
        if higher.is_empty() {
            self.become_leader(state);
            return;
        }

        state.pending_acks = higher.len();
        state.election_deadline = Some(Instant::now() + self.timing.t_bully);
        let snapshot = state.members.clone();
        for (addr, peer_id) in higher {
            courier::spawn_elect(Arc::clone(self), state.epoch, addr, peer_id, snapshot.clone());
        }
    }

    fn become_leader(self: &Arc<Self>, state: &mut EngineState) {
        state.phase = ElectionPhase::Leader;
        state.current_leader = Some(self.identity);
        state.election_deadline = None;
        state.follower_deadline = None;
        state.pending_acks = 0;

        let peers = state.members.peers_except(&state.self_addr);
        info!(peers = peers.len(), "won the election, announcing leadership");
        for addr in peers {
            courier::spawn_announce(Arc::clone(self), addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    /// A peer endpoint that accepts connections but never replies, so
    /// courier exchanges stay pending until their read deadline.
    fn silent_peer() -> (TcpListener, ListenAddress) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind silent peer");
        let addr = ListenAddress::from(listener.local_addr().expect("local addr"));
        (listener, addr)
    }

    fn engine_with_higher_peer(t_bully: Duration) -> (Arc<Engine>, TcpListener, ListenAddress) {
        let (listener, peer_addr) = silent_peer();
        let timing = Timing {
            t_bully,
            t_follower: 3 * t_bully,
            t_connect: Duration::from_millis(100),
            ..Timing::default()
        };
        let engine = Arc::new(Engine::new(
            Identity::new(10, 100),
            ListenAddress::new("127.0.0.1", 1),
            timing,
        ));
        let mut higher = MembershipTable::new();
        higher.insert(peer_addr.clone(), Identity::new(20, 50));
        engine.merge_members(&higher);
        (engine, listener, peer_addr)
    }

    fn epoch_of(engine: &Engine) -> u64 {
        engine.state.lock().unwrap().epoch
    }

    #[test]
    fn singleton_wins_immediately_without_couriers() {
        let engine = Arc::new(Engine::new(
            Identity::new(10, 100),
            ListenAddress::new("127.0.0.1", 1),
            Timing::default(),
        ));
        engine.start_election("join");

        let status = engine.status();
        assert_eq!(status.phase, ElectionPhase::Leader);
        assert_eq!(status.leader, Some(Identity::new(10, 100)));
        assert_eq!(status.members, 1);
    }

    #[test]
    fn acknowledgement_yields_to_follower() {
        let (engine, _peer, peer_addr) = engine_with_higher_peer(Duration::from_secs(5));
        engine.start_election("join");
        assert_eq!(engine.status().phase, ElectionPhase::Electing);

        let epoch = epoch_of(&engine);
        engine.on_elect_ack(epoch, &peer_addr, true);

        let status = engine.status();
        assert_eq!(status.phase, ElectionPhase::Follower);
        assert_eq!(status.leader, None);
    }

    #[test]
    fn unreachable_higher_set_wins_before_the_deadline() {
        let (engine, _peer, peer_addr) = engine_with_higher_peer(Duration::from_secs(5));
        engine.start_election("join");

        let epoch = epoch_of(&engine);
        engine.on_elect_ack(epoch, &peer_addr, false);

        assert_eq!(engine.status().phase, ElectionPhase::Leader);
        assert_eq!(engine.status().leader, Some(Identity::new(10, 100)));
    }

    #[test]
    fn stale_reports_are_ignored() {
        let (engine, _peer, peer_addr) = engine_with_higher_peer(Duration::from_secs(5));
        engine.start_election("join");

        let epoch = epoch_of(&engine);
        engine.on_elect_ack(epoch - 1, &peer_addr, true);
        assert_eq!(engine.status().phase, ElectionPhase::Electing);

        engine.on_leader_announced(Identity::new(20, 50));
        // The announcement cleared the round; the late acknowledgement from
        // the abandoned wave must not disturb the settled state.
        engine.on_elect_ack(epoch, &peer_addr, true);
        assert_eq!(engine.status().phase, ElectionPhase::Follower);
        assert_eq!(engine.status().leader, Some(Identity::new(20, 50)));
    }

    #[test]
    fn elect_received_mid_election_starts_no_second_wave() {
        let (engine, _peer, _peer_addr) = engine_with_higher_peer(Duration::from_secs(5));
        engine.start_election("join");
        let epoch = epoch_of(&engine);

        let (_other_listener, other_addr) = silent_peer();
        let mut incoming = MembershipTable::new();
        incoming.insert(other_addr, Identity::new(5, 200));
        engine.on_elect_received(&incoming);

        assert_eq!(engine.status().phase, ElectionPhase::Electing);
        assert_eq!(epoch_of(&engine), epoch);
        assert_eq!(engine.status().members, 3);
    }

    #[test]
    fn election_deadline_promotes_to_leader() {
        let (engine, _peer, _peer_addr) = engine_with_higher_peer(Duration::from_millis(50));
        engine.start_election("join");

        std::thread::sleep(Duration::from_millis(120));
        engine.check_deadlines();

        assert_eq!(engine.status().phase, ElectionPhase::Leader);
    }

    #[test]
    fn silent_acknowledger_triggers_reelection() {
        let (engine, _peer, peer_addr) = engine_with_higher_peer(Duration::from_millis(50));
        engine.start_election("join");

        let epoch = epoch_of(&engine);
        engine.on_elect_ack(epoch, &peer_addr, true);
        assert_eq!(engine.status().phase, ElectionPhase::Follower);

        std::thread::sleep(Duration::from_millis(200));
        engine.check_deadlines();

        // The follower deadline passed with no announcement, so a fresh
        // election round began.
        assert_eq!(engine.status().phase, ElectionPhase::Electing);
        assert!(epoch_of(&engine) > epoch);
    }

    #[test]
    fn leader_announcement_overrides_any_phase() {
        let (engine, _peer, _peer_addr) = engine_with_higher_peer(Duration::from_secs(5));
        engine.start_election("join");
        engine.on_leader_announced(Identity::new(20, 50));

        let status = engine.status();
        assert_eq!(status.phase, ElectionPhase::Follower);
        assert_eq!(status.leader, Some(Identity::new(20, 50)));

        // An announcement naming ourselves makes us leader.
        engine.on_leader_announced(Identity::new(10, 100));
        assert_eq!(engine.status().phase, ElectionPhase::Leader);
    }

    #[test]
    fn recovery_resets_under_the_new_address() {
        let (engine, _peer, _peer_addr) = engine_with_higher_peer(Duration::from_secs(5));
        engine.start_election("join");
        engine.on_leader_announced(Identity::new(20, 50));

        let new_addr = ListenAddress::new("127.0.0.1", 2);
        engine.reset_after_recovery(new_addr.clone());

        let status = engine.status();
        assert_eq!(status.phase, ElectionPhase::Idle);
        assert_eq!(status.leader, None);
        assert_eq!(status.listen_addr, new_addr);
        // The old self entry stays behind as a dead address.
        assert_eq!(status.members, 3);
    }
}
