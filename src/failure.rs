//! Failure detection and feigned failure.
//!
//! The failure detector probes the leader at random intervals and, when the
//! leader stops answering, refreshes membership from the coordinator and
//! triggers an election. The feigned-failure driver randomly takes the node
//! down and brings it back, exercising the same recovery path a real crash
//! and restart would.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::courier;
use crate::node::Node;

fn sleep_between(min: Duration, max: Duration) {
    let min = min.as_millis() as u64;
    let max = max.as_millis() as u64;
    let millis = rand::rng().random_range(min..=max);
    thread::sleep(Duration::from_millis(millis));
}

/// Probes the current leader until shutdown. Runs only when the operator
/// asked for leader probing.
pub(crate) fn spawn_probe_loop(node: Arc<Node>) {
    thread::Builder::new()
        .name("leader-probe".into())
        .spawn(move || {
            loop {
                let timing = node.engine().timing().clone();
                sleep_between(timing.probe_min, timing.probe_max);
                if node.is_shutdown() {
                    break;
                }
                if node.engine().is_failed() {
                    continue;
                }
                let Some((leader, addrs)) = node.engine().leader_view() else {
                    continue;
                };
                if leader == node.engine().identity() {
                    continue;
                }
                if addrs.is_empty() {
                    // The announcement carried only an identity; fetch the
                    // table again so the leader becomes probeable.
                    node.refresh_membership();
                    continue;
                }
                if addrs.iter().any(|addr| courier::probe(addr, &timing)) {
                    continue;
                }
                warn!(%leader, "leader stopped answering probes");
                node.rejoin_and_elect("leader probe failed");
            }
        })
        .expect("failed to spawn probe loop");
}

/// Randomly feigns failure and recovers, forever. Runs only when the
/// operator asked for it.
pub(crate) fn spawn_failure_driver(node: Arc<Node>) {
    thread::Builder::new()
        .name("failure-driver".into())
        .spawn(move || {
            loop {
                let timing = node.engine().timing().clone();
                sleep_between(Duration::ZERO, timing.fail_max);
                if node.is_shutdown() {
                    break;
                }
                node.fail();
                sleep_between(timing.recover_min, timing.recover_max);
                if node.is_shutdown() {
                    break;
                }
                if let Err(err) = node.recover() {
                    warn!(error = %err, "recovery from feigned failure did not complete");
                }
            }
        })
        .expect("failed to spawn failure driver");
}
