//! A single participant in a fully connected peer group that elects its
//! leader with the Bully algorithm.
//!
//! Each node joins through a Group Coordinator Daemon (HOWDY), learns the
//! membership, and elects: ELECT goes to every higher-identity peer, any
//! GOT_IT means yielding to the higher set, silence means victory and an
//! I_AM_LEADER broadcast. Followers optionally probe the leader and re-elect
//! when it dies, and a node can feign failure to exercise exactly the
//! recovery path a crashed-and-restarted process would take.
//!
//! # Architecture
//!
//! The process is plain threads over blocking TCP:
//!
//! - **Listener thread**: accepts peer connections, one short-lived handler
//!   thread per connection
//! - **Courier threads**: one per outbound message, so no peer's latency is
//!   ever visible to another peer
//! - **Ticker thread**: re-checks the engine's election and follower
//!   deadlines
//! - **Optional loops**: leader probing and the feigned-failure driver
//!
//! All election state lives behind a single mutex inside [`engine::Engine`];
//! transitions are serialized there and no socket I/O happens under the
//! lock. Stale work is discarded by an election epoch counter instead of
//! being cancelled.
//!
//! # Modules
//!
//! - [`identity`]: identities and listen addresses
//! - [`membership`]: the grow-only address-to-identity table
//! - [`message`]: length-prefixed JSON wire codec
//! - [`engine`]: the election state machine
//! - [`courier`]: outbound workers
//! - [`listener`]: inbound accept loop and dispatch
//! - [`gcd`]: coordinator client and the coordinator itself
//! - [`failure`]: leader probing and feigned failure
//! - [`node`]: runtime glue and the public handle
//! - [`cli`]: command-line surface

pub mod cli;
pub mod courier;
pub mod engine;
pub mod failure;
pub mod gcd;
pub mod identity;
pub mod listener;
pub mod membership;
pub mod message;
pub mod node;
