//! Multi-client TCP broadcast relay and its terminal client.
//!
//! The relay accepts connections, takes the first payload from each as the
//! peer's display name, and forwards every later payload to all other
//! connections as `[name]: text`. Join and leave notices are sent as
//! `[SERVER]: ...` to everyone.
//!
//! - [`cli`] parses the command line for server and client modes.
//! - [`wire`] reads and writes payloads in raw-chunk or newline framing.
//! - [`registry`] is the single locked table of live connections.
//! - [`broadcast`] fans a message out and evicts connections that fail.
//! - [`session`] runs the per-connection state machine and socket writer.
//! - [`server`] accepts connections under an admission cap and shuts down.
//! - [`client`] runs the concurrent send and receive paths for a terminal user.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;
pub mod wire;
