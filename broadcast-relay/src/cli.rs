use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::{server::DEFAULT_MAX_SESSIONS, wire::Framing};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, broadcasting every message to all other connections.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, env = "RELAY_LISTEN", default_value = "127.0.0.1:12345")]
    pub listen: SocketAddr,

    /// Maximum number of connections served at once; further peers wait in the backlog.
    #[arg(long, env = "RELAY_MAX_SESSIONS", default_value_t = DEFAULT_MAX_SESSIONS)]
    pub max_sessions: usize,

    /// How messages are delimited on the wire. Clients must use the same setting.
    #[arg(long, env = "RELAY_FRAMING", value_enum, default_value_t = Framing::Chunk)]
    pub framing: Framing,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, env = "RELAY_SERVER", default_value = "127.0.0.1:12345")]
    pub server: SocketAddr,

    /// Display name; prompted for on stdin when omitted.
    #[arg(long, env = "RELAY_NAME")]
    pub name: Option<String>,

    /// How messages are delimited on the wire. Must match the server.
    #[arg(long, env = "RELAY_FRAMING", value_enum, default_value_t = Framing::Chunk)]
    pub framing: Framing,
}
