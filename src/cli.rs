//! Command line interface for the `wirebridge` echo server.
//!
//! Shared with the build script, which renders the man page from it.

use std::net::SocketAddr;

use clap::Parser;

/// Command line arguments for the `wirebridge` binary.
#[derive(Debug, Parser)]
#[command(
    name = "wirebridge",
    version,
    about = "TCP echo server built on the wirebridge async bridge"
)]
pub struct Cli {
    /// Address to accept connections on.
    #[arg(short, long, default_value = "127.0.0.1:7878")]
    pub listen: SocketAddr,

    /// Readiness events handled per event-loop turn.
    #[arg(long, default_value_t = 1024)]
    pub events_capacity: usize,
}
