//! Fixtures for testing tunnels without real sockets: an in-memory network with links that can
//!  be paused or severed, an uppercasing echo service, and a connector following a per-address
//!  script.

pub mod echo_server;
pub mod memory_net;
pub mod scripted_connector;
