//! Plaintext TCP chat relay: every line a client sends is broadcast to all
//! connected clients, with joins and departures announced along the way.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface (an optional listen port).
//! - [`registry`] is the concurrency-safe set of live connections and the
//!   only shared mutable state in the process.
//! - [`router`] fans each inbound line out to the current membership without
//!   ever blocking on a peer's socket.
//! - [`connection`] drives one client from accept to close: line framing, a
//!   bounded outbound queue served by a dedicated writer task, and explicit
//!   teardown.
//! - [`server`] binds the listener, accepts sockets, and owns shutdown.
//!
//! Integration tests use this crate directly to run a server on an ephemeral
//! port and exercise the wire protocol with raw TCP clients.

pub mod cli;
pub mod connection;
pub mod registry;
pub mod router;
pub mod server;
