//! termbridge: bridges WebSocket terminals to local processes.
//!
//! A browser terminal connects to the upgrade path, names a stored session
//! in its first message, and is then wired to a freshly spawned process
//! (normally an ssh client) until either side goes away. Sessions are
//! managed over a small JSON API on the same port.

pub mod api;
pub mod bridge;
pub mod config;
pub mod control;
pub mod frame;
pub mod handshake;
pub mod process;
pub mod server;
pub mod session;
