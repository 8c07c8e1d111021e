//! ccw - a remote control-plane agent.
//!
//! Exposes a host's filesystem, sockets and processes to an authenticated
//! operator. Long-lived sessions (interactive shells, filesystem watches and
//! port monitors) are multiplexed over one WebSocket per client and torn down
//! together when that client goes away; one-shot operations live under a
//! bearer-protected REST surface.

pub mod api;
pub mod config;
pub mod control;
pub mod portmon;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod shell;
pub mod shutdown;
pub mod watch;
