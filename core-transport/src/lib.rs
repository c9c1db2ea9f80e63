//! # Core Transport
//!
//! Point-to-point message bus between the host process and one content
//! process, over a private Unix socket.
//!
//! ## Overview
//!
//! - [`TransportServer`] binds a named bus, admits a single authenticated
//!   peer, and routes method calls and property requests to handlers
//!   registered per interface.
//! - [`TransportClient`] connects to a bus, issues calls with reply
//!   correlation, and receives signals.
//!
//! Frames are length-prefixed JSON documents (see [`frame`]).

pub mod address;
pub mod client;
pub mod credentials;
pub mod error;
pub mod frame;
pub mod server;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use address::BusAddress;
pub use client::{ClientOptions, ConnectionState, SignalCallback, TransportClient};
pub use credentials::{allow_uid, PeerAuthenticator, PeerCredentials};
pub use error::{Result, TransportError};
pub use frame::{Fault, FaultKind, Frame, RejectReason};
pub use server::{
    ServerConnection, TransportServer, INTROSPECTABLE_INTERFACE, INTROSPECT_METHOD,
};

/// Lock a table, recovering it if a handler panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
