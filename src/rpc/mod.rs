//! Local datagram RPC substrate: an `AF_UNIX SOCK_SEQPACKET` socket carrying
//! one JSON object per message, with an optional side-channel of file
//! descriptors passed via `SCM_RIGHTS`.
//!
//! Grounded in the jsoncomm wire format: peek the pending datagram size
//! before reading so a single `recvmsg` can size its buffer exactly, and
//! distinguish a message that would not fit (`MessageTooLarge`) from a
//! generic I/O failure.

mod fdset;
mod service;
mod socket;

pub use fdset::FdSet;
pub use service::{Service, ServiceManager, ServiceRegistry};
pub use socket::Socket;

use crate::error::GraphError;

/// Reserved method name a service handler uses to report a caught exception
/// back to the client as a [`GraphError::Remote`].
pub const EXCEPTION_METHOD: &str = "exception";

/// One RPC call as decoded off the wire.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub args: serde_json::Value,
}

/// One RPC reply, either a successful payload or a remote-error payload.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(serde_json::Value),
    Err { kind: String, message: String },
}

impl Reply {
    pub fn into_result(self) -> Result<serde_json::Value, GraphError> {
        match self {
            Reply::Ok(v) => Ok(v),
            Reply::Err { kind, message } => Err(GraphError::Remote { kind, message }),
        }
    }
}
