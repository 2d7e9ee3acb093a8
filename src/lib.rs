//! HTTP/HTTPS forward proxy with opt-in TLS interception.
//!
//! Two proxy flavours share the same plumbing: [`handler::ProxyHandler`]
//! serves HTTP through hyper and handles `CONNECT` by tunneling or by
//! terminating TLS against a locally issued certificate, while
//! [`pure::PureProxy`] sniffs the request head straight off the TCP stream
//! and tunnels bytes without any HTTP machinery.

pub mod cert;
pub mod connect;
pub mod copy;
pub mod error;
pub mod handler;
pub mod limit;
pub mod net;
pub mod pool;
pub mod pure;
mod tls;

pub use error::{Error, Result};
pub use handler::ProxyHandler;
pub use pool::BufferPool;
pub use pure::PureProxy;
