//! Non-blocking TCP toolkit: a `mio`-driven event loop, a generic socket
//! object over pluggable framers and handshake adapters, length-prefixed /
//! HTTP / WebSocket wire formats, `rustls`-backed TLS, an HTTP/WebSocket
//! server pair, a two-leg proxy, and a liveness monitor for outbound
//! connections that need to stay up.
//!
//! Most consumers start at [`event_loop::EventLoop`] and [`socket::Socket`];
//! the `server` module builds application-level listeners on top of both.

pub mod buffer;
pub mod config;
pub mod cutter;
pub mod error;
pub mod event_loop;
pub mod framers;
pub mod message;
pub mod monitor;
pub mod resource;
pub mod server;
pub mod socket;
pub mod time;
pub mod tls;

pub use config::NetConfig;
pub use error::{NetError, Result};
pub use event_loop::{EventLoop, Poster};
pub use message::Message;
