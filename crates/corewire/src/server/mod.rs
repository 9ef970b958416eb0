//! Higher-level servers built on top of [`crate::socket::Socket`]: an HTTP
//! server, a WebSocket server layered on it, and a generic two-leg proxy.
//!
//! All three share one shape for the listening side: accept in a loop until
//! `WouldBlock`, wrap each accepted stream in a `Socket`, hand it back to
//! the event loop via [`DispatchEffects`]. [`ListenSocket`] is that shared
//! accept loop; each server supplies only the per-connection construction.

pub mod http_server;
pub mod proxy;
pub mod ws_server;

use std::io;
use std::net::SocketAddr;

use mio::event::Source;
use mio::{Interest, Registry, Token};
use tracing::warn;

use crate::event_loop::{DispatchEffects, Listener, PendingRegistration};

/// A `mio::net::TcpListener` that turns every accepted connection into a
/// `Box<dyn Listener>` via `make_connection`, handed to the event loop as
/// `DispatchEffects::new_listeners` once `on_readable` returns.
pub struct ListenSocket<F> {
    listener: mio::net::TcpListener,
    make_connection: F,
}

impl<F> ListenSocket<F>
where
    F: FnMut(mio::net::TcpStream, SocketAddr) -> io::Result<Box<dyn Listener>>,
{
    pub fn bind(addr: SocketAddr, make_connection: F) -> io::Result<Self> {
        Ok(Self { listener: mio::net::TcpListener::bind(addr)?, make_connection })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl<F> Listener for ListenSocket<F>
where
    F: FnMut(mio::net::TcpStream, SocketAddr) -> io::Result<Box<dyn Listener>>,
{
    fn source(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    fn on_readable(&mut self, _registry: &Registry, _token: Token) -> DispatchEffects {
        let mut new_listeners = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => match (self.make_connection)(stream, addr) {
                    Ok(connection) => {
                        new_listeners.push(PendingRegistration { listener: connection, interest: Interest::READABLE });
                    }
                    Err(e) => warn!(%e, %addr, "failed to set up accepted connection"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(%e, "accept failed");
                    break;
                }
            }
        }
        DispatchEffects { new_listeners, close_self: false }
    }

    fn on_writable(&mut self, _registry: &Registry, _token: Token) -> DispatchEffects {
        DispatchEffects::none()
    }

    fn on_error(&mut self, _registry: &Registry, _token: Token, _poll_error: bool) {}

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
