//! Generic two-leg TCP proxy: accepts inbound connections, dials a fixed
//! target for each, and forwards frames between the two legs.
//!
//! Grounded on `ConnectionManager`'s accept-then-dial pairing and this
//! crate's own [`crate::socket::resolve_and_connect`] (off-thread DNS,
//! posted back onto the loop) for the outbound leg. The two legs run as two
//! independent `Socket`s under two different tokens — there's no shared
//! ownership between them, so forwarding a frame from one to the other goes
//! through [`crate::event_loop::Poster`] and [`crate::event_loop::EventLoop::with_listener`],
//! the same mechanism any other external code would use to reach a socket
//! by its token.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use mio::Token;
use tracing::debug;

use crate::config::NetConfig;
use crate::event_loop::{Listener, Poster};
use crate::framers::{SimpleFramer, SimpleMessage};
use crate::message::Message;
use crate::socket::{resolve_and_connect, PlainAdapter, Socket, SocketManager};

use super::ListenSocket;

type ProxySocket = Socket<PlainAdapter, SimpleFramer, ProxyLeg>;

/// Rewrites one leg's completed frame into the `Message` forwarded to the
/// other leg.
pub trait ProxyTransform: Send + Sync {
    fn transform(&self, msg: SimpleMessage) -> Message;
}

/// Forwards every frame unchanged.
pub struct Identity;

impl ProxyTransform for Identity {
    fn transform(&self, msg: SimpleMessage) -> Message {
        Message::simple(msg.msg_type, msg.resource)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Inbound,
    Outbound,
}

/// State shared between a channel's two legs: each side's token, once the
/// event loop has assigned one, and a backlog for frames that arrive before
/// the destination leg has registered (the outbound leg dials
/// asynchronously, so inbound traffic routinely arrives first).
struct ProxyLink {
    inbound_token: Mutex<Option<Token>>,
    outbound_token: Mutex<Option<Token>>,
    pending_to_inbound: Mutex<VecDeque<Message>>,
    pending_to_outbound: Mutex<VecDeque<Message>>,
}

impl ProxyLink {
    fn new() -> Self {
        Self {
            inbound_token: Mutex::new(None),
            outbound_token: Mutex::new(None),
            pending_to_inbound: Mutex::new(VecDeque::new()),
            pending_to_outbound: Mutex::new(VecDeque::new()),
        }
    }
}

/// One leg of a proxied connection. Reads frames off its own socket,
/// transforms them, and either forwards them to its peer (if the peer's
/// token is already known) or queues them in the shared backlog.
struct ProxyLeg {
    side: Side,
    link: Arc<ProxyLink>,
    poster: Poster,
    transform: Arc<dyn ProxyTransform>,
}

impl ProxyLeg {
    fn peer_token(&self) -> Option<Token> {
        let guard = match self.side {
            Side::Inbound => self.link.outbound_token.lock().unwrap(),
            Side::Outbound => self.link.inbound_token.lock().unwrap(),
        };
        *guard
    }

    /// The backlog this leg forwards *into* (addressed to its peer).
    fn outgoing_backlog(&self) -> &Mutex<VecDeque<Message>> {
        match self.side {
            Side::Inbound => &self.link.pending_to_outbound,
            Side::Outbound => &self.link.pending_to_inbound,
        }
    }

    /// The backlog addressed *to this leg*, built up by its peer before
    /// this leg had a token to be reached at.
    fn incoming_backlog(&self) -> &Mutex<VecDeque<Message>> {
        match self.side {
            Side::Inbound => &self.link.pending_to_inbound,
            Side::Outbound => &self.link.pending_to_outbound,
        }
    }

    fn forward(&self, msg: Message) {
        match self.peer_token() {
            Some(peer) => {
                self.poster.post(move |event_loop| {
                    event_loop.with_listener::<ProxySocket, _>(peer, |socket, registry, token| {
                        socket.send(registry, token, msg);
                    });
                });
            }
            None => self.outgoing_backlog().lock().unwrap().push_back(msg),
        }
    }
}

impl SocketManager<SimpleMessage> for ProxyLeg {
    fn on_read(&mut self, msg: SimpleMessage) -> Vec<Message> {
        self.forward(self.transform.transform(msg));
        Vec::new()
    }

    fn on_registered(&mut self, token: Token) -> Vec<Message> {
        let slot = match self.side {
            Side::Inbound => &self.link.inbound_token,
            Side::Outbound => &self.link.outbound_token,
        };
        *slot.lock().unwrap() = Some(token);
        self.incoming_backlog().lock().unwrap().drain(..).collect()
    }

    fn on_closed(&mut self) {
        debug!(side = ?matches!(self.side, Side::Inbound), "proxy leg closed, tearing down peer");
        if let Some(peer) = self.peer_token() {
            self.poster.post(move |event_loop| {
                event_loop.remove_listener(peer);
            });
        }
    }
}

/// Binds a listener that pairs every accepted connection with a dialed
/// connection to `(target_host, target_port)`, forwarding frames between
/// them through `transform` (use [`Identity`] for a transparent proxy).
pub fn bind(
    addr: SocketAddr,
    config: &NetConfig,
    target_host: String,
    target_port: u16,
    transform: Arc<dyn ProxyTransform>,
    poster: Poster,
) -> std::io::Result<ListenSocket<impl FnMut(mio::net::TcpStream, SocketAddr) -> std::io::Result<Box<dyn Listener>>>> {
    let mem_cache_bytes = config.mem_cache_bytes;
    let connect_timeout = config.connect_timeout();

    ListenSocket::bind(addr, move |stream, peer_addr| {
        let link = Arc::new(ProxyLink::new());

        let inbound_manager = ProxyLeg { side: Side::Inbound, link: link.clone(), poster: poster.clone(), transform: transform.clone() };
        let inbound_socket =
            Socket::from_accepted(stream, peer_addr, PlainAdapter, SimpleFramer::new(mem_cache_bytes), inbound_manager);

        let outbound_manager = ProxyLeg { side: Side::Outbound, link, poster: poster.clone(), transform: transform.clone() };
        resolve_and_connect(
            poster.clone(),
            target_host.clone(),
            target_port,
            connect_timeout,
            PlainAdapter,
            SimpleFramer::new(mem_cache_bytes),
            outbound_manager,
        );

        Ok(Box::new(inbound_socket) as Box<dyn Listener>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Data;
    use crate::event_loop::EventLoop;
    use crate::resource::DataResource;
    use mio::Interest;
    use std::io::{Read, Write};
    use std::net::TcpListener as StdTcpListener;
    use std::time::Duration;

    #[test]
    fn forwards_a_frame_from_the_client_to_the_dialed_target() {
        let upstream = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let mut event_loop = EventLoop::new().unwrap();
        let poster = event_loop.poster();
        let config = NetConfig::default();
        let proxy_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener =
            bind(proxy_addr, &config, upstream_addr.ip().to_string(), upstream_addr.port(), Arc::new(Identity), poster).unwrap();
        let bound_addr = listener.local_addr().unwrap();
        event_loop.add_listener(Box::new(listener), Interest::READABLE).unwrap();

        let mut client = std::net::TcpStream::connect(bound_addr).unwrap();
        client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

        let mut resource = DataResource::new();
        resource.add_data(&Data::from_slice(b"hi")).unwrap();
        let mut frame = Message::simple(7, resource);
        let wire = frame.subset(usize::MAX, 0).unwrap();
        client.write_all(wire.current()).unwrap();

        upstream.set_nonblocking(true).unwrap();
        let mut upstream_conn = None;
        for _ in 0..20 {
            event_loop.turn().unwrap();
            if let Ok((conn, _)) = upstream.accept() {
                upstream_conn = Some(conn);
                break;
            }
        }
        let mut upstream_conn = upstream_conn.expect("outbound leg never dialed upstream");
        upstream_conn.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        upstream_conn.set_nonblocking(false).unwrap();

        for _ in 0..20 {
            event_loop.turn().unwrap();
        }

        let mut buf = [0u8; 16];
        let n = upstream_conn.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"\x07\x02\x00\x00\x00hi");
    }
}
