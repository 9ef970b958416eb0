//! WebSocket server: layers on top of the HTTP framer just far enough to
//! recognize and answer the upgrade handshake (RFC 6455 §4.2), then swaps
//! the connection over to [`WsFramer`] for the rest of its life.
//!
//! Grounded on `WebsocketServer.cpp`'s handshake/dispatch split: compute the
//! accept key the same way, but via this workspace's `sha1` + `base64`
//! crates instead of a hand-rolled digest.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine as _;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::buffer::Data;
use crate::config::NetConfig;
use crate::event_loop::Listener;
use crate::framers::http::{HttpHeader, HttpMessage, HttpVersion, KnownField, StartLine};
use crate::framers::websocket::{WsHeader, WsMessage, WsOpcode};
use crate::framers::HttpFramer;
use crate::message::Message;
use crate::resource::DataResource;
use crate::socket::{PlainAdapter, Socket, SocketManager};

use super::ListenSocket;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `base64(sha1(client_key + "258EAFA5-E914-47DA-95CA-C5AB0DC85B11"))`, the
/// handshake accept value RFC 6455 §1.3 defines.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

fn is_upgrade_request(header: &HttpHeader) -> bool {
    header.is_request()
        && header.field(KnownField::Upgrade).is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
        && header.has_field(KnownField::SecWebSocketKey)
}

/// Receives `Text`/`Binary` application frames once a connection has
/// upgraded. `Ping`/`Pong`/`Close` are handled by [`WsConnection`] itself and
/// never reach this trait.
pub trait WsListener: Send + Sync {
    fn on_message(&self, opcode: WsOpcode, resource: &mut DataResource) -> Option<Data>;
    fn on_close(&self) {}
}

enum ConnState<L: WsListener> {
    AwaitingUpgrade,
    Upgraded(Arc<L>),
}

/// Per-connection manager: frames HTTP until the upgrade handshake
/// completes, then behaves as if it were framing WebSocket from then on.
/// [`Socket`] is generic over one `Fr: Framer`, so the swap is modeled as a
/// state flag here rather than literally replacing the socket's framer.
struct WsConnection<L: WsListener> {
    state: ConnState<L>,
    listener_factory: Arc<L>,
}

/// The framer seam `Socket` drives: an HTTP header/body cutter until the
/// upgrade completes, a WebSocket frame cutter after. Both framers run
/// against the same byte tape; only one is "active" at a time, the same
/// shape `HttpFramer` uses internally to hand off from the message cutter
/// to the chunk cutter. The switch itself flips inside `add_data` the
/// moment a completed request satisfies [`is_upgrade_request`] — it can't
/// wait for `WsConnection` to answer, since whatever tape is left over in
/// that same call already belongs to a WebSocket frame, not another
/// request.
pub struct UpgradeFramer {
    http: HttpFramer,
    ws: crate::framers::websocket::WsFramer,
    upgraded: bool,
}

/// Either a still-HTTP request (pre-upgrade) or a WebSocket application
/// frame (post-upgrade), handed to [`WsConnection`] uniformly.
pub enum UpgradeOutput {
    Http(HttpMessage),
    Ws(WsMessage),
}

impl UpgradeFramer {
    pub fn new(mem_cache_bytes: u64) -> Self {
        Self { http: HttpFramer::new(mem_cache_bytes), ws: crate::framers::websocket::WsFramer::new(mem_cache_bytes), upgraded: false }
    }
}

impl crate::framers::Framer for UpgradeFramer {
    type Output = UpgradeOutput;

    fn add_data(&mut self, data: Data, out: &mut Vec<UpgradeOutput>) -> crate::error::Result<()> {
        if self.upgraded {
            let mut ws_out = Vec::new();
            self.ws.add_data(data, &mut ws_out)?;
            out.extend(ws_out.into_iter().map(UpgradeOutput::Ws));
        } else {
            let mut http_out = Vec::new();
            self.http.add_data(data, &mut http_out)?;
            // A valid upgrade request decides the switch right here, using
            // the same predicate `WsConnection::handle_handshake` uses to
            // decide whether to answer with 101 or 400 — the framer doesn't
            // wait on the manager's response to flip over, since any bytes
            // still left in this same `data` after the request belong to the
            // WebSocket frame cutter, not another HTTP request.
            for msg in http_out {
                if is_upgrade_request(&msg.header) {
                    self.upgraded = true;
                }
                out.push(UpgradeOutput::Http(msg));
            }
        }
        Ok(())
    }

    fn is_poisoned(&self) -> bool {
        if self.upgraded { self.ws.is_poisoned() } else { self.http.is_poisoned() }
    }
}

impl<L: WsListener> SocketManager<UpgradeOutput> for WsConnection<L> {
    fn on_read(&mut self, msg: UpgradeOutput) -> Vec<Message> {
        match (msg, &self.state) {
            (UpgradeOutput::Http(request), ConnState::AwaitingUpgrade) => self.handle_handshake(request),
            (UpgradeOutput::Ws(frame), ConnState::Upgraded(listener)) => {
                let listener = listener.clone();
                self.handle_frame(listener, frame)
            }
            // An application frame arrived before the handshake completed, or
            // an HTTP-shaped request arrived on an already-upgraded socket.
            // Neither should happen with a well-behaved client; drop it.
            _ => Vec::new(),
        }
    }

    fn on_closed(&mut self) {
        if let ConnState::Upgraded(listener) = &self.state {
            listener.on_close();
        }
        debug!("websocket connection closed");
    }
}

impl<L: WsListener> WsConnection<L> {
    fn handle_handshake(&mut self, request: HttpMessage) -> Vec<Message> {
        if !is_upgrade_request(&request.header) {
            let header = HttpHeader::response(HttpVersion::Http11, 400, "Bad Request");
            return vec![Message::http(header, DataResource::new())];
        }
        let client_key = request.header.field(KnownField::SecWebSocketKey).unwrap_or_default().to_string();
        let mut header = HttpHeader::response(HttpVersion::Http11, 101, "Switching Protocols");
        header.set_field(KnownField::Upgrade, "websocket");
        header.set_field(KnownField::Connection, "Upgrade");
        header.set_field(KnownField::SecWebSocketAccept, accept_key(&client_key));

        self.state = ConnState::Upgraded(self.listener_factory.clone());
        vec![Message::http(header, DataResource::new())]
    }

    fn handle_frame(&mut self, listener: Arc<L>, frame: WsMessage) -> Vec<Message> {
        let WsMessage { opcode, mut resource } = frame;
        match opcode {
            WsOpcode::Ping => {
                let header = WsHeader::new(true, WsOpcode::Pong, resource.size(), None);
                vec![Message::websocket(header, resource)]
            }
            WsOpcode::Pong => Vec::new(),
            WsOpcode::Close => {
                listener.on_close();
                Vec::new()
            }
            WsOpcode::Text | WsOpcode::Binary => match listener.on_message(opcode, &mut resource) {
                Some(payload) => {
                    let mut out_resource = DataResource::new();
                    let _ = out_resource.add_data(&payload);
                    let header = WsHeader::new(true, opcode, out_resource.size(), None);
                    vec![Message::websocket(header, out_resource)]
                }
                None => Vec::new(),
            },
            WsOpcode::Continuation => Vec::new(), // WsFramer never emits this opcode from merge_frame
        }
    }
}

/// Binds a listening socket that speaks HTTP until a client requests a
/// WebSocket upgrade, then dispatches `Text`/`Binary` frames to `listener`.
pub fn bind<L>(addr: SocketAddr, config: &NetConfig, listener: Arc<L>) -> io::Result<ListenSocket<impl FnMut(mio::net::TcpStream, SocketAddr) -> io::Result<Box<dyn Listener>>>>
where
    L: WsListener + 'static,
{
    let mem_cache_bytes = config.mem_cache_bytes;
    ListenSocket::bind(addr, move |stream, peer_addr| {
        let framer = UpgradeFramer::new(mem_cache_bytes);
        let manager = WsConnection { state: ConnState::AwaitingUpgrade, listener_factory: listener.clone() };
        let socket = Socket::from_accepted(stream, peer_addr, PlainAdapter, framer, manager);
        Ok(Box::new(socket) as Box<dyn Listener>)
    })
}
