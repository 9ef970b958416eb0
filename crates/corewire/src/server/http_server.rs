//! HTTP server: accepts connections, frames each with [`HttpFramer`], and
//! dispatches completed requests to a shared [`HttpHandler`].
//!
//! Sockets stay open across requests — this layer never injects
//! `Connection: close`, so pipelined clients keep the same connection.
//! `GET /` carries no special meaning; routing is entirely the handler's
//! job.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::config::NetConfig;
use crate::event_loop::Listener;
use crate::framers::http::{HttpHeader, HttpMessage, HttpVersion};
use crate::framers::HttpFramer;
use crate::message::Message;
use crate::resource::DataResource;
use crate::socket::{PlainAdapter, Socket, SocketManager};
use crate::tls::TlsAdapter;

use super::ListenSocket;

/// Handles one fully-reassembled HTTP request.
///
/// `request` gives mutable access so the handler can read the body
/// (`DataResource::copy_to_buf` takes `&mut self`). Returning `Some(response)`
/// queues it on the same connection; returning `None` means the handler
/// either already produced a response out of band or intentionally sends
/// nothing back.
pub trait HttpHandler: Send + Sync {
    fn handle(&self, request: &mut HttpMessage) -> Option<Message>;
}

/// Always answers `404 Not Found`; useful for exercising the server without
/// a real application behind it.
pub struct NotFoundHandler;

impl HttpHandler for NotFoundHandler {
    fn handle(&self, _request: &mut HttpMessage) -> Option<Message> {
        let header = HttpHeader::response(HttpVersion::Http11, 404, "Not Found");
        Some(Message::http(header, DataResource::new()))
    }
}

struct HttpConnection<H: HttpHandler> {
    handler: Arc<H>,
}

impl<H: HttpHandler> SocketManager<HttpMessage> for HttpConnection<H> {
    fn on_read(&mut self, mut msg: HttpMessage) -> Vec<Message> {
        self.handler.handle(&mut msg).into_iter().collect()
    }

    fn on_closed(&mut self) {
        debug!("http connection closed");
    }
}

/// Binds a listening socket that frames every accepted connection as HTTP
/// and dispatches requests to `handler`.
pub fn bind<H>(addr: SocketAddr, config: &NetConfig, handler: Arc<H>) -> io::Result<ListenSocket<impl FnMut(mio::net::TcpStream, SocketAddr) -> io::Result<Box<dyn Listener>>>>
where
    H: HttpHandler + 'static,
{
    let mem_cache_bytes = config.mem_cache_bytes;
    ListenSocket::bind(addr, move |stream, peer_addr| {
        let framer = HttpFramer::new(mem_cache_bytes);
        let manager = HttpConnection { handler: handler.clone() };
        let socket = Socket::from_accepted(stream, peer_addr, PlainAdapter, framer, manager);
        Ok(Box::new(socket) as Box<dyn Listener>)
    })
}

/// Same as [`bind`] but terminates TLS on every accepted connection before
/// HTTP framing begins.
pub fn bind_tls<H>(
    addr: SocketAddr,
    config: &NetConfig,
    tls_config: Arc<rustls::ServerConfig>,
    handler: Arc<H>,
) -> io::Result<ListenSocket<impl FnMut(mio::net::TcpStream, SocketAddr) -> io::Result<Box<dyn Listener>>>>
where
    H: HttpHandler + 'static,
{
    let mem_cache_bytes = config.mem_cache_bytes;
    ListenSocket::bind(addr, move |stream, peer_addr| {
        let adapter = TlsAdapter::server(tls_config.clone())?;
        let framer = HttpFramer::new(mem_cache_bytes);
        let manager = HttpConnection { handler: handler.clone() };
        let socket = Socket::from_accepted(stream, peer_addr, adapter, framer, manager);
        Ok(Box::new(socket) as Box<dyn Listener>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use mio::Interest;
    use std::io::{Read, Write};
    use std::time::Duration;

    struct EchoPathHandler;

    impl HttpHandler for EchoPathHandler {
        fn handle(&self, request: &mut HttpMessage) -> Option<Message> {
            let target = match &request.header.start_line {
                crate::framers::http::StartLine::Request { target, .. } => target.clone(),
                crate::framers::http::StartLine::Response { .. } => return None,
            };
            let header = HttpHeader::response(HttpVersion::Http11, 200, "OK");
            let mut resource = DataResource::new();
            resource.add_data(&crate::buffer::Data::from_slice(target.as_bytes())).unwrap();
            Some(Message::http(header, resource))
        }
    }

    #[test]
    fn get_request_receives_handler_response_on_the_same_connection() {
        let mut event_loop = EventLoop::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = NetConfig::default();
        let listener = bind(addr, &config, Arc::new(EchoPathHandler)).unwrap();
        let bound_addr = listener.local_addr().unwrap();
        event_loop.add_listener(Box::new(listener), Interest::READABLE).unwrap();

        let mut client = std::net::TcpStream::connect(bound_addr).unwrap();
        client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        client.write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        // One turn accepts the connection, a second drives the read+reply.
        event_loop.turn().unwrap();
        event_loop.turn().unwrap();

        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).unwrap();
        let response = String::from_utf8_lossy(&buf[..n]);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("/hello"));
    }
}
