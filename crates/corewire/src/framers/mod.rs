//! Wire framers, each built on the generic [`crate::cutter`] state machine.

pub mod http;
pub mod length_prefixed;
pub mod websocket;

use crate::buffer::Data;
use crate::error::Result;

pub use http::{HttpFramer, HttpHeader, HttpMessage, HttpVersion, KnownField, StartLine};
pub use length_prefixed::{SimpleFramer, SimpleMessage};
pub use websocket::{WsFramer, WsHeader, WsMessage, WsOpcode};

/// Common shape of the three wire framers, so the socket read driver (§4.2)
/// can be generic over which protocol a connection speaks.
pub trait Framer {
    type Output;

    fn add_data(&mut self, data: Data, out: &mut Vec<Self::Output>) -> Result<()>;
    fn is_poisoned(&self) -> bool;
}

impl Framer for SimpleFramer {
    type Output = SimpleMessage;

    fn add_data(&mut self, data: Data, out: &mut Vec<SimpleMessage>) -> Result<()> {
        SimpleFramer::add_data(self, data, out)
    }

    fn is_poisoned(&self) -> bool {
        SimpleFramer::is_poisoned(self)
    }
}

impl Framer for HttpFramer {
    type Output = HttpMessage;

    fn add_data(&mut self, data: Data, out: &mut Vec<HttpMessage>) -> Result<()> {
        HttpFramer::add_data(self, data, out)
    }

    fn is_poisoned(&self) -> bool {
        HttpFramer::is_poisoned(self)
    }
}

impl Framer for WsFramer {
    type Output = WsMessage;

    fn add_data(&mut self, data: Data, out: &mut Vec<WsMessage>) -> Result<()> {
        WsFramer::add_data(self, data, out)
    }

    fn is_poisoned(&self) -> bool {
        WsFramer::is_poisoned(self)
    }
}
