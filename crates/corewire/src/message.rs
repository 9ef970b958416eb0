//! The outbound message shape every framer's wire format gets packed into,
//! and [`Message::subset`] — the one place the write driver (§4.2) reads
//! bytes back out in arbitrary-size chunks without caring which framer
//! produced them.

use crate::buffer::Data;
use crate::error::Result;
use crate::framers::http::{HttpHeader, KnownField};
use crate::framers::websocket::WsHeader;
use crate::resource::DataResource;

/// A tagged payload: a (possibly empty) wire header plus a body resource.
/// Header bytes are computed once at construction, since the header for an
/// outgoing message depends only on its own fields and the final body size
/// — both known up front for a fully-built outgoing message.
pub enum Message {
    Simple { msg_type: u8, resource: DataResource, wire_header: Data },
    Http { header: HttpHeader, resource: DataResource, wire_header: Data },
    WebSocket { header: WsHeader, resource: DataResource, wire_header: Data },
}

impl Message {
    pub fn simple(msg_type: u8, resource: DataResource) -> Self {
        let mut bytes = Vec::with_capacity(5);
        bytes.push(msg_type);
        bytes.extend_from_slice(&(resource.size() as u32).to_le_bytes());
        Self::Simple { msg_type, resource, wire_header: Data::from_vec(bytes) }
    }

    /// Sets `Content-Length` to the resource's final size unless the header
    /// already declares `Transfer-Encoding`, then encodes the header block.
    pub fn http(mut header: HttpHeader, resource: DataResource) -> Self {
        if !header.has_field(KnownField::TransferEncoding) {
            header.set_field(KnownField::ContentLength, resource.size().to_string());
        }
        let wire_header = Data::from_vec(header.encode());
        Self::Http { header, resource, wire_header }
    }

    pub fn websocket(header: WsHeader, resource: DataResource) -> Self {
        let wire_header = Data::from_vec(header.encode());
        Self::WebSocket { header, resource, wire_header }
    }

    fn wire_header(&self) -> &Data {
        match self {
            Self::Simple { wire_header, .. } | Self::Http { wire_header, .. } | Self::WebSocket { wire_header, .. } => {
                wire_header
            }
        }
    }

    fn resource(&self) -> &DataResource {
        match self {
            Self::Simple { resource, .. } | Self::Http { resource, .. } | Self::WebSocket { resource, .. } => resource,
        }
    }

    fn resource_mut(&mut self) -> &mut DataResource {
        match self {
            Self::Simple { resource, .. } | Self::Http { resource, .. } | Self::WebSocket { resource, .. } => resource,
        }
    }

    fn mask_key(&self) -> Option<[u8; 4]> {
        match self {
            Self::WebSocket { header, .. } => header.mask_key,
            _ => None,
        }
    }

    pub fn total_len(&self) -> u64 {
        self.wire_header().current_size() as u64 + self.resource().size()
    }

    /// Returns up to `max` bytes starting at absolute `offset` (0 = first
    /// header byte), spanning the header/body boundary transparently. The
    /// write driver calls this repeatedly with an advancing `offset` until
    /// it reaches `total_len()`.
    pub fn subset(&mut self, max: usize, offset: u64) -> Result<Data> {
        let header_len = self.wire_header().current_size() as u64;
        let total = self.total_len();
        if offset >= total || max == 0 {
            return Ok(Data::new());
        }

        let remaining = (total - offset).min(max as u64) as usize;
        let mut out = Vec::with_capacity(remaining);
        let body_mask_start; // index into `out` where body bytes begin, for masking

        if offset < header_len {
            let from_header = ((header_len - offset) as usize).min(remaining);
            let start = offset as usize;
            out.extend_from_slice(&self.wire_header().current()[start..start + from_header]);
            body_mask_start = from_header;
            let from_body = remaining - from_header;
            if from_body > 0 {
                let mut buf = vec![0u8; from_body];
                self.resource_mut().copy_to_buf(&mut buf, 0, from_body)?;
                out.extend_from_slice(&buf);
            }
        } else {
            let body_offset = offset - header_len;
            let mut buf = vec![0u8; remaining];
            self.resource_mut().copy_to_buf(&mut buf, body_offset, remaining)?;
            out.extend_from_slice(&buf);
            body_mask_start = 0;
        }

        if let Some(key) = self.mask_key() {
            let body_abs_offset = offset.saturating_sub(header_len) as usize;
            for (i, byte) in out[body_mask_start..].iter_mut().enumerate() {
                *byte ^= key[(body_abs_offset + i) % 4];
            }
        }

        Ok(Data::from_vec(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framers::http::HttpVersion;
    use crate::framers::websocket::WsOpcode;

    #[test]
    fn simple_subset_spans_header_and_body_in_small_chunks() {
        let mut resource = DataResource::new();
        resource.add_data(&Data::from_slice(b"hello")).unwrap();
        let mut msg = Message::simple(3, resource);
        assert_eq!(msg.total_len(), 10); // 5 byte header + 5 byte body

        let mut collected = Vec::new();
        let mut offset = 0u64;
        loop {
            let chunk = msg.subset(3, offset).unwrap();
            if chunk.is_empty() {
                break;
            }
            offset += chunk.current_size() as u64;
            collected.extend_from_slice(chunk.current());
        }
        assert_eq!(collected, vec![3, 5, 0, 0, 0, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn http_subset_sets_content_length_and_includes_body() {
        let header = HttpHeader::response(HttpVersion::Http11, 200, "OK");
        let mut resource = DataResource::new();
        resource.add_data(&Data::from_slice(b"hi")).unwrap();
        let mut msg = Message::http(header, resource);

        let whole = msg.subset(usize::MAX, 0).unwrap();
        let text = String::from_utf8_lossy(whole.current());
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn websocket_subset_masks_only_the_body_with_correct_rotation() {
        // 2 base bytes + 4 byte mask key, no extended length (payload < 126).
        let header = WsHeader::new(true, WsOpcode::Binary, 4, Some([1, 2, 3, 4]));
        let mut resource = DataResource::new();
        resource.add_data(&Data::from_slice(&[10, 20, 30, 40])).unwrap();
        let mut msg = Message::websocket(header, resource);
        assert_eq!(msg.total_len(), 10);

        let header_only = msg.subset(6, 0).unwrap();
        assert_eq!(header_only.current_size(), 6);

        let body = msg.subset(4, 6).unwrap();
        assert_eq!(body.current(), &[10 ^ 1, 20 ^ 2, 30 ^ 3, 40 ^ 4]);
    }
}
