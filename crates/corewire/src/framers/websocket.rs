//! WebSocket (RFC 6455) framing: per-frame header + masked payload, with
//! fragment reassembly one level up.
//!
//! Grounded on `WebsocketHeader.h`/`WebsocketDataCutter.cpp` (per-frame cut)
//! and `WebsocketFragmentBuilder.cpp` (fragment reassembly).

use crate::buffer::Data;
use crate::cutter::{Cut, HeaderOutcome, TapeCutter};
use crate::error::{NetError, Result};
use crate::resource::DataResource;

/// Implementation cap on a single frame's declared payload length,
/// independent of the protocol's 64-bit field width.
pub const MAX_WS_PAYLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsOpcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl WsOpcode {
    fn from_nibble(n: u8) -> Option<Self> {
        Some(match n {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            _ => return None,
        })
    }

    fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WsHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: WsOpcode,
    pub mask: bool,
    pub payload_len: u64,
    pub mask_key: Option<[u8; 4]>,
}

impl WsHeader {
    /// Builds an outgoing frame header. Server frames pass `mask_key: None`
    /// (RFC 6455 forbids masking frames sent by a server); client frames
    /// supply a mask key.
    pub fn new(fin: bool, opcode: WsOpcode, payload_len: u64, mask_key: Option<[u8; 4]>) -> Self {
        Self { fin, rsv1: false, rsv2: false, rsv3: false, opcode, mask: mask_key.is_some(), payload_len, mask_key }
    }

    fn opcode_nibble(self) -> u8 {
        match self.opcode {
            WsOpcode::Continuation => 0x0,
            WsOpcode::Text => 0x1,
            WsOpcode::Binary => 0x2,
            WsOpcode::Close => 0x8,
            WsOpcode::Ping => 0x9,
            WsOpcode::Pong => 0xA,
        }
    }

    /// Serializes the frame header (base bytes + extended length + mask
    /// key). Does not mask or emit the payload itself.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14);
        out.push((u8::from(self.fin) << 7) | self.opcode_nibble());

        let mask_bit = u8::from(self.mask) << 7;
        if self.payload_len < 126 {
            out.push(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= u64::from(u16::MAX) {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(self.payload_len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&self.payload_len.to_be_bytes());
        }

        if let Some(key) = self.mask_key {
            out.extend_from_slice(&key);
        }
        out
    }
}

/// Parses one frame header from the front of `buf`. `Ok(None)` means not
/// enough bytes yet.
fn parse_frame_header(buf: &[u8], max_payload: u64) -> Result<Option<(usize, WsHeader)>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];
    let fin = b0 & 0x80 != 0;
    let rsv1 = b0 & 0x40 != 0;
    let rsv2 = b0 & 0x20 != 0;
    let rsv3 = b0 & 0x10 != 0;
    let opcode = WsOpcode::from_nibble(b0 & 0x0F)
        .ok_or_else(|| NetError::FramingParse(format!("unknown websocket opcode {:#x}", b0 & 0x0F)))?;
    let mask = b1 & 0x80 != 0;
    let len_field = b1 & 0x7F;

    let mut pos = 2usize;
    let payload_len: u64 = match len_field {
        126 => {
            if buf.len() < pos + 2 {
                return Ok(None);
            }
            let v = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            pos += 2;
            u64::from(v)
        }
        127 => {
            if buf.len() < pos + 8 {
                return Ok(None);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[pos..pos + 8]);
            pos += 8;
            u64::from_be_bytes(bytes)
        }
        n => u64::from(n),
    };

    if payload_len > max_payload {
        return Err(NetError::FramingOverflow(format!(
            "websocket payload {payload_len} exceeds cap {max_payload}"
        )));
    }

    let mask_key = if mask {
        if buf.len() < pos + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[pos..pos + 4]);
        pos += 4;
        Some(key)
    } else {
        None
    };

    if opcode.is_control() && (!fin || payload_len > 125) {
        return Err(NetError::FramingParse("fragmented or oversized control frame".into()));
    }

    Ok(Some((pos, WsHeader { fin, rsv1, rsv2, rsv3, opcode, mask, payload_len, mask_key })))
}

/// One completed WebSocket frame, payload already unmasked.
pub struct WsFrame {
    pub header: WsHeader,
    pub resource: DataResource,
}

struct WsFrameCut {
    header: Option<WsHeader>,
    resource: DataResource,
    mem_cache_bytes: u64,
    max_payload: u64,
    completed: Vec<WsFrame>,
    /// Set by `add_body` on a disk IO failure; `Cut::add_body` has no
    /// `Result` return, so the error is captured here for `WsFramer` to
    /// surface after driving the cutter.
    io_error: Option<NetError>,
}

impl WsFrameCut {
    fn new(mem_cache_bytes: u64, max_payload: u64) -> Self {
        Self {
            header: None,
            resource: DataResource::new(),
            mem_cache_bytes,
            max_payload,
            completed: Vec::new(),
            io_error: None,
        }
    }
}

impl Cut for WsFrameCut {
    fn find_header(&mut self, tape: &mut Data) -> HeaderOutcome {
        match parse_frame_header(tape.current(), self.max_payload) {
            Ok(None) => HeaderOutcome::KeepWaiting,
            Ok(Some((consumed, header))) => {
                tape.add_offset(consumed);
                self.resource = DataResource::with_mem_cache_bytes(self.mem_cache_bytes);
                self.resource.set_expected_size(header.payload_len);
                self.header = Some(header);
                HeaderOutcome::Found { expected_cut_size: header.payload_len }
            }
            Err(_) => HeaderOutcome::Fail,
        }
    }

    fn add_body(&mut self, body: &Data) {
        let header = self.header.expect("header parsed before body");
        let result = if let Some(key) = header.mask_key {
            let mut unmasked = body.current().to_vec();
            let base = self.resource.size() as usize;
            for (i, byte) in unmasked.iter_mut().enumerate() {
                *byte ^= key[(base + i) % 4];
            }
            self.resource.add_data(&Data::from_vec(unmasked))
        } else {
            self.resource.add_data(body)
        };
        if let Err(e) = result {
            self.io_error.get_or_insert(e);
        }
    }

    fn find_footer(&mut self, _tape: &mut Data) {
        if let Some(header) = self.header.take() {
            let resource = std::mem::replace(&mut self.resource, DataResource::with_mem_cache_bytes(self.mem_cache_bytes));
            self.completed.push(WsFrame { header, resource });
        }
    }
}

/// One fully-reassembled WebSocket message (fragments merged, control
/// frames passed through as-is).
pub struct WsMessage {
    pub opcode: WsOpcode,
    pub resource: DataResource,
}

/// Reassembles WebSocket frames into messages: control frames emit
/// immediately, data frames accumulate across a `fin=false` run until a
/// `fin=true` frame (possibly the first one) completes them.
pub struct WsFramer {
    cutter: TapeCutter<WsFrameCut>,
    fragment: Option<FragmentState>,
}

struct FragmentState {
    opcode: WsOpcode,
    resource: DataResource,
}

impl WsFramer {
    pub fn new(mem_cache_bytes: u64) -> Self {
        Self::with_max_payload(mem_cache_bytes, MAX_WS_PAYLOAD_BYTES)
    }

    pub fn with_max_payload(mem_cache_bytes: u64, max_payload: u64) -> Self {
        Self { cutter: TapeCutter::new(WsFrameCut::new(mem_cache_bytes, max_payload)), fragment: None }
    }

    pub fn is_poisoned(&self) -> bool {
        self.cutter.is_poisoned()
    }

    pub fn add_data(&mut self, mut data: Data, out: &mut Vec<WsMessage>) -> Result<()> {
        self.cutter.add_data(&mut data);
        if self.cutter.is_poisoned() {
            return Err(NetError::FramingParse("malformed websocket frame".into()));
        }
        if let Some(e) = self.cutter.cut_mut().io_error.take() {
            return Err(e);
        }

        for frame in self.cutter.cut_mut().completed.drain(..) {
            self.merge_frame(frame, out)?;
        }
        Ok(())
    }

    fn merge_frame(&mut self, frame: WsFrame, out: &mut Vec<WsMessage>) -> Result<()> {
        let WsFrame { header, resource } = frame;

        if header.opcode.is_control() {
            out.push(WsMessage { opcode: header.opcode, resource });
            return Ok(());
        }

        match (&mut self.fragment, header.opcode) {
            (None, WsOpcode::Continuation) => {
                Err(NetError::FramingParse("continuation frame with no fragment in progress".into()))
            }
            (None, opcode) => {
                if header.fin {
                    out.push(WsMessage { opcode, resource });
                } else {
                    self.fragment = Some(FragmentState { opcode, resource });
                }
                Ok(())
            }
            (Some(_), opcode) if opcode != WsOpcode::Continuation => {
                Err(NetError::FramingParse("new data frame while a fragment is in progress".into()))
            }
            (Some(state), WsOpcode::Continuation) => {
                let mut buf = vec![0u8; resource.size() as usize];
                let mut resource = resource;
                if !buf.is_empty() {
                    resource.copy_to_buf(&mut buf, 0, buf.len())?;
                }
                state.resource.add_data(&Data::from_vec(buf))?;
                if header.fin {
                    let finished = self.fragment.take().expect("fragment present");
                    out.push(WsMessage { opcode: finished.opcode, resource: finished.resource });
                }
                Ok(())
            }
            (Some(_), _) => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked_frame(fin: bool, opcode: u8, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push((if fin { 0x80 } else { 0 }) | opcode);
        assert!(payload.len() < 126);
        out.push(0x80 | payload.len() as u8);
        out.extend_from_slice(&key);
        for (i, &b) in payload.iter().enumerate() {
            out.push(b ^ key[i % 4]);
        }
        out
    }

    #[test]
    fn single_masked_text_frame_unmasks_and_emits() {
        let mut framer = WsFramer::new(4096);
        let frame = masked_frame(true, 0x1, b"hello", [1, 2, 3, 4]);
        let mut out = Vec::new();
        framer.add_data(Data::from_slice(&frame), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].opcode, WsOpcode::Text);
        let mut buf = vec![0u8; 5];
        out[0].resource.copy_to_buf(&mut buf, 0, 5).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn fragmented_text_message_reassembles() {
        let mut framer = WsFramer::new(4096);
        let f1 = masked_frame(false, 0x1, b"hel", [9, 9, 9, 9]);
        let f2 = masked_frame(true, 0x0, b"lo", [7, 7, 7, 7]);
        let mut out = Vec::new();
        framer.add_data(Data::from_slice(&f1), &mut out).unwrap();
        assert!(out.is_empty());
        framer.add_data(Data::from_slice(&f2), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].opcode, WsOpcode::Text);
        let mut buf = vec![0u8; 5];
        out[0].resource.copy_to_buf(&mut buf, 0, 5).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn ping_control_frame_emits_without_touching_fragment_state() {
        let mut framer = WsFramer::new(4096);
        let start = masked_frame(false, 0x1, b"par", [1, 1, 1, 1]);
        let ping = masked_frame(true, 0x9, b"", [2, 2, 2, 2]);
        let end = masked_frame(true, 0x0, b"t", [3, 3, 3, 3]);

        let mut out = Vec::new();
        framer.add_data(Data::from_slice(&start), &mut out).unwrap();
        framer.add_data(Data::from_slice(&ping), &mut out).unwrap();
        framer.add_data(Data::from_slice(&end), &mut out).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].opcode, WsOpcode::Ping);
        assert_eq!(out[1].opcode, WsOpcode::Text);
        let mut buf = vec![0u8; 4];
        out[1].resource.copy_to_buf(&mut buf, 0, 4).unwrap();
        assert_eq!(&buf, b"part");
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut framer = WsFramer::with_max_payload(4096, 10);
        let mut frame = vec![0x82u8, 0xFE, 0, 20];
        frame.extend(std::iter::repeat(0u8).take(20));
        let mut out = Vec::new();
        let res = framer.add_data(Data::from_slice(&frame), &mut out);
        assert!(res.is_err());
        assert!(framer.is_poisoned());
    }

    #[test]
    fn split_byte_by_byte_matches_whole() {
        let frame = masked_frame(true, 0x2, b"binary-data", [5, 6, 7, 8]);

        let mut whole = WsFramer::new(4096);
        let mut whole_out = Vec::new();
        whole.add_data(Data::from_slice(&frame), &mut whole_out).unwrap();

        let mut split = WsFramer::new(4096);
        let mut split_out = Vec::new();
        for b in &frame {
            split.add_data(Data::from_slice(std::slice::from_ref(b)), &mut split_out).unwrap();
        }

        assert_eq!(whole_out.len(), 1);
        assert_eq!(split_out.len(), 1);
        let mut a = vec![0u8; 11];
        let mut b = vec![0u8; 11];
        whole_out[0].resource.copy_to_buf(&mut a, 0, 11).unwrap();
        split_out[0].resource.copy_to_buf(&mut b, 0, 11).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, b"binary-data");
    }
}
