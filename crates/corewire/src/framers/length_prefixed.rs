//! The simple length-prefixed wire: `u8 type || u32 size (LE) || size bytes`.
//! No footer, no multi-frame message concept.

use crate::buffer::Data;
use crate::cutter::{Cut, HeaderOutcome, TapeCutter};
use crate::error::{NetError, Result};
use crate::resource::DataResource;

const HEADER_LEN: usize = 5; // 1 byte type + 4 byte LE size

/// One fully-collected simple frame.
pub struct SimpleMessage {
    pub msg_type: u8,
    pub resource: DataResource,
}

struct SimpleCut {
    msg_type: u8,
    resource: DataResource,
    mem_cache_bytes: u64,
    completed: Vec<SimpleMessage>,
    io_error: Option<NetError>,
}

impl SimpleCut {
    fn new(mem_cache_bytes: u64) -> Self {
        Self {
            msg_type: 0,
            resource: DataResource::new(),
            mem_cache_bytes,
            completed: Vec::new(),
            io_error: None,
        }
    }
}

impl Cut for SimpleCut {
    fn find_header(&mut self, tape: &mut Data) -> HeaderOutcome {
        let view = tape.current();
        if view.len() < HEADER_LEN {
            return HeaderOutcome::KeepWaiting;
        }
        let msg_type = view[0];
        let size = u32::from_le_bytes([view[1], view[2], view[3], view[4]]);
        tape.add_offset(HEADER_LEN);

        self.msg_type = msg_type;
        self.resource = DataResource::with_mem_cache_bytes(self.mem_cache_bytes);
        self.resource.set_expected_size(u64::from(size));
        HeaderOutcome::Found { expected_cut_size: u64::from(size) }
    }

    fn add_body(&mut self, body: &Data) {
        if let Err(e) = self.resource.add_data(body) {
            self.io_error.get_or_insert(e);
        }
    }

    fn find_footer(&mut self, _tape: &mut Data) {
        let resource = std::mem::replace(&mut self.resource, DataResource::with_mem_cache_bytes(self.mem_cache_bytes));
        self.completed.push(SimpleMessage { msg_type: self.msg_type, resource });
    }
}

/// Drives [`SimpleCut`] over incoming bytes, emitting completed
/// [`SimpleMessage`]s in arrival order.
pub struct SimpleFramer {
    cutter: TapeCutter<SimpleCut>,
}

impl SimpleFramer {
    pub fn new(mem_cache_bytes: u64) -> Self {
        Self { cutter: TapeCutter::new(SimpleCut::new(mem_cache_bytes)) }
    }

    pub fn is_poisoned(&self) -> bool {
        self.cutter.is_poisoned()
    }

    pub fn add_data(&mut self, mut data: Data, out: &mut Vec<SimpleMessage>) -> Result<()> {
        self.cutter.add_data(&mut data);
        if let Some(e) = self.cutter.cut_mut().io_error.take() {
            return Err(e);
        }
        out.append(&mut self.cutter.cut_mut().completed);
        Ok(())
    }
}

/// Serializes a type/payload pair into the wire header + body, ready to
/// hand to a socket's write queue.
pub fn encode(msg_type: u8, payload: &[u8]) -> Data {
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.push(msg_type);
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(payload);
    Data::from_vec(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_frame_in_one_call() {
        let mut framer = SimpleFramer::new(4096);
        let wire = encode(7, b"hello");
        let mut out = Vec::new();
        framer.add_data(wire, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].msg_type, 7);
        assert_eq!(out[0].resource.size(), 5);
        let mut buf = vec![0u8; 5];
        out[0].resource.copy_to_buf(&mut buf, 0, 5).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn zero_length_body_emits_immediately() {
        let mut framer = SimpleFramer::new(4096);
        let wire = encode(1, b"");
        let mut out = Vec::new();
        framer.add_data(wire, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].resource.size(), 0);
    }

    #[test]
    fn two_frames_back_to_back_both_emit() {
        let mut framer = SimpleFramer::new(4096);
        let mut wire = encode(1, b"ab").current().to_vec();
        wire.extend_from_slice(encode(2, b"cde").current());
        let mut out = Vec::new();
        framer.add_data(Data::from_vec(wire), &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].msg_type, 1);
        assert_eq!(out[1].msg_type, 2);
    }

    #[test]
    fn split_byte_by_byte_matches_one_shot() {
        let wire = encode(9, b"payload-bytes").current().to_vec();

        let mut whole = SimpleFramer::new(4096);
        let mut whole_out = Vec::new();
        whole.add_data(Data::from_vec(wire.clone()), &mut whole_out).unwrap();

        let mut split = SimpleFramer::new(4096);
        let mut split_out = Vec::new();
        for b in &wire {
            split.add_data(Data::from_slice(std::slice::from_ref(b)), &mut split_out).unwrap();
        }

        assert_eq!(whole_out.len(), 1);
        assert_eq!(split_out.len(), 1);
        let mut a = vec![0u8; 13];
        let mut b = vec![0u8; 13];
        whole_out[0].resource.copy_to_buf(&mut a, 0, 13).unwrap();
        split_out[0].resource.copy_to_buf(&mut b, 0, 13).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, b"payload-bytes");
    }
}
