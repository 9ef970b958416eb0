use std::sync::Arc;

/// An owning byte sequence with a read offset.
///
/// `current()` is always `bytes[offset..]`. Advancing the offset never
/// shrinks the backing store — it only changes what is visible. Cloning a
/// `Data` (via [`Data::shallow_copy`]) shares the backing `Arc` so multiple
/// framers/messages can hold views into the same bytes without copying.
#[derive(Clone, Debug, Default)]
pub struct Data {
    bytes: Arc<Vec<u8>>,
    offset: usize,
    // Bounds the current view; `None` means "to the end of `bytes`".
    len: Option<usize>,
}

impl Data {
    pub fn new() -> Self {
        Self { bytes: Arc::new(Vec::new()), offset: 0, len: None }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes: Arc::new(bytes), offset: 0, len: None }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::from_vec(bytes.to_vec())
    }

    /// Appends bytes to the backing store. If this `Data` shares its store
    /// with another view (offset != 0 or a previous `reslice`), the store is
    /// copied first so the append is never observed by other holders.
    pub fn add(&mut self, other: &[u8]) {
        if other.is_empty() {
            return;
        }
        let buf = Arc::make_mut(&mut self.bytes);
        if self.offset != 0 {
            buf.drain(..self.offset);
            self.offset = 0;
        }
        buf.extend_from_slice(other);
        self.len = None;
    }

    /// Total size of the backing store (ignoring the current offset).
    pub fn total_size(&self) -> usize {
        self.bytes.len()
    }

    /// Size of the current view (`bytes[offset..offset+len]`).
    pub fn current_size(&self) -> usize {
        let end = self.len.map_or(self.bytes.len(), |l| (self.offset + l).min(self.bytes.len()));
        end.saturating_sub(self.offset)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.current_size() == 0
    }

    /// Advances the offset by `n`; clamps to the end of the current view.
    pub fn add_offset(&mut self, n: usize) {
        let cur = self.current_size();
        self.offset += n.min(cur);
    }

    pub fn set_offset(&mut self, offset: usize) -> bool {
        if offset > self.bytes.len() {
            return false;
        }
        self.offset = offset;
        true
    }

    /// Shrinks the current view to `size` bytes without touching the
    /// backing store.
    pub fn set_current_size(&mut self, size: usize) -> bool {
        if self.offset + size > self.bytes.len() {
            return false;
        }
        self.len = Some(size);
        true
    }

    pub fn current(&self) -> &[u8] {
        let end = self.len.map_or(self.bytes.len(), |l| (self.offset + l).min(self.bytes.len()));
        &self.bytes[self.offset..end]
    }

    /// A new `Data` sharing the same backing store, independent offset/size.
    pub fn shallow_copy(&self) -> Self {
        self.clone()
    }

    /// Copies `dest_size` bytes starting at `offset` in the current view
    /// into `dest`. Caller-side use only; does not touch `self`.
    pub fn copy_to(&self, dest: &mut [u8], offset: usize, dest_size: usize) -> bool {
        let view = self.current();
        if offset + dest_size > view.len() || dest.len() < dest_size {
            return false;
        }
        dest[..dest_size].copy_from_slice(&view[offset..offset + dest_size]);
        true
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }
}
