use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::buffer::Data;
use crate::error::{NetError, Result};

const DEFAULT_MEM_CACHE_BYTES: u64 = 4 * 1024 * 1024;

enum Backing {
    Memory(Vec<u8>),
    Drive { file: File, _temp: tempfile::TempPath },
}

/// A growable byte container that transparently spills from memory to a
/// temp file once it grows past `mem_cache_bytes`.
///
/// Exactly one backing is live at a time; the memory -> disk transition is
/// one-way. `expected_size` (0 = unknown) drives [`DataResource::is_complete`].
pub struct DataResource {
    backing: Backing,
    size: u64,
    expected_size: u64,
    mem_cache_bytes: u64,
}

impl DataResource {
    pub fn new() -> Self {
        Self::with_mem_cache_bytes(DEFAULT_MEM_CACHE_BYTES)
    }

    pub fn with_mem_cache_bytes(mem_cache_bytes: u64) -> Self {
        Self { backing: Backing::Memory(Vec::new()), size: 0, expected_size: 0, mem_cache_bytes }
    }

    /// Wraps data already fully in hand (e.g. a small parsed body) as a
    /// completed resource.
    pub fn from_data(data: &Data) -> Self {
        let bytes = data.current().to_vec();
        let size = bytes.len() as u64;
        Self { backing: Backing::Memory(bytes), size, expected_size: size, mem_cache_bytes: DEFAULT_MEM_CACHE_BYTES }
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    pub fn set_expected_size(&mut self, expected_size: u64) {
        self.expected_size = expected_size;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_complete(&self) -> bool {
        self.size == self.expected_size
    }

    pub fn use_drive_cache(&self) -> bool {
        matches!(self.backing, Backing::Drive { .. })
    }

    /// Appends `data`'s current view to this resource, spilling to a temp
    /// file if the 4 MiB (or configured) in-memory cap would be exceeded.
    pub fn add_data(&mut self, data: &Data) -> Result<()> {
        let chunk = data.current();
        self.size += chunk.len() as u64;

        match &mut self.backing {
            Backing::Drive { file, .. } => {
                file.write_all(chunk)?;
                Ok(())
            }
            Backing::Memory(buf) => {
                if buf.len() as u64 + chunk.len() as u64 > self.mem_cache_bytes {
                    let (temp_file, temp_path) = Self::create_temp_file()?;
                    let mut file = temp_file;
                    file.write_all(buf)?;
                    file.write_all(chunk)?;
                    self.backing = Backing::Drive { file, _temp: temp_path };
                } else {
                    buf.extend_from_slice(chunk);
                }
                Ok(())
            }
        }
    }

    fn create_temp_file() -> Result<(File, tempfile::TempPath)> {
        let named = tempfile::NamedTempFile::new()?;
        let (file, path) = named.into_parts();
        Ok((file, path))
    }

    /// Copies `buf_size` bytes at `offset` into `buf`, reading whichever
    /// backing is currently active.
    pub fn copy_to_buf(&mut self, buf: &mut [u8], offset: u64, buf_size: usize) -> Result<()> {
        match &mut self.backing {
            Backing::Memory(mem) => {
                let start = offset as usize;
                if start + buf_size > mem.len() {
                    return Err(NetError::ResourceIo(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "copy_to_buf out of range",
                    )));
                }
                buf[..buf_size].copy_from_slice(&mem[start..start + buf_size]);
                Ok(())
            }
            Backing::Drive { file, .. } => {
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut buf[..buf_size])?;
                Ok(())
            }
        }
    }

    /// Moves (renames) the temp file out to `path`, or writes the in-memory
    /// buffer to a new file at `path`.
    pub fn save_to(&mut self, path: &Path) -> Result<()> {
        match &mut self.backing {
            Backing::Drive { file, _temp } => {
                file.flush()?;
                std::fs::rename(&*_temp, path).or_else(|_| std::fs::copy(&*_temp, path).map(|_| ()))?;
                Ok(())
            }
            Backing::Memory(mem) => {
                std::fs::write(path, mem)?;
                Ok(())
            }
        }
    }

    /// Returns a shallow copy of the whole resource as a `Data`, only valid
    /// while the resource stays in memory. Used for small complete messages
    /// where the framer avoids a copy entirely.
    pub fn as_memory_data(&self) -> Option<Data> {
        match &self.backing {
            Backing::Memory(mem) => Some(Data::from_slice(mem)),
            Backing::Drive { .. } => None,
        }
    }
}

impl Default for DataResource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_tracks_appended_bytes() {
        let mut r = DataResource::new();
        r.add_data(&Data::from_slice(b"hello")).unwrap();
        r.add_data(&Data::from_slice(b" world")).unwrap();
        assert_eq!(r.size(), 11);
        assert!(!r.use_drive_cache());
    }

    #[test]
    fn overflow_spills_to_disk_at_exactly_one_byte_past_cap() {
        let mut r = DataResource::with_mem_cache_bytes(8);
        r.add_data(&Data::from_slice(b"12345678")).unwrap();
        assert!(!r.use_drive_cache());
        r.add_data(&Data::from_slice(b"9")).unwrap();
        assert!(r.use_drive_cache());
        assert_eq!(r.size(), 9);

        let mut buf = vec![0u8; 9];
        r.copy_to_buf(&mut buf, 0, 9).unwrap();
        assert_eq!(&buf, b"123456789");
    }

    #[test]
    fn is_complete_tracks_expected_size() {
        let mut r = DataResource::new();
        r.set_expected_size(5);
        assert!(!r.is_complete());
        r.add_data(&Data::from_slice(b"hello")).unwrap();
        assert!(r.is_complete());
    }

    #[test]
    fn save_to_writes_matching_bytes_across_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("out.bin");

        let mut r = DataResource::new();
        let chunk = vec![7u8; 1024 * 1024];
        for _ in 0..5 {
            r.add_data(&Data::from_slice(&chunk)).unwrap();
        }
        assert!(r.use_drive_cache());
        assert_eq!(r.size(), 5 * 1024 * 1024);

        r.save_to(&out_path).unwrap();
        let saved = std::fs::read(&out_path).unwrap();
        assert_eq!(saved.len(), 5 * 1024 * 1024);
        assert!(saved.iter().all(|&b| b == 7));
    }
}
