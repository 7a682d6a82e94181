//! Spool buffer for staged file content.
//!
//! Small files stay in memory; once a buffer grows past the threshold it
//! moves to an anonymous temp file so large uploads don't pin RAM.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

#[derive(Debug)]
enum Backing {
    Memory(Vec<u8>),
    Disk { file: File, len: u64 },
}

#[derive(Debug)]
pub struct SpoolBuffer {
    backing: Backing,
    threshold: u64,
}

impl SpoolBuffer {
    pub fn new(threshold: u64) -> Self {
        Self {
            backing: Backing::Memory(Vec::new()),
            threshold,
        }
    }

    pub fn from_bytes(data: Vec<u8>, threshold: u64) -> io::Result<Self> {
        let mut buf = Self {
            backing: Backing::Memory(data),
            threshold,
        };
        buf.maybe_spill(0)?;
        Ok(buf)
    }

    pub fn len(&self) -> u64 {
        match &self.backing {
            Backing::Memory(v) => v.len() as u64,
            Backing::Disk { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_on_disk(&self) -> bool {
        matches!(self.backing, Backing::Disk { .. })
    }

    /// Move to disk if the buffer would exceed the threshold after growing by `extra`.
    fn maybe_spill(&mut self, extra: u64) -> io::Result<()> {
        if let Backing::Memory(data) = &self.backing {
            if data.len() as u64 + extra <= self.threshold {
                return Ok(());
            }
            let mut file = tempfile::tempfile()?;
            file.write_all(data)?;
            let len = data.len() as u64;
            self.backing = Backing::Disk { file, len };
        }
        Ok(())
    }

    /// Bytes in `[offset, offset + size)`, clamped to the buffer length.
    pub fn read_at(&mut self, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        let len = self.len();
        if offset >= len {
            return Ok(Vec::new());
        }
        let end = (offset + size as u64).min(len);
        match &mut self.backing {
            Backing::Memory(v) => Ok(v[offset as usize..end as usize].to_vec()),
            Backing::Disk { file, .. } => {
                let mut out = vec![0u8; (end - offset) as usize];
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut out)?;
                Ok(out)
            }
        }
    }

    /// Write at `offset`. A gap past the current end is zero-filled.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let end = offset + data.len() as u64;
        let grow = end.saturating_sub(self.len());
        self.maybe_spill(grow)?;
        match &mut self.backing {
            Backing::Memory(v) => {
                if end as usize > v.len() {
                    v.resize(end as usize, 0);
                }
                v[offset as usize..end as usize].copy_from_slice(data);
            }
            Backing::Disk { file, len } => {
                if offset > *len {
                    file.set_len(offset)?;
                }
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(data)?;
                *len = (*len).max(end);
            }
        }
        Ok(())
    }

    pub fn truncate(&mut self, size: u64) -> io::Result<()> {
        let grow = size.saturating_sub(self.len());
        self.maybe_spill(grow)?;
        match &mut self.backing {
            Backing::Memory(v) => v.resize(size as usize, 0),
            Backing::Disk { file, len } => {
                file.set_len(size)?;
                *len = size;
            }
        }
        Ok(())
    }

    /// Whole content, for upload.
    pub fn contents(&mut self) -> io::Result<Vec<u8>> {
        match &mut self.backing {
            Backing::Memory(v) => Ok(v.clone()),
            Backing::Disk { file, len } => {
                let mut out = Vec::with_capacity(*len as usize);
                file.seek(SeekFrom::Start(0))?;
                file.take(*len).read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}
