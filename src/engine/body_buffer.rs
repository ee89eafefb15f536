//! Bounded body buffer that spills to a temp file.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Body buffer owned by one transaction.
///
/// Writes stay in memory until the total would exceed `mem_limit`; the
/// buffered bytes are then moved to a temp file in `tmp_dir` and every
/// later write is appended to it. The temp file is removed by
/// [`BodyBuffer::close`] or on drop.
#[derive(Debug)]
pub struct BodyBuffer {
    memory: Vec<u8>,
    file: Option<NamedTempFile>,
    len: u64,
    mem_limit: u64,
    tmp_dir: PathBuf,
    closed: bool,
}

impl BodyBuffer {
    /// Create an empty buffer.
    pub fn new(mem_limit: u64, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            memory: Vec::new(),
            file: None,
            len: 0,
            mem_limit,
            tmp_dir: tmp_dir.into(),
            closed: false,
        }
    }

    /// Total bytes written.
    pub fn size(&self) -> u64 {
        self.len
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the spill file, if the buffer spilled.
    pub fn spill_path(&self) -> Option<&Path> {
        self.file.as_ref().map(NamedTempFile::path)
    }

    /// Reader over everything written so far, in write order.
    pub fn reader(&mut self) -> io::Result<BodyReader<'_>> {
        match &mut self.file {
            Some(file) => {
                file.as_file_mut().flush()?;
                let mut handle = file.reopen()?;
                handle.seek(SeekFrom::Start(0))?;
                Ok(BodyReader::File(handle))
            }
            None => Ok(BodyReader::Memory(Cursor::new(&self.memory))),
        }
    }

    /// Read at most `limit` bytes into memory.
    pub fn read_prefix(&mut self, limit: u64) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.len.min(limit) as usize);
        self.reader()?.take(limit).read_to_end(&mut out)?;
        Ok(out)
    }

    /// Remove the spill file and release memory. Safe to call repeatedly.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.memory = Vec::new();
        if let Some(file) = self.file.take() {
            debug!(path = %file.path().display(), "removing body spill file");
            file.close()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> io::Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("body-")
            .tempfile_in(&self.tmp_dir)?;
        file.write_all(&self.memory)?;
        debug!(path = %file.path().display(), bytes = self.memory.len(), "body spilled to disk");
        self.memory = Vec::new();
        self.file = Some(file);
        Ok(())
    }
}

impl Write for BodyBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::Other, "body buffer is closed"));
        }
        if self.file.is_none() && self.len + buf.len() as u64 > self.mem_limit {
            self.spill()?;
        }
        match &mut self.file {
            Some(file) => file.write_all(buf)?,
            None => self.memory.extend_from_slice(buf),
        }
        self.len += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for BodyBuffer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Reader returned by [`BodyBuffer::reader`].
pub enum BodyReader<'a> {
    /// Body held in memory.
    Memory(Cursor<&'a Vec<u8>>),
    /// Body spilled to disk.
    File(File),
}

impl Read for BodyReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BodyReader::Memory(c) => c.read(buf),
            BodyReader::File(f) => f.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(buffer: &mut BodyBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        buffer.reader().unwrap().read_to_end(&mut out).unwrap();
        out
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = BodyBuffer::new(1024, dir.path());
        buffer.write_all(b"hello ").unwrap();
        buffer.write_all(b"world").unwrap();
        assert_eq!(buffer.size(), 11);
        assert!(buffer.spill_path().is_none());
        assert_eq!(read_all(&mut buffer), b"hello world");
        assert_eq!(files_in(dir.path()), 0);
    }

    #[test]
    fn test_spill_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = BodyBuffer::new(8, dir.path());
        buffer.write_all(b"abcdefghij").unwrap();
        buffer.write_all(b"klmno").unwrap();
        assert_eq!(buffer.size(), 15);
        assert_eq!(read_all(&mut buffer), b"abcdefghijklmno");
        assert_eq!(files_in(dir.path()), 1);

        buffer.close().unwrap();
        assert_eq!(files_in(dir.path()), 0);
        buffer.close().unwrap();
        assert!(buffer.write_all(b"x").is_err());
    }

    #[test]
    fn test_spill_keeps_memory_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = BodyBuffer::new(4, dir.path());
        buffer.write_all(b"abc").unwrap();
        assert!(buffer.spill_path().is_none());
        buffer.write_all(b"def").unwrap();
        assert!(buffer.spill_path().is_some());
        assert_eq!(read_all(&mut buffer), b"abcdef");
        assert_eq!(buffer.read_prefix(4).unwrap(), b"abcd");
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut buffer = BodyBuffer::new(0, dir.path());
            buffer.write_all(b"x").unwrap();
            assert_eq!(files_in(dir.path()), 1);
        }
        assert_eq!(files_in(dir.path()), 0);
    }
}
