//! Positional-I/O storage backends.
//!
//! The engine never touches the filesystem directly; every container file is
//! accessed through [`StorageBackend`]. [`MemBackend`] backs tests and callers
//! that assemble images in RAM, [`StdFileBackend`] wraps a [`std::fs::File`]
//! without disturbing its cursor.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::util::checked_range;
use crate::{DiskError, Result};

/// Byte-addressed positional I/O over one container file.
///
/// Reads past end-of-file are [`DiskError::OutOfBounds`]; writes past
/// end-of-file extend the file, with the implied gap reading back as zeroes.
pub trait StorageBackend {
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn set_len(&mut self, len: u64) -> Result<()>;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

/// Growable in-memory backend.
#[derive(Debug, Clone, Default)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: u64) -> Result<Self> {
        let len: usize = len.try_into().map_err(|_| DiskError::OffsetOverflow)?;
        Ok(Self {
            data: vec![0u8; len],
        })
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl StorageBackend for MemBackend {
    fn len(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len: usize = len.try_into().map_err(|_| DiskError::OffsetOverflow)?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        let end: usize = end.try_into().map_err(|_| DiskError::OffsetOverflow)?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// [`std::fs::File`] backend using platform positional I/O.
///
/// The file cursor is left untouched so a caller can keep using the handle
/// after [`StdFileBackend::into_file`].
#[derive(Debug)]
pub struct StdFileBackend {
    file: File,
    read_only: bool,
}

impl StdFileBackend {
    pub fn from_file(file: File) -> Self {
        Self {
            file,
            read_only: false,
        }
    }

    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::from_file(file))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::from_file(file))
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self {
            file,
            read_only: true,
        })
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn into_file(self) -> File {
        self.file
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(DiskError::Unsupported("read-only backend"));
        }
        Ok(())
    }
}

impl StorageBackend for StdFileBackend {
    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.check_writable()?;
        self.file.set_len(len)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len()?)?;
        read_exact_at(&self.file, offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_writable()?;
        offset
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        write_all_at(&self.file, offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)?;
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, offset: u64, buf: &[u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)?;
    Ok(())
}

#[cfg(not(unix))]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = file;
    let saved = file.stream_position()?;
    file.seek(SeekFrom::Start(offset))?;
    let res = file.read_exact(buf);
    file.seek(SeekFrom::Start(saved))?;
    res?;
    Ok(())
}

#[cfg(not(unix))]
fn write_all_at(file: &File, offset: u64, buf: &[u8]) -> Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut file = file;
    let saved = file.stream_position()?;
    file.seek(SeekFrom::Start(offset))?;
    let res = file.write_all(buf);
    file.seek(SeekFrom::Start(saved))?;
    res?;
    Ok(())
}
