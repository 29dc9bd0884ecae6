use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Synchronous positional I/O over a single file-like resource.
///
/// All methods are blocking; there is no `async fn` anywhere in this trait, matching this
/// crate's single-reader-writer-lock concurrency model, which holds its lock across disk I/O.
pub trait RandomAccessFile: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;
    fn len(&self) -> Result<u64>;

    /// Extend the file to at least `n` bytes. Returns `Ok(false)` if the backend could not grow
    /// (e.g. a read-only or embedded backend, or the OS refused); does not error in that case.
    fn ensure_length(&self, n: u64) -> Result<bool>;

    fn synch(&self) -> Result<()>;

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let mut read = 0;
        while read != buf.len() {
            let n = self.read_at(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "unexpected end-of-file",
                )));
            }
            read += n;
        }
        Ok(())
    }

    fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut written = 0;
        while written != buf.len() {
            written += self.write_at(&buf[written..], offset + written as u64)?;
        }
        Ok(())
    }

    fn read_i32_at(&self, offset: u64) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact_at(&mut buf, offset)?;
        Ok(i32::from_be_bytes(buf))
    }

    fn write_i32_at(&self, value: i32, offset: u64) -> Result<()> {
        self.write_all_at(&value.to_be_bytes(), offset)
    }

    fn read_i64_at(&self, offset: u64) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact_at(&mut buf, offset)?;
        Ok(i64::from_be_bytes(buf))
    }

    fn write_i64_at(&self, value: i64, offset: u64) -> Result<()> {
        self.write_all_at(&value.to_be_bytes(), offset)
    }
}

/// Plain buffered read-write backend, positional I/O via `pread`/`pwrite`.
pub struct PlainFile {
    file: File,
}

impl PlainFile {
    fn pread(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(nix::sys::uio::pread(file, buf, offset as i64)?)
    }

    fn pwrite(file: &File, buf: &[u8], offset: u64) -> Result<usize> {
        Ok(nix::sys::uio::pwrite(file, buf, offset as i64)?)
    }
}

impl RandomAccessFile for PlainFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Self::pread(&self.file, buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        Self::pwrite(&self.file, buf, offset)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn ensure_length(&self, n: u64) -> Result<bool> {
        if self.len()? >= n {
            return Ok(true);
        }
        match self.file.set_len(n) {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, requested = n, "failed to grow data file");
                Ok(false)
            }
        }
    }

    fn synch(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Read-only backend; every write fails with [`Error::DataFile`].
pub struct ReadOnlyFile {
    file: File,
}

impl RandomAccessFile for ReadOnlyFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(nix::sys::uio::pread(&self.file, buf, offset as i64)?)
    }

    fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::data_file("file is read-only"))
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn ensure_length(&self, _n: u64) -> Result<bool> {
        Ok(false)
    }

    fn synch(&self) -> Result<()> {
        Ok(())
    }
}

/// Memory-mapped read-write backend, used when `PageStoreConfig::nio_data_file` is set.
pub struct MappedFile {
    file: File,
    mmap: Mutex<memmap2::MmapMut>,
}

impl MappedFile {
    pub fn open(file: File) -> Result<Self> {
        if file.metadata()?.len() == 0 {
            file.set_len(crate::scale::HEADER_SIZE)?;
        }
        let mmap = unsafe { memmap2::MmapMut::map_mut(&file)? };
        Ok(Self {
            file,
            mmap: Mutex::new(mmap),
        })
    }

    fn remap(&self) -> Result<()> {
        let mut guard = self.mmap.lock();
        *guard = unsafe { memmap2::MmapMut::map_mut(&self.file)? };
        Ok(())
    }
}

impl RandomAccessFile for MappedFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let guard = self.mmap.lock();
        let offset = offset as usize;
        if offset >= guard.len() {
            return Ok(0);
        }
        let n = buf.len().min(guard.len() - offset);
        buf[..n].copy_from_slice(&guard[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        let mut guard = self.mmap.lock();
        let offset = offset as usize;
        if offset + buf.len() > guard.len() {
            return Err(Error::data_file(
                "write past mapped length; call ensure_length first",
            ));
        }
        guard[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn ensure_length(&self, n: u64) -> Result<bool> {
        if self.len()? >= n {
            return Ok(true);
        }
        match self.file.set_len(n) {
            Ok(()) => {
                self.remap()?;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(error = %e, requested = n, "failed to grow mapped data file");
                Ok(false)
            }
        }
    }

    fn synch(&self) -> Result<()> {
        self.mmap.lock().flush()?;
        Ok(())
    }
}

/// Read-only backend over an in-memory byte slice, standing in for a resource embedded inside
/// the hosting application's bundle.
pub struct EmbeddedFile {
    bytes: Vec<u8>,
}

impl EmbeddedFile {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl RandomAccessFile for EmbeddedFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let offset = offset as usize;
        if offset >= self.bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.bytes.len() - offset);
        buf[..n].copy_from_slice(&self.bytes[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize> {
        Err(Error::data_file("embedded file is read-only"))
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.len() as u64)
    }

    fn ensure_length(&self, _n: u64) -> Result<bool> {
        Ok(false)
    }

    fn synch(&self) -> Result<()> {
        Ok(())
    }
}

/// One trait, tagged-variant dispatch over the four backends.
pub enum AnyFile {
    Plain(PlainFile),
    ReadOnly(ReadOnlyFile),
    Mapped(MappedFile),
    Embedded(EmbeddedFile),
}

impl RandomAccessFile for AnyFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            AnyFile::Plain(f) => f.read_at(buf, offset),
            AnyFile::ReadOnly(f) => f.read_at(buf, offset),
            AnyFile::Mapped(f) => f.read_at(buf, offset),
            AnyFile::Embedded(f) => f.read_at(buf, offset),
        }
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        match self {
            AnyFile::Plain(f) => f.write_at(buf, offset),
            AnyFile::ReadOnly(f) => f.write_at(buf, offset),
            AnyFile::Mapped(f) => f.write_at(buf, offset),
            AnyFile::Embedded(f) => f.write_at(buf, offset),
        }
    }

    fn len(&self) -> Result<u64> {
        match self {
            AnyFile::Plain(f) => f.len(),
            AnyFile::ReadOnly(f) => f.len(),
            AnyFile::Mapped(f) => f.len(),
            AnyFile::Embedded(f) => f.len(),
        }
    }

    fn ensure_length(&self, n: u64) -> Result<bool> {
        match self {
            AnyFile::Plain(f) => f.ensure_length(n),
            AnyFile::ReadOnly(f) => f.ensure_length(n),
            AnyFile::Mapped(f) => f.ensure_length(n),
            AnyFile::Embedded(f) => f.ensure_length(n),
        }
    }

    fn synch(&self) -> Result<()> {
        match self {
            AnyFile::Plain(f) => f.synch(),
            AnyFile::ReadOnly(f) => f.synch(),
            AnyFile::Mapped(f) => f.synch(),
            AnyFile::Embedded(f) => f.synch(),
        }
    }
}

/// Which backend to construct when opening a data file.
pub enum FileOpenKind {
    ReadWrite { mapped: bool },
    ReadOnly,
}

impl AnyFile {
    pub fn open(kind: FileOpenKind, path: &Path) -> Result<Self> {
        match kind {
            FileOpenKind::ReadOnly => {
                let file = OpenOptions::new().read(true).open(path)?;
                Ok(AnyFile::ReadOnly(ReadOnlyFile { file }))
            }
            FileOpenKind::ReadWrite { mapped } => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)?;
                if mapped {
                    Ok(AnyFile::Mapped(MappedFile::open(file)?))
                } else {
                    Ok(AnyFile::Plain(PlainFile { file }))
                }
            }
        }
    }

    pub fn embedded(bytes: Vec<u8>) -> Self {
        AnyFile::Embedded(EmbeddedFile::new(bytes))
    }
}
