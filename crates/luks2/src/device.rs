// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
// SPDX-FileCopyrightText: Copyright © 2025 AerynOS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The backing store: an open file/block device plus the positional I/O,
//! advisory locking, and size discovery the header engine needs. Kept
//! separate from [`crate::engine`] so the read/write/commit protocol can
//! be tested against a plain file without a real block device.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};
use snafu::{IntoError, ResultExt, Snafu};

/// Errors opening, locking, or performing I/O against a device.
#[derive(Debug, Snafu)]
pub enum DeviceError {
    #[snafu(display("failed to open {path:?}"))]
    Open { path: PathBuf, source: std::io::Error },

    #[snafu(display("{path:?} is busy (held by another process)"))]
    Busy { path: PathBuf },

    #[snafu(display("failed to lock {path:?}"))]
    Lock { path: PathBuf, source: nix::Error },

    #[snafu(display("failed to stat {path:?}"))]
    Stat { path: PathBuf, source: std::io::Error },

    #[snafu(display("I/O error at offset {offset} on {path:?}"))]
    Io {
        path: PathBuf,
        offset: u64,
        source: std::io::Error,
    },

    #[snafu(display("short read at offset {offset} on {path:?}: got {got} of {want} bytes"))]
    ShortRead {
        path: PathBuf,
        offset: u64,
        got: usize,
        want: usize,
    },
}

/// An open backing device (regular file or block device). A handle opened
/// via [`Device::open`] holds an exclusive advisory lock for its lifetime;
/// one opened via [`Device::open_read_only`] holds none.
pub struct Device {
    path: PathBuf,
    file: File,
    size: u64,
    locked: bool,
}

impl Device {
    /// Open `path` for reading and writing and take an advisory exclusive
    /// lock (`flock(LOCK_EX | LOCK_NB)`), failing immediately rather than
    /// blocking if another process already holds it. Reserved for the
    /// mutating verbs (`format`, `commit`, `add_keyslot`, `wipe_keyslot`,
    /// `wipe`) — spec.md §5 requires the lock held before any on-disk
    /// mutation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .context(OpenSnafu { path: path.clone() })?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(nix::Error::EWOULDBLOCK) => return BusySnafu { path }.fail(),
            Err(source) => return LockSnafu { path, source }.fail(),
        }

        let size = device_size(&path, &file)?;
        Ok(Self {
            path,
            file,
            size,
            locked: true,
        })
    }

    /// Open `path` read-only, without taking any advisory lock. Used by
    /// the read-only verbs (`read`, `info`, `unlock`): spec.md §5 lets them
    /// run concurrently with an in-flight commit rather than contending on
    /// the exclusive lock, tolerating a torn read by falling back to the
    /// backup header copy instead.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .context(OpenSnafu { path: path.clone() })?;

        let size = device_size(&path, &file)?;
        Ok(Self {
            path,
            file,
            size,
            locked: false,
        })
    }

    /// Size of the underlying device or regular file, in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read exactly `buf.len()` bytes starting at `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.file.seek(SeekFrom::Start(offset)).context(IoSnafu {
            path: self.path.clone(),
            offset,
        })?;
        self.file.read_exact(buf).map_err(|source| {
            if source.kind() == std::io::ErrorKind::UnexpectedEof {
                ShortReadSnafu {
                    path: self.path.clone(),
                    offset,
                    got: 0usize,
                    want: buf.len(),
                }
                .build()
            } else {
                IoSnafu {
                    path: self.path.clone(),
                    offset,
                }
                .into_error(source)
            }
        })
    }

    /// Write `buf` at `offset`. Does not itself `fsync`; callers that need
    /// durability call [`Device::sync`] explicitly once the full write
    /// sequence for a step has completed.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        self.file.seek(SeekFrom::Start(offset)).context(IoSnafu {
            path: self.path.clone(),
            offset,
        })?;
        self.file.write_all(buf).context(IoSnafu {
            path: self.path.clone(),
            offset,
        })
    }

    /// Flush the device's in-kernel buffers to stable storage.
    pub fn sync(&mut self) -> Result<(), DeviceError> {
        self.file.sync_all().context(IoSnafu {
            path: self.path.clone(),
            offset: 0,
        })
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.locked {
            let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        }
    }
}

fn device_size(path: &Path, file: &File) -> Result<u64, DeviceError> {
    let metadata = file.metadata().context(StatSnafu { path: path.to_path_buf() })?;
    if metadata.file_type().is_block_device() {
        block_device_size(file).context(StatSnafu { path: path.to_path_buf() })
    } else {
        Ok(metadata.len())
    }
}

#[cfg(target_os = "linux")]
fn block_device_size(file: &File) -> std::io::Result<u64> {
    // BLKGETSIZE64, see linux/fs.h. Not exposed by nix's fs feature set,
    // so the ioctl is issued directly.
    nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
    let mut size: u64 = 0;
    unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }
        .map(|_| size)
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(file: &File) -> std::io::Result<u64> {
    file.metadata().map(|m| m.len())
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test_log::test]
    fn opens_and_reports_size_of_regular_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 8192]).unwrap();
        tmp.flush().unwrap();

        let device = Device::open(tmp.path()).unwrap();
        assert_eq!(device.size(), 8192);
    }

    #[test_log::test]
    fn read_write_round_trips() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 8192]).unwrap();
        tmp.flush().unwrap();

        let mut device = Device::open(tmp.path()).unwrap();
        device.write_at(100, b"hello device").unwrap();
        let mut buf = [0u8; 12];
        device.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello device");
    }

    #[test_log::test]
    fn second_open_is_rejected_while_first_is_held() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 8192]).unwrap();
        tmp.flush().unwrap();

        let _first = Device::open(tmp.path()).unwrap();
        let second = Device::open(tmp.path());
        assert!(matches!(second, Err(DeviceError::Busy { .. })));
    }

    #[test_log::test]
    fn read_only_open_does_not_contend_with_an_exclusive_lock() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 8192]).unwrap();
        tmp.flush().unwrap();

        let _writer = Device::open(tmp.path()).unwrap();
        let reader = Device::open_read_only(tmp.path());
        assert!(reader.is_ok());
    }

    #[test_log::test]
    fn short_read_past_end_of_file_is_reported() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; 16]).unwrap();
        tmp.flush().unwrap();

        let mut device = Device::open(tmp.path()).unwrap();
        let mut buf = [0u8; 32];
        assert!(matches!(device.read_at(0, &mut buf), Err(DeviceError::ShortRead { .. })));
    }
}
