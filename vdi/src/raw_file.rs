// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};

/// Backing file of an image.
///
/// All I/O is positional. Clones share the kernel file description, so
/// the file position is never used and any number of threads may issue
/// reads and writes concurrently.
#[derive(Debug)]
pub struct RawFile {
    file: File,
}

impl RawFile {
    pub fn new(file: File) -> Self {
        RawFile { file }
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(RawFile {
            file: self.file.try_clone()?,
        })
    }

    /// Read exactly `buf.len()` bytes at `offset`, looping on short reads.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut total = 0usize;
        while total < buf.len() {
            // SAFETY: buf and fd are valid for the lifetime of the call.
            let ret = unsafe {
                libc::pread64(
                    self.file.as_raw_fd(),
                    buf[total..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - total,
                    (offset + total as u64) as libc::off64_t,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if ret == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            total += ret as usize;
        }
        Ok(())
    }

    /// Write all of `buf` at `offset`, looping on short writes.
    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut total = 0usize;
        while total < buf.len() {
            // SAFETY: buf and fd are valid for the lifetime of the call.
            let ret = unsafe {
                libc::pwrite64(
                    self.file.as_raw_fd(),
                    buf[total..].as_ptr() as *const libc::c_void,
                    buf.len() - total,
                    (offset + total as u64) as libc::off64_t,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if ret == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            total += ret as usize;
        }
        Ok(())
    }

    /// Truncates or extends the file. Extended space reads as zeros.
    pub fn set_len(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    pub fn sync_all(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Length of the file in bytes.
    pub fn physical_size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl AsRawFd for RawFile {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(test)]
mod unit_tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_positional_io() {
        let temp_file = TempFile::new().unwrap();
        let raw = RawFile::new(temp_file.as_file().try_clone().unwrap());
        let clone = raw.try_clone().unwrap();

        raw.write_all_at(&[1, 2, 3, 4], 4096).unwrap();
        assert_eq!(clone.physical_size().unwrap(), 4100);

        let mut buf = [0xffu8; 6];
        clone.read_exact_at(&mut buf, 4094).unwrap();
        assert_eq!(buf, [0, 0, 1, 2, 3, 4]);

        let err = raw.read_exact_at(&mut buf, 4098).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        raw.set_len(1 << 20).unwrap();
        assert_eq!(raw.physical_size().unwrap(), 1 << 20);
        raw.sync_all().unwrap();
    }
}
