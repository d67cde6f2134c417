// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::{io, ptr, slice};

use vmm_sys_util::eventfd::EventFd;

use crate::async_io::{
    AsyncIo, AsyncIoError, AsyncIoResult, BorrowedDiskFd, DiskFile, DiskFileError, DiskFileResult,
};
use crate::vdi::{alloc_buffer, Result as VdiResult, Vdi};

/// VDI image exposed to the block device emulation.
///
/// Requests are served synchronously by the submitting thread, each queue
/// working on its own clone of the image handle.
pub struct VdiDiskSync {
    vdi: Vdi,
}

impl VdiDiskSync {
    pub fn new(file: File) -> VdiResult<Self> {
        Ok(VdiDiskSync {
            vdi: Vdi::new(file)?,
        })
    }
}

impl From<Vdi> for VdiDiskSync {
    fn from(vdi: Vdi) -> Self {
        VdiDiskSync { vdi }
    }
}

impl DiskFile for VdiDiskSync {
    fn logical_size(&mut self) -> DiskFileResult<u64> {
        Ok(self.vdi.virtual_size())
    }

    fn physical_size(&mut self) -> DiskFileResult<u64> {
        self.vdi
            .physical_size()
            .map_err(|e| DiskFileError::Size(io::Error::other(e)))
    }

    fn new_async_io(&self, _ring_depth: u32) -> DiskFileResult<Box<dyn AsyncIo>> {
        let vdi = self
            .vdi
            .try_clone()
            .map_err(|e| DiskFileError::NewAsyncIo(io::Error::other(e)))?;
        Ok(Box::new(VdiSync::new(vdi).map_err(DiskFileError::NewAsyncIo)?) as Box<dyn AsyncIo>)
    }

    fn fd(&mut self) -> BorrowedDiskFd<'_> {
        BorrowedDiskFd::new(self.vdi.as_raw_fd())
    }
}

pub struct VdiSync {
    vdi: Vdi,
    eventfd: EventFd,
    completion_list: VecDeque<(u64, i32)>,
}

impl VdiSync {
    fn new(vdi: Vdi) -> io::Result<Self> {
        Ok(VdiSync {
            vdi,
            eventfd: EventFd::new(libc::EFD_NONBLOCK)?,
            completion_list: VecDeque::new(),
        })
    }

    fn complete(&mut self, user_data: u64, result: i32) -> AsyncIoResult<()> {
        self.completion_list.push_back((user_data, result));
        self.eventfd.write(1).map_err(AsyncIoError::Notify)
    }
}

/// Total length of a request, which must fit in the completion result.
fn request_len(iovecs: &[libc::iovec]) -> io::Result<(usize, i32)> {
    let total_len = iovecs
        .iter()
        .try_fold(0usize, |len, iov| len.checked_add(iov.iov_len));
    total_len
        .and_then(|len| Some((len, i32::try_from(len).ok()?)))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "request too large"))
}

/// Copy data into iovecs, treating them as one flat buffer.
///
/// # Safety
/// Caller must ensure iovecs point to valid, writable memory of sufficient size.
unsafe fn scatter_to_iovecs(iovecs: &[libc::iovec], data: &[u8]) {
    let mut remaining = data;
    for iov in iovecs {
        if remaining.is_empty() {
            break;
        }
        let count = iov.iov_len.min(remaining.len());
        // SAFETY: iov_base is valid for iov_len bytes per caller contract.
        unsafe { ptr::copy_nonoverlapping(remaining.as_ptr(), iov.iov_base as *mut u8, count) };
        remaining = &remaining[count..];
    }
}

/// Gather the content of iovecs into `buf`, which must be as large as the
/// sum of their lengths.
///
/// # Safety
/// Caller must ensure iovecs point to valid, readable memory of sufficient size.
unsafe fn gather_from_iovecs(iovecs: &[libc::iovec], buf: &mut [u8]) {
    let mut pos = 0usize;
    for iov in iovecs {
        // SAFETY: iov_base is valid for iov_len bytes per caller contract.
        let src = unsafe { slice::from_raw_parts(iov.iov_base as *const u8, iov.iov_len) };
        buf[pos..pos + iov.iov_len].copy_from_slice(src);
        pos += iov.iov_len;
    }
}

impl AsyncIo for VdiSync {
    fn notifier(&self) -> &EventFd {
        &self.eventfd
    }

    fn read_vectored(
        &mut self,
        offset: libc::off_t,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> AsyncIoResult<()> {
        let (total_len, result) = request_len(iovecs).map_err(AsyncIoError::ReadVectored)?;
        let mut buf = alloc_buffer(total_len)
            .map_err(|e| AsyncIoError::ReadVectored(io::Error::other(e)))?;
        self.vdi
            .read_at(&mut buf, offset as u64)
            .map_err(|e| AsyncIoError::ReadVectored(io::Error::other(e)))?;
        // SAFETY: iovecs point to valid guest memory buffers
        unsafe { scatter_to_iovecs(iovecs, &buf) };

        self.complete(user_data, result)
    }

    fn write_vectored(
        &mut self,
        offset: libc::off_t,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> AsyncIoResult<()> {
        let (total_len, result) = request_len(iovecs).map_err(AsyncIoError::WriteVectored)?;
        let mut buf = alloc_buffer(total_len)
            .map_err(|e| AsyncIoError::WriteVectored(io::Error::other(e)))?;
        // SAFETY: iovecs point to valid guest memory buffers
        unsafe { gather_from_iovecs(iovecs, &mut buf) };
        self.vdi
            .write_at(&buf, offset as u64)
            .map_err(|e| AsyncIoError::WriteVectored(io::Error::other(e)))?;

        self.complete(user_data, result)
    }

    fn fsync(&mut self, user_data: Option<u64>) -> AsyncIoResult<()> {
        self.vdi
            .flush()
            .map_err(|e| AsyncIoError::Fsync(io::Error::other(e)))?;
        match user_data {
            Some(user_data) => self.complete(user_data, 0),
            None => Ok(()),
        }
    }

    fn next_completed_request(&mut self) -> Option<(u64, i32)> {
        self.completion_list.pop_front()
    }
}
