// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

//! Interface between a disk image and the block device emulation.
//!
//! A [`DiskFile`] describes an opened image. Each device queue asks it for
//! an [`AsyncIo`] object through which requests are submitted and their
//! completions collected, with an eventfd signalling new completions.

use std::marker::PhantomData;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

#[derive(Error, Debug)]
pub enum DiskFileError {
    /// Failed getting disk file size.
    #[error("Failed getting disk file size")]
    Size(#[source] std::io::Error),
    /// Failed creating a new AsyncIo.
    #[error("Failed creating a new AsyncIo")]
    NewAsyncIo(#[source] std::io::Error),
}

pub type DiskFileResult<T> = std::result::Result<T, DiskFileError>;

/// A [`RawFd`] borrowed from a [`DiskFile`] for as long as the disk lives.
#[derive(Copy, Clone, Debug)]
pub struct BorrowedDiskFd<'fd> {
    raw_fd: RawFd,
    _lifetime: PhantomData<&'fd OwnedFd>,
}

impl BorrowedDiskFd<'_> {
    pub(crate) fn new(raw_fd: RawFd) -> Self {
        Self {
            raw_fd,
            _lifetime: PhantomData,
        }
    }
}

impl AsRawFd for BorrowedDiskFd<'_> {
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd
    }
}

pub trait DiskFile: Send {
    /// Size of the disk as seen by the guest.
    fn logical_size(&mut self) -> DiskFileResult<u64>;
    /// Space used by the image file on the host.
    fn physical_size(&mut self) -> DiskFileResult<u64>;
    fn new_async_io(&self, ring_depth: u32) -> DiskFileResult<Box<dyn AsyncIo>>;
    /// Returns the file descriptor of the underlying disk image file.
    ///
    /// The file descriptor is supposed to be used for `fcntl()` calls but no
    /// other operation.
    fn fd(&mut self) -> BorrowedDiskFd<'_>;
}

#[derive(Error, Debug)]
pub enum AsyncIoError {
    /// Failed vectored reading from file.
    #[error("Failed vectored reading from file")]
    ReadVectored(#[source] std::io::Error),
    /// Failed vectored writing to file.
    #[error("Failed vectored writing to file")]
    WriteVectored(#[source] std::io::Error),
    /// Failed synchronizing file.
    #[error("Failed synchronizing file")]
    Fsync(#[source] std::io::Error),
    /// Failed signalling a completion.
    #[error("Failed signalling a completion")]
    Notify(#[source] std::io::Error),
}

pub type AsyncIoResult<T> = std::result::Result<T, AsyncIoError>;

pub trait AsyncIo: Send {
    fn notifier(&self) -> &EventFd;
    fn read_vectored(
        &mut self,
        offset: libc::off_t,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> AsyncIoResult<()>;
    fn write_vectored(
        &mut self,
        offset: libc::off_t,
        iovecs: &[libc::iovec],
        user_data: u64,
    ) -> AsyncIoResult<()>;
    fn fsync(&mut self, user_data: Option<u64>) -> AsyncIoResult<()>;
    /// Pops the oldest completion as `(user_data, result)`, where result is
    /// the byte count transferred.
    fn next_completed_request(&mut self) -> Option<(u64, i32)>;
}
