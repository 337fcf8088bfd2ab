// Close-safe non-blocking file descriptors driven by a readiness reactor.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Thin wrappers around the raw system calls used on non-blocking descriptors.

use std::ffi::CString;
use std::io::{Error, ErrorKind, Result};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

/// File creation mode used by `open(2)`.
const OPEN_MODE: libc::mode_t = 0o666;

pub enum IoStatus {
    Success(usize),
    WouldBlock,
    Err(Error),
}

impl IoStatus {
    fn from_ret(ret: libc::ssize_t) -> Self {
        if ret >= 0 {
            return IoStatus::Success(ret as usize);
        }
        let err = Error::last_os_error();
        if err.kind() == ErrorKind::WouldBlock {
            IoStatus::WouldBlock
        } else {
            IoStatus::Err(err)
        }
    }
}

pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> IoStatus {
    // SAFETY: the buffer is valid for writes of `buf.len()` bytes for the duration of the call.
    let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    IoStatus::from_ret(ret)
}

pub fn write_nonblocking(fd: RawFd, buf: &[u8]) -> IoStatus {
    // SAFETY: the buffer is valid for reads of `buf.len()` bytes for the duration of the call.
    let ret = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    IoStatus::from_ret(ret)
}

pub fn open(path: &Path, flags: libc::c_int) -> Result<RawFd> {
    let path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "path contains a NUL byte"))?;
    // SAFETY: the path is a valid NUL-terminated string.
    let fd = unsafe { libc::open(path.as_ptr(), flags, OPEN_MODE as libc::c_uint) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    Ok(fd)
}

/// Closes the descriptor; errors are not reported since the handle is gone either way.
pub fn close(fd: RawFd) {
    // SAFETY: the caller owns the descriptor and never uses it afterwards.
    unsafe { libc::close(fd) };
}
