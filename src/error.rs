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

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::io;

/// Errors returned by [`crate::FileDescriptor`] operations.
///
/// In addition to the conditions defined by the crate, errors reported by the underlying system
/// calls (`open(2)`, `read(2)`, `write(2)`, multiplexer registration) are passed verbatim as
/// [`Error::Io`], so callers are able to tell e.g. a broken pipe from other failures.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// operation has timed out.
    Timeout,

    /// operation on a file descriptor which is closing or already closed.
    Closing,

    /// another operation of the same direction is already in progress on the file descriptor.
    Busy,

    /// end of stream.
    Eof,

    /// unexpected end of stream.
    UnexpectedEof,

    /// {0}
    #[from]
    Io(io::Error),
}

impl Error {
    /// Checks whether the error is related to an elapsed deadline.
    ///
    /// For OS errors matches `EAGAIN`/`EWOULDBLOCK` and `ETIMEDOUT`.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Io(err) => is_io_timeout(err),
            _ => false,
        }
    }

    /// Checks whether the error is temporary, i.e. the operation is worth retrying.
    ///
    /// Timeouts and contention on the same direction are temporary; closing, end of stream and
    /// most of OS errors are not. For OS errors matches `EINTR`, `EMFILE`, `ENFILE` and all
    /// timeout-kind errors.
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::Timeout | Error::Busy => true,
            Error::Io(err) => is_io_temporary(err),
            _ => false,
        }
    }

    /// OS error code, if the error was reported by a system call.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::Io(err) => return err,
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::Eof => io::ErrorKind::UnexpectedEof,
            Error::UnexpectedEof => io::ErrorKind::WriteZero,
            Error::Closing | Error::Busy => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// Error of a write operation which has transferred only a part of the buffer.
#[derive(Debug)]
pub struct WriteError {
    /// Number of bytes written before the failure.
    pub written: usize,
    /// Reason the write has stopped early.
    pub error: Error,
}

impl WriteError {
    pub(crate) fn new(written: usize, error: impl Into<Error>) -> Self {
        WriteError {
            written,
            error: error.into(),
        }
    }
}

impl Display for WriteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes written)", self.error, self.written)
    }
}

impl StdError for WriteError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> { Some(&self.error) }
}

impl From<WriteError> for Error {
    fn from(err: WriteError) -> Self { err.error }
}

impl From<WriteError> for io::Error {
    fn from(err: WriteError) -> Self { err.error.into() }
}

/// Checks whether an arbitrary error indicates a temporary condition worth retrying.
///
/// Understands [`Error`], [`WriteError`] and [`io::Error`], including I/O errors wrapping the crate
/// errors; see [`Error::is_temporary`].
pub fn is_error_temporary(err: &(dyn StdError + 'static)) -> bool {
    if let Some(err) = err.downcast_ref::<Error>() {
        err.is_temporary()
    } else if let Some(err) = err.downcast_ref::<WriteError>() {
        err.error.is_temporary()
    } else if let Some(err) = err.downcast_ref::<io::Error>() {
        is_io_temporary(err)
    } else {
        false
    }
}

/// Checks whether an arbitrary error indicates an elapsed deadline.
///
/// Understands [`Error`], [`WriteError`] and [`io::Error`], including I/O errors wrapping the crate
/// errors; see [`Error::is_timeout`].
pub fn is_error_timeout(err: &(dyn StdError + 'static)) -> bool {
    if let Some(err) = err.downcast_ref::<Error>() {
        err.is_timeout()
    } else if let Some(err) = err.downcast_ref::<WriteError>() {
        err.error.is_timeout()
    } else if let Some(err) = err.downcast_ref::<io::Error>() {
        is_io_timeout(err)
    } else {
        false
    }
}

fn is_io_timeout(err: &io::Error) -> bool {
    if let Some(inner) = err.get_ref() {
        return is_error_timeout(inner);
    }
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK || code == libc::ETIMEDOUT
    )
}

fn is_io_temporary(err: &io::Error) -> bool {
    if let Some(inner) = err.get_ref() {
        return is_error_temporary(inner);
    }
    match err.raw_os_error() {
        Some(code) if code == libc::EINTR || code == libc::EMFILE || code == libc::ENFILE => true,
        _ => is_io_timeout(err),
    }
}
