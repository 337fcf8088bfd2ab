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

//! Contract between file descriptors and the readiness-multiplexing engine.
//!
//! The engine itself (epoll, kqueue, event ports) lives outside of this crate; a
//! [`FileDescriptor`](crate::FileDescriptor) only needs the narrow [`Poll`] and [`Registration`]
//! APIs defined here. The `polling` feature provides a ready-to-use implementation in
//! [`polling`].

#[cfg(feature = "polling")]
pub mod polling;

use std::fmt::{self, Display, Formatter};
use std::io;
use std::ops;
use std::os::unix::io::RawFd;

use crate::{Deadline, Error};

/// Direction of an I/O operation.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum Io {
    #[display("read")]
    Read,
    #[display("write")]
    Write,
}

/// Set of I/O directions.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Default)]
pub struct IoType {
    /// Read direction is included.
    pub read: bool,
    /// Write direction is included.
    pub write: bool,
}

impl IoType {
    pub fn none() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    /// Checks whether the set includes the given direction.
    pub fn contains(self, io: Io) -> bool {
        match io {
            Io::Read => self.read,
            Io::Write => self.write,
        }
    }

    /// Adds a direction to the set.
    pub fn insert(&mut self, io: Io) {
        match io {
            Io::Read => self.read = true,
            Io::Write => self.write = true,
        }
    }

    /// Removes a direction from the set, returning whether it was present.
    pub fn remove(&mut self, io: Io) -> bool {
        let present = self.contains(io);
        match io {
            Io::Read => self.read = false,
            Io::Write => self.write = false,
        }
        present
    }
}

impl From<Io> for IoType {
    fn from(io: Io) -> Self {
        match io {
            Io::Read => IoType::read_only(),
            Io::Write => IoType::write_only(),
        }
    }
}

impl ops::BitOr for IoType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            read: self.read || rhs.read,
            write: self.write || rhs.write,
        }
    }
}

impl ops::BitOrAssign for IoType {
    fn bitor_assign(&mut self, rhs: Self) { *self = *self | rhs }
}

impl Iterator for IoType {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remove(Io::Read) {
            Some(Io::Read)
        } else if self.remove(Io::Write) {
            Some(Io::Write)
        } else {
            None
        }
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (false, false) => f.write_str("none"),
            (true, true) => f.write_str("read-write"),
            (true, false) => f.write_str("read"),
            (false, true) => f.write_str("write"),
        }
    }
}

/// Readiness-multiplexing engine able to bind [`Registration`]s to OS handles.
///
/// The engine is an explicitly constructed service object which is passed to
/// [`FileDescriptor`](crate::FileDescriptor) constructors; tests may provide a fake one.
pub trait Poll {
    /// Per-descriptor registration produced by the engine.
    type Registration: Registration;

    /// Binds a new registration to the OS handle.
    ///
    /// # Errors
    ///
    /// Fails with the OS error if the handle can't be used with event-driven multiplexing (for
    /// instance, a regular file or `/dev/null` on Linux).
    fn register(&self, fd: RawFd) -> io::Result<Self::Registration>;
}

/// Per-descriptor registration inside a readiness-multiplexing engine.
///
/// A registration is exclusively owned by a single [`FileDescriptor`](crate::FileDescriptor),
/// which calls [`Registration::close`] exactly once, before releasing the OS handle.
pub trait Registration: Send + Sync {
    /// Resets the readiness state for a direction; called once per read or write operation before
    /// the first non-blocking system call.
    ///
    /// # Errors
    ///
    /// - [`Error::Closing`] if the registration was evicted or closed;
    /// - [`Error::Timeout`] if the deadline for the direction has already passed.
    fn prepare(&self, io: Io) -> Result<(), Error>;

    /// Blocks the calling thread until the handle is ready for the direction, the deadline for the
    /// direction elapses, or the registration gets evicted.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] when the deadline has elapsed;
    /// - [`Error::Closing`] when the registration is evicted;
    /// - [`Error::Io`] when the engine fails to arm the interest.
    fn wait(&self, io: Io) -> Result<(), Error>;

    /// Sets an absolute deadline for each of the directions in `dirs`. [`Deadline::none`] clears
    /// the deadline.
    fn set_deadline(&self, dirs: IoType, deadline: Deadline);

    /// Forces all current and future waiters to return [`Error::Closing`].
    ///
    /// # Returns
    ///
    /// Whether [`Registration::wakeup`] must still be called to deliver the wake signal.
    fn evict(&self) -> bool;

    /// Delivers the wake signal after [`Registration::evict`]. Must be called outside of any lock
    /// held by the caller.
    fn wakeup(&self);

    /// Releases the engine resources of the registration.
    fn close(&self);
}
