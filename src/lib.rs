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

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Non-blocking file descriptors ([`FileDescriptor`]) for terminals, pseudo-terminals, character
//! devices and FIFOs.
//!
//! A caller issues a normal-looking blocking [`FileDescriptor::read`] or
//! [`FileDescriptor::write`]; instead of spinning on the descriptor the calling thread is parked
//! on a readiness registration shared with a single reactor thread ([`Reactor`]) and resumes when
//! the descriptor becomes ready, the per-direction deadline elapses, or the descriptor is closed
//! from another thread.
//!
//! Closing is safe while operations are in flight: the OS handle is released only once the last
//! operation touching it has returned, so a handle number is never used after the kernel may have
//! handed it out again.
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//!
//! use pollfd::{Deadline, FileDescriptor, OpenMode, Reactor};
//!
//! let reactor = Reactor::new()?;
//! let fd = FileDescriptor::open(&reactor, "/dev/ttyUSB0", OpenMode::ReadWrite)?;
//!
//! fd.set_read_deadline(Deadline::after(Duration::from_secs(5)))?;
//! let mut buf = [0u8; 10];
//! let n = fd.read(&mut buf)?;
//!
//! fd.write(&buf[..n])?;
//! fd.close()?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate amplify;

mod deadline;
mod error;
mod fd;
mod nonblock;
pub mod poller;
#[cfg(feature = "polling")]
mod reactor;
mod refcount;

pub use deadline::{Deadline, DeadlineClock};
pub use error::{is_error_temporary, is_error_timeout, Error, WriteError};
pub use fd::{FdRef, FileDescriptor, OpenMode};
pub use poller::{Io, IoType, Poll, Registration};
pub use refcount::FdRefCount;

#[cfg(feature = "polling")]
pub use self::reactor::{Controller, Reactor};
