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

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{Error, Io};

const CLOSING: u64 = 1 << 0;
const READ_HELD: u64 = 1 << 1;
const WRITE_HELD: u64 = 1 << 2;
const REF: u64 = 1 << 3;
const REF_MASK: u64 = !(REF - 1);

fn held(io: Io) -> u64 {
    match io {
        Io::Read => READ_HELD,
        Io::Write => WRITE_HELD,
    }
}

/// Counter of the operations pinning a file descriptor, combined with the closing flag and
/// per-direction exclusion flags.
///
/// All state is packed into a single atomic word and updated with compare-and-swap loops; none of
/// the operations ever waits for another thread.
///
/// Methods returning `bool` report whether the caller has just released the last reference after
/// the descriptor started closing: the caller must then destroy the underlying resources. This
/// happens exactly once in the lifetime of the counter.
#[derive(Debug, Default)]
pub struct FdRefCount {
    state: AtomicU64,
}

impl FdRefCount {
    /// Creates counter for an active descriptor with no references.
    pub fn new() -> Self { Self::default() }

    /// Pins the descriptor for a miscellaneous operation.
    ///
    /// # Errors
    ///
    /// [`Error::Closing`] if the descriptor has started closing.
    pub fn incref(&self) -> Result<(), Error> {
        self.update(|state| {
            if state & CLOSING != 0 {
                return None;
            }
            Some(state + REF)
        })
        .map(|_| ())
        .map_err(|_| Error::Closing)
    }

    /// Releases a pin taken with [`Self::incref`].
    ///
    /// # Returns
    ///
    /// Whether the descriptor must be destroyed now.
    ///
    /// # Panics
    ///
    /// If there is no reference to release.
    pub fn decref(&self) -> bool {
        let prev = self.state.fetch_sub(REF, Ordering::AcqRel);
        if prev & REF_MASK == 0 {
            panic!("inconsistent file descriptor reference count: decref without incref");
        }
        is_terminal(prev - REF)
    }

    /// Pins the descriptor and enters the critical section for the direction.
    ///
    /// A read and a write may be inside their critical sections at the same time.
    ///
    /// # Errors
    ///
    /// - [`Error::Closing`] if the descriptor has started closing;
    /// - [`Error::Busy`] if another operation of the same direction is inside its critical
    ///   section.
    pub fn lock(&self, io: Io) -> Result<(), Error> {
        let flag = held(io);
        self.update(|state| {
            if state & (CLOSING | flag) != 0 {
                return None;
            }
            Some((state | flag) + REF)
        })
        .map(|_| ())
        .map_err(|state| if state & CLOSING != 0 { Error::Closing } else { Error::Busy })
    }

    /// Leaves the critical section for the direction and releases the pin taken with
    /// [`Self::lock`].
    ///
    /// # Returns
    ///
    /// Whether the descriptor must be destroyed now.
    ///
    /// # Panics
    ///
    /// If the direction is not locked.
    pub fn unlock(&self, io: Io) -> bool {
        let flag = held(io);
        match self.update(|state| {
            if state & flag == 0 || state & REF_MASK == 0 {
                return None;
            }
            Some((state & !flag) - REF)
        }) {
            Ok(prev) => is_terminal((prev & !flag) - REF),
            Err(_) => panic!("inconsistent file descriptor reference count: {io} unlock without lock"),
        }
    }

    /// Marks the descriptor as closing and pins it on behalf of the closer, so it can't be
    /// destroyed before the closer has evicted the waiters.
    ///
    /// # Returns
    ///
    /// `false` if the descriptor was already closing; nothing is changed in that case.
    pub fn incref_and_close(&self) -> bool {
        self.update(|state| {
            if state & CLOSING != 0 {
                return None;
            }
            Some((state | CLOSING) + REF)
        })
        .is_ok()
    }

    /// Checks whether the descriptor has started closing.
    pub fn is_closing(&self) -> bool { self.state.load(Ordering::Acquire) & CLOSING != 0 }

    /// Number of operations currently pinning the descriptor.
    pub fn refs(&self) -> u64 {
        (self.state.load(Ordering::Acquire) & REF_MASK) >> REF.trailing_zeros()
    }

    /// Checks whether an operation of the direction is inside its critical section.
    pub fn is_locked(&self, io: Io) -> bool { self.state.load(Ordering::Acquire) & held(io) != 0 }

    fn update(&self, f: impl FnMut(u64) -> Option<u64>) -> Result<u64, u64> {
        self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, f)
    }
}

fn is_terminal(state: u64) -> bool { state & REF_MASK == 0 && state & CLOSING != 0 }
