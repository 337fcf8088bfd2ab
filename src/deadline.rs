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

use std::time::{Duration, Instant};

use crate::{Io, IoType};

/// Absolute point in (monotonic) time after which a blocked operation must give up with
/// [`crate::Error::Timeout`].
///
/// The default value is "no deadline".
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Deadline which never elapses; used to clear a previously set deadline.
    pub const fn none() -> Self { Deadline(None) }

    /// Deadline at a given moment.
    pub fn at(instant: Instant) -> Self { Deadline(Some(instant)) }

    /// Deadline `span` from now. A span too large to be represented means no deadline.
    pub fn after(span: Duration) -> Self { Deadline(Instant::now().checked_add(span)) }

    /// Checks whether the deadline is unset.
    pub fn is_none(self) -> bool { self.0.is_none() }

    /// Checks whether the deadline has been reached by the moment `now`.
    pub fn has_elapsed(self, now: Instant) -> bool { matches!(self.0, Some(t) if t <= now) }

    /// Time left until the deadline starting from the moment `now`.
    ///
    /// # Returns
    ///
    /// `None` if there is no deadline; zero duration if the deadline has already elapsed.
    pub fn remaining(self, now: Instant) -> Option<Duration> {
        self.0.map(|t| t.saturating_duration_since(now))
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self { Deadline::at(instant) }
}

impl From<Option<Instant>> for Deadline {
    fn from(instant: Option<Instant>) -> Self { Deadline(instant) }
}

/// Independent per-direction deadlines of a single file descriptor.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct DeadlineClock {
    read: Deadline,
    write: Deadline,
}

impl DeadlineClock {
    /// Creates clock with no deadlines set.
    pub fn new() -> Self { Self::default() }

    /// Sets the same deadline for each of the directions in `dirs`.
    pub fn set(&mut self, dirs: IoType, deadline: Deadline) {
        for io in dirs {
            match io {
                Io::Read => self.read = deadline,
                Io::Write => self.write = deadline,
            }
        }
    }

    /// Deadline for the direction.
    pub fn get(&self, io: Io) -> Deadline {
        match io {
            Io::Read => self.read,
            Io::Write => self.write,
        }
    }

    /// Checks whether the deadline for the direction has been reached by the moment `now`.
    pub fn has_elapsed(&self, io: Io, now: Instant) -> bool { self.get(io).has_elapsed(now) }

    /// Time left until the deadline for the direction; see [`Deadline::remaining`].
    pub fn remaining(&self, io: Io, now: Instant) -> Option<Duration> {
        self.get(io).remaining(now)
    }
}
