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

//! Readiness engine built on top of the [`polling`](::polling) library (epoll, kqueue, event
//! ports).
//!
//! A single [`Poller`] is driven by one thread running [`Poller::run`]; any number of threads may
//! block in [`Source::wait`] at the same time. Interest in a direction is armed one-shot by the
//! waiter; the poll thread records the readiness on the [`Source`] and wakes its waiters.

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::io;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use ::polling::{Event, Events};
use crossbeam_channel as chan;

use crate::poller::{Io, IoType, Poll, Registration};
use crate::{Deadline, DeadlineClock, Error};

fn interest(key: usize, io: IoType) -> Event {
    match (io.read, io.write) {
        (true, true) => Event::all(key),
        (true, false) => Event::readable(key),
        (false, true) => Event::writable(key),
        (false, false) => Event::none(key),
    }
}

/// Control commands sent to the thread running [`Poller::run`].
enum Ctl {
    Shutdown,
}

/// Readiness-multiplexing engine shared by all [`Source`]s registered with it.
///
/// The engine does nothing until some thread runs [`Poller::run`]; [`crate::Reactor`] does that
/// in a dedicated thread.
pub struct Poller {
    poller: ::polling::Poller,
    /// Live sources by their key; `None` once the poller is shut down.
    sources: Mutex<Option<HashMap<usize, Weak<SourceInner>>>>,
    next_key: AtomicUsize,
    ctl_send: chan::Sender<Ctl>,
    ctl_recv: chan::Receiver<Ctl>,
}

impl Poller {
    /// Creates new engine using the OS-specific multiplexer.
    pub fn new() -> io::Result<Arc<Self>> {
        let (ctl_send, ctl_recv) = chan::unbounded();
        Ok(Arc::new(Poller {
            poller: ::polling::Poller::new()?,
            sources: Mutex::new(Some(empty!())),
            next_key: AtomicUsize::new(0),
            ctl_send,
            ctl_recv,
        }))
    }

    /// Registers the OS handle, producing a [`Source`] to wait on.
    ///
    /// # Errors
    ///
    /// Errors with the OS error if the handle can't be added to the multiplexer (for instance,
    /// `EPERM` for regular files on Linux), or if the poller is shut down.
    pub fn register(self: &Arc<Self>, fd: RawFd) -> io::Result<Source> {
        let mut sources = lock(&self.sources);
        let Some(sources) = sources.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "poller is shut down"));
        };

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        // SAFETY: the source is deleted from the poller in `Source::close`, which is called by
        // the owner of the handle before the handle is closed.
        unsafe { self.poller.add(fd, Event::none(key))? };

        #[cfg(feature = "log")]
        log::trace!(target: "polling", "Registered fd {fd} under key {key}");

        let inner = Arc::new(SourceInner {
            fd,
            key,
            state: Mutex::new(SourceState::default()),
            cond: Condvar::new(),
            poller: self.clone(),
        });
        sources.insert(key, Arc::downgrade(&inner));
        Ok(Source { inner })
    }

    /// Number of the sources currently registered.
    pub fn len(&self) -> usize {
        lock(&self.sources).as_ref().map(HashMap::len).unwrap_or_default()
    }

    /// Checks whether no sources are registered.
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Checks whether the poll loop has terminated; no new sources can be registered afterwards.
    pub fn is_shutdown(&self) -> bool { lock(&self.sources).is_none() }

    /// Asks the thread running [`Self::run`] to terminate.
    pub fn shutdown(&self) -> io::Result<()> {
        #[cfg(feature = "log")]
        log::debug!(target: "polling", "Requesting poller shutdown");

        self.ctl_send.send(Ctl::Shutdown).map_err(|_| io::ErrorKind::BrokenPipe)?;
        self.poller.notify()
    }

    /// Runs the poll loop in the calling thread until [`Self::shutdown`] is called or the
    /// multiplexer fails.
    ///
    /// On exit all live sources are evicted, so no waiter remains blocked.
    ///
    /// # Blocking
    ///
    /// This call is blocking.
    pub fn run(&self) -> io::Result<()> {
        let mut events = Events::new();
        let res = loop {
            events.clear();

            #[cfg(feature = "log")]
            log::trace!(target: "polling", "Polling {} sources", self.len());

            // Blocking
            match self.poller.wait(&mut events, None) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "polling", "Error during polling: {err}");
                    break Err(err);
                }
            }

            match self.ctl_recv.try_recv() {
                Err(chan::TryRecvError::Empty) => {}
                // The sender is owned by the poller itself
                Err(chan::TryRecvError::Disconnected) => unreachable!("poller control channel"),
                Ok(Ctl::Shutdown) => {
                    #[cfg(feature = "log")]
                    log::info!(target: "polling", "Shutdown");
                    break Ok(());
                }
            }

            for event in events.iter() {
                self.dispatch(event.key, IoType {
                    read: event.readable,
                    write: event.writable,
                });
            }
        };
        self.evict_all();
        res
    }

    fn dispatch(&self, key: usize, fired: IoType) {
        let source =
            lock(&self.sources).as_ref().and_then(|map| map.get(&key)).and_then(Weak::upgrade);
        let Some(source) = source else {
            #[cfg(feature = "log")]
            log::trace!(target: "polling", "Got `{fired}` for unregistered key {key}");
            return;
        };

        #[cfg(feature = "log")]
        log::trace!(target: "polling", "Got `{fired}` for fd {}", source.fd);

        let mut state = source.lock();
        // One-shot interest is disarmed by the multiplexer once it fires
        state.armed = IoType::none();
        state.ready |= fired;
        drop(state);
        source.cond.notify_all();
    }

    fn evict_all(&self) {
        let Some(sources) = lock(&self.sources).take() else {
            return;
        };

        #[cfg(feature = "log")]
        log::debug!(target: "polling", "Evicting {} sources on shutdown", sources.len());

        for source in sources.values().filter_map(Weak::upgrade) {
            lock(&source.state).evicted = true;
            source.cond.notify_all();
        }
    }
}

impl Poll for Arc<Poller> {
    type Registration = Source;

    fn register(&self, fd: RawFd) -> io::Result<Source> { Poller::register(self, fd) }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct SourceState {
    deadlines: DeadlineClock,
    /// Directions reported ready since the last `prepare`.
    ready: IoType,
    /// Directions with interest armed in the multiplexer.
    armed: IoType,
    waiters: usize,
    evicted: bool,
    closed: bool,
}

struct SourceInner {
    fd: RawFd,
    key: usize,
    state: Mutex<SourceState>,
    cond: Condvar,
    poller: Arc<Poller>,
}

impl SourceInner {
    fn lock(&self) -> MutexGuard<'_, SourceState> { lock(&self.state) }

    fn arm(&self, state: &mut SourceState, io: Io) -> io::Result<()> {
        if state.armed.contains(io) {
            return Ok(());
        }
        state.armed.insert(io);

        #[cfg(feature = "log")]
        log::trace!(target: "polling", "Arming `{}` interest on fd {}", state.armed, self.fd);

        // SAFETY: the handle stays open while there is a waiter pinning the file descriptor.
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        self.poller.poller.modify(fd, interest(self.key, state.armed))
    }
}

/// Registration of a single OS handle within a [`Poller`].
pub struct Source {
    inner: Arc<SourceInner>,
}

impl Source {
    /// OS handle the source was registered for.
    pub fn fd(&self) -> RawFd { self.inner.fd }
}

impl Debug for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("fd", &self.fd())
            .field("key", &self.inner.key)
            .finish_non_exhaustive()
    }
}

impl Registration for Source {
    fn prepare(&self, io: Io) -> Result<(), Error> {
        let mut state = self.inner.lock();
        if state.evicted || state.closed {
            return Err(Error::Closing);
        }
        if state.deadlines.has_elapsed(io, Instant::now()) {
            return Err(Error::Timeout);
        }
        state.ready.remove(io);
        Ok(())
    }

    fn wait(&self, io: Io) -> Result<(), Error> {
        let inner = &self.inner;
        let mut state = inner.lock();
        state.waiters += 1;
        let res = loop {
            if state.evicted || state.closed {
                break Err(Error::Closing);
            }
            if state.ready.remove(io) {
                break Ok(());
            }
            let remaining = state.deadlines.remaining(io, Instant::now());
            if remaining.is_some_and(|left| left.is_zero()) {
                break Err(Error::Timeout);
            }
            if let Err(err) = inner.arm(&mut state, io) {
                break Err(Error::Io(err));
            }
            state = match remaining {
                None => inner.cond.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(left) => {
                    inner.cond.wait_timeout(state, left).unwrap_or_else(PoisonError::into_inner).0
                }
            };
        };
        state.waiters -= 1;

        #[cfg(feature = "log")]
        {
            if let Err(ref err) = res {
                log::trace!(target: "polling", "Waiting for `{io}` on fd {} ended: {err}", inner.fd);
            }
        }

        res
    }

    fn set_deadline(&self, dirs: IoType, deadline: Deadline) {
        self.inner.lock().deadlines.set(dirs, deadline);
        // Blocked waiters have to recompute their timeouts
        self.inner.cond.notify_all();
    }

    fn evict(&self) -> bool {
        let mut state = self.inner.lock();
        if state.evicted {
            return false;
        }
        state.evicted = true;
        state.waiters > 0
    }

    fn wakeup(&self) { self.inner.cond.notify_all(); }

    fn close(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        if let Some(sources) = lock(&inner.poller.sources).as_mut() {
            sources.remove(&inner.key);
        }
        // SAFETY: the owner calls `close` before releasing the handle.
        let fd = unsafe { BorrowedFd::borrow_raw(inner.fd) };
        if let Err(err) = inner.poller.poller.delete(fd) {
            #[cfg(feature = "log")]
            log::warn!(target: "polling", "Unable to remove fd {} from the poller: {err}", inner.fd);
        }
        inner.cond.notify_all();

        #[cfg(feature = "log")]
        log::trace!(target: "polling", "Unregistered fd {} (key {})", inner.fd, inner.key);
    }
}

impl Drop for Source {
    fn drop(&mut self) { self.close() }
}
