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

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::poller::polling::{Poller, Source};
use crate::Poll;

/// Readiness reactor: a [`Poller`] driven by a dedicated thread.
///
/// The reactor is an ordinary value: construct it once and pass it (or its [`Controller`]) to the
/// [`crate::FileDescriptor`] constructors. Dropping the reactor shuts the thread down, after which
/// all the descriptors registered with it fail their blocked and future operations with
/// [`crate::Error::Closing`].
pub struct Reactor {
    thread: Option<JoinHandle<io::Result<()>>>,
    controller: Controller,
}

impl Reactor {
    /// Creates new reactor running in a newly spawned thread.
    ///
    /// # Error
    ///
    /// Errors with a system/OS error if it was impossible to create the poller or spawn a thread.
    pub fn new() -> io::Result<Self> { Reactor::with(thread::Builder::new()) }

    /// Creates new reactor running in a newly spawned thread with a given name.
    ///
    /// # Error
    ///
    /// Errors with a system/OS error if it was impossible to create the poller or spawn a thread.
    pub fn named(thread_name: impl Into<String>) -> io::Result<Self> {
        Reactor::with(thread::Builder::new().name(thread_name.into()))
    }

    /// Creates new reactor, allowing to fully customize how the reactor thread is constructed.
    ///
    /// # Error
    ///
    /// Errors with a system/OS error if it was impossible to create the poller or spawn a thread.
    pub fn with(builder: thread::Builder) -> io::Result<Self> {
        let poller = Poller::new()?;

        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "Initializing reactor thread...");

        let runtime = poller.clone();
        let thread = builder.spawn(move || {
            #[cfg(feature = "log")]
            log::info!(target: "reactor", "Entering reactor event loop");

            runtime.run()
        })?;

        Ok(Reactor {
            thread: Some(thread),
            controller: Controller { poller },
        })
    }

    /// Provides a copy of a [`Controller`] object which can register descriptors with the reactor
    /// and shut it down.
    pub fn controller(&self) -> Controller { self.controller.clone() }

    /// Shuts the reactor thread down and joins it.
    ///
    /// # Returns
    ///
    /// The error which made the poll loop fail, if any.
    pub fn shutdown(mut self) -> io::Result<()> {
        self.controller.shutdown()?;
        self.join_thread()
    }

    /// Joins the reactor thread, blocking until some [`Controller`] shuts the reactor down.
    pub fn join(mut self) -> io::Result<()> { self.join_thread() }

    fn join_thread(&mut self) -> io::Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread.join().map_err(|_| io::Error::new(io::ErrorKind::Other, "reactor thread panicked"))?
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if self.thread.is_some() {
            #[cfg(feature = "log")]
            log::debug!(target: "reactor", "Reactor dropped, shutting down");

            if self.controller.shutdown().is_ok() {
                let _ = self.join_thread();
            }
        }
    }
}

impl Poll for Reactor {
    type Registration = Source;

    fn register(&self, fd: RawFd) -> io::Result<Source> { self.controller.register(fd) }
}

/// Handle to a [`Reactor`] which can be cloned and sent to other threads.
#[derive(Clone)]
pub struct Controller {
    poller: Arc<Poller>,
}

impl Controller {
    /// Shuts the reactor down. All blocked operations on the registered descriptors return
    /// [`crate::Error::Closing`].
    pub fn shutdown(&self) -> io::Result<()> {
        #[cfg(feature = "log")]
        log::info!(target: "reactor-controller", "Initiating reactor shutdown...");

        self.poller.shutdown()
    }

    /// Checks whether the reactor has stopped.
    pub fn is_shutdown(&self) -> bool { self.poller.is_shutdown() }

    /// Number of the descriptors currently registered with the reactor.
    pub fn registered(&self) -> usize { self.poller.len() }
}

impl Poll for Controller {
    type Registration = Source;

    fn register(&self, fd: RawFd) -> io::Result<Source> { self.poller.register(fd) }
}
