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

#![allow(unused_variables)] // because we need them for feature-gated logger

use std::fmt::{self, Debug, Display, Formatter};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::nonblock::{self, IoStatus};
use crate::{Deadline, Error, FdRefCount, Io, IoType, Poll, Registration, WriteError};

/// Direction(s) a file is opened for by [`FileDescriptor::open`].
///
/// Every mode implies non-blocking mode, no controlling terminal and close-on-exec.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum OpenMode {
    #[display("read-only")]
    ReadOnly,
    #[display("write-only")]
    WriteOnly,
    #[display("read-write")]
    ReadWrite,
}

impl OpenMode {
    /// Flags for `open(2)`.
    pub fn flags(self) -> libc::c_int {
        let access = match self {
            OpenMode::ReadOnly => libc::O_RDONLY,
            OpenMode::WriteOnly => libc::O_WRONLY,
            OpenMode::ReadWrite => libc::O_RDWR,
        };
        access | libc::O_NONBLOCK | libc::O_NOCTTY | libc::O_CLOEXEC
    }
}

/// File descriptor connected to a terminal, a pseudo-terminal, a character device, a FIFO etc,
/// read and written through a readiness [`Registration`].
///
/// Reads and writes block the calling thread only inside [`Registration::wait`], i.e. until the
/// descriptor gets ready, the deadline for the direction elapses, or the descriptor is closed.
///
/// All methods take `&self`; share the descriptor between threads with an [`std::sync::Arc`]. It
/// is safe to [`close`](Self::close) a descriptor while another thread is blocked on it: the
/// blocked operation returns [`Error::Closing`], and the OS handle is released only after the last
/// operation using it has returned.
///
/// A read and a write may run concurrently; a second operation of a direction which is already in
/// progress fails with [`Error::Busy`] (callers must serialize same-direction operations
/// themselves).
///
/// Dropping a descriptor which was not closed closes it.
pub struct FileDescriptor<R: Registration> {
    sysfd: AtomicI32,
    name: String,
    refs: FdRefCount,
    registration: R,
}

impl<R: Registration> FileDescriptor<R> {
    /// Opens the path for reading, writing or both.
    ///
    /// # Errors
    ///
    /// Errors with the OS error if the file can't be opened or can't be registered with the poller
    /// (for instance because it is a regular file).
    pub fn open<P>(poller: &P, path: impl AsRef<Path>, mode: OpenMode) -> Result<Self, Error>
    where P: Poll<Registration = R> {
        let path = path.as_ref();
        let fd = nonblock::open(path, mode.flags())?;

        #[cfg(feature = "log")]
        log::debug!(target: "pollfd", "Opened {} in {mode} mode (fd {fd})", path.display());

        match Self::with(poller, fd, path.to_string_lossy().into_owned()) {
            Ok(fd) => Ok(fd),
            Err(err) => {
                nonblock::close(fd);
                Err(err)
            }
        }
    }

    /// Adopts an already opened OS handle.
    ///
    /// The `name` is used only for display purposes and may be empty.
    ///
    /// # Safety
    ///
    /// The handle must be open and switched into non-blocking mode by the caller. The ownership
    /// over the handle is transferred to the returned object: the caller must not use or close it
    /// directly afterwards other than through [`Self::pin`] or [`Self::incref`].
    ///
    /// # Errors
    ///
    /// Errors with the OS error if the handle can't be registered with the poller. The handle is
    /// not closed in this case.
    pub unsafe fn from_raw_fd<P>(
        poller: &P,
        fd: RawFd,
        name: impl Into<String>,
    ) -> Result<Self, Error>
    where
        P: Poll<Registration = R>,
    {
        Self::with(poller, fd, name.into())
    }

    fn with<P>(poller: &P, fd: RawFd, name: String) -> Result<Self, Error>
    where P: Poll<Registration = R> {
        let registration = poller.register(fd)?;

        #[cfg(feature = "log")]
        log::trace!(target: "pollfd", "Registered fd {fd} ({name:?}) with the poller");

        Ok(FileDescriptor {
            sysfd: AtomicI32::new(fd),
            name,
            refs: FdRefCount::new(),
            registration,
        })
    }

    /// Name (path) of the descriptor given on construction.
    pub fn name(&self) -> &str { &self.name }

    /// Raw OS handle, or `-1` once the descriptor got destroyed.
    ///
    /// Any out-of-band use of the handle (`ioctl`, `fcntl`, etc) must happen while the descriptor
    /// is pinned with [`Self::incref`]/[`Self::decref`] or, better, [`Self::pin`]: otherwise a
    /// concurrent [`Self::close`] may release the handle number, which the kernel may then reuse.
    pub fn sysfd(&self) -> RawFd { self.sysfd.load(Ordering::Acquire) }

    /// Checks whether the descriptor has started closing.
    pub fn is_closing(&self) -> bool { self.refs.is_closing() }

    /// Number of operations and pins currently holding the descriptor.
    pub fn refs(&self) -> u64 { self.refs.refs() }

    /// Checks whether an operation of the direction is in progress.
    pub fn is_locked(&self, io: Io) -> bool { self.refs.is_locked(io) }

    /// Pins the descriptor, protecting the OS handle from a concurrent [`Self::close`]. The pin is
    /// released when the returned guard is dropped.
    ///
    /// ```no_run
    /// # fn f(fd: &pollfd::FileDescriptor<pollfd::poller::polling::Source>) -> Result<(), pollfd::Error> {
    /// use std::os::unix::io::AsRawFd;
    ///
    /// let pinned = fd.pin()?;
    /// let flags = unsafe { libc::fcntl(pinned.as_raw_fd(), libc::F_GETFL) };
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// [`Error::Closing`] if the descriptor is closing or closed.
    pub fn pin(&self) -> Result<FdRef<'_, R>, Error> {
        self.refs.incref()?;
        Ok(FdRef { fd: self, lock: None })
    }

    /// Pins the descriptor; a manual counterpart of [`Self::pin`]. Each successful call must be
    /// paired with a call to [`Self::decref`].
    ///
    /// # Errors
    ///
    /// [`Error::Closing`] if the descriptor is closing or closed.
    pub fn incref(&self) -> Result<(), Error> { self.refs.incref() }

    /// Releases a pin taken with [`Self::incref`], destroying the descriptor if it is closing and
    /// this was the last pin.
    ///
    /// # Panics
    ///
    /// If called without a matching [`Self::incref`].
    pub fn decref(&self) {
        if self.refs.decref() {
            self.destroy();
        }
    }

    fn lock(&self, io: Io) -> Result<FdRef<'_, R>, Error> {
        self.refs.lock(io)?;
        Ok(FdRef {
            fd: self,
            lock: Some(io),
        })
    }

    fn destroy(&self) {
        let fd = self.sysfd.swap(-1, Ordering::AcqRel);

        #[cfg(feature = "log")]
        log::debug!(target: "pollfd", "Releasing fd {fd} ({:?})", self.name);

        self.registration.close();
        nonblock::close(fd);
    }

    /// Closes the descriptor.
    ///
    /// Operations blocked on the descriptor in other threads are woken up and return
    /// [`Error::Closing`]. The OS handle is released once the last of them returns, which may
    /// happen after this method has returned. Never blocks on I/O.
    ///
    /// # Errors
    ///
    /// [`Error::Closing`] if the descriptor was already closed.
    pub fn close(&self) -> Result<(), Error> {
        if !self.refs.incref_and_close() {
            return Err(Error::Closing);
        }

        #[cfg(feature = "log")]
        log::debug!(target: "pollfd", "Closing {self}");

        // Unblock any I/O. Once it all returns it can't refer to the handle anymore and the last
        // reference released will close it.
        let wakeup = self.registration.evict();
        self.decref();
        if wakeup {
            self.registration.wakeup();
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes, returning as soon as any data are available.
    ///
    /// Blocks until the descriptor is readable, the read deadline elapses or the descriptor gets
    /// closed. Never loops to fill the whole buffer.
    ///
    /// # Errors
    ///
    /// - [`Error::Eof`] if the system call has read zero bytes into a non-empty buffer;
    /// - [`Error::Timeout`] if the read deadline elapsed before any data were available;
    /// - [`Error::Closing`] if the descriptor is closed or gets closed while waiting;
    /// - [`Error::Busy`] if another read is in progress on the descriptor;
    /// - [`Error::Io`] with the error reported by the system.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let guard = self.lock(Io::Read)?;
        self.registration.prepare(Io::Read)?;
        let fd = guard.as_raw_fd();
        read_with(&self.registration, buf, |buf| nonblock::read_nonblocking(fd, buf))
    }

    /// Writes the whole buffer, blocking whenever the descriptor is not ready to accept more data.
    ///
    /// # Errors
    ///
    /// Errors whenever less than `buf.len()` bytes were written, with [`WriteError::written`]
    /// telling how many were. The reasons are the same as for [`Self::read`], except that a write
    /// returning zero bytes results in [`Error::UnexpectedEof`].
    pub fn write(&self, buf: &[u8]) -> Result<usize, WriteError> {
        let guard = self.lock(Io::Write).map_err(|err| WriteError::new(0, err))?;
        self.registration.prepare(Io::Write).map_err(|err| WriteError::new(0, err))?;
        let fd = guard.as_raw_fd();
        write_with(&self.registration, buf, |buf| nonblock::write_nonblocking(fd, buf))
    }

    /// Sets the same absolute deadline for both reads and writes, including the ones already
    /// blocked. [`Deadline::none`] removes the deadline.
    ///
    /// # Errors
    ///
    /// [`Error::Closing`] if the descriptor is closed.
    pub fn set_deadline(&self, deadline: impl Into<Deadline>) -> Result<(), Error> {
        self.set_deadline_for(IoType::read_write(), deadline.into())
    }

    /// Sets an absolute deadline for reads; see [`Self::set_deadline`].
    pub fn set_read_deadline(&self, deadline: impl Into<Deadline>) -> Result<(), Error> {
        self.set_deadline_for(IoType::read_only(), deadline.into())
    }

    /// Sets an absolute deadline for writes; see [`Self::set_deadline`].
    pub fn set_write_deadline(&self, deadline: impl Into<Deadline>) -> Result<(), Error> {
        self.set_deadline_for(IoType::write_only(), deadline.into())
    }

    fn set_deadline_for(&self, dirs: IoType, deadline: Deadline) -> Result<(), Error> {
        let _pinned = self.pin()?;
        self.registration.set_deadline(dirs, deadline);
        Ok(())
    }
}

/// Read retry loop: repeats the non-blocking `attempt` until it returns data, waiting for
/// readiness each time the descriptor is not ready.
fn read_with<R: Registration>(
    registration: &R,
    buf: &mut [u8],
    mut attempt: impl FnMut(&mut [u8]) -> IoStatus,
) -> Result<usize, Error> {
    loop {
        match attempt(&mut *buf) {
            IoStatus::Success(0) if !buf.is_empty() => return Err(Error::Eof),
            IoStatus::Success(len) => return Ok(len),
            IoStatus::WouldBlock => registration.wait(Io::Read)?,
            IoStatus::Err(err) => return Err(err.into()),
        }
    }
}

/// Write retry loop: feeds the unwritten rest of `buf` to the non-blocking `attempt` until all of
/// it is accepted, waiting for readiness each time the descriptor is full.
fn write_with<R: Registration>(
    registration: &R,
    buf: &[u8],
    mut attempt: impl FnMut(&[u8]) -> IoStatus,
) -> Result<usize, WriteError> {
    let mut written = 0;
    while written < buf.len() {
        match attempt(&buf[written..]) {
            IoStatus::Success(0) => return Err(WriteError::new(written, Error::UnexpectedEof)),
            IoStatus::Success(len) => written += len,
            IoStatus::WouldBlock => {
                #[cfg(feature = "log")]
                log::trace!(target: "pollfd", "Descriptor is full after {written} bytes");

                registration.wait(Io::Write).map_err(|err| WriteError::new(written, err))?
            }
            IoStatus::Err(err) => return Err(WriteError::new(written, err)),
        }
    }
    Ok(written)
}

impl<R: Registration> Drop for FileDescriptor<R> {
    fn drop(&mut self) {
        if self.close().is_ok() {
            #[cfg(feature = "log")]
            log::debug!(target: "pollfd", "Descriptor {:?} dropped without being closed", self.name);
        }
    }
}

impl<R: Registration> AsRawFd for FileDescriptor<R> {
    fn as_raw_fd(&self) -> RawFd { self.sysfd() }
}

impl<R: Registration> Display for FileDescriptor<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{{:?} {}}}", self.name, self.sysfd())
    }
}

impl<R: Registration> Debug for FileDescriptor<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("sysfd", &self.sysfd())
            .field("name", &self.name)
            .field("refs", &self.refs)
            .finish_non_exhaustive()
    }
}

impl<R: Registration> io::Read for &FileDescriptor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match FileDescriptor::<R>::read(self, buf) {
            Err(Error::Eof) => Ok(0),
            res => res.map_err(io::Error::from),
        }
    }
}

impl<R: Registration> io::Write for &FileDescriptor<R> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match FileDescriptor::<R>::write(self, buf) {
            Ok(len) => Ok(len),
            // The error is reported again by the next call, which makes no progress
            Err(err) if err.written > 0 => Ok(err.written),
            Err(err) => Err(err.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

impl<R: Registration> io::Read for FileDescriptor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> { io::Read::read(&mut &*self, buf) }
}

impl<R: Registration> io::Write for FileDescriptor<R> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { io::Write::write(&mut &*self, buf) }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

/// Pin on a [`FileDescriptor`] which keeps its OS handle open while the guard is alive.
///
/// Produced by [`FileDescriptor::pin`].
pub struct FdRef<'fd, R: Registration> {
    fd: &'fd FileDescriptor<R>,
    lock: Option<Io>,
}

impl<'fd, R: Registration> FdRef<'fd, R> {
    /// Descriptor pinned by the guard.
    pub fn descriptor(&self) -> &'fd FileDescriptor<R> { self.fd }
}

impl<R: Registration> AsRawFd for FdRef<'_, R> {
    fn as_raw_fd(&self) -> RawFd { self.fd.sysfd() }
}

impl<R: Registration> Drop for FdRef<'_, R> {
    fn drop(&mut self) {
        let destroy = match self.lock {
            Some(io) => self.fd.refs.unlock(io),
            None => self.fd.refs.decref(),
        };
        if destroy {
            self.fd.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Condvar, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    /// Registration which never polls anything: waits block on a condvar until the test calls
    /// [`Fake::ready`], and every call is recorded.
    #[derive(Default)]
    struct Fake {
        state: Mutex<FakeState>,
        cond: Condvar,
        closed: AtomicUsize,
    }

    #[derive(Default)]
    struct FakeState {
        ready: IoType,
        evicted: bool,
        waits: usize,
        timeout_after: Option<usize>,
        spurious: bool,
        deadlines: IoType,
    }

    impl Fake {
        fn ready(&self, io: Io) {
            self.state.lock().unwrap().ready.insert(io);
            self.cond.notify_all();
        }

        fn waits(&self) -> usize { self.state.lock().unwrap().waits }

        fn closed(&self) -> usize { self.closed.load(Ordering::SeqCst) }
    }

    impl Poll for Arc<Fake> {
        type Registration = Arc<Fake>;

        fn register(&self, _fd: RawFd) -> io::Result<Arc<Fake>> { Ok(self.clone()) }
    }

    impl Registration for Arc<Fake> {
        fn prepare(&self, io: Io) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            if state.evicted {
                return Err(Error::Closing);
            }
            state.ready.remove(io);
            Ok(())
        }

        fn wait(&self, io: Io) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            state.waits += 1;
            loop {
                if state.evicted {
                    return Err(Error::Closing);
                }
                if state.timeout_after.is_some_and(|n| state.waits > n) {
                    return Err(Error::Timeout);
                }
                if state.spurious {
                    drop(state);
                    thread::sleep(Duration::from_millis(1));
                    return Ok(());
                }
                if state.ready.remove(io) {
                    return Ok(());
                }
                state = self.cond.wait(state).unwrap();
            }
        }

        fn set_deadline(&self, dirs: IoType, _deadline: Deadline) {
            self.state.lock().unwrap().deadlines |= dirs;
        }

        fn evict(&self) -> bool {
            self.state.lock().unwrap().evicted = true;
            true
        }

        fn wakeup(&self) { self.cond.notify_all(); }

        fn close(&self) { self.closed.fetch_add(1, Ordering::SeqCst); }
    }

    type Fd = FileDescriptor<Arc<Fake>>;

    struct Pipe {
        reader: Fd,
        writer: Fd,
        r: Arc<Fake>,
        w: Arc<Fake>,
    }

    fn pipe() -> Pipe {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                assert_eq!(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK), 0);
            }
        }
        let r = Arc::new(Fake::default());
        let w = Arc::new(Fake::default());
        Pipe {
            reader: unsafe { FileDescriptor::from_raw_fd(&r, fds[0], "reader") }.unwrap(),
            writer: unsafe { FileDescriptor::from_raw_fd(&w, fds[1], "writer") }.unwrap(),
            r,
            w,
        }
    }

    fn is_open(fd: RawFd) -> bool { (unsafe { libc::fcntl(fd, libc::F_GETFD) }) != -1 }

    fn wait_for_waiter(fake: &Fake) {
        let start = Instant::now();
        while fake.waits() == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "operation never started waiting");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Replays scripted results of non-blocking system calls, recording the buffer sizes.
    struct Script {
        results: Vec<IoStatus>,
        requested: Vec<usize>,
    }

    impl Script {
        fn new(results: impl IntoIterator<Item = IoStatus>) -> Self {
            let mut results = results.into_iter().collect::<Vec<_>>();
            results.reverse();
            Script {
                results,
                requested: vec![],
            }
        }

        fn next(&mut self, len: usize) -> IoStatus {
            self.requested.push(len);
            self.results.pop().expect("unexpected system call")
        }
    }

    #[test]
    fn open_flags() {
        let flags = OpenMode::ReadOnly.flags();
        assert_eq!(flags & libc::O_ACCMODE, libc::O_RDONLY);
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        assert_ne!(flags & libc::O_NOCTTY, 0);
        assert_ne!(flags & libc::O_CLOEXEC, 0);
        assert_eq!(OpenMode::WriteOnly.flags() & libc::O_ACCMODE, libc::O_WRONLY);
        assert_eq!(OpenMode::ReadWrite.flags() & libc::O_ACCMODE, libc::O_RDWR);
    }

    #[test]
    fn open_missing_path() {
        let fake = Arc::new(Fake::default());
        let err = FileDescriptor::open(&fake, "/nonexistent/pollfd", OpenMode::ReadOnly).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));

        let err = FileDescriptor::open(&fake, "nul\0byte", OpenMode::ReadOnly).unwrap_err();
        assert!(matches!(err, Error::Io(err) if err.kind() == io::ErrorKind::InvalidInput));
    }

    #[test]
    fn display() {
        let p = pipe();
        assert_eq!(p.reader.to_string(), format!("{{\"reader\" {}}}", p.reader.sysfd()));
        assert_eq!(p.reader.name(), "reader");
        assert_eq!(p.writer.as_raw_fd(), p.writer.sysfd());
    }

    #[test]
    fn read_returns_available_data() {
        let p = pipe();
        assert_eq!(p.writer.write(b"abc").unwrap(), 3);

        let mut buf = [0u8; 16];
        assert_eq!(p.reader.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(p.r.waits(), 0);
    }

    #[test]
    fn read_waits_for_readiness() {
        let Pipe { reader, writer, r, .. } = pipe();
        let reader = Arc::new(reader);

        let thread = {
            let reader = reader.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 16];
                reader.read(&mut buf).map(|len| buf[..len].to_vec())
            })
        };
        wait_for_waiter(&r);
        writer.write(b"xyz").unwrap();
        r.ready(Io::Read);

        assert_eq!(thread.join().unwrap().unwrap(), b"xyz");
    }

    #[test]
    fn read_timeout_does_not_poison() {
        let p = pipe();
        p.r.state.lock().unwrap().timeout_after = Some(0);

        let mut buf = [0u8; 4];
        assert!(matches!(p.reader.read(&mut buf), Err(Error::Timeout)));

        p.r.state.lock().unwrap().timeout_after = None;
        p.writer.write(b"ok").unwrap();
        assert_eq!(p.reader.read(&mut buf).unwrap(), 2);
    }

    #[test]
    fn eof() {
        let p = pipe();
        p.writer.close().unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(p.reader.read(&mut buf), Err(Error::Eof)));
        assert_eq!(p.reader.read(&mut []).unwrap(), 0, "empty buffer is not an end of stream");
        assert_eq!(io::Read::read(&mut &p.reader, &mut buf).unwrap(), 0);
    }

    #[test]
    fn write_accumulates_partial_progress() {
        let Pipe { reader, writer, r, w } = pipe();
        r.state.lock().unwrap().spurious = true;
        w.state.lock().unwrap().spurious = true;
        let len = 1 << 20;

        let thread = thread::spawn(move || writer.write(&vec![0x5au8; len]));

        let mut received = 0;
        let mut buf = vec![0u8; 1 << 16];
        while received < len {
            let n = reader.read(&mut buf).unwrap();
            assert!(buf[..n].iter().all(|b| *b == 0x5a));
            received += n;
        }

        assert_eq!(thread.join().unwrap().unwrap(), len);
        assert_eq!(received, len);
        assert!(w.waits() > 1, "pipe buffer is smaller than the data");
    }

    #[test]
    fn zero_byte_write_after_progress() {
        let fake = Arc::new(Fake::default());
        fake.state.lock().unwrap().spurious = true;
        let mut script =
            Script::new([IoStatus::Success(4), IoStatus::WouldBlock, IoStatus::Success(0)]);

        let err = write_with(&fake, b"abcdefgh", |buf| script.next(buf.len())).unwrap_err();
        assert_eq!(err.written, 4);
        assert!(matches!(err.error, Error::UnexpectedEof));
        assert!(!err.error.is_temporary());
        assert_eq!(script.requested, vec![8, 4, 4]);
        assert_eq!(fake.waits(), 1);

        let err = io::Error::from(err);
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn zero_byte_write_at_start() {
        let fake = Arc::new(Fake::default());
        let mut script = Script::new([IoStatus::Success(0)]);
        let err = write_with(&fake, b"abc", |buf| script.next(buf.len())).unwrap_err();
        assert_eq!(err.written, 0);
        assert!(matches!(err.error, Error::UnexpectedEof));
        assert_eq!(fake.waits(), 0);
    }

    #[test]
    fn scripted_read() {
        let fake = Arc::new(Fake::default());
        fake.state.lock().unwrap().spurious = true;
        let mut buf = [0u8; 8];

        let mut script =
            Script::new([IoStatus::WouldBlock, IoStatus::WouldBlock, IoStatus::Success(3)]);
        assert_eq!(read_with(&fake, &mut buf, |buf| script.next(buf.len())).unwrap(), 3);
        assert_eq!(script.requested, vec![8, 8, 8]);
        assert_eq!(fake.waits(), 2);

        let mut script = Script::new([IoStatus::Success(0)]);
        let res = read_with(&fake, &mut buf, |buf| script.next(buf.len()));
        assert!(matches!(res, Err(Error::Eof)));

        let mut script = Script::new([IoStatus::Err(io::Error::from_raw_os_error(libc::EIO))]);
        let err = read_with(&fake, &mut buf, |buf| script.next(buf.len())).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
    }

    #[test]
    fn write_timeout_reports_partial_count() {
        let p = pipe();
        p.w.state.lock().unwrap().timeout_after = Some(0);

        let data = vec![0u8; 1 << 20];
        let err = p.writer.write(&data).unwrap_err();
        assert!(matches!(err.error, Error::Timeout));
        assert!(err.written > 0 && err.written < data.len());

        let mut sink = &p.writer;
        let err = io::Write::write(&mut sink, &data).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn write_to_closed_pipe_reports_os_error() {
        let p = pipe();
        p.reader.close().unwrap();
        // Rust runtime ignores SIGPIPE, so the write fails with EPIPE
        let err = p.writer.write(b"data").unwrap_err();
        assert_eq!(err.written, 0);
        assert_eq!(err.error.raw_os_error(), Some(libc::EPIPE));
        assert!(!err.error.is_temporary());
    }

    #[test]
    fn close_twice() {
        let p = pipe();
        assert!(p.reader.close().is_ok());
        assert_eq!(p.reader.sysfd(), -1);
        assert!(matches!(p.reader.close(), Err(Error::Closing)));
        assert_eq!(p.r.closed(), 1);
    }

    #[test]
    fn operations_after_close() {
        let p = pipe();
        p.reader.close().unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(p.reader.read(&mut buf), Err(Error::Closing)));
        assert!(matches!(p.reader.write(&buf), Err(WriteError { written: 0, error: Error::Closing })));
        assert!(matches!(p.reader.set_deadline(Deadline::none()), Err(Error::Closing)));
        assert!(matches!(p.reader.set_read_deadline(Deadline::none()), Err(Error::Closing)));
        assert!(matches!(p.reader.set_write_deadline(Deadline::none()), Err(Error::Closing)));
        assert!(matches!(p.reader.incref(), Err(Error::Closing)));
        assert!(p.reader.pin().is_err());
        assert_eq!(p.r.waits(), 0);
    }

    #[test]
    fn close_unblocks_reader() {
        let Pipe {
            reader,
            writer: _writer,
            r,
            ..
        } = pipe();
        let reader = Arc::new(reader);

        let thread = {
            let reader = reader.clone();
            thread::spawn(move || reader.read(&mut [0u8; 4]))
        };
        wait_for_waiter(&r);
        reader.close().unwrap();

        assert!(matches!(thread.join().unwrap(), Err(Error::Closing)));
        assert_eq!(reader.sysfd(), -1);
        assert_eq!(r.closed(), 1);
    }

    #[test]
    fn pin_defers_release() {
        let p = pipe();
        let fd = p.reader.sysfd();

        let pinned = p.reader.pin().unwrap();
        p.reader.close().unwrap();
        assert!(is_open(fd), "handle must survive while pinned");
        assert_eq!(pinned.as_raw_fd(), fd);
        assert_eq!(pinned.descriptor().name(), "reader");
        assert_eq!(p.r.closed(), 0);

        drop(pinned);
        assert_eq!(p.reader.sysfd(), -1);
        assert_eq!(p.r.closed(), 1);

        let fd = p.writer.sysfd();
        p.writer.incref().unwrap();
        p.writer.close().unwrap();
        assert!(is_open(fd));
        assert_eq!(p.w.closed(), 0);
        p.writer.decref();
        assert_eq!(p.writer.sysfd(), -1);
        assert_eq!(p.w.closed(), 1);
    }

    #[test]
    fn same_direction_is_busy() {
        let Pipe { reader, writer, r, .. } = pipe();
        let reader = Arc::new(reader);

        let thread = {
            let reader = reader.clone();
            thread::spawn(move || reader.read(&mut [0u8; 4]))
        };
        wait_for_waiter(&r);

        assert!(matches!(reader.read(&mut [0u8; 4]), Err(Error::Busy)));
        assert_eq!(r.waits(), 1, "busy read must not wait");
        // Misc operations and the other direction are not affected
        assert!(reader.set_read_deadline(Deadline::none()).is_ok());
        assert!(matches!(reader.write(b"1"), Err(WriteError { error: Error::Io(_), .. })));
        writer.write(b"1").unwrap();

        r.ready(Io::Read);
        assert_eq!(thread.join().unwrap().unwrap(), 1);
    }

    #[test]
    fn deadlines_are_forwarded() {
        let p = pipe();
        p.reader.set_read_deadline(Deadline::after(Duration::from_secs(1))).unwrap();
        assert_eq!(p.r.state.lock().unwrap().deadlines, IoType::read_only());
        p.reader.set_deadline(Deadline::none()).unwrap();
        assert_eq!(p.r.state.lock().unwrap().deadlines, IoType::read_write());
        assert_eq!(p.reader.refs.refs(), 0, "setting deadline must unpin");
    }

    #[test]
    fn lifecycle_is_observable() {
        let p = pipe();
        let fd = p.reader.sysfd();
        assert!(!p.reader.is_closing());
        assert_eq!(p.reader.refs(), 0);
        assert!(!p.reader.is_locked(Io::Read));

        p.reader.incref().unwrap();
        assert_eq!(p.reader.refs(), 1);
        p.reader.close().unwrap();
        assert!(p.reader.is_closing());
        assert_eq!(p.reader.refs(), 1, "closer releases its own pin");
        assert!(is_open(fd));
        assert!(matches!(p.reader.close(), Err(Error::Closing)));

        p.reader.decref();
        assert_eq!(p.reader.refs(), 0);
        assert_eq!(p.reader.sysfd(), -1);
        assert_eq!(p.r.closed(), 1);

        drop(p.reader);
        assert_eq!(p.r.closed(), 1, "handle is released exactly once");
    }

    #[test]
    fn drop_closes() {
        let Pipe { reader, writer, r, w } = pipe();
        drop(reader);
        assert_eq!(r.closed(), 1);

        writer.close().unwrap();
        drop(writer);
        assert_eq!(w.closed(), 1, "explicitly closed descriptor is not released twice");
    }
}
