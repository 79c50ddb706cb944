// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Asynchronous operations on non-blocking descriptors.
//!
//! All operations here take descriptors the application has already put
//! into non-blocking mode; socket setup stays outside the runtime. The
//! caller never handles readiness directly: a not-ready descriptor
//! suspends the calling task against the [reactor](crate::reactor) and
//! the operation's result comes back by value.
//!
//! Error policy: `EINTR` is retried, `EAGAIN` suspends, anything else
//! surfaces as an [`io::Error`]. Peer disconnect surfaces as `Ok(0)`.
//! Nothing is retried beyond that and no timeouts exist; a timeout is
//! expressible as a cancelling task.
//!
//! Three calling modes share the machinery:
//!
//! - **coroutines** await the futures returned by [`read`], [`write`],
//!   [`accept`] and [`connect`];
//! - **fibers** call the blocking-style equivalents in
//!   [`crate::fiber`], which suspend the fiber instead of returning
//!   `Pending`;
//! - **fork/join tasks** use [`read_async`], which hands each chunk to a
//!   callback running as an I/O continuation task, re-reading inline for
//!   up to 32 consecutive chunks before going back through the reactor.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::pin::Pin;
use std::ptr::NonNull;
use std::task::{Context, Poll};

use crate::executor;
use crate::fork::{Execute, ForkCx, allocate_root};
use crate::reactor::{Interest, Pending, last_errno, raw_read};
use crate::task::TaskRef;

/// How many consecutive chunks an I/O continuation re-reads inline
/// before going back through the reactor.
const INLINE_READ_BURST: u32 = 32;

/// Registers the calling task's waker for readiness on `fd`.
fn register_waker(fd: RawFd, interest: Interest, cx: &mut Context<'_>) -> io::Result<()> {
    let core = executor::current_core()
        .expect("weft::io operations must run on a weft executor");
    core.reactor().register(fd, interest, Pending::Waker(cx.waker().clone()))
}

// === coroutine mode ===

/// Reads up to `buf.len()` bytes from `fd`.
///
/// Resolves to the number of bytes read; `Ok(0)` signals end of stream.
pub fn read(fd: RawFd, buf: &mut [u8]) -> Read<'_> {
    Read { fd, buf }
}

/// Future returned by [`read`].
#[must_use = "futures do nothing unless awaited"]
pub struct Read<'a> {
    fd: RawFd,
    buf: &'a mut [u8],
}

impl Future for Read<'_> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match sys_read(this.fd, this.buf) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                match register_waker(this.fd, Interest::Readable, cx) {
                    Ok(()) => Poll::Pending,
                    Err(err) => Poll::Ready(Err(err)),
                }
            }
            ready => Poll::Ready(ready),
        }
    }
}

/// Writes the bytes of `buf` to `fd`, resolving to the number of bytes
/// accepted by the kernel (a single short write is possible).
pub fn write(fd: RawFd, buf: &[u8]) -> Write<'_> {
    Write { fd, buf }
}

/// Future returned by [`write`].
#[must_use = "futures do nothing unless awaited"]
pub struct Write<'a> {
    fd: RawFd,
    buf: &'a [u8],
}

impl Future for Write<'_> {
    type Output = io::Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match sys_write(this.fd, this.buf) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                match register_waker(this.fd, Interest::Writable, cx) {
                    Ok(()) => Poll::Pending,
                    Err(err) => Poll::Ready(Err(err)),
                }
            }
            ready => Poll::Ready(ready),
        }
    }
}

/// Accepts one connection from the listening descriptor `fd`.
///
/// Resolves to the (already non-blocking) client descriptor and the peer
/// address.
pub fn accept(fd: RawFd) -> Accept {
    Accept { fd }
}

/// Future returned by [`accept`].
#[must_use = "futures do nothing unless awaited"]
pub struct Accept {
    fd: RawFd,
}

impl Future for Accept {
    type Output = io::Result<(RawFd, SocketAddr)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match sys_accept(self.fd) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                match register_waker(self.fd, Interest::Readable, cx) {
                    Ok(()) => Poll::Pending,
                    Err(err) => Poll::Ready(Err(err)),
                }
            }
            ready => Poll::Ready(ready),
        }
    }
}

/// Connects the (non-blocking) socket `fd` to `addr`.
pub fn connect(fd: RawFd, addr: SocketAddr) -> Connect {
    Connect { fd, addr, started: false }
}

/// Future returned by [`connect`].
#[must_use = "futures do nothing unless awaited"]
pub struct Connect {
    fd: RawFd,
    addr: SocketAddr,
    started: bool,
}

impl Future for Connect {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.started {
            match sys_connect(this.fd, this.addr) {
                Ok(()) => return Poll::Ready(Ok(())),
                Err(err)
                    if err.raw_os_error() == Some(libc::EINPROGRESS)
                        || err.kind() == io::ErrorKind::WouldBlock =>
                {
                    this.started = true;
                    return match register_waker(this.fd, Interest::Writable, cx) {
                        Ok(()) => Poll::Pending,
                        Err(err) => Poll::Ready(Err(err)),
                    };
                }
                Err(err) => return Poll::Ready(Err(err)),
            }
        }

        // Writable after EINPROGRESS: the outcome is in SO_ERROR.
        Poll::Ready(sys_take_socket_error(this.fd))
    }
}

// === fork/join callback mode ===

/// Callback invoked with `(cx, fd, buf, n)` for every chunk delivered by
/// [`read_async`]; `n == 0` is end of stream, `n == -1` leaves the error
/// in `errno`. Calling [`read_async`] again from inside the callback
/// continues the read sequence (taking the inline fast path while data
/// keeps being available).
pub type ReadCallback = fn(&mut ForkCx<'_>, RawFd, *mut u8, isize);

pub(crate) struct ReadState {
    fd: RawFd,
    buf: *mut u8,
    n: isize,
    /// Consecutive chunks delivered without going through the reactor.
    seq: u32,
    callback: ReadCallback,
}

impl ReadState {
    pub(crate) fn set_result(&mut self, n: isize) {
        self.n = n;
        self.seq += 1;
    }
}

/// The I/O continuation task: runs the callback for the chunk most
/// recently read, and recycles itself whenever the callback pulled
/// another chunk inline.
struct IoReadTask {
    state: ReadState,
}

// Safety: `state.buf` is only dereferenced by the callback associated
// with the read, which runs exclusively on the worker executing this
// task.
unsafe impl Send for IoReadTask {}

impl Execute for IoReadTask {
    fn execute(&mut self, cx: &mut ForkCx<'_>) -> Option<TaskRef> {
        let seq = self.state.seq;
        let (callback, fd, buf, n) =
            (self.state.callback, self.state.fd, self.state.buf, self.state.n);

        // Expose the state so a re-entrant read_async can take the
        // inline fast path; no reference into it stays live across the
        // callback.
        cx.worker.current_io = Some(NonNull::from(&mut self.state));
        callback(cx, fd, buf, n);
        cx.worker.current_io = None;

        if self.state.seq != seq {
            // The callback read another chunk inline; run again with the
            // new result instead of being freed.
            cx.recycle();
            return Some(cx.current());
        }

        None
    }
}

/// Fork/join-mode asynchronous read.
///
/// Delivers the next chunk read from `fd` to `callback`, running it as a
/// task on this pool. When called from within a delivery that has made
/// fewer than 32 consecutive inline reads, data already available is
/// read and delivered without touching the reactor, amortising the
/// per-event overhead of a busy descriptor.
///
/// The buffer must stay valid until the callback has observed the
/// result.
pub fn read_async(cx: &mut ForkCx<'_>, fd: RawFd, buf: *mut u8, len: usize, callback: ReadCallback) {
    if let Some(state) = cx.current_io() {
        if state.seq < INLINE_READ_BURST {
            let n = raw_read(fd, buf, len);
            if n >= 0 || last_errno() != libc::EAGAIN {
                state.fd = fd;
                state.buf = buf;
                state.set_result(n);
                return;
            }
        }
    }

    // Not ready (or the burst is spent): park a fresh continuation on
    // the reactor.
    let task = allocate_root(
        IoReadTask {
            state: ReadState {
                fd,
                buf,
                n: 0,
                seq: 0,
                callback,
            },
        },
        cx.core_arc(),
    )
    .into_task();

    cx.executor()
        .reactor()
        .register(fd, Interest::Readable, Pending::ReadInto { task, buf, len })
        .expect("failed to register read interest");
}

/// Stores a reactor-performed read result on an I/O continuation task.
///
/// # Safety contract (internal)
///
/// `task` must be the `IoReadTask` the reactor's `ReadInto` record was
/// created with.
pub(crate) fn fill_read_result(task: &TaskRef, n: isize) {
    // Safety: ReadInto records are only ever built around IoReadTask
    // cells, and the task is quiescent while parked on the reactor.
    unsafe {
        crate::fork::with_body::<IoReadTask, _>(task, |body| body.state.set_result(n));
    }
}

// === syscall wrappers ===

pub(crate) fn sys_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = raw_read(fd, buf.as_mut_ptr(), buf.len());
    if n >= 0 {
        Ok(n as usize)
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn sys_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        // Safety: buffer is a live slice.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

pub(crate) fn sys_accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    // Safety: storage is sized for any socket address family.
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        loop {
            let client = libc::accept4(
                fd,
                std::ptr::from_mut(&mut storage).cast(),
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            );
            if client >= 0 {
                return Ok((client, sockaddr_to_addr(&storage)?));
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }
}

fn sys_connect(fd: RawFd, addr: SocketAddr) -> io::Result<()> {
    let (storage, len) = addr_to_sockaddr(addr);
    loop {
        // Safety: storage holds a valid sockaddr of length len.
        let rc = unsafe { libc::connect(fd, std::ptr::from_ref(&storage).cast(), len) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

fn sys_take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    // Safety: out parameters sized above.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::from_mut(&mut err).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        Err(io::Error::last_os_error())
    } else if err != 0 {
        Err(io::Error::from_raw_os_error(err))
    } else {
        Ok(())
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match i32::from(storage.ss_family) {
        libc::AF_INET => {
            // Safety: family checked; sockaddr_in fits in the storage.
            let addr = unsafe { &*std::ptr::from_ref(storage).cast::<libc::sockaddr_in>() };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // Safety: family checked; sockaddr_in6 fits in the storage.
            let addr = unsafe { &*std::ptr::from_ref(storage).cast::<libc::sockaddr_in6>() };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported address family {other}"),
        )),
    }
}

fn addr_to_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Safety: zeroed storage is a valid value for the sockaddr types.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            // Safety: sockaddr_in fits in sockaddr_storage.
            unsafe {
                std::ptr::from_mut(&mut storage)
                    .cast::<libc::sockaddr_in>()
                    .write(sin);
            }
            (storage, size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // Safety: sockaddr_in6 fits in sockaddr_storage.
            unsafe {
                std::ptr::from_mut(&mut storage)
                    .cast::<libc::sockaddr_in6>()
                    .write(sin6);
            }
            (storage, size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::executor::Executor;
    use crate::fork::Execute;

    /// A non-blocking pipe, closed on drop.
    struct Pipe {
        rd: RawFd,
        wr: RawFd,
    }

    impl Pipe {
        fn new() -> Self {
            let mut fds = [0; 2];
            // Safety: out array sized for pipe2.
            let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
            assert_eq!(rc, 0, "pipe2 failed");
            Self {
                rd: fds[0],
                wr: fds[1],
            }
        }

        fn close_write(&mut self) {
            if self.wr >= 0 {
                // Safety: closing our own descriptor once.
                unsafe { libc::close(self.wr) };
                self.wr = -1;
            }
        }
    }

    impl Drop for Pipe {
        fn drop(&mut self) {
            // Safety: closing our own descriptors.
            unsafe {
                libc::close(self.rd);
                if self.wr >= 0 {
                    libc::close(self.wr);
                }
            }
        }
    }

    fn write_all_blocking(fd: RawFd, mut buf: &[u8]) {
        while !buf.is_empty() {
            match sys_write(fd, buf) {
                Ok(n) => buf = &buf[n..],
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(err) => panic!("write failed: {err}"),
            }
        }
    }

    #[test]
    fn starved_read_suspends_until_data_arrives() {
        let exec = Executor::new(1).unwrap();
        let pipe = Pipe::new();
        let (rd, wr) = (pipe.rd, pipe.wr);

        let handle = exec.spawn(async move {
            let mut buf = [0u8; 64];
            let n = read(rd, &mut buf).await.unwrap();
            (n, buf)
        });

        let writer = thread::spawn(move || {
            // Give the reader time to actually suspend.
            thread::sleep(Duration::from_millis(50));
            write_all_blocking(wr, b"seven!!");
        });

        let (n, buf) = exec.block_on(handle).unwrap();
        assert_eq!(n, 7);
        assert_eq!(&buf[..n], b"seven!!");

        writer.join().unwrap();
        exec.stop();
        exec.join();
    }

    #[test]
    fn read_reports_eof_as_zero() {
        let exec = Executor::new(1).unwrap();
        let mut pipe = Pipe::new();
        pipe.close_write();
        let rd = pipe.rd;

        let handle = exec.spawn(async move {
            let mut buf = [0u8; 8];
            read(rd, &mut buf).await.unwrap()
        });

        assert_eq!(exec.block_on(handle).unwrap(), 0);
        exec.stop();
        exec.join();
    }

    #[test]
    fn write_suspends_on_a_full_pipe() {
        let exec = Executor::new(1).unwrap();
        let pipe = Pipe::new();
        let (rd, wr) = (pipe.rd, pipe.wr);

        // Fill the pipe until the kernel pushes back.
        let filler = [0u8; 4096];
        let mut filled = 0usize;
        loop {
            match sys_write(wr, &filler) {
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => panic!("fill failed: {err}"),
            }
        }

        let handle = exec.spawn(async move { write(wr, b"after the flood").await.unwrap() });

        let drainer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let mut buf = vec![0u8; filled];
            let mut drained = 0;
            while drained < filled {
                match sys_read(rd, &mut buf) {
                    Ok(n) => drained += n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(err) => panic!("drain failed: {err}"),
                }
            }
        });

        let n = exec.block_on(handle).unwrap();
        assert!(n > 0);

        drainer.join().unwrap();
        exec.stop();
        exec.join();
    }

    #[test]
    fn echo_reads_every_chunk_then_eof() {
        let exec = Executor::new(1).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let lfd = listener.as_raw_fd();

        let reads = Arc::new(Mutex::new(Vec::new()));

        let handle = exec.spawn({
            let reads = Arc::clone(&reads);
            async move {
                let (client, _peer) = accept(lfd).await.unwrap();
                let mut buf = [0u8; 1024];
                loop {
                    let n = read(client, &mut buf).await.unwrap();
                    reads.lock().unwrap().push(n);
                    if n == 0 {
                        // Safety: fd returned by accept, closed once.
                        unsafe { libc::close(client) };
                        break;
                    }
                }
            }
        });

        let client = thread::spawn(move || {
            use std::io::Write as _;
            let mut stream = TcpStream::connect(addr).unwrap();
            for _ in 0..3 {
                stream.write_all(b"hello").unwrap();
                stream.flush().unwrap();
                thread::sleep(Duration::from_millis(50));
            }
        });

        exec.block_on(handle).unwrap();
        client.join().unwrap();

        let reads = reads.lock().unwrap();
        assert_eq!(reads.iter().sum::<usize>(), 15);
        assert_eq!(*reads.last().unwrap(), 0);

        exec.stop();
        exec.join();
    }

    #[test]
    fn connect_then_write_round_trip() {
        let exec = Executor::new(1).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            use std::io::Read as _;
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        let handle = exec.spawn(async move {
            // Safety: creating a fresh socket we own.
            let fd = unsafe {
                libc::socket(
                    libc::AF_INET,
                    libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    0,
                )
            };
            assert!(fd >= 0);

            connect(fd, addr).await.unwrap();
            let n = write(fd, b"ping").await.unwrap();
            assert_eq!(n, 4);
            // Safety: closing our own socket.
            unsafe { libc::close(fd) };
        });

        exec.block_on(handle).unwrap();
        assert_eq!(&server.join().unwrap(), b"ping");

        exec.stop();
        exec.join();
    }

    // fork/join callback mode: results land here chunk by chunk. One
    // test uses them, so plain statics are fine.
    static CHUNKS: Mutex<Vec<isize>> = Mutex::new(Vec::new());

    fn on_chunk(cx: &mut ForkCx<'_>, fd: RawFd, buf: *mut u8, n: isize) {
        CHUNKS.lock().unwrap().push(n);
        if n > 0 {
            read_async(cx, fd, buf, 64, on_chunk);
        } else {
            cx.executor().stop();
        }
    }

    struct StartRead {
        fd: RawFd,
        buf: NonNull<u8>,
    }

    // Safety: the buffer is leaked for the duration of the test.
    unsafe impl Send for StartRead {}

    impl Execute for StartRead {
        fn execute(&mut self, cx: &mut ForkCx<'_>) -> Option<TaskRef> {
            read_async(cx, self.fd, self.buf.as_ptr(), 64, on_chunk);
            None
        }
    }

    #[test]
    fn fork_read_async_delivers_chunks_then_eof() {
        let exec = Executor::new(1).unwrap();
        let mut pipe = Pipe::new();
        let (rd, wr) = (pipe.rd, pipe.wr);

        let buf = NonNull::from(Box::leak(Box::new([0u8; 64]))).cast::<u8>();

        let starter = exec.fork(StartRead { fd: rd, buf });
        exec.spawn_task(starter.into_task());

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            write_all_blocking(wr, b"abc");
            thread::sleep(Duration::from_millis(30));
            write_all_blocking(wr, b"defg");
        });

        writer.join().unwrap();
        pipe.close_write();

        exec.join();

        let chunks = CHUNKS.lock().unwrap();
        let total: isize = chunks.iter().sum();
        assert_eq!(total, 7);
        assert_eq!(*chunks.last().unwrap(), 0);
        assert!(chunks.iter().all(|&n| n >= 0));
    }

    // The inline fast path: while data is already available, successive
    // read_async calls from the callback must not go through the
    // reactor. We observe it indirectly: all chunks of a pre-filled pipe
    // arrive even though the writer never writes again after startup.
    static BURST_TOTAL: AtomicIsize = AtomicIsize::new(0);
    static BURST_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn on_burst(cx: &mut ForkCx<'_>, fd: RawFd, buf: *mut u8, n: isize) {
        BURST_CALLS.fetch_add(1, Ordering::AcqRel);
        if n > 0 {
            BURST_TOTAL.fetch_add(n, Ordering::AcqRel);
            read_async(cx, fd, buf, 8, on_burst);
        } else {
            cx.executor().stop();
        }
    }

    struct StartBurst {
        fd: RawFd,
        buf: NonNull<u8>,
    }

    // Safety: the buffer is leaked for the duration of the test.
    unsafe impl Send for StartBurst {}

    impl Execute for StartBurst {
        fn execute(&mut self, cx: &mut ForkCx<'_>) -> Option<TaskRef> {
            read_async(cx, self.fd, self.buf.as_ptr(), 8, on_burst);
            None
        }
    }

    #[test]
    fn fork_read_async_drains_available_data_inline() {
        let exec = Executor::new(1).unwrap();
        let mut pipe = Pipe::new();

        // 40 bytes, read 8 at a time: five data chunks, one EOF.
        write_all_blocking(pipe.wr, &[7u8; 40]);
        pipe.close_write();

        let buf = NonNull::from(Box::leak(Box::new([0u8; 8]))).cast::<u8>();
        let starter = exec.fork(StartBurst { fd: pipe.rd, buf });
        exec.spawn_task(starter.into_task());

        exec.join();

        assert_eq!(BURST_TOTAL.load(Ordering::Acquire), 40);
        assert_eq!(BURST_CALLS.load(Ordering::Acquire), 6);
    }
}
