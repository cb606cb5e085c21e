//! OS-dependent layer
//!
//! Everything the core consumes from the operating system lives here: a
//! millisecond clock, the page-size query, anonymous memory mappings for the
//! heap, non-blocking socket primitives, and thread spawn. The rest of the
//! crate never calls `libc` directly.

use std::io;
use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::Instant;
use tracing::debug;

/// Interrupted system calls are retried this many times before giving up.
pub const MAX_SYSCALL_INTERRUPTS: u32 = 5;

/// No single socket buffer is shrunk below the network MTU.
pub const NETWORK_MTU: usize = 1400;

pub const NULL_SOCKET: RawFd = -1;

// =============================================================================
// LOCKS, CLOCK, THREADS
// =============================================================================

/// Acquire a mutex, recovering from poisoning.
///
/// The structures guarded by these locks carry their own validity checks
/// (`check_state`), so a panic mid-operation is surfaced there rather than by
/// propagating poison to every later caller.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Milliseconds on a monotonic clock, counted from first use.
pub fn ticks_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

pub fn sleep_ms(ms: u64) {
    thread::sleep(std::time::Duration::from_millis(ms));
}

/// Spawn a named worker thread.
pub fn spawn_thread<F>(name: &str, body: F) -> io::Result<thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(body)
}

// =============================================================================
// VIRTUAL MEMORY
// =============================================================================

/// Size of a virtual memory page.
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n <= 0 { 4096 } else { n as usize }
    })
}

/// Map an anonymous read-write region. The mapping is page-aligned.
pub fn map_region(bytes: usize) -> io::Result<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
}

/// Unmap a region previously obtained from [`map_region`].
///
/// # Safety
/// `ptr`/`bytes` must describe exactly one live mapping and nothing may
/// reference it afterwards.
pub unsafe fn unmap_region(ptr: NonNull<u8>, bytes: usize) {
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), bytes) };
    if rc != 0 {
        debug!("munmap failed: {}", io::Error::last_os_error());
    }
}

// =============================================================================
// SOCKETS
// =============================================================================
// All sockets are IPv4 and non-blocking; the reactor owns their lifecycle.

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// Outcome of a non-blocking `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Done,
    InProgress,
}

fn to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sa
}

fn from_sockaddr_in(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    let ip = std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
    SocketAddrV4::new(ip, u16::from_be(sa.sin_port))
}

fn last_err() -> io::Error {
    io::Error::last_os_error()
}

fn is_interrupted(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINTR)
}

pub fn would_block(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EWOULDBLOCK) | Some(libc::EAGAIN) | Some(libc::EINPROGRESS)
    )
}

pub fn not_connected(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOTCONN)
}

/// Run a system call, retrying a bounded number of times on interruption.
fn retry_interrupted<F: FnMut() -> libc::ssize_t>(mut call: F) -> io::Result<usize> {
    let mut retries = 0;
    loop {
        let rc = call();
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = last_err();
        if is_interrupted(&err) && retries < MAX_SYSCALL_INTERRUPTS {
            retries += 1;
            continue;
        }
        return Err(err);
    }
}

pub fn tcp_socket() -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 { Err(last_err()) } else { Ok(fd) }
}

pub fn udp_socket() -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 { Err(last_err()) } else { Ok(fd) }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(last_err());
    }
    if flags & libc::O_NONBLOCK == 0 {
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(last_err());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockBuf {
    Send,
    Recv,
}

/// Set a socket buffer size, halving on failure until the MTU floor.
pub fn set_socket_buffer(fd: RawFd, which: SockBuf, bytes: usize) -> io::Result<()> {
    let opt = match which {
        SockBuf::Send => libc::SO_SNDBUF,
        SockBuf::Recv => libc::SO_RCVBUF,
    };
    let mut try_size = bytes;
    loop {
        let val = try_size as libc::c_int;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                (&raw const val).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = last_err();
        if err.raw_os_error() == Some(libc::ENOBUFS) && try_size / 2 > NETWORK_MTU {
            try_size /= 2;
            continue;
        }
        return Err(err);
    }
}

pub fn bind_socket(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let sa = to_sockaddr_in(addr);
    let rc = unsafe {
        libc::bind(
            fd,
            (&raw const sa).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 { Err(last_err()) } else { Ok(()) }
}

pub fn listen_socket(fd: RawFd, backlog: i32) -> io::Result<()> {
    let rc = unsafe { libc::listen(fd, backlog) };
    if rc < 0 { Err(last_err()) } else { Ok(()) }
}

/// Start a non-blocking connect.
pub fn connect_socket(fd: RawFd, addr: SocketAddrV4) -> io::Result<ConnectProgress> {
    let sa = to_sockaddr_in(addr);
    let mut retries = 0;
    loop {
        let rc = unsafe {
            libc::connect(
                fd,
                (&raw const sa).cast(),
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            return Ok(ConnectProgress::Done);
        }
        let err = last_err();
        if is_interrupted(&err) && retries < MAX_SYSCALL_INTERRUPTS {
            retries += 1;
            continue;
        }
        if would_block(&err) {
            return Ok(ConnectProgress::InProgress);
        }
        return Err(err);
    }
}

/// Accept one pending connection on a non-blocking listener.
pub fn accept_socket(fd: RawFd) -> io::Result<(RawFd, SocketAddrV4)> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let mut retries = 0;
    loop {
        let rc = unsafe { libc::accept(fd, (&raw mut sa).cast(), &raw mut len) };
        if rc >= 0 {
            return Ok((rc, from_sockaddr_in(&sa)));
        }
        let err = last_err();
        if is_interrupted(&err) && retries < MAX_SYSCALL_INTERRUPTS {
            retries += 1;
            continue;
        }
        return Err(err);
    }
}

/// The error for a socket whose async connect just completed, if any.
pub fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut val: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&raw mut val).cast(),
            &raw mut len,
        )
    };
    if rc < 0 {
        return Err(last_err());
    }
    if val == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(val)))
    }
}

pub fn recv_socket(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    retry_interrupted(|| unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) })
}

pub fn send_socket(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    retry_interrupted(|| unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), SEND_FLAGS) })
}

pub fn recv_from_socket(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let n = retry_interrupted(|| unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            0,
            (&raw mut sa).cast(),
            &raw mut len,
        )
    })?;
    Ok((n, from_sockaddr_in(&sa)))
}

pub fn send_to_socket(fd: RawFd, buf: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
    let sa = to_sockaddr_in(dest);
    retry_interrupted(|| unsafe {
        libc::sendto(
            fd,
            buf.as_ptr().cast(),
            buf.len(),
            SEND_FLAGS,
            (&raw const sa).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })
}

/// The locally bound address of a socket.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(fd, (&raw mut sa).cast(), &raw mut len) };
    if rc < 0 {
        return Err(last_err());
    }
    Ok(from_sockaddr_in(&sa))
}

/// Close a socket without lingering on unacknowledged data.
///
/// A peer that withholds its FIN-ACK must not be able to park the reactor
/// thread: linger is turned off, the send side is shut down, remaining
/// inbound data is drained into a scratch buffer, then the handle is closed.
pub fn safe_close_socket(fd: RawFd, udp: bool) {
    debug!("closing socket {}", fd);

    let linger = libc::linger { l_onoff: 0, l_linger: 0 };
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            (&raw const linger).cast(),
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        );
        libc::shutdown(fd, libc::SHUT_WR);
    }

    let mut scratch = [0u8; 2000];
    loop {
        let result = if udp {
            recv_from_socket(fd, &mut scratch).map(|(n, _)| n)
        } else {
            recv_socket(fd, &mut scratch)
        };
        match result {
            Ok(n) if n > 0 => continue,
            _ => break,
        }
    }

    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_page_size_sane() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn test_ticks_monotonic() {
        let a = ticks_ms();
        sleep_ms(5);
        let b = ticks_ms();
        assert!(b >= a + 4);
    }

    #[test]
    fn test_map_region_is_page_aligned() {
        let region = map_region(64 * 1024).unwrap();
        assert_eq!(region.as_ptr() as usize % page_size(), 0);
        unsafe {
            region.as_ptr().write(0xAB);
            assert_eq!(region.as_ptr().read(), 0xAB);
            unmap_region(region, 64 * 1024);
        }
    }

    #[test]
    fn test_sockaddr_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 8080);
        let sa = to_sockaddr_in(addr);
        assert_eq!(from_sockaddr_in(&sa), addr);
    }

    #[test]
    fn test_socket_setup() {
        let fd = tcp_socket().unwrap();
        set_nonblocking(fd).unwrap();
        set_socket_buffer(fd, SockBuf::Send, 16_000).unwrap();
        set_socket_buffer(fd, SockBuf::Recv, 16_000).unwrap();
        bind_socket(fd, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let bound = local_addr(fd).unwrap();
        assert!(bound.port() != 0);
        safe_close_socket(fd, false);
    }

    #[test]
    fn test_lock_recovers_from_poison() {
        let mutex = std::sync::Arc::new(Mutex::new(7u32));
        let clone = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison it");
        })
        .join();
        assert_eq!(*lock(&mutex), 7);
    }
}
