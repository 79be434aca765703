//! Fiber-aware socket wrappers.
//!
//! [`RingStream`] and [`RingListener`] are thin owners of a file
//! descriptor whose blocking-looking calls go through the ring: the
//! calling fiber yields, the OS thread does not. Existing std sockets
//! convert via `TryFrom`; raw descriptors via `FromRawFd`.

use std::convert::TryFrom;
use std::io::{self, Read, Write};
use std::mem::forget;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use crate::buf::Buffer;
use crate::error::{Error, Result};
use crate::io as ops;

/// A connected stream socket owned by the runtime's caller. Closed on
/// drop.
pub struct RingStream {
    fd: RawFd,
}

impl RingStream {
    /// Take ownership of an fd-like object and route its I/O through the
    /// ring.
    pub fn new<T: IntoRawFd>(inner: T) -> RingStream {
        RingStream {
            fd: inner.into_raw_fd(),
        }
    }

    /// Read up to `maxlen` bytes, appended to `buf`. `None` is end of
    /// stream.
    pub fn read_buf(&self, buf: &Buffer, maxlen: usize) -> Result<Option<usize>> {
        ops::read(self, buf, maxlen, false, None)
    }

    /// Write all of `buf`.
    pub fn write_buf(&self, buf: &Buffer) -> Result<usize> {
        ops::write(self, buf)
    }

    /// Close through the ring, reporting the kernel's verdict. Dropping
    /// the stream closes it too, just without the error reporting.
    pub fn close(self) -> Result<()> {
        let fd = self.fd;
        forget(self);
        ops::close_raw(fd)
    }
}

impl AsRawFd for RingStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for RingStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        forget(self);
        fd
    }
}

impl FromRawFd for RingStream {
    unsafe fn from_raw_fd(fd: RawFd) -> RingStream {
        RingStream { fd }
    }
}

impl Read for RingStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let buf = Buffer::with_capacity(out.len());
        match ops::read(&*self, &buf, out.len(), false, None) {
            Ok(None) => Ok(0),
            Ok(Some(n)) => {
                buf.with_slice(|bytes| out[..n].copy_from_slice(&bytes[..n]));
                Ok(n)
            }
            Err(Error::IO(e)) => Err(e),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }
}

impl Write for RingStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match ops::write(&*self, &Buffer::from(data)) {
            Ok(n) => Ok(n),
            Err(Error::IO(e)) => Err(e),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for RingStream {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

impl TryFrom<TcpStream> for RingStream {
    type Error = Error;

    fn try_from(stream: TcpStream) -> Result<RingStream> {
        Ok(RingStream::new(stream))
    }
}

/// A listening TCP socket whose `accept` yields instead of blocking.
pub struct RingListener {
    inner: TcpListener,
}

impl RingListener {
    pub fn bind(addr: impl ToSocketAddrs) -> Result<RingListener> {
        let inner = TcpListener::bind(addr).map_err(Error::IO)?;
        Ok(RingListener { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr().map_err(Error::IO)
    }

    /// Accept one connection, yielding until a client arrives.
    pub fn accept(&self) -> Result<RingStream> {
        ops::accept(self)
    }

    /// Accept connections forever, invoking `f` for each.
    pub fn accept_loop(
        &self,
        f: impl FnMut(RingStream) -> Result<()>,
    ) -> Result<std::convert::Infallible> {
        ops::accept_loop(self, f)
    }

    /// Accept through a single multishot submission; see
    /// [`multishot_accept`](crate::io::multishot_accept).
    pub fn multishot_accept(
        &self,
        f: impl FnMut(RingStream) -> Result<()>,
    ) -> Result<std::convert::Infallible> {
        ops::multishot_accept(self, f)
    }
}

impl AsRawFd for RingListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl TryFrom<TcpListener> for RingListener {
    type Error = Error;

    fn try_from(inner: TcpListener) -> Result<RingListener> {
        Ok(RingListener { inner })
    }
}

/// Open a TCP connection to `addr`, yielding while the handshake is in
/// flight. Name resolution uses the std resolver and happens before the
/// first yield.
pub fn connect(addr: impl ToSocketAddrs) -> Result<RingStream> {
    let mut last_err = None;
    for addr in addr.to_socket_addrs().map_err(Error::IO)? {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            last_err = Some(Error::IO(io::Error::last_os_error()));
            continue;
        }
        let stream = unsafe { RingStream::from_raw_fd(fd) };
        match ops::connect(&stream, &addr) {
            Ok(()) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        Error::IO(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no addresses to connect to",
        ))
    }))
}
