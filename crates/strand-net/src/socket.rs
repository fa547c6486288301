use std::{
    io::{self, Write},
    net::{Shutdown, SocketAddr},
    os::fd::{AsRawFd, RawFd},
};

use tracing::error;

/// Typed view of one connected TCP socket.
///
/// The fd stays owned by the wrapped stream; channels borrow it by
/// number only.
pub struct Socket {
    stream: mio::net::TcpStream,
}

impl Socket {
    pub fn from_stream(stream: mio::net::TcpStream) -> Self {
        Self { stream }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        (&self.stream).write(data)
    }

    /// Half-close: no more writes from this side, reads keep working.
    pub fn shutdown_write(&self) {
        if let Err(err) = self.stream.shutdown(Shutdown::Write) {
            error!(?err, "shutdown write failed");
        }
    }

    pub fn set_nodelay(&self, on: bool) {
        if let Err(err) = self.stream.set_nodelay(on) {
            error!(?err, "set_nodelay failed");
        }
    }

    pub fn set_keep_alive(&self, on: bool) {
        set_bool_option(self.fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on);
    }

    /// Kernel SO_SNDBUF and SO_RCVBUF.
    pub fn set_buffer_sizes(&self, size: usize) {
        let size = size as libc::c_int;
        set_int_option(self.fd(), libc::SOL_SOCKET, libc::SO_SNDBUF, size);
        set_int_option(self.fd(), libc::SOL_SOCKET, libc::SO_RCVBUF, size);
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.stream.take_error()
    }
}

fn set_bool_option(fd: RawFd, level: libc::c_int, option: libc::c_int, on: bool) {
    set_int_option(fd, level, option, libc::c_int::from(on));
}

fn set_int_option(fd: RawFd, level: libc::c_int, option: libc::c_int, value: libc::c_int) {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            (&raw const value).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        error!(fd, option, err = %io::Error::last_os_error(), "setsockopt failed");
    }
}
