//! Receive-buffer control for the streams a [`Connection`](crate::connection::Connection) can wrap.
//!
//! Sizing is advisory: the kernel may round or cap the requested value (Linux
//! doubles it to account for bookkeeping overhead). Transports that have no
//! kernel socket behind them keep the default no-op implementation.

use std::io;

use tokio::io::DuplexStream;
use tokio::net::TcpStream;

pub trait SocketOptions {
    /// Requests a receive buffer of `size` bytes from the OS.
    fn set_recv_buffer_size(&self, _size: usize) -> io::Result<()> {
        Ok(())
    }

    /// Effective receive buffer size, if the transport has one.
    fn recv_buffer_size(&self) -> io::Result<Option<usize>> {
        Ok(None)
    }
}

#[cfg(unix)]
impl SocketOptions for TcpStream {
    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        use std::os::fd::AsRawFd;

        let value = libc::c_int::try_from(size).unwrap_or(libc::c_int::MAX);
        let rc = unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };

        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    fn recv_buffer_size(&self) -> io::Result<Option<usize>> {
        use std::os::fd::AsRawFd;

        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &mut value as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };

        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Some(value.max(0) as usize))
    }
}

// No fine-grained buffer control outside unix; keep the no-op defaults.
#[cfg(not(unix))]
impl SocketOptions for TcpStream {}

impl SocketOptions for DuplexStream {}
