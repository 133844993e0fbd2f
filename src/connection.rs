//! Broker-side view of one TCP connection
//!
//! Sockets stay in blocking mode with short read/write timeouts so that one
//! slow peer can stall the reactor for a bounded time only. Readiness is
//! detected by the reactor through the raw descriptor.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::SockRef;

use crate::error::MessageError;
use crate::message::{self, Record};

/// A connected peer
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    /// Human-readable label for logs
    description: String,
}

impl Connection {
    /// Wrap an accepted or connected stream, switching it to blocking mode
    pub fn new(stream: TcpStream, timeout: Duration) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let conn = Connection {
            stream,
            peer,
            description: peer.to_string(),
        };
        conn.set_timeout(timeout)?;
        Ok(conn)
    }

    /// Open a connection to `addr`
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Self::new(stream, timeout)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Peer IP without port, as recorded in the reconnect log
    pub fn peer_ip(&self) -> String {
        self.peer.ip().to_string()
    }

    pub fn peer_description(&self) -> &str {
        &self.description
    }

    /// Label the connection with a peer-supplied name
    pub fn set_peer_name(&mut self, name: &str) {
        self.description = format!("{} on {}", name, self.peer);
    }

    pub fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.set_write_timeout(Some(timeout))
    }

    /// Shrink kernel buffers; brokered connections only carry small records
    pub fn set_os_buffers(&self, read: usize, write: usize) -> io::Result<()> {
        let sock = SockRef::from(&self.stream);
        if read > 0 {
            sock.set_recv_buffer_size(read)?;
        }
        if write > 0 {
            sock.set_send_buffer_size(write)?;
        }
        Ok(())
    }

    pub fn read_record(&mut self) -> Result<Record, MessageError> {
        message::read_record(&mut self.stream)
    }

    pub fn send_record(&mut self, record: &Record) -> Result<(), MessageError> {
        message::write_record(&mut self.stream, record)
    }

    /// True if a read would not block: data is waiting, the peer closed,
    /// or the socket is in error.
    pub fn read_ready(&self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return true;
        }
        let mut byte = [0u8; 1];
        let ready = match self.stream.peek(&mut byte) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        };
        if self.stream.set_nonblocking(false).is_err() {
            return true;
        }
        ready
    }

    /// Close one or both directions without dropping the connection
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.stream.shutdown(how)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
