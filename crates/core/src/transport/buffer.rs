use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::SocketAddr;

use bytes::{Buf, Bytes};
use socket2::{SockAddr, SockRef};

use super::handle::RawSocket;

/// Upper bound on slices handed to one vectored write (Linux `IOV_MAX` is 1024).
const MAX_IOV: usize = 64;

/// A batch of buffers bound for the same destination.
///
/// Stream sockets write the whole batch with vectored writes. Datagram
/// sockets send one datagram per buffer so message boundaries survive.
#[derive(Debug)]
pub struct BufferList {
    buffers: VecDeque<Bytes>,
    addr: Option<SocketAddr>,
    remain: usize,
}

impl BufferList {
    pub fn new(addr: Option<SocketAddr>) -> Self {
        Self {
            buffers: VecDeque::new(),
            addr,
            remain: 0,
        }
    }

    pub fn push(&mut self, buf: Bytes) {
        self.remain += buf.len();
        self.buffers.push_back(buf);
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Bytes not yet written.
    pub fn remain_size(&self) -> usize {
        self.remain
    }

    /// Buffers not yet fully written.
    pub fn count(&self) -> usize {
        self.buffers.len()
    }

    /// Write as much as the socket accepts without blocking, passing `flags`
    /// (`MSG_*`) to every send call.
    ///
    /// Returns the number of bytes written. `WouldBlock` is not an error: the
    /// unwritten tail stays in the list.
    pub fn send_to(&mut self, socket: &RawSocket, flags: i32) -> io::Result<usize> {
        match socket {
            RawSocket::Stream(_) => self.send_stream(socket.sock_ref(), flags),
            RawSocket::Datagram(_) => self.send_datagrams(socket.sock_ref(), flags),
            RawSocket::Listener(_) => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    fn send_stream(&mut self, sock: SockRef<'_>, flags: i32) -> io::Result<usize> {
        let mut written = 0;
        while !self.buffers.is_empty() {
            let res = {
                let slices: Vec<IoSlice<'_>> = self
                    .buffers
                    .iter()
                    .take(MAX_IOV)
                    .map(|b| IoSlice::new(b))
                    .collect();
                sock.send_vectored_with_flags(&slices, flags)
            };
            match res {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    written += n;
                    self.advance(n);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        Ok(written)
    }

    fn send_datagrams(&mut self, sock: SockRef<'_>, flags: i32) -> io::Result<usize> {
        let dest = self.addr.map(SockAddr::from);
        let mut written = 0;
        while let Some(front) = self.buffers.front() {
            let res = match &dest {
                Some(dest) => sock.send_to_with_flags(front, dest, flags),
                None => sock.send_with_flags(front, flags),
            };
            match res {
                Ok(n) => {
                    written += n;
                    self.remain -= front.len();
                    self.buffers.pop_front();
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        Ok(written)
    }

    fn advance(&mut self, mut n: usize) {
        self.remain -= n;
        while n > 0 {
            let Some(front) = self.buffers.front_mut() else {
                return;
            };
            if n < front.len() {
                front.advance(n);
                return;
            }
            n -= front.len();
            self.buffers.pop_front();
        }
    }
}
