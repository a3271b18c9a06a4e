//! Length-prefixed framing over pipes and socket pairs.
//!
//! Every frame is a 4-byte big-endian length followed by that many payload
//! bytes. A zero-length frame is the sentinel: "nothing more will be sent on
//! this channel".

use super::PipeFd;
use crate::error::Result;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::trace;

/// Largest payload accepted by `recv_bytes`.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// What a message-level read produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming<T> {
    Message(T),
    /// A zero-length frame.
    Sentinel,
    /// The peer closed the channel at a frame boundary.
    Closed,
}

/// A framed channel endpoint.
///
/// Either half may be absent: a one-way pipe yields a read-only and a
/// write-only endpoint, a socket pair yields two endpoints that do both.
#[derive(Debug, Default)]
pub struct Connection {
    reader: Option<PipeFd>,
    writer: Option<PipeFd>,
}

impl Connection {
    pub fn from_fds(reader: Option<OwnedFd>, writer: Option<OwnedFd>) -> Self {
        Self {
            reader: reader.map(PipeFd::new),
            writer: writer.map(PipeFd::new),
        }
    }

    /// One-way pipe: returns `(read end, write end)`.
    pub fn pipe() -> io::Result<(Connection, Connection)> {
        let (r, w) = nix::unistd::pipe().map_err(io::Error::from)?;
        Ok((
            Self::from_fds(Some(r), None),
            Self::from_fds(None, Some(w)),
        ))
    }

    /// A connected pair. Duplex pairs are Unix stream sockets; simplex pairs
    /// are a pipe, `(read end, write end)`.
    pub fn pair(duplex: bool) -> io::Result<(Connection, Connection)> {
        if !duplex {
            return Self::pipe();
        }
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(io::Error::from)?;
        let a2 = a.try_clone()?;
        let b2 = b.try_clone()?;
        Ok((
            Self::from_fds(Some(a), Some(a2)),
            Self::from_fds(Some(b), Some(b2)),
        ))
    }

    pub(crate) fn writer(&self) -> io::Result<&PipeFd> {
        self.writer
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "connection is read-only"))
    }

    pub(crate) fn reader(&self) -> io::Result<&PipeFd> {
        self.reader
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "connection is write-only"))
    }

    /// Write one frame. Header and payload go out in a single write call
    /// where the pipe allows it.
    pub fn send_bytes(&self, payload: &[u8]) -> io::Result<()> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|&n| n as usize <= MAX_FRAME_SIZE)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("frame of {} bytes exceeds limit", payload.len()),
                )
            })?;
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(payload);
        self.writer()?.write_all_bytes(&frame)?;
        trace!(bytes = payload.len(), "Sent frame");
        Ok(())
    }

    pub fn send_sentinel(&self) -> io::Result<()> {
        self.send_bytes(&[])
    }

    /// Read one frame; `None` means the peer closed the channel.
    pub fn recv_bytes(&self) -> io::Result<Option<Vec<u8>>> {
        let reader = self.reader()?;
        let mut header = [0u8; HEADER_LEN];
        if !reader.read_exact_or_eof(&mut header)? {
            return Ok(None);
        }
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {} exceeds limit", len),
            ));
        }
        let mut payload = vec![0u8; len];
        if len > 0 && !reader.read_exact_or_eof(&mut payload)? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pipe closed between frame header and payload",
            ));
        }
        trace!(bytes = len, "Received frame");
        Ok(Some(payload))
    }

    /// Serialize and send one message.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.send_bytes(&payload)?;
        Ok(())
    }

    /// Receive and decode one message.
    pub fn recv<T: DeserializeOwned>(&self) -> Result<Incoming<T>> {
        match self.recv_bytes()? {
            None => Ok(Incoming::Closed),
            Some(payload) if payload.is_empty() => Ok(Incoming::Sentinel),
            Some(payload) => Ok(Incoming::Message(serde_json::from_slice(&payload)?)),
        }
    }

    /// Wait up to `timeout` (forever on `None`) for data or hang-up.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let reader = self.reader()?;
        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(d) => {
                let ms = d.as_millis().min(i32::MAX as u128) as i32;
                PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
            }
        };
        loop {
            let mut fds = [PollFd::new(reader.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    return Ok(fds[0].revents().is_some_and(|r| !r.is_empty()));
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }

    pub fn reader_fd(&self) -> Option<RawFd> {
        self.reader.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn writer_fd(&self) -> Option<RawFd> {
        self.writer.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Close the read half, keeping the write half.
    pub fn close_reader(&mut self) {
        self.reader = None;
    }

    /// Close the write half, keeping the read half.
    pub fn close_writer(&mut self) {
        self.writer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::thread;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        body: String,
    }

    #[test]
    fn test_message_roundtrip_and_sentinel() {
        let (rx, tx) = Connection::pipe().unwrap();
        tx.send(&Ping {
            seq: 1,
            body: "one".into(),
        })
        .unwrap();
        tx.send_sentinel().unwrap();
        drop(tx);

        assert_eq!(
            rx.recv::<Ping>().unwrap(),
            Incoming::Message(Ping {
                seq: 1,
                body: "one".into()
            })
        );
        assert_eq!(rx.recv::<Ping>().unwrap(), Incoming::Sentinel);
        assert_eq!(rx.recv::<Ping>().unwrap(), Incoming::Closed);
    }

    #[test]
    fn test_frame_larger_than_pipe_buffer() {
        let (rx, tx) = Connection::pipe().unwrap();
        let payload = vec![0xabu8; 1024 * 1024];
        let expected = payload.clone();
        let writer = thread::spawn(move || tx.send_bytes(&payload).unwrap());

        let got = rx.recv_bytes().unwrap().unwrap();
        writer.join().unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_poll_reports_readiness() {
        let (rx, tx) = Connection::pipe().unwrap();
        assert!(!rx.poll(Some(Duration::from_millis(10))).unwrap());
        tx.send_bytes(b"x").unwrap();
        assert!(rx.poll(Some(Duration::from_millis(10))).unwrap());
        assert_eq!(rx.recv_bytes().unwrap().unwrap(), b"x");
    }

    #[test]
    fn test_oversized_header_is_invalid_data() {
        let (rx, tx) = Connection::pipe().unwrap();
        tx.writer()
            .unwrap()
            .write_all_bytes(&u32::MAX.to_be_bytes())
            .unwrap();
        let err = rx.recv_bytes().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_payload_is_unexpected_eof() {
        let (rx, tx) = Connection::pipe().unwrap();
        tx.writer()
            .unwrap()
            .write_all_bytes(&[0, 0, 0, 10, b'a', b'b'])
            .unwrap();
        drop(tx);
        let err = rx.recv_bytes().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_duplex_pair_both_directions() {
        let (a, b) = Connection::pair(true).unwrap();
        a.send_bytes(b"ping").unwrap();
        assert_eq!(b.recv_bytes().unwrap().unwrap(), b"ping");
        b.send_bytes(b"pong").unwrap();
        assert_eq!(a.recv_bytes().unwrap().unwrap(), b"pong");
    }

    #[test]
    fn test_read_only_end_rejects_send() {
        let (rx, _tx) = Connection::pipe().unwrap();
        let err = rx.send_bytes(b"nope").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
