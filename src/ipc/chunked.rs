//! Frames carried as pipe-atomic chunks tagged with the writer's pid.
//!
//! A pipe write of at most `PIPE_BUF` bytes lands in one piece: it is never
//! interleaved with another writer's bytes and never torn by the writer's
//! death. Every chunk here fits that limit, so the stream stays aligned on
//! chunk boundaries even when a writer is killed half way through a frame.
//! The reader assembles frames per writer and drops a dead writer's partial
//! frame when it sees a discard marker for that pid.
//!
//! Chunk layout: `pid: i32 BE | flags: u8 | len: u16 BE | len bytes`.

use super::{Connection, Incoming, MAX_FRAME_SIZE};
use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tracing::{debug, trace};

/// Largest write the kernel keeps atomic on a pipe.
pub const PIPE_ATOMIC: usize = libc::PIPE_BUF;

const CHUNK_HEADER_LEN: usize = 7;

/// Largest payload slice carried by one chunk.
pub const MAX_CHUNK_BODY: usize = PIPE_ATOMIC - CHUNK_HEADER_LEN;

const FIRST: u8 = 0b001;
const LAST: u8 = 0b010;
const DISCARD: u8 = 0b100;

fn encode_chunk(writer: i32, flags: u8, body: &[u8]) -> Vec<u8> {
    let mut chunk = Vec::with_capacity(CHUNK_HEADER_LEN + body.len());
    chunk.extend_from_slice(&writer.to_be_bytes());
    chunk.push(flags);
    chunk.extend_from_slice(&(body.len() as u16).to_be_bytes());
    chunk.extend_from_slice(body);
    chunk
}

/// Write half of a chunked channel. Many processes may share one.
#[derive(Debug)]
pub struct ChunkWriter {
    conn: Connection,
}

impl ChunkWriter {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Write `payload` as one frame from `writer`.
    ///
    /// Callers that want frames kept contiguous on the wire serialize their
    /// calls; the reader copes either way.
    pub fn send_bytes(&self, writer: i32, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds limit", payload.len()),
            ));
        }
        let fd = self.conn.writer()?;
        if payload.is_empty() {
            return fd.write_all_bytes(&encode_chunk(writer, FIRST | LAST, &[]));
        }
        let count = payload.len().div_ceil(MAX_CHUNK_BODY);
        for (i, body) in payload.chunks(MAX_CHUNK_BODY).enumerate() {
            let mut flags = 0;
            if i == 0 {
                flags |= FIRST;
            }
            if i + 1 == count {
                flags |= LAST;
            }
            fd.write_all_bytes(&encode_chunk(writer, flags, body))?;
        }
        trace!(writer, bytes = payload.len(), chunks = count, "Sent chunked frame");
        Ok(())
    }

    pub fn send<T: Serialize>(&self, writer: i32, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.send_bytes(writer, &payload)?;
        Ok(())
    }

    pub fn send_sentinel(&self, writer: i32) -> io::Result<()> {
        self.send_bytes(writer, &[])
    }

    /// Tell the reader that `writer` is gone and its partial frame, if any,
    /// will never be finished.
    pub fn send_discard(&self, writer: i32) -> io::Result<()> {
        self.conn
            .writer()?
            .write_all_bytes(&encode_chunk(writer, DISCARD, &[]))
    }
}

/// Read half of a chunked channel.
#[derive(Debug)]
pub struct ChunkReader {
    conn: Connection,
    partial: HashMap<i32, Vec<u8>>,
}

impl ChunkReader {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            partial: HashMap::new(),
        }
    }

    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<bool> {
        self.conn.poll(timeout)
    }

    /// Writers with a frame still being assembled.
    pub fn pending_writers(&self) -> usize {
        self.partial.len()
    }

    /// Read exactly one chunk.
    ///
    /// Returns `Ok(Some(None))` when the chunk did not complete a frame,
    /// `Ok(None)` when every writer has closed the channel.
    pub fn recv_bytes(&mut self) -> io::Result<Option<Option<Vec<u8>>>> {
        let reader = self.conn.reader()?;
        let mut header = [0u8; CHUNK_HEADER_LEN];
        if !reader.read_exact_or_eof(&mut header)? {
            return Ok(None);
        }
        let writer = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let flags = header[4];
        let len = u16::from_be_bytes([header[5], header[6]]) as usize;
        if len > MAX_CHUNK_BODY {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("chunk length {} exceeds limit", len),
            ));
        }
        let mut body = vec![0u8; len];
        if len > 0 && !reader.read_exact_or_eof(&mut body)? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pipe closed between chunk header and body",
            ));
        }

        if flags & DISCARD != 0 {
            if let Some(dropped) = self.partial.remove(&writer) {
                debug!(writer, bytes = dropped.len(), "Discarded partial frame from dead writer");
            }
            return Ok(Some(None));
        }

        let frame = if flags & FIRST != 0 {
            if let Some(stale) = self.partial.insert(writer, body) {
                debug!(writer, bytes = stale.len(), "Replaced unfinished frame");
            }
            self.partial.get_mut(&writer)
        } else {
            match self.partial.get_mut(&writer) {
                Some(frame) => {
                    frame.extend_from_slice(&body);
                    Some(frame)
                }
                None => {
                    trace!(writer, bytes = len, "Dropping orphaned chunk");
                    return Ok(Some(None));
                }
            }
        };
        if frame.is_some_and(|f| f.len() > MAX_FRAME_SIZE) {
            self.partial.remove(&writer);
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame from writer {} exceeds limit", writer),
            ));
        }

        if flags & LAST != 0 {
            return Ok(Some(self.partial.remove(&writer)));
        }
        Ok(Some(None))
    }

    /// Read one chunk and decode the frame it completes, if any.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<Incoming<T>>> {
        match self.recv_bytes()? {
            None => Ok(Some(Incoming::Closed)),
            Some(None) => Ok(None),
            Some(Some(payload)) if payload.is_empty() => Ok(Some(Incoming::Sentinel)),
            Some(Some(payload)) => Ok(Some(Incoming::Message(serde_json::from_slice(&payload)?))),
        }
    }
}
