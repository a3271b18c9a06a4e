//! Inter-process channels.
//!
//! - [`PipeFd`]: an owned descriptor with EINTR-safe reads and writes.
//! - [`Connection`]: length-prefixed frames over a pipe or socket pair.
//! - [`ChunkWriter`]/[`ChunkReader`]: frames split into pipe-atomic chunks,
//!   for a pipe with many writing processes.
//! - [`Queue`]: a `Connection` plus a feeder thread, so producers never block
//!   on the transport.

mod chunked;
mod connection;
mod pipe;
mod queue;

pub use chunked::{ChunkReader, ChunkWriter, MAX_CHUNK_BODY, PIPE_ATOMIC};
pub use connection::{Connection, Incoming, MAX_FRAME_SIZE};
pub use pipe::PipeFd;
pub use queue::Queue;
