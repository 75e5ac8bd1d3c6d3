use std::io::{ErrorKind, Read};

use arq_lab_abstract::ArqError;
use bytes::Bytes;

/// One packet's worth of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub payload: Bytes,
    pub eof: bool,
}

/// Cuts a byte source into fixed-size chunks. The first chunk shorter than
/// `chunk_size` (possibly empty) is the EOF chunk; nothing is produced after it.
pub struct Segmenter<R> {
    source: R,
    chunk_size: usize,
    finished: bool,
    consumed: u64,
}

impl<R: Read> Segmenter<R> {
    pub fn new(source: R, chunk_size: usize) -> Self {
        Self {
            source,
            chunk_size,
            finished: false,
            consumed: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes read from the source so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, ArqError> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.source.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ArqError::Source(e)),
            }
        }
        buf.truncate(filled);

        let eof = filled < self.chunk_size;
        self.finished = eof;
        self.consumed += filled as u64;
        tracing::trace!(len = filled, eof, "segmented chunk");

        Ok(Some(Chunk {
            payload: Bytes::from(buf),
            eof,
        }))
    }
}
