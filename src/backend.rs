//! Backend connection collaborator
//!
//! `read` returning `Ok(0)` is a clean end of the body; an error is a
//! connection failure. Both are handed to the caller untouched.

use std::collections::VecDeque;
use std::io::{self, Read};

pub trait BackendConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Any `std::io::Read` as a backend
#[derive(Debug)]
pub struct ReadBackend<R> {
    inner: R,
}

impl<R: Read> ReadBackend<R> {
    pub fn new(inner: R) -> Self {
        ReadBackend { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> BackendConnection for ReadBackend<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

/// Backend replaying a scripted sequence of reads
///
/// Each entry is returned by exactly one `read` call (truncated to the
/// caller's buffer, the rest kept for the next call). Once the script is
/// empty every read reports end of data.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    reads: VecDeque<io::Result<Vec<u8>>>,
}

impl ScriptedBackend {
    /// Serve `data` in reads of at most `read_size` bytes
    pub fn chunked(data: &[u8], read_size: usize) -> Self {
        debug_assert!(read_size > 0, "Precondition: read size must be positive");
        ScriptedBackend {
            reads: data.chunks(read_size).map(|c| Ok(c.to_vec())).collect(),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.reads.push_back(Ok(data.to_vec()));
    }

    pub fn push_error(&mut self, kind: io::ErrorKind, msg: &str) {
        self.reads.push_back(Err(io::Error::new(kind, msg.to_string())));
    }

    pub fn is_drained(&self) -> bool {
        self.reads.is_empty()
    }
}

impl BackendConnection for ScriptedBackend {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.reads.pop_front() {
            None => Ok(0),
            Some(Err(e)) => Err(e),
            Some(Ok(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    data.drain(..n);
                    self.reads.push_front(Ok(data));
                }
                Ok(n)
            }
        }
    }
}
