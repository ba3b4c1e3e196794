//! Delivery Filter
//!
//! Transforms stored object bytes on their way to a client. Output always
//! goes through the context's scratch buffer:
//!
//! ```text
//! chunk ──► attach_input ──► step(Normal) ──► scratch ──(full/Blocked)──► sink
//!   ▲                                                                   │
//!   └───────────────────────── input exhausted ◄────────────────────────┘
//! ```
//!
//! The delivery transfer decides when the object ends and calls `end`.

use crate::codec::{CodecEngine, CodecStatus, Direction, FlushMode, GzipEngine};
use crate::config::{GzipConfig, TrailingGarbage};
use crate::context::{StreamContext, Teardown};
use crate::error::FilterError;
use crate::stats;
use bytes::Bytes;
use std::io::{self, Write};
use tracing::{debug, warn};

/// Kind of push handed to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkAction {
    /// More data follows
    Flush,
    /// Last push of the object
    End,
}

/// Downstream consumer of delivered bytes
pub trait ByteSink {
    fn push(&mut self, action: SinkAction, data: &[u8]) -> io::Result<()>;
}

impl ByteSink for Vec<u8> {
    fn push(&mut self, _action: SinkAction, data: &[u8]) -> io::Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

/// Sink writing into any `std::io::Write`, flushing it on `End`
#[derive(Debug)]
pub struct WriteSink<W> {
    inner: W,
}

impl<W: Write> WriteSink<W> {
    pub fn new(inner: W) -> Self {
        WriteSink { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> ByteSink for WriteSink<W> {
    fn push(&mut self, action: SinkAction, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)?;
        if action == SinkAction::End {
            self.inner.flush()?;
        }
        Ok(())
    }
}

pub struct DeliveryFilter<E: CodecEngine = GzipEngine> {
    ctx: StreamContext<E>,
    trailing_garbage: TrailingGarbage,
    /// Logical end seen on the decompress side
    finished: bool,
    discarded: u64,
}

impl<E: CodecEngine> std::fmt::Debug for DeliveryFilter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryFilter")
            .field("ctx", &self.ctx)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<E: CodecEngine> DeliveryFilter<E> {
    /// Decompress stored gzip bytes for a client without gzip support
    pub fn gunzip(config: &GzipConfig) -> Result<Self, FilterError> {
        Self::new(Direction::Decompress, "U D -", config)
    }

    /// Compress stored identity bytes for a gzip-capable client
    pub fn gzip(config: &GzipConfig) -> Result<Self, FilterError> {
        Self::new(Direction::Compress, "G D -", config)
    }

    fn new(direction: Direction, tag: &str, config: &GzipConfig) -> Result<Self, FilterError> {
        let ctx = StreamContext::create(direction, tag, &config.quality(), config.buffer_size)?;
        Ok(DeliveryFilter {
            ctx,
            trailing_garbage: config.trailing_garbage,
            finished: false,
            discarded: 0,
        })
    }

    pub fn tag(&self) -> &str {
        self.ctx.tag()
    }

    /// Unflushed bytes held in the scratch buffer
    pub fn buffered(&self) -> usize {
        self.ctx.scratch_fill()
    }

    /// Push one stored chunk through the transform
    ///
    /// An empty chunk flushes buffered output without ending the stream.
    pub fn bytes<S: ByteSink + ?Sized>(&mut self, chunk: Bytes, sink: &mut S) -> Result<(), FilterError> {
        let result = self.bytes_inner(chunk, sink);
        if let Err(e) = &result {
            stats::record_failure(e);
            warn!(tag = %self.ctx.tag(), error = %e, "delivery failed");
        }
        result
    }

    fn bytes_inner<S: ByteSink + ?Sized>(&mut self, chunk: Bytes, sink: &mut S) -> Result<(), FilterError> {
        if chunk.is_empty() {
            // Compressed output still held by the engine is part of the flush
            if self.ctx.direction() == Direction::Compress {
                self.pump(FlushMode::Align, sink)?;
            }
            return self.ctx.flush_scratch(sink, SinkAction::Flush);
        }
        if self.finished {
            return self.trailing(chunk.len());
        }
        self.ctx.attach_input(chunk);
        self.pump(FlushMode::Normal, sink)
    }

    /// Run steps until the input is consumed (or the stream ended)
    fn pump<S: ByteSink + ?Sized>(&mut self, flush: FlushMode, sink: &mut S) -> Result<(), FilterError> {
        loop {
            if self.ctx.output_full() {
                self.ctx.flush_scratch(sink, SinkAction::Flush)?;
            }
            self.ctx.attach_scratch()?;

            let status = self.ctx.step(flush).status;
            let full = self.ctx.output_full();
            if full || status == CodecStatus::Blocked {
                self.ctx.flush_scratch(sink, SinkAction::Flush)?;
            }

            match status {
                CodecStatus::Error(msg) => return Err(FilterError::codec(self.ctx.tag(), msg)),
                CodecStatus::End => {
                    self.finished = true;
                    let unconsumed = self.ctx.input_remaining();
                    if unconsumed > 0 {
                        return self.trailing(unconsumed);
                    }
                    return Ok(());
                }
                CodecStatus::Blocked if !full => {
                    if flush == FlushMode::Finish || !self.ctx.input_exhausted() {
                        return Err(FilterError::codec(self.ctx.tag(), "no progress"));
                    }
                    return Ok(());
                }
                CodecStatus::Blocked | CodecStatus::Progress => {
                    if flush != FlushMode::Finish && self.ctx.input_exhausted() && !full {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Bytes past the end of the gzip member
    fn trailing(&mut self, unconsumed: usize) -> Result<(), FilterError> {
        match self.trailing_garbage {
            TrailingGarbage::Reject => Err(FilterError::TrailingGarbage {
                tag: self.ctx.tag().to_string(),
                unconsumed,
            }),
            TrailingGarbage::Ignore => {
                if !self.ctx.input_exhausted() {
                    self.ctx.discard_input();
                }
                if self.discarded == 0 {
                    warn!(tag = %self.ctx.tag(), unconsumed, "ignoring junk after gzip data");
                }
                self.discarded += unconsumed as u64;
                Ok(())
            }
        }
    }

    /// Finish the object and tear the context down
    ///
    /// With `failed` set the context is released without requiring a
    /// complete stream. Otherwise everything buffered is pushed with
    /// `SinkAction::End` and the stream must have reached its end.
    pub fn end<S: ByteSink + ?Sized>(mut self, sink: &mut S, failed: bool) -> Result<Teardown, FilterError> {
        if failed {
            let teardown = self.ctx.destroy();
            debug!(tag = %teardown.summary.tag, status = ?teardown.status, "delivery abandoned");
            return Ok(teardown);
        }

        if self.ctx.direction() == Direction::Compress {
            if let Err(e) = self.pump(FlushMode::Finish, sink) {
                stats::record_failure(&e);
                return Err(e);
            }
        }
        if let Err(e) = self.ctx.flush_scratch(sink, SinkAction::End) {
            stats::record_failure(&e);
            return Err(e);
        }

        let teardown = self.ctx.destroy();
        let error = match &teardown.status {
            CodecStatus::End => None,
            CodecStatus::Error(msg) => Some(FilterError::codec(&teardown.summary.tag, msg.clone())),
            CodecStatus::Progress | CodecStatus::Blocked => Some(FilterError::PrematureEnd {
                tag: teardown.summary.tag.clone(),
            }),
        };
        let Some(error) = error else {
            return Ok(teardown);
        };
        stats::record_failure(&error);
        warn!(tag = %teardown.summary.tag, error = %error, "delivery incomplete");
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink recording every push
    #[derive(Default)]
    struct Recorder {
        pushes: Vec<(SinkAction, Vec<u8>)>,
    }

    impl Recorder {
        fn body(&self) -> Vec<u8> {
            self.pushes.iter().flat_map(|(_, d)| d.clone()).collect()
        }
    }

    impl ByteSink for Recorder {
        fn push(&mut self, action: SinkAction, data: &[u8]) -> io::Result<()> {
            self.pushes.push((action, data.to_vec()));
            Ok(())
        }
    }

    fn config() -> GzipConfig {
        GzipConfig::test()
    }

    fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut filter: DeliveryFilter = DeliveryFilter::gzip(&config()).unwrap();
        let mut out = Vec::new();
        filter.bytes(Bytes::copy_from_slice(data), &mut out).unwrap();
        filter.end(&mut out, false).unwrap();
        out
    }

    #[test]
    fn test_gzip_then_gunzip() {
        let plain = b"delivered through two filters ".repeat(40);
        let compressed = gzip_bytes(&plain);

        let mut filter: DeliveryFilter = DeliveryFilter::gunzip(&config()).unwrap();
        let mut sink = Recorder::default();
        for chunk in compressed.chunks(5) {
            filter.bytes(Bytes::copy_from_slice(chunk), &mut sink).unwrap();
        }
        let teardown = filter.end(&mut sink, false).unwrap();
        assert_eq!(teardown.status, CodecStatus::End);
        assert_eq!(sink.body(), plain);
        assert_eq!(sink.pushes.last().map(|(a, _)| *a), Some(SinkAction::End));
        // Scratch discipline: no push larger than the buffer
        assert!(sink.pushes.iter().all(|(_, d)| d.len() <= config().buffer_size));
    }

    #[test]
    fn test_empty_chunk_flushes() {
        let compressed = gzip_bytes(b"flush me");
        let mut filter: DeliveryFilter = DeliveryFilter::gunzip(&config()).unwrap();
        let mut sink = Recorder::default();
        filter
            .bytes(Bytes::copy_from_slice(&compressed[..compressed.len() - 8]), &mut sink)
            .unwrap();
        assert!(filter.buffered() > 0);
        filter.bytes(Bytes::new(), &mut sink).unwrap();
        assert_eq!(filter.buffered(), 0);
        assert_eq!(sink.body(), b"flush me");
        assert_eq!(sink.pushes.last().map(|(a, _)| *a), Some(SinkAction::Flush));
    }

    #[test]
    fn test_empty_chunk_flushes_compressed_output() {
        use flate2::{Decompress, FlushDecompress};
        let mut filter: DeliveryFilter = DeliveryFilter::gzip(&config()).unwrap();
        let mut sink = Recorder::default();
        filter.bytes(Bytes::from_static(b"abcdefgh"), &mut sink).unwrap();
        filter.bytes(Bytes::new(), &mut sink).unwrap();
        assert_eq!(filter.buffered(), 0);

        // The client can decode everything sent so far
        let delivered = sink.body();
        assert!(delivered.len() > 10, "more than the member header");
        let mut inflater = Decompress::new(false);
        let mut prefix = Vec::with_capacity(64);
        inflater
            .decompress_vec(&delivered[10..], &mut prefix, FlushDecompress::Sync)
            .unwrap();
        assert_eq!(prefix, b"abcdefgh");

        // A second flush with nothing new adds nothing
        filter.bytes(Bytes::new(), &mut sink).unwrap();
        assert_eq!(sink.body(), delivered);

        filter.bytes(Bytes::from_static(b"ijkl"), &mut sink).unwrap();
        filter.end(&mut sink, false).unwrap();
        let mut decoded = Vec::new();
        std::io::Read::read_to_end(&mut flate2::read::GzDecoder::new(&sink.body()[..]), &mut decoded).unwrap();
        assert_eq!(decoded, b"abcdefghijkl");
    }

    #[test]
    fn test_truncated_object_is_premature_end() {
        let compressed = gzip_bytes(b"cut short");
        let mut filter: DeliveryFilter = DeliveryFilter::gunzip(&config()).unwrap();
        let mut sink = Vec::new();
        filter
            .bytes(Bytes::copy_from_slice(&compressed[..compressed.len() - 3]), &mut sink)
            .unwrap();
        let err = filter.end(&mut sink, false).unwrap_err();
        assert!(matches!(err, FilterError::PrematureEnd { .. }));
    }

    #[test]
    fn test_corrupt_object_is_codec_error() {
        let mut filter: DeliveryFilter = DeliveryFilter::gunzip(&config()).unwrap();
        let mut sink = Vec::new();
        let err = filter
            .bytes(Bytes::from_static(b"not gzip at all"), &mut sink)
            .unwrap_err();
        assert_eq!(err.to_string(), "U D -: codec error: incorrect header check");
        // The transfer failed: teardown must not demand a complete stream
        assert!(filter.end(&mut sink, true).is_ok());
    }

    #[test]
    fn test_trailing_garbage_policy() {
        let mut compressed = gzip_bytes(b"payload");
        compressed.extend_from_slice(b"garbage");

        let mut ignore: DeliveryFilter = DeliveryFilter::gunzip(&config()).unwrap();
        let mut sink = Vec::new();
        ignore.bytes(Bytes::from(compressed.clone()), &mut sink).unwrap();
        ignore.bytes(Bytes::from_static(b"more"), &mut sink).unwrap();
        ignore.end(&mut sink, false).unwrap();
        assert_eq!(sink, b"payload");

        let strict = GzipConfig {
            trailing_garbage: TrailingGarbage::Reject,
            ..config()
        };
        let mut reject: DeliveryFilter = DeliveryFilter::gunzip(&strict).unwrap();
        let err = reject.bytes(Bytes::from(compressed), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, FilterError::TrailingGarbage { unconsumed: 7, .. }));
    }

    #[test]
    fn test_gzip_output_readable_by_flate2() {
        use std::io::Read;
        let plain = b"0123456789".repeat(100);
        let compressed = gzip_bytes(&plain);
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&compressed[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, plain);
    }
}
