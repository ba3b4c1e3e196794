//! Fetch Filters
//!
//! Pull bytes from a backend, transform them, and land the result in object
//! storage. One driver serves all three modes:
//!
//! | Mode         | Tag     | Engine     | Stored bytes        | Output goes to  |
//! |--------------|---------|------------|---------------------|-----------------|
//! | `Gunzip`     | `U F -` | decompress | plaintext           | storage         |
//! | `Gzip`       | `G F -` | compress   | gzip member         | storage         |
//! | `TestGunzip` | `u F -` | decompress | backend bytes as-is | scratch (dropped) |
//!
//! ```text
//! begin(mode) ──► bytes(budget)* ──► [align()/reset()]* ──► end()
//!                     │
//!                     ├── Ok(Pull::Budget)  budget consumed, call again
//!                     ├── Ok(Pull::Eof)     backend body complete
//!                     └── Err(..)           transfer failed (Backend: caller decides)
//! ```
//!
//! On a successful `end` the bit-offset markers are recorded on the object.

use crate::backend::BackendConnection;
use crate::codec::{BitMarkers, CodecEngine, CodecStatus, Direction, FlushMode, GzipEngine};
use crate::config::{GzipConfig, TrailingGarbage};
use crate::context::StreamContext;
use crate::error::FilterError;
use crate::stats;
use crate::storage::{ObjectMetadata, ObjectStorage};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Fetch filter variant, fixed at `begin`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Decompress on fetch
    Gunzip,
    /// Compress on fetch
    Gzip,
    /// Store as-is, decompress only to validate
    TestGunzip,
}

impl FetchMode {
    pub fn tag(&self) -> &'static str {
        match self {
            FetchMode::Gunzip => "U F -",
            FetchMode::Gzip => "G F -",
            FetchMode::TestGunzip => "u F -",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            FetchMode::Gzip => Direction::Compress,
            FetchMode::Gunzip | FetchMode::TestGunzip => Direction::Decompress,
        }
    }
}

/// Outcome of one `bytes` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// Budget fully consumed; the backend may have more
    Budget,
    /// Backend reported a clean end of data
    Eof,
}

// ============================================================================
// Owning transfer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Running,
    Failed,
}

/// The fetch transfer owning the object being filled
#[derive(Debug)]
pub struct Fetch<O> {
    object: O,
    state: FetchState,
    failure: Option<String>,
}

impl<O: ObjectStorage + ObjectMetadata> Fetch<O> {
    pub fn new(object: O) -> Self {
        Fetch {
            object,
            state: FetchState::Running,
            failure: None,
        }
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    pub fn is_failed(&self) -> bool {
        self.state == FetchState::Failed
    }

    /// First failure recorded on this transfer
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Mark the transfer failed; only the first failure is kept and counted
    ///
    /// Returns `false` if the transfer had already failed.
    pub fn fail(&mut self, err: &FilterError) -> bool {
        if self.state == FetchState::Failed {
            debug!(error = %err, "fetch already failed");
            return false;
        }
        stats::record_failure(err);
        warn!(kind = err.kind(), error = %err, "fetch failed");
        self.state = FetchState::Failed;
        self.failure = Some(err.to_string());
        true
    }

    pub fn object(&self) -> &O {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut O {
        &mut self.object
    }

    pub fn into_object(self) -> O {
        self.object
    }
}

// ============================================================================
// Filter driver
// ============================================================================

pub struct FetchFilter<E: CodecEngine = GzipEngine> {
    mode: FetchMode,
    ctx: StreamContext<E>,
    read_buf: BytesMut,
    chunk_size: usize,
    trailing_garbage: TrailingGarbage,
    /// Engine reported logical end
    finished: bool,
    discarded: u64,
}

impl<E: CodecEngine> std::fmt::Debug for FetchFilter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchFilter")
            .field("mode", &self.mode)
            .field("ctx", &self.ctx)
            .field("finished", &self.finished)
            .field("discarded", &self.discarded)
            .finish()
    }
}

impl<E: CodecEngine> FetchFilter<E> {
    /// Set up the context and buffers for `mode`
    pub fn begin(mode: FetchMode, config: &GzipConfig) -> Result<Self, FilterError> {
        if config.chunk_size == 0 {
            return Err(FilterError::AllocationFailure {
                what: "read buffer",
                size: 0,
            });
        }
        let ctx = StreamContext::create(
            mode.direction(),
            mode.tag(),
            &config.quality(),
            config.buffer_size,
        )?;
        // The validate path reads straight into storage segments
        let read_buf = match mode {
            FetchMode::TestGunzip => BytesMut::new(),
            FetchMode::Gunzip | FetchMode::Gzip => BytesMut::with_capacity(config.chunk_size),
        };
        let trailing_garbage = match mode {
            FetchMode::TestGunzip => TrailingGarbage::Reject,
            FetchMode::Gunzip | FetchMode::Gzip => config.trailing_garbage,
        };
        debug!(tag = mode.tag(), chunk_size = config.chunk_size, "fetch filter begin");

        Ok(FetchFilter {
            mode,
            ctx,
            read_buf,
            chunk_size: config.chunk_size,
            trailing_garbage,
            finished: false,
            discarded: 0,
        })
    }

    pub fn mode(&self) -> FetchMode {
        self.mode
    }

    /// Current markers of the underlying stream
    pub fn markers(&self) -> BitMarkers {
        self.ctx.markers()
    }

    /// Bytes dropped after the end of the gzip member
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Pull up to `budget` backend bytes through the filter
    pub fn bytes<O, B>(
        &mut self,
        fetch: &mut Fetch<O>,
        backend: &mut B,
        budget: usize,
    ) -> Result<Pull, FilterError>
    where
        O: ObjectStorage + ObjectMetadata,
        B: BackendConnection + ?Sized,
    {
        debug_assert!(!fetch.is_failed(), "Precondition: fetch already failed");

        let result = match self.mode {
            FetchMode::TestGunzip => self.pull_validate(&mut fetch.object, backend, budget),
            FetchMode::Gunzip | FetchMode::Gzip => {
                self.pull_transform(&mut fetch.object, backend, budget)
            }
        };
        match &result {
            // The owning transfer decides what a broken backend means
            Err(e @ FilterError::Backend(_)) => {
                debug!(tag = self.mode.tag(), error = %e, "backend read failed");
            }
            Err(e) => {
                fetch.fail(e);
            }
            Ok(_) => {}
        }
        result
    }

    fn pull_transform<O, B>(
        &mut self,
        object: &mut O,
        backend: &mut B,
        budget: usize,
    ) -> Result<Pull, FilterError>
    where
        O: ObjectStorage,
        B: BackendConnection + ?Sized,
    {
        let mut left = budget;
        while left > 0 {
            let want = left.min(self.chunk_size);
            // Reclaims the previous chunk's space once the context released it
            self.read_buf.clear();
            self.read_buf.resize(want, 0);
            let n = backend.read(&mut self.read_buf[..want]).map_err(FilterError::Backend)?;
            if n == 0 {
                return Ok(Pull::Eof);
            }
            left -= n;
            self.read_buf.truncate(n);
            let chunk = self.read_buf.split().freeze();

            if self.finished {
                self.trailing(n)?;
                continue;
            }
            self.ctx.attach_input(chunk);
            self.pump_storage(object, FlushMode::Normal)?;
        }
        Ok(Pull::Budget)
    }

    fn pull_validate<O, B>(
        &mut self,
        object: &mut O,
        backend: &mut B,
        budget: usize,
    ) -> Result<Pull, FilterError>
    where
        O: ObjectStorage,
        B: BackendConnection + ?Sized,
    {
        let mut left = budget;
        while left > 0 {
            let mut segment = object.acquire_segment(1)?;
            let want = left.min(self.chunk_size).min(segment.remaining());
            let n = match backend.read(&mut segment.spare_mut()[..want]) {
                Ok(n) => n,
                Err(e) => {
                    object.commit(segment);
                    return Err(FilterError::Backend(e));
                }
            };
            segment.extend(n);
            let stored = object.commit(segment);
            if n == 0 {
                return Ok(Pull::Eof);
            }
            left -= n;

            if self.finished {
                self.trailing(n)?;
                continue;
            }
            self.ctx.attach_input(stored);
            self.pump_scratch()?;
        }
        Ok(Pull::Budget)
    }

    /// Step until the input is consumed, spilling output into storage
    fn pump_storage<O: ObjectStorage>(
        &mut self,
        object: &mut O,
        flush: FlushMode,
    ) -> Result<(), FilterError> {
        let result = self.pump_storage_inner(object, flush);
        if let Some(segment) = self.ctx.detach_output() {
            object.commit(segment);
        }
        result
    }

    fn pump_storage_inner<O: ObjectStorage>(
        &mut self,
        object: &mut O,
        flush: FlushMode,
    ) -> Result<(), FilterError> {
        loop {
            if self.ctx.output_full() {
                // Commit the full segment before asking for room
                if let Some(previous) = self.ctx.detach_output() {
                    object.commit(previous);
                }
                let segment = object.acquire_segment(1)?;
                let replaced = self.ctx.attach_output(segment);
                debug_assert!(replaced.is_none(), "Postcondition: output was detached");
            }

            let status = self.ctx.step(flush).status;
            let full = self.ctx.output_full();
            if self.settle(status, flush, full, "")? {
                return Ok(());
            }
        }
    }

    /// Step until the input is consumed, discarding output
    fn pump_scratch(&mut self) -> Result<(), FilterError> {
        loop {
            if self.ctx.output_full() {
                self.ctx.discard_scratch();
            }
            self.ctx.attach_scratch()?;

            let status = self.ctx.step(FlushMode::Normal).status;
            let full = self.ctx.output_full();
            if self.settle(status, FlushMode::Normal, full, "Invalid Gzip data: ")? {
                return Ok(());
            }
        }
    }

    /// Judge one step; `Ok(true)` once the pump is done
    fn settle(
        &mut self,
        status: CodecStatus,
        flush: FlushMode,
        full: bool,
        error_prefix: &str,
    ) -> Result<bool, FilterError> {
        match status {
            CodecStatus::Error(msg) => Err(FilterError::codec(
                self.mode.tag(),
                format!("{error_prefix}{msg}"),
            )),
            CodecStatus::End => {
                self.finished = true;
                let unconsumed = self.ctx.input_remaining();
                if unconsumed > 0 {
                    self.trailing(unconsumed)?;
                }
                Ok(true)
            }
            CodecStatus::Blocked if !full => {
                if flush == FlushMode::Finish || !self.ctx.input_exhausted() {
                    Err(FilterError::codec(self.mode.tag(), "no progress"))
                } else {
                    Ok(true)
                }
            }
            CodecStatus::Blocked | CodecStatus::Progress => {
                Ok(flush != FlushMode::Finish && self.ctx.input_exhausted() && !full)
            }
        }
    }

    /// Input that arrived after the end of the gzip member
    fn trailing(&mut self, unconsumed: usize) -> Result<(), FilterError> {
        match self.trailing_garbage {
            TrailingGarbage::Reject => Err(FilterError::TrailingGarbage {
                tag: self.mode.tag().to_string(),
                unconsumed,
            }),
            TrailingGarbage::Ignore => {
                if !self.ctx.input_exhausted() {
                    self.ctx.discard_input();
                }
                if self.discarded == 0 {
                    warn!(tag = self.mode.tag(), unconsumed, "ignoring junk after gzip data");
                }
                self.discarded += unconsumed as u64;
                Ok(())
            }
        }
    }

    /// Insert a resumable boundary into a compress-on-fetch stream
    pub fn align<O>(&mut self, fetch: &mut Fetch<O>) -> Result<BitMarkers, FilterError>
    where
        O: ObjectStorage + ObjectMetadata,
    {
        self.flush_point(fetch, FlushMode::Align)
    }

    /// Like `align`, and also restart the compression window
    pub fn reset<O>(&mut self, fetch: &mut Fetch<O>) -> Result<BitMarkers, FilterError>
    where
        O: ObjectStorage + ObjectMetadata,
    {
        self.flush_point(fetch, FlushMode::Reset)
    }

    fn flush_point<O>(&mut self, fetch: &mut Fetch<O>, flush: FlushMode) -> Result<BitMarkers, FilterError>
    where
        O: ObjectStorage + ObjectMetadata,
    {
        debug_assert!(
            self.mode == FetchMode::Gzip,
            "Precondition: flush points only apply to compress-on-fetch"
        );
        if self.mode != FetchMode::Gzip || fetch.is_failed() {
            return Ok(self.ctx.markers());
        }
        if let Err(e) = self.pump_storage(&mut fetch.object, flush) {
            fetch.fail(&e);
            return Err(e);
        }
        Ok(self.ctx.markers())
    }

    /// Finish the transform and tear the context down
    ///
    /// A transfer that already failed only releases the context. Otherwise
    /// the stream must reach its logical end; the markers are then recorded
    /// on the object.
    pub fn end<O>(mut self, fetch: &mut Fetch<O>) -> Result<(), FilterError>
    where
        O: ObjectStorage + ObjectMetadata,
    {
        if fetch.is_failed() {
            let teardown = self.ctx.destroy();
            debug!(tag = %teardown.summary.tag, status = ?teardown.status, "fetch filter abandoned");
            return Ok(());
        }

        if self.mode == FetchMode::Gzip {
            if let Err(e) = self.pump_storage(&mut fetch.object, FlushMode::Finish) {
                fetch.fail(&e);
                return Err(e);
            }
        }

        let teardown = self.ctx.destroy();
        let tag = teardown.summary.tag;
        let error = match teardown.status {
            CodecStatus::End => {
                debug!(tag = %tag, markers = ?teardown.summary.markers, "recording bit markers");
                fetch.object.set_bit_markers(teardown.summary.markers);
                return Ok(());
            }
            CodecStatus::Error(message) => FilterError::Codec { tag, message },
            CodecStatus::Progress | CodecStatus::Blocked => FilterError::PrematureEnd { tag },
        };
        fetch.fail(&error);
        Err(error)
    }
}
