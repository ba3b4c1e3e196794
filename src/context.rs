//! Stream Context
//!
//! One in-flight transform: a codec engine, the input/output views feeding
//! it, and the accounting reported when the transform is torn down.
//!
//! ## Lifecycle
//!
//! ```text
//! create ──► attach_input / attach_output ──► step(flush)* ──► destroy
//!                  ▲                              │
//!                  └──── input exhausted / ───────┘
//!                        output full or Blocked
//! ```
//!
//! The engine is initialized exactly once in `create` and finalized exactly
//! once, either by `destroy` or by `Drop` when the owner bails out early.
//! Contexts are `Send` but never shared; the driving worker owns them.

use crate::codec::{BitMarkers, CodecEngine, CodecStatus, Direction, FlushMode, GzipEngine, QualityParams};
use crate::delivery::{ByteSink, SinkAction};
use crate::error::FilterError;
use crate::scratch::ScratchBuffer;
use crate::stats;
use crate::storage::Segment;
use crate::view::InputView;
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info};

/// Where the engine writes
#[derive(Debug)]
enum OutputTarget {
    Detached,
    Segment(Segment),
    Scratch,
}

/// Bytes produced by one step plus the step status
///
/// `produced` aliases the output region written by this step.
#[derive(Debug)]
pub struct StepOutput<'a> {
    pub produced: &'a [u8],
    pub status: CodecStatus,
}

/// Diagnostic record emitted once per context teardown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextSummary {
    pub tag: String,
    pub direction: Direction,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub markers: BitMarkers,
}

/// Final status and diagnostics of a destroyed context
#[derive(Debug, Clone)]
pub struct Teardown {
    pub status: CodecStatus,
    pub summary: ContextSummary,
}

pub struct StreamContext<E: CodecEngine = GzipEngine> {
    direction: Direction,
    tag: String,
    engine: E,
    input: InputView,
    output: OutputTarget,
    scratch: Option<ScratchBuffer>,
    scratch_capacity: usize,
    total_in: u64,
    total_out: u64,
    last_status: CodecStatus,
    finalized: bool,
}

impl<E: CodecEngine> std::fmt::Debug for StreamContext<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("tag", &self.tag)
            .field("direction", &self.direction)
            .field("total_in", &self.total_in)
            .field("total_out", &self.total_out)
            .field("last_status", &self.last_status)
            .finish()
    }
}

impl<E: CodecEngine> StreamContext<E> {
    /// Create a context and initialize its engine
    ///
    /// `scratch_capacity` is only used if `attach_scratch` is ever called.
    pub fn create(
        direction: Direction,
        tag: &str,
        params: &QualityParams,
        scratch_capacity: usize,
    ) -> Result<Self, FilterError> {
        let engine = E::init(direction, params).map_err(|e| {
            debug!(tag, error = %e.0, "codec engine init failed");
            FilterError::AllocationFailure {
                what: "codec engine",
                size: 0,
            }
        })?;
        stats::record_context(direction);
        debug!(tag, direction = direction.as_str(), "stream context created");

        Ok(StreamContext {
            direction,
            tag: tag.to_string(),
            engine,
            input: InputView::default(),
            output: OutputTarget::Detached,
            scratch: None,
            scratch_capacity,
            total_in: 0,
            total_out: 0,
            // Nothing attempted yet: no progress observed
            last_status: CodecStatus::Blocked,
            finalized: false,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// Replace the input view
    ///
    /// # Panics
    /// If the previous input has not been fully consumed.
    pub fn attach_input(&mut self, data: Bytes) {
        assert!(
            self.input.is_exhausted(),
            "Precondition: {} input attached with {} bytes still unconsumed",
            self.tag,
            self.input.remaining_len()
        );
        self.input = InputView::new(data);
    }

    #[inline]
    pub fn input_exhausted(&self) -> bool {
        self.input.is_exhausted()
    }

    /// Unconsumed input bytes
    #[inline]
    pub fn input_remaining(&self) -> usize {
        self.input.remaining_len()
    }

    /// Throw away unconsumed input (trailing data after logical end)
    pub fn discard_input(&mut self) -> usize {
        let n = self.input.remaining_len();
        self.input.advance(n);
        self.input.release();
        n
    }

    /// Point the output view at a storage segment
    ///
    /// Returns the previously attached segment so its bytes can be committed.
    pub fn attach_output(&mut self, segment: Segment) -> Option<Segment> {
        match std::mem::replace(&mut self.output, OutputTarget::Segment(segment)) {
            OutputTarget::Segment(previous) => Some(previous),
            OutputTarget::Detached | OutputTarget::Scratch => None,
        }
    }

    /// Take back the attached storage segment, if any
    pub fn detach_output(&mut self) -> Option<Segment> {
        match std::mem::replace(&mut self.output, OutputTarget::Detached) {
            OutputTarget::Segment(segment) => Some(segment),
            OutputTarget::Scratch => {
                self.output = OutputTarget::Scratch;
                None
            }
            OutputTarget::Detached => None,
        }
    }

    /// Allocate the scratch buffer on first use and make it the output view
    pub fn attach_scratch(&mut self) -> Result<(), FilterError> {
        debug_assert!(
            !matches!(self.output, OutputTarget::Segment(_)),
            "Precondition: detach the storage segment before attaching scratch"
        );
        if self.scratch.is_none() {
            self.scratch = Some(ScratchBuffer::allocate(self.scratch_capacity)?);
            debug!(tag = %self.tag, capacity = self.scratch_capacity, "scratch buffer allocated");
        }
        self.output = OutputTarget::Scratch;
        Ok(())
    }

    /// True when the output view has no room left (or none is attached)
    pub fn output_full(&self) -> bool {
        match (&self.output, &self.scratch) {
            (OutputTarget::Segment(segment), _) => segment.is_full(),
            (OutputTarget::Scratch, Some(scratch)) => scratch.is_full(),
            _ => true,
        }
    }

    /// Unflushed scratch bytes
    pub fn scratch_fill(&self) -> usize {
        self.scratch.as_ref().map_or(0, ScratchBuffer::fill)
    }

    /// Hand the filled scratch prefix to `sink` and rewind the buffer
    ///
    /// An empty `Flush` is skipped; an `End` push always goes out.
    pub fn flush_scratch<S: ByteSink + ?Sized>(
        &mut self,
        sink: &mut S,
        action: SinkAction,
    ) -> Result<(), FilterError> {
        let Some(scratch) = self.scratch.as_mut() else {
            return match action {
                SinkAction::Flush => Ok(()),
                SinkAction::End => sink.push(action, &[]).map_err(FilterError::Sink),
            };
        };
        if scratch.fill() == 0 && action == SinkAction::Flush {
            return Ok(());
        }
        sink.push(action, scratch.filled())
            .map_err(FilterError::Sink)?;
        scratch.reset();
        Ok(())
    }

    /// Drop the scratch contents without delivering them
    pub fn discard_scratch(&mut self) {
        if let Some(scratch) = self.scratch.as_mut() {
            scratch.reset();
        }
    }

    // ========================================================================
    // Transform
    // ========================================================================

    fn output_used(&self) -> usize {
        match (&self.output, &self.scratch) {
            (OutputTarget::Segment(segment), _) => segment.used(),
            (OutputTarget::Scratch, Some(scratch)) => scratch.fill(),
            _ => 0,
        }
    }

    /// Advance the engine once over the attached views
    pub fn step(&mut self, flush: FlushMode) -> StepOutput<'_> {
        let full = self.output_full();
        debug_assert!(!full, "Precondition: {} stepped without output room", self.tag);
        if full {
            self.last_status = CodecStatus::Blocked;
            return StepOutput {
                produced: &[],
                status: CodecStatus::Blocked,
            };
        }

        let before = self.output_used();
        let window: &mut [u8] = match (&mut self.output, self.scratch.as_mut()) {
            (OutputTarget::Segment(segment), _) => segment.spare_mut(),
            (OutputTarget::Scratch, Some(scratch)) => scratch.spare_mut(),
            _ => &mut [],
        };
        let window_len = window.len();
        let step = self.engine.step(self.input.remaining(), window, flush);

        debug_assert!(
            step.produced <= window_len,
            "Postcondition: engine wrote {} into a {} byte window",
            step.produced,
            window_len
        );

        self.input.advance(step.consumed);
        if self.input.is_exhausted() {
            self.input.release();
        }
        match (&mut self.output, self.scratch.as_mut()) {
            (OutputTarget::Segment(segment), _) => segment.extend(step.produced),
            (OutputTarget::Scratch, Some(scratch)) => scratch.extend(step.produced),
            _ => {}
        }
        self.total_in += step.consumed as u64;
        self.total_out += step.produced as u64;
        self.last_status = step.status.clone();

        #[cfg(debug_assertions)]
        self.verify_invariants();

        let produced: &[u8] = match (&self.output, &self.scratch) {
            (OutputTarget::Segment(segment), _) => &segment.filled()[before..],
            (OutputTarget::Scratch, Some(scratch)) => &scratch.filled()[before..],
            _ => &[],
        };
        StepOutput {
            produced,
            status: step.status,
        }
    }

    pub fn markers(&self) -> BitMarkers {
        self.engine.markers()
    }

    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    pub fn last_status(&self) -> &CodecStatus {
        &self.last_status
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Finalize the engine and report the reconciled status
    pub fn destroy(mut self) -> Teardown {
        self.teardown()
    }

    fn teardown(&mut self) -> Teardown {
        debug_assert!(!self.finalized, "Invariant violated: context finalized twice");
        self.finalized = true;

        let end_status = self.engine.end();
        let status = reconcile(&self.last_status, end_status);
        self.scratch = None;
        self.output = OutputTarget::Detached;

        let summary = ContextSummary {
            tag: self.tag.clone(),
            direction: self.direction,
            bytes_in: self.total_in,
            bytes_out: self.total_out,
            markers: self.engine.markers(),
        };
        info!(
            target: "cache_gzip::diag",
            tag = %summary.tag,
            bytes_in = summary.bytes_in,
            bytes_out = summary.bytes_out,
            start = summary.markers.start,
            last = summary.markers.last,
            stop = summary.markers.stop,
            status = ?status,
            "gzip context done"
        );
        Teardown { status, summary }
    }

    #[cfg(debug_assertions)]
    fn verify_invariants(&self) {
        if let Some(scratch) = &self.scratch {
            debug_assert!(
                scratch.fill() <= scratch.capacity(),
                "Invariant violated: scratch fill exceeds capacity"
            );
        }
        let markers = self.engine.markers();
        debug_assert!(
            markers.is_ordered(),
            "Invariant violated: markers out of order {:?}",
            markers
        );
    }
}

impl<E: CodecEngine> Drop for StreamContext<E> {
    fn drop(&mut self) {
        if !self.finalized {
            let teardown = self.teardown();
            debug!(tag = %teardown.summary.tag, status = ?teardown.status, "stream context dropped");
        }
    }
}

/// Combine the engine's finalize status with the last step status
///
/// Only a stream that reported `End` (or an engine that finalizes as a
/// complete empty stream) reconciles to `End`.
fn reconcile(last: &CodecStatus, end: CodecStatus) -> CodecStatus {
    match (last, end) {
        (_, end @ CodecStatus::Error(_)) => end,
        (CodecStatus::Error(msg), _) => CodecStatus::Error(msg.clone()),
        (CodecStatus::End, _) => CodecStatus::End,
        (_, CodecStatus::End) => CodecStatus::End,
        (last, _) => last.clone(),
    }
}
