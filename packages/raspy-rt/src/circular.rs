//! Bipartite circular buffer over a stream signal.
//!
//! The segment holds two regions of `window` rows each. The writer fills one
//! region while the other keeps the previous `window` samples stable; crossing
//! a region boundary is the swap. The only published state is the write
//! position (total samples accepted) in header word 0, so cursor and region
//! exposure change together with a single release store. Readers copy without
//! locking and re-check the position afterwards.

use crate::bus::{convert, SignalSlot, SignalSpec};
use crate::error::{BusError, BusResult, ContinuityFault};
use crate::segment::{WORD_COUNTER, WORD_GENERATION};
use crate::types::{DType, Element};
use serde::Serialize;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

const WORD_REJECTED: usize = 2;
const WORD_GAPS: usize = 3;
const WORD_MISSING: usize = 4;
const WORD_SWAPS: usize = 5;

/// Byte offset of the per-row counter array, after the sample data
pub(crate) fn counter_offset(data_bytes: usize) -> usize {
    (data_bytes + 7) & !7
}

/// Result of an accepted push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// Accepted after a forward gap of `missing` counters
    AfterGap { expected: u64, missing: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub accepted: u64,
    pub rejected: u64,
    pub gaps: u64,
    pub missing_samples: u64,
    pub swaps: u64,
}

impl BufferStats {
    /// Stale pushes plus forward gaps
    pub fn continuity_faults(&self) -> u64 {
        self.rejected + self.gaps
    }
}

/// Rows copied out of a stream, oldest first
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBlock<T> {
    /// Row-major, `rows() * channels` elements
    pub samples: Vec<T>,
    pub counters: Vec<u64>,
    pub channels: usize,
    /// Write position after the newest returned row
    pub position: u64,
    /// Rows overwritten before the reader got to them
    pub lost: u64,
}

impl<T> StreamBlock<T> {
    pub fn rows(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    pub fn row(&self, index: usize) -> &[T] {
        &self.samples[index * self.channels..(index + 1) * self.channels]
    }

    fn map<U>(self, f: impl Fn(T) -> U) -> StreamBlock<U> {
        StreamBlock {
            samples: self.samples.into_iter().map(f).collect(),
            counters: self.counters,
            channels: self.channels,
            position: self.position,
            lost: self.lost,
        }
    }
}

struct Layout {
    window: usize,
    channels: usize,
    row_bytes: usize,
    counters_at: usize,
}

impl Layout {
    fn of(spec: &SignalSpec) -> Self {
        let row_bytes = spec.channels() * spec.dtype.size();
        Self {
            window: spec.window(),
            channels: spec.channels(),
            row_bytes,
            counters_at: counter_offset(2 * spec.window() * row_bytes),
        }
    }

    fn ring(&self) -> u64 {
        2 * self.window as u64
    }

    /// Physical row of sample position `q`: region `(q / N) % 2`, offset `q % N`
    fn row_of(&self, q: u64) -> usize {
        (q % self.ring()) as usize
    }
}

fn stats_of(slot: &SignalSlot) -> BufferStats {
    let word = |i| slot.segment.word(i).load(Ordering::Relaxed);
    BufferStats {
        accepted: slot.segment.word(WORD_GENERATION).load(Ordering::Acquire),
        rejected: word(WORD_REJECTED),
        gaps: word(WORD_GAPS),
        missing_samples: word(WORD_MISSING),
        swaps: word(WORD_SWAPS),
    }
}

/// The unique writer of a stream signal
pub struct StreamWriter {
    slot: Arc<SignalSlot>,
    layout: Layout,
    position: u64,
    last_counter: Option<u64>,
}

impl StreamWriter {
    pub(crate) fn new(slot: Arc<SignalSlot>) -> Self {
        let layout = Layout::of(&slot.spec);
        let position = slot.segment.word(WORD_GENERATION).load(Ordering::Acquire);
        Self {
            slot,
            layout,
            position,
            last_counter: None,
        }
    }

    pub fn spec(&self) -> &SignalSpec {
        &self.slot.spec
    }

    pub fn last_counter(&self) -> Option<u64> {
        self.last_counter
    }

    pub fn stats(&self) -> BufferStats {
        stats_of(&self.slot)
    }

    /// Append one sample tagged with `counter`.
    ///
    /// A counter at or below the last accepted one is rejected and leaves the
    /// buffer untouched. A forward gap is accepted and reported in the
    /// outcome and in the buffer statistics.
    pub fn push<T: Element>(&mut self, sample: &[T], counter: u64) -> BusResult<PushOutcome> {
        self.slot.check_dtype::<T>()?;
        if sample.len() != self.layout.channels {
            return Err(BusError::LengthMismatch {
                signal: self.slot.spec.name.clone(),
                expected: self.layout.channels,
                found: sample.len(),
            });
        }

        let outcome = match self.last_counter {
            Some(last) if counter <= last => {
                self.slot.segment.word(WORD_REJECTED).fetch_add(1, Ordering::Relaxed);
                return Err(ContinuityFault::Stale { last, got: counter }.into());
            }
            Some(last) if counter > last + 1 => {
                let missing = counter - last - 1;
                self.slot.segment.word(WORD_GAPS).fetch_add(1, Ordering::Relaxed);
                self.slot.segment.word(WORD_MISSING).fetch_add(missing, Ordering::Relaxed);
                PushOutcome::AfterGap {
                    expected: last + 1,
                    missing,
                }
            }
            _ => PushOutcome::Accepted,
        };

        let row = self.layout.row_of(self.position);
        unsafe {
            std::ptr::copy_nonoverlapping(
                sample.as_ptr() as *const u8,
                self.slot.segment.payload_ptr(row * self.layout.row_bytes),
                self.layout.row_bytes,
            );
            std::ptr::copy_nonoverlapping(
                counter.to_ne_bytes().as_ptr(),
                self.slot.segment.payload_ptr(self.layout.counters_at + row * 8),
                8,
            );
        }

        self.position += 1;
        self.last_counter = Some(counter);
        self.slot.segment.word(WORD_COUNTER).store(counter, Ordering::Relaxed);
        self.slot.segment.word(WORD_GENERATION).store(self.position, Ordering::Release);

        if self.position % self.layout.window as u64 == 0 {
            self.slot.segment.word(WORD_SWAPS).fetch_add(1, Ordering::Relaxed);
            log::trace!(
                "Stream '{}' swapped regions at position {}",
                self.slot.spec.name,
                self.position
            );
        }
        Ok(outcome)
    }

    /// Push an f64 sample, converting to the declared dtype
    pub fn push_f64(&mut self, sample: &[f64], counter: u64) -> BusResult<PushOutcome> {
        match self.slot.spec.dtype {
            DType::F64 => self.push(sample, counter),
            DType::F32 => self.push(&convert::<f32>(sample), counter),
            DType::I8 => self.push(&convert::<i8>(sample), counter),
            DType::I32 => self.push(&convert::<i32>(sample), counter),
            DType::I64 => self.push(&convert::<i64>(sample), counter),
            DType::U8 => self.push(&convert::<u8>(sample), counter),
            DType::U64 => self.push(&convert::<u64>(sample), counter),
        }
    }
}

/// Lock-free reader of a stream signal. Cheap to clone.
#[derive(Clone)]
pub struct StreamReader {
    slot: Arc<SignalSlot>,
}

impl StreamReader {
    pub(crate) fn new(slot: Arc<SignalSlot>) -> Self {
        Self { slot }
    }

    pub fn spec(&self) -> &SignalSpec {
        &self.slot.spec
    }

    /// Total samples accepted so far
    pub fn position(&self) -> u64 {
        self.slot.segment.word(WORD_GENERATION).load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BufferStats {
        stats_of(&self.slot)
    }

    /// The last `n` samples in push order. `n` may not exceed the window.
    pub fn read_contiguous<T: Element>(&self, n: usize) -> BusResult<StreamBlock<T>> {
        self.slot.check_dtype::<T>()?;
        let layout = Layout::of(&self.slot.spec);
        if n > layout.window {
            return Err(BusError::WindowUnavailable {
                signal: self.slot.spec.name.clone(),
                requested: n,
                available: layout.window,
            });
        }
        loop {
            let end = self.position();
            if (n as u64) > end {
                return Err(BusError::WindowUnavailable {
                    signal: self.slot.spec.name.clone(),
                    requested: n,
                    available: end as usize,
                });
            }
            if let Some(block) = self.copy_range(&layout, end - n as u64, end, 0) {
                return Ok(block);
            }
            std::hint::spin_loop();
        }
    }

    /// Every sample accepted after position `since`, up to one window.
    /// Older samples the writer already overwrote are counted in `lost`.
    pub fn read_new<T: Element>(&self, since: u64) -> BusResult<StreamBlock<T>> {
        self.slot.check_dtype::<T>()?;
        let layout = Layout::of(&self.slot.spec);
        loop {
            let end = self.position();
            let since = since.min(end);
            let available = end - since;
            let take = available.min(layout.window as u64);
            if let Some(block) = self.copy_range(&layout, end - take, end, available - take) {
                return Ok(block);
            }
            std::hint::spin_loop();
        }
    }

    pub fn read_contiguous_f64(&self, n: usize) -> BusResult<StreamBlock<f64>> {
        macro_rules! widen {
            ($t:ty) => {
                self.read_contiguous::<$t>(n).map(|b| b.map(Element::to_f64))
            };
        }
        match self.slot.spec.dtype {
            DType::F64 => self.read_contiguous::<f64>(n),
            DType::F32 => widen!(f32),
            DType::I8 => widen!(i8),
            DType::I32 => widen!(i32),
            DType::I64 => widen!(i64),
            DType::U8 => widen!(u8),
            DType::U64 => widen!(u64),
        }
    }

    pub fn read_new_f64(&self, since: u64) -> BusResult<StreamBlock<f64>> {
        macro_rules! widen {
            ($t:ty) => {
                self.read_new::<$t>(since).map(|b| b.map(Element::to_f64))
            };
        }
        match self.slot.spec.dtype {
            DType::F64 => self.read_new::<f64>(since),
            DType::F32 => widen!(f32),
            DType::I8 => widen!(i8),
            DType::I32 => widen!(i32),
            DType::I64 => widen!(i64),
            DType::U8 => widen!(u8),
            DType::U64 => widen!(u64),
        }
    }

    /// Copy positions `start..end`; `None` if the writer overtook the copy
    fn copy_range<T: Element>(
        &self,
        layout: &Layout,
        start: u64,
        end: u64,
        lost: u64,
    ) -> Option<StreamBlock<T>> {
        let rows = (end - start) as usize;
        let mut samples = vec![T::default(); rows * layout.channels];
        let mut counters = vec![0u64; rows];
        let dst = samples.as_mut_ptr() as *mut u8;

        for (i, q) in (start..end).enumerate() {
            let row = layout.row_of(q);
            let mut raw = [0u8; 8];
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.slot.segment.payload_ptr(row * layout.row_bytes),
                    dst.add(i * layout.row_bytes),
                    layout.row_bytes,
                );
                std::ptr::copy_nonoverlapping(
                    self.slot.segment.payload_ptr(layout.counters_at + row * 8),
                    raw.as_mut_ptr(),
                    8,
                );
            }
            counters[i] = u64::from_ne_bytes(raw);
        }

        fence(Ordering::Acquire);
        let now = self.slot.segment.word(WORD_GENERATION).load(Ordering::Relaxed);
        // The writer may be filling row `now`; it must not have reached the
        // row that held `start` one full ring ago.
        if rows > 0 && now >= start + layout.ring() {
            return None;
        }

        Some(StreamBlock {
            samples,
            counters,
            channels: layout.channels,
            position: end,
            lost,
        })
    }
}
