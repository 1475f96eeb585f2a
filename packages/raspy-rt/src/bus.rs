//! Shared-memory signal bus.
//!
//! Every signal is a fixed-shape, fixed-dtype array with exactly one writer.
//! Snapshot signals keep two payload slots and a generation counter in the
//! segment header: the writer stages into the back slot and the runtime
//! commits (bumps the generation) once the writer's step has completed.
//! Readers copy the front slot and retry if the generation moved while they
//! were copying, so a reader never sees a partial write.
//!
//! At each tick boundary the runtime also publishes the current generation.
//! A lagged reader (one not ordered after the writer) copies that published
//! slot, so it always sees the value as of the end of the previous tick.

use crate::circular::{StreamReader, StreamWriter};
use crate::error::{BusError, BusResult, ConstructionFault};
use crate::segment::{Segment, WORD_GENERATION, WORD_PUBLISHED};
use crate::types::{element_count, DType, Element};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(pub(crate) usize);

impl SignalId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Latest value only
    Snapshot,
    /// Bipartite circular buffer, shape `[window, channels]`
    Stream,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub writer: String,
    pub kind: SignalKind,
}

impl SignalSpec {
    /// Elements in one snapshot (or one window for a stream)
    pub fn len(&self) -> usize {
        element_count(&self.shape)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows per region of a stream signal
    pub fn window(&self) -> usize {
        self.shape[0]
    }

    /// Elements per sample of a stream signal
    pub fn channels(&self) -> usize {
        self.shape.get(1).copied().unwrap_or(1)
    }

    /// Bytes of the segment payload backing this signal
    pub fn payload_bytes(&self) -> usize {
        // Both layouts hold two copies: two snapshot slots, or two regions.
        let data = 2 * self.len() * self.dtype.size();
        match self.kind {
            SignalKind::Snapshot => data,
            SignalKind::Stream => crate::circular::counter_offset(data) + 2 * self.window() * 8,
        }
    }
}

/// Where signal segments are allocated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backing {
    Anonymous,
    /// File-backed maps under this directory
    Directory(PathBuf),
}

impl Default for Backing {
    fn default() -> Self {
        Self::Anonymous
    }
}

pub(crate) struct SignalSlot {
    pub(crate) spec: SignalSpec,
    pub(crate) segment: Segment,
    writer_taken: AtomicBool,
    pending: AtomicBool,
}

impl SignalSlot {
    pub(crate) fn check_dtype<T: Element>(&self) -> BusResult<()> {
        if T::DTYPE != self.spec.dtype {
            return Err(BusError::DTypeMismatch {
                signal: self.spec.name.clone(),
                expected: T::DTYPE,
                found: self.spec.dtype,
            });
        }
        Ok(())
    }

    pub(crate) fn take_writer(&self, module: &str) -> BusResult<()> {
        if self.spec.writer != module {
            return Err(BusError::NotWriter {
                signal: self.spec.name.clone(),
                module: module.to_string(),
            });
        }
        if self.writer_taken.swap(true, Ordering::AcqRel) {
            return Err(BusError::WriterTaken(self.spec.name.clone()));
        }
        Ok(())
    }

    fn slot_bytes(&self) -> usize {
        self.spec.len() * self.spec.dtype.size()
    }

    fn generation(&self) -> u64 {
        self.segment.word(WORD_GENERATION).load(Ordering::Acquire)
    }

    /// Copy the committed snapshot into `out`, returning its generation
    fn copy_front(&self, out: *mut u8) -> u64 {
        let bytes = self.slot_bytes();
        let word = self.segment.word(WORD_GENERATION);
        loop {
            let before = word.load(Ordering::Acquire);
            let slot = (before % 2) as usize;
            unsafe {
                std::ptr::copy_nonoverlapping(self.segment.payload_ptr(slot * bytes), out, bytes);
            }
            fence(Ordering::Acquire);
            let after = word.load(Ordering::Relaxed);
            if before == after {
                return before;
            }
            std::hint::spin_loop();
        }
    }

    /// Copy the slot published at the last tick boundary. The writer only
    /// stages into the other slot until the next boundary.
    fn copy_published(&self, out: *mut u8) -> u64 {
        let bytes = self.slot_bytes();
        let published = self.segment.word(WORD_PUBLISHED).load(Ordering::Acquire);
        let slot = (published % 2) as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(self.segment.payload_ptr(slot * bytes), out, bytes);
        }
        published
    }

    fn publish(&self) {
        let generation = self.generation();
        self.segment.word(WORD_PUBLISHED).store(generation, Ordering::Release);
    }

    /// Stage `bytes` into the back slot. Only the writer calls this.
    fn stage(&self, src: *const u8) {
        let bytes = self.slot_bytes();
        let back = ((self.segment.word(WORD_GENERATION).load(Ordering::Relaxed) + 1) % 2) as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(src, self.segment.payload_ptr(back * bytes), bytes);
        }
        self.pending.store(true, Ordering::Release);
    }

    /// Publish a staged write. Returns false if nothing was staged.
    fn commit(&self) -> bool {
        if self.pending.swap(false, Ordering::AcqRel) {
            self.segment.word(WORD_GENERATION).fetch_add(1, Ordering::Release);
            true
        } else {
            false
        }
    }
}

/// A committed snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    /// Number of commits so far; 0 means the signal was never written
    pub generation: u64,
    pub values: Vec<T>,
}

/// The set of all signals of one session. Allocated once, never resized.
pub struct SignalBus {
    backing: Backing,
    slots: Vec<Arc<SignalSlot>>,
    by_name: HashMap<String, SignalId>,
}

impl SignalBus {
    pub fn new(backing: Backing) -> Self {
        Self {
            backing,
            slots: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Declare a snapshot signal
    pub fn declare(
        &mut self,
        name: &str,
        shape: &[usize],
        dtype: DType,
        writer: &str,
    ) -> BusResult<SignalId> {
        self.declare_spec(SignalSpec {
            name: name.to_string(),
            shape: shape.to_vec(),
            dtype,
            writer: writer.to_string(),
            kind: SignalKind::Snapshot,
        })
    }

    /// Declare a stream signal backed by a bipartite circular buffer
    pub fn declare_stream(
        &mut self,
        name: &str,
        window: usize,
        channels: usize,
        dtype: DType,
        writer: &str,
    ) -> BusResult<SignalId> {
        self.declare_spec(SignalSpec {
            name: name.to_string(),
            shape: vec![window, channels],
            dtype,
            writer: writer.to_string(),
            kind: SignalKind::Stream,
        })
    }

    pub fn declare_spec(&mut self, spec: SignalSpec) -> BusResult<SignalId> {
        if let Some(existing) = self.by_name.get(&spec.name) {
            let first = self.slots[existing.0].spec.writer.clone();
            return Err(ConstructionFault::DuplicateWriter {
                signal: spec.name,
                first,
                second: spec.writer,
            }
            .into());
        }
        if spec.shape.is_empty() || spec.shape.iter().any(|&d| d == 0) {
            return Err(ConstructionFault::InvalidConfig(format!(
                "signal '{}' has an empty dimension in shape {:?}",
                spec.name, spec.shape
            ))
            .into());
        }
        if spec.kind == SignalKind::Stream && spec.shape.len() != 2 {
            return Err(ConstructionFault::InvalidConfig(format!(
                "stream signal '{}' must have shape [window, channels], got {:?}",
                spec.name, spec.shape
            ))
            .into());
        }

        let segment = match &self.backing {
            Backing::Anonymous => Segment::anonymous(spec.payload_bytes())?,
            Backing::Directory(dir) => Segment::file_backed(dir, &spec.name, spec.payload_bytes())?,
        };

        log::debug!(
            "Declared {:?} signal '{}' {:?} {} (writer '{}')",
            spec.kind,
            spec.name,
            spec.shape,
            spec.dtype,
            spec.writer
        );

        let id = SignalId(self.slots.len());
        self.by_name.insert(spec.name.clone(), id);
        self.slots.push(Arc::new(SignalSlot {
            spec,
            segment,
            writer_taken: AtomicBool::new(false),
            pending: AtomicBool::new(false),
        }));
        Ok(id)
    }

    pub fn id(&self, name: &str) -> BusResult<SignalId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| BusError::UnknownSignal(name.to_string()))
    }

    pub fn spec(&self, id: SignalId) -> &SignalSpec {
        &self.slots[id.0].spec
    }

    pub fn specs(&self) -> impl Iterator<Item = &SignalSpec> {
        self.slots.iter().map(|s| &s.spec)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total bytes mapped for payloads
    pub fn mapped_bytes(&self) -> usize {
        self.slots.iter().map(|s| s.segment.payload_len()).sum()
    }

    fn slot(&self, id: SignalId, kind: SignalKind) -> BusResult<&Arc<SignalSlot>> {
        let slot = self
            .slots
            .get(id.0)
            .ok_or_else(|| BusError::UnknownSignal(format!("#{}", id.0)))?;
        if slot.spec.kind != kind {
            let label = match kind {
                SignalKind::Snapshot => "snapshot",
                SignalKind::Stream => "stream",
            };
            return Err(BusError::KindMismatch(slot.spec.name.clone(), label));
        }
        Ok(slot)
    }

    /// The unique writer handle of a snapshot signal
    pub fn writer(&self, id: SignalId, module: &str) -> BusResult<SignalWriter> {
        let slot = self.slot(id, SignalKind::Snapshot)?;
        slot.take_writer(module)?;
        Ok(SignalWriter {
            slot: Arc::clone(slot),
        })
    }

    pub fn reader(&self, id: SignalId) -> BusResult<SignalReader> {
        let slot = self.slot(id, SignalKind::Snapshot)?;
        Ok(SignalReader {
            slot: Arc::clone(slot),
            lagged: false,
        })
    }

    /// Reader that only sees values published at tick boundaries
    pub fn lagged_reader(&self, id: SignalId) -> BusResult<SignalReader> {
        let slot = self.slot(id, SignalKind::Snapshot)?;
        Ok(SignalReader {
            slot: Arc::clone(slot),
            lagged: true,
        })
    }

    pub fn stream_writer(&self, id: SignalId, module: &str) -> BusResult<StreamWriter> {
        let slot = self.slot(id, SignalKind::Stream)?;
        slot.take_writer(module)?;
        Ok(StreamWriter::new(Arc::clone(slot)))
    }

    pub fn stream_reader(&self, id: SignalId) -> BusResult<StreamReader> {
        let slot = self.slot(id, SignalKind::Stream)?;
        Ok(StreamReader::new(Arc::clone(slot)))
    }

    /// Latest committed value of a snapshot signal
    pub fn read<T: Element>(&self, id: SignalId) -> BusResult<Snapshot<T>> {
        self.reader(id)?.read()
    }

    /// Publish whatever the writer staged during this tick
    pub(crate) fn commit(&self, id: SignalId) -> bool {
        match self.slots.get(id.0) {
            Some(slot) if slot.spec.kind == SignalKind::Snapshot => slot.commit(),
            _ => false,
        }
    }

    /// Tick boundary: make every committed snapshot visible to lagged readers.
    /// Only called while no module is stepping.
    pub(crate) fn publish(&self) {
        for slot in self.slots.iter().filter(|s| s.spec.kind == SignalKind::Snapshot) {
            slot.publish();
        }
    }
}

/// Unique, non-clonable writer of one snapshot signal
pub struct SignalWriter {
    slot: Arc<SignalSlot>,
}

impl SignalWriter {
    pub fn spec(&self) -> &SignalSpec {
        &self.slot.spec
    }

    /// Stage a full snapshot. Visible to readers after the runtime commits.
    pub fn write<T: Element>(&mut self, data: &[T]) -> BusResult<()> {
        self.slot.check_dtype::<T>()?;
        let expected = self.slot.spec.len();
        if data.len() != expected {
            return Err(BusError::LengthMismatch {
                signal: self.slot.spec.name.clone(),
                expected,
                found: data.len(),
            });
        }
        self.slot.stage(data.as_ptr() as *const u8);
        Ok(())
    }

    /// Stage a snapshot given as f64, converting to the declared dtype
    pub fn write_f64(&mut self, data: &[f64]) -> BusResult<()> {
        match self.slot.spec.dtype {
            DType::F64 => self.write(data),
            DType::F32 => self.write(&convert::<f32>(data)),
            DType::I8 => self.write(&convert::<i8>(data)),
            DType::I32 => self.write(&convert::<i32>(data)),
            DType::I64 => self.write(&convert::<i64>(data)),
            DType::U8 => self.write(&convert::<u8>(data)),
            DType::U64 => self.write(&convert::<u64>(data)),
        }
    }

    /// Publish immediately, outside the runtime's tick commit
    pub fn commit(&mut self) -> bool {
        self.slot.commit()
    }
}

pub(crate) fn convert<T: Element>(data: &[f64]) -> Vec<T> {
    data.iter().map(|&v| T::from_f64(v)).collect()
}

/// Reader of one snapshot signal. Cheap to clone.
#[derive(Clone)]
pub struct SignalReader {
    slot: Arc<SignalSlot>,
    lagged: bool,
}

impl SignalReader {
    pub fn spec(&self) -> &SignalSpec {
        &self.slot.spec
    }

    pub fn generation(&self) -> u64 {
        if self.lagged {
            self.slot.segment.word(WORD_PUBLISHED).load(Ordering::Acquire)
        } else {
            self.slot.generation()
        }
    }

    pub fn is_lagged(&self) -> bool {
        self.lagged
    }

    pub fn read<T: Element>(&self) -> BusResult<Snapshot<T>> {
        let mut values = vec![T::default(); self.slot.spec.len()];
        let generation = self.read_into(&mut values)?;
        Ok(Snapshot { generation, values })
    }

    pub fn read_into<T: Element>(&self, out: &mut [T]) -> BusResult<u64> {
        self.slot.check_dtype::<T>()?;
        let expected = self.slot.spec.len();
        if out.len() != expected {
            return Err(BusError::LengthMismatch {
                signal: self.slot.spec.name.clone(),
                expected,
                found: out.len(),
            });
        }
        let out = out.as_mut_ptr() as *mut u8;
        if self.lagged {
            Ok(self.slot.copy_published(out))
        } else {
            Ok(self.slot.copy_front(out))
        }
    }

    /// Read any dtype as f64
    pub fn read_f64(&self) -> BusResult<Snapshot<f64>> {
        fn widen<T: Element>(reader: &SignalReader) -> BusResult<Snapshot<f64>> {
            let snap = reader.read::<T>()?;
            Ok(Snapshot {
                generation: snap.generation,
                values: snap.values.into_iter().map(Element::to_f64).collect(),
            })
        }
        match self.slot.spec.dtype {
            DType::F64 => self.read::<f64>(),
            DType::F32 => widen::<f32>(self),
            DType::I8 => widen::<i8>(self),
            DType::I32 => widen::<i32>(self),
            DType::I64 => widen::<i64>(self),
            DType::U8 => widen::<u8>(self),
            DType::U64 => widen::<u64>(self),
        }
    }
}
