// This module implements value prediction for loads the compiler marked as predictable, so
// their values need not be communicated between stages. A predictor is registered per (load
// site, calling context) before the workers are spawned. Once the first iteration of a run has
// committed, the commit process turns every registered predictor into an established
// Prediction: a loop-invariant one caches the committed value, a linear one derives a stride
// from the value before and after that iteration and extrapolates base + stride * distance,
// with wrapping integer arithmetic at the load's width or with f32/f64 arithmetic through
// explicit bit-pattern conversions. Established predictions are shipped to every worker, which
// writes the predicted value into memory at begin_iter and flags those shadow bytes as
// predicted; the commit process re-checks them against committed memory every iteration.

//! Loop-invariant and linear value prediction.

use hashbrown::HashMap;

use crate::core::error::{RuntimeError, RuntimeResult};
use crate::packet::{Packet, PacketKind};

/// Bit pattern of an `f64`.
#[inline]
pub fn bits_of_f64(value: f64) -> u64 {
    value.to_bits()
}

/// `f64` with the given bit pattern. Inverse of [`bits_of_f64`].
#[inline]
pub fn f64_from_bits(bits: u64) -> f64 {
    f64::from_bits(bits)
}

#[inline]
pub fn bits_of_f32(value: f32) -> u32 {
    value.to_bits()
}

#[inline]
pub fn f32_from_bits(bits: u32) -> f32 {
    f32::from_bits(bits)
}

/// Arithmetic a linear predictor extrapolates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Numeric {
    Integer,
    F32,
    F64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredictorKind {
    Invariant,
    Linear(Numeric),
}

impl PredictorKind {
    fn code(self) -> u32 {
        match self {
            PredictorKind::Invariant => 0,
            PredictorKind::Linear(Numeric::Integer) => 1,
            PredictorKind::Linear(Numeric::F32) => 2,
            PredictorKind::Linear(Numeric::F64) => 3,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => PredictorKind::Invariant,
            1 => PredictorKind::Linear(Numeric::Integer),
            2 => PredictorKind::Linear(Numeric::F32),
            3 => PredictorKind::Linear(Numeric::F64),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PredictorId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictorSpec {
    pub site: u32,
    pub context: u32,
    pub ptr: usize,
    pub size: usize,
    pub kind: PredictorKind,
}

/// An established predictor: the value memory holds at the start of any iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub ptr: usize,
    pub size: usize,
    pub kind: PredictorKind,
    pub base: u64,
    pub stride: u64,
    /// Iteration at whose start memory held `base`.
    pub first: u64,
}

fn width_mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

impl Prediction {
    pub fn value_at(&self, iteration: u64) -> u64 {
        let distance = iteration.saturating_sub(self.first);
        match self.kind {
            PredictorKind::Invariant => self.base,
            PredictorKind::Linear(Numeric::Integer) => {
                self.base.wrapping_add(self.stride.wrapping_mul(distance)) & width_mask(self.size)
            }
            PredictorKind::Linear(Numeric::F32) => {
                let base = f32_from_bits(self.base as u32);
                let stride = f32_from_bits(self.stride as u32);
                bits_of_f32(base + stride * distance as f32) as u64
            }
            PredictorKind::Linear(Numeric::F64) => {
                let base = f64_from_bits(self.base);
                let stride = f64_from_bits(self.stride);
                bits_of_f64(base + stride * distance as f64)
            }
        }
    }

    /// Build from the values before (`before`) and after (`after`) iteration `first`.
    fn establish(spec: &PredictorSpec, first: u64, before: u64, after: u64) -> Self {
        let (base, stride) = match spec.kind {
            PredictorKind::Invariant => (after, 0),
            PredictorKind::Linear(Numeric::Integer) => {
                (before, after.wrapping_sub(before) & width_mask(spec.size))
            }
            PredictorKind::Linear(Numeric::F32) => {
                let stride = f32_from_bits(after as u32) - f32_from_bits(before as u32);
                (before, bits_of_f32(stride) as u64)
            }
            PredictorKind::Linear(Numeric::F64) => {
                (before, bits_of_f64(f64_from_bits(after) - f64_from_bits(before)))
            }
        };
        // an invariant established after `first` starts holding at `first + 1`
        let first = match spec.kind {
            PredictorKind::Invariant => first + 1,
            PredictorKind::Linear(_) => first,
        };
        Self {
            ptr: spec.ptr,
            size: spec.size,
            kind: spec.kind,
            base,
            stride,
            first,
        }
    }

    pub fn to_packet(&self) -> Packet {
        Packet {
            meta: self.stride,
            aux: self.kind.code(),
            ..Packet::event(PacketKind::Predict, self.first, self.ptr as u64, self.size as u32, self.base)
        }
    }

    pub fn from_packet(packet: &Packet) -> Option<Self> {
        if packet.kind != PacketKind::Predict {
            return None;
        }
        Some(Self {
            ptr: packet.ptr as usize,
            size: packet.size as usize,
            kind: PredictorKind::from_code(packet.aux)?,
            base: packet.value,
            stride: packet.meta,
            first: packet.iteration,
        })
    }
}

/// Registered predictors of one invocation.
#[derive(Debug, Default)]
pub struct Predictors {
    specs: Vec<PredictorSpec>,
    by_site: HashMap<(u32, u32), PredictorId>,
    before: Vec<u64>,
    established: Vec<Prediction>,
}

impl Predictors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predictor; a second registration of the same site and
    /// context returns the first one's id.
    pub fn register(&mut self, spec: PredictorSpec) -> RuntimeResult<PredictorId> {
        if let Some(&id) = self.by_site.get(&(spec.site, spec.context)) {
            return Ok(id);
        }
        let width_ok = match spec.kind {
            PredictorKind::Linear(Numeric::F32) => spec.size == 4,
            PredictorKind::Linear(Numeric::F64) => spec.size == 8,
            _ => matches!(spec.size, 1 | 2 | 4 | 8),
        };
        if !width_ok {
            return Err(RuntimeError::InvalidConfig {
                reason: format!("predictor of {} bytes with {:?}", spec.size, spec.kind),
            });
        }
        let id = PredictorId(self.specs.len());
        self.specs.push(spec);
        self.by_site.insert((spec.site, spec.context), id);
        log::debug!("predictor {} registered at {:#x} ({:?})", id.0, spec.ptr, spec.kind);
        Ok(id)
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn specs(&self) -> &[PredictorSpec] {
        &self.specs
    }

    /// Record predicted locations before the first iteration of a run.
    pub fn snapshot<F>(&mut self, mut read: F)
    where
        F: FnMut(usize, usize) -> u64,
    {
        self.established.clear();
        self.before = self.specs.iter().map(|s| read(s.ptr, s.size)).collect();
    }

    /// Establish every predictor once iteration `first` has committed.
    pub fn establish<F>(&mut self, first: u64, mut read: F) -> &[Prediction]
    where
        F: FnMut(usize, usize) -> u64,
    {
        self.established = self
            .specs
            .iter()
            .zip(&self.before)
            .map(|(spec, &before)| Prediction::establish(spec, first, before, read(spec.ptr, spec.size)))
            .collect();
        &self.established
    }

    pub fn established(&self) -> &[Prediction] {
        &self.established
    }

    /// `verify_loop_invariants`: the first prediction memory does not hold at
    /// the start of `iteration`.
    pub fn verify<F>(&self, iteration: u64, mut read: F) -> Option<&Prediction>
    where
        F: FnMut(usize, usize) -> u64,
    {
        self.established
            .iter()
            .filter(|p| iteration >= p.first)
            .find(|p| read(p.ptr, p.size) != p.value_at(iteration))
    }

    /// Forget run state; registrations survive.
    pub fn reset(&mut self) {
        self.before.clear();
        self.established.clear();
    }
}
