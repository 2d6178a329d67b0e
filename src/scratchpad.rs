//! Temporary buffers used by primitives during execution.
//!
//! Primitives which need temporary storage, eg. for partial reductions
//! computed by each thread, declare it when they are created by booking
//! named regions in a [`ScratchpadRegistry`]. The caller owns a
//! [`Scratchpad`], grows it to fit the registry of the primitive it is about
//! to run and passes it in the [`ExecCtx`](crate::ExecCtx). Primitives then
//! look up their regions by key.
//!
//! A scratchpad can be reused for any number of calls and primitives, which
//! avoids allocating on every call. Contents are not preserved between calls.

use std::fmt;
use std::ops::Range;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::operator::OpError;

/// Names of scratchpad regions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScratchpadKey {
    /// Max and denominator of each `(outer, inner)` softmax slice, stored as
    /// interleaved pairs.
    SoftmaxReduction,

    /// Per-thread partial sums of batch normalization statistics.
    BnormReduction,

    /// Batch mean when it is not an output of the primitive.
    BnormTmpMean,

    /// Batch variance when it is not an output of the primitive.
    BnormTmpVar,

    /// Scale and shift gradients when they are not an output of the
    /// primitive.
    BnormTmpDiffScaleShift,
}

impl fmt::Display for ScratchpadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScratchpadKey::SoftmaxReduction => "softmax-reduction",
            ScratchpadKey::BnormReduction => "bnorm-reduction",
            ScratchpadKey::BnormTmpMean => "bnorm-tmp-mean",
            ScratchpadKey::BnormTmpVar => "bnorm-tmp-var",
            ScratchpadKey::BnormTmpDiffScaleShift => "bnorm-tmp-diff-ss",
        };
        write!(f, "{}", name)
    }
}

/// Scratch space required by a primitive, as a list of named `f32` regions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScratchpadRegistry {
    entries: Vec<(ScratchpadKey, usize)>,
}

impl ScratchpadRegistry {
    pub const fn new() -> ScratchpadRegistry {
        ScratchpadRegistry {
            entries: Vec::new(),
        }
    }

    /// Reserve a region of `len` elements named `key`.
    ///
    /// Booking a key again replaces the earlier size.
    pub fn book(&mut self, key: ScratchpadKey, len: usize) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = len;
        } else {
            self.entries.push((key, len));
        }
    }

    /// Size of the region booked under `key`.
    pub fn len_of(&self, key: ScratchpadKey) -> Option<usize> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, len)| *len)
    }

    /// Total number of elements booked.
    pub fn size(&self) -> usize {
        self.entries.iter().map(|(_, len)| len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(ScratchpadKey, usize)] {
        &self.entries
    }
}

/// Caller-owned storage for the regions of a [`ScratchpadRegistry`].
#[derive(Debug, Default)]
pub struct Scratchpad {
    buf: Vec<f32>,

    /// Region of `buf` granted to each key by the last call to `reserve`.
    grants: FxHashMap<ScratchpadKey, Range<usize>>,
}

impl Scratchpad {
    pub fn new() -> Scratchpad {
        Scratchpad::default()
    }

    /// Create a scratchpad with regions for `registry`.
    pub fn for_registry(registry: &ScratchpadRegistry) -> Scratchpad {
        let mut scratchpad = Scratchpad::new();
        scratchpad.reserve(registry);
        scratchpad
    }

    /// Lay out the regions of `registry`, growing the backing storage if
    /// needed.
    ///
    /// The storage is never shrunk, so a scratchpad used for several
    /// primitives settles at the size of the largest one. Regions granted by
    /// an earlier call are replaced.
    pub fn reserve(&mut self, registry: &ScratchpadRegistry) {
        let size = registry.size();
        if self.buf.len() < size {
            tracing::trace!(size, "growing scratchpad");
            self.buf.resize(size, 0.);
        }

        self.grants.clear();
        let mut start = 0;
        for &(key, len) in registry.entries() {
            self.grants.insert(key, start..start + len);
            start += len;
        }
    }

    /// Total number of elements of backing storage.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Return the region for `key` booked in `registry`.
    ///
    /// The result has exactly the booked length. Fails if `registry` has no
    /// booking for `key`, or if the scratchpad was reserved for a different
    /// registry and its region for `key` is shorter than the booking.
    pub fn get(
        &mut self,
        registry: &ScratchpadRegistry,
        key: ScratchpadKey,
    ) -> Result<&mut [f32], OpError> {
        let range = self.region(registry, key)?;
        Ok(&mut self.buf[range])
    }

    /// Return the regions for several distinct keys at once.
    ///
    /// Each region is checked against `registry` as in [`Scratchpad::get`].
    pub fn get_many<const N: usize>(
        &mut self,
        registry: &ScratchpadRegistry,
        keys: [ScratchpadKey; N],
    ) -> Result<[&mut [f32]; N], OpError> {
        let mut order = SmallVec::<[(usize, Range<usize>); 8]>::new();
        for (i, &key) in keys.iter().enumerate() {
            order.push((i, self.region(registry, key)?));
        }
        order.sort_by_key(|(_, range)| range.start);

        let mut regions: [Option<&mut [f32]>; N] = std::array::from_fn(|_| None);
        let mut rest: &mut [f32] = &mut self.buf;
        let mut rest_start = 0;
        for (i, range) in order {
            if range.start < rest_start {
                return Err(OpError::InvalidValue("scratchpad keys must be distinct"));
            }
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(range.start - rest_start);
            let (region, tail) = tail.split_at_mut(range.len());
            regions[i] = Some(region);
            rest = tail;
            rest_start = range.end;
        }

        Ok(regions.map(|region| region.unwrap_or_default()))
    }

    /// Return the part of `buf` to use for `key`, truncated to the length
    /// booked in `registry`.
    fn region(
        &self,
        registry: &ScratchpadRegistry,
        key: ScratchpadKey,
    ) -> Result<Range<usize>, OpError> {
        let booked = registry
            .len_of(key)
            .ok_or(OpError::MissingScratchpad(key))?;
        let granted = self
            .grants
            .get(&key)
            .ok_or(OpError::MissingScratchpad(key))?;
        if granted.len() < booked {
            return Err(OpError::ScratchpadTooShort(key));
        }
        Ok(granted.start..granted.start + booked)
    }
}
