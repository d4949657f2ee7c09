//! Sparse Distributed Representation (SDR) implementation.
//!
//! An SDR is a data structure representing a group of boolean values (bits).
//! It can be represented in three formats:
//! - **Dense**: a contiguous array of all bits
//! - **Sparse**: a list of flat indices of active (true) bits
//! - **Coordinate**: one list of coordinates per dimension
//!
//! The SDR lazily converts between formats and caches the results. Any
//! mutation invalidates the caches of the other formats and notifies
//! registered observers (proxies, metrics, user callbacks).

use crate::error::{Result, VelesError};
use crate::types::{ElemDense, ElemSparse, Real, Real64, ScalarElem, UInt};
use crate::utils::Random;

use std::cell::{RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

/// Type alias for dense SDR data (array of bytes, 0 or 1).
pub type SdrDense = Vec<ElemDense>;

/// Type alias for sparse SDR data (flat indices of active bits).
pub type SdrSparse = Vec<ElemSparse>;

/// Type alias for coordinate SDR data (coordinates per dimension).
pub type SdrCoordinate = Vec<Vec<UInt>>;

/// Callback function type for SDR value changes.
pub type SdrCallback = Box<dyn Fn()>;

// ============================================================================
// Format conversions
// ============================================================================

pub(crate) fn dense_to_sparse(dense: &[ElemDense]) -> SdrSparse {
    dense
        .iter()
        .enumerate()
        .filter(|(_, &v)| v != 0)
        .map(|(i, _)| i as ElemSparse)
        .collect()
}

pub(crate) fn sparse_to_dense(sparse: &[ElemSparse], size: usize) -> SdrDense {
    let mut dense = vec![0u8; size];
    for &idx in sparse {
        dense[idx as usize] = 1;
    }
    dense
}

/// Converts flat indices to per-dimension coordinates, preserving order.
pub(crate) fn sparse_to_coordinates(sparse: &[ElemSparse], dimensions: &[UInt]) -> SdrCoordinate {
    let num_dims = dimensions.len();
    let mut coordinates: SdrCoordinate = vec![Vec::with_capacity(sparse.len()); num_dims];
    let mut point = vec![0u32; num_dims];

    for &flat_idx in sparse {
        let mut idx = flat_idx as usize;
        for dim in (0..num_dims).rev() {
            let dim_size = dimensions[dim] as usize;
            point[dim] = (idx % dim_size) as UInt;
            idx /= dim_size;
        }
        for (dim, &coord) in point.iter().enumerate() {
            coordinates[dim].push(coord);
        }
    }

    coordinates
}

/// Converts per-dimension coordinates to flat indices, preserving order.
pub(crate) fn coordinates_to_sparse(coordinates: &SdrCoordinate, dimensions: &[UInt]) -> SdrSparse {
    if coordinates.is_empty() || coordinates[0].is_empty() {
        return Vec::new();
    }

    let num_points = coordinates[0].len();
    let mut sparse = Vec::with_capacity(num_points);

    for i in 0..num_points {
        let mut flat_idx: usize = 0;
        let mut multiplier: usize = 1;

        for dim in (0..dimensions.len()).rev() {
            flat_idx += coordinates[dim][i] as usize * multiplier;
            multiplier *= dimensions[dim] as usize;
        }

        sparse.push(flat_idx as ElemSparse);
    }

    sparse
}

// ============================================================================
// Shared cache and observer plumbing
// ============================================================================

/// Cached representations with per-view validity (`None` = invalid).
#[derive(Default)]
pub(crate) struct SdrCache {
    pub(crate) dense: Option<SdrDense>,
    pub(crate) sparse: Option<SdrSparse>,
    pub(crate) coordinates: Option<SdrCoordinate>,
}

impl SdrCache {
    /// Computes the sparse view from whichever view is valid, without
    /// mutating the cache. `dimensions` interprets a coordinate view.
    pub(crate) fn sparse_value(&self, dimensions: &[UInt]) -> Option<SdrSparse> {
        if let Some(ref sparse) = self.sparse {
            Some(sparse.clone())
        } else if let Some(ref dense) = self.dense {
            Some(dense_to_sparse(dense))
        } else {
            self.coordinates
                .as_ref()
                .map(|coords| coordinates_to_sparse(coords, dimensions))
        }
    }
}

pub(crate) type CallbackList = Vec<Option<SdrCallback>>;

pub(crate) fn fire_callbacks(list: &RefCell<CallbackList>) {
    let callbacks = list.borrow();
    for callback in callbacks.iter().flatten() {
        callback();
    }
}

pub(crate) fn push_callback(list: &RefCell<CallbackList>, callback: SdrCallback) -> usize {
    let mut callbacks = list.borrow_mut();
    let handle = callbacks.len();
    callbacks.push(Some(callback));
    handle
}

pub(crate) fn take_callback(list: &RefCell<CallbackList>, handle: usize) -> Result<()> {
    let mut callbacks = list.borrow_mut();
    if handle >= callbacks.len() || callbacks[handle].is_none() {
        return Err(VelesError::InvalidState(format!(
            "unknown callback handle {handle}"
        )));
    }
    callbacks[handle] = None;
    Ok(())
}

/// A non-owning handle onto one SDR's value and observer list.
///
/// Proxies and metrics hold chains of these; a failed upgrade means the
/// referenced SDR (or an intermediate proxy) has been destroyed.
#[derive(Clone)]
pub(crate) struct SdrLink {
    pub(crate) dimensions: Vec<UInt>,
    pub(crate) cache: Weak<RefCell<SdrCache>>,
    pub(crate) callbacks: Weak<RefCell<CallbackList>>,
}

/// Reads the current sparse value through a chain of links, nearest first.
///
/// Every link must still be alive; the value comes from the nearest link
/// holding a valid view, with coordinate views interpreted under that
/// link's own dimensions.
pub(crate) fn chain_sparse(chain: &[SdrLink]) -> Result<SdrSparse> {
    let mut caches = Vec::with_capacity(chain.len());
    for link in chain {
        let cache = link.cache.upgrade().ok_or_else(|| {
            VelesError::InvalidState("read through a destroyed SDR".to_string())
        })?;
        caches.push(cache);
    }

    for (link, cache) in chain.iter().zip(&caches) {
        if let Some(sparse) = cache.borrow().sparse_value(&link.dimensions) {
            return Ok(sparse);
        }
    }

    Ok(Vec::new())
}

// ============================================================================
// Sdr
// ============================================================================

/// Sparse Distributed Representation.
///
/// A binary tensor where typically only a small percentage of bits are
/// active. All three formats (dense, sparse, coordinates) describe the same
/// bit set and are materialized lazily.
///
/// # Example
///
/// ```rust
/// use veles::types::Sdr;
///
/// let mut sdr = Sdr::new(&[10, 10]).unwrap();
/// sdr.set_sparse(&[1, 4, 8, 15, 42]).unwrap();
///
/// assert_eq!(sdr.get_sum(), 5);
/// let dense = sdr.get_dense();
/// let coords = sdr.get_coordinates();
/// ```
pub struct Sdr {
    /// Dimensions of the SDR.
    dimensions: Vec<UInt>,

    /// Total size (product of dimensions).
    size: usize,

    /// Cached representations. Shared so proxies and metrics can observe
    /// the value (and this SDR's destruction) through weak handles.
    cache: Rc<RefCell<SdrCache>>,

    /// Callbacks to notify on value changes.
    callbacks: Rc<RefCell<CallbackList>>,

    /// Callbacks to notify on destruction.
    destroy_callbacks: RefCell<CallbackList>,
}

#[cfg(feature = "serde")]
mod serde_impl {
    use super::*;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct SdrState {
        dimensions: Vec<UInt>,
        sparse: Vec<ElemSparse>,
    }

    impl Serialize for Sdr {
        fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            SdrState {
                dimensions: self.dimensions.clone(),
                sparse: self.get_sparse(),
            }
            .serialize(serializer)
        }
    }

    impl<'de> Deserialize<'de> for Sdr {
        fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let state = SdrState::deserialize(deserializer)?;
            let mut sdr = Sdr::new(&state.dimensions).map_err(serde::de::Error::custom)?;
            sdr.set_sparse_unchecked(state.sparse);
            Ok(sdr)
        }
    }
}

impl Sdr {
    /// Creates a new SDR with the given dimensions, initialized to all
    /// zeros (all three views valid).
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidDimensions`] if `dimensions` is empty
    /// or contains a zero.
    pub fn new(dimensions: &[UInt]) -> Result<Self> {
        if dimensions.is_empty() {
            return Err(VelesError::InvalidDimensions(
                "dimensions cannot be empty".to_string(),
            ));
        }
        if let Some(i) = dimensions.iter().position(|&d| d == 0) {
            return Err(VelesError::InvalidDimensions(format!(
                "dimension {i} is zero"
            )));
        }

        let size: usize = dimensions.iter().map(|&d| d as usize).product();

        let sdr = Self {
            dimensions: dimensions.to_vec(),
            size,
            cache: Rc::new(RefCell::new(SdrCache::default())),
            callbacks: Rc::new(RefCell::new(Vec::new())),
            destroy_callbacks: RefCell::new(Vec::new()),
        };
        sdr.fill_zero();
        Ok(sdr)
    }

    /// Returns the dimensions of this SDR.
    #[inline]
    #[must_use]
    pub fn dimensions(&self) -> &[UInt] {
        &self.dimensions
    }

    /// Returns the total number of bits in the SDR.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of dimensions.
    #[inline]
    #[must_use]
    pub fn num_dimensions(&self) -> usize {
        self.dimensions.len()
    }

    fn fill_zero(&self) {
        let mut cache = self.cache.borrow_mut();
        cache.dense = Some(vec![0; self.size]);
        cache.sparse = Some(Vec::new());
        cache.coordinates = Some(vec![Vec::new(); self.dimensions.len()]);
    }

    /// Sets all bits to zero.
    pub fn zero(&mut self) {
        self.fill_zero();
        self.do_callbacks();
    }

    /// Invokes all registered change callbacks, in registration order.
    ///
    /// Called after the cache is consistent; the cache borrow is released
    /// first so callbacks may read (and reentrantly mutate) the value.
    fn do_callbacks(&self) {
        fire_callbacks(&self.callbacks);
    }

    /// Runs `f` against the raw cache, exposing which views are valid.
    /// Used by the stream encoder to persist the current view untouched.
    pub(crate) fn with_cache<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&SdrCache) -> R,
    {
        let cache = self.cache.borrow();
        f(&cache)
    }

    pub(crate) fn link(&self) -> SdrLink {
        SdrLink {
            dimensions: self.dimensions.clone(),
            cache: Rc::downgrade(&self.cache),
            callbacks: Rc::downgrade(&self.callbacks),
        }
    }

    pub(crate) fn observer_chain(&self) -> Vec<SdrLink> {
        vec![self.link()]
    }

    // ========================================================================
    // Dense format operations
    // ========================================================================

    /// Sets the SDR value from a dense array. Non-zero bytes are truthy.
    ///
    /// # Errors
    ///
    /// Returns an error if the data length doesn't match the SDR size.
    pub fn set_dense(&mut self, data: &[ElemDense]) -> Result<()> {
        self.set_dense_owned(data.to_vec())
    }

    /// Sets the SDR value from a dense array, consuming it to avoid copying.
    pub fn set_dense_owned(&mut self, data: SdrDense) -> Result<()> {
        if data.len() != self.size {
            return Err(VelesError::DimensionMismatch {
                expected: vec![self.size as u32],
                actual: vec![data.len() as u32],
            });
        }

        let mut cache = self.cache.borrow_mut();
        cache.dense = Some(data);
        cache.sparse = None;
        cache.coordinates = None;
        drop(cache);

        self.do_callbacks();
        Ok(())
    }

    /// Sets the SDR value from a slice of arbitrary numeric scalars.
    ///
    /// Each element is converted to a canonical dense byte at this boundary
    /// (non-zero is truthy); the SDR always stores bytes.
    pub fn set_dense_scalars<T: ScalarElem>(&mut self, data: &[T]) -> Result<()> {
        if data.len() != self.size {
            return Err(VelesError::DimensionMismatch {
                expected: vec![self.size as u32],
                actual: vec![data.len() as u32],
            });
        }
        self.set_dense_owned(data.iter().map(|v| v.as_bit()).collect())
    }

    /// Gets the dense representation, computing it from another view if
    /// needed. The result is cached until the next mutation.
    #[must_use]
    pub fn get_dense(&self) -> SdrDense {
        self.with_dense(Clone::clone)
    }

    /// Runs `f` against a reference to the dense representation.
    pub fn with_dense<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&SdrDense) -> R,
    {
        self.materialize_dense();
        let cache = self.cache.borrow();
        f(cache.dense.as_ref().unwrap_or(&Vec::new()))
    }

    fn materialize_dense(&self) {
        let mut cache = self.cache.borrow_mut();
        if cache.dense.is_some() {
            return;
        }
        let sparse = cache
            .sparse_value(&self.dimensions)
            .unwrap_or_default();
        cache.dense = Some(sparse_to_dense(&sparse, self.size));
        if cache.sparse.is_none() {
            cache.sparse = Some(sparse);
        }
    }

    /// Returns a mutable reference to the owned dense buffer.
    ///
    /// Callers may edit the buffer in place and commit with
    /// [`Sdr::set_dense_inplace`], which skips the copy a regular setter
    /// would make. Until the commit, the other views are stale.
    pub fn get_dense_mut(&mut self) -> RefMut<'_, SdrDense> {
        self.materialize_dense();
        RefMut::map(self.cache.borrow_mut(), |c| {
            c.dense.get_or_insert_with(Vec::new)
        })
    }

    /// Commits an in-place edit of the dense buffer: invalidates the other
    /// views and fires change notifications.
    pub fn set_dense_inplace(&mut self) {
        let mut cache = self.cache.borrow_mut();
        cache.sparse = None;
        cache.coordinates = None;
        drop(cache);
        self.do_callbacks();
    }

    // ========================================================================
    // Sparse format operations
    // ========================================================================

    /// Sets the SDR value from flat indices of active bits.
    ///
    /// Indices may be in any order; the container returns them in the
    /// order stored. Indices must be distinct and within bounds.
    ///
    /// # Errors
    ///
    /// Returns an error if any index is out of bounds.
    pub fn set_sparse(&mut self, indices: &[ElemSparse]) -> Result<()> {
        self.set_sparse_owned(indices.to_vec())
    }

    /// Sets the SDR value from flat indices, consuming to avoid copying.
    pub fn set_sparse_owned(&mut self, indices: SdrSparse) -> Result<()> {
        self.validate_sparse(&indices)?;

        let mut cache = self.cache.borrow_mut();
        cache.sparse = Some(indices);
        cache.dense = None;
        cache.coordinates = None;
        drop(cache);

        self.do_callbacks();
        Ok(())
    }

    /// Sets sparse indices without validation (for internal use).
    pub(crate) fn set_sparse_unchecked(&mut self, indices: SdrSparse) {
        let mut cache = self.cache.borrow_mut();
        cache.sparse = Some(indices);
        cache.dense = None;
        cache.coordinates = None;
        drop(cache);

        self.do_callbacks();
    }

    fn validate_sparse(&self, indices: &[ElemSparse]) -> Result<()> {
        for &idx in indices {
            if idx as usize >= self.size {
                return Err(VelesError::IndexOutOfBounds {
                    index: idx as usize,
                    size: self.size,
                });
            }
        }
        Ok(())
    }

    /// Gets the sparse representation (flat indices in stored order).
    #[must_use]
    pub fn get_sparse(&self) -> SdrSparse {
        self.with_sparse(Clone::clone)
    }

    /// Runs `f` against a reference to the sparse representation.
    pub fn with_sparse<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&SdrSparse) -> R,
    {
        self.materialize_sparse();
        let cache = self.cache.borrow();
        f(cache.sparse.as_ref().unwrap_or(&Vec::new()))
    }

    fn materialize_sparse(&self) {
        let mut cache = self.cache.borrow_mut();
        if cache.sparse.is_some() {
            return;
        }
        let sparse = cache.sparse_value(&self.dimensions).unwrap_or_default();
        cache.sparse = Some(sparse);
    }

    /// Returns a mutable reference to the owned sparse buffer, for in-place
    /// edits committed with [`Sdr::set_sparse_inplace`].
    pub fn get_sparse_mut(&mut self) -> RefMut<'_, SdrSparse> {
        self.materialize_sparse();
        RefMut::map(self.cache.borrow_mut(), |c| {
            c.sparse.get_or_insert_with(Vec::new)
        })
    }

    /// Commits an in-place edit of the sparse buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer now holds an out-of-bounds index; the
    /// edit is rolled back to an empty value in that case.
    pub fn set_sparse_inplace(&mut self) -> Result<()> {
        let out_of_bounds = {
            let cache = self.cache.borrow();
            cache.sparse.as_ref().and_then(|sparse| {
                sparse.iter().find(|&&idx| idx as usize >= self.size).copied()
            })
        };
        if let Some(idx) = out_of_bounds {
            self.fill_zero();
            return Err(VelesError::IndexOutOfBounds {
                index: idx as usize,
                size: self.size,
            });
        }

        let mut cache = self.cache.borrow_mut();
        cache.dense = None;
        cache.coordinates = None;
        drop(cache);
        self.do_callbacks();
        Ok(())
    }

    // ========================================================================
    // Coordinate format operations
    // ========================================================================

    /// Sets the SDR value from per-dimension coordinates.
    ///
    /// # Errors
    ///
    /// Returns an error on rank mismatch, ragged inner lengths or
    /// out-of-range coordinates.
    pub fn set_coordinates(&mut self, coordinates: &SdrCoordinate) -> Result<()> {
        self.validate_coordinates(coordinates)?;

        let mut cache = self.cache.borrow_mut();
        cache.coordinates = Some(coordinates.clone());
        cache.dense = None;
        cache.sparse = None;
        drop(cache);

        self.do_callbacks();
        Ok(())
    }

    fn validate_coordinates(&self, coordinates: &SdrCoordinate) -> Result<()> {
        if coordinates.len() != self.dimensions.len() {
            return Err(VelesError::InvalidDimensions(format!(
                "expected {} coordinate axes, got {}",
                self.dimensions.len(),
                coordinates.len()
            )));
        }

        let len = coordinates[0].len();
        for (i, coords) in coordinates.iter().enumerate() {
            if coords.len() != len {
                return Err(VelesError::InvalidSdrData(format!(
                    "coordinate axis {i} has length {}, expected {len}",
                    coords.len()
                )));
            }
        }

        for (coords, &dim_size) in coordinates.iter().zip(&self.dimensions) {
            for &c in coords {
                if c >= dim_size {
                    return Err(VelesError::IndexOutOfBounds {
                        index: c as usize,
                        size: dim_size as usize,
                    });
                }
            }
        }

        Ok(())
    }

    /// Gets the coordinate representation.
    #[must_use]
    pub fn get_coordinates(&self) -> SdrCoordinate {
        self.with_coordinates(Clone::clone)
    }

    /// Runs `f` against a reference to the coordinate representation.
    pub fn with_coordinates<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&SdrCoordinate) -> R,
    {
        self.materialize_coordinates();
        let cache = self.cache.borrow();
        f(cache.coordinates.as_ref().unwrap_or(&Vec::new()))
    }

    fn materialize_coordinates(&self) {
        let mut cache = self.cache.borrow_mut();
        if cache.coordinates.is_some() {
            return;
        }
        let sparse = cache.sparse_value(&self.dimensions).unwrap_or_default();
        cache.coordinates = Some(sparse_to_coordinates(&sparse, &self.dimensions));
        if cache.sparse.is_none() {
            cache.sparse = Some(sparse);
        }
    }

    /// Returns a mutable reference to the owned coordinate buffers, for
    /// in-place edits committed with [`Sdr::set_coordinates_inplace`].
    pub fn get_coordinates_mut(&mut self) -> RefMut<'_, SdrCoordinate> {
        self.materialize_coordinates();
        RefMut::map(self.cache.borrow_mut(), |c| {
            c.coordinates.get_or_insert_with(Vec::new)
        })
    }

    /// Commits an in-place edit of the coordinate buffers.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffers are invalid for this SDR's shape;
    /// the value is reset to zero in that case.
    pub fn set_coordinates_inplace(&mut self) -> Result<()> {
        let invalid = {
            let cache = self.cache.borrow();
            cache
                .coordinates
                .as_ref()
                .and_then(|coords| self.validate_coordinates(coords).err())
        };
        if let Some(e) = invalid {
            self.fill_zero();
            return Err(e);
        }

        let mut cache = self.cache.borrow_mut();
        cache.dense = None;
        cache.sparse = None;
        drop(cache);
        self.do_callbacks();
        Ok(())
    }

    // ========================================================================
    // Value queries
    // ========================================================================

    /// Returns the bit at the given coordinates.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinate rank does not match or a
    /// coordinate is out of range.
    pub fn at(&self, coordinates: &[UInt]) -> Result<bool> {
        if coordinates.len() != self.dimensions.len() {
            return Err(VelesError::InvalidDimensions(format!(
                "expected {} coordinates, got {}",
                self.dimensions.len(),
                coordinates.len()
            )));
        }
        for (&c, &d) in coordinates.iter().zip(&self.dimensions) {
            if c >= d {
                return Err(VelesError::IndexOutOfBounds {
                    index: c as usize,
                    size: d as usize,
                });
            }
        }

        let flat = crate::utils::Topology::coordinates_to_index(coordinates, &self.dimensions);
        Ok(self.with_dense(|dense| dense[flat] != 0))
    }

    /// Returns the number of active (true) bits.
    #[must_use]
    pub fn get_sum(&self) -> usize {
        self.with_sparse(Vec::len)
    }

    /// Returns the sparsity (fraction of active bits).
    #[must_use]
    pub fn get_sparsity(&self) -> Real {
        if self.size == 0 {
            return 0.0;
        }
        self.get_sum() as Real / self.size as Real
    }

    /// Returns the number of bits active in both SDRs.
    ///
    /// # Errors
    ///
    /// Returns an error if the sizes differ.
    pub fn get_overlap(&self, other: &Sdr) -> Result<usize> {
        if self.size != other.size {
            return Err(VelesError::DimensionMismatch {
                expected: vec![self.size as u32],
                actual: vec![other.size as u32],
            });
        }
        Ok(self.with_sparse(|a| other.with_sparse(|b| sparse_overlap(a, b))))
    }

    // ========================================================================
    // SDR operations
    // ========================================================================

    /// Copies the value from another SDR, preserving which view is valid.
    ///
    /// # Errors
    ///
    /// Returns an error if the sizes differ.
    pub fn set_sdr(&mut self, other: &Sdr) -> Result<()> {
        if self.size != other.size {
            return Err(VelesError::DimensionMismatch {
                expected: vec![self.size as u32],
                actual: vec![other.size as u32],
            });
        }

        let other_cache = other.cache.borrow();
        let mut cache = self.cache.borrow_mut();
        if let Some(ref dense) = other_cache.dense {
            cache.dense = Some(dense.clone());
            cache.sparse = None;
            cache.coordinates = None;
        } else if let Some(ref sparse) = other_cache.sparse {
            cache.sparse = Some(sparse.clone());
            cache.dense = None;
            cache.coordinates = None;
        } else if let Some(ref coords) = other_cache.coordinates {
            if self.dimensions == other.dimensions {
                cache.coordinates = Some(coords.clone());
                cache.sparse = None;
            } else {
                // Re-base a coordinate view across different shapes.
                cache.sparse = Some(coordinates_to_sparse(coords, &other.dimensions));
                cache.coordinates = None;
            }
            cache.dense = None;
        }
        drop(cache);
        drop(other_cache);

        self.do_callbacks();
        Ok(())
    }

    /// Randomizes the SDR to exactly `round(sparsity * size)` uniformly
    /// chosen active bits. Deterministic given the generator state.
    pub fn randomize(&mut self, sparsity: Real, rng: &mut Random) {
        let num_active = (Real64::from(sparsity) * self.size as Real64).round() as usize;
        let num_active = num_active.min(self.size);

        if num_active == 0 {
            self.zero();
            return;
        }

        let mut sparse: SdrSparse = rng
            .sample_indices(self.size, num_active)
            .into_iter()
            .map(|i| i as ElemSparse)
            .collect();
        sparse.sort_unstable();

        self.set_sparse_unchecked(sparse);
    }

    /// Moves a fraction of the active bits to uniformly chosen inactive
    /// positions, keeping the total count constant.
    ///
    /// After the call, `overlap(before, after) == sum - round(fraction * sum)`.
    pub fn add_noise(&mut self, fraction: Real, rng: &mut Random) {
        let sparse = self.get_sparse();
        let num_active = sparse.len();

        if num_active == 0 || fraction <= 0.0 {
            return;
        }

        let num_to_flip =
            (Real64::from(fraction) * num_active as Real64).round() as usize;
        if num_to_flip == 0 {
            return;
        }

        let turn_off = rng.sample(sparse.clone(), num_to_flip);

        let active_set: std::collections::HashSet<_> = sparse.iter().copied().collect();
        let inactive: Vec<ElemSparse> = (0..self.size as ElemSparse)
            .filter(|i| !active_set.contains(i))
            .collect();
        let turn_on = rng.sample(inactive, num_to_flip);

        let turn_off_set: std::collections::HashSet<_> = turn_off.iter().copied().collect();
        let mut new_sparse: SdrSparse = sparse
            .into_iter()
            .filter(|i| !turn_off_set.contains(i))
            .chain(turn_on)
            .collect();
        new_sparse.sort_unstable();

        self.set_sparse_unchecked(new_sparse);
    }

    /// Computes the intersection of two SDRs into this SDR.
    ///
    /// # Errors
    ///
    /// Returns an error if dimensions don't match.
    pub fn intersection(&mut self, a: &Sdr, b: &Sdr) -> Result<()> {
        self.check_same_dimensions(a)?;
        self.check_same_dimensions(b)?;

        let mut sparse_a = a.get_sparse();
        let mut sparse_b = b.get_sparse();
        sparse_a.sort_unstable();
        sparse_b.sort_unstable();

        let mut result = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < sparse_a.len() && j < sparse_b.len() {
            match sparse_a[i].cmp(&sparse_b[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    result.push(sparse_a[i]);
                    i += 1;
                    j += 1;
                }
            }
        }

        self.set_sparse_unchecked(result);
        Ok(())
    }

    /// Computes the union of two SDRs into this SDR.
    ///
    /// # Errors
    ///
    /// Returns an error if dimensions don't match.
    pub fn set_union(&mut self, a: &Sdr, b: &Sdr) -> Result<()> {
        self.check_same_dimensions(a)?;
        self.check_same_dimensions(b)?;

        let mut union: SdrSparse = a.get_sparse();
        union.extend(b.get_sparse());
        union.sort_unstable();
        union.dedup();

        self.set_sparse_unchecked(union);
        Ok(())
    }

    /// Concatenates SDRs along the flattened axis into this SDR.
    ///
    /// # Errors
    ///
    /// Returns an error if the input sizes don't sum to this SDR's size.
    pub fn concatenate(&mut self, inputs: &[&Sdr]) -> Result<()> {
        if inputs.is_empty() {
            return Err(VelesError::InvalidParameter {
                name: "inputs",
                message: "cannot concatenate an empty list".to_string(),
            });
        }

        let mut result = Vec::new();
        let mut offset: usize = 0;
        for input in inputs {
            for idx in input.get_sparse() {
                result.push((idx as usize + offset) as ElemSparse);
            }
            offset += input.size();
        }

        if offset != self.size {
            return Err(VelesError::DimensionMismatch {
                expected: vec![self.size as u32],
                actual: vec![offset as u32],
            });
        }

        self.set_sparse_unchecked(result);
        Ok(())
    }

    fn check_same_dimensions(&self, other: &Sdr) -> Result<()> {
        if self.dimensions != other.dimensions {
            return Err(VelesError::DimensionMismatch {
                expected: self.dimensions.clone(),
                actual: other.dimensions.clone(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Adds a callback invoked after every value change.
    ///
    /// Returns a handle for [`Sdr::remove_callback`]. Handles are
    /// per-SDR; cloning an SDR does not copy its callbacks.
    pub fn add_callback(&self, callback: SdrCallback) -> usize {
        push_callback(&self.callbacks, callback)
    }

    /// Removes a change callback by its handle.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidState`] for an unknown handle.
    pub fn remove_callback(&self, handle: usize) -> Result<()> {
        take_callback(&self.callbacks, handle)
    }

    /// Adds a callback invoked when the SDR is destroyed.
    pub fn add_destroy_callback(&self, callback: SdrCallback) -> usize {
        push_callback(&self.destroy_callbacks, callback)
    }

    /// Removes a destroy callback by its handle.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidState`] for an unknown handle.
    pub fn remove_destroy_callback(&self, handle: usize) -> Result<()> {
        take_callback(&self.destroy_callbacks, handle)
    }
}

pub(crate) fn sparse_overlap(a: &[ElemSparse], b: &[ElemSparse]) -> usize {
    let mut a_sorted = a.to_vec();
    let mut b_sorted = b.to_vec();
    a_sorted.sort_unstable();
    b_sorted.sort_unstable();

    let mut count = 0;
    let (mut i, mut j) = (0, 0);
    while i < a_sorted.len() && j < b_sorted.len() {
        match a_sorted[i].cmp(&b_sorted[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                count += 1;
                i += 1;
                j += 1;
            }
        }
    }
    count
}

impl Clone for Sdr {
    fn clone(&self) -> Self {
        let new_sdr = Self {
            dimensions: self.dimensions.clone(),
            size: self.size,
            cache: Rc::new(RefCell::new(SdrCache::default())),
            callbacks: Rc::new(RefCell::new(Vec::new())),
            destroy_callbacks: RefCell::new(Vec::new()),
        };

        // Copy the cheapest representation available; observers stay behind.
        let cache = self.cache.borrow();
        let mut new_cache = new_sdr.cache.borrow_mut();
        if let Some(ref sparse) = cache.sparse {
            new_cache.sparse = Some(sparse.clone());
        } else if let Some(ref dense) = cache.dense {
            new_cache.dense = Some(dense.clone());
        } else if let Some(ref coords) = cache.coordinates {
            new_cache.coordinates = Some(coords.clone());
        }
        drop(new_cache);
        drop(cache);

        new_sdr
    }
}

impl PartialEq for Sdr {
    fn eq(&self, other: &Self) -> bool {
        if self.dimensions != other.dimensions {
            return false;
        }
        let mut a = self.get_sparse();
        let mut b = other.get_sparse();
        a.sort_unstable();
        b.sort_unstable();
        a == b
    }
}

impl Eq for Sdr {}

impl fmt::Debug for Sdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SDR({:?}) {:?}", self.dimensions, self.get_sparse())
    }
}

impl fmt::Display for Sdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SDR( ")?;
        for (i, dim) in self.dimensions.iter().enumerate() {
            write!(f, "{dim}")?;
            if i + 1 != self.dimensions.len() {
                write!(f, ", ")?;
            }
        }
        write!(f, " ) ")?;

        let sparse = self.get_sparse();
        for (i, idx) in sparse.iter().enumerate() {
            write!(f, "{idx}")?;
            if i + 1 != sparse.len() {
                write!(f, ", ")?;
            }
        }
        Ok(())
    }
}

impl Drop for Sdr {
    fn drop(&mut self) {
        fire_callbacks(&self.destroy_callbacks);
    }
}

impl crate::serialization::StreamSerializable for Sdr {
    fn save_stream<W: std::io::Write>(&self, writer: &mut W) -> Result<()> {
        use crate::serialization::{wire, SDR_STREAM_VERSION};

        wire::write_tag(writer, "SDR")?;
        wire::write_u16_be(writer, SDR_STREAM_VERSION)?;
        wire::write_u32_be(writer, self.dimensions.len() as u32)?;
        for &dim in &self.dimensions {
            wire::write_u32_be(writer, dim)?;
        }

        // Persist whichever view is valid so loading restores the same
        // validity, checked in the same priority order as set_sdr.
        self.with_cache(|cache| {
            if let Some(ref dense) = cache.dense {
                wire::write_u8(writer, 0)?;
                wire::write_bytes(writer, dense)
            } else if let Some(ref sparse) = cache.sparse {
                wire::write_u8(writer, 1)?;
                wire::write_u32_be(writer, sparse.len() as u32)?;
                for &idx in sparse {
                    wire::write_u32_be(writer, idx)?;
                }
                Ok(())
            } else if let Some(ref coords) = cache.coordinates {
                wire::write_u8(writer, 2)?;
                let num_points = coords.first().map_or(0, Vec::len);
                wire::write_u32_be(writer, num_points as u32)?;
                for axis in coords {
                    for &coord in axis {
                        wire::write_u32_be(writer, coord)?;
                    }
                }
                Ok(())
            } else {
                // An SDR always holds at least one valid view; encode the
                // empty sparse form if that invariant is ever violated.
                wire::write_u8(writer, 1)?;
                wire::write_u32_be(writer, 0)
            }
        })
    }

    fn load_stream<R: std::io::Read>(reader: &mut R) -> Result<Self> {
        use crate::serialization::{wire, SDR_STREAM_VERSION};

        wire::read_tag(reader, "SDR")?;
        let version = wire::read_u16_be(reader)?;
        if version != SDR_STREAM_VERSION {
            return Err(VelesError::UnsupportedVersion { found: version });
        }

        let rank = wire::read_u32_be(reader)? as usize;
        if rank == 0 || rank > 64 {
            return Err(VelesError::SerializationError {
                message: format!("implausible SDR rank {rank}"),
            });
        }
        let mut dimensions = Vec::with_capacity(rank);
        for _ in 0..rank {
            dimensions.push(wire::read_u32_be(reader)?);
        }
        let mut sdr = Sdr::new(&dimensions)?;

        let view_tag = wire::read_u8(reader)?;
        match view_tag {
            0 => {
                let dense = wire::read_bytes(reader, sdr.size())?;
                sdr.set_dense_owned(dense)?;
            }
            1 => {
                let count = wire::read_u32_be(reader)? as usize;
                if count > sdr.size() {
                    return Err(VelesError::SerializationError {
                        message: format!("sparse count {count} exceeds SDR size"),
                    });
                }
                let mut sparse = Vec::with_capacity(count);
                for _ in 0..count {
                    sparse.push(wire::read_u32_be(reader)?);
                }
                sdr.set_sparse_owned(sparse)?;
            }
            2 => {
                let num_points = wire::read_u32_be(reader)? as usize;
                if num_points > sdr.size() {
                    return Err(VelesError::SerializationError {
                        message: format!("coordinate count {num_points} exceeds SDR size"),
                    });
                }
                let mut coordinates = vec![Vec::with_capacity(num_points); rank];
                for axis in &mut coordinates {
                    for _ in 0..num_points {
                        axis.push(wire::read_u32_be(reader)?);
                    }
                }
                sdr.set_coordinates(&coordinates)?;
            }
            tag => {
                return Err(VelesError::SerializationError {
                    message: format!("unknown SDR view tag {tag}"),
                });
            }
        }

        Ok(sdr)
    }
}
