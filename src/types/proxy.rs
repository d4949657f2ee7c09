//! Read-only reshaped views over a parent SDR.
//!
//! A proxy presents a parent SDR under different dimensions of equal total
//! size. It owns no bits: reads forward to the nearest ancestor holding a
//! valid view, and parent mutations invalidate the proxy's local cache
//! through the parent's notification list. Proxies may be stacked into a
//! tree; destroying any node invalidates its whole subtree.

use crate::error::{Result, VelesError};
use crate::types::sdr::{
    chain_sparse, fire_callbacks, push_callback, sparse_to_coordinates, sparse_to_dense,
    take_callback, CallbackList, Sdr, SdrCache, SdrCallback, SdrCoordinate, SdrDense, SdrLink,
    SdrSparse,
};
use crate::types::{Real, UInt};
use crate::utils::Topology;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A read-only reshape of a parent [`Sdr`] (or of another proxy).
///
/// # Example
///
/// ```rust
/// use veles::types::{Sdr, SdrProxy};
///
/// let mut a = Sdr::new(&[4, 4]).unwrap();
/// a.set_coordinates(&vec![vec![1, 1, 2], vec![0, 1, 2]]).unwrap();
///
/// let b = SdrProxy::with_dimensions(&a, &[8, 2]).unwrap();
/// assert_eq!(b.get_coordinates().unwrap(), vec![vec![2, 2, 5], vec![0, 1, 0]]);
///
/// // The proxy tracks parent mutations.
/// a.set_sparse(&[0]).unwrap();
/// assert_eq!(b.get_sparse().unwrap(), vec![0]);
/// ```
pub struct SdrProxy {
    dimensions: Vec<UInt>,
    size: usize,

    /// Ancestor links, direct parent first, root last. Every read checks
    /// that the whole chain is still alive.
    ancestors: Vec<SdrLink>,

    /// Local cache of views under this proxy's dimensions, dropped on
    /// every parent mutation.
    cache: Rc<RefCell<SdrCache>>,

    /// Downstream observers: child proxies, metrics, user callbacks.
    callbacks: Rc<RefCell<CallbackList>>,

    /// Handle of the invalidation callback registered on the parent.
    parent_handle: usize,
}

impl SdrProxy {
    /// Creates a proxy with the same dimensions as the parent.
    #[must_use]
    pub fn new(parent: &Sdr) -> Self {
        Self::build(parent.observer_chain(), parent.dimensions().to_vec())
    }

    /// Creates a proxy presenting `parent` under new dimensions.
    ///
    /// # Errors
    ///
    /// Returns an error if the dimensions are empty, contain a zero, or
    /// their product differs from the parent's size.
    pub fn with_dimensions(parent: &Sdr, dimensions: &[UInt]) -> Result<Self> {
        Self::check_dimensions(dimensions, parent.size())?;
        Ok(Self::build(parent.observer_chain(), dimensions.to_vec()))
    }

    /// Creates a child proxy with the same dimensions as this proxy.
    #[must_use]
    pub fn child(&self) -> Self {
        Self::build(self.observer_chain(), self.dimensions.clone())
    }

    /// Creates a child proxy with new dimensions of equal total size.
    ///
    /// # Errors
    ///
    /// Returns an error if the dimensions are empty, contain a zero, or
    /// their product differs from this proxy's size.
    pub fn child_with_dimensions(&self, dimensions: &[UInt]) -> Result<Self> {
        Self::check_dimensions(dimensions, self.size)?;
        Ok(Self::build(self.observer_chain(), dimensions.to_vec()))
    }

    fn check_dimensions(dimensions: &[UInt], parent_size: usize) -> Result<()> {
        if dimensions.is_empty() || dimensions.contains(&0) {
            return Err(VelesError::InvalidDimensions(
                "proxy dimensions must be positive".to_string(),
            ));
        }
        let size: usize = dimensions.iter().map(|&d| d as usize).product();
        if size != parent_size {
            return Err(VelesError::DimensionMismatch {
                expected: vec![parent_size as u32],
                actual: vec![size as u32],
            });
        }
        Ok(())
    }

    /// `ancestors` is the parent's observer chain (parent link first); the
    /// parent is alive at this point, so registration cannot fail.
    fn build(ancestors: Vec<SdrLink>, dimensions: Vec<UInt>) -> Self {
        let size = dimensions.iter().map(|&d| d as usize).product();
        let cache = Rc::new(RefCell::new(SdrCache::default()));
        let callbacks: Rc<RefCell<CallbackList>> = Rc::new(RefCell::new(Vec::new()));

        let weak_cache = Rc::downgrade(&cache);
        let weak_callbacks = Rc::downgrade(&callbacks);
        let parent_handle = match ancestors[0].callbacks.upgrade() {
            Some(parent_callbacks) => push_callback(
                &parent_callbacks,
                Box::new(move || {
                    if let Some(cache) = weak_cache.upgrade() {
                        let mut cache = cache.borrow_mut();
                        cache.dense = None;
                        cache.sparse = None;
                        cache.coordinates = None;
                    }
                    if let Some(callbacks) = weak_callbacks.upgrade() {
                        fire_callbacks(&callbacks);
                    }
                }),
            ),
            None => 0,
        };

        Self {
            dimensions,
            size,
            ancestors,
            cache,
            callbacks,
            parent_handle,
        }
    }

    /// Returns the dimensions of this proxy.
    #[inline]
    #[must_use]
    pub fn dimensions(&self) -> &[UInt] {
        &self.dimensions
    }

    /// Returns the total number of bits.
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

    /// Returns whether the whole ancestor chain is still alive.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.ancestors.iter().all(|link| link.cache.upgrade().is_some())
    }

    fn link(&self) -> SdrLink {
        SdrLink {
            dimensions: self.dimensions.clone(),
            cache: Rc::downgrade(&self.cache),
            callbacks: Rc::downgrade(&self.callbacks),
        }
    }

    pub(crate) fn observer_chain(&self) -> Vec<SdrLink> {
        let mut chain = Vec::with_capacity(self.ancestors.len() + 1);
        chain.push(self.link());
        chain.extend(self.ancestors.iter().cloned());
        chain
    }

    /// Gets the sparse representation (flat indices), forwarding from the
    /// nearest ancestor with a valid view.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidState`] if any ancestor has been
    /// destroyed.
    pub fn get_sparse(&self) -> Result<SdrSparse> {
        let sparse = chain_sparse(&self.observer_chain())?;
        self.cache.borrow_mut().sparse = Some(sparse.clone());
        Ok(sparse)
    }

    /// Gets the dense representation under this proxy's dimensions.
    ///
    /// Dense storage is row-major, so the bytes are identical to the
    /// parent's; only the shape differs.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidState`] if any ancestor has been
    /// destroyed.
    pub fn get_dense(&self) -> Result<SdrDense> {
        {
            let cache = self.cache.borrow();
            if let Some(ref dense) = cache.dense {
                // Chain liveness still gates cached reads.
                return if self.is_attached() {
                    Ok(dense.clone())
                } else {
                    Err(VelesError::InvalidState(
                        "read through a destroyed SDR".to_string(),
                    ))
                };
            }
        }

        let dense = sparse_to_dense(&self.get_sparse()?, self.size);
        self.cache.borrow_mut().dense = Some(dense.clone());
        Ok(dense)
    }

    /// Gets the coordinate representation under this proxy's dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidState`] if any ancestor has been
    /// destroyed.
    pub fn get_coordinates(&self) -> Result<SdrCoordinate> {
        let coords = sparse_to_coordinates(&self.get_sparse()?, &self.dimensions);
        self.cache.borrow_mut().coordinates = Some(coords.clone());
        Ok(coords)
    }

    /// Returns the bit at the given coordinates.
    ///
    /// # Errors
    ///
    /// Fails on rank mismatch, out-of-range coordinates, or a destroyed
    /// ancestor.
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

        let flat = Topology::coordinates_to_index(coordinates, &self.dimensions) as u32;
        Ok(self.get_sparse()?.contains(&flat))
    }

    /// Returns the number of active bits.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidState`] if any ancestor has been
    /// destroyed.
    pub fn get_sum(&self) -> Result<usize> {
        Ok(self.get_sparse()?.len())
    }

    /// Returns the fraction of active bits.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidState`] if any ancestor has been
    /// destroyed.
    pub fn get_sparsity(&self) -> Result<Real> {
        if self.size == 0 {
            return Ok(0.0);
        }
        Ok(self.get_sum()? as Real / self.size as Real)
    }

    /// Adds a callback fired after every parent mutation.
    pub fn add_callback(&self, callback: SdrCallback) -> usize {
        push_callback(&self.callbacks, callback)
    }

    /// Removes a callback by its handle.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidState`] for an unknown handle.
    pub fn remove_callback(&self, handle: usize) -> Result<()> {
        take_callback(&self.callbacks, handle)
    }
}

impl Drop for SdrProxy {
    fn drop(&mut self) {
        if let Some(parent_callbacks) = self.ancestors[0].callbacks.upgrade() {
            let _ = take_callback(&parent_callbacks, self.parent_handle);
        }
    }
}

impl fmt::Debug for SdrProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdrProxy")
            .field("dimensions", &self.dimensions)
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reshape() {
        let mut a = Sdr::new(&[4, 4]).unwrap();
        a.set_coordinates(&vec![vec![1, 1, 2], vec![0, 1, 2]]).unwrap();

        let b = SdrProxy::with_dimensions(&a, &[8, 2]).unwrap();
        assert_eq!(b.get_sparse().unwrap(), vec![4, 5, 10]);
        assert_eq!(
            b.get_coordinates().unwrap(),
            vec![vec![2, 2, 5], vec![0, 1, 0]]
        );
        assert_eq!(b.get_dense().unwrap(), a.get_dense());
    }

    #[test]
    fn test_same_dimensions_default() {
        let mut a = Sdr::new(&[3, 3]).unwrap();
        a.set_sparse(&[1, 4, 8]).unwrap();

        let b = SdrProxy::new(&a);
        assert_eq!(b.dimensions(), a.dimensions());
        assert_eq!(b.get_sparse().unwrap(), vec![1, 4, 8]);
    }

    #[test]
    fn test_dimension_validation() {
        let a = Sdr::new(&[4, 4]).unwrap();
        assert!(SdrProxy::with_dimensions(&a, &[5, 3]).is_err());
        assert!(SdrProxy::with_dimensions(&a, &[]).is_err());
        assert!(SdrProxy::with_dimensions(&a, &[16, 0]).is_err());
    }

    #[test]
    fn test_tracks_parent_mutations() {
        let mut a = Sdr::new(&[16]).unwrap();
        let b = SdrProxy::with_dimensions(&a, &[4, 4]).unwrap();

        assert_eq!(b.get_sum().unwrap(), 0);

        a.set_sparse(&[3, 7]).unwrap();
        assert_eq!(b.get_sparse().unwrap(), vec![3, 7]);
        assert_eq!(b.get_coordinates().unwrap(), vec![vec![0, 1], vec![3, 3]]);

        a.zero();
        assert_eq!(b.get_sum().unwrap(), 0);
    }

    #[test]
    fn test_proxy_chain() {
        let mut a = Sdr::new(&[16]).unwrap();
        let b = SdrProxy::with_dimensions(&a, &[4, 4]).unwrap();
        let c = b.child_with_dimensions(&[2, 8]).unwrap();

        a.set_sparse(&[9]).unwrap();
        // Prime b's cache, then mutate again; c must still see fresh data.
        assert_eq!(b.get_sparse().unwrap(), vec![9]);
        a.set_sparse(&[12]).unwrap();
        assert_eq!(c.get_coordinates().unwrap(), vec![vec![1], vec![4]]);
    }

    #[test]
    fn test_detached_after_parent_drop() {
        let a = Sdr::new(&[16]).unwrap();
        let b = SdrProxy::new(&a);
        assert!(b.is_attached());

        drop(a);
        assert!(!b.is_attached());
        assert!(b.get_sparse().is_err());
        assert!(b.get_dense().is_err());
        assert!(b.get_sum().is_err());
    }

    #[test]
    fn test_subtree_invalidated_by_middle_drop() {
        let mut a = Sdr::new(&[16]).unwrap();
        let b = SdrProxy::with_dimensions(&a, &[4, 4]).unwrap();
        let c = b.child();

        a.set_sparse(&[5]).unwrap();
        assert_eq!(c.get_sparse().unwrap(), vec![5]);

        drop(b);
        assert!(c.get_sparse().is_err());
        // The root itself is unaffected.
        assert_eq!(a.get_sum(), 1);
    }

    #[test]
    fn test_proxy_callbacks() {
        use std::cell::Cell;
        use std::rc::Rc;

        let mut a = Sdr::new(&[8]).unwrap();
        let b = SdrProxy::new(&a);

        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let handle = b.add_callback(Box::new(move || c.set(c.get() + 1)));

        a.set_sparse(&[1]).unwrap();
        a.set_sparse(&[2]).unwrap();
        assert_eq!(count.get(), 2);

        b.remove_callback(handle).unwrap();
        a.set_sparse(&[3]).unwrap();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn test_dropped_proxy_stops_observing() {
        let mut a = Sdr::new(&[8]).unwrap();
        let b = SdrProxy::new(&a);
        drop(b);
        // The parent keeps working without the observer.
        a.set_sparse(&[1]).unwrap();
        assert_eq!(a.get_sum(), 1);
    }

    #[test]
    fn test_at() {
        let mut a = Sdr::new(&[4, 4]).unwrap();
        a.set_sparse(&[5]).unwrap();

        let b = SdrProxy::with_dimensions(&a, &[8, 2]).unwrap();
        assert!(b.at(&[2, 1]).unwrap());
        assert!(!b.at(&[0, 0]).unwrap());
        assert!(b.at(&[0]).is_err());
        assert!(b.at(&[8, 0]).is_err());
    }
}
