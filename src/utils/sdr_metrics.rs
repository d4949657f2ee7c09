//! Incremental SDR metrics.
//!
//! Each metric subscribes to an SDR's (or proxy's) change notifications and
//! maintains exponentially smoothed statistics with `alpha = 1 / period`,
//! seeded from the first observation. Metrics outlive the SDR they watch:
//! after the parent is destroyed they keep their last statistics and simply
//! receive no further updates.
//!
//! All metrics also support a detached mode (`with_dimensions` +
//! [`Sparsity::add_data`]) for callers that prefer explicit sampling.

use crate::error::{Result, VelesError};
use crate::types::sdr::{
    chain_sparse, push_callback, sparse_overlap, take_callback, CallbackList, Sdr, SdrLink,
    SdrSparse,
};
use crate::types::{Real, Real64, SdrProxy, UInt};

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// Running summary of a scalar signal: EMA plus min/max and numerically
/// stable (Welford) mean/standard deviation of the instantaneous values.
#[derive(Debug, Clone, Default)]
struct RunningStats {
    samples: u64,
    ema: Real64,
    min: Real64,
    max: Real64,
    mean: Real64,
    m2: Real64,
}

impl RunningStats {
    fn update(&mut self, value: Real64, alpha: Real64) {
        self.samples += 1;
        if self.samples == 1 {
            self.ema = value;
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
            return;
        }

        self.ema = (1.0 - alpha) * self.ema + alpha * value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let delta = value - self.mean;
        self.mean += delta / self.samples as Real64;
        self.m2 += delta * (value - self.mean);
    }

    fn std(&self) -> Real64 {
        if self.samples < 2 {
            return 0.0;
        }
        (self.m2 / self.samples as Real64).max(0.0).sqrt()
    }
}

/// Weak registration of an update closure on a parent's callback list.
struct Attachment {
    callbacks: Weak<RefCell<CallbackList>>,
    handle: usize,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if let Some(callbacks) = self.callbacks.upgrade() {
            let _ = take_callback(&callbacks, self.handle);
        }
    }
}

fn validate_period(period: UInt) -> Result<()> {
    if period == 0 {
        return Err(VelesError::InvalidParameter {
            name: "period",
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

/// Registers `update` on the chain's own callback list, feeding it the
/// current sparse value on every change notification.
fn attach<S: 'static>(
    chain: Vec<SdrLink>,
    state: &Rc<RefCell<S>>,
    update: fn(&mut S, &SdrSparse),
) -> Attachment {
    let callbacks_weak = chain[0].callbacks.clone();
    let weak_state = Rc::downgrade(state);

    let handle = match callbacks_weak.upgrade() {
        Some(callbacks) => push_callback(
            &callbacks,
            Box::new(move || {
                if let Some(state) = weak_state.upgrade() {
                    if let Ok(sparse) = chain_sparse(&chain) {
                        update(&mut state.borrow_mut(), &sparse);
                    }
                }
            }),
        ),
        None => 0,
    };

    Attachment {
        callbacks: callbacks_weak,
        handle,
    }
}

// ============================================================================
// Sparsity
// ============================================================================

#[derive(Debug, Default)]
struct SparsityState {
    size: usize,
    alpha: Real64,
    stats: RunningStats,
}

impl SparsityState {
    fn observe(state: &mut SparsityState, sparse: &SdrSparse) {
        let sparsity = sparse.len() as Real64 / state.size as Real64;
        let alpha = state.alpha;
        state.stats.update(sparsity, alpha);
    }
}

/// Exponentially smoothed sparsity of an SDR over time.
///
/// # Example
///
/// ```rust
/// use veles::types::Sdr;
/// use veles::utils::Sparsity;
///
/// let mut sdr = Sdr::new(&[100]).unwrap();
/// let metric = Sparsity::new(&sdr, 10).unwrap();
///
/// sdr.set_sparse(&[0, 1, 2, 3, 4]).unwrap();
/// assert!((metric.sparsity() - 0.05).abs() < 1e-6);
/// ```
pub struct Sparsity {
    state: Rc<RefCell<SparsityState>>,
    dimensions: Vec<UInt>,
    period: UInt,
    attachment: Option<Attachment>,
}

impl Sparsity {
    /// Attaches the metric to an SDR's change notifications.
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is zero.
    pub fn new(sdr: &Sdr, period: UInt) -> Result<Self> {
        Self::attached(sdr.observer_chain(), sdr.dimensions().to_vec(), sdr.size(), period)
    }

    /// Attaches the metric to a proxy's change notifications.
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is zero.
    pub fn of_proxy(proxy: &SdrProxy, period: UInt) -> Result<Self> {
        Self::attached(
            proxy.observer_chain(),
            proxy.dimensions().to_vec(),
            proxy.size(),
            period,
        )
    }

    /// Creates a detached metric fed manually through [`Sparsity::add_data`].
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is zero or the dimensions are invalid.
    pub fn with_dimensions(dimensions: &[UInt], period: UInt) -> Result<Self> {
        validate_period(period)?;
        let probe = Sdr::new(dimensions)?;
        Ok(Self {
            state: Rc::new(RefCell::new(SparsityState {
                size: probe.size(),
                alpha: 1.0 / Real64::from(period),
                stats: RunningStats::default(),
            })),
            dimensions: dimensions.to_vec(),
            period,
            attachment: None,
        })
    }

    fn attached(
        chain: Vec<SdrLink>,
        dimensions: Vec<UInt>,
        size: usize,
        period: UInt,
    ) -> Result<Self> {
        validate_period(period)?;
        let state = Rc::new(RefCell::new(SparsityState {
            size,
            alpha: 1.0 / Real64::from(period),
            stats: RunningStats::default(),
        }));
        let attachment = attach(chain, &state, SparsityState::observe);
        Ok(Self {
            state,
            dimensions,
            period,
            attachment: Some(attachment),
        })
    }

    /// Feeds one observation to a detached metric.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidState`] on an attached metric and
    /// [`VelesError::DimensionMismatch`] for a mismatched SDR.
    pub fn add_data(&mut self, sdr: &Sdr) -> Result<()> {
        if self.attachment.is_some() {
            return Err(VelesError::InvalidState(
                "add_data requires a metric created with with_dimensions".to_string(),
            ));
        }
        if sdr.dimensions() != self.dimensions.as_slice() {
            return Err(VelesError::DimensionMismatch {
                expected: self.dimensions.clone(),
                actual: sdr.dimensions().to_vec(),
            });
        }
        sdr.with_sparse(|sparse| SparsityState::observe(&mut self.state.borrow_mut(), sparse));
        Ok(())
    }

    /// The smoothing period.
    #[must_use]
    pub fn period(&self) -> UInt {
        self.period
    }

    /// Number of observations so far.
    #[must_use]
    pub fn num_samples(&self) -> u64 {
        self.state.borrow().stats.samples
    }

    /// Exponential moving average of the sparsity.
    #[must_use]
    pub fn sparsity(&self) -> Real {
        self.state.borrow().stats.ema as Real
    }

    /// Minimum instantaneous sparsity seen.
    #[must_use]
    pub fn min(&self) -> Real {
        self.state.borrow().stats.min as Real
    }

    /// Maximum instantaneous sparsity seen.
    #[must_use]
    pub fn max(&self) -> Real {
        self.state.borrow().stats.max as Real
    }

    /// Running mean of the instantaneous sparsity.
    #[must_use]
    pub fn mean(&self) -> Real {
        self.state.borrow().stats.mean as Real
    }

    /// Running standard deviation of the instantaneous sparsity.
    #[must_use]
    pub fn std(&self) -> Real {
        self.state.borrow().stats.std() as Real
    }
}

impl fmt::Display for Sparsity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Sparsity Min/Mean/Std/Max {:.6} / {:.6} / {:.6} / {:.6}",
            self.min(),
            self.mean(),
            self.std(),
            self.max()
        )
    }
}

// ============================================================================
// ActivationFrequency
// ============================================================================

#[derive(Debug, Default)]
struct ActivationFrequencyState {
    alpha: Real64,
    samples: u64,
    frequencies: Vec<Real64>,
}

impl ActivationFrequencyState {
    fn observe(state: &mut ActivationFrequencyState, sparse: &SdrSparse) {
        state.samples += 1;
        if state.samples == 1 {
            // Seed from the first observation.
            for f in &mut state.frequencies {
                *f = 0.0;
            }
            for &idx in sparse {
                state.frequencies[idx as usize] = 1.0;
            }
            return;
        }

        let alpha = state.alpha;
        for f in &mut state.frequencies {
            *f *= 1.0 - alpha;
        }
        for &idx in sparse {
            state.frequencies[idx as usize] += alpha;
        }
    }
}

/// Per-bit exponentially smoothed activation frequency.
pub struct ActivationFrequency {
    state: Rc<RefCell<ActivationFrequencyState>>,
    dimensions: Vec<UInt>,
    period: UInt,
    attachment: Option<Attachment>,
}

impl ActivationFrequency {
    /// Attaches the metric to an SDR's change notifications.
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is zero.
    pub fn new(sdr: &Sdr, period: UInt) -> Result<Self> {
        Self::attached(sdr.observer_chain(), sdr.dimensions().to_vec(), sdr.size(), period)
    }

    /// Attaches the metric to a proxy's change notifications.
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is zero.
    pub fn of_proxy(proxy: &SdrProxy, period: UInt) -> Result<Self> {
        Self::attached(
            proxy.observer_chain(),
            proxy.dimensions().to_vec(),
            proxy.size(),
            period,
        )
    }

    /// Creates a detached metric fed manually through
    /// [`ActivationFrequency::add_data`].
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is zero or the dimensions are invalid.
    pub fn with_dimensions(dimensions: &[UInt], period: UInt) -> Result<Self> {
        validate_period(period)?;
        let probe = Sdr::new(dimensions)?;
        Ok(Self {
            state: Rc::new(RefCell::new(ActivationFrequencyState {
                alpha: 1.0 / Real64::from(period),
                samples: 0,
                frequencies: vec![0.0; probe.size()],
            })),
            dimensions: dimensions.to_vec(),
            period,
            attachment: None,
        })
    }

    fn attached(
        chain: Vec<SdrLink>,
        dimensions: Vec<UInt>,
        size: usize,
        period: UInt,
    ) -> Result<Self> {
        validate_period(period)?;
        let state = Rc::new(RefCell::new(ActivationFrequencyState {
            alpha: 1.0 / Real64::from(period),
            samples: 0,
            frequencies: vec![0.0; size],
        }));
        let attachment = attach(chain, &state, ActivationFrequencyState::observe);
        Ok(Self {
            state,
            dimensions,
            period,
            attachment: Some(attachment),
        })
    }

    /// Feeds one observation to a detached metric.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidState`] on an attached metric and
    /// [`VelesError::DimensionMismatch`] for a mismatched SDR.
    pub fn add_data(&mut self, sdr: &Sdr) -> Result<()> {
        if self.attachment.is_some() {
            return Err(VelesError::InvalidState(
                "add_data requires a metric created with with_dimensions".to_string(),
            ));
        }
        if sdr.dimensions() != self.dimensions.as_slice() {
            return Err(VelesError::DimensionMismatch {
                expected: self.dimensions.clone(),
                actual: sdr.dimensions().to_vec(),
            });
        }
        sdr.with_sparse(|sparse| {
            ActivationFrequencyState::observe(&mut self.state.borrow_mut(), sparse);
        });
        Ok(())
    }

    /// The smoothing period.
    #[must_use]
    pub fn period(&self) -> UInt {
        self.period
    }

    /// Number of observations so far.
    #[must_use]
    pub fn num_samples(&self) -> u64 {
        self.state.borrow().samples
    }

    /// Smoothed activation frequency of every bit.
    #[must_use]
    pub fn frequencies(&self) -> Vec<Real> {
        self.state
            .borrow()
            .frequencies
            .iter()
            .map(|&f| f as Real)
            .collect()
    }

    /// Minimum per-bit frequency.
    #[must_use]
    pub fn min(&self) -> Real {
        self.state
            .borrow()
            .frequencies
            .iter()
            .copied()
            .fold(Real64::INFINITY, Real64::min) as Real
    }

    /// Maximum per-bit frequency.
    #[must_use]
    pub fn max(&self) -> Real {
        self.state
            .borrow()
            .frequencies
            .iter()
            .copied()
            .fold(Real64::NEG_INFINITY, Real64::max) as Real
    }

    /// Mean per-bit frequency.
    #[must_use]
    pub fn mean(&self) -> Real {
        let state = self.state.borrow();
        (state.frequencies.iter().sum::<Real64>() / state.frequencies.len() as Real64) as Real
    }

    /// Standard deviation of the per-bit frequencies.
    #[must_use]
    pub fn std(&self) -> Real {
        let state = self.state.borrow();
        let n = state.frequencies.len() as Real64;
        let mean = state.frequencies.iter().sum::<Real64>() / n;
        let variance = state
            .frequencies
            .iter()
            .map(|&f| (f - mean) * (f - mean))
            .sum::<Real64>()
            / n;
        variance.max(0.0).sqrt() as Real
    }

    /// Normalized binary entropy of the activation distribution, in `[0, 1]`.
    ///
    /// `1.0` means every bit is active half the time; all-zero and all-one
    /// distributions score `0.0`.
    #[must_use]
    pub fn entropy(&self) -> Real {
        fn binary_entropy(p: Real64) -> Real64 {
            let mut h = 0.0;
            if p > 0.0 {
                h -= p * p.log2();
            }
            let q = 1.0 - p;
            if q > 0.0 {
                h -= q * q.log2();
            }
            h
        }

        let state = self.state.borrow();
        let total: Real64 = state.frequencies.iter().copied().map(binary_entropy).sum();
        (total / state.frequencies.len() as Real64) as Real
    }
}

impl fmt::Display for ActivationFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Activation Frequency Min/Mean/Std/Max {:.6} / {:.6} / {:.6} / {:.6}",
            self.min(),
            self.mean(),
            self.std(),
            self.max()
        )?;
        writeln!(f, "Entropy {:.6}", self.entropy())
    }
}

// ============================================================================
// Overlap
// ============================================================================

#[derive(Debug, Default)]
struct OverlapState {
    alpha: Real64,
    previous: Option<SdrSparse>,
    stats: RunningStats,
}

impl OverlapState {
    fn observe(state: &mut OverlapState, sparse: &SdrSparse) {
        if let Some(ref previous) = state.previous {
            let smaller = previous.len().min(sparse.len());
            let score = if smaller == 0 {
                0.0
            } else {
                sparse_overlap(previous, sparse) as Real64 / smaller as Real64
            };
            let alpha = state.alpha;
            state.stats.update(score, alpha);
        }
        state.previous = Some(sparse.clone());
    }
}

/// Overlap between consecutive observations, as a fraction of the smaller
/// active count. Undefined until two observations exist.
pub struct Overlap {
    state: Rc<RefCell<OverlapState>>,
    dimensions: Vec<UInt>,
    period: UInt,
    attachment: Option<Attachment>,
}

impl Overlap {
    /// Attaches the metric to an SDR's change notifications.
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is zero.
    pub fn new(sdr: &Sdr, period: UInt) -> Result<Self> {
        Self::attached(sdr.observer_chain(), sdr.dimensions().to_vec(), period)
    }

    /// Attaches the metric to a proxy's change notifications.
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is zero.
    pub fn of_proxy(proxy: &SdrProxy, period: UInt) -> Result<Self> {
        Self::attached(proxy.observer_chain(), proxy.dimensions().to_vec(), period)
    }

    /// Creates a detached metric fed manually through [`Overlap::add_data`].
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is zero or the dimensions are invalid.
    pub fn with_dimensions(dimensions: &[UInt], period: UInt) -> Result<Self> {
        validate_period(period)?;
        Sdr::new(dimensions)?;
        Ok(Self {
            state: Rc::new(RefCell::new(OverlapState {
                alpha: 1.0 / Real64::from(period),
                ..OverlapState::default()
            })),
            dimensions: dimensions.to_vec(),
            period,
            attachment: None,
        })
    }

    fn attached(chain: Vec<SdrLink>, dimensions: Vec<UInt>, period: UInt) -> Result<Self> {
        validate_period(period)?;
        let state = Rc::new(RefCell::new(OverlapState {
            alpha: 1.0 / Real64::from(period),
            ..OverlapState::default()
        }));
        let attachment = attach(chain, &state, OverlapState::observe);
        Ok(Self {
            state,
            dimensions,
            period,
            attachment: Some(attachment),
        })
    }

    /// Feeds one observation to a detached metric.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidState`] on an attached metric and
    /// [`VelesError::DimensionMismatch`] for a mismatched SDR.
    pub fn add_data(&mut self, sdr: &Sdr) -> Result<()> {
        if self.attachment.is_some() {
            return Err(VelesError::InvalidState(
                "add_data requires a metric created with with_dimensions".to_string(),
            ));
        }
        if sdr.dimensions() != self.dimensions.as_slice() {
            return Err(VelesError::DimensionMismatch {
                expected: self.dimensions.clone(),
                actual: sdr.dimensions().to_vec(),
            });
        }
        sdr.with_sparse(|sparse| OverlapState::observe(&mut self.state.borrow_mut(), sparse));
        Ok(())
    }

    /// The smoothing period.
    #[must_use]
    pub fn period(&self) -> UInt {
        self.period
    }

    /// Number of overlap samples (observations minus one).
    #[must_use]
    pub fn num_samples(&self) -> u64 {
        self.state.borrow().stats.samples
    }

    /// Exponential moving average of the overlap fraction.
    #[must_use]
    pub fn overlap(&self) -> Real {
        self.state.borrow().stats.ema as Real
    }

    /// Minimum overlap fraction seen.
    #[must_use]
    pub fn min(&self) -> Real {
        self.state.borrow().stats.min as Real
    }

    /// Maximum overlap fraction seen.
    #[must_use]
    pub fn max(&self) -> Real {
        self.state.borrow().stats.max as Real
    }

    /// Running mean of the overlap fraction.
    #[must_use]
    pub fn mean(&self) -> Real {
        self.state.borrow().stats.mean as Real
    }

    /// Running standard deviation of the overlap fraction.
    #[must_use]
    pub fn std(&self) -> Real {
        self.state.borrow().stats.std() as Real
    }
}

impl fmt::Display for Overlap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Overlap Min/Mean/Std/Max {:.6} / {:.6} / {:.6} / {:.6}",
            self.min(),
            self.mean(),
            self.std(),
            self.max()
        )
    }
}

// ============================================================================
// Metrics (composite)
// ============================================================================

/// Composite of [`Sparsity`], [`ActivationFrequency`] and [`Overlap`],
/// attached together and printed together.
pub struct Metrics {
    dimensions: Vec<UInt>,
    /// Smoothed sparsity statistics.
    pub sparsity: Sparsity,
    /// Per-bit activation frequency statistics.
    pub activation_frequency: ActivationFrequency,
    /// Successive-overlap statistics.
    pub overlap: Overlap,
}

impl Metrics {
    /// Attaches all three metrics to an SDR.
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is zero.
    pub fn new(sdr: &Sdr, period: UInt) -> Result<Self> {
        Ok(Self {
            dimensions: sdr.dimensions().to_vec(),
            sparsity: Sparsity::new(sdr, period)?,
            activation_frequency: ActivationFrequency::new(sdr, period)?,
            overlap: Overlap::new(sdr, period)?,
        })
    }

    /// Attaches all three metrics to a proxy.
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is zero.
    pub fn of_proxy(proxy: &SdrProxy, period: UInt) -> Result<Self> {
        Ok(Self {
            dimensions: proxy.dimensions().to_vec(),
            sparsity: Sparsity::of_proxy(proxy, period)?,
            activation_frequency: ActivationFrequency::of_proxy(proxy, period)?,
            overlap: Overlap::of_proxy(proxy, period)?,
        })
    }

    /// Creates detached metrics fed manually through [`Metrics::add_data`].
    ///
    /// # Errors
    ///
    /// Returns an error if `period` is zero or the dimensions are invalid.
    pub fn with_dimensions(dimensions: &[UInt], period: UInt) -> Result<Self> {
        Ok(Self {
            dimensions: dimensions.to_vec(),
            sparsity: Sparsity::with_dimensions(dimensions, period)?,
            activation_frequency: ActivationFrequency::with_dimensions(dimensions, period)?,
            overlap: Overlap::with_dimensions(dimensions, period)?,
        })
    }

    /// Feeds one observation to all three detached metrics.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidState`] on attached metrics and
    /// [`VelesError::DimensionMismatch`] for a mismatched SDR.
    pub fn add_data(&mut self, sdr: &Sdr) -> Result<()> {
        self.sparsity.add_data(sdr)?;
        self.activation_frequency.add_data(sdr)?;
        self.overlap.add_data(sdr)
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SDR( ")?;
        for (i, dim) in self.dimensions.iter().enumerate() {
            write!(f, "{dim}")?;
            if i + 1 != self.dimensions.len() {
                write!(f, ", ")?;
            }
        }
        writeln!(f, " )")?;
        write!(f, "    {}", self.sparsity)?;
        for line in format!("{}", self.activation_frequency).lines() {
            writeln!(f, "    {line}")?;
        }
        write!(f, "    {}", self.overlap)
    }
}
