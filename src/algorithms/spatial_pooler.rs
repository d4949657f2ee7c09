//! Spatial Pooler implementation.
//!
//! The Spatial Pooler maps a binary input SDR to a sparse binary output SDR
//! of active columns. Given an input it computes per-column overlaps through
//! the synaptic connectivity, applies homeostatic boosting, runs a
//! competitive inhibition, and (when learning) adapts permanences, duty
//! cycles and boost factors toward the input statistics.

use crate::algorithms::Connections;
use crate::error::{Result, VelesError};
use crate::types::{
    CellIdx, Permanence, Real, Real64, Sdr, Segment, UInt, EPSILON, MAX_PERMANENCE,
    MIN_PERMANENCE,
};
use crate::utils::{Neighborhood, Random, Topology, WrappingMode};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Hard cap on the target density of active columns.
pub const MAX_LOCAL_AREA_DENSITY: Real = 0.5;

/// Parameters for creating a Spatial Pooler.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpatialPoolerParams {
    /// Dimensions of the input space (e.g., `vec![100]` for 100 inputs).
    pub input_dimensions: Vec<UInt>,

    /// Dimensions of the column space. Must have the same rank as the
    /// input dimensions.
    pub column_dimensions: Vec<UInt>,

    /// Radius of the receptive field around each column's mapped input.
    /// Must be smaller than the number of inputs.
    pub potential_radius: UInt,

    /// Fraction of the receptive field a column samples into its potential
    /// pool, in `(0, 1]`.
    pub potential_pct: Real,

    /// If true, all columns compete globally. If false, columns compete
    /// within their inhibition neighborhood.
    pub global_inhibition: bool,

    /// Target density of active columns. Mutually exclusive with
    /// `num_active_columns_per_inh_area`: exactly one must be positive.
    pub local_area_density: Real,

    /// Target number of active columns per inhibition area. Mutually
    /// exclusive with `local_area_density`.
    pub num_active_columns_per_inh_area: UInt,

    /// Minimum overlap for a column to be eligible for activation.
    pub stimulus_threshold: UInt,

    /// Permanence decrement for synapses from inactive inputs.
    pub syn_perm_inactive_dec: Permanence,

    /// Permanence increment for synapses from active inputs.
    pub syn_perm_active_inc: Permanence,

    /// Permanence threshold at which a synapse counts as connected, in
    /// `(0, 1]`.
    pub syn_perm_connected: Permanence,

    /// Homeostatic floor: fraction of the best overlap duty cycle a column
    /// must reach to avoid a permanence bump, in `(0, 1]`.
    pub min_pct_overlap_duty_cycles: Real,

    /// Window of the duty-cycle moving averages, at least 1.
    pub duty_cycle_period: UInt,

    /// Strength of boosting; 0 disables boosting entirely.
    pub boost_strength: Real,

    /// Random seed. Negative requests OS entropy.
    pub seed: i64,

    /// Whether topology neighborhoods wrap around the space boundaries.
    pub wrap_around: bool,
}

impl Default for SpatialPoolerParams {
    fn default() -> Self {
        Self {
            input_dimensions: vec![100],
            column_dimensions: vec![2048],
            potential_radius: 16,
            potential_pct: 0.5,
            global_inhibition: true,
            local_area_density: 0.05,
            num_active_columns_per_inh_area: 0,
            stimulus_threshold: 0,
            syn_perm_inactive_dec: 0.008,
            syn_perm_active_inc: 0.05,
            syn_perm_connected: 0.1,
            min_pct_overlap_duty_cycles: 0.001,
            duty_cycle_period: 1000,
            boost_strength: 0.0,
            seed: 1,
            wrap_around: true,
        }
    }
}

/// The Spatial Pooler algorithm.
///
/// # Example
///
/// ```rust
/// use veles::algorithms::{SpatialPooler, SpatialPoolerParams};
/// use veles::types::Sdr;
///
/// let mut sp = SpatialPooler::new(SpatialPoolerParams {
///     input_dimensions: vec![100],
///     column_dimensions: vec![200],
///     potential_radius: 50,
///     ..Default::default()
/// }).unwrap();
///
/// let mut input = Sdr::new(&[100]).unwrap();
/// let mut active = Sdr::new(&[200]).unwrap();
///
/// input.set_sparse(&[1, 5, 10, 20, 30]).unwrap();
/// sp.compute(&input, true, &mut active).unwrap();
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpatialPooler {
    // Configuration
    input_dimensions: Vec<UInt>,
    column_dimensions: Vec<UInt>,
    num_inputs: usize,
    num_columns: usize,
    potential_radius: UInt,
    potential_pct: Real,
    global_inhibition: bool,
    local_area_density: Real,
    num_active_columns_per_inh_area: UInt,
    stimulus_threshold: UInt,
    inhibition_radius: UInt,
    duty_cycle_period: UInt,
    boost_strength: Real,
    wrap_around: bool,
    update_period: UInt,

    // Permanence parameters
    syn_perm_inactive_dec: Permanence,
    syn_perm_active_inc: Permanence,
    syn_perm_below_stimulus_inc: Permanence,
    syn_perm_connected: Permanence,
    min_pct_overlap_duty_cycles: Real,
    init_connected_pct: Real,

    // State
    boost_factors: Vec<Real>,
    overlap_duty_cycles: Vec<Real>,
    active_duty_cycles: Vec<Real>,
    min_overlap_duty_cycles: Vec<Real>,
    boosted_overlaps: Vec<Real>,

    // Synaptic connections: one segment per column, segment id == column id.
    connections: Connections,

    // Iteration counters
    iteration_num: UInt,
    iteration_learn_num: UInt,

    // Cached neighborhoods for local competition; rebuilt when the
    // inhibition radius changes. Lookups fall back to direct computation,
    // so a cold cache is never incorrect.
    #[cfg_attr(feature = "serde", serde(skip))]
    neighborhoods: Neighborhood,

    rng: Random,
}

impl SpatialPooler {
    /// Creates and initializes a Spatial Pooler.
    ///
    /// # Errors
    ///
    /// Returns [`VelesError::InvalidParameter`] or
    /// [`VelesError::InvalidDimensions`] for out-of-domain parameters; see
    /// the field docs on [`SpatialPoolerParams`].
    pub fn new(params: SpatialPoolerParams) -> Result<Self> {
        Self::validate(&params)?;

        let num_inputs = Topology::num_elements(&params.input_dimensions);
        let num_columns = Topology::num_elements(&params.column_dimensions);

        let mut sp = Self {
            input_dimensions: params.input_dimensions.clone(),
            column_dimensions: params.column_dimensions.clone(),
            num_inputs,
            num_columns,
            potential_radius: params.potential_radius,
            potential_pct: params.potential_pct,
            global_inhibition: params.global_inhibition,
            local_area_density: params.local_area_density,
            num_active_columns_per_inh_area: params.num_active_columns_per_inh_area,
            stimulus_threshold: params.stimulus_threshold,
            inhibition_radius: 0,
            duty_cycle_period: params.duty_cycle_period,
            boost_strength: params.boost_strength,
            wrap_around: params.wrap_around,
            update_period: 50,

            syn_perm_inactive_dec: params.syn_perm_inactive_dec,
            syn_perm_active_inc: params.syn_perm_active_inc,
            syn_perm_below_stimulus_inc: params.syn_perm_connected / 10.0,
            syn_perm_connected: params.syn_perm_connected,
            min_pct_overlap_duty_cycles: params.min_pct_overlap_duty_cycles,
            init_connected_pct: 0.5,

            boost_factors: vec![1.0; num_columns],
            overlap_duty_cycles: vec![0.0; num_columns],
            active_duty_cycles: vec![0.0; num_columns],
            min_overlap_duty_cycles: vec![0.0; num_columns],
            boosted_overlaps: vec![0.0; num_columns],

            connections: Connections::new(num_columns as CellIdx, params.syn_perm_connected),

            iteration_num: 0,
            iteration_learn_num: 0,

            neighborhoods: Neighborhood::new(),
            rng: Random::new(params.seed),
        };

        sp.initialize_columns();
        sp.update_inhibition_radius();

        Ok(sp)
    }

    fn validate(params: &SpatialPoolerParams) -> Result<()> {
        fn check_dims(name: &'static str, dims: &[UInt]) -> Result<usize> {
            if dims.is_empty() || dims.contains(&0) {
                return Err(VelesError::InvalidParameter {
                    name,
                    message: "dimensions must be positive integers".to_string(),
                });
            }
            Ok(Topology::num_elements(dims))
        }

        let num_inputs = check_dims("input_dimensions", &params.input_dimensions)?;
        let num_columns = check_dims("column_dimensions", &params.column_dimensions)?;

        if params.input_dimensions.len() != params.column_dimensions.len() {
            return Err(VelesError::InvalidDimensions(format!(
                "input rank {} != column rank {}",
                params.input_dimensions.len(),
                params.column_dimensions.len()
            )));
        }

        if (params.potential_radius as usize) >= num_inputs {
            return Err(VelesError::InvalidParameter {
                name: "potential_radius",
                message: format!("must be smaller than the number of inputs ({num_inputs})"),
            });
        }
        if params.potential_pct <= 0.0 || params.potential_pct > 1.0 {
            return Err(VelesError::InvalidParameter {
                name: "potential_pct",
                message: "must be in range (0, 1]".to_string(),
            });
        }

        let density_set = params.local_area_density > 0.0;
        let count_set = params.num_active_columns_per_inh_area > 0;
        if density_set == count_set {
            return Err(VelesError::InvalidParameter {
                name: "local_area_density",
                message: "exactly one of local_area_density and \
                          num_active_columns_per_inh_area must be positive"
                    .to_string(),
            });
        }
        if density_set {
            if params.local_area_density > 1.0 {
                return Err(VelesError::InvalidParameter {
                    name: "local_area_density",
                    message: "must be in range (0, 1]".to_string(),
                });
            }
            let target =
                (Real64::from(params.local_area_density) * num_columns as Real64).round();
            if target < 1.0 {
                return Err(VelesError::InvalidParameter {
                    name: "local_area_density",
                    message: "density rounds to zero active columns".to_string(),
                });
            }
        }
        if count_set && params.num_active_columns_per_inh_area as usize > num_columns {
            return Err(VelesError::InvalidParameter {
                name: "num_active_columns_per_inh_area",
                message: "exceeds the number of columns".to_string(),
            });
        }

        for (name, value) in [
            ("syn_perm_inactive_dec", params.syn_perm_inactive_dec),
            ("syn_perm_active_inc", params.syn_perm_active_inc),
        ] {
            if !(MIN_PERMANENCE..=MAX_PERMANENCE).contains(&value) {
                return Err(VelesError::InvalidParameter {
                    name,
                    message: "must be in range [0, 1]".to_string(),
                });
            }
        }
        if params.syn_perm_connected <= 0.0 || params.syn_perm_connected > 1.0 {
            return Err(VelesError::InvalidParameter {
                name: "syn_perm_connected",
                message: "must be in range (0, 1]".to_string(),
            });
        }
        if params.min_pct_overlap_duty_cycles <= 0.0 || params.min_pct_overlap_duty_cycles > 1.0 {
            return Err(VelesError::InvalidParameter {
                name: "min_pct_overlap_duty_cycles",
                message: "must be in range (0, 1]".to_string(),
            });
        }
        if params.duty_cycle_period == 0 {
            return Err(VelesError::InvalidParameter {
                name: "duty_cycle_period",
                message: "must be at least 1".to_string(),
            });
        }
        if params.boost_strength < 0.0 {
            return Err(VelesError::InvalidParameter {
                name: "boost_strength",
                message: "must be non-negative".to_string(),
            });
        }

        Ok(())
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Builds every column's potential pool and initial permanences, then
    /// raises each segment to the stimulus threshold.
    fn initialize_columns(&mut self) {
        for column in 0..self.num_columns {
            // One segment per column; segment ids track column ids.
            let segment = self.connections.create_segment(column as CellIdx, Some(1));
            debug_assert_eq!(segment as usize, column);

            let potential = self.init_map_potential(column);
            for input in potential {
                let permanence = if self.rng.get_real64() <= Real64::from(self.init_connected_pct)
                {
                    self.init_perm_connected()
                } else {
                    self.init_perm_non_connected()
                };
                self.connections
                    .create_synapse(segment, input as CellIdx, permanence);
            }

            self.connections.raise_permanences_to_threshold(
                segment,
                self.stimulus_threshold,
                self.syn_perm_below_stimulus_inc,
            );
        }
    }

    /// Samples a column's potential pool from the neighborhood of its
    /// mapped center input. Returned in ascending input order.
    fn init_map_potential(&mut self, column: usize) -> Vec<UInt> {
        let center = Topology::map_column_to_input(
            column,
            &self.column_dimensions,
            &self.input_dimensions,
        );

        let neighborhood = Topology::neighborhood(
            center,
            &self.input_dimensions,
            self.potential_radius,
            self.wrap_mode(),
        );

        let num_potential = (neighborhood.len() as Real64
            * Real64::from(self.potential_pct))
        .round() as usize;

        let mut sampled = self.rng.sample(neighborhood, num_potential);
        sampled.sort_unstable();
        sampled.into_iter().map(|i| i as UInt).collect()
    }

    fn init_perm_connected(&mut self) -> Permanence {
        self.rng.real_range(self.syn_perm_connected, MAX_PERMANENCE)
    }

    fn init_perm_non_connected(&mut self) -> Permanence {
        self.rng.real_range(MIN_PERMANENCE, self.syn_perm_connected)
    }

    fn wrap_mode(&self) -> WrappingMode {
        if self.wrap_around {
            WrappingMode::Wrap
        } else {
            WrappingMode::NoWrap
        }
    }

    // ========================================================================
    // Compute
    // ========================================================================

    /// Runs one step: computes overlaps, applies boosting and inhibition,
    /// writes the active columns into `active` (sorted ascending), and, if
    /// `learn`, updates permanences, duty cycles and boost factors.
    ///
    /// Returns the raw (unboosted) per-column overlaps.
    ///
    /// # Errors
    ///
    /// Returns an error if `input.size() != num_inputs` or
    /// `active.size() != num_columns`.
    pub fn compute(&mut self, input: &Sdr, learn: bool, active: &mut Sdr) -> Result<Vec<UInt>> {
        if input.size() != self.num_inputs {
            return Err(VelesError::DimensionMismatch {
                expected: vec![self.num_inputs as u32],
                actual: vec![input.size() as u32],
            });
        }
        if active.size() != self.num_columns {
            return Err(VelesError::DimensionMismatch {
                expected: vec![self.num_columns as u32],
                actual: vec![active.size() as u32],
            });
        }

        self.update_bookkeeping_vars(learn);

        let input_sparse: Vec<CellIdx> = input.get_sparse();
        let overlaps = self.connections.compute_activity(&input_sparse, learn);

        self.boost_overlaps(&overlaps);

        let mut active_columns = self.inhibit_columns(&self.boosted_overlaps);
        active_columns.sort_unstable();
        active.set_sparse_owned(active_columns.clone())?;

        if learn {
            self.adapt_synapses(input, &active_columns);
            self.update_duty_cycles(&overlaps, &active_columns);
            self.bump_up_weak_columns();
            self.update_boost_factors();

            if self.is_update_round() {
                self.update_inhibition_radius();
                self.update_min_duty_cycles();
            }
        }

        Ok(overlaps)
    }

    /// Applies the boost overlay. Skipped (straight copy) when boosting is
    /// disabled.
    fn boost_overlaps(&mut self, overlaps: &[UInt]) {
        if self.boost_strength < EPSILON {
            for (b, &o) in self.boosted_overlaps.iter_mut().zip(overlaps) {
                *b = o as Real;
            }
            return;
        }
        for (i, (b, &o)) in self
            .boosted_overlaps
            .iter_mut()
            .zip(overlaps)
            .enumerate()
        {
            *b = o as Real * self.boost_factors[i];
        }
    }

    // ========================================================================
    // Inhibition
    // ========================================================================

    /// Target density for inhibition and boosting.
    fn inhibition_density(&self) -> Real {
        if self.num_active_columns_per_inh_area > 0 {
            let diameter = 2 * self.inhibition_radius as usize + 1;
            let mut area: usize = 1;
            for &dim in &self.column_dimensions {
                area *= diameter.min(dim as usize);
            }
            let area = area.min(self.num_columns);
            (self.num_active_columns_per_inh_area as Real / area as Real)
                .min(MAX_LOCAL_AREA_DENSITY)
        } else {
            self.local_area_density
        }
    }

    fn inhibit_columns(&self, overlaps: &[Real]) -> Vec<CellIdx> {
        let density = self.inhibition_density();
        let max_dimension = self.column_dimensions.iter().copied().max().unwrap_or(1);

        if self.global_inhibition || self.inhibition_radius > max_dimension {
            self.inhibit_columns_global(overlaps, density)
        } else {
            self.inhibit_columns_local(overlaps, density)
        }
    }

    /// Global competition: the `round(density * num_columns)` columns with
    /// the highest boosted overlaps win. Ties are deterministic: the higher
    /// column index wins. Sub-threshold columns never win.
    fn inhibit_columns_global(&self, overlaps: &[Real], density: Real) -> Vec<CellIdx> {
        let num_desired = (Real64::from(density) * self.num_columns as Real64).round() as usize;
        let num_desired = num_desired.min(self.num_columns);

        let compare = |a: &CellIdx, b: &CellIdx| {
            match overlaps[*b as usize].partial_cmp(&overlaps[*a as usize]) {
                Some(std::cmp::Ordering::Equal) | None => b.cmp(a),
                Some(ordering) => ordering,
            }
        };

        let mut columns: Vec<CellIdx> = (0..self.num_columns as CellIdx).collect();

        // Partition winners from losers before fully sorting the winners.
        if num_desired < self.num_columns {
            columns.select_nth_unstable_by(num_desired, compare);
            columns.truncate(num_desired);
        }
        columns.sort_unstable_by(compare);

        let threshold = self.stimulus_threshold as Real;
        while let Some(&last) = columns.last() {
            if overlaps[last as usize] < threshold {
                columns.pop();
            } else {
                break;
            }
        }

        columns
    }

    /// Local competition: a column wins iff strictly fewer than
    /// `round(density * (|N| + 1))` of its neighbors have a larger boosted
    /// overlap. Equal-overlap neighbors that already won count as larger,
    /// and columns are visited in ascending index order, which makes the
    /// tie-break deterministic.
    fn inhibit_columns_local(&self, overlaps: &[Real], density: Real) -> Vec<CellIdx> {
        let mut active = Vec::new();
        let mut active_dense = vec![false; self.num_columns];
        let threshold = self.stimulus_threshold as Real;

        for column in 0..self.num_columns {
            if overlaps[column] < threshold {
                continue;
            }

            let wins = self.with_neighbors(column, |neighbors| {
                let num_neighbors = neighbors.len() - 1;
                let target = (0.5 + Real64::from(density) * (num_neighbors + 1) as Real64) as usize;

                let mut num_bigger = 0;
                for &neighbor in neighbors {
                    if neighbor == column {
                        continue;
                    }
                    let difference = overlaps[neighbor] - overlaps[column];
                    if difference > 0.0 || (difference == 0.0 && active_dense[neighbor]) {
                        num_bigger += 1;
                        if num_bigger >= target {
                            break;
                        }
                    }
                }

                num_bigger < target
            });

            if wins {
                active.push(column as CellIdx);
                active_dense[column] = true;
            }
        }

        active
    }

    fn with_neighbors<R>(&self, column: usize, f: impl FnOnce(&[usize]) -> R) -> R {
        if let Some(neighbors) = self.neighborhoods.get(column) {
            f(neighbors)
        } else {
            let neighbors = Topology::neighborhood(
                column,
                &self.column_dimensions,
                self.inhibition_radius,
                self.wrap_mode(),
            );
            f(&neighbors)
        }
    }

    // ========================================================================
    // Learning
    // ========================================================================

    /// Hebbian adaptation of every active column's segment toward the
    /// input, restoring the stimulus-threshold invariant afterwards.
    fn adapt_synapses(&mut self, input: &Sdr, active_columns: &[CellIdx]) {
        for &column in active_columns {
            self.connections.adapt_segment(
                column as Segment,
                input,
                self.syn_perm_active_inc,
                self.syn_perm_inactive_dec,
            );
            self.connections.raise_permanences_to_threshold(
                column as Segment,
                self.stimulus_threshold,
                self.syn_perm_below_stimulus_inc,
            );
        }
    }

    /// Updates both duty-cycle EMAs with window
    /// `min(duty_cycle_period, iteration_num)`.
    fn update_duty_cycles(&mut self, overlaps: &[UInt], active_columns: &[CellIdx]) {
        let period = self.duty_cycle_period.min(self.iteration_num).max(1);
        let decay = (period - 1) as Real / period as Real;
        let increment = 1.0 / period as Real;

        for duty_cycle in &mut self.overlap_duty_cycles {
            *duty_cycle *= decay;
        }
        for (i, &overlap) in overlaps.iter().enumerate() {
            if overlap > 0 {
                self.overlap_duty_cycles[i] += increment;
            }
        }

        for duty_cycle in &mut self.active_duty_cycles {
            *duty_cycle *= decay;
        }
        for &column in active_columns {
            self.active_duty_cycles[column as usize] += increment;
        }
    }

    /// Gives columns starved of overlap a uniform permanence bump.
    fn bump_up_weak_columns(&mut self) {
        for column in 0..self.num_columns {
            if self.overlap_duty_cycles[column] < self.min_overlap_duty_cycles[column] {
                self.connections
                    .bump_segment(column as Segment, self.syn_perm_below_stimulus_inc);
            }
        }
    }

    /// Recomputes the homeostatic boost factors
    /// `exp((target_density - active_duty_cycle) * boost_strength)`.
    fn update_boost_factors(&mut self) {
        if self.boost_strength < EPSILON {
            return;
        }

        if self.global_inhibition {
            let target_density = self.inhibition_density();
            for (factor, &duty_cycle) in
                self.boost_factors.iter_mut().zip(&self.active_duty_cycles)
            {
                *factor = ((target_density - duty_cycle) * self.boost_strength).exp();
            }
        } else {
            for column in 0..self.num_columns {
                let target_density = self.with_neighbors(column, |neighbors| {
                    let total: Real = neighbors
                        .iter()
                        .map(|&n| self.active_duty_cycles[n])
                        .sum();
                    total / neighbors.len() as Real
                });
                self.boost_factors[column] = ((target_density
                    - self.active_duty_cycles[column])
                    * self.boost_strength)
                    .exp();
            }
        }
    }

    /// Recomputes the inhibition radius from the average connected span
    /// and the column/input ratio, then refreshes the neighborhood cache.
    fn update_inhibition_radius(&mut self) {
        if self.global_inhibition {
            self.inhibition_radius = self.column_dimensions.iter().copied().max().unwrap_or(1);
            return;
        }

        let mut connected_span = 0.0;
        for column in 0..self.num_columns {
            connected_span += self.avg_connected_span_for_column(column);
        }
        connected_span /= self.num_columns as Real;

        let columns_per_input = self.avg_columns_per_input();
        let diameter = connected_span * columns_per_input;
        let radius = ((diameter - 1.0) / 2.0).max(1.0);
        self.inhibition_radius = radius.round() as UInt;

        self.neighborhoods = Neighborhood::compute_all(
            &self.column_dimensions,
            self.inhibition_radius,
            self.wrap_mode(),
        );
    }

    /// Mean, over axes, of the connected receptive field extent
    /// `max_coord - min_coord + 1`; zero when nothing is connected.
    fn avg_connected_span_for_column(&self, column: usize) -> Real {
        let num_dims = self.input_dimensions.len();
        let mut min_coord = vec![UInt::MAX; num_dims];
        let mut max_coord = vec![0; num_dims];
        let mut any_connected = false;

        for &synapse in self.connections.synapses_for_segment(column as Segment) {
            let data = self.connections.data_for_synapse(synapse);
            if data.permanence < self.syn_perm_connected {
                continue;
            }
            any_connected = true;
            let coords = Topology::index_to_coordinates(
                data.presynaptic_cell as usize,
                &self.input_dimensions,
            );
            for (dim, &c) in coords.iter().enumerate() {
                min_coord[dim] = min_coord[dim].min(c);
                max_coord[dim] = max_coord[dim].max(c);
            }
        }

        if !any_connected {
            return 0.0;
        }

        let total_span: UInt = max_coord
            .iter()
            .zip(&min_coord)
            .map(|(&max, &min)| max - min + 1)
            .sum();
        total_span as Real / num_dims as Real
    }

    /// Mean over axes of `column_dim / input_dim`.
    fn avg_columns_per_input(&self) -> Real {
        let num_dims = self
            .column_dimensions
            .len()
            .max(self.input_dimensions.len());
        let mut ratio_sum = 0.0;
        for dim in 0..num_dims {
            let col = self.column_dimensions.get(dim).copied().unwrap_or(1) as Real;
            let input = self.input_dimensions.get(dim).copied().unwrap_or(1) as Real;
            ratio_sum += col / input;
        }
        ratio_sum / num_dims as Real
    }

    fn update_min_duty_cycles(&mut self) {
        let max_dimension = self.column_dimensions.iter().copied().max().unwrap_or(1);
        if self.global_inhibition || self.inhibition_radius >= max_dimension {
            self.update_min_duty_cycles_global();
        } else {
            self.update_min_duty_cycles_local();
        }
    }

    fn update_min_duty_cycles_global(&mut self) {
        let max_overlap_duty = self
            .overlap_duty_cycles
            .iter()
            .copied()
            .fold(0.0_f32, Real::max);
        let floor = self.min_pct_overlap_duty_cycles * max_overlap_duty;
        self.min_overlap_duty_cycles.fill(floor);
    }

    fn update_min_duty_cycles_local(&mut self) {
        for column in 0..self.num_columns {
            let max_overlap_duty = self.with_neighbors(column, |neighbors| {
                neighbors
                    .iter()
                    .map(|&n| self.overlap_duty_cycles[n])
                    .fold(0.0_f32, Real::max)
            });
            self.min_overlap_duty_cycles[column] =
                self.min_pct_overlap_duty_cycles * max_overlap_duty;
        }
    }

    fn update_bookkeeping_vars(&mut self, learn: bool) {
        self.iteration_num += 1;
        if learn {
            self.iteration_learn_num += 1;
        }
    }

    fn is_update_round(&self) -> bool {
        self.iteration_num % self.update_period == 0
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Returns the input dimensions.
    pub fn input_dimensions(&self) -> &[UInt] {
        &self.input_dimensions
    }

    /// Returns the column dimensions.
    pub fn column_dimensions(&self) -> &[UInt] {
        &self.column_dimensions
    }

    /// Returns the number of inputs.
    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    /// Returns the number of columns.
    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    /// Returns the potential radius.
    pub fn potential_radius(&self) -> UInt {
        self.potential_radius
    }

    /// Returns the potential pool fraction.
    pub fn potential_pct(&self) -> Real {
        self.potential_pct
    }

    /// Returns whether global inhibition is enabled.
    pub fn global_inhibition(&self) -> bool {
        self.global_inhibition
    }

    /// Returns the configured local area density (0 when the column-count
    /// knob is in use).
    pub fn local_area_density(&self) -> Real {
        self.local_area_density
    }

    /// Returns the configured active-columns-per-area target (0 when the
    /// density knob is in use).
    pub fn num_active_columns_per_inh_area(&self) -> UInt {
        self.num_active_columns_per_inh_area
    }

    /// Returns the stimulus threshold.
    pub fn stimulus_threshold(&self) -> UInt {
        self.stimulus_threshold
    }

    /// Overrides the stimulus threshold.
    pub fn set_stimulus_threshold(&mut self, stimulus_threshold: UInt) {
        self.stimulus_threshold = stimulus_threshold;
    }

    /// Returns the current inhibition radius.
    pub fn inhibition_radius(&self) -> UInt {
        self.inhibition_radius
    }

    /// Overrides the inhibition radius and refreshes the neighborhood
    /// cache accordingly.
    pub fn set_inhibition_radius(&mut self, inhibition_radius: UInt) {
        self.inhibition_radius = inhibition_radius;
        if !self.global_inhibition {
            self.neighborhoods = Neighborhood::compute_all(
                &self.column_dimensions,
                self.inhibition_radius,
                self.wrap_mode(),
            );
        }
    }

    /// Returns the duty cycle period.
    pub fn duty_cycle_period(&self) -> UInt {
        self.duty_cycle_period
    }

    /// Returns the boost strength.
    pub fn boost_strength(&self) -> Real {
        self.boost_strength
    }

    /// Returns the update period for radius and min-duty refreshes.
    pub fn update_period(&self) -> UInt {
        self.update_period
    }

    /// Returns whether topology wrapping is enabled.
    pub fn wrap_around(&self) -> bool {
        self.wrap_around
    }

    /// Returns the iteration counter.
    pub fn iteration_num(&self) -> UInt {
        self.iteration_num
    }

    /// Returns the learning-iteration counter.
    pub fn iteration_learn_num(&self) -> UInt {
        self.iteration_learn_num
    }

    /// Returns the connected-permanence threshold.
    pub fn syn_perm_connected(&self) -> Permanence {
        self.syn_perm_connected
    }

    /// Returns the active-synapse increment.
    pub fn syn_perm_active_inc(&self) -> Permanence {
        self.syn_perm_active_inc
    }

    /// Returns the inactive-synapse decrement.
    pub fn syn_perm_inactive_dec(&self) -> Permanence {
        self.syn_perm_inactive_dec
    }

    /// Returns the below-stimulus increment derived from
    /// `syn_perm_connected / 10`.
    pub fn syn_perm_below_stimulus_inc(&self) -> Permanence {
        self.syn_perm_below_stimulus_inc
    }

    /// Returns the homeostatic floor fraction.
    pub fn min_pct_overlap_duty_cycles(&self) -> Real {
        self.min_pct_overlap_duty_cycles
    }

    /// Returns the per-column boost factors.
    pub fn boost_factors(&self) -> &[Real] {
        &self.boost_factors
    }

    /// Overrides the boost factors (testing hook).
    ///
    /// # Errors
    ///
    /// Returns an error if the length doesn't match the column count.
    pub fn set_boost_factors(&mut self, boost_factors: &[Real]) -> Result<()> {
        self.check_column_vector(boost_factors.len())?;
        self.boost_factors.copy_from_slice(boost_factors);
        Ok(())
    }

    /// Returns the per-column overlap duty cycles.
    pub fn overlap_duty_cycles(&self) -> &[Real] {
        &self.overlap_duty_cycles
    }

    /// Overrides the overlap duty cycles (testing hook).
    ///
    /// # Errors
    ///
    /// Returns an error if the length doesn't match the column count.
    pub fn set_overlap_duty_cycles(&mut self, duty_cycles: &[Real]) -> Result<()> {
        self.check_column_vector(duty_cycles.len())?;
        self.overlap_duty_cycles.copy_from_slice(duty_cycles);
        Ok(())
    }

    /// Returns the per-column active duty cycles.
    pub fn active_duty_cycles(&self) -> &[Real] {
        &self.active_duty_cycles
    }

    /// Overrides the active duty cycles (testing hook).
    ///
    /// # Errors
    ///
    /// Returns an error if the length doesn't match the column count.
    pub fn set_active_duty_cycles(&mut self, duty_cycles: &[Real]) -> Result<()> {
        self.check_column_vector(duty_cycles.len())?;
        self.active_duty_cycles.copy_from_slice(duty_cycles);
        Ok(())
    }

    /// Returns the per-column minimum overlap duty cycles.
    pub fn min_overlap_duty_cycles(&self) -> &[Real] {
        &self.min_overlap_duty_cycles
    }

    /// Overrides the minimum overlap duty cycles (testing hook).
    ///
    /// # Errors
    ///
    /// Returns an error if the length doesn't match the column count.
    pub fn set_min_overlap_duty_cycles(&mut self, duty_cycles: &[Real]) -> Result<()> {
        self.check_column_vector(duty_cycles.len())?;
        self.min_overlap_duty_cycles.copy_from_slice(duty_cycles);
        Ok(())
    }

    fn check_column_vector(&self, len: usize) -> Result<()> {
        if len != self.num_columns {
            return Err(VelesError::DimensionMismatch {
                expected: vec![self.num_columns as u32],
                actual: vec![len as u32],
            });
        }
        Ok(())
    }

    /// Returns the boosted overlaps from the last compute.
    pub fn boosted_overlaps(&self) -> &[Real] {
        &self.boosted_overlaps
    }

    /// Returns a reference to the synaptic connectivity.
    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    /// Returns the RNG state (for persistence and reproducibility checks).
    pub fn rng(&self) -> &Random {
        &self.rng
    }

    /// Returns a column's potential pool: the presynaptic inputs it has
    /// synapses to, sorted ascending.
    pub fn get_potential(&self, column: UInt) -> Vec<UInt> {
        let mut potential: Vec<UInt> = self
            .connections
            .presynaptic_cells_for_segment(column as Segment);
        potential.sort_unstable();
        potential
    }

    /// Returns a column's `(presynaptic_cell, permanence)` pairs, sorted by
    /// presynaptic cell.
    pub fn get_permanences(&self, column: UInt) -> Vec<(CellIdx, Permanence)> {
        let mut permanences: Vec<(CellIdx, Permanence)> = self
            .connections
            .synapses_for_segment(column as Segment)
            .iter()
            .map(|&s| {
                let data = self.connections.data_for_synapse(s);
                (data.presynaptic_cell, data.permanence)
            })
            .collect();
        permanences.sort_unstable_by_key(|&(cell, _)| cell);
        permanences
    }

    /// Returns the cached connected-synapse count of every column.
    pub fn connected_counts(&self) -> Vec<UInt> {
        (0..self.num_columns)
            .map(|column| self.connections.data_for_segment(column as Segment).num_connected)
            .collect()
    }
}

impl PartialEq for SpatialPooler {
    fn eq(&self, other: &Self) -> bool {
        self.input_dimensions == other.input_dimensions
            && self.column_dimensions == other.column_dimensions
            && self.potential_radius == other.potential_radius
            && (self.potential_pct - other.potential_pct).abs() < EPSILON
            && self.global_inhibition == other.global_inhibition
            && (self.local_area_density - other.local_area_density).abs() < EPSILON
            && self.num_active_columns_per_inh_area == other.num_active_columns_per_inh_area
            && self.stimulus_threshold == other.stimulus_threshold
            && self.inhibition_radius == other.inhibition_radius
            && self.duty_cycle_period == other.duty_cycle_period
            && (self.boost_strength - other.boost_strength).abs() < EPSILON
            && self.wrap_around == other.wrap_around
            && self.iteration_num == other.iteration_num
            && self.iteration_learn_num == other.iteration_learn_num
            && self.boost_factors == other.boost_factors
            && self.overlap_duty_cycles == other.overlap_duty_cycles
            && self.active_duty_cycles == other.active_duty_cycles
            && self.min_overlap_duty_cycles == other.min_overlap_duty_cycles
            && self.rng == other.rng
            && self.connections == other.connections
    }
}

impl crate::serialization::StreamSerializable for SpatialPooler {
    fn save_stream<W: std::io::Write>(&self, writer: &mut W) -> Result<()> {
        use crate::serialization::{wire, SP_STREAM_VERSION};

        wire::write_tag(writer, "SP")?;
        wire::write_u16_be(writer, SP_STREAM_VERSION)?;

        wire::write_u32_be(writer, self.input_dimensions.len() as u32)?;
        for &dim in &self.input_dimensions {
            wire::write_u32_be(writer, dim)?;
        }
        for &dim in &self.column_dimensions {
            wire::write_u32_be(writer, dim)?;
        }

        wire::write_u32_be(writer, self.potential_radius)?;
        wire::write_f32_le(writer, self.potential_pct)?;
        wire::write_u8(writer, u8::from(self.global_inhibition))?;
        wire::write_f32_le(writer, self.local_area_density)?;
        wire::write_u32_be(writer, self.num_active_columns_per_inh_area)?;
        wire::write_u32_be(writer, self.stimulus_threshold)?;
        wire::write_f32_le(writer, self.syn_perm_inactive_dec)?;
        wire::write_f32_le(writer, self.syn_perm_active_inc)?;
        wire::write_f32_le(writer, self.syn_perm_connected)?;
        wire::write_f32_le(writer, self.min_pct_overlap_duty_cycles)?;
        wire::write_u32_be(writer, self.duty_cycle_period)?;
        wire::write_f32_le(writer, self.boost_strength)?;
        wire::write_u8(writer, u8::from(self.wrap_around))?;
        wire::write_u32_be(writer, self.update_period)?;

        wire::write_u32_be(writer, self.iteration_num)?;
        wire::write_u32_be(writer, self.iteration_learn_num)?;
        wire::write_u32_be(writer, self.inhibition_radius)?;

        let rng_state = self.rng.state();
        wire::write_u64_be(writer, rng_state.seed)?;
        wire::write_u64_be(writer, (rng_state.word_pos >> 64) as u64)?;
        wire::write_u64_be(writer, rng_state.word_pos as u64)?;

        // One segment per column, synapses in ascending presynaptic order.
        wire::write_u32_be(writer, self.num_columns as u32)?;
        for column in 0..self.num_columns {
            let permanences = self.get_permanences(column as UInt);
            wire::write_u32_be(writer, column as u32)?;
            wire::write_u32_be(writer, permanences.len() as u32)?;
            for (presynaptic_cell, permanence) in permanences {
                wire::write_u32_be(writer, presynaptic_cell)?;
                wire::write_f32_le(writer, permanence)?;
            }
        }

        for &value in &self.overlap_duty_cycles {
            wire::write_f32_le(writer, value)?;
        }
        for &value in &self.active_duty_cycles {
            wire::write_f32_le(writer, value)?;
        }
        for &value in &self.min_overlap_duty_cycles {
            wire::write_f32_le(writer, value)?;
        }
        for &value in &self.boost_factors {
            wire::write_f32_le(writer, value)?;
        }

        Ok(())
    }

    fn load_stream<R: std::io::Read>(reader: &mut R) -> Result<Self> {
        use crate::serialization::{wire, SP_STREAM_VERSION};
        use crate::utils::RandomState;

        wire::read_tag(reader, "SP")?;
        let version = wire::read_u16_be(reader)?;
        if version != SP_STREAM_VERSION {
            return Err(VelesError::UnsupportedVersion { found: version });
        }

        let rank = wire::read_u32_be(reader)? as usize;
        if rank == 0 || rank > 64 {
            return Err(VelesError::SerializationError {
                message: format!("implausible dimension rank {rank}"),
            });
        }
        let mut input_dimensions = Vec::with_capacity(rank);
        for _ in 0..rank {
            input_dimensions.push(wire::read_u32_be(reader)?);
        }
        let mut column_dimensions = Vec::with_capacity(rank);
        for _ in 0..rank {
            column_dimensions.push(wire::read_u32_be(reader)?);
        }

        let potential_radius = wire::read_u32_be(reader)?;
        let potential_pct = wire::read_f32_le(reader)?;
        let global_inhibition = wire::read_u8(reader)? != 0;
        let local_area_density = wire::read_f32_le(reader)?;
        let num_active_columns_per_inh_area = wire::read_u32_be(reader)?;
        let stimulus_threshold = wire::read_u32_be(reader)?;
        let syn_perm_inactive_dec = wire::read_f32_le(reader)?;
        let syn_perm_active_inc = wire::read_f32_le(reader)?;
        let syn_perm_connected = wire::read_f32_le(reader)?;
        let min_pct_overlap_duty_cycles = wire::read_f32_le(reader)?;
        let duty_cycle_period = wire::read_u32_be(reader)?;
        let boost_strength = wire::read_f32_le(reader)?;
        let wrap_around = wire::read_u8(reader)? != 0;
        let update_period = wire::read_u32_be(reader)?;

        let iteration_num = wire::read_u32_be(reader)?;
        let iteration_learn_num = wire::read_u32_be(reader)?;
        let inhibition_radius = wire::read_u32_be(reader)?;

        let seed = wire::read_u64_be(reader)?;
        let word_pos_hi = wire::read_u64_be(reader)?;
        let word_pos_lo = wire::read_u64_be(reader)?;

        let params = SpatialPoolerParams {
            input_dimensions: input_dimensions.clone(),
            column_dimensions: column_dimensions.clone(),
            potential_radius,
            potential_pct,
            global_inhibition,
            local_area_density,
            num_active_columns_per_inh_area,
            stimulus_threshold,
            syn_perm_inactive_dec,
            syn_perm_active_inc,
            syn_perm_connected,
            min_pct_overlap_duty_cycles,
            duty_cycle_period,
            boost_strength,
            seed: seed as i64,
            wrap_around,
        };
        Self::validate(&params)?;

        let num_inputs = Topology::num_elements(&input_dimensions);
        let num_columns = Topology::num_elements(&column_dimensions);

        let num_segments = wire::read_u32_be(reader)? as usize;
        if num_segments != num_columns {
            return Err(VelesError::SerializationError {
                message: format!(
                    "segment count {num_segments} does not match {num_columns} columns"
                ),
            });
        }

        // Re-create the synapses; connected counts are re-derived here.
        let mut connections = Connections::new(num_columns as CellIdx, syn_perm_connected);
        for column in 0..num_columns {
            let segment_id = wire::read_u32_be(reader)? as usize;
            if segment_id != column {
                return Err(VelesError::SerializationError {
                    message: format!("out-of-order segment id {segment_id}"),
                });
            }
            let num_synapses = wire::read_u32_be(reader)? as usize;
            if num_synapses > num_inputs {
                return Err(VelesError::SerializationError {
                    message: format!("synapse count {num_synapses} exceeds input count"),
                });
            }

            let segment = connections.create_segment(column as CellIdx, Some(1));
            for _ in 0..num_synapses {
                let presynaptic_cell = wire::read_u32_be(reader)?;
                let permanence = wire::read_f32_le(reader)?;
                if presynaptic_cell as usize >= num_inputs {
                    return Err(VelesError::SerializationError {
                        message: format!("presynaptic cell {presynaptic_cell} out of range"),
                    });
                }
                connections.create_synapse(segment, presynaptic_cell, permanence);
            }
        }

        let mut read_column_vector = |reader: &mut R| -> Result<Vec<Real>> {
            let mut values = Vec::with_capacity(num_columns);
            for _ in 0..num_columns {
                values.push(wire::read_f32_le(reader)?);
            }
            Ok(values)
        };
        let overlap_duty_cycles = read_column_vector(reader)?;
        let active_duty_cycles = read_column_vector(reader)?;
        let min_overlap_duty_cycles = read_column_vector(reader)?;
        let boost_factors = read_column_vector(reader)?;

        let mut sp = Self {
            input_dimensions,
            column_dimensions,
            num_inputs,
            num_columns,
            potential_radius,
            potential_pct,
            global_inhibition,
            local_area_density,
            num_active_columns_per_inh_area,
            stimulus_threshold,
            inhibition_radius,
            duty_cycle_period,
            boost_strength,
            wrap_around,
            update_period,

            syn_perm_inactive_dec,
            syn_perm_active_inc,
            syn_perm_below_stimulus_inc: syn_perm_connected / 10.0,
            syn_perm_connected,
            min_pct_overlap_duty_cycles,
            init_connected_pct: 0.5,

            boost_factors,
            overlap_duty_cycles,
            active_duty_cycles,
            min_overlap_duty_cycles,
            boosted_overlaps: vec![0.0; num_columns],

            connections,

            iteration_num,
            iteration_learn_num,

            neighborhoods: Neighborhood::new(),
            rng: Random::restore(RandomState {
                seed,
                word_pos: (u128::from(word_pos_hi) << 64) | u128::from(word_pos_lo),
            }),
        };

        if !sp.global_inhibition {
            sp.neighborhoods = Neighborhood::compute_all(
                &sp.column_dimensions,
                sp.inhibition_radius,
                sp.wrap_mode(),
            );
        }

        Ok(sp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> SpatialPoolerParams {
        SpatialPoolerParams {
            input_dimensions: vec![100],
            column_dimensions: vec![200],
            potential_radius: 50,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_spatial_pooler() {
        let sp = SpatialPooler::new(small_params()).unwrap();
        assert_eq!(sp.num_inputs(), 100);
        assert_eq!(sp.num_columns(), 200);
        assert_eq!(sp.iteration_num(), 0);
        assert!((sp.syn_perm_below_stimulus_inc() - 0.01).abs() < 1e-6);
        // Every column got its single segment.
        assert_eq!(sp.connections().num_segments(), 200);
    }

    #[test]
    fn test_invalid_params() {
        let cases: Vec<SpatialPoolerParams> = vec![
            SpatialPoolerParams {
                input_dimensions: vec![],
                ..small_params()
            },
            SpatialPoolerParams {
                column_dimensions: vec![200, 0],
                input_dimensions: vec![100, 1],
                ..small_params()
            },
            // Rank mismatch.
            SpatialPoolerParams {
                input_dimensions: vec![10, 10],
                ..small_params()
            },
            SpatialPoolerParams {
                potential_pct: 1.5,
                ..small_params()
            },
            SpatialPoolerParams {
                potential_radius: 100,
                ..small_params()
            },
            // Both sparsity knobs.
            SpatialPoolerParams {
                local_area_density: 0.05,
                num_active_columns_per_inh_area: 10,
                ..small_params()
            },
            // Neither sparsity knob.
            SpatialPoolerParams {
                local_area_density: 0.0,
                num_active_columns_per_inh_area: 0,
                ..small_params()
            },
            SpatialPoolerParams {
                duty_cycle_period: 0,
                ..small_params()
            },
            SpatialPoolerParams {
                boost_strength: -1.0,
                ..small_params()
            },
            SpatialPoolerParams {
                syn_perm_connected: 0.0,
                ..small_params()
            },
        ];

        for params in cases {
            assert!(SpatialPooler::new(params).is_err());
        }
    }

    #[test]
    fn test_initialization_respects_stimulus_threshold() {
        let sp = SpatialPooler::new(SpatialPoolerParams {
            stimulus_threshold: 3,
            ..small_params()
        })
        .unwrap();

        for (column, &count) in sp.connected_counts().iter().enumerate() {
            let num_synapses = sp.get_potential(column as UInt).len() as UInt;
            assert!(
                count >= 3.min(num_synapses),
                "column {column}: {count} connected of {num_synapses}"
            );
        }
    }

    #[test]
    fn test_compute_validates_sizes() {
        let mut sp = SpatialPooler::new(small_params()).unwrap();
        let input = Sdr::new(&[99]).unwrap();
        let mut active = Sdr::new(&[200]).unwrap();
        assert!(sp.compute(&input, false, &mut active).is_err());

        let input = Sdr::new(&[100]).unwrap();
        let mut active = Sdr::new(&[100]).unwrap();
        assert!(sp.compute(&input, false, &mut active).is_err());
    }

    #[test]
    fn test_compute_basic() {
        let mut sp = SpatialPooler::new(SpatialPoolerParams {
            local_area_density: 0.1,
            ..small_params()
        })
        .unwrap();

        let mut input = Sdr::new(&[100]).unwrap();
        let mut active = Sdr::new(&[200]).unwrap();

        input.set_sparse(&[1, 5, 10, 20, 30]).unwrap();
        let overlaps = sp.compute(&input, true, &mut active).unwrap();

        assert_eq!(overlaps.len(), 200);
        assert_eq!(active.get_sum(), 20);
        assert_eq!(sp.iteration_num(), 1);
        assert_eq!(sp.iteration_learn_num(), 1);

        // The active list is sorted ascending.
        let sparse = active.get_sparse();
        assert!(sparse.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_deterministic_given_seed() {
        let mut sp1 = SpatialPooler::new(small_params()).unwrap();
        let mut sp2 = SpatialPooler::new(small_params()).unwrap();
        assert_eq!(sp1, sp2);

        let mut rng = Random::new(99);
        let mut input = Sdr::new(&[100]).unwrap();
        let mut active1 = Sdr::new(&[200]).unwrap();
        let mut active2 = Sdr::new(&[200]).unwrap();

        for _ in 0..50 {
            input.randomize(0.1, &mut rng);
            sp1.compute(&input, true, &mut active1).unwrap();
            sp2.compute(&input, true, &mut active2).unwrap();
            assert_eq!(active1.get_sparse(), active2.get_sparse());
        }
        assert_eq!(sp1, sp2);
    }

    #[test]
    fn test_different_seeds_differ() {
        let sp1 = SpatialPooler::new(small_params()).unwrap();
        let sp2 = SpatialPooler::new(SpatialPoolerParams {
            seed: 2,
            ..small_params()
        })
        .unwrap();
        assert_ne!(sp1.get_permanences(0), sp2.get_permanences(0));
    }

    #[test]
    fn test_learning_changes_permanences() {
        let mut sp = SpatialPooler::new(SpatialPoolerParams {
            input_dimensions: vec![50],
            column_dimensions: vec![100],
            potential_radius: 25,
            ..Default::default()
        })
        .unwrap();

        let mut input = Sdr::new(&[50]).unwrap();
        let mut active = Sdr::new(&[100]).unwrap();
        input.set_sparse(&[0, 1, 2, 3, 4]).unwrap();

        let before: Vec<_> = (0..100).map(|c| sp.get_permanences(c)).collect();
        for _ in 0..20 {
            sp.compute(&input, true, &mut active).unwrap();
        }
        let after: Vec<_> = (0..100).map(|c| sp.get_permanences(c)).collect();
        assert_ne!(before, after);
    }

    #[test]
    fn test_no_learning_when_disabled() {
        let mut sp = SpatialPooler::new(small_params()).unwrap();
        let mut input = Sdr::new(&[100]).unwrap();
        let mut active = Sdr::new(&[200]).unwrap();
        input.set_sparse(&[5, 6, 7]).unwrap();

        let before: Vec<_> = (0..200).map(|c| sp.get_permanences(c)).collect();
        sp.compute(&input, false, &mut active).unwrap();
        let after: Vec<_> = (0..200).map(|c| sp.get_permanences(c)).collect();

        assert_eq!(before, after);
        assert_eq!(sp.iteration_learn_num(), 0);
        assert_eq!(sp.iteration_num(), 1);
    }

    #[test]
    fn test_stability_without_boosting() {
        let mut sp = SpatialPooler::new(SpatialPoolerParams {
            boost_strength: 0.0,
            ..small_params()
        })
        .unwrap();

        let mut input = Sdr::new(&[100]).unwrap();
        let mut active1 = Sdr::new(&[200]).unwrap();
        let mut active2 = Sdr::new(&[200]).unwrap();
        input.set_sparse(&[10, 20, 30]).unwrap();

        for _ in 0..100 {
            sp.compute(&input, true, &mut active1).unwrap();
        }
        sp.compute(&input, false, &mut active1).unwrap();
        sp.compute(&input, false, &mut active2).unwrap();
        assert_eq!(active1.get_sparse(), active2.get_sparse());
    }

    #[test]
    fn test_global_inhibition_tie_break() {
        let sp = SpatialPooler::new(SpatialPoolerParams {
            input_dimensions: vec![10],
            column_dimensions: vec![10],
            potential_radius: 5,
            local_area_density: 0.3,
            ..Default::default()
        })
        .unwrap();

        // All overlaps equal: the highest indices win.
        let overlaps = vec![1.0; 10];
        let mut active = sp.inhibit_columns_global(&overlaps, 0.3);
        active.sort_unstable();
        assert_eq!(active, vec![7, 8, 9]);
    }

    #[test]
    fn test_global_inhibition_drops_subthreshold() {
        let mut sp = SpatialPooler::new(SpatialPoolerParams {
            input_dimensions: vec![10],
            column_dimensions: vec![10],
            potential_radius: 5,
            local_area_density: 0.5,
            ..Default::default()
        })
        .unwrap();
        sp.set_stimulus_threshold(2);

        let mut overlaps = vec![0.0; 10];
        overlaps[3] = 5.0;
        overlaps[6] = 2.0;
        overlaps[8] = 1.0; // below threshold
        let mut active = sp.inhibit_columns_global(&overlaps, 0.5);
        active.sort_unstable();
        assert_eq!(active, vec![3, 6]);
    }

    #[test]
    fn test_local_inhibition_tie_break_even_columns() {
        let mut sp = SpatialPooler::new(SpatialPoolerParams {
            input_dimensions: vec![10],
            column_dimensions: vec![10],
            potential_radius: 5,
            global_inhibition: false,
            wrap_around: false,
            local_area_density: 0.33,
            ..Default::default()
        })
        .unwrap();
        sp.set_inhibition_radius(1);

        // All overlaps equal; earlier winners suppress equal neighbors, so
        // the ascending sweep activates exactly the even columns.
        let overlaps = vec![3.0; 10];
        let active = sp.inhibit_columns_local(&overlaps, 1.0 / 3.0);
        assert_eq!(active, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn test_local_inhibition_higher_overlap_wins() {
        let mut sp = SpatialPooler::new(SpatialPoolerParams {
            input_dimensions: vec![10],
            column_dimensions: vec![10],
            potential_radius: 5,
            global_inhibition: false,
            wrap_around: false,
            local_area_density: 0.33,
            ..Default::default()
        })
        .unwrap();
        sp.set_inhibition_radius(2);

        let mut overlaps = vec![1.0; 10];
        overlaps[4] = 10.0;
        let active = sp.inhibit_columns_local(&overlaps, 1.0 / 3.0);
        assert!(active.contains(&4));
        // Columns dominated by both the peak and an equal active neighbor
        // lose the competition.
        assert!(!active.contains(&2));
        assert!(!active.contains(&5));
    }

    #[test]
    fn test_duty_cycle_convergence() {
        let mut sp = SpatialPooler::new(SpatialPoolerParams {
            input_dimensions: vec![10],
            column_dimensions: vec![10],
            potential_radius: 5,
            duty_cycle_period: 10,
            local_area_density: 0.1,
            ..Default::default()
        })
        .unwrap();

        // Column 3 overlaps and fires every step for 100 steps.
        let mut overlaps = vec![0u32; 10];
        overlaps[3] = 5;
        for _ in 0..100 {
            sp.update_bookkeeping_vars(true);
            sp.update_duty_cycles(&overlaps, &[3]);
        }

        assert!((sp.active_duty_cycles()[3] - 1.0).abs() < 1e-4);
        assert!((sp.overlap_duty_cycles()[3] - 1.0).abs() < 1e-4);
        for column in (0..10).filter(|&c| c != 3) {
            assert!(sp.active_duty_cycles()[column].abs() < 1e-4);
        }
    }

    #[test]
    fn test_bump_up_weak_columns() {
        let mut sp = SpatialPooler::new(SpatialPoolerParams {
            input_dimensions: vec![10],
            column_dimensions: vec![10],
            potential_radius: 5,
            ..Default::default()
        })
        .unwrap();

        sp.set_overlap_duty_cycles(&[0.0; 10]).unwrap();
        let mut mins = [0.0; 10];
        mins[2] = 0.5;
        sp.set_min_overlap_duty_cycles(&mins).unwrap();

        let before_weak = sp.get_permanences(2);
        let before_healthy = sp.get_permanences(3);
        sp.bump_up_weak_columns();

        for ((cell_b, perm_b), (cell_a, perm_a)) in
            before_weak.iter().zip(&sp.get_permanences(2))
        {
            assert_eq!(cell_b, cell_a);
            let expected = (perm_b + sp.syn_perm_below_stimulus_inc()).min(1.0);
            assert!((perm_a - expected).abs() < 1e-6);
        }

        // Columns above their floor are untouched.
        assert_eq!(before_healthy, sp.get_permanences(3));
    }

    #[test]
    fn test_boost_factors_follow_duty_cycles() {
        let mut sp = SpatialPooler::new(SpatialPoolerParams {
            input_dimensions: vec![10],
            column_dimensions: vec![10],
            potential_radius: 5,
            boost_strength: 2.0,
            local_area_density: 0.2,
            ..Default::default()
        })
        .unwrap();

        let mut duty = [0.0; 10];
        duty[1] = 0.9; // overactive column
        sp.set_active_duty_cycles(&duty).unwrap();
        sp.update_boost_factors();

        // Overactive columns are suppressed below neutral, idle ones boosted.
        assert!(sp.boost_factors()[1] < 1.0);
        assert!(sp.boost_factors()[0] > 1.0);
    }

    #[test]
    fn test_boost_disabled_below_epsilon() {
        let mut sp = SpatialPooler::new(SpatialPoolerParams {
            input_dimensions: vec![10],
            column_dimensions: vec![10],
            potential_radius: 5,
            boost_strength: 0.0,
            ..Default::default()
        })
        .unwrap();

        let mut duty = [0.0; 10];
        duty[1] = 0.9;
        sp.set_active_duty_cycles(&duty).unwrap();
        sp.update_boost_factors();

        assert_eq!(sp.boost_factors(), vec![1.0; 10].as_slice());
    }

    #[test]
    fn test_update_inhibition_radius_global() {
        let mut sp = SpatialPooler::new(SpatialPoolerParams {
            input_dimensions: vec![8, 8],
            column_dimensions: vec![16, 4],
            potential_radius: 3,
            ..Default::default()
        })
        .unwrap();

        sp.update_inhibition_radius();
        assert_eq!(sp.inhibition_radius(), 16);
    }

    #[test]
    fn test_min_duty_cycles_global() {
        let mut sp = SpatialPooler::new(SpatialPoolerParams {
            input_dimensions: vec![10],
            column_dimensions: vec![10],
            potential_radius: 5,
            min_pct_overlap_duty_cycles: 0.1,
            ..Default::default()
        })
        .unwrap();

        let mut duty = [0.0; 10];
        duty[7] = 0.6;
        sp.set_overlap_duty_cycles(&duty).unwrap();
        sp.update_min_duty_cycles();

        for &floor in sp.min_overlap_duty_cycles() {
            assert!((floor - 0.06).abs() < 1e-6);
        }
    }

    #[test]
    fn test_setter_length_validation() {
        let mut sp = SpatialPooler::new(small_params()).unwrap();
        assert!(sp.set_boost_factors(&[1.0; 3]).is_err());
        assert!(sp.set_active_duty_cycles(&[0.0; 3]).is_err());
        assert!(sp.set_overlap_duty_cycles(&[0.0; 3]).is_err());
        assert!(sp.set_min_overlap_duty_cycles(&[0.0; 3]).is_err());
    }

    #[test]
    fn test_sparsity_with_column_count_knob() {
        let mut sp = SpatialPooler::new(SpatialPoolerParams {
            input_dimensions: vec![100],
            column_dimensions: vec![1000],
            potential_radius: 50,
            local_area_density: 0.0,
            num_active_columns_per_inh_area: 40,
            global_inhibition: true,
            ..Default::default()
        })
        .unwrap();

        let mut rng = Random::new(5);
        let mut input = Sdr::new(&[100]).unwrap();
        let mut active = Sdr::new(&[1000]).unwrap();

        for _ in 0..10 {
            input.randomize(0.1, &mut rng);
            sp.compute(&input, true, &mut active).unwrap();
            assert_eq!(active.get_sum(), 40);
        }
    }
}
