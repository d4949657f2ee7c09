//! Connections - the synaptic connectivity store used by the Spatial Pooler.
//!
//! Each cell (column) owns segments, and each segment owns synapses
//! `(presynaptic_cell, permanence)`. The store keeps two hot-path caches
//! consistent across every permanence update: a per-segment count of
//! connected synapses, and a map from presynaptic cell to its connected
//! synapses used by [`Connections::compute_activity`].

use crate::types::{
    CellIdx, Permanence, Sdr, Segment, SegmentIdx, Synapse, UInt, MAX_PERMANENCE, MIN_PERMANENCE,
};

use ahash::AHashMap;
use smallvec::SmallVec;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Data associated with a synapse.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SynapseData {
    /// The presynaptic cell this synapse connects to.
    pub presynaptic_cell: CellIdx,

    /// The permanence strength of this synapse.
    pub permanence: Permanence,

    /// The segment this synapse belongs to.
    pub segment: Segment,
}

/// Data associated with a segment.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SegmentData {
    /// The synapses on this segment.
    pub synapses: SmallVec<[Synapse; 32]>,

    /// The cell this segment belongs to.
    pub cell: CellIdx,

    /// Number of connected synapses (permanence >= threshold). Cached
    /// because it is read on every activity computation and every
    /// raise-to-threshold round.
    pub num_connected: UInt,
}

impl SegmentData {
    fn new(cell: CellIdx) -> Self {
        Self {
            synapses: SmallVec::new(),
            cell,
            num_connected: 0,
        }
    }
}

/// Data associated with a cell.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CellData {
    /// The segments on this cell.
    pub segments: SmallVec<[Segment; 1]>,
}

/// The synaptic connectivity store.
///
/// Invariants maintained by every mutation:
/// - `num_connected` on each segment equals the number of its synapses
///   with `permanence >= connected_threshold`;
/// - no segment holds two synapses to the same presynaptic cell.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Connections {
    cells: Vec<CellData>,
    segments: Vec<SegmentData>,
    destroyed_segments: Vec<Segment>,
    synapses: Vec<SynapseData>,
    destroyed_synapses: Vec<Synapse>,

    /// Permanence threshold for a synapse to count as connected.
    connected_threshold: Permanence,

    /// Iteration counter, incremented by `compute_activity`.
    iteration: u32,

    /// Maps presynaptic cell -> connected synapses from that cell.
    connected_synapses_for_presynaptic_cell: AHashMap<CellIdx, Vec<Synapse>>,
}

impl Connections {
    /// Creates a store for `num_cells` cells with the given connected
    /// threshold.
    #[must_use]
    pub fn new(num_cells: CellIdx, connected_threshold: Permanence) -> Self {
        Self {
            cells: vec![CellData::default(); num_cells as usize],
            segments: Vec::new(),
            destroyed_segments: Vec::new(),
            synapses: Vec::new(),
            destroyed_synapses: Vec::new(),
            connected_threshold,
            iteration: 0,
            connected_synapses_for_presynaptic_cell: AHashMap::new(),
        }
    }

    /// Returns the number of cells.
    #[inline]
    #[must_use]
    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    /// Returns the connected threshold.
    #[inline]
    #[must_use]
    pub fn connected_threshold(&self) -> Permanence {
        self.connected_threshold
    }

    /// Returns the iteration count.
    #[inline]
    #[must_use]
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Returns the number of live segments.
    #[must_use]
    pub fn num_segments(&self) -> usize {
        self.segments.len() - self.destroyed_segments.len()
    }

    /// Returns the number of live synapses.
    #[must_use]
    pub fn num_synapses(&self) -> usize {
        self.synapses.len() - self.destroyed_synapses.len()
    }

    /// Returns the number of synapses on a segment.
    #[must_use]
    pub fn num_synapses_on_segment(&self, segment: Segment) -> usize {
        self.segments[segment as usize].synapses.len()
    }

    /// Length of the flat segment list, including destroyed slots. The
    /// activity vector uses this indexing.
    #[must_use]
    pub fn segment_flat_list_length(&self) -> usize {
        self.segments.len()
    }

    // ========================================================================
    // Segment operations
    // ========================================================================

    /// Creates a new segment on a cell, pruning the smallest segment first
    /// when `max_segments_per_cell` would be exceeded.
    pub fn create_segment(
        &mut self,
        cell: CellIdx,
        max_segments_per_cell: Option<SegmentIdx>,
    ) -> Segment {
        if let Some(max) = max_segments_per_cell {
            while self.cells[cell as usize].segments.len() >= max as usize {
                self.prune_segment(cell);
            }
        }

        let segment = if let Some(reuse) = self.destroyed_segments.pop() {
            self.segments[reuse as usize] = SegmentData::new(cell);
            reuse
        } else {
            let segment = self.segments.len() as Segment;
            self.segments.push(SegmentData::new(cell));
            segment
        };

        self.cells[cell as usize].segments.push(segment);
        segment
    }

    /// Destroys a segment and all its synapses.
    pub fn destroy_segment(&mut self, segment: Segment) {
        let cell = self.segments[segment as usize].cell;

        let synapses: Vec<Synapse> =
            self.segments[segment as usize].synapses.iter().copied().collect();
        for synapse in synapses {
            self.destroy_synapse(synapse);
        }

        let cell_segments = &mut self.cells[cell as usize].segments;
        if let Some(pos) = cell_segments.iter().position(|&s| s == segment) {
            cell_segments.swap_remove(pos);
        }

        self.destroyed_segments.push(segment);
    }

    fn prune_segment(&mut self, cell: CellIdx) {
        let segments = &self.cells[cell as usize].segments;
        if segments.is_empty() {
            return;
        }

        let smallest = segments
            .iter()
            .copied()
            .min_by_key(|&s| self.segments[s as usize].synapses.len());
        if let Some(segment) = smallest {
            self.destroy_segment(segment);
        }
    }

    /// Gets the segments for a cell.
    #[inline]
    #[must_use]
    pub fn segments_for_cell(&self, cell: CellIdx) -> &[Segment] {
        &self.cells[cell as usize].segments
    }

    /// Gets the cell that owns a segment.
    #[inline]
    #[must_use]
    pub fn cell_for_segment(&self, segment: Segment) -> CellIdx {
        self.segments[segment as usize].cell
    }

    /// Gets the segment data.
    #[inline]
    #[must_use]
    pub fn data_for_segment(&self, segment: Segment) -> &SegmentData {
        &self.segments[segment as usize]
    }

    // ========================================================================
    // Synapse operations
    // ========================================================================

    /// Creates a synapse on a segment.
    ///
    /// If a synapse to the same presynaptic cell already exists on the
    /// segment, the two are coalesced: the existing synapse is returned,
    /// keeping the higher of the two permanences.
    pub fn create_synapse(
        &mut self,
        segment: Segment,
        presynaptic_cell: CellIdx,
        permanence: Permanence,
    ) -> Synapse {
        let existing = self.segments[segment as usize]
            .synapses
            .iter()
            .find(|&&s| self.synapses[s as usize].presynaptic_cell == presynaptic_cell)
            .copied();

        if let Some(synapse) = existing {
            if permanence > self.synapses[synapse as usize].permanence {
                self.update_synapse_permanence(synapse, permanence);
            }
            return synapse;
        }

        let permanence = permanence.clamp(MIN_PERMANENCE, MAX_PERMANENCE);
        let data = SynapseData {
            presynaptic_cell,
            permanence,
            segment,
        };

        let synapse = if let Some(reuse) = self.destroyed_synapses.pop() {
            self.synapses[reuse as usize] = data;
            reuse
        } else {
            let synapse = self.synapses.len() as Synapse;
            self.synapses.push(data);
            synapse
        };

        self.segments[segment as usize].synapses.push(synapse);

        if permanence >= self.connected_threshold {
            self.segments[segment as usize].num_connected += 1;
            self.connected_synapses_for_presynaptic_cell
                .entry(presynaptic_cell)
                .or_default()
                .push(synapse);
        }

        synapse
    }

    /// Destroys a synapse.
    pub fn destroy_synapse(&mut self, synapse: Synapse) {
        let SynapseData {
            presynaptic_cell,
            permanence,
            segment,
        } = self.synapses[synapse as usize];
        let was_connected = permanence >= self.connected_threshold;

        let segment_synapses = &mut self.segments[segment as usize].synapses;
        if let Some(pos) = segment_synapses.iter().position(|&s| s == synapse) {
            segment_synapses.swap_remove(pos);
        }

        if was_connected {
            self.segments[segment as usize].num_connected -= 1;
            self.unmap_connected(synapse, presynaptic_cell);
        }

        // Invalid permanence marks the slot as dead until reuse.
        self.synapses[synapse as usize].permanence = -1.0;
        self.destroyed_synapses.push(synapse);
    }

    /// Updates a synapse's permanence, clamping to `[0, 1]`.
    ///
    /// Keeps `num_connected` and the presynaptic map consistent when the
    /// permanence crosses the connected threshold.
    pub fn update_synapse_permanence(&mut self, synapse: Synapse, permanence: Permanence) {
        let permanence = permanence.clamp(MIN_PERMANENCE, MAX_PERMANENCE);
        let data = &mut self.synapses[synapse as usize];
        let was_connected = data.permanence >= self.connected_threshold;
        let is_connected = permanence >= self.connected_threshold;
        let presynaptic_cell = data.presynaptic_cell;
        let segment = data.segment;

        data.permanence = permanence;

        if was_connected == is_connected {
            return;
        }

        if is_connected {
            self.segments[segment as usize].num_connected += 1;
            self.connected_synapses_for_presynaptic_cell
                .entry(presynaptic_cell)
                .or_default()
                .push(synapse);
        } else {
            self.segments[segment as usize].num_connected -= 1;
            self.unmap_connected(synapse, presynaptic_cell);
        }
    }

    fn unmap_connected(&mut self, synapse: Synapse, presynaptic_cell: CellIdx) {
        if let Some(synapses) = self
            .connected_synapses_for_presynaptic_cell
            .get_mut(&presynaptic_cell)
        {
            if let Some(pos) = synapses.iter().position(|&s| s == synapse) {
                synapses.swap_remove(pos);
            }
        }
    }

    /// Gets the synapses on a segment.
    #[inline]
    #[must_use]
    pub fn synapses_for_segment(&self, segment: Segment) -> &[Synapse] {
        &self.segments[segment as usize].synapses
    }

    /// Gets the synapse data.
    #[inline]
    #[must_use]
    pub fn data_for_synapse(&self, synapse: Synapse) -> &SynapseData {
        &self.synapses[synapse as usize]
    }

    /// Gets the presynaptic cells for a segment.
    #[must_use]
    pub fn presynaptic_cells_for_segment(&self, segment: Segment) -> Vec<CellIdx> {
        self.segments[segment as usize]
            .synapses
            .iter()
            .map(|&s| self.synapses[s as usize].presynaptic_cell)
            .collect()
    }

    // ========================================================================
    // Activity computation
    // ========================================================================

    /// Computes per-segment activity for the given active presynaptic
    /// cells: the number of *connected* synapses from an active cell.
    ///
    /// The result is indexed by segment id and has
    /// [`Connections::segment_flat_list_length`] entries.
    pub fn compute_activity(
        &mut self,
        active_presynaptic_cells: &[CellIdx],
        _learn: bool,
    ) -> Vec<UInt> {
        self.iteration += 1;

        let mut num_active_connected = vec![0u32; self.segments.len()];
        for cell in active_presynaptic_cells {
            if let Some(synapses) = self.connected_synapses_for_presynaptic_cell.get(cell) {
                for &synapse in synapses {
                    let segment = self.synapses[synapse as usize].segment;
                    num_active_connected[segment as usize] += 1;
                }
            }
        }

        num_active_connected
    }

    // ========================================================================
    // Learning operations
    // ========================================================================

    /// Adapts a segment toward the input pattern: synapses from active
    /// input bits gain `increment`, the rest lose `decrement`, clamped.
    pub fn adapt_segment(
        &mut self,
        segment: Segment,
        inputs: &Sdr,
        increment: Permanence,
        decrement: Permanence,
    ) {
        let synapses: Vec<Synapse> =
            self.segments[segment as usize].synapses.iter().copied().collect();

        inputs.with_dense(|dense| {
            for synapse in synapses {
                let data = &self.synapses[synapse as usize];
                let old_perm = data.permanence;
                let active = dense[data.presynaptic_cell as usize] != 0;

                let new_perm = if active {
                    (old_perm + increment).min(MAX_PERMANENCE)
                } else {
                    (old_perm - decrement).max(MIN_PERMANENCE)
                };

                if new_perm != old_perm {
                    self.update_synapse_permanence(synapse, new_perm);
                }
            }
        });
    }

    /// Raises permanences uniformly until the segment has at least
    /// `threshold` connected synapses.
    ///
    /// Each round adds `increment` to every synapse on the segment,
    /// clamping to `[0, 1]`. The loop stops as soon as the invariant holds,
    /// or when no permanence can rise further (all saturated), which bounds
    /// the rounds by `ceil(1 / increment)`.
    pub fn raise_permanences_to_threshold(
        &mut self,
        segment: Segment,
        threshold: UInt,
        increment: Permanence,
    ) {
        if threshold == 0 || increment <= 0.0 {
            return;
        }

        while self.segments[segment as usize].num_connected < threshold {
            let mut any_raised = false;

            let synapses: Vec<Synapse> =
                self.segments[segment as usize].synapses.iter().copied().collect();
            for synapse in synapses {
                let old_perm = self.synapses[synapse as usize].permanence;
                let new_perm = (old_perm + increment).min(MAX_PERMANENCE);
                if new_perm != old_perm {
                    any_raised = true;
                    self.update_synapse_permanence(synapse, new_perm);
                }
            }

            if !any_raised {
                break;
            }
        }
    }

    /// Adds `delta` to every synapse's permanence on the segment, clamped.
    pub fn bump_segment(&mut self, segment: Segment, delta: Permanence) {
        let synapses: Vec<Synapse> =
            self.segments[segment as usize].synapses.iter().copied().collect();

        for synapse in synapses {
            let old_perm = self.synapses[synapse as usize].permanence;
            let new_perm = (old_perm + delta).clamp(MIN_PERMANENCE, MAX_PERMANENCE);
            if new_perm != old_perm {
                self.update_synapse_permanence(synapse, new_perm);
            }
        }
    }
}

impl PartialEq for Connections {
    fn eq(&self, other: &Self) -> bool {
        self.cells == other.cells
            && self.segments == other.segments
            && self.synapses == other.synapses
            && (self.connected_threshold - other.connected_threshold).abs() < 1e-6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_connections() {
        let conn = Connections::new(100, 0.5);
        assert_eq!(conn.num_cells(), 100);
        assert_eq!(conn.num_segments(), 0);
        assert_eq!(conn.num_synapses(), 0);
    }

    #[test]
    fn test_create_segment() {
        let mut conn = Connections::new(100, 0.5);
        let seg = conn.create_segment(10, None);

        assert_eq!(conn.num_segments(), 1);
        assert_eq!(conn.cell_for_segment(seg), 10);
        assert_eq!(conn.segments_for_cell(10).len(), 1);
    }

    #[test]
    fn test_create_synapse() {
        let mut conn = Connections::new(100, 0.5);
        let seg = conn.create_segment(10, None);
        let syn = conn.create_synapse(seg, 50, 0.5);

        assert_eq!(conn.num_synapses(), 1);
        assert_eq!(conn.data_for_synapse(syn).segment, seg);
        assert_eq!(conn.data_for_synapse(syn).presynaptic_cell, 50);
        assert!((conn.data_for_synapse(syn).permanence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_connected_count() {
        let mut conn = Connections::new(100, 0.5);
        let seg = conn.create_segment(10, None);
        conn.create_synapse(seg, 50, 0.6);
        conn.create_synapse(seg, 51, 0.4);
        conn.create_synapse(seg, 52, 0.5); // at threshold counts

        assert_eq!(conn.data_for_segment(seg).num_connected, 2);
    }

    #[test]
    fn test_update_permanence_crossings() {
        let mut conn = Connections::new(100, 0.5);
        let seg = conn.create_segment(10, None);
        let syn = conn.create_synapse(seg, 50, 0.4);

        assert_eq!(conn.data_for_segment(seg).num_connected, 0);

        conn.update_synapse_permanence(syn, 0.6);
        assert_eq!(conn.data_for_segment(seg).num_connected, 1);

        conn.update_synapse_permanence(syn, 0.3);
        assert_eq!(conn.data_for_segment(seg).num_connected, 0);

        // Clamping.
        conn.update_synapse_permanence(syn, 7.5);
        assert!((conn.data_for_synapse(syn).permanence - 1.0).abs() < 1e-6);
        conn.update_synapse_permanence(syn, -2.0);
        assert!(conn.data_for_synapse(syn).permanence.abs() < 1e-6);
    }

    #[test]
    fn test_destroy_synapse() {
        let mut conn = Connections::new(100, 0.5);
        let seg = conn.create_segment(10, None);
        let syn = conn.create_synapse(seg, 50, 0.6);

        conn.destroy_synapse(syn);
        assert_eq!(conn.num_synapses(), 0);
        assert_eq!(conn.num_synapses_on_segment(seg), 0);
        assert_eq!(conn.data_for_segment(seg).num_connected, 0);

        // Activity no longer sees the destroyed synapse.
        let activity = conn.compute_activity(&[50], false);
        assert_eq!(activity[seg as usize], 0);
    }

    #[test]
    fn test_destroy_segment() {
        let mut conn = Connections::new(100, 0.5);
        let seg = conn.create_segment(10, None);
        conn.create_synapse(seg, 50, 0.5);
        conn.create_synapse(seg, 51, 0.5);

        conn.destroy_segment(seg);
        assert_eq!(conn.num_segments(), 0);
        assert_eq!(conn.num_synapses(), 0);
        assert!(conn.segments_for_cell(10).is_empty());
    }

    #[test]
    fn test_compute_activity() {
        let mut conn = Connections::new(100, 0.5);

        let seg1 = conn.create_segment(10, None);
        conn.create_synapse(seg1, 50, 0.6);
        conn.create_synapse(seg1, 51, 0.6);
        conn.create_synapse(seg1, 52, 0.4); // not connected

        let seg2 = conn.create_segment(20, None);
        conn.create_synapse(seg2, 50, 0.6);

        let activity = conn.compute_activity(&[50, 51, 53], true);

        assert_eq!(activity[seg1 as usize], 2);
        assert_eq!(activity[seg2 as usize], 1);
        assert_eq!(conn.iteration(), 1);
    }

    #[test]
    fn test_adapt_segment() {
        let mut conn = Connections::new(100, 0.5);
        let seg = conn.create_segment(10, None);
        let syn1 = conn.create_synapse(seg, 50, 0.5);
        let syn2 = conn.create_synapse(seg, 51, 0.5);

        let mut input = Sdr::new(&[100]).unwrap();
        input.set_sparse(&[50]).unwrap();

        conn.adapt_segment(seg, &input, 0.1, 0.1);

        assert!((conn.data_for_synapse(syn1).permanence - 0.6).abs() < 1e-6);
        assert!((conn.data_for_synapse(syn2).permanence - 0.4).abs() < 1e-6);
        assert_eq!(conn.data_for_segment(seg).num_connected, 1);
    }

    #[test]
    fn test_adapt_segment_clamps() {
        let mut conn = Connections::new(100, 0.5);
        let seg = conn.create_segment(10, None);
        let syn1 = conn.create_synapse(seg, 50, 0.95);
        let syn2 = conn.create_synapse(seg, 51, 0.05);

        let mut input = Sdr::new(&[100]).unwrap();
        input.set_sparse(&[50]).unwrap();

        conn.adapt_segment(seg, &input, 0.2, 0.2);

        assert!((conn.data_for_synapse(syn1).permanence - 1.0).abs() < 1e-6);
        assert!(conn.data_for_synapse(syn2).permanence.abs() < 1e-6);
    }

    #[test]
    fn test_raise_permanences_to_threshold() {
        let mut conn = Connections::new(100, 0.5);
        let seg = conn.create_segment(10, None);
        conn.create_synapse(seg, 50, 0.45);
        conn.create_synapse(seg, 51, 0.3);
        conn.create_synapse(seg, 52, 0.2);

        assert_eq!(conn.data_for_segment(seg).num_connected, 0);

        conn.raise_permanences_to_threshold(seg, 2, 0.05);
        assert!(conn.data_for_segment(seg).num_connected >= 2);

        // Every synapse received the same number of uniform bumps.
        let perms: Vec<Permanence> = conn
            .synapses_for_segment(seg)
            .iter()
            .map(|&s| conn.data_for_synapse(s).permanence)
            .collect();
        let bumps = ((perms[0] - 0.45) / 0.05).round();
        assert!((perms[1] - (0.3 + bumps * 0.05)).abs() < 1e-5);
        assert!((perms[2] - (0.2 + bumps * 0.05)).abs() < 1e-5);
    }

    #[test]
    fn test_raise_permanences_terminates_when_saturated() {
        let mut conn = Connections::new(100, 0.5);
        let seg = conn.create_segment(10, None);
        conn.create_synapse(seg, 50, 0.1);
        conn.create_synapse(seg, 51, 0.1);

        // Threshold above the synapse count can never be met; the loop must
        // stop once every permanence saturates at 1.0.
        conn.raise_permanences_to_threshold(seg, 5, 0.1);

        for &syn in conn.synapses_for_segment(seg) {
            assert!((conn.data_for_synapse(syn).permanence - 1.0).abs() < 1e-6);
        }
        assert_eq!(conn.data_for_segment(seg).num_connected, 2);
    }

    #[test]
    fn test_bump_segment() {
        let mut conn = Connections::new(100, 0.5);
        let seg = conn.create_segment(10, None);
        conn.create_synapse(seg, 50, 0.45);
        conn.create_synapse(seg, 51, 0.95);

        conn.bump_segment(seg, 0.1);

        let perms: Vec<Permanence> = conn
            .synapses_for_segment(seg)
            .iter()
            .map(|&s| conn.data_for_synapse(s).permanence)
            .collect();
        assert!((perms[0] - 0.55).abs() < 1e-6);
        assert!((perms[1] - 1.0).abs() < 1e-6);
        assert_eq!(conn.data_for_segment(seg).num_connected, 2);
    }

    #[test]
    fn test_max_segments_per_cell() {
        let mut conn = Connections::new(100, 0.5);

        conn.create_segment(10, Some(2));
        conn.create_segment(10, Some(2));
        conn.create_segment(10, Some(2));

        assert!(conn.segments_for_cell(10).len() <= 2);
    }

    #[test]
    fn test_duplicate_synapse_coalesced() {
        let mut conn = Connections::new(100, 0.5);
        let seg = conn.create_segment(10, None);

        let syn1 = conn.create_synapse(seg, 50, 0.5);
        let syn2 = conn.create_synapse(seg, 50, 0.3);

        assert_eq!(syn1, syn2);
        assert_eq!(conn.num_synapses_on_segment(seg), 1);
        assert!((conn.data_for_synapse(syn1).permanence - 0.5).abs() < 1e-6);

        // A higher permanence wins.
        let syn3 = conn.create_synapse(seg, 50, 0.8);
        assert_eq!(syn1, syn3);
        assert!((conn.data_for_synapse(syn1).permanence - 0.8).abs() < 1e-6);
    }
}
