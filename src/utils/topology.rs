//! Topology utilities for spatial computations.
//!
//! This module provides functions for converting between flat indices and
//! multi-dimensional coordinates, and for enumerating neighborhoods in
//! bounded or toroidal (wrapping) spaces.

use crate::types::UInt;
use std::collections::HashMap;

/// Specifies how boundaries are handled in topological computations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrappingMode {
    /// No wrapping - boundaries are hard limits.
    #[default]
    NoWrap,
    /// Wrap around - space is toroidal.
    Wrap,
}

/// Utilities for computing topological relationships.
pub struct Topology;

impl Topology {
    /// Converts a flat index to multi-dimensional coordinates.
    ///
    /// Indexing is row-major: the last axis varies fastest.
    ///
    /// # Example
    ///
    /// ```rust
    /// use veles::utils::Topology;
    ///
    /// let coords = Topology::index_to_coordinates(5, &[3, 3]);
    /// assert_eq!(coords, vec![1, 2]);
    /// ```
    #[must_use]
    pub fn index_to_coordinates(index: usize, dimensions: &[UInt]) -> Vec<UInt> {
        let mut coords = vec![0; dimensions.len()];
        let mut idx = index;

        for i in (0..dimensions.len()).rev() {
            let dim_size = dimensions[i] as usize;
            coords[i] = (idx % dim_size) as UInt;
            idx /= dim_size;
        }

        coords
    }

    /// Converts multi-dimensional coordinates to a flat index.
    #[must_use]
    pub fn coordinates_to_index(coordinates: &[UInt], dimensions: &[UInt]) -> usize {
        let mut index = 0;
        let mut multiplier = 1;

        for i in (0..dimensions.len()).rev() {
            index += coordinates[i] as usize * multiplier;
            multiplier *= dimensions[i] as usize;
        }

        index
    }

    /// Computes the total number of elements in a dimensional space.
    #[must_use]
    pub fn num_elements(dimensions: &[UInt]) -> usize {
        dimensions.iter().map(|&d| d as usize).product()
    }

    /// Computes the neighborhood of a cell within a given radius.
    ///
    /// Returns the flat indices of all lattice points in the hypercube of
    /// the given radius centered on `center_index`, including the center.
    /// In [`WrappingMode::NoWrap`] mode coordinates are clamped to the
    /// space; in [`WrappingMode::Wrap`] mode they wrap modulo each
    /// dimension, and each neighbor is yielded at most once even when the
    /// box wraps onto itself (`2 * radius + 1 >= dimension`).
    #[must_use]
    pub fn neighborhood(
        center_index: usize,
        dimensions: &[UInt],
        radius: UInt,
        wrap: WrappingMode,
    ) -> Vec<usize> {
        let center_coords = Self::index_to_coordinates(center_index, dimensions);
        let mut neighbors = Vec::new();

        Self::neighborhood_recursive(
            &center_coords,
            dimensions,
            radius as i64,
            wrap,
            0,
            &mut vec![0; dimensions.len()],
            &mut neighbors,
        );

        neighbors
    }

    fn neighborhood_recursive(
        center: &[UInt],
        dimensions: &[UInt],
        radius: i64,
        wrap: WrappingMode,
        dim: usize,
        current: &mut Vec<UInt>,
        result: &mut Vec<usize>,
    ) {
        if dim == dimensions.len() {
            result.push(Self::coordinates_to_index(current, dimensions));
            return;
        }

        let center_coord = i64::from(center[dim]);
        let dim_size = i64::from(dimensions[dim]);

        // When the box covers the whole axis, visit each coordinate once.
        let effective_radius = match wrap {
            WrappingMode::Wrap if 2 * radius + 1 >= dim_size => {
                let span = dim_size;
                for offset in 0..span {
                    current[dim] = ((center_coord - span / 2 + offset).rem_euclid(dim_size)) as UInt;
                    Self::neighborhood_recursive(
                        center, dimensions, radius, wrap, dim + 1, current, result,
                    );
                }
                return;
            }
            _ => radius,
        };

        for offset in -effective_radius..=effective_radius {
            let coord = center_coord + offset;

            let valid_coord = match wrap {
                WrappingMode::NoWrap => {
                    if coord < 0 || coord >= dim_size {
                        continue;
                    }
                    coord as UInt
                }
                WrappingMode::Wrap => coord.rem_euclid(dim_size) as UInt,
            };

            current[dim] = valid_coord;
            Self::neighborhood_recursive(center, dimensions, radius, wrap, dim + 1, current, result);
        }
    }

    /// Maps a column index to its center input index.
    ///
    /// Columns are distributed uniformly over the input space using the
    /// proportional mapping `floor((coord + 0.5) * input_dim / column_dim)`
    /// along each axis.
    #[must_use]
    pub fn map_column_to_input(
        column_index: usize,
        column_dimensions: &[UInt],
        input_dimensions: &[UInt],
    ) -> usize {
        let column_coords = Self::index_to_coordinates(column_index, column_dimensions);

        let mut input_coords = Vec::with_capacity(input_dimensions.len());
        for (i, (&col_coord, &input_dim)) in
            column_coords.iter().zip(input_dimensions).enumerate()
        {
            let ratio = f64::from(input_dim) / f64::from(column_dimensions[i]);
            let input_coord = ((f64::from(col_coord) + 0.5) * ratio).floor() as UInt;
            input_coords.push(input_coord.min(input_dim - 1));
        }

        Self::coordinates_to_index(&input_coords, input_dimensions)
    }
}

/// A precomputed neighborhood map for every cell of a space.
///
/// Local inhibition, boosting and min-duty-cycle updates all iterate the
/// same neighborhoods; computing them once per radius change amortizes the
/// recursive box walk. Cached lists include the center cell.
#[derive(Debug, Clone, Default)]
pub struct Neighborhood {
    neighbors: HashMap<usize, Vec<usize>>,
}

impl Neighborhood {
    /// Creates an empty neighborhood cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and populates a neighborhood cache for all cells.
    #[must_use]
    pub fn compute_all(dimensions: &[UInt], radius: UInt, wrap: WrappingMode) -> Self {
        let num_cells = Topology::num_elements(dimensions);
        let mut neighbors = HashMap::with_capacity(num_cells);

        for i in 0..num_cells {
            neighbors.insert(i, Topology::neighborhood(i, dimensions, radius, wrap));
        }

        Self { neighbors }
    }

    /// Gets the neighbors (including the cell itself) for a cell.
    #[must_use]
    pub fn get(&self, cell: usize) -> Option<&Vec<usize>> {
        self.neighbors.get(&cell)
    }

    /// Returns the number of cells with cached neighbors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    /// Returns whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }
}
