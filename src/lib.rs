//! # Veles - Sparse Distributed Representations and Spatial Pooling
//!
//! Veles implements the core building blocks of Hierarchical Temporal
//! Memory (HTM) in idiomatic Rust, ported from the htm.core C++ library:
//!
//! - **Sparse Distributed Representations (SDR)**: a binary tensor viewable
//!   as a dense byte array, a flat index list, or per-axis coordinates,
//!   with lazy cached conversions and change notifications
//! - **Proxies**: read-only reshaped views over a parent SDR
//! - **Metrics**: incremental sparsity, activation-frequency and overlap
//!   statistics driven by SDR notifications
//! - **Spatial Pooler**: competitive online learning that maps input SDRs
//!   to sparse column activations
//!
//! ## Quick Start
//!
//! ```rust
//! use veles::prelude::*;
//!
//! // Create a 10x10 SDR and set some active bits.
//! let mut sdr = Sdr::new(&[10, 10]).unwrap();
//! sdr.set_sparse(&[1, 4, 8, 15, 42]).unwrap();
//!
//! // Create a Spatial Pooler and run one step.
//! let mut sp = SpatialPooler::new(SpatialPoolerParams {
//!     input_dimensions: vec![100],
//!     column_dimensions: vec![400],
//!     potential_radius: 50,
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! let input = {
//!     let mut input = Sdr::new(&[100]).unwrap();
//!     input.set_sparse(&[5, 20, 35, 50, 65]).unwrap();
//!     input
//! };
//! let mut active = Sdr::new(&[400]).unwrap();
//! sp.compute(&input, true, &mut active).unwrap();
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): serde-based serialization with binary and JSON
//!   formats, in addition to the always-available versioned stream format

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::similar_names)]

pub mod algorithms;
pub mod serialization;
pub mod types;
pub mod utils;

/// Re-export of commonly used types and traits for convenience.
pub mod prelude {
    pub use crate::algorithms::{Connections, SpatialPooler, SpatialPoolerParams};
    pub use crate::serialization::StreamSerializable;
    pub use crate::types::{
        CellIdx, ElemDense, ElemSparse, Permanence, Real, Real64, Sdr, SdrCoordinate, SdrDense,
        SdrProxy, SdrSparse, Segment, Synapse, UInt,
    };
    pub use crate::utils::{
        ActivationFrequency, Metrics, Overlap, Random, Sparsity, Topology, WrappingMode,
    };

    #[cfg(feature = "serde")]
    pub use crate::serialization::{Serializable, SerializableFormat};
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library.
pub mod error {
    use thiserror::Error;

    /// Main error type for veles operations.
    #[derive(Error, Debug)]
    pub enum VelesError {
        /// Invalid dimensions provided.
        #[error("Invalid dimensions: {0}")]
        InvalidDimensions(String),

        /// Invalid parameter value.
        #[error("Invalid parameter '{name}': {message}")]
        InvalidParameter {
            /// Name of the invalid parameter.
            name: &'static str,
            /// Description of the error.
            message: String,
        },

        /// Index out of bounds.
        #[error("Index {index} out of bounds (size: {size})")]
        IndexOutOfBounds {
            /// The invalid index.
            index: usize,
            /// The valid size.
            size: usize,
        },

        /// Dimension or size mismatch between SDRs or other structures.
        #[error("Dimension mismatch: expected {expected:?}, got {actual:?}")]
        DimensionMismatch {
            /// Expected dimensions.
            expected: Vec<u32>,
            /// Actual dimensions.
            actual: Vec<u32>,
        },

        /// SDR data is invalid (e.g., ragged coordinate axes).
        #[error("Invalid SDR data: {0}")]
        InvalidSdrData(String),

        /// Operation on an object in the wrong state, such as reading
        /// through a destroyed parent or removing an unknown callback.
        #[error("Invalid state: {0}")]
        InvalidState(String),

        /// A serialized object declares a version this build cannot read.
        #[error("Unsupported serialization version {found}")]
        UnsupportedVersion {
            /// The version found in the stream.
            found: u16,
        },

        /// Malformed serialized data.
        #[error("Serialization error: {message}")]
        SerializationError {
            /// Description of the serialization error.
            message: String,
        },

        /// I/O error.
        #[error("I/O error: {message}")]
        IoError {
            /// Description of the I/O error.
            message: String,
        },
    }

    /// Result type alias using [`VelesError`].
    pub type Result<T> = std::result::Result<T, VelesError>;
}

pub use error::{Result, VelesError};
