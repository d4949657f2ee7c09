//! Utility modules: random number generation, topology and SDR metrics.

mod random;
mod sdr_metrics;
mod topology;

pub use random::{Random, RandomState};
pub use sdr_metrics::{ActivationFrequency, Metrics, Overlap, Sparsity};
pub use topology::{Neighborhood, Topology, WrappingMode};
