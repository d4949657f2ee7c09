//! HTM algorithms.
//!
//! - **Connections**: the synaptic connectivity store
//! - **Spatial Pooler**: competitive learning of sparse representations

mod connections;
mod spatial_pooler;

pub use connections::{Connections, SegmentData, SynapseData};
pub use spatial_pooler::{SpatialPooler, SpatialPoolerParams, MAX_LOCAL_AREA_DENSITY};
