//! Core types for the library.
//!
//! This module contains fundamental type definitions, the SDR (Sparse
//! Distributed Representation) container and its read-only proxy views.

mod primitives;
pub(crate) mod sdr;
mod proxy;

pub use primitives::*;
pub use proxy::SdrProxy;
pub use sdr::{Sdr, SdrCallback, SdrCoordinate, SdrDense, SdrSparse};
