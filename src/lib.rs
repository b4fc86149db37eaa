//! Shape propagation for neural network computation graphs.
//!
//! Given new input tensor shapes, a [`Reshaper`] walks the network in
//! topological order, computes the shape of every intermediate and output
//! port through pluggable per-layer-type implementations, and commits the
//! results onto the graph only once the whole pass succeeded. Layer types
//! not covered by the built-in set can be supplied through
//! [`ShapeInferExtension`]s.

pub mod builtin;
pub mod error;
pub mod launcher;
pub mod model;
pub mod registry;
pub mod reshaper;

pub use builtin::BuiltInExtension;
pub use error::{ReshapeError, Result};
pub use launcher::{Launcher, LauncherKind};
pub use model::{Connection, Layer, Network, Port, Shape};
pub use registry::{ShapeInferExtension, ShapeInferImpl, ShapeInferRegistry};
pub use reshaper::Reshaper;
