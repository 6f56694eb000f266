//! # scalargrad
//!
//! A hand-built autodiff engine over scalar and matrix values, plus the
//! gradient-based optimizer that consumes it: box-constrained descent,
//! shrinking-step line search, and an exterior-penalty constrained solver.
//!
//! A client declares a parameter space as a [`ContextTemplate`], picks a point
//! in it as a [`Context`], and builds an expression tree of [`Scalar`] nodes
//! (directly, or through [`Matrix`] operators) rooted in variables drawn from
//! that context. Evaluating the root yields a value plus, on demand, the
//! partial derivative with respect to any [`VariableKey`]. The optimizer
//! repeatedly evaluates objective (and constraint) expressions against
//! successive contexts and produces updated ones.
//!
//! Graphs are immutable after construction and evaluation performs no shared
//! writes (lazy nodes recompute rather than memoize), so read-only concurrent
//! evaluation is safe by construction. Shapes are small, dense, CPU-resident,
//! and evaluated eagerly.

pub mod checkpoint;
pub mod context;
pub mod gradient;
pub mod key;
pub mod matrix;
pub mod optimize;
pub mod scalar;

pub use context::{Context, ContextTemplate};
pub use gradient::GradientMap;
pub use key::{Key, VariableKey};
pub use matrix::Matrix;
pub use scalar::Scalar;
