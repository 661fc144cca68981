//! The `trundle_core` crate is the mathematical engine for the Trundle
//! rolling-contact demo: a lazily evaluated symbolic expression graph that
//! differentiates itself, driving a Taylor-series rigid-body integrator.
//!
//! Key components:
//! - **Graph**: arena-backed expression DAG over scalar and 3-vector nodes,
//!   with memoized evaluation and early-stopping dirty propagation.
//! - **Differentiation**: per-operator symbolic derivative construction,
//!   parameterized by a channel index, defined on `Graph`.
//! - **Simulation**: the ball-on-a-turntable model, advanced by a truncated
//!   Taylor expansion with fixed sub-stepping.

pub mod graph;
pub mod sim;

mod diff;

pub use graph::{Expr3Id, ExprId, Graph, Var3Id, VarId};
pub use sim::{InitialState, ParamError, Simulation, SphereParams};
