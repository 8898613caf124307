//! # dyngraph
//!
//! Dynamic computation graphs with reverse-mode automatic differentiation.
//!
//! A [`ComputationGraph`] is built fresh for every example. Nodes are only
//! validated when added; values are computed lazily by
//! [`ComputationGraph::forward`], and [`ComputationGraph::backward`] adds the
//! gradient of a scalar into every [`Model`] parameter it depends on. Graph
//! memory lives in per-device arenas and is returned all at once when the
//! graph is dropped.
//!
//! ```
//! use dyngraph::{ComputationGraph, Device, Dim, MemoryConfig, Model};
//!
//! let device = Device::cpu("doc", &MemoryConfig::floats(1 << 12))?;
//! let model = Model::on(&device);
//! let w = model.add_parameters(Dim::new(&[1, 2]), 0.0)?;
//! let mut cg = ComputationGraph::on(&device)?;
//! let x = cg.input(Dim::new(&[2]), vec![1.0, 2.0])?;
//! let w = cg.parameter(&w)?;
//! let y = cg.matmul(w, x)?;
//! cg.forward(y)?;
//! cg.backward(y)?;
//! assert_eq!(model.parameters_list()[0].gradient()?.to_vec()?, [1.0, 2.0]);
//! # Ok::<(), dyngraph::Error>(())
//! ```
#![forbid(unsafe_code)]
#![forbid(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

mod autobatch;
/// See [`AffineBuilder`](expr::AffineBuilder)
pub mod expr;
/// See [`ComputationGraph`](graph::ComputationGraph)
pub mod graph;
/// See [`Model`](model::Model)
pub mod model;
/// See [`Node`](node::Node)
pub mod node;
/// See [`Arg`](ops::Arg)
pub mod ops;
pub mod shadow;

pub use dyngraph_core::{
    default_device, init, initialize, Backend, BufferId, Config, Device, DeviceKind, DeviceSpec, Dim, Error,
    MemoryConfig, PoolRole, Result, Tensor,
};
pub use expr::{AffineBuilder, AffineNodes};
pub use graph::{ComputationGraph, GraphCheckpoint};
pub use model::{
    LookupParameter, LookupParameterStorage, Model, ModelStorage, Parameter, ParameterEntry, ParameterInit,
    ParameterStorage,
};
pub use node::{Node, Op, VarIndex};
pub use shadow::{allocate_shadow_lookup_parameters, allocate_shadow_parameters, ShadowLookupParameters, ShadowParameters};
