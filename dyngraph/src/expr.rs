//! Typed wrappers over [`ComputationGraph::add_node`].

use crate::graph::ComputationGraph;
use crate::model::{LookupParameter, Model, Parameter, ParameterInit};
use crate::node::{Op, VarIndex};
use dyngraph_core::{Device, Dim, Error, Result};
use std::sync::Arc;

impl ComputationGraph {
    /// Constant host data
    pub fn input(&mut self, dim: Dim, data: Vec<f32>) -> Result<VarIndex> {
        self.add_node(Op::Input { dim, data }, &[])
    }

    /// Single constant
    pub fn scalar_input(&mut self, value: f32) -> Result<VarIndex> {
        self.input(Dim::scalar(), vec![value])
    }

    /// Trainable parameter
    pub fn parameter(&mut self, p: &Parameter) -> Result<VarIndex> {
        self.add_node(Op::Parameter(p.clone()), &[])
    }

    /// Parameter read without gradient
    pub fn const_parameter(&mut self, p: &Parameter) -> Result<VarIndex> {
        self.add_node(Op::ConstParameter(p.clone()), &[])
    }

    /// Row `index` of a lookup table
    pub fn lookup(&mut self, p: &LookupParameter, index: usize) -> Result<VarIndex> {
        self.lookup_batch(p, &[index])
    }

    /// One row per batch element
    pub fn lookup_batch(&mut self, p: &LookupParameter, indices: &[usize]) -> Result<VarIndex> {
        self.add_node(
            Op::Lookup {
                param: p.clone(),
                indices: indices.to_vec(),
            },
            &[],
        )
    }

    /// `a + b`
    pub fn add(&mut self, a: VarIndex, b: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::Sum, &[a, b])
    }

    /// Sum of all `xs`
    pub fn sum(&mut self, xs: &[VarIndex]) -> Result<VarIndex> {
        self.add_node(Op::Sum, xs)
    }

    /// `a - b`
    pub fn sub(&mut self, a: VarIndex, b: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::Sub, &[a, b])
    }

    /// `-x`
    pub fn neg(&mut self, x: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::Negate, &[x])
    }

    /// Elementwise product
    pub fn cmult(&mut self, a: VarIndex, b: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::CwiseMultiply, &[a, b])
    }

    /// Elementwise quotient
    pub fn cdiv(&mut self, a: VarIndex, b: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::CwiseQuotient, &[a, b])
    }

    /// `x ^ p` for a single element `p`
    pub fn pow(&mut self, x: VarIndex, p: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::Pow, &[x, p])
    }

    /// Matrix product
    pub fn matmul(&mut self, a: VarIndex, b: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::MatrixMultiply, &[a, b])
    }

    /// `xs[0] + xs[1] · xs[2] + xs[3] · xs[4] + ...`
    pub fn affine(&mut self, xs: &[VarIndex]) -> Result<VarIndex> {
        self.add_node(Op::AffineTransform, xs)
    }

    /// Hyperbolic tangent
    pub fn tanh(&mut self, x: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::Tanh, &[x])
    }

    /// Logistic sigmoid
    pub fn logistic(&mut self, x: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::Logistic, &[x])
    }

    /// ReLU
    pub fn rectify(&mut self, x: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::Rectify, &[x])
    }

    /// `e^x`
    pub fn exp(&mut self, x: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::Exp, &[x])
    }

    /// Natural logarithm
    pub fn log(&mut self, x: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::Log, &[x])
    }

    /// `x^2`
    pub fn square(&mut self, x: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::Square, &[x])
    }

    /// Square root
    pub fn sqrt(&mut self, x: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::Sqrt, &[x])
    }

    /// Sum of the elements of every batch element
    pub fn sum_elements(&mut self, x: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::SumElements, &[x])
    }

    /// Sum over the batch axis
    pub fn sum_batches(&mut self, x: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::SumBatches, &[x])
    }

    /// Log of the softmax of a column vector
    pub fn log_softmax(&mut self, x: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::LogSoftmax, &[x])
    }

    /// Element `index` of every batch element
    pub fn pick(&mut self, x: VarIndex, index: usize) -> Result<VarIndex> {
        self.pick_batch(x, &[index])
    }

    /// Element `indices[b]` of batch element `b`
    pub fn pick_batch(&mut self, x: VarIndex, indices: &[usize]) -> Result<VarIndex> {
        self.add_node(
            Op::PickElement {
                indices: indices.to_vec(),
            },
            &[x],
        )
    }

    /// Negative log likelihood of class `index` under `softmax(x)`.
    pub fn pick_neg_log_softmax(&mut self, x: VarIndex, index: usize) -> Result<VarIndex> {
        self.pick_neg_log_softmax_batch(x, &[index])
    }

    /// Batched [`pick_neg_log_softmax`](Self::pick_neg_log_softmax).
    pub fn pick_neg_log_softmax_batch(&mut self, x: VarIndex, indices: &[usize]) -> Result<VarIndex> {
        let ls = self.log_softmax(x)?;
        let picked = self.pick_batch(ls, indices)?;
        self.neg(picked)
    }

    /// `||a - b||^2`
    pub fn squared_distance(&mut self, a: VarIndex, b: VarIndex) -> Result<VarIndex> {
        self.add_node(Op::SquaredDistance, &[a, b])
    }

    /// Stacks `xs` along the first axis.
    pub fn concatenate(&mut self, xs: &[VarIndex]) -> Result<VarIndex> {
        self.add_node(Op::Concatenate, xs)
    }

    /// Same values in a new shape
    pub fn reshape(&mut self, x: VarIndex, dim: Dim) -> Result<VarIndex> {
        self.add_node(Op::Reshape(dim), &[x])
    }

    /// Copy of `x` on `device`
    pub fn to_device(&mut self, x: VarIndex, device: &Arc<Device>) -> Result<VarIndex> {
        self.add_node_on(Op::ToDevice, &[x], device)
    }
}

/// `b + W1 · x1 + W2 · x2 + ...` with one weight per input.
#[derive(Debug, Clone)]
pub struct AffineBuilder {
    bias: Parameter,
    weights: Vec<Parameter>,
}

/// An [`AffineBuilder`]'s parameters placed in one graph.
#[derive(Debug, Clone)]
pub struct AffineNodes {
    bias: VarIndex,
    weights: Vec<VarIndex>,
}

impl AffineBuilder {
    /// Adds a `output x input_dims[i]` weight per input and an `output` bias
    /// to `model`.
    pub fn new(model: &Model, input_dims: &[usize], output: usize) -> Result<AffineBuilder> {
        if input_dims.is_empty() {
            return Err(Error::dimension_mismatch("affine_builder", core::iter::empty()));
        }
        let weights = input_dims
            .iter()
            .map(|&d| model.add_parameters_with(Dim::new(&[output, d]), &ParameterInit::Glorot))
            .collect::<Result<Vec<_>>>()?;
        let bias = model.add_parameters_with(Dim::new(&[output]), &ParameterInit::Glorot)?;
        Ok(AffineBuilder { bias, weights })
    }

    /// Bias parameter
    #[must_use]
    pub const fn bias(&self) -> &Parameter {
        &self.bias
    }

    /// Weight parameters, one per input
    #[must_use]
    pub fn weights(&self) -> &[Parameter] {
        &self.weights
    }

    /// Adds the parameters to `cg`.
    pub fn add_to(&self, cg: &mut ComputationGraph) -> Result<AffineNodes> {
        let weights = self
            .weights
            .iter()
            .map(|w| cg.parameter(w))
            .collect::<Result<Vec<_>>>()?;
        Ok(AffineNodes {
            bias: cg.parameter(&self.bias)?,
            weights,
        })
    }
}

impl AffineNodes {
    /// Applies the transform to `xs`. Missing trailing inputs count as zero.
    pub fn apply(&self, cg: &mut ComputationGraph, xs: &[VarIndex]) -> Result<VarIndex> {
        if xs.len() > self.weights.len() {
            let dims = xs.iter().filter_map(|x| cg.node(*x).map(|n| n.dim())).collect::<Vec<_>>();
            return Err(Error::dimension_mismatch("affine_builder", dims));
        }
        let mut args = Vec::with_capacity(2 * xs.len() + 1);
        args.push(self.bias);
        for (w, x) in self.weights.iter().zip(xs) {
            args.push(*w);
            args.push(*x);
        }
        cg.affine(&args)
    }
}
