//! # Autobatching
//!
//! Pending nodes are levelled by their dependency depth. Nodes on one level
//! never depend on each other, so all nodes of a level that share a
//! signature run as a single physical op over their stacked arguments. The
//! output buffer is then split back into one view per logical node, which
//! is all the backward pass ever sees.

use crate::graph::{store, ComputationGraph};
use crate::node::{Node, Op};
use crate::ops::Arg;
use dyngraph_core::{Dim, Error, Result, Tensor};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Never batched with anything
pub(crate) const NO_SIGNATURE: usize = 0;

/// Everything two nodes must agree on to run as one op.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SigKey {
    op: &'static str,
    device: usize,
    shape: Dim,
    args: Vec<Dim>,
    shared: Vec<usize>,
    table: Option<(usize, usize)>,
}

/// Interns signature keys as small positive integers.
#[derive(Debug, Default)]
pub(crate) struct SigMap {
    keys: BTreeMap<SigKey, usize>,
}

impl SigMap {
    pub(crate) fn get_idx(&mut self, key: SigKey) -> usize {
        let next = self.keys.len() + 1;
        *self.keys.entry(key).or_insert(next)
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}

impl Op {
    /// `true` if argument `arg` is stacked along the batch axis when nodes
    /// are fused, `false` if all fused nodes must read the same node there.
    #[must_use]
    pub fn concat_policy(&self, arg: usize) -> bool {
        match self {
            Op::MatrixMultiply => arg == 1,
            Op::AffineTransform => arg != 0 && arg % 2 == 0,
            _ => true,
        }
    }

    /// Batching signature of `nodes[j]`, [`NO_SIGNATURE`] if it never batches.
    pub(crate) fn signature(&self, sigs: &mut SigMap, nodes: &[Node], j: usize) -> usize {
        let node = &nodes[j];
        if !self.supports_multibatch() {
            return NO_SIGNATURE;
        }
        let arg_dims = node.args.iter().map(|a| nodes[a.i()].dim).collect::<Vec<_>>();
        let batchable = match self {
            Op::Sum | Op::Sub | Op::CwiseMultiply | Op::CwiseQuotient => arg_dims.iter().all(|d| *d == node.dim),
            Op::SquaredDistance => arg_dims.windows(2).all(|w| w[0] == w[1]),
            Op::Negate
            | Op::Tanh
            | Op::Logistic
            | Op::Rectify
            | Op::Exp
            | Op::Log
            | Op::Square
            | Op::Sqrt
            | Op::LogSoftmax
            | Op::SumElements
            | Op::MatrixMultiply
            | Op::AffineTransform
            | Op::Lookup { .. } => true,
            _ => false,
        };
        if !batchable {
            return NO_SIGNATURE;
        }
        let mut key = SigKey {
            op: self.name(),
            device: node.device.id(),
            shape: node.dim.single_batch(),
            args: Vec::with_capacity(arg_dims.len()),
            shared: Vec::new(),
            table: None,
        };
        for (k, (a, d)) in node.args.iter().zip(&arg_dims).enumerate() {
            if self.concat_policy(k) {
                if d.bd() != node.dim.bd() {
                    return NO_SIGNATURE;
                }
                key.args.push(d.single_batch());
            } else {
                if d.bd() != 1 {
                    return NO_SIGNATURE;
                }
                key.args.push(*d);
                key.shared.push(a.i());
            }
        }
        if let Op::Lookup { param, .. } = self {
            key.table = Some(param.table_key());
        }
        sigs.get_idx(key)
    }
}

/// Evaluates the pending nodes in `from..upto` level by level, fusing
/// nodes with equal signatures.
pub(crate) fn evaluate(cg: &mut ComputationGraph, from: usize, upto: usize) -> Result<()> {
    let mut sigs = SigMap::default();
    let mut depth = vec![0usize; upto - from];
    let mut levels: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for j in from..upto {
        if cg.values[j].is_some() {
            continue;
        }
        let d = cg.nodes[j]
            .args
            .iter()
            .filter(|a| a.i() >= from)
            .map(|a| depth[a.i() - from] + 1)
            .max()
            .unwrap_or(0);
        depth[j - from] = d;
        levels.entry(d).or_default().push(j);
    }

    let (mut launches, mut fused) = (0usize, 0usize);
    for (level, pending) in &levels {
        let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
        for &j in pending {
            let sig = cg.nodes[j].op.signature(&mut sigs, &cg.nodes, j);
            match groups.iter_mut().find(|(s, _)| *s == sig && sig != NO_SIGNATURE) {
                Some((_, group)) => group.push(j),
                None => groups.push((sig, vec![j])),
            }
        }
        for (sig, group) in groups {
            launches += 1;
            if group.len() == 1 {
                cg.evaluate_node(group[0])?;
                continue;
            }
            tracing::trace!(level, sig, size = group.len(), op = cg.nodes[group[0]].op.name(), "fused group");
            fused += group.len();
            evaluate_group(cg, &group)?;
        }
    }
    tracing::debug!(
        from,
        upto,
        levels = levels.len(),
        signatures = sigs.len(),
        launches,
        fused,
        "autobatched forward"
    );
    Ok(())
}

/// Runs `group` (nodes with one signature) as one op and hands every node
/// its slice of the output.
fn evaluate_group(cg: &mut ComputationGraph, group: &[usize]) -> Result<()> {
    let first = &cg.nodes[group[0]];
    let device = Arc::clone(&first.device);
    let total_bd: usize = group.iter().map(|&j| cg.nodes[j].dim.bd()).sum();
    let out_dim = first.dim.with_bd(total_bd);
    let mut mem = device.lock();
    let out = match &first.op {
        Op::Lookup { param, .. } => {
            let storage = param.storage()?;
            let mut rows = Vec::with_capacity(out_dim.total());
            for &j in group {
                if let Op::Lookup { indices, .. } = &cg.nodes[j].op {
                    for &r in indices {
                        rows.extend_from_slice(mem.slice(&storage.row_buffer(r)?)?);
                    }
                }
            }
            rows
        }
        op => {
            let stacked = (0..first.args.len())
                .map(|k| {
                    if op.concat_policy(k) {
                        let mut data = Vec::new();
                        for &j in group {
                            let t = cg.value(cg.nodes[j].args[k])?;
                            data.extend_from_slice(mem.slice(t.buffer())?);
                        }
                        Ok((cg.nodes[first.args[k].i()].dim.with_bd(total_bd), data))
                    } else {
                        let t = cg.value(first.args[k])?;
                        Ok((t.dim(), mem.slice(t.buffer())?.to_vec()))
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            let xs = stacked.iter().map(|(d, v)| Arg::new(*d, v)).collect::<Vec<_>>();
            op.forward(&device.executor(), &xs, out_dim)
        }
    };
    let buf = store(&mut mem, &out)?;
    drop(mem);

    let mut offset = 0;
    for &j in group {
        let dim = cg.nodes[j].dim;
        let view = buf.sub(offset, dim.total()).ok_or(Error::ElementCountMismatch {
            dim: out_dim,
            expected: offset + dim.total(),
            got: buf.len(),
        })?;
        offset += dim.total();
        cg.values[j] = Some(Tensor::new(dim, view, Arc::clone(&device))?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{SigMap, NO_SIGNATURE};
    use crate::{ComputationGraph, Model, Op};
    use dyngraph_core::{Device, Dim, MemoryConfig};

    fn sig(cg: &ComputationGraph, sigs: &mut SigMap, j: usize) -> usize {
        cg.nodes[j].op.signature(sigs, &cg.nodes, j)
    }

    #[test]
    fn equal_shapes_share_a_signature() {
        let dev = Device::cpu("sig-unary", &MemoryConfig::floats(1 << 12)).unwrap();
        let mut cg = ComputationGraph::on(&dev).unwrap();
        let a = cg.input(Dim::new(&[3]), vec![1.0, 2.0, 3.0]).unwrap();
        let b = cg.input(Dim::batched(&[3], 2), vec![0.0; 6]).unwrap();
        let c = cg.input(Dim::new(&[4]), vec![0.0; 4]).unwrap();
        let ta = cg.tanh(a).unwrap();
        let tb = cg.tanh(b).unwrap();
        let tc = cg.tanh(c).unwrap();
        let mut sigs = SigMap::default();
        let s = sig(&cg, &mut sigs, ta.i());
        assert_ne!(s, NO_SIGNATURE);
        assert_eq!(sig(&cg, &mut sigs, tb.i()), s);
        assert_ne!(sig(&cg, &mut sigs, tc.i()), s);
        assert_eq!(sig(&cg, &mut sigs, a.i()), NO_SIGNATURE);
    }

    #[test]
    fn weights_must_be_shared() {
        let dev = Device::cpu("sig-matmul", &MemoryConfig::floats(1 << 12)).unwrap();
        let model = Model::on(&dev);
        let w1 = model.add_parameters(Dim::new(&[2, 3]), 0.1).unwrap();
        let w2 = model.add_parameters(Dim::new(&[2, 3]), 0.1).unwrap();
        let mut cg = ComputationGraph::on(&dev).unwrap();
        let x = cg.input(Dim::new(&[3]), vec![1.0; 3]).unwrap();
        let y = cg.input(Dim::new(&[3]), vec![2.0; 3]).unwrap();
        let w1 = cg.parameter(&w1).unwrap();
        let w2 = cg.parameter(&w2).unwrap();
        let m1 = cg.matmul(w1, x).unwrap();
        let m2 = cg.matmul(w1, y).unwrap();
        let m3 = cg.matmul(w2, y).unwrap();
        let mut sigs = SigMap::default();
        assert_eq!(sig(&cg, &mut sigs, m1.i()), sig(&cg, &mut sigs, m2.i()));
        assert_ne!(sig(&cg, &mut sigs, m1.i()), sig(&cg, &mut sigs, m3.i()));
    }

    #[test]
    fn broadcasting_sums_are_not_padded() {
        let dev = Device::cpu("sig-sum", &MemoryConfig::floats(1 << 12)).unwrap();
        let mut cg = ComputationGraph::on(&dev).unwrap();
        let a = cg.input(Dim::new(&[3]), vec![1.0; 3]).unwrap();
        let b = cg.input(Dim::new(&[1]), vec![1.0]).unwrap();
        let s = cg.add_node(Op::Sum, &[a, b]).unwrap();
        let t = cg.add_node(Op::Sum, &[a, a]).unwrap();
        let mut sigs = SigMap::default();
        assert_eq!(sig(&cg, &mut sigs, s.i()), NO_SIGNATURE);
        assert_ne!(sig(&cg, &mut sigs, t.i()), NO_SIGNATURE);
    }

    #[test]
    fn concat_policy_of_affine() {
        let op = Op::AffineTransform;
        assert_eq!(
            (0..5).map(|k| op.concat_policy(k)).collect::<Vec<_>>(),
            [false, false, true, false, true]
        );
    }
}
