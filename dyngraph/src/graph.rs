use crate::autobatch;
use crate::model::{LookupParameterStorage, ParameterStorage};
use crate::node::{Node, Op, VarIndex};
use crate::ops::Arg;
use dyngraph_core::{
    BufferId, CheckpointConsumer, Device, DeviceClaim, DeviceMemCheckpoint, DeviceMemory, Dim, Error, PoolRole,
    Result, Tensor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_GRAPH_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
pub(crate) struct DeviceState {
    claim: DeviceClaim,
    base: DeviceMemCheckpoint,
}

impl DeviceState {
    fn device(&self) -> &Arc<Device> {
        self.claim.device()
    }
}

/// Saved graph length plus arena offsets of every device the graph used.
#[derive(Debug, Clone)]
pub struct GraphCheckpoint {
    graph: usize,
    nodes: usize,
    marks: Vec<DeviceMemCheckpoint>,
    devices: Vec<usize>,
}

/// Append-only dataflow graph with lazy forward and reverse-mode backward
/// evaluation.
///
/// A graph claims every device it allocates from for its whole lifetime and
/// returns their forward and backward arenas to where they were when it
/// first touched them on drop. Parameter memory is never returned.
#[derive(Debug)]
pub struct ComputationGraph {
    id: usize,
    pub(crate) nodes: Vec<Node>,
    pub(crate) values: Vec<Option<Tensor>>,
    pub(crate) gradients: Vec<Option<Tensor>>,
    evaluated_upto: usize,
    device: Arc<Device>,
    devices: Vec<DeviceState>,
    autobatch: bool,
}

impl ComputationGraph {
    /// Empty graph placing its inputs on `device`.
    pub fn on(device: &Arc<Device>) -> Result<ComputationGraph> {
        let mut graph = ComputationGraph {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
            values: Vec::new(),
            gradients: Vec::new(),
            evaluated_upto: 0,
            device: Arc::clone(device),
            devices: Vec::new(),
            autobatch: false,
        };
        graph.ensure_device(device)?;
        Ok(graph)
    }

    /// Empty graph on the process default device, autobatching as configured.
    pub fn new() -> Result<ComputationGraph> {
        let mut graph = ComputationGraph::on(&dyngraph_core::default_device()?)?;
        graph.autobatch = dyngraph_core::default_autobatch()?;
        Ok(graph)
    }

    /// Enables or disables autobatching of later forward passes.
    pub fn set_autobatch(&mut self, autobatch: bool) {
        self.autobatch = autobatch;
    }

    /// Whether forward passes autobatch
    #[must_use]
    pub const fn autobatch(&self) -> bool {
        self.autobatch
    }

    /// Device inputs are placed on
    #[must_use]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if no node was added yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node at `i`
    #[must_use]
    pub fn node(&self, i: VarIndex) -> Option<&Node> {
        self.nodes.get(i.i())
    }

    /// Number of leading nodes that are forward evaluated
    #[must_use]
    pub const fn evaluated_upto(&self) -> usize {
        self.evaluated_upto
    }

    fn ensure_device(&mut self, device: &Arc<Device>) -> Result<()> {
        if self.devices.iter().any(|s| s.device().id() == device.id()) {
            return Ok(());
        }
        let claim = device.claim()?;
        let base = device.mark(None)?;
        tracing::debug!(graph = self.id, device = device.name(), "graph claimed device");
        self.devices.push(DeviceState { claim, base });
        Ok(())
    }

    /// Appends a node, placing it on its arguments' device (or, for source
    /// ops, on the parameter's device or the graph's input device).
    ///
    /// Dims and devices are validated here; nothing is allocated or computed.
    pub fn add_node(&mut self, op: Op, args: &[VarIndex]) -> Result<VarIndex> {
        let device = match &op {
            Op::Parameter(p) | Op::ConstParameter(p) => Arc::clone(p.storage()?.device()),
            Op::Lookup { param, .. } => Arc::clone(param.storage()?.device()),
            _ => match args.first() {
                Some(a) => Arc::clone(&self.checked_node(*a)?.device),
                None => Arc::clone(&self.device),
            },
        };
        self.add_node_on(op, args, &device)
    }

    /// Appends a node placed on `device`. Only [`Op::ToDevice`] may read an
    /// argument from another device.
    pub fn add_node_on(&mut self, op: Op, args: &[VarIndex], device: &Arc<Device>) -> Result<VarIndex> {
        let index = self.nodes.len();
        let dims = args
            .iter()
            .map(|a| self.checked_node(*a).map(|n| n.dim))
            .collect::<Result<Vec<_>>>()?;
        let dim = op.dim_forward(&dims)?;
        if !matches!(op, Op::ToDevice) {
            if let Some(other) = args
                .iter()
                .map(|a| &self.nodes[a.i()].device)
                .find(|d| d.id() != device.id())
            {
                return Err(Error::DeviceMismatch {
                    op: op.name(),
                    expected: device.name().into(),
                    found: other.name().into(),
                });
            }
        }
        self.ensure_device(device)?;
        let index = u32::try_from(index).map_err(|_| Error::InvalidNodeIndex {
            index,
            len: u32::MAX as usize,
        })?;
        self.nodes.push(Node {
            args: args.to_vec(),
            dim,
            device: Arc::clone(device),
            op,
        });
        self.values.push(None);
        self.gradients.push(None);
        Ok(VarIndex(index))
    }

    fn checked_node(&self, i: VarIndex) -> Result<&Node> {
        self.nodes.get(i.i()).ok_or(Error::InvalidNodeIndex {
            index: i.i(),
            len: self.nodes.len(),
        })
    }

    /// Evaluates every node up to and including `i` that has no value yet,
    /// in append order, and returns the value of `i`.
    pub fn forward(&mut self, i: VarIndex) -> Result<Tensor> {
        self.checked_node(i)?;
        let upto = i.i() + 1;
        if upto > self.evaluated_upto {
            let from = self.evaluated_upto;
            tracing::debug!(graph = self.id, from, upto, autobatch = self.autobatch, "forward");
            if self.autobatch {
                autobatch::evaluate(self, from, upto)?;
            } else {
                for j in from..upto {
                    self.evaluate_node(j)?;
                }
            }
            self.evaluated_upto = upto;
        }
        self.value_of(i)
    }

    /// Evaluates every node in the graph.
    pub fn forward_all(&mut self) -> Result<()> {
        match self.nodes.len() {
            0 => Ok(()),
            n => self.forward(VarIndex(n as u32 - 1)).map(|_| ()),
        }
    }

    /// Value of an already evaluated node.
    pub fn value_of(&self, i: VarIndex) -> Result<Tensor> {
        self.checked_node(i)?;
        self.values[i.i()]
            .clone()
            .ok_or(Error::NotEvaluated { index: i.i() })
    }

    /// Gradient a backward pass left at `i`.
    pub fn gradient_of(&self, i: VarIndex) -> Result<Tensor> {
        self.checked_node(i)?;
        self.gradients[i.i()]
            .clone()
            .ok_or(Error::NotEvaluated { index: i.i() })
    }

    pub(crate) fn value(&self, i: VarIndex) -> Result<&Tensor> {
        self.values
            .get(i.i())
            .and_then(Option::as_ref)
            .ok_or(Error::NotEvaluated { index: i.i() })
    }

    /// Evaluates node `j` alone. Does nothing if it already has a value.
    pub(crate) fn evaluate_node(&mut self, j: usize) -> Result<()> {
        if self.values[j].is_some() {
            return Ok(());
        }
        let node = &self.nodes[j];
        let device = Arc::clone(&node.device);
        let tensor = match &node.op {
            Op::Parameter(p) | Op::ConstParameter(p) => {
                let storage = p.storage()?;
                Tensor::new(node.dim, *storage.values_buffer(), device)?
            }
            Op::ToDevice => {
                let src = self.value(node.args[0])?.to_vec()?;
                let buf = store(&mut device.lock(), &src)?;
                Tensor::new(node.dim, buf, device)?
            }
            Op::Lookup { param, indices } => {
                let storage = param.storage()?;
                let mut mem = device.lock();
                let mut rows = Vec::with_capacity(node.dim.total());
                for &r in indices {
                    rows.extend_from_slice(mem.slice(&storage.row_buffer(r)?)?);
                }
                let buf = store(&mut mem, &rows)?;
                drop(mem);
                Tensor::new(node.dim, buf, device)?
            }
            op => {
                let mut mem = device.lock();
                let out = {
                    let xs = node
                        .args
                        .iter()
                        .map(|a| {
                            let t = self.value(*a)?;
                            Ok(Arg::new(t.dim(), mem.slice(t.buffer())?))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    op.forward(&device.executor(), &xs, node.dim)
                };
                let buf = store(&mut mem, &out)?;
                drop(mem);
                Tensor::new(node.dim, buf, device)?
            }
        };
        self.values[j] = Some(tensor);
        Ok(())
    }

    /// Runs backward from the scalar `i`, propagating only along paths that
    /// lead to model parameters.
    pub fn backward(&mut self, i: VarIndex) -> Result<()> {
        self.backward_impl(i, false)
    }

    /// Runs backward from the scalar `i`, computing a gradient for every
    /// node that contributes to it, inputs included.
    pub fn backward_full(&mut self, i: VarIndex) -> Result<()> {
        self.backward_impl(i, true)
    }

    fn backward_impl(&mut self, target: VarIndex, full: bool) -> Result<()> {
        let t = target.i();
        let dim = self.checked_node(target)?.dim;
        if dim.size() != 1 {
            return Err(Error::InvalidBackwardTarget { index: t, dim });
        }
        if t >= self.evaluated_upto {
            return Err(Error::NotEvaluated { index: t });
        }
        // previous backward passes are discarded, not accumulated
        self.reset_gradients()?;
        let walked = self.backward_walk(t, dim, full);
        let (commits, visited) = match walked {
            Ok(walked) => walked,
            Err(e) => {
                self.reset_gradients()?;
                return Err(e);
            }
        };
        // model gradients only change once the whole pass has succeeded
        for commit in commits {
            match commit {
                ParameterGradient::Dense(storage, grad) => storage.accumulate_grad(&grad)?,
                ParameterGradient::Rows(storage, rows, grad) => {
                    let size = storage.dim().size();
                    for (b, row) in rows.into_iter().enumerate() {
                        storage.accumulate_grad(row, &grad[b * size..(b + 1) * size])?;
                    }
                }
            }
        }
        tracing::debug!(graph = self.id, target = t, full, visited, "backward");
        Ok(())
    }

    fn reset_gradients(&mut self) -> Result<()> {
        for state in &self.devices {
            state.device().revert_pool(state.base.dedfs)?;
        }
        self.gradients.iter_mut().for_each(|g| *g = None);
        Ok(())
    }

    /// Reverse walk from `t`, filling node gradients in the backward arena.
    /// Parameter gradients are returned instead of applied.
    fn backward_walk(&mut self, t: usize, dim: Dim, full: bool) -> Result<(Vec<ParameterGradient>, usize)> {
        let nodes = &self.nodes;
        let values = &self.values;
        let gradients = &mut self.gradients;

        let mut needs = vec![false; t + 1];
        for j in 0..=t {
            let node = &nodes[j];
            let need = full || node.op.is_trainable() || node.args.iter().any(|a| needs[a.i()]);
            needs[j] = need;
        }

        let device = Arc::clone(&nodes[t].device);
        {
            let mut mem = device.lock();
            let one = mem.slice(&device.constants().one)?[0];
            let buf = mem.allocate(PoolRole::Backward, dim.total())?;
            mem.fill(&buf, one)?;
            gradients[t] = Some(Tensor::new(dim, buf, Arc::clone(&device))?);
        }

        let mut commits = Vec::new();
        let mut visited = 0usize;
        for j in (0..=t).rev() {
            let Some(g) = gradients[j].clone() else {
                continue;
            };
            if !needs[j] {
                continue;
            }
            visited += 1;
            let node = &nodes[j];
            let device = Arc::clone(&node.device);
            match &node.op {
                Op::Input { .. } | Op::ConstParameter(_) => {}
                Op::Parameter(p) => {
                    commits.push(ParameterGradient::Dense(p.storage()?, g.to_vec()?));
                }
                Op::Lookup { param, indices } => {
                    commits.push(ParameterGradient::Rows(param.storage()?, indices.clone(), g.to_vec()?));
                }
                Op::ToDevice => {
                    let a = node.args[0];
                    if !needs[a.i()] {
                        continue;
                    }
                    let grad = g.to_vec()?;
                    let src = Arc::clone(&nodes[a.i()].device);
                    let mut mem = src.lock();
                    let slot = gradient_slot(&mut gradients[a.i()], &mut mem, nodes[a.i()].dim, &src)?;
                    mem.accumulate(&slot, &grad)?;
                }
                op => {
                    let mut mem = device.lock();
                    let exec = device.executor();
                    let contributions = {
                        let xs = node
                            .args
                            .iter()
                            .map(|a| {
                                let v = values[a.i()].as_ref().ok_or(Error::NotEvaluated { index: a.i() })?;
                                Ok(Arg::new(v.dim(), mem.slice(v.buffer())?))
                            })
                            .collect::<Result<Vec<_>>>()?;
                        let fx = values[j].as_ref().ok_or(Error::NotEvaluated { index: j })?;
                        let fx = Arg::new(node.dim, mem.slice(fx.buffer())?);
                        let dedf = Arg::new(node.dim, mem.slice(g.buffer())?);
                        node.args
                            .iter()
                            .enumerate()
                            .filter(|(_, a)| needs[a.i()])
                            .map(|(k, a)| (a.i(), op.backward(&exec, &xs, fx, dedf, k)))
                            .collect::<Vec<_>>()
                    };
                    for (a, contribution) in contributions {
                        let slot = gradient_slot(&mut gradients[a], &mut mem, nodes[a].dim, &device)?;
                        mem.accumulate(&slot, &contribution)?;
                    }
                }
            }
        }
        Ok((commits, visited))
    }

    /// Evaluates all pending nodes and snapshots the graph and its arenas.
    pub fn checkpoint(&mut self) -> Result<GraphCheckpoint> {
        let devices = self
            .devices
            .iter()
            .map(|s| Arc::clone(s.device()))
            .collect::<Vec<_>>();
        let mut consumer: Option<&mut dyn CheckpointConsumer> = Some(&mut *self);
        let mut marks = Vec::with_capacity(devices.len());
        for device in &devices {
            marks.push(device.mark(consumer.take())?);
        }
        Ok(GraphCheckpoint {
            graph: self.id,
            nodes: self.nodes.len(),
            marks,
            devices: devices.iter().map(|d| d.id()).collect(),
        })
    }

    /// Drops every node added after `checkpoint` and returns their memory.
    /// Gradients of earlier nodes are discarded as well.
    pub fn revert(&mut self, checkpoint: &GraphCheckpoint) -> Result<()> {
        if checkpoint.graph != self.id || checkpoint.nodes > self.nodes.len() {
            return Err(Error::CheckpointMismatch {
                reason: format!(
                    "graph checkpoint of graph {} at {} nodes given to graph {} with {} nodes",
                    checkpoint.graph,
                    checkpoint.nodes,
                    self.id,
                    self.nodes.len()
                ),
            });
        }
        self.nodes.truncate(checkpoint.nodes);
        self.values.truncate(checkpoint.nodes);
        self.gradients.truncate(checkpoint.nodes);
        self.gradients.iter_mut().for_each(|g| *g = None);
        self.evaluated_upto = self.evaluated_upto.min(checkpoint.nodes);
        for state in &self.devices {
            let mark = checkpoint
                .devices
                .iter()
                .position(|id| *id == state.device().id())
                .map_or(state.base, |k| checkpoint.marks[k]);
            state.device().revert_pool(state.base.dedfs)?;
            state.device().revert_pool(mark.fxs)?;
        }
        Ok(())
    }

    /// Drops all nodes and returns all forward and backward memory.
    pub fn clear(&mut self) -> Result<()> {
        self.nodes.clear();
        self.values.clear();
        self.gradients.clear();
        self.evaluated_upto = 0;
        for state in &self.devices {
            state.device().revert(&state.base)?;
        }
        Ok(())
    }

    /// Graph in Graphviz dot format.
    #[must_use]
    pub fn dot_graph(&self) -> String {
        let mut user_rc = vec![0usize; self.nodes.len()];
        for node in &self.nodes {
            for a in &node.args {
                user_rc[a.i()] += 1;
            }
        }
        let mut res = String::from("strict digraph {\n  ordering=in\n  rank=source\n");
        for (i, node) in self.nodes.iter().enumerate() {
            let shape = if node.op.is_source() { "box" } else { "oval" };
            res.push_str(&format!(
                "  x{i}[label=\"{i} {} {} ({})\", shape={shape}]\n",
                node.op.name(),
                node.dim,
                node.device.name(),
            ));
            for a in &node.args {
                res.push_str(&format!("  x{a} -> x{i}\n"));
            }
        }
        res.push_str(&format!(
            "  info[label=\"nodes: {}, evaluated: {}, leaves: {}\", shape=note]\n",
            self.nodes.len(),
            self.evaluated_upto,
            user_rc.iter().filter(|rc| **rc == 0).count()
        ));
        res.push('}');
        res
    }
}

/// Allocates a forward buffer for `data` and fills it.
pub(crate) fn store(mem: &mut DeviceMemory, data: &[f32]) -> Result<BufferId> {
    let buf = mem.allocate(PoolRole::Forward, data.len())?;
    mem.write(&buf, data)?;
    Ok(buf)
}

/// Gradient of one parameter node, held back until backward completes.
enum ParameterGradient {
    Dense(Arc<ParameterStorage>, Vec<f32>),
    Rows(Arc<LookupParameterStorage>, Vec<usize>, Vec<f32>),
}

fn gradient_slot(slot: &mut Option<Tensor>, mem: &mut DeviceMemory, dim: Dim, device: &Arc<Device>) -> Result<BufferId> {
    if let Some(t) = slot {
        return Ok(*t.buffer());
    }
    let buf = mem.allocate_zeroed(PoolRole::Backward, dim.total())?;
    *slot = Some(Tensor::new(dim, buf, Arc::clone(device))?);
    Ok(buf)
}

impl CheckpointConsumer for ComputationGraph {
    fn materialize(&mut self) -> Result<()> {
        self.forward_all()
    }
}

impl Drop for ComputationGraph {
    fn drop(&mut self) {
        for state in &self.devices {
            if let Err(e) = state.device().revert(&state.base) {
                tracing::warn!(graph = self.id, device = state.device().name(), "failed to release graph memory: {e}");
            }
        }
    }
}
