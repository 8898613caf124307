use approx::assert_relative_eq;
use dyngraph::{
    ComputationGraph, Device, Dim, LookupParameter, MemoryConfig, Model, Parameter, ParameterInit, Result, VarIndex,
};
use proptest::prelude::*;
use std::sync::Arc;

struct Params {
    w: Parameter,
    u: Parameter,
    b: Parameter,
    table: LookupParameter,
}

fn params(model: &Model) -> Result<Params> {
    let table = model.add_lookup_parameters_with(4, Dim::new(&[2]), &ParameterInit::Const(0.0))?;
    for r in 0..4 {
        table.initialize(r, &[0.1 * r as f32, -0.2 * r as f32])?;
    }
    Ok(Params {
        w: model.add_parameters_with(
            Dim::new(&[3, 2]),
            &ParameterInit::FromVec(vec![0.5, -0.3, 0.2, 0.8, -0.7, 0.1]),
        )?,
        u: model.add_parameters_with(
            Dim::new(&[3, 2]),
            &ParameterInit::FromVec(vec![-0.1, 0.4, 0.3, -0.5, 0.6, 0.2]),
        )?,
        b: model.add_parameters_with(Dim::new(&[3]), &ParameterInit::FromVec(vec![0.05, -0.05, 0.1]))?,
        table,
    })
}

struct Run {
    values: Vec<Vec<f32>>,
    gradients: Vec<Vec<f32>>,
    loss: f32,
}

/// One graph with several structurally equal chains. Odd chains use a
/// second weight, so they must not fuse with the even ones.
fn run(dev: &Arc<Device>, autobatch: bool, xs: &[[f32; 2]], rows: &[usize]) -> Result<Run> {
    let model = Model::on(dev);
    let p = params(&model)?;
    let mut cg = ComputationGraph::on(dev)?;
    cg.set_autobatch(autobatch);
    let w = cg.parameter(&p.w)?;
    let u = cg.parameter(&p.u)?;
    let b = cg.parameter(&p.b)?;
    let mut watched: Vec<VarIndex> = Vec::new();
    let mut losses = Vec::new();
    for (i, (x, row)) in xs.iter().zip(rows).enumerate() {
        let x = cg.input(Dim::new(&[2]), x.to_vec())?;
        let e = cg.lookup(&p.table, *row)?;
        let xe = cg.add(x, e)?;
        let weight = if i % 2 == 0 { w } else { u };
        let z = cg.affine(&[b, weight, xe])?;
        let h = cg.tanh(z)?;
        let l = cg.pick_neg_log_softmax(h, i % 3)?;
        watched.extend([e, xe, z, h, l]);
        losses.push(l);
    }
    let total = cg.sum(&losses)?;
    let loss = cg.forward(total)?.as_scalar()?;
    cg.backward(total)?;
    let values = watched
        .iter()
        .map(|i| cg.value_of(*i)?.to_vec())
        .collect::<Result<Vec<_>>>()?;
    let mut gradients = vec![p.w.gradient()?, p.u.gradient()?, p.b.gradient()?];
    for r in 0..4 {
        gradients.push(p.table.row_gradient(r)?);
    }
    gradients.push(p.table.touched_rows()?.iter().map(|r| *r as f32).collect());
    Ok(Run {
        values,
        gradients,
        loss,
    })
}

fn assert_same(a: &Run, b: &Run) {
    assert_relative_eq!(a.loss, b.loss, epsilon = 1e-5);
    assert_eq!(a.values.len(), b.values.len());
    for (x, y) in a.values.iter().zip(&b.values) {
        assert_eq!(x.len(), y.len());
        for (x, y) in x.iter().zip(y) {
            assert_relative_eq!(x, y, epsilon = 1e-5);
        }
    }
    for (x, y) in a.gradients.iter().zip(&b.gradients) {
        assert_eq!(x.len(), y.len());
        for (x, y) in x.iter().zip(y) {
            assert_relative_eq!(x, y, epsilon = 1e-5);
        }
    }
}

#[test]
fn fused_and_unfused_evaluation_agree() -> Result<()> {
    let xs = [[1.0, 2.0], [-0.5, 0.3], [0.0, 1.5], [2.0, -1.0], [0.7, 0.7]];
    let rows = [0, 3, 3, 1, 2];
    let plain = Device::cpu("plain", &MemoryConfig::floats(1 << 12))?;
    let host = Device::cpu("batched-host", &MemoryConfig::floats(1 << 12))?;
    let acc = Device::accelerator("batched-acc", &MemoryConfig::floats(1 << 12), 2)?;
    let expected = run(&plain, false, &xs, &rows)?;
    assert_same(&expected, &run(&host, true, &xs, &rows)?);
    assert_same(&expected, &run(&acc, true, &xs, &rows)?);
    Ok(())
}

#[test]
fn autobatching_uses_fewer_buffers() -> Result<()> {
    let xs = [[1.0, 2.0], [-0.5, 0.3], [0.0, 1.5], [2.0, -1.0]];
    let rows = [0, 1, 2, 3];
    let used = |autobatch: bool| -> Result<usize> {
        let memory = dyngraph::MemoryConfig {
            alignment: 16,
            ..MemoryConfig::floats(1 << 14)
        };
        let dev = Device::cpu("alignment", &memory)?;
        let model = Model::on(&dev);
        let p = params(&model)?;
        let mut cg = ComputationGraph::on(&dev)?;
        cg.set_autobatch(autobatch);
        let mut hs = Vec::new();
        for (x, row) in xs.iter().zip(rows) {
            let x = cg.input(Dim::new(&[2]), x.to_vec())?;
            let e = cg.lookup(&p.table, row)?;
            let xe = cg.add(x, e)?;
            hs.push(cg.tanh(xe)?);
        }
        let total = cg.concatenate(&hs)?;
        cg.forward(total)?;
        let used = dev.lock().arena(dyngraph::PoolRole::Forward).used();
        Ok(used)
    };
    // every allocation is padded to 16 floats, so fused groups show up as
    // fewer padded buffers
    assert!(used(true)? < used(false)?);
    Ok(())
}

#[test]
fn mixed_batch_sizes_fuse() -> Result<()> {
    let build = |dev: &Arc<Device>, autobatch: bool| -> Result<(Vec<f32>, Vec<f32>, Vec<f32>)> {
        let mut cg = ComputationGraph::on(dev)?;
        cg.set_autobatch(autobatch);
        let a = cg.input(Dim::new(&[3]), vec![0.1, 0.2, 0.3])?;
        let b = cg.input(Dim::batched(&[3], 2), vec![-1.0, 0.0, 1.0, 2.0, -2.0, 0.5])?;
        let ta = cg.tanh(a)?;
        let tb = cg.tanh(b)?;
        let sa = cg.sum_elements(ta)?;
        let sb = cg.sum_elements(tb)?;
        let sb = cg.sum_batches(sb)?;
        let total = cg.add(sa, sb)?;
        cg.forward(total)?;
        cg.backward_full(total)?;
        Ok((cg.value_of(tb)?.to_vec()?, cg.gradient_of(a)?.to_vec()?, cg.gradient_of(b)?.to_vec()?))
    };
    let plain = build(&Device::cpu("mixed-plain", &MemoryConfig::floats(256))?, false)?;
    let fused = build(&Device::cpu("mixed-fused", &MemoryConfig::floats(256))?, true)?;
    for (x, y) in [(&plain.0, &fused.0), (&plain.1, &fused.1), (&plain.2, &fused.2)] {
        assert_eq!(x.len(), y.len());
        for (x, y) in x.iter().zip(y.iter()) {
            assert_relative_eq!(x, y, epsilon = 1e-6);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn autobatch_is_transparent(
        xs in prop::collection::vec(prop::array::uniform2(-2.0f32..2.0), 1..7),
        seed_rows in prop::collection::vec(0usize..4, 7),
    ) {
        let rows = &seed_rows[..xs.len()];
        let a = Device::cpu("prop-plain", &MemoryConfig::floats(1 << 12)).unwrap();
        let b = Device::cpu("prop-fused", &MemoryConfig::floats(1 << 12)).unwrap();
        let expected = run(&a, false, &xs, rows).unwrap();
        let got = run(&b, true, &xs, rows).unwrap();
        assert_same(&expected, &got);
    }
}
