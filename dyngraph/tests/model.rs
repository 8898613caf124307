use approx::assert_relative_eq;
use dyngraph::{
    AffineBuilder, ComputationGraph, Device, Dim, Error, MemoryConfig, Model, ModelStorage, ParameterEntry,
    ParameterInit, PoolRole, Result,
};
use proptest::prelude::*;

#[test]
fn sequential_graphs_accumulate_into_one_parameter() -> Result<()> {
    let dev = Device::cpu("sequential", &MemoryConfig::floats(1 << 10))?;
    let model = Model::on(&dev);
    let p = model.add_parameters_with(Dim::new(&[2]), &ParameterInit::FromVec(vec![0.5, 0.5]))?;
    {
        let mut cg = ComputationGraph::on(&dev)?;
        let a = cg.parameter(&p)?;
        let loss = cg.sum_elements(a)?;
        cg.forward(loss)?;
        cg.backward(loss)?;
    }
    assert_eq!(p.gradient()?, vec![1.0, 1.0]);
    {
        let mut cg = ComputationGraph::on(&dev)?;
        let a = cg.parameter(&p)?;
        let x = cg.input(Dim::new(&[2]), vec![2.0, 3.0])?;
        let ax = cg.cmult(a, x)?;
        let loss = cg.sum_elements(ax)?;
        cg.forward(loss)?;
        cg.backward(loss)?;
    }
    assert_eq!(p.gradient()?, vec![3.0, 4.0]);
    model.reset_gradient()?;
    assert_eq!(p.gradient()?, vec![0.0, 0.0]);
    Ok(())
}

#[test]
fn const_parameters_get_no_gradient() -> Result<()> {
    let dev = Device::cpu("const-param", &MemoryConfig::floats(1 << 10))?;
    let model = Model::on(&dev);
    let p = model.add_parameters_with(Dim::new(&[2]), &ParameterInit::Const(1.5))?;
    let q = model.add_parameters_with(Dim::new(&[2]), &ParameterInit::Const(2.0))?;
    let mut cg = ComputationGraph::on(&dev)?;
    let a = cg.const_parameter(&p)?;
    let b = cg.parameter(&q)?;
    let ab = cg.cmult(a, b)?;
    let loss = cg.sum_elements(ab)?;
    assert_eq!(cg.forward(loss)?.as_scalar()?, 6.0);
    cg.backward(loss)?;
    assert_eq!(p.gradient()?, vec![0.0, 0.0]);
    assert_eq!(q.gradient()?, vec![1.5, 1.5]);
    Ok(())
}

#[test]
fn zero_scale_means_zeros() -> Result<()> {
    let dev = Device::cpu("zero-scale", &MemoryConfig::floats(1 << 10))?;
    let model = Model::on(&dev);
    let z = model.add_parameters(Dim::new(&[4, 3]), 0.0)?;
    assert_eq!(z.values()?, vec![0.0; 12]);
    let u = model.add_parameters(Dim::new(&[50]), 0.1)?;
    let values = u.values()?;
    assert!(values.iter().all(|v| v.abs() <= 0.1));
    assert!(values.iter().any(|v| *v != 0.0));
    assert_eq!(model.parameter_count(), 62);
    Ok(())
}

#[test]
fn lookups_track_touched_rows() -> Result<()> {
    let dev = Device::cpu("touched", &MemoryConfig::floats(1 << 10))?;
    let model = Model::on(&dev);
    let table = model.add_lookup_parameters_with(5, Dim::new(&[2]), &ParameterInit::Const(1.0))?;
    let mut cg = ComputationGraph::on(&dev)?;
    let rows = cg.lookup_batch(&table, &[1, 3, 1])?;
    let per_row = cg.sum_elements(rows)?;
    let loss = cg.sum_batches(per_row)?;
    assert_eq!(cg.forward(loss)?.as_scalar()?, 6.0);
    cg.backward(loss)?;

    assert_eq!(table.touched_rows()?, vec![1, 3]);
    assert_eq!(table.row_gradient(1)?, vec![2.0, 2.0]);
    assert_eq!(table.row_gradient(3)?, vec![1.0, 1.0]);
    assert_eq!(table.row_gradient(0)?, vec![0.0, 0.0]);
    assert_relative_eq!(model.gradient_l2_norm()?, 10.0f32.sqrt(), epsilon = 1e-6);

    table.clear_gradients()?;
    assert!(table.touched_rows()?.is_empty());
    assert_eq!(table.row_gradient(1)?, vec![0.0, 0.0]);
    assert_eq!(model.gradient_l2_norm()?, 0.0);
    Ok(())
}

#[test]
fn clearing_visits_only_touched_rows() -> Result<()> {
    let dev = Device::cpu("touched-only", &MemoryConfig::floats(1 << 10))?;
    let model = Model::on(&dev);
    let table = model.add_lookup_parameters_with(4, Dim::new(&[2]), &ParameterInit::Const(1.0))?;
    // written behind the touched set's back
    table.storage()?.row_gradient(3)?.set(&[5.0, -5.0])?;
    {
        let mut cg = ComputationGraph::on(&dev)?;
        let e = cg.lookup(&table, 0)?;
        let loss = cg.sum_elements(e)?;
        cg.forward(loss)?;
        cg.backward(loss)?;
    }
    assert_eq!(table.touched_rows()?, vec![0]);
    assert_eq!(table.row_gradient(0)?, vec![1.0, 1.0]);

    table.clear_gradients()?;
    assert_eq!(table.row_gradient(0)?, vec![0.0, 0.0]);
    assert_eq!(table.row_gradient(3)?, vec![5.0, -5.0]);
    Ok(())
}

#[test]
fn non_finite_scales_are_rejected() -> Result<()> {
    let dev = Device::cpu("nan-scale", &MemoryConfig::floats(1 << 10))?;
    let model = Model::on(&dev);
    let used = dev.lock().arena(PoolRole::Parameters).used();
    for scale in [f32::NAN, f32::INFINITY] {
        assert!(matches!(
            model.add_parameters(Dim::new(&[3]), scale),
            Err(Error::InvalidConfig(_))
        ));
    }
    assert_eq!(model.parameter_count(), 0);
    assert_eq!(dev.lock().arena(PoolRole::Parameters).used(), used);
    Ok(())
}

#[test]
fn a_parameter_that_does_not_fit_takes_no_memory() -> Result<()> {
    // room for the three device constants and ten more floats
    let memory = MemoryConfig {
        parameter_bytes: 13 * 4,
        ..MemoryConfig::floats(256)
    };
    let dev = Device::cpu("param-oom", &memory)?;
    let model = Model::on(&dev);
    let used = dev.lock().arena(PoolRole::Parameters).used();
    assert!(matches!(
        model.add_parameters(Dim::new(&[6]), 0.1),
        Err(Error::ArenaExhausted {
            pool: PoolRole::Parameters,
            ..
        })
    ));
    assert!(model.add_lookup_parameters(2, Dim::new(&[3])).is_err());
    assert_eq!(dev.lock().arena(PoolRole::Parameters).used(), used);
    // values and gradient of five floats still fit
    let p = model.add_parameters(Dim::new(&[5]), 0.1)?;
    assert_eq!(p.gradient()?, vec![0.0; 5]);
    assert_eq!(model.parameter_count(), 5);
    Ok(())
}

#[test]
fn projection_bounds_the_joint_norm() -> Result<()> {
    let dev = Device::cpu("project", &MemoryConfig::floats(1 << 10))?;
    let model = Model::on(&dev);
    let p = model.add_parameters_with(Dim::new(&[2]), &ParameterInit::FromVec(vec![3.0, 0.0]))?;
    let table = model.add_lookup_parameters_with(1, Dim::new(&[1]), &ParameterInit::Const(4.0))?;
    assert_relative_eq!(model.project_weights(10.0)?, 5.0, epsilon = 1e-6);
    assert_eq!(p.values()?, vec![3.0, 0.0]);

    assert_relative_eq!(model.project_weights(1.0)?, 5.0, epsilon = 1e-6);
    assert_relative_eq!(model.squared_l2_norm()?.sqrt(), 1.0, epsilon = 1e-6);
    assert_relative_eq!(p.values()?[0], 0.6, epsilon = 1e-6);
    assert_relative_eq!(table.row(0)?[0], 0.8, epsilon = 1e-6);
    assert!(model.project_weights(0.0).is_err());
    Ok(())
}

#[test]
fn lookup_rows_are_checked() -> Result<()> {
    let dev = Device::cpu("lookup-bounds", &MemoryConfig::floats(1 << 10))?;
    let model = Model::on(&dev);
    let table = model.add_lookup_parameters(3, Dim::new(&[4]))?;
    let mut cg = ComputationGraph::on(&dev)?;
    assert!(matches!(
        cg.lookup(&table, 3),
        Err(Error::IndexOutOfBounds { index: 3, len: 3 })
    ));
    assert!(table.row(3).is_err());
    table.initialize(2, &[1.0, 2.0, 3.0, 4.0])?;
    let r = cg.lookup(&table, 2)?;
    assert_eq!(cg.forward(r)?.to_vec()?, vec![1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn norms_cover_every_parameter() -> Result<()> {
    let dev = Device::cpu("norms", &MemoryConfig::floats(1 << 10))?;
    let model = Model::on(&dev);
    let p = model.add_parameters_with(Dim::new(&[2]), &ParameterInit::FromVec(vec![3.0, 4.0]))?;
    model.add_lookup_parameters_with(2, Dim::new(&[1]), &ParameterInit::Const(2.0))?;
    assert_eq!(model.squared_l2_norm()?, 25.0 + 8.0);
    model.scale_parameters(2.0)?;
    assert_eq!(p.values()?, vec![6.0, 8.0]);
    assert_eq!(model.squared_l2_norm()?, 4.0 * 33.0);

    let storage = p.storage()?;
    storage.accumulate_grad(&[1.0, -1.0])?;
    model.scale_gradient(3.0)?;
    assert_eq!(storage.g_squared_l2norm()?, 18.0);
    assert!(matches!(
        storage.accumulate_grad(&[1.0]),
        Err(Error::ElementCountMismatch { .. })
    ));
    Ok(())
}

#[test]
fn iteration_follows_creation_order() -> Result<()> {
    let dev = Device::cpu("model-iter", &MemoryConfig::floats(1 << 10))?;
    let model = Model::on(&dev);
    model.add_parameters(Dim::new(&[2, 2]), 0.1)?;
    model.add_lookup_parameters(3, Dim::new(&[2]))?;
    model.add_parameters(Dim::new(&[5]), 0.1)?;
    let kinds = model
        .iter()
        .map(|s| match s {
            ModelStorage::Dense(p) => ('d', p.dim()),
            ModelStorage::Lookup(p) => ('l', p.dim()),
        })
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![('d', Dim::new(&[2, 2])), ('l', Dim::new(&[2])), ('d', Dim::new(&[5]))]
    );
    assert_eq!(model.parameters_list().len(), 2);
    assert_eq!(model.lookup_parameters_list().len(), 1);
    Ok(())
}

#[test]
fn snapshots_restore_values() -> Result<()> {
    let dev = Device::cpu("snapshot", &MemoryConfig::floats(1 << 10))?;
    let model = Model::on(&dev);
    let p = model.add_parameters(Dim::new(&[3]), 0.5)?;
    let table = model.add_lookup_parameters(2, Dim::new(&[2]))?;
    let saved = model.snapshot()?;
    let before = (p.values()?, table.row(1)?);

    p.zero()?;
    table.zero()?;
    assert_eq!(model.squared_l2_norm()?, 0.0);
    model.restore(&saved)?;
    assert_eq!((p.values()?, table.row(1)?), before);

    let other = Model::on(&dev);
    other.add_parameters(Dim::new(&[4]), 0.5)?;
    assert!(other.restore(&saved).is_err());
    assert!(matches!(
        other.restore(&saved[..1]),
        Err(Error::DimensionMismatch { .. })
    ));
    assert!(matches!(saved[1], ParameterEntry::Lookup { ref rows, .. } if rows.len() == 2));
    Ok(())
}

#[test]
fn copies_between_models() -> Result<()> {
    let a = Device::cpu("copy-a", &MemoryConfig::floats(1 << 10))?;
    let b = Device::accelerator("copy-b", &MemoryConfig::floats(1 << 10), 2)?;
    let src = Model::on(&a);
    let dst = Model::on(&b);
    let p = src.add_parameters(Dim::new(&[2, 3]), 1.0)?;
    let q = dst.add_parameters(Dim::new(&[2, 3]), 0.0)?;
    q.storage()?.copy_from(&*p.storage()?)?;
    assert_eq!(q.values()?, p.values()?);
    Ok(())
}

#[test]
fn saxe_init_is_orthonormal() -> Result<()> {
    let dev = Device::cpu("saxe", &MemoryConfig::floats(1 << 10))?;
    let model = Model::on(&dev);
    let p = model.add_parameters_with(Dim::new(&[4, 4]), &ParameterInit::Saxe(1.0))?;
    let w = p.values()?;
    for i in 0..4 {
        for j in 0..4 {
            let dot: f32 = (0..4).map(|k| w[i * 4 + k] * w[j * 4 + k]).sum();
            assert_relative_eq!(dot, if i == j { 1.0 } else { 0.0 }, epsilon = 1e-4);
        }
    }
    Ok(())
}

#[test]
fn affine_builder_treats_missing_inputs_as_zero() -> Result<()> {
    let dev = Device::cpu("affine-builder", &MemoryConfig::floats(1 << 12))?;
    let model = Model::on(&dev);
    let affine = AffineBuilder::new(&model, &[2, 3], 4)?;
    assert_eq!(affine.weights().len(), 2);
    assert_eq!(affine.bias().dim()?, Dim::new(&[4]));

    let mut cg = ComputationGraph::on(&dev)?;
    let nodes = affine.add_to(&mut cg)?;
    let x = cg.input(Dim::new(&[2]), vec![1.0, -1.0])?;
    let y = nodes.apply(&mut cg, &[x])?;
    let got = cg.forward(y)?.to_vec()?;

    let w = affine.weights()[0].values()?;
    let b = affine.bias().values()?;
    for r in 0..4 {
        assert_relative_eq!(got[r], b[r] + w[r * 2] - w[r * 2 + 1], epsilon = 1e-6);
    }
    let z = cg.input(Dim::new(&[3]), vec![0.0; 3])?;
    assert!(nodes.apply(&mut cg, &[x, z, z]).is_err());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn clearing_empties_the_touched_set(rows in prop::collection::vec(0usize..6, 1..8)) {
        let dev = Device::cpu("prop-touched", &MemoryConfig::floats(1 << 10)).unwrap();
        let model = Model::on(&dev);
        let table = model.add_lookup_parameters(6, Dim::new(&[3])).unwrap();
        {
            let mut cg = ComputationGraph::on(&dev).unwrap();
            let e = cg.lookup_batch(&table, &rows).unwrap();
            let s = cg.sum_elements(e).unwrap();
            let loss = cg.sum_batches(s).unwrap();
            cg.forward(loss).unwrap();
            cg.backward(loss).unwrap();
        }
        let mut expected = rows.clone();
        expected.sort_unstable();
        expected.dedup();
        prop_assert_eq!(table.touched_rows().unwrap(), expected);
        for r in 0..6 {
            let hits = rows.iter().filter(|x| **x == r).count() as f32;
            prop_assert_eq!(table.row_gradient(r).unwrap(), vec![hits; 3]);
        }
        table.clear_gradients().unwrap();
        prop_assert!(table.touched_rows().unwrap().is_empty());
        for r in 0..6 {
            prop_assert_eq!(table.row_gradient(r).unwrap(), vec![0.0; 3]);
        }
    }
}
