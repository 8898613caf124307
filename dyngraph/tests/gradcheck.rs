use dyngraph::{ComputationGraph, Device, Dim, LookupParameter, MemoryConfig, Model, Parameter, ParameterInit, Result};
use proptest::prelude::*;
use std::sync::Arc;

const EPS: f32 = 1e-2;
const ROW: usize = 1;

struct Net {
    w: Parameter,
    b: Parameter,
    v: Parameter,
    e: LookupParameter,
}

impl Net {
    fn new(model: &Model, w: Vec<f32>, b: Vec<f32>, v: Vec<f32>, e: Vec<f32>) -> Result<Net> {
        let table = model.add_lookup_parameters_with(3, Dim::new(&[2]), &ParameterInit::Const(0.0))?;
        for r in 0..3 {
            table.initialize(r, &e[r * 2..r * 2 + 2])?;
        }
        Ok(Net {
            w: model.add_parameters_with(Dim::new(&[3, 4]), &ParameterInit::FromVec(w))?,
            b: model.add_parameters_with(Dim::new(&[3]), &ParameterInit::FromVec(b))?,
            v: model.add_parameters_with(Dim::new(&[3, 3]), &ParameterInit::FromVec(v))?,
            e: table,
        })
    }

    /// Runs every kind of differentiable op once; returns the loss and,
    /// if asked, runs backward.
    fn loss(&self, dev: &Arc<Device>, x: &[f32], backward: bool) -> Result<f32> {
        let mut cg = ComputationGraph::on(dev)?;
        let x = cg.input(Dim::new(&[2]), x.to_vec())?;
        let e = cg.lookup(&self.e, ROW)?;
        let xe = cg.concatenate(&[x, e])?;
        let w = cg.parameter(&self.w)?;
        let b = cg.parameter(&self.b)?;
        let v = cg.parameter(&self.v)?;
        let one = cg.scalar_input(1.0)?;

        let z = cg.affine(&[b, w, xe])?;
        let h = cg.tanh(z)?;
        let eh = cg.exp(h)?;
        let eh1 = cg.add(eh, one)?;
        let sp = cg.log(eh1)?;
        let o = cg.matmul(v, sp)?;
        let m = cg.cmult(o, h)?;
        let nll = cg.pick_neg_log_softmax(m, 2)?;

        let h2 = cg.square(h)?;
        let den = cg.add(h2, one)?;
        let ratio = cg.cdiv(h, den)?;
        let q = cg.sum_elements(ratio)?;

        let lo = cg.logistic(o)?;
        let d = cg.squared_distance(lo, h)?;

        let root = cg.sqrt(den)?;
        let diff = cg.sub(root, h)?;
        let r = cg.sum_elements(diff)?;

        let loss = cg.sum(&[nll, q, d, r])?;
        let value = cg.forward(loss)?.as_scalar()?;
        if backward {
            cg.backward(loss)?;
        }
        Ok(value)
    }
}

fn close(analytic: f32, numeric: f32) -> bool {
    (analytic - numeric).abs() <= 5e-3 + 1e-2 * numeric.abs()
}

fn check_dense(net: &Net, dev: &Arc<Device>, x: &[f32], p: &Parameter) -> Result<Vec<(f32, f32)>> {
    let analytic = p.gradient()?;
    let values = p.values()?;
    let mut out = Vec::with_capacity(values.len());
    for k in 0..values.len() {
        let mut shifted = values.clone();
        shifted[k] = values[k] + EPS;
        p.set_values(&shifted)?;
        let plus = net.loss(dev, x, false)?;
        shifted[k] = values[k] - EPS;
        p.set_values(&shifted)?;
        let minus = net.loss(dev, x, false)?;
        p.set_values(&values)?;
        out.push((analytic[k], (plus - minus) / (2.0 * EPS)));
    }
    Ok(out)
}

fn check_row(net: &Net, dev: &Arc<Device>, x: &[f32]) -> Result<Vec<(f32, f32)>> {
    let analytic = net.e.row_gradient(ROW)?;
    let values = net.e.row(ROW)?;
    let mut out = Vec::with_capacity(values.len());
    for k in 0..values.len() {
        let mut shifted = values.clone();
        shifted[k] = values[k] + EPS;
        net.e.initialize(ROW, &shifted)?;
        let plus = net.loss(dev, x, false)?;
        shifted[k] = values[k] - EPS;
        net.e.initialize(ROW, &shifted)?;
        let minus = net.loss(dev, x, false)?;
        net.e.initialize(ROW, &values)?;
        out.push((analytic[k], (plus - minus) / (2.0 * EPS)));
    }
    Ok(out)
}

fn values(n: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-1.0f32..1.0, n)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn gradients_match_finite_differences(
        w in values(12),
        b in values(3),
        v in values(9),
        e in values(6),
        x in prop::collection::vec(-2.0f32..2.0, 2),
    ) {
        let dev = Device::cpu("gradcheck", &MemoryConfig::floats(1 << 12)).unwrap();
        let model = Model::on(&dev);
        let net = Net::new(&model, w, b, v, e).unwrap();
        net.loss(&dev, &x, true).unwrap();

        for p in [&net.w, &net.b, &net.v] {
            for (analytic, numeric) in check_dense(&net, &dev, &x, p).unwrap() {
                prop_assert!(close(analytic, numeric), "{p:?}: analytic {analytic} numeric {numeric}");
            }
        }
        for (analytic, numeric) in check_row(&net, &dev, &x).unwrap() {
            prop_assert!(close(analytic, numeric), "lookup row: analytic {analytic} numeric {numeric}");
        }
        prop_assert_eq!(net.e.touched_rows().unwrap(), vec![ROW]);
    }
}

#[test]
fn batched_gradients_match_finite_differences() -> Result<()> {
    let dev = Device::cpu("gradcheck-batched", &MemoryConfig::floats(1 << 12))?;
    let model = Model::on(&dev);
    let w = model.add_parameters_with(
        Dim::new(&[2, 3]),
        &ParameterInit::FromVec(vec![0.3, -0.2, 0.5, 0.1, 0.4, -0.6]),
    )?;
    let xs = vec![1.0, 0.5, -1.0, -0.5, 2.0, 0.0];
    let loss = |backward: bool| -> Result<f32> {
        let mut cg = ComputationGraph::on(&dev)?;
        let x = cg.input(Dim::batched(&[3], 2), xs.clone())?;
        let wi = cg.parameter(&w)?;
        let y = cg.matmul(wi, x)?;
        let y = cg.rectify(y)?;
        let y = cg.pick_neg_log_softmax_batch(y, &[0, 1])?;
        let total = cg.sum_batches(y)?;
        let value = cg.forward(total)?.as_scalar()?;
        if backward {
            cg.backward(total)?;
        }
        Ok(value)
    };
    loss(true)?;
    let analytic = w.gradient()?;
    let values = w.values()?;
    for k in 0..values.len() {
        let mut shifted = values.clone();
        shifted[k] += EPS;
        w.set_values(&shifted)?;
        let plus = loss(false)?;
        shifted[k] -= 2.0 * EPS;
        w.set_values(&shifted)?;
        let minus = loss(false)?;
        w.set_values(&values)?;
        let numeric = (plus - minus) / (2.0 * EPS);
        assert!(close(analytic[k], numeric), "w[{k}]: analytic {} numeric {numeric}", analytic[k]);
    }
    Ok(())
}
