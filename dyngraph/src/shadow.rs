//! Zeroed companions of a model's parameters, for trainers that keep
//! per-parameter state such as momentum.

use crate::model::{LookupParameterStorage, Model, ParameterInit, ParameterStorage};
use dyngraph_core::Result;

/// Same shaped, zero initialized twin of one dense parameter.
#[derive(Debug)]
pub struct ShadowParameters {
    /// Shadow values
    pub h: ParameterStorage,
}

impl ShadowParameters {
    /// Allocates a zeroed twin of `p` on the same device.
    pub fn new(p: &ParameterStorage) -> Result<ShadowParameters> {
        Ok(ShadowParameters {
            h: ParameterStorage::new(p.device(), p.dim(), &ParameterInit::Const(0.0))?,
        })
    }
}

/// Same shaped, zero initialized twin of one lookup table.
#[derive(Debug)]
pub struct ShadowLookupParameters {
    /// Shadow rows
    pub h: LookupParameterStorage,
}

impl ShadowLookupParameters {
    /// Allocates a zeroed twin of `p` on the same device.
    pub fn new(p: &LookupParameterStorage) -> Result<ShadowLookupParameters> {
        Ok(ShadowLookupParameters {
            h: LookupParameterStorage::new(p.device(), p.count(), p.dim(), &ParameterInit::Const(0.0))?,
        })
    }
}

/// One shadow per dense parameter of `model`, in creation order.
pub fn allocate_shadow_parameters(model: &Model) -> Result<Vec<ShadowParameters>> {
    model
        .parameters_list()
        .iter()
        .map(|p| ShadowParameters::new(p))
        .collect()
}

/// One shadow per lookup table of `model`, in creation order.
pub fn allocate_shadow_lookup_parameters(model: &Model) -> Result<Vec<ShadowLookupParameters>> {
    model
        .lookup_parameters_list()
        .iter()
        .map(|p| ShadowLookupParameters::new(p))
        .collect()
}
