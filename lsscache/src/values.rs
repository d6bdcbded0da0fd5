//! Configuration values that get tokenized, together with the tolerances used to match them.

use crate::token::ModelToken;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Redshift(pub f64);

/// Wavenumber in h/Mpc. Used for k samples as well as for IR/UV cutoffs and
/// IR resummation scales; the token kind decides which.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Wavenumber(pub f64);

impl Redshift {
    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Wavenumber {
    pub fn value(&self) -> f64 {
        self.0
    }
}

/// Flat FRW cosmology. Every field takes part in tolerance matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrwModel {
    pub name: String,
    pub omega_m: f64,
    pub omega_cc: f64,
    pub h: f64,
    pub t_cmb: f64,
    pub neff: f64,
    pub f_baryon: f64,
    pub z_star: f64,
    pub z_drag: f64,
    pub z_eq: f64,
    pub a_curv: f64,
    pub ns: f64,
    pub k_piv: f64,
}

impl Default for FrwModel {
    fn default() -> Self {
        FrwModel {
            name: "MDR1".to_string(),
            omega_m: 0.27,
            omega_cc: 0.73,
            h: 0.70,
            t_cmb: 2.7255,
            neff: 3.046,
            f_baryon: 0.0469 / 0.27,
            z_star: 1090.0,
            z_drag: 1060.0,
            z_eq: 3300.0,
            a_curv: 2.2e-9,
            ns: 0.95,
            k_piv: 0.05,
        }
    }
}

impl FrwModel {
    pub fn fields(&self) -> Vec<f64> {
        vec![
            self.omega_m, self.omega_cc, self.h, self.t_cmb, self.neff, self.f_baryon,
            self.z_star, self.z_drag, self.z_eq, self.a_curv, self.ns, self.k_piv,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrowthParams {
    pub eds_mode: bool,
    pub abs_err: f64,
    pub rel_err: f64,
}

impl Default for GrowthParams {
    fn default() -> Self {
        GrowthParams { eds_mode: false, abs_err: 1e-12, rel_err: 1e-6 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopParams {
    pub abs_err_13: f64,
    pub rel_err_13: f64,
    pub abs_err_22: f64,
    pub rel_err_22: f64,
}

impl Default for LoopParams {
    fn default() -> Self {
        LoopParams { abs_err_13: 1e-3, rel_err_13: 1e-3, abs_err_22: 1e-3, rel_err_22: 1e-3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    pub pk_amplitude: f64,
    pub pivot: f64,
    pub index: f64,
    pub abs_err: f64,
    pub rel_err: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        FilterParams { pk_amplitude: 0.25, pivot: 0.07, index: 0.04, abs_err: 1e-3, rel_err: 1e-3 }
    }
}

/// Integration limits for the Matsubara X/Y coefficients, in Mpc/h.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatsubaraXyParams {
    pub qmin: f64,
    pub qmax: f64,
}

impl Default for MatsubaraXyParams {
    fn default() -> Self {
        MatsubaraXyParams { qmin: 10.0, qmax: 300.0 }
    }
}

/// A linear power spectrum dataset, identified by where it was read from and what it contained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearPkSource {
    pub path: String,
    pub hash: String,
    pub model: ModelToken,
}

impl LinearPkSource {
    pub fn new(path: impl Into<String>, content: &[u8], model: ModelToken) -> Self {
        LinearPkSource { path: path.into(), hash: content_hash(content), model }
    }
}

pub fn content_hash(content: &[u8]) -> String {
    format!("{:016x}", xxh3_64(content))
}

/// Relative tolerances, per token kind.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Tolerances {
    pub model: f64,
    pub redshift: f64,
    pub wavenumber: f64,
    pub growth: f64,
    pub loop_integral: f64,
    pub filter: f64,
    pub matsubara_xy: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Tolerances {
            model: 1e-5,
            redshift: 1e-5,
            wavenumber: 1e-10,
            growth: 1e-5,
            loop_integral: 1e-5,
            filter: 1e-5,
            matsubara_xy: 1e-5,
        }
    }
}

/// `|stored - value| / |stored| < tol`, falling back to `|value| < tol` when nothing
/// sensible can be divided by.
pub fn within_tolerance(stored: f64, value: f64, tol: f64) -> bool {
    if stored == 0.0 {
        value.abs() < tol
    } else {
        ((stored - value) / stored).abs() < tol
    }
}

pub fn fields_within_tolerance(stored: &[f64], value: &[f64], tol: f64) -> bool {
    stored.len() == value.len() && stored.iter().zip(value).all(|(s, v)| within_tolerance(*s, *v, tol))
}
