//! Floating-point storage formats.
//!
//! All arithmetic runs in `f32`. A [`DType`] describes the format a kernel would *store* its
//! result in; values are rounded through [`half::f16`] / [`half::bf16`] at exactly those points.
//! This reproduces half-precision GEMMs with fp32 accumulation: the products are exact in `f32`,
//! the accumulated sum is rounded once when written out.

use crate::tensor::Tensor;
use half::{bf16, f16};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage precision of activations, parameters and gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    BF16,
}

/// Element-wise closeness bound: `|a - b| <= atol + rtol * |b|`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Tolerance {
    pub const fn new(rtol: f64, atol: f64) -> Self {
        Self { rtol, atol }
    }

    /// Same `rtol`, `atol` multiplied by `factor`.
    ///
    /// Parameter gradients are reduced over every token, so they are compared with a wider
    /// absolute bound than activations.
    pub fn scaled(self, factor: f64) -> Self {
        Self {
            rtol: self.rtol,
            atol: self.atol * factor,
        }
    }
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rtol={:e} atol={:e}", self.rtol, self.atol)
    }
}

impl DType {
    /// Rounds a single value to this format and widens it back to `f32`.
    #[inline]
    pub fn round(self, value: f32) -> f32 {
        match self {
            DType::F32 => value,
            DType::F16 => f16::from_f32(value).to_f32(),
            DType::BF16 => bf16::from_f32(value).to_f32(),
        }
    }

    /// Rounds every element of `values` in place.
    pub fn round_slice(self, values: &mut [f32]) {
        if self == DType::F32 {
            return;
        }
        values.par_iter_mut().for_each(|v| *v = self.round(*v));
    }

    pub fn is_half(self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// Base tolerance for comparing a sharded run against the dense reference.
    pub fn tolerance(self) -> Tolerance {
        match self {
            DType::F16 => Tolerance::new(3e-3, 3e-3),
            DType::BF16 => Tolerance::new(3e-3, 5e-2),
            DType::F32 => Tolerance::new(1e-4, 1e-4),
        }
    }

    /// Formats the backend can run. Every CPU can emulate both half formats.
    pub fn supported() -> Vec<DType> {
        vec![DType::F16, DType::BF16]
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f32" | "float32" | "fp32" => Ok(DType::F32),
            "f16" | "float16" | "fp16" | "half" => Ok(DType::F16),
            "bf16" | "bfloat16" => Ok(DType::BF16),
            other => Err(format!("unknown dtype `{other}` (expected f32, f16 or bf16)")),
        }
    }
}

impl<const RANK: usize> Tensor<f32, RANK> {
    /// Returns a copy with every element rounded to `dtype`.
    pub fn rounded(mut self, dtype: DType) -> Self {
        dtype.round_slice(self.data_mut());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_f16() {
        // 1 + 2^-11 is exactly halfway between two f16 values and ties to even.
        let v = 1.0 + 2f32.powi(-11);
        assert_eq!(DType::F16.round(v), 1.0);
        // 1 + 2^-10 is representable.
        let v = 1.0 + 2f32.powi(-10);
        assert_eq!(DType::F16.round(v), v);
    }

    #[test]
    fn test_round_bf16_loses_more_than_f16() {
        let v = 1.0 + 2f32.powi(-9);
        assert_eq!(DType::F16.round(v), v);
        assert_eq!(DType::BF16.round(v), 1.0);
    }

    #[test]
    fn test_f32_is_identity() {
        let v = 0.1f32 + 1e-9;
        assert_eq!(DType::F32.round(v), v);
    }

    #[test]
    fn test_round_tensor() {
        let t = Tensor::<f32, 1>::new(vec![1.0 + 2f32.powi(-12), 3.0], [2]).unwrap();
        let r = t.rounded(DType::F16);
        assert_eq!(r.data(), &[1.0, 3.0]);
    }

    #[test]
    fn test_tolerances() {
        assert_eq!(DType::F16.tolerance(), Tolerance::new(3e-3, 3e-3));
        assert_eq!(DType::BF16.tolerance(), Tolerance::new(3e-3, 5e-2));
        let weight = DType::F16.tolerance().scaled(10.0);
        assert!((weight.atol - 3e-2).abs() < 1e-12);
        assert_eq!(weight.rtol, 3e-3);
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("float16".parse::<DType>().unwrap(), DType::F16);
        assert_eq!("BF16".parse::<DType>().unwrap(), DType::BF16);
        assert!("int8".parse::<DType>().is_err());
        assert_eq!(DType::BF16.to_string(), "bf16");
    }
}
