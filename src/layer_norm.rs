use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

// T5 normalises by the root mean square only: no mean subtraction and no bias.
// The statistics are always computed in f32, then cast back to the activation dtype.
pub struct LayerNormalization {
    eps: f64,
    weight: Tensor,
}

impl LayerNormalization {
    pub fn new(features: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(features, "weight", Init::Const(1.))?;
        Ok(Self { eps, weight })
    }
}

impl Module for LayerNormalization {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs_dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let variance = xs.sqr()?.mean_keepdim(D::Minus1)?;
        let result = xs
            .broadcast_div(&(variance + self.eps)?.sqrt()?)?
            .broadcast_mul(&self.weight.to_dtype(DType::F32)?)?
            .to_dtype(xs_dtype)?;
        Ok(result)
    }
}
