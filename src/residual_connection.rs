use candle_core::{Module, Result, Tensor};
use candle_nn::{Dropout, VarBuilder};

use crate::layer_norm::LayerNormalization;

// One `layer.{i}` of a T5 block: x + dropout(sublayer(norm(x)))
pub struct ResidualConnection {
    dropout: Dropout,
    norm: LayerNormalization,
}

impl ResidualConnection {
    pub fn new(features: usize, eps: f64, drop_p: f32, vb: VarBuilder) -> Result<Self> {
        let dropout = Dropout::new(drop_p);
        let norm = LayerNormalization::new(features, eps, vb.pp("layer_norm"))?;

        Ok(Self { dropout, norm })
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        sub_layer: &dyn Fn(&Tensor) -> Result<Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let output = (xs
            + self
                .dropout
                .forward(&sub_layer(&self.norm.forward(xs)?)?, train)?)?;
        Ok(output)
    }
}
