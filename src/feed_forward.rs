use candle_core::{Module, Result, Tensor};
use candle_nn::{Dropout, ModuleT, VarBuilder};

use crate::{config::ModelConfig, precision::CastLinear};

enum Projection {
    // DenseReluDense: wo(relu(wi(x)))
    Dense { wi: CastLinear },
    // gated-gelu: wo(gelu(wi_0(x)) * wi_1(x))
    Gated { wi_0: CastLinear, wi_1: CastLinear },
}

pub struct FeedForward {
    projection: Projection,
    dropout: Dropout,
    wo: CastLinear,
}

impl FeedForward {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let (d_model, d_ff) = (config.d_model, config.d_ff);
        let projection = if config.is_gated() {
            Projection::Gated {
                wi_0: CastLinear::new(d_model, d_ff, vb.pp("wi_0"))?,
                wi_1: CastLinear::new(d_model, d_ff, vb.pp("wi_1"))?,
            }
        } else {
            Projection::Dense {
                wi: CastLinear::new(d_model, d_ff, vb.pp("wi"))?,
            }
        };
        let dropout = Dropout::new(config.dropout_rate as f32);
        let wo = CastLinear::new(d_ff, d_model, vb.pp("wo"))?;

        Ok(Self {
            projection,
            dropout,
            wo,
        })
    }
}

impl ModuleT for FeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = match &self.projection {
            Projection::Dense { wi } => wi.forward(xs)?.relu()?,
            Projection::Gated { wi_0, wi_1 } => {
                (wi_0.forward(xs)?.gelu()? * wi_1.forward(xs)?)?
            }
        };
        let output = self
            .dropout
            .forward(&hidden, train)?
            .apply(&self.wo)?;
        Ok(output)
    }
}
