use candle_core::{DType, Module, Result, Tensor};
use candle_nn::VarBuilder;

use crate::precision::CastLinear;

/// LM head. With tied embeddings it reuses the shared embedding matrix and rescales the
/// decoder output by `d_model^-0.5` first.
pub enum ProjectionLayer {
    Tied { weight: Tensor, scale: f64 },
    Untied { lm_head: CastLinear },
}

impl ProjectionLayer {
    pub fn tied(shared: &Tensor, d_model: usize) -> Self {
        Self::Tied {
            weight: shared.clone(),
            scale: (d_model as f64).powf(-0.5),
        }
    }

    pub fn untied(d_model: usize, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self::Untied {
            lm_head: CastLinear::new(d_model, vocab_size, vb.pp("lm_head"))?,
        })
    }
}

impl Module for ProjectionLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // (batch, seq_len, d_model) --> (batch, seq_len, vocab_size), always f32
        let logits = match self {
            Self::Tied { weight, scale } => {
                let (batch_size, _, _) = xs.dims3()?;
                let w = weight.to_dtype(xs.dtype())?;
                xs.affine(*scale, 0.)?
                    .matmul(&w.broadcast_left(batch_size)?.t()?)?
            }
            Self::Untied { lm_head } => lm_head.forward(xs)?,
        };
        logits.to_dtype(DType::F32)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Shape, Tensor};
    use candle_nn::{Module, VarBuilder, VarMap};

    use super::ProjectionLayer;

    #[test]
    fn test_projection_layer() {
        let d_model = 32;
        let vocab_size = 100;
        let device = Device::Cpu;
        let dtype = DType::F32;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, &device);
        let projection_layer = ProjectionLayer::untied(d_model, vocab_size, vb).unwrap();

        let (batch_size, seq_len) = (1, 5);
        let xs = Tensor::ones((batch_size, seq_len, d_model), dtype, &device).unwrap();
        let output = projection_layer.forward(&xs).unwrap();

        assert_eq!(
            output.shape(),
            &Shape::from_dims(&[batch_size, seq_len, vocab_size])
        );
        assert!(varmap.data().lock().unwrap().contains_key("lm_head.weight"));
    }

    #[test]
    fn test_tied_projection_matches_scaled_dot_product() {
        let device = Device::Cpu;
        let shared = Tensor::new(&[[1f32, 0.], [0., 1.], [1., 1.]], &device).unwrap();
        let projection_layer = ProjectionLayer::tied(&shared, 4);
        let xs = Tensor::new(&[[[2f32, 4.]]], &device).unwrap();
        let logits = projection_layer
            .forward(&xs)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(logits, vec![1.0, 2.0, 3.0]);
    }
}
