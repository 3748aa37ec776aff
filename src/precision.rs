use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Init, VarBuilder};
use tracing::{debug, warn};

/// Picks the activation dtype for a run. Half precision is only used on CUDA, the master
/// weights always stay in f32.
pub fn compute_dtype(fp16: bool, device: &Device) -> DType {
    if !fp16 {
        return DType::F32;
    }
    if device.is_cuda() {
        DType::F16
    } else {
        warn!("fp16 requested but the device is not CUDA, training in f32");
        DType::F32
    }
}

/// Bias-free linear layer whose f32 weight is cast to the dtype of its input, so the matmul
/// runs in the activation precision while gradients flow back into the f32 variable.
#[derive(Debug, Clone)]
pub struct CastLinear {
    weight: Tensor,
}

impl CastLinear {
    pub fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let init = Init::Randn {
            mean: 0.,
            stdev: (in_dim as f64).powf(-0.5),
        };
        let weight = vb.get_with_hints((out_dim, in_dim), "weight", init)?;
        Ok(Self { weight })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl Module for CastLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let w = self.weight.to_dtype(xs.dtype())?;
        match xs.dims() {
            &[batch_size, _, _] => xs.matmul(&w.broadcast_left(batch_size)?.t()?),
            _ => xs.matmul(&w.t()?),
        }
    }
}

/// Dynamic loss scaling for half-precision training.
///
/// The loss is multiplied by `scale` before backprop. When the unscaled gradients contain a
/// non-finite value the step is skipped and the scale backs off; after `growth_interval`
/// clean steps in a row it grows again.
#[derive(Debug, Clone)]
pub struct LossScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    clean_steps: usize,
}

impl LossScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: if enabled { 65536.0 } else { 1.0 },
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            clean_steps: 0,
        }
    }

    pub fn for_dtype(dtype: DType) -> Self {
        Self::new(dtype == DType::F16)
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        if self.enabled {
            loss.affine(self.scale, 0.)
        } else {
            Ok(loss.clone())
        }
    }

    /// Records the outcome of a step. Returns whether the optimizer should apply it.
    pub fn update(&mut self, grads_finite: bool) -> bool {
        if !self.enabled {
            return grads_finite;
        }
        if grads_finite {
            self.clean_steps += 1;
            if self.clean_steps == self.growth_interval {
                self.scale *= self.growth_factor;
                self.clean_steps = 0;
                debug!(scale = self.scale, "loss scale increased");
            }
        } else {
            self.scale *= self.backoff_factor;
            self.clean_steps = 0;
            warn!(scale = self.scale, "gradient overflow, skipping step");
        }
        grads_finite
    }
}

#[cfg(test)]
mod tests {
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn test_cast_linear_follows_input_dtype() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let linear = CastLinear::new(4, 3, vb.pp("proj")).unwrap();
        let xs = Tensor::ones((2, 5, 4), DType::F32, &Device::Cpu).unwrap();
        let ys = linear.forward(&xs).unwrap();
        assert_eq!(ys.dims(), &[2, 5, 3]);
        assert_eq!(ys.dtype(), DType::F32);
        assert!(varmap.data().lock().unwrap().contains_key("proj.weight"));

        let ys = linear.forward(&xs.to_dtype(DType::F16).unwrap()).unwrap();
        assert_eq!(ys.dtype(), DType::F16);
    }

    #[test]
    fn test_loss_scaler_backoff_and_growth() {
        let mut scaler = LossScaler::new(true);
        scaler.growth_interval = 2;
        assert_eq!(scaler.scale(), 65536.0);

        assert!(!scaler.update(false));
        assert_eq!(scaler.scale(), 32768.0);

        assert!(scaler.update(true));
        assert_eq!(scaler.scale(), 32768.0);
        assert!(scaler.update(true));
        assert_eq!(scaler.scale(), 65536.0);
    }

    #[test]
    fn test_disabled_scaler_is_identity() {
        let mut scaler = LossScaler::for_dtype(DType::F32);
        let loss = Tensor::new(3f32, &Device::Cpu).unwrap();
        let scaled = scaler.scale_loss(&loss).unwrap();
        assert_eq!(scaled.to_vec0::<f32>().unwrap(), 3.0);
        assert!(!scaler.update(false));
        assert_eq!(scaler.scale(), 1.0);
    }

    #[test]
    fn test_cpu_never_uses_half() {
        assert_eq!(compute_dtype(true, &Device::Cpu), DType::F32);
        assert_eq!(compute_dtype(false, &Device::Cpu), DType::F32);
    }
}
