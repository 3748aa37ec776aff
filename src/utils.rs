use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Result, Tensor};
use tracing::info;

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            info!("running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            info!("running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Additive bias from a 0/1 mask of any shape: 0 where the mask is set, -inf elsewhere.
fn mask_to_bias(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let keep = mask.zeros_like()?.to_dtype(dtype)?;
    let hide = Tensor::new(f32::NEG_INFINITY, mask.device())?
        .to_dtype(dtype)?
        .broadcast_as(mask.shape())?;
    mask.where_cond(&keep, &hide)
}

/// Turns a `(batch, key_len)` padding mask into an additive `(batch, 1, 1, key_len)` bias.
pub fn padding_bias(attention_mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch_size, key_len) = attention_mask.dims2()?;
    mask_to_bias(&attention_mask.reshape((batch_size, 1, 1, key_len))?, dtype)
}

/// Additive `(1, 1, size, size)` bias hiding future positions.
pub fn causal_bias(size: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask = Tensor::tril2(size, DType::U8, device)?.reshape((1, 1, size, size))?;
    mask_to_bias(&mask, dtype)
}
