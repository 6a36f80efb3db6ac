use candle_core::{Device, Result, Shape, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

/// Standard-normal noise drawn on the host from `seed`, then moved to `device`.
///
/// The same seed yields the same tensor on every backend, which device-side
/// RNGs do not guarantee.
pub fn seeded_randn(seed: u64, shape: impl Into<Shape>, device: &Device) -> Result<Tensor> {
    let shape = shape.into();
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|_| StandardNormal.sample(&mut rng))
        .collect();
    Tensor::from_vec(data, shape, &Device::Cpu)?.to_device(device)
}
