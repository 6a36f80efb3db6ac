//! Memory-saving decode strategies shared by every VAE.
//!
//! Slicing decodes a batch one sample at a time. Tiling decodes the latent in
//! overlapping spatial tiles, blends the overlaps linearly and stitches the
//! result back together.

use candle_core::{DType, IndexOp, Result, Tensor};

/// Spatial tiling geometry, expressed in sample (pixel) space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaeTiling {
    pub spatial_compression: usize,
    pub tile_sample_min: usize,
    pub tile_sample_stride: usize,
}

impl Default for VaeTiling {
    fn default() -> Self {
        Self {
            spatial_compression: 8,
            tile_sample_min: 512,
            tile_sample_stride: 384,
        }
    }
}

impl VaeTiling {
    fn tile_latent_min(&self) -> usize {
        self.tile_sample_min / self.spatial_compression
    }

    fn tile_latent_stride(&self) -> usize {
        (self.tile_sample_stride / self.spatial_compression).max(1)
    }

    fn applies_to(&self, z: &Tensor) -> Result<bool> {
        let (_, _, height, width) = z.dims4()?;
        Ok(height > self.tile_latent_min() || width > self.tile_latent_min())
    }

    /// Decode `z` (b, c, h, w) tile by tile.
    pub fn tiled_decode<F>(&self, z: &Tensor, decode: &F) -> Result<Tensor>
    where
        F: Fn(&Tensor) -> Result<Tensor>,
    {
        let (_b, _c, height, width) = z.dims4()?;
        let sample_height = height * self.spatial_compression;
        let sample_width = width * self.spatial_compression;

        let tile_min = self.tile_latent_min();
        let stride = self.tile_latent_stride();
        let blend_extent = self.tile_sample_min.saturating_sub(self.tile_sample_stride);

        let mut rows: Vec<Vec<Tensor>> = Vec::new();
        for i in (0..height).step_by(stride) {
            let mut row = Vec::new();
            for j in (0..width).step_by(stride) {
                let tile = z.i((.., .., i..(i + tile_min).min(height), j..(j + tile_min).min(width)))?;
                row.push(decode(&tile)?);
            }
            rows.push(row);
        }

        let mut above: Vec<Tensor> = Vec::new();
        let mut stitched_rows = Vec::with_capacity(rows.len());
        for (ri, row) in rows.iter().enumerate() {
            let mut blended: Vec<Tensor> = Vec::with_capacity(row.len());
            let mut stitched = Vec::with_capacity(row.len());
            for (cj, tile) in row.iter().enumerate() {
                let mut tile = tile.clone();
                if ri > 0 {
                    tile = blend(&above[cj], &tile, blend_extent, 2)?;
                }
                if cj > 0 {
                    tile = blend(&blended[cj - 1], &tile, blend_extent, 3)?;
                }
                blended.push(tile.clone());

                let h = self.tile_sample_stride.min(tile.dim(2)?);
                let w = self.tile_sample_stride.min(tile.dim(3)?);
                stitched.push(tile.i((.., .., 0..h, 0..w))?);
            }
            stitched_rows.push(Tensor::cat(&stitched, 3)?);
            above = blended;
        }

        Tensor::cat(&stitched_rows, 2)?.i((.., .., 0..sample_height, 0..sample_width))
    }
}

/// Linearly fade the trailing `extent` entries of `a` into the leading ones of `b` along `dim`.
fn blend(a: &Tensor, b: &Tensor, extent: usize, dim: usize) -> Result<Tensor> {
    let a_len = a.dim(dim)?;
    let b_len = b.dim(dim)?;
    let extent = extent.min(a_len).min(b_len);
    if extent == 0 {
        return Ok(b.clone());
    }

    let mut shape = vec![1; b.rank()];
    shape[dim] = extent;
    let w = Tensor::arange(0u32, extent as u32, b.device())?
        .to_dtype(DType::F32)?
        .affine(1.0 / extent as f64, 0.0)?
        .reshape(shape)?
        .to_dtype(b.dtype())?;
    let one_minus = w.affine(-1.0, 1.0)?;

    let a_tail = a.narrow(dim, a_len - extent, extent)?;
    let b_head = b.narrow(dim, 0, extent)?;

    let mixed = (a_tail.broadcast_mul(&one_minus)? + b_head.broadcast_mul(&w)?)?;
    if extent == b_len {
        return Ok(mixed);
    }
    let b_rest = b.narrow(dim, extent, b_len - extent)?;
    Tensor::cat(&[&mixed, &b_rest], dim)
}

/// Decode `z` with the requested strategies. `decode` is the raw VAE decoder.
pub fn decode_latents<F>(
    z: &Tensor,
    slicing: bool,
    tiling: Option<&VaeTiling>,
    decode: F,
) -> Result<Tensor>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    let decode_one = |z: &Tensor| -> Result<Tensor> {
        match tiling {
            Some(tiling) if tiling.applies_to(z)? => tiling.tiled_decode(z, &decode),
            _ => decode(z),
        }
    };

    let batch = z.dim(0)?;
    if slicing && batch > 1 {
        let samples = (0..batch)
            .map(|i| decode_one(&z.narrow(0, i, 1)?))
            .collect::<Result<Vec<_>>>()?;
        return Tensor::cat(&samples, 0);
    }
    decode_one(z)
}
