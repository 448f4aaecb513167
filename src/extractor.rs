//! Parallel feature/label row gather.

use half::f16;
use rayon::prelude::*;

use crate::common::{DataType, Element, IdType, Tensor};
use crate::error::{Error, Result};

/// Gathers rows `src[index[i]]` into `dst[i]`, dispatched over the worker
/// pool with one contiguous row copy per lane. Element type is dispatched
/// over every tensor dtype.
pub struct Extractor {
    /// When set, indices are masked to `(1 << bits) - 1` before the gather.
    /// Benchmarking mode only: forces cache-resident source rows so the
    /// memory system, not the dataset, is what gets measured.
    mock_bits: Option<u32>,
}

impl Extractor {
    pub fn new() -> Extractor {
        Extractor { mock_bits: None }
    }

    pub fn with_mock_bits(bits: u32) -> Extractor {
        Extractor { mock_bits: Some(bits) }
    }

    /// Gather `index.len()` rows of width `dim` from `src` into a fresh host
    /// tensor.
    pub fn extract(&self, src: &Tensor, index: &[IdType], dim: usize) -> Result<Tensor> {
        let shape = if dim == 1 { vec![index.len()] } else { vec![index.len(), dim] };
        let mut dst = Tensor::zeros(src.dtype(), shape);
        self.extract_into(&mut dst, src, index, dim)?;
        Ok(dst)
    }

    /// Gather into a preallocated destination of matching dtype.
    pub fn extract_into(
        &self,
        dst: &mut Tensor,
        src: &Tensor,
        index: &[IdType],
        dim: usize,
    ) -> Result<()> {
        if dst.dtype() != src.dtype() {
            return Err(Error::invariant(format!(
                "gather dtype mismatch: src {:?}, dst {:?}",
                src.dtype(),
                dst.dtype()
            )));
        }
        if dst.len() != index.len() * dim {
            return Err(Error::invariant(format!(
                "gather destination holds {} elements, need {}",
                dst.len(),
                index.len() * dim
            )));
        }
        match src.dtype() {
            DataType::F32 => self.typed::<f32>(dst, src, index, dim),
            DataType::F64 => self.typed::<f64>(dst, src, index, dim),
            DataType::F16 => self.typed::<f16>(dst, src, index, dim),
            DataType::U8 => self.typed::<u8>(dst, src, index, dim),
            DataType::I8 => self.typed::<i8>(dst, src, index, dim),
            DataType::I32 => self.typed::<i32>(dst, src, index, dim),
            DataType::I64 => self.typed::<i64>(dst, src, index, dim),
        }
        Ok(())
    }

    fn typed<T: Element>(&self, dst: &mut Tensor, src: &Tensor, index: &[IdType], dim: usize) {
        let src = src.as_slice::<T>();
        let dst = dst.as_mut_slice::<T>();
        let mask = self.mock_bits.map(|bits| (1usize << bits) - 1);
        dst.par_chunks_mut(dim).zip(index.par_iter()).for_each(|(row, &id)| {
            let mut at = id as usize;
            if let Some(mask) = mask {
                at &= mask;
            }
            row.copy_from_slice(&src[at * dim..at * dim + dim]);
        });
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}
