//! Dense f32 tensors
//!
//! A minimal owned buffer with an explicit shape. The first extent varies
//! fastest, so element `(i0, i1, i2)` of a `[e0, e1, e2]` tensor lives at
//! `i0 + e0 * (i1 + e1 * i2)`. Weight files store elements in exactly this
//! order, which is what keeps them compatible with already-trained models.

use std::fmt;

/// Owned, shaped f32 buffer
#[derive(Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Create a zero-filled tensor
    pub fn zeros(shape: &[usize]) -> Self {
        Self::filled(shape, 0.0)
    }

    /// Create a tensor with every element set to `value`
    pub fn filled(shape: &[usize], value: f32) -> Self {
        let len = shape.iter().product();
        Tensor {
            shape: shape.to_vec(),
            data: vec![value; len],
        }
    }

    /// Wrap an existing buffer; `None` if its length disagrees with the shape
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Option<Self> {
        if shape.iter().product::<usize>() != data.len() {
            return None;
        }
        Some(Tensor {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Decode a headerless little-endian f32 dump
    pub fn from_le_bytes(shape: &[usize], bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let data = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Self::from_vec(shape, data)
    }

    /// Encode as a headerless little-endian f32 dump
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_in_bytes());
        for v in &self.data {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dimensions(&self) -> usize {
        self.shape.len()
    }

    /// Extent of dimension `dim`
    pub fn extent(&self, dim: usize) -> usize {
        self.shape[dim]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    /// Flat offset of a multi-dimensional coordinate
    pub fn offset(&self, coords: &[usize]) -> usize {
        debug_assert_eq!(coords.len(), self.shape.len());
        let mut offset = 0;
        let mut stride = 1;
        for (c, e) in coords.iter().zip(&self.shape) {
            debug_assert!(c < e, "coordinate {} out of bounds for extent {}", c, e);
            offset += c * stride;
            stride *= e;
        }
        offset
    }

    /// Inverse of [`Tensor::offset`]
    pub fn coords(&self, mut offset: usize) -> Vec<usize> {
        let mut coords = Vec::with_capacity(self.shape.len());
        for e in &self.shape {
            coords.push(offset % e);
            offset /= e;
        }
        coords
    }

    pub fn get(&self, coords: &[usize]) -> f32 {
        self.data[self.offset(coords)]
    }

    pub fn set(&mut self, coords: &[usize], value: f32) {
        let i = self.offset(coords);
        self.data[i] = value;
    }

    /// Coordinates and value of the first NaN or infinity, if any
    pub fn first_non_finite(&self) -> Option<(Vec<usize>, f32)> {
        self.data
            .iter()
            .position(|v| !v.is_finite())
            .map(|i| (self.coords(i), self.data[i]))
    }

    /// Bitwise equality, so NaN payloads and signed zeros count
    pub fn bits_eq(&self, other: &Tensor) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor{:?}", self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_extent_varies_fastest() {
        let mut t = Tensor::zeros(&[2, 3, 4]);
        t.set(&[1, 2, 3], 5.0);
        assert_eq!(t.offset(&[1, 2, 3]), 1 + 2 * (2 + 3 * 3));
        assert_eq!(t.data()[23], 5.0);
        assert_eq!(t.coords(23), vec![1, 2, 3]);
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        assert!(Tensor::from_vec(&[2, 2], vec![0.0; 3]).is_none());
        assert!(Tensor::from_vec(&[2, 2], vec![0.0; 4]).is_some());
    }

    #[test]
    fn test_first_non_finite() {
        let mut t = Tensor::zeros(&[3, 2]);
        assert!(t.first_non_finite().is_none());
        t.set(&[2, 1], f32::NAN);
        t.set(&[0, 1], f32::INFINITY);
        let (coords, value) = t.first_non_finite().unwrap();
        assert_eq!(coords, vec![0, 1]);
        assert!(value.is_infinite());
    }
}
