use std::fmt::Debug;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("dims {dims:?} describe {expected} elements, got {actual}")]
pub struct ShapeError {
    pub dims: Vec<usize>,
    pub expected: usize,
    pub actual: usize,
}

/// A host-side array of `f32` elements.
///
/// Dimensions are stored slowest-varying first, so a 2D image of `height`
/// rows and `width` columns has `dims == [height, width]`.
#[derive(Clone, PartialEq)]
pub struct Buffer {
    dims: Vec<usize>,
    data: Vec<f32>,
}

impl Buffer {
    /// Zero-filled buffer.
    pub fn zeros(dims: &[usize]) -> Self {
        Self::filled(dims, 0.0)
    }

    pub fn filled(dims: &[usize], value: f32) -> Self {
        Self {
            dims: dims.to_vec(),
            data: vec![value; dims.iter().product()],
        }
    }

    pub fn from_vec(dims: &[usize], data: Vec<f32>) -> Result<Self, ShapeError> {
        let expected = dims.iter().product();

        if expected != data.len() {
            return Err(ShapeError {
                dims: dims.to_vec(),
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            dims: dims.to_vec(),
            data,
        })
    }

    /// Converts any numeric slice, the way host arrays are cast to `f32`
    /// before they are handed to the engine.
    pub fn from_slice<T>(dims: &[usize], data: &[T]) -> Result<Self, ShapeError>
    where
        T: Copy + Into<f64>,
    {
        Self::from_vec(dims, data.iter().map(|&x| x.into() as f32).collect())
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Width and height of a 2D buffer.
    pub fn extent(&self) -> Option<(usize, usize)> {
        match self.dims.as_slice() {
            [height, width] => Some((*width, *height)),
            _ => None,
        }
    }

    /// Overwrites this buffer with the contents of `other`, reusing the
    /// existing allocation when it is large enough.
    pub fn copy_from(&mut self, other: &Buffer) {
        self.dims.clear();
        self.dims.extend_from_slice(&other.dims);
        self.data.clear();
        self.data.extend_from_slice(&other.data);
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }

        (self.data.iter().map(|&x| x as f64).sum::<f64>() / self.data.len() as f64) as f32
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Buffer({:?}, {} elements)", self.dims, self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_shape() {
        assert!(Buffer::from_vec(&[2, 2], vec![0.0; 4]).is_ok());

        let err = Buffer::from_vec(&[2, 3], vec![0.0; 4]).unwrap_err();
        assert_eq!(err.expected, 6);
        assert_eq!(err.actual, 4);
    }

    #[test]
    fn test_from_slice_casts() {
        let buffer = Buffer::from_slice(&[1, 3], &[1u8, 2, 3]).unwrap();
        assert_eq!(buffer.as_slice(), &[1.0, 2.0, 3.0]);

        let buffer = Buffer::from_slice(&[2], &[0.5f64, 1.5]).unwrap();
        assert_eq!(buffer.as_slice(), &[0.5, 1.5]);
    }

    #[test]
    fn test_copy_from_reuses_allocation() {
        let mut target = Buffer::zeros(&[4, 4]);
        let capacity = target.data.capacity();
        let source = Buffer::filled(&[2, 4], 3.0);

        target.copy_from(&source);

        assert_eq!(target, source);
        assert_eq!(target.data.capacity(), capacity);
    }

    #[test]
    fn test_extent_and_mean() {
        let buffer = Buffer::filled(&[3, 5], 2.5);
        assert_eq!(buffer.extent(), Some((5, 3)));
        assert_eq!(buffer.mean(), 2.5);
        assert_eq!(Buffer::zeros(&[2, 2, 2]).extent(), None);
    }
}
