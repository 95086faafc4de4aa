//! Dense f32 blobs with copy-on-write storage.

use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::{ErrorKind, Result};

/// Inline-allocated vector for shapes and other short lists.
pub type TVec<T> = ::smallvec::SmallVec<[T; 4]>;

/// A blob shape. Axes are outermost first.
pub type Shape = TVec<usize>;

/// An n-dimensional f32 tensor.
///
/// Storage is shared on clone and on [`Blob::reshaped`], and unshared
/// lazily on the first mutation. This is what makes in-place output
/// aliasing in the runtime graph safe: a layer writing through
/// [`Blob::data_mut`] never clobbers data another blob still exposes.
#[derive(Clone, Debug, PartialEq)]
pub struct Blob {
    shape: Shape,
    data: Arc<Vec<f32>>,
}

impl Blob {
    /// A blob without shape nor data, standing for an absent tensor.
    pub fn empty() -> Blob {
        Blob { shape: TVec::new(), data: Arc::new(vec![]) }
    }

    pub fn zeros(shape: &[usize]) -> Blob {
        let len = shape.iter().product();
        Blob { shape: shape.iter().cloned().collect(), data: Arc::new(vec![0.0; len]) }
    }

    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Blob> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            bail!(ErrorKind::Parse(format!(
                "shape {:?} wants {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Blob { shape: shape.iter().cloned().collect(), data: Arc::new(data) })
    }

    pub fn from_array(a: ArrayD<f32>) -> Blob {
        let shape: Shape = a.shape().iter().cloned().collect();
        let data = if a.is_standard_layout() {
            a.into_raw_vec()
        } else {
            a.iter().cloned().collect()
        };
        Blob { shape, data: Arc::new(data) }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the elements, unsharing the storage if needed.
    pub fn data_mut(&mut self) -> &mut [f32] {
        let data: &mut Vec<f32> = Arc::make_mut(&mut self.data);
        &mut data[..]
    }

    /// Same storage under another shape with the same element count.
    pub fn reshaped(&self, shape: &[usize]) -> Result<Blob> {
        let expected: usize = shape.iter().product();
        if expected != self.len() {
            bail!(ErrorKind::Parse(format!(
                "cannot view {} elements as shape {:?}",
                self.len(),
                shape
            )));
        }
        Ok(Blob { shape: shape.iter().cloned().collect(), data: Arc::clone(&self.data) })
    }

    /// True if both blobs view the very same buffer.
    pub fn shares_storage_with(&self, other: &Blob) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub fn view(&self) -> ArrayViewD<f32> {
        let dims = if self.shape.is_empty() && self.data.is_empty() {
            IxDyn(&[0])
        } else {
            IxDyn(&self.shape)
        };
        ArrayViewD::from_shape(dims, &self.data).expect("blob shape matches its data")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reshape_shares_then_unshares() {
        let a = Blob::from_vec(&[2, 3], vec![0., 1., 2., 3., 4., 5.]).unwrap();
        let mut b = a.reshaped(&[3, 2]).unwrap();
        assert!(a.shares_storage_with(&b));
        b.data_mut()[0] = 42.0;
        assert!(!a.shares_storage_with(&b));
        assert_eq!(a.data()[0], 0.0);
        assert_eq!(b.data()[0], 42.0);
    }

    #[test]
    fn reshape_checks_element_count() {
        let a = Blob::zeros(&[2, 3]);
        assert!(a.reshaped(&[7]).is_err());
    }

    #[test]
    fn empty_blob() {
        let e = Blob::empty();
        assert!(e.is_empty());
        assert_eq!(e.view().len(), 0);
    }
}
