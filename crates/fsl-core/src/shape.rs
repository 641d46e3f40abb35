use std::fmt;

// Shape — dimension sizes of a tensor
//
//   Scalar: Shape([])          0 dimensions, 1 element
//   Batch:  Shape([N, C, H, W]) image batch as consumed by conv layers
//
// The shape fixes the element count, the default row-major strides and
// whether two tensors broadcast against each other.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Row-major strides: for [2, 3, 4] this is [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> crate::Result<usize> {
        self.0.get(d).copied().ok_or(crate::Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// The shape with every dimension in `dims` set to 1.
    pub fn with_reduced(&self, dims: &[usize]) -> Shape {
        let mut out = self.0.clone();
        for &d in dims {
            if d < out.len() {
                out[d] = 1;
            }
        }
        Shape(out)
    }

    // Broadcasting

    /// NumPy-style broadcast of two shapes: align from the right, sizes must
    /// be equal or 1, missing leading dimensions count as 1.
    ///
    ///   [3, 4] and [4]       → [3, 4]
    ///   [N, C, 1, 1] and [C, 1, 1] → [N, C, 1, 1]
    ///   [3] and [4]          → Error
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> crate::Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd || rd == 1 {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else {
                return Err(crate::Error::ShapeMismatch {
                    expected: lhs.clone(),
                    got: rhs.clone(),
                });
            }
        }

        result.reverse();
        Ok(Shape::new(result))
    }

    /// Strides that read this shape as if it had been expanded to `target`.
    /// Broadcast dimensions (size 1 here, or missing) get stride 0.
    pub fn broadcast_strides(&self, target: &Shape) -> Vec<usize> {
        let self_dims = self.dims();
        let target_dims = target.dims();
        let self_strides = self.stride_contiguous();

        let mut result = vec![0usize; target_dims.len()];
        let offset = target_dims.len() - self_dims.len();

        for i in 0..self_dims.len() {
            if self_dims[i] == target_dims[i + offset] {
                result[i + offset] = self_strides[i];
            }
        }
        result
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize,)> for Shape {
    fn from((d0,): (usize,)) -> Self {
        Shape(vec![d0])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::from(());
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
    }

    #[test]
    fn test_image_batch_strides() {
        let s = Shape::from((2, 3, 4, 5));
        assert_eq!(s.elem_count(), 120);
        assert_eq!(s.stride_contiguous(), vec![60, 20, 5, 1]);
    }

    #[test]
    fn test_broadcast_channel_vector() {
        let a = Shape::from((8, 16, 5, 5));
        let b = Shape::from((16, 1, 1));
        let c = Shape::broadcast_shape(&a, &b).unwrap();
        assert_eq!(c.dims(), &[8, 16, 5, 5]);
        assert_eq!(b.broadcast_strides(&c), vec![0, 1, 0, 0]);
    }

    #[test]
    fn test_broadcast_incompatible() {
        let a = Shape::from(3);
        let b = Shape::from(4);
        assert!(Shape::broadcast_shape(&a, &b).is_err());
    }

    #[test]
    fn test_with_reduced() {
        let s = Shape::from((4, 6, 2));
        assert_eq!(s.with_reduced(&[0, 2]).dims(), &[1, 6, 1]);
    }

    #[test]
    fn test_zero_sized_dim() {
        let s = Shape::from((0, 3));
        assert_eq!(s.elem_count(), 0);
    }
}
