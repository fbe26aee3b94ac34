use std::fmt;

// Shape — Dimension sizes of an array
//
// A Shape is a small ordered list of dimension sizes:
//   - None:   Shape([])          — no shape yet (none-state array, unknown argument)
//   - Vector: Shape([5])         — 1 dimension, 5 elements
//   - Matrix: Shape([3, 4])      — 2 dimensions, 12 elements
//
// Shape inference uses two levels of "unknown":
//   1. ndim == 0      — nothing is known about the shape
//   2. a dim of 0     — the rank is known, that dimension is not
//
// A shape is *known* only when neither applies.

/// Ordered dimension sizes of an array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The empty shape, used for none-state arrays and unknown shapes.
    pub fn none() -> Self {
        Shape(Vec::new())
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// True for the zero-length shape.
    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the rank is known and no dimension is left as 0.
    pub fn is_known(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|&d| d != 0)
    }

    /// Total number of elements. The none shape holds no elements.
    pub fn size(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.iter().product()
        }
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> crate::Result<usize> {
        self.0.get(d).copied().ok_or_else(|| {
            crate::Error::msg(format!(
                "dimension {} out of range for shape {} with {} dimensions",
                d,
                self,
                self.ndim()
            ))
        })
    }

    /// Collapse all trailing dimensions: `[N, a, b, ...]` → `(N, a*b*...)`.
    pub fn flat_2d(&self) -> (usize, usize) {
        match self.0.split_first() {
            None => (0, 0),
            Some((&rows, rest)) => (rows, rest.iter().product()),
        }
    }

    /// Merge what `other` knows into `self`.
    ///
    /// Unknown (none) shapes adopt the other shape, unknown dimensions adopt the
    /// other dimension. Conflicting known dimensions are an error.
    /// Returns true if `self` changed.
    pub fn refine(&mut self, other: &Shape) -> crate::Result<bool> {
        if other.is_none() {
            return Ok(false);
        }
        if self.is_none() {
            *self = other.clone();
            return Ok(true);
        }
        let mismatch = || crate::Error::ShapeMismatch {
            expected: self.clone(),
            got: other.clone(),
        };
        if self.ndim() != other.ndim() {
            return Err(mismatch());
        }
        let mut merged = self.0.clone();
        for (mine, &theirs) in merged.iter_mut().zip(other.dims()) {
            if *mine == 0 {
                *mine = theirs;
            } else if theirs != 0 && *mine != theirs {
                return Err(mismatch());
            }
        }
        let changed = merged != self.0;
        self.0 = merged;
        Ok(changed)
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

// Convenient From implementations
// These let you write: Shape::from((3, 4)) instead of Shape::new(vec![3, 4])

impl From<usize> for Shape {
    /// 1-D shape.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_shape() {
        let s = Shape::none();
        assert_eq!(s.ndim(), 0);
        assert_eq!(s.size(), 0);
        assert!(s.is_none());
        assert!(!s.is_known());
    }

    #[test]
    fn test_matrix_shape() {
        let s = Shape::from((3, 4));
        assert_eq!(s.ndim(), 2);
        assert_eq!(s.size(), 12);
        assert!(s.is_known());
    }

    #[test]
    fn test_unknown_dim() {
        let s = Shape::from((0, 4));
        assert_eq!(s.ndim(), 2);
        assert!(!s.is_known());
    }

    #[test]
    fn test_flat_2d() {
        assert_eq!(Shape::from((2, 3, 4)).flat_2d(), (2, 12));
        assert_eq!(Shape::from(5).flat_2d(), (5, 1));
    }

    #[test]
    fn test_refine() {
        let mut s = Shape::none();
        assert!(s.refine(&Shape::from((0, 4))).unwrap());
        assert!(s.refine(&Shape::from((2, 4))).unwrap());
        assert_eq!(s, Shape::from((2, 4)));
        assert!(!s.refine(&Shape::from((2, 4))).unwrap());
        assert!(!s.refine(&Shape::none()).unwrap());
        assert!(s.refine(&Shape::from((3, 4))).is_err());
        assert!(s.refine(&Shape::from(8)).is_err());
    }

    #[test]
    fn test_structural_equality() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(Shape::from((2, 3)));
        assert!(set.contains(&Shape::new(vec![2, 3])));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[3, 4]");
        assert_eq!(format!("{}", Shape::none()), "[]");
    }
}
