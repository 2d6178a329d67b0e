//! Helpers for kernel tests.

use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::iter::zip;

use vkern_layout::{Element, MemoryDesc};

/// Trait that tests whether two values are approximately equal.
///
/// The comparison uses both the absolute and relative difference, matching
/// `np.allclose`.
pub trait ApproxEq: Sized {
    fn default_abs_tolerance() -> Self;
    fn default_rel_tolerance() -> Self;

    /// Test whether `(self - other).abs() <= atol + rtol * other.abs()`.
    fn approx_eq_with_atol_rtol(&self, other: &Self, atol: Self, rtol: Self) -> bool;

    fn approx_eq(&self, other: &Self) -> bool {
        self.approx_eq_with_atol_rtol(
            other,
            Self::default_abs_tolerance(),
            Self::default_rel_tolerance(),
        )
    }
}

impl ApproxEq for f32 {
    fn default_abs_tolerance() -> f32 {
        1e-6
    }

    fn default_rel_tolerance() -> f32 {
        1e-4
    }

    fn approx_eq_with_atol_rtol(&self, other: &f32, atol: f32, rtol: f32) -> bool {
        if self.is_nan() || other.is_nan() {
            return self.is_nan() && other.is_nan();
        }
        (self - other).abs() <= atol + rtol * other.abs()
    }
}

macro_rules! impl_approx_eq_int {
    ($type:ty) => {
        impl ApproxEq for $type {
            fn default_abs_tolerance() -> $type {
                0
            }

            fn default_rel_tolerance() -> $type {
                0
            }

            fn approx_eq_with_atol_rtol(&self, other: &$type, atol: $type, _rtol: $type) -> bool {
                (*self as i64 - *other as i64).abs() <= atol as i64
            }
        }
    };
}

impl_approx_eq_int!(i32);
impl_approx_eq_int!(i8);
impl_approx_eq_int!(u8);

#[derive(Debug)]
pub struct ExpectEqualError(String);

impl Display for ExpectEqualError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for ExpectEqualError {}

/// Check that two slices have the same length and approximately equal
/// contents.
pub fn expect_equal<T: ApproxEq + Copy + Debug>(x: &[T], y: &[T]) -> Result<(), ExpectEqualError> {
    expect_equal_with_tolerance(x, y, T::default_abs_tolerance(), T::default_rel_tolerance())
}

/// Variant of [`expect_equal`] with custom tolerances.
pub fn expect_equal_with_tolerance<T: ApproxEq + Copy + Debug>(
    x: &[T],
    y: &[T],
    atol: T,
    rtol: T,
) -> Result<(), ExpectEqualError> {
    if x.len() != y.len() {
        return Err(ExpectEqualError(format!(
            "Lengths differ. {} vs. {}",
            x.len(),
            y.len()
        )));
    }

    let mismatches: Vec<_> = zip(x, y)
        .enumerate()
        .filter(|(_, (xi, yi))| !xi.approx_eq_with_atol_rtol(yi, atol, rtol))
        .map(|(i, (xi, yi))| (i, *xi, *yi))
        .collect();

    if mismatches.is_empty() {
        return Ok(());
    }

    let max_examples = 16;
    Err(ExpectEqualError(format!(
        "Values differ at {} of {} indexes: {:?}{}",
        mismatches.len(),
        x.len(),
        &mismatches[..mismatches.len().min(max_examples)],
        if mismatches.len() > max_examples {
            "..."
        } else {
            ""
        }
    )))
}

/// Store logical row-major `values` into a new buffer laid out as `desc`.
///
/// Padding elements are filled with `pad`.
pub fn pack<T: Element>(desc: &MemoryDesc, values: &[T], pad: T) -> Vec<T> {
    assert_eq!(values.len(), desc.nelems());
    let mut buf = vec![pad; desc.size()];
    for (i, &x) in values.iter().enumerate() {
        buf[desc.offset_linear(i)] = x;
    }
    buf
}

/// Read the elements of a buffer laid out as `desc` in logical row-major
/// order.
pub fn unpack<T: Element>(desc: &MemoryDesc, buf: &[T]) -> Vec<T> {
    (0..desc.nelems())
        .map(|i| buf[desc.offset_linear(i)])
        .collect()
}

/// Generate `len` random values uniformly distributed in `[lo, hi)`.
pub fn rand_vec(rng: &mut fastrand::Rng, len: usize, lo: f32, hi: f32) -> Vec<f32> {
    (0..len).map(|_| lo + rng.f32() * (hi - lo)).collect()
}

/// Return the row-major strides of `dims`.
pub fn row_major_strides(dims: &[usize]) -> Vec<usize> {
    (0..dims.len())
        .map(|d| dims[d + 1..].iter().product())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{expect_equal, ApproxEq};

    #[test]
    fn test_approx_eq_f32() {
        let vals = [-1000f32, -5., -0.5, 0., 0.5, 5., 1000.];
        for val in vals {
            assert!(val.approx_eq(&val));
            assert!(val.approx_eq(&(val + 5e-7 + val * 5e-5)));
            assert!(!val.approx_eq(&(val + 1e-5 + val * 2e-4)));
        }
        assert!(f32::NAN.approx_eq(&f32::NAN));
    }

    #[test]
    fn test_expect_equal() {
        assert!(expect_equal(&[1., 2.], &[1., 2.]).is_ok());
        assert!(expect_equal(&[1., 2.], &[1.]).is_err());

        let err = expect_equal(&[1, 2, 3], &[1, 5, 3]).unwrap_err();
        assert_eq!(err.to_string(), "Values differ at 1 of 3 indexes: [(1, 2, 5)]");
    }
}
