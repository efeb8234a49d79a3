//! Output verification against the stored reference.
use half::f16;
use log::warn;
use num::complex::{Complex32, Complex64};

use crate::arguments::HostVector;

/// Policy for comparing a run's outputs against the reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VerificationMethod {
    /// Accumulates per-element absolute differences and compares the sum
    /// against the tolerance.
    AbsoluteDifference,
    /// Compares every element individually against the tolerance.
    SideBySide,
}

/// Default tolerance on the accumulated absolute difference.
pub const DEFAULT_TOLERANCE: f64 = 1e-4;

fn diff_i16(a: i16, b: i16) -> f64 {
    (f64::from(a) - f64::from(b)).abs()
}

fn diff_i32(a: i32, b: i32) -> f64 {
    (f64::from(a) - f64::from(b)).abs()
}

fn diff_usize(a: usize, b: usize) -> f64 {
    (a as f64 - b as f64).abs()
}

// 16-bit floats are decoded to 32 bits before comparing.
fn diff_f16(a: f16, b: f16) -> f64 {
    (f64::from(a.to_f32()) - f64::from(b.to_f32())).abs()
}

fn diff_f32(a: f32, b: f32) -> f64 {
    (f64::from(a) - f64::from(b)).abs()
}

fn diff_f64(a: f64, b: f64) -> f64 {
    (a - b).abs()
}

fn diff_cplx32(a: Complex32, b: Complex32) -> f64 {
    f64::from((a.re - b.re).abs()) + f64::from((a.im - b.im).abs())
}

fn diff_cplx64(a: Complex64, b: Complex64) -> f64 {
    (a.re - b.re).abs() + (a.im - b.im).abs()
}

fn compare<T: Copy, F: Fn(T, T) -> f64>(
    method: VerificationMethod,
    tolerance: f64,
    reference: &[T],
    result: &[T],
    diff: F,
) -> bool {
    if reference.len() != result.len() {
        warn!(
            "results differ: {} reference elements against {}",
            reference.len(),
            result.len()
        );
        return false;
    }
    match method {
        VerificationMethod::AbsoluteDifference => {
            let norm: f64 = reference
                .iter()
                .zip(result)
                .map(|(&r, &o)| diff(r, o))
                .sum();
            if norm.is_nan() || norm > tolerance {
                warn!("results differ: absolute-difference norm is {:6.2e}", norm);
                false
            } else {
                true
            }
        }
        VerificationMethod::SideBySide => {
            for (j, (&r, &o)) in reference.iter().zip(result).enumerate() {
                let difference = diff(r, o);
                if difference.is_nan() || difference > tolerance {
                    warn!(
                        "different results at position {}: difference is {:.8}",
                        j, difference
                    );
                    return false;
                }
            }
            true
        }
    }
}

/// Compares a downloaded output against its reference vector. Returns `false`
/// on any mismatch, including mismatching data-types.
pub fn verify(
    method: VerificationMethod,
    tolerance: f64,
    reference: &HostVector,
    result: &HostVector,
) -> bool {
    match (reference, result) {
        (HostVector::I16(r), HostVector::I16(o)) => compare(method, tolerance, r, o, diff_i16),
        (HostVector::I32(r), HostVector::I32(o)) => compare(method, tolerance, r, o, diff_i32),
        (HostVector::Usize(r), HostVector::Usize(o)) => {
            compare(method, tolerance, r, o, diff_usize)
        }
        (HostVector::F16(r), HostVector::F16(o)) => compare(method, tolerance, r, o, diff_f16),
        (HostVector::F32(r), HostVector::F32(o)) => compare(method, tolerance, r, o, diff_f32),
        (HostVector::F64(r), HostVector::F64(o)) => compare(method, tolerance, r, o, diff_f64),
        (HostVector::Cplx32(r), HostVector::Cplx32(o)) => {
            compare(method, tolerance, r, o, diff_cplx32)
        }
        (HostVector::Cplx64(r), HostVector::Cplx64(o)) => {
            compare(method, tolerance, r, o, diff_cplx64)
        }
        _ => {
            warn!("mismatching data-types between reference and result");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulated_norm_respects_the_tolerance() {
        let reference = HostVector::F32(vec![1.0, 2.0, 3.0]);
        let close = HostVector::F32(vec![1.0, 2.0, 3.0 + 1e-6]);
        let far = HostVector::F32(vec![1.0, 2.0, 4.0]);
        assert!(verify(
            VerificationMethod::AbsoluteDifference,
            1e-4,
            &reference,
            &close
        ));
        assert!(!verify(
            VerificationMethod::AbsoluteDifference,
            1e-4,
            &reference,
            &far
        ));
    }

    #[test]
    fn side_by_side_catches_single_outliers() {
        // The accumulated norm stays under a loose tolerance, but one element
        // is off on its own.
        let reference = HostVector::F64(vec![0.0; 100]);
        let mut shifted = vec![0.0; 100];
        shifted[41] = 0.5;
        let shifted = HostVector::F64(shifted);
        assert!(verify(
            VerificationMethod::AbsoluteDifference,
            1.0,
            &reference,
            &shifted
        ));
        assert!(!verify(
            VerificationMethod::SideBySide,
            0.1,
            &reference,
            &shifted
        ));
    }

    #[test]
    fn comparison_is_symmetric() {
        let a = HostVector::F32(vec![1.0, -2.0, 3.5]);
        let b = HostVector::F32(vec![0.5, -2.5, 3.0]);
        for &method in &[
            VerificationMethod::AbsoluteDifference,
            VerificationMethod::SideBySide,
        ] {
            for &tolerance in &[0.1, 2.0, 10.0] {
                assert_eq!(
                    verify(method, tolerance, &a, &b),
                    verify(method, tolerance, &b, &a)
                );
            }
        }
    }

    #[test]
    fn nan_always_fails() {
        let reference = HostVector::F32(vec![1.0]);
        let nan = HostVector::F32(vec![std::f32::NAN]);
        assert!(!verify(
            VerificationMethod::AbsoluteDifference,
            1e9,
            &reference,
            &nan
        ));
        assert!(!verify(
            VerificationMethod::SideBySide,
            1e9,
            &reference,
            &nan
        ));
    }

    #[test]
    fn complex_distance_sums_both_components() {
        let reference = HostVector::Cplx32(vec![Complex32::new(1.0, 1.0)]);
        let shifted = HostVector::Cplx32(vec![Complex32::new(1.3, 0.6)]);
        // |0.3| + |0.4| = 0.7.
        assert!(verify(
            VerificationMethod::AbsoluteDifference,
            0.8,
            &reference,
            &shifted
        ));
        assert!(!verify(
            VerificationMethod::AbsoluteDifference,
            0.6,
            &reference,
            &shifted
        ));
    }

    #[test]
    fn half_precision_is_decoded_before_comparing() {
        let reference = HostVector::F16(vec![f16::from_f32(1.0)]);
        let same = HostVector::F16(vec![f16::from_f32(1.0)]);
        let other = HostVector::F16(vec![f16::from_f32(1.5)]);
        assert!(verify(
            VerificationMethod::AbsoluteDifference,
            1e-4,
            &reference,
            &same
        ));
        assert!(!verify(
            VerificationMethod::AbsoluteDifference,
            1e-4,
            &reference,
            &other
        ));
    }

    #[test]
    fn mismatching_types_or_lengths_fail() {
        let f32s = HostVector::F32(vec![1.0]);
        let f64s = HostVector::F64(vec![1.0]);
        let longer = HostVector::F32(vec![1.0, 1.0]);
        assert!(!verify(
            VerificationMethod::AbsoluteDifference,
            1e9,
            &f32s,
            &f64s
        ));
        assert!(!verify(
            VerificationMethod::AbsoluteDifference,
            1e9,
            &f32s,
            &longer
        ));
    }
}
