//! Forward-mode automatic differentiation with dual numbers.
//!
//! A [`Jet`] carries a scalar value together with a fixed-size tangent vector.
//! Seeding input `i` with the unit tangent `e_i` and evaluating a function
//! over jets yields both the function value and the `i`-th column of its
//! Jacobian. The EKF engine and the gyroscope consistency gate use this to
//! obtain derivatives of their models without hand-written Jacobians.
//!
//! Models that must run over both plain numbers and jets are written against
//! the [`Real`] trait.

use nalgebra::{SMatrix, SVector};
use std::cmp::Ordering;
use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};

/// Minimal numeric interface shared by `f64` and [`Jet`].
pub trait Real:
    Copy
    + Debug
    + PartialEq
    + PartialOrd
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
{
    /// Lifts a constant into the numeric type. Constants carry no derivative.
    fn from_f64(value: f64) -> Self;

    /// Returns the scalar part.
    fn value(&self) -> f64;

    fn sqrt(self) -> Self;
    fn sin(self) -> Self;
    fn cos(self) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }
}

impl Real for f64 {
    fn from_f64(value: f64) -> Self {
        value
    }

    fn value(&self) -> f64 {
        *self
    }

    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    fn sin(self) -> Self {
        f64::sin(self)
    }

    fn cos(self) -> Self {
        f64::cos(self)
    }
}

/// A dual number `s + e_1 ε_1 + ... + e_N ε_N` with `ε_i ε_j = 0`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Jet<const N: usize> {
    /// Scalar part.
    pub s: f64,
    /// Tangent part, one entry per differentiated input.
    pub e: SVector<f64, N>,
}

impl<const N: usize> Jet<N> {
    /// A constant: zero tangent.
    pub fn constant(s: f64) -> Self {
        Self {
            s,
            e: SVector::zeros(),
        }
    }

    /// The `i`-th independent variable, evaluated at `s`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= N`.
    pub fn variable(s: f64, i: usize) -> Self {
        let mut e = SVector::zeros();
        e[i] = 1.0;
        Self { s, e }
    }

    pub fn new(s: f64, e: SVector<f64, N>) -> Self {
        Self { s, e }
    }

    /// Seeds a whole vector of independent variables, `values[i]` on tangent `offset + i`.
    pub fn seed<const M: usize>(values: &SVector<f64, M>, offset: usize) -> SVector<Self, M> {
        SVector::from_fn(|i, _| Self::variable(values[i], offset + i))
    }
}

/// Extracts the value and Jacobian from a vector of jets.
pub fn unpack<const M: usize, const N: usize>(
    jets: &SVector<Jet<N>, M>,
) -> (SVector<f64, M>, SMatrix<f64, M, N>) {
    let value = SVector::from_fn(|i, _| jets[i].s);
    let jacobian = SMatrix::from_fn(|i, j| jets[i].e[j]);
    (value, jacobian)
}

impl<const N: usize> Add for Jet<N> {
    type Output = Self;

    fn add(self, y: Self) -> Self {
        Self::new(self.s + y.s, self.e + y.e)
    }
}

impl<const N: usize> Sub for Jet<N> {
    type Output = Self;

    fn sub(self, y: Self) -> Self {
        Self::new(self.s - y.s, self.e - y.e)
    }
}

impl<const N: usize> Mul for Jet<N> {
    type Output = Self;

    fn mul(self, y: Self) -> Self {
        Self::new(self.s * y.s, self.e * y.s + y.e * self.s)
    }
}

impl<const N: usize> Div for Jet<N> {
    type Output = Self;

    fn div(self, y: Self) -> Self {
        let s = self.s / y.s;
        Self::new(s, (self.e - y.e * s) / y.s)
    }
}

impl<const N: usize> Neg for Jet<N> {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.s, -self.e)
    }
}

impl<const N: usize> Add<f64> for Jet<N> {
    type Output = Self;

    fn add(self, y: f64) -> Self {
        Self::new(self.s + y, self.e)
    }
}

impl<const N: usize> Sub<f64> for Jet<N> {
    type Output = Self;

    fn sub(self, y: f64) -> Self {
        Self::new(self.s - y, self.e)
    }
}

impl<const N: usize> Mul<f64> for Jet<N> {
    type Output = Self;

    fn mul(self, y: f64) -> Self {
        Self::new(self.s * y, self.e * y)
    }
}

impl<const N: usize> Mul<Jet<N>> for f64 {
    type Output = Jet<N>;

    fn mul(self, y: Jet<N>) -> Jet<N> {
        y * self
    }
}

impl<const N: usize> Div<f64> for Jet<N> {
    type Output = Self;

    fn div(self, y: f64) -> Self {
        Self::new(self.s / y, self.e / y)
    }
}

impl<const N: usize> AddAssign for Jet<N> {
    fn add_assign(&mut self, y: Self) {
        *self = *self + y;
    }
}

impl<const N: usize> SubAssign for Jet<N> {
    fn sub_assign(&mut self, y: Self) {
        *self = *self - y;
    }
}

impl<const N: usize> MulAssign for Jet<N> {
    fn mul_assign(&mut self, y: Self) {
        *self = *self * y;
    }
}

/// Jets are ordered by their scalar part only.
impl<const N: usize> PartialOrd for Jet<N> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.s.partial_cmp(&other.s)
    }
}

impl<const N: usize> Real for Jet<N> {
    fn from_f64(value: f64) -> Self {
        Self::constant(value)
    }

    fn value(&self) -> f64 {
        self.s
    }

    fn sqrt(self) -> Self {
        let ss = self.s.sqrt();
        Self::new(ss, self.e / (2.0 * ss))
    }

    fn sin(self) -> Self {
        Self::new(self.s.sin(), self.e * self.s.cos())
    }

    fn cos(self) -> Self {
        Self::new(self.s.cos(), self.e * -self.s.sin())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    type J2 = Jet<2>;

    /// Central finite difference of a scalar function of two variables.
    fn numeric_gradient(f: impl Fn(f64, f64) -> f64, x: f64, y: f64) -> [f64; 2] {
        let h = 1e-6;
        [
            (f(x + h, y) - f(x - h, y)) / (2.0 * h),
            (f(x, y + h) - f(x, y - h)) / (2.0 * h),
        ]
    }

    fn check<F, G>(f_jet: F, f_num: G, x: f64, y: f64)
    where
        F: Fn(J2, J2) -> J2,
        G: Fn(f64, f64) -> f64,
    {
        let out = f_jet(J2::variable(x, 0), J2::variable(y, 1));
        let grad = numeric_gradient(&f_num, x, y);
        assert_relative_eq!(out.s, f_num(x, y), epsilon = 1e-12);
        assert_relative_eq!(out.e[0], grad[0], epsilon = 1e-6);
        assert_relative_eq!(out.e[1], grad[1], epsilon = 1e-6);
    }

    #[test]
    fn test_arithmetic_derivatives() {
        check(|x, y| x + y, |x, y| x + y, 0.3, -1.2);
        check(|x, y| x - y * 2.0, |x, y| x - y * 2.0, 0.3, -1.2);
        check(|x, y| x * y, |x, y| x * y, 0.7, 2.5);
        check(|x, y| x / y, |x, y| x / y, 0.7, 2.5);
        check(|x, y| -(x * x) / (y + 3.0), |x, y| -(x * x) / (y + 3.0), 1.1, 0.4);
    }

    #[test]
    fn test_elementary_function_derivatives() {
        check(|x, y| (x * x + y * y).sqrt(), |x, y| (x * x + y * y).sqrt(), 0.6, 0.8);
        check(|x, y| x.sin() * y.cos(), |x, y| x.sin() * y.cos(), 0.9, -0.3);
        check(
            |x, y| (x * y).cos() / (y.sin() + 2.0),
            |x, y| (x * y).cos() / (y.sin() + 2.0),
            1.3,
            0.2,
        );
    }

    #[test]
    fn test_constants_carry_no_derivative() {
        let c = J2::constant(4.0);
        let x = J2::variable(2.0, 1);
        let out = c * x + c.sqrt();
        assert_relative_eq!(out.s, 10.0);
        assert_relative_eq!(out.e[0], 0.0);
        assert_relative_eq!(out.e[1], 4.0);
    }

    #[test]
    fn test_ordering_uses_scalar_part() {
        let a = J2::variable(1.0, 0);
        let b = J2::constant(2.0);
        assert!(a < b);
        assert!(b > a);
    }

    #[test]
    fn test_unpack_jacobian() {
        let x = SVector::<f64, 2>::new(1.0, 2.0);
        let jets = J2::seed(&x, 0);
        let out = SVector::<J2, 2>::new(jets[0] * jets[1], jets[0] + jets[1] * 3.0);
        let (value, jacobian) = unpack(&out);
        assert_relative_eq!(value, SVector::<f64, 2>::new(2.0, 7.0));
        assert_relative_eq!(jacobian, SMatrix::<f64, 2, 2>::new(2.0, 1.0, 1.0, 3.0));
    }
}
