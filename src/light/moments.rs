//! Summed-area tables of raw image moments.
//!
//! `Moments::<I, J>` answers `Σ yᴵ xᴶ v(x, y)` over any axis-aligned region
//! in constant time, which is all the light-probe samplers need to evaluate
//! every candidate cut of a region.

use serde::{Deserialize, Serialize};

/// Inclusive pixel rectangle `[x0, x1] × [y0, y1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub y0: usize,
    pub x0: usize,
    pub y1: usize,
    pub x1: usize,
}

impl Region {
    pub fn new(y0: usize, x0: usize, y1: usize, x1: usize) -> Self {
        debug_assert!(x0 <= x1 && y0 <= y1);
        Self { y0, x0, y1, x1 }
    }

    pub fn width(&self) -> usize {
        self.x1 - self.x0 + 1
    }

    pub fn height(&self) -> usize {
        self.y1 - self.y0 + 1
    }

    pub fn area(&self) -> usize {
        self.width() * self.height()
    }

    /// Rows `y0..=y` and `y+1..=y1`.
    pub fn split_rows(&self, y: usize) -> (Region, Region) {
        (
            Region::new(self.y0, self.x0, y, self.x1),
            Region::new(y + 1, self.x0, self.y1, self.x1),
        )
    }

    /// Columns `x0..=x` and `x+1..=x1`.
    pub fn split_cols(&self, x: usize) -> (Region, Region) {
        (
            Region::new(self.y0, self.x0, self.y1, x),
            Region::new(self.y0, x + 1, self.y1, self.x1),
        )
    }

    /// Centre of the rectangle in pixel coordinates.
    pub fn centre(&self) -> (f64, f64) {
        ((self.x0 + self.x1) as f64 / 2.0, (self.y0 + self.y1) as f64 / 2.0)
    }
}

/// Table of prefix sums of `yᴵ xᴶ v(x, y)`.
#[derive(Debug, Clone)]
pub struct Moments<const I: i32, const J: i32> {
    cols: usize,
    rows: usize,
    /// `(rows + 1) × (cols + 1)`, with a zero first row and column.
    sums: Vec<f64>,
}

impl<const I: i32, const J: i32> Moments<I, J> {
    /// Builds the table from row-major values of a `cols × rows` image.
    pub fn new(values: &[f64], cols: usize, rows: usize) -> Self {
        debug_assert_eq!(values.len(), cols * rows);
        let stride = cols + 1;
        let mut sums = vec![0.0; stride * (rows + 1)];
        for y in 0..rows {
            let wy = (y as f64).powi(I);
            let mut running = 0.0;
            for x in 0..cols {
                running += wy * (x as f64).powi(J) * values[y * cols + x];
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + running;
            }
        }
        Self { cols, rows, sums }
    }

    /// Moment over `region`, which must lie inside the image.
    pub fn sum(&self, region: &Region) -> f64 {
        debug_assert!(region.x1 < self.cols && region.y1 < self.rows);
        let stride = self.cols + 1;
        let at = |y: usize, x: usize| self.sums[y * stride + x];
        at(region.y1 + 1, region.x1 + 1) - at(region.y0, region.x1 + 1) - at(region.y1 + 1, region.x0)
            + at(region.y0, region.x0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn uniform(cols: usize, rows: usize, value: f64) -> Vec<f64> {
        vec![value; cols * rows]
    }

    #[test]
    fn test_uniform_zeroth_moment_is_area_times_value() {
        let m00 = Moments::<0, 0>::new(&uniform(20, 10, 0.5), 20, 10);
        let region = Region::new(2, 3, 6, 12);
        assert_eq!(region.area(), 50);
        assert_relative_eq!(m00.sum(&region), 25.0, epsilon = 1e-12);
        assert_relative_eq!(m00.sum(&Region::new(0, 0, 9, 19)), 100.0, epsilon = 1e-12);
    }

    #[test]
    fn test_first_moments_locate_centroid() {
        let values = uniform(20, 10, 2.0);
        let m00 = Moments::<0, 0>::new(&values, 20, 10);
        let m10 = Moments::<1, 0>::new(&values, 20, 10);
        let m01 = Moments::<0, 1>::new(&values, 20, 10);
        let region = Region::new(2, 4, 6, 10);
        assert_relative_eq!(m10.sum(&region) / m00.sum(&region), 4.0, epsilon = 1e-12);
        assert_relative_eq!(m01.sum(&region) / m00.sum(&region), 7.0, epsilon = 1e-12);
    }

    #[test]
    fn test_moments_are_additive() {
        let values: Vec<f64> = (0..15 * 12).map(|i| ((i * 37) % 11) as f64).collect();
        let m20 = Moments::<2, 0>::new(&values, 15, 12);
        let m02 = Moments::<0, 2>::new(&values, 15, 12);
        let region = Region::new(1, 2, 10, 13);
        for y in region.y0..region.y1 {
            let (a, b) = region.split_rows(y);
            assert_relative_eq!(m20.sum(&a) + m20.sum(&b), m20.sum(&region), max_relative = 1e-12);
        }
        for x in region.x0..region.x1 {
            let (a, b) = region.split_cols(x);
            assert_relative_eq!(m02.sum(&a) + m02.sum(&b), m02.sum(&region), max_relative = 1e-12);
        }
    }

    #[test]
    fn test_single_pixel() {
        let mut values = uniform(4, 3, 0.0);
        values[2 * 4 + 3] = 5.0;
        let m11 = Moments::<1, 1>::new(&values, 4, 3);
        assert_relative_eq!(m11.sum(&Region::new(2, 3, 2, 3)), 30.0);
        assert_relative_eq!(m11.sum(&Region::new(0, 0, 1, 3)), 0.0);
    }
}
