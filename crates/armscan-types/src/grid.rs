//! Row-major 2-D buffers shared by range images, masks and lookup tables.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ArmScanError;

/// Number of rows and columns of an image-like buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Total number of pixels.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Total number of pixels, or `None` if it does not fit in `usize`.
    pub fn checked_len(&self) -> Option<usize> {
        self.rows.checked_mul(self.cols)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// A dense 2-D array stored in row-major order.
///
/// The constructor guarantees `data.len() == rows * cols`; deserialisation
/// goes through the same check so a malformed frame never produces a grid
/// whose indexing would panic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGrid<T>")]
pub struct Grid<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

#[derive(Deserialize)]
struct RawGrid<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T> TryFrom<RawGrid<T>> for Grid<T> {
    type Error = ArmScanError;

    fn try_from(raw: RawGrid<T>) -> Result<Self, Self::Error> {
        Grid::from_vec(raw.rows, raw.cols, raw.data)
    }
}

impl<T: Clone> Grid<T> {
    /// Create a grid of `rows × cols` filled with `fill`.
    ///
    /// # Panics
    ///
    /// Panics if `rows * cols` overflows `usize`.  Use [`Grid::try_new`] for
    /// dimensions that come from untrusted input.
    pub fn new(rows: usize, cols: usize, fill: T) -> Self {
        match Self::try_new(rows, cols, fill) {
            Ok(grid) => grid,
            Err(e) => panic!("{e}"),
        }
    }

    /// Create a grid of `rows × cols` filled with `fill`, rejecting
    /// dimensions whose product overflows.
    pub fn try_new(rows: usize, cols: usize, fill: T) -> Result<Self, ArmScanError> {
        let len = Shape::new(rows, cols)
            .checked_len()
            .ok_or(ArmScanError::InvalidGrid { rows, cols, len: 0 })?;
        Ok(Self {
            rows,
            cols,
            data: vec![fill; len],
        })
    }
}

impl<T> Grid<T> {
    /// Wrap an existing row-major buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ArmScanError::InvalidGrid`] if `data` does not hold exactly
    /// `rows * cols` elements, or if that product overflows.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Result<Self, ArmScanError> {
        if Shape::new(rows, cols).checked_len() != Some(data.len()) {
            return Err(ArmScanError::InvalidGrid {
                rows,
                cols,
                len: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Build a grid from nested rows.  Every row must have the same length.
    pub fn from_rows(rows: Vec<Vec<T>>) -> Result<Self, ArmScanError> {
        let n_rows = rows.len();
        let n_cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::new();
        for row in rows {
            if row.len() != n_cols {
                return Err(ArmScanError::InvalidGrid {
                    rows: n_rows,
                    cols: n_cols,
                    len: data.len() + row.len(),
                });
            }
            data.extend(row);
        }
        Self::from_vec(n_rows, n_cols, data)
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.rows, self.cols)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        if row < self.rows && col < self.cols {
            self.data.get(row * self.cols + col)
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, row: usize, col: usize) -> Option<&mut T> {
        if row < self.rows && col < self.cols {
            self.data.get_mut(row * self.cols + col)
        } else {
            None
        }
    }

    /// Borrow one row.  Panics if `row` is out of range.
    pub fn row(&self, row: usize) -> &[T] {
        let start = row * self.cols;
        &self.data[start..start + self.cols]
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Apply `f` to every element, keeping the shape.
    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Grid<U> {
        Grid {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(f).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = Grid::from_vec(2, 3, vec![0u8; 5]).unwrap_err();
        assert_eq!(
            err,
            ArmScanError::InvalidGrid {
                rows: 2,
                cols: 3,
                len: 5
            }
        );
    }

    #[test]
    fn from_rows_is_row_major() {
        let g = Grid::from_rows(vec![vec![1, 2, 3], vec![4, 5, 6]]).unwrap();
        assert_eq!(g.shape(), Shape::new(2, 3));
        assert_eq!(g.get(1, 0), Some(&4));
        assert_eq!(g.row(0), &[1, 2, 3]);
        assert_eq!(g.as_slice(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn from_rows_rejects_ragged_input() {
        assert!(Grid::from_rows(vec![vec![1, 2], vec![3]]).is_err());
    }

    #[test]
    fn get_out_of_bounds_is_none() {
        let g = Grid::new(2, 2, 0u8);
        assert!(g.get(2, 0).is_none());
        assert!(g.get(0, 2).is_none());
    }

    #[test]
    fn deserialize_validates_length() {
        let ok: Grid<u32> =
            serde_json::from_str(r#"{"rows":1,"cols":2,"data":[7,8]}"#).unwrap();
        assert_eq!(ok.get(0, 1), Some(&8));

        let bad = serde_json::from_str::<Grid<u32>>(r#"{"rows":2,"cols":2,"data":[7,8]}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn deserialize_rejects_overflowing_dimensions() {
        let err = serde_json::from_str::<Grid<u32>>(
            r#"{"rows":9223372036854775808,"cols":2,"data":[]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot hold 0 elements"));
        assert!(Grid::from_vec(usize::MAX, 2, Vec::<u8>::new()).is_err());
    }

    #[test]
    fn try_new_rejects_overflowing_dimensions() {
        assert_eq!(
            Grid::try_new(usize::MAX, 2, 0u8).unwrap_err(),
            ArmScanError::InvalidGrid {
                rows: usize::MAX,
                cols: 2,
                len: 0
            }
        );
        assert_eq!(Shape::new(usize::MAX, 2).checked_len(), None);
        assert_eq!(Grid::try_new(2, 3, 1u8).unwrap().as_slice(), &[1; 6]);
    }

    #[test]
    fn shape_display() {
        assert_eq!(Shape::new(64, 1024).to_string(), "64x1024");
    }
}
