use std::fmt::{Display, Formatter};
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::util::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    #[error("matrix payload is truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("matrix payload has {0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("matrix of {rows}x{cols} elements is too large")]
    TooLarge { rows: usize, cols: usize },

    #[error("dimension mismatch: {expected:?} vs {actual:?}")]
    DimensionMismatch { expected: (usize, usize), actual: (usize, usize) },

    #[error("line {line}: expected {expected} values, found {actual}")]
    RaggedRow { line: usize, expected: usize, actual: usize },

    #[error("line {line}: {token:?} is not an integer")]
    InvalidNumber { line: usize, token: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A dense row-major matrix of f64 values: the data that nodes agree on.
///
/// Serialized form (all big endian):
/// ```ascii
/// 0: rows (u32)
/// 4: cols (u32)
/// 8: rows * cols f64 values, row by row
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    const HEADER_LEN: usize = 8;

    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Matrix, MatrixError> {
        let num_elements = rows.checked_mul(cols)
            .ok_or(MatrixError::TooLarge { rows, cols })?;
        if data.len() != num_elements {
            return Err(MatrixError::DimensionMismatch { expected: (rows, cols), actual: (1, data.len()) });
        }
        Ok(Matrix { rows, cols, data })
    }

    pub fn zeros(rows: usize, cols: usize) -> Matrix {
        Matrix { rows, cols, data: vec![0.0; rows * cols] }
    }

    pub fn scalar(value: f64) -> Matrix {
        Matrix { rows: 1, cols: 1, data: vec![value] }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.data.get(row * self.cols + col).copied()
    }

    pub fn serialized_len(&self) -> usize {
        Self::HEADER_LEN + 8 * self.data.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.rows.prechecked_cast());
        buf.put_u32(self.cols.prechecked_cast());
        for &v in &self.data {
            buf.put_f64(v);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Parses a complete payload - trailing bytes are an error since they indicate a sender
    ///  using a different format.
    pub fn deser(buf: &mut impl Buf) -> Result<Matrix, MatrixError> {
        if buf.remaining() < Self::HEADER_LEN {
            return Err(MatrixError::Truncated { expected: Self::HEADER_LEN, actual: buf.remaining() });
        }
        let rows: usize = buf.get_u32().safe_cast();
        let cols: usize = buf.get_u32().safe_cast();

        let num_elements = rows.checked_mul(cols)
            .ok_or(MatrixError::TooLarge { rows, cols })?;
        let data_len = num_elements.checked_mul(8)
            .ok_or(MatrixError::TooLarge { rows, cols })?;
        if buf.remaining() < data_len {
            return Err(MatrixError::Truncated { expected: Self::HEADER_LEN + data_len, actual: Self::HEADER_LEN + buf.remaining() });
        }

        let data = (0..num_elements)
            .map(|_| buf.get_f64())
            .collect();

        if buf.has_remaining() {
            return Err(MatrixError::TrailingBytes(buf.remaining()));
        }
        Ok(Matrix { rows, cols, data })
    }

    pub fn try_sub(&self, other: &Matrix) -> Result<Matrix, MatrixError> {
        self.check_same_shape(other)?;
        Ok(Matrix {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().zip(&other.data).map(|(a, b)| a - b).collect(),
        })
    }

    /// `self += factor * other`
    pub fn add_scaled(&mut self, factor: f64, other: &Matrix) -> Result<(), MatrixError> {
        self.check_same_shape(other)?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += factor * b;
        }
        Ok(())
    }

    fn check_same_shape(&self, other: &Matrix) -> Result<(), MatrixError> {
        if self.shape() != other.shape() {
            return Err(MatrixError::DimensionMismatch { expected: self.shape(), actual: other.shape() });
        }
        Ok(())
    }

    /// Parses whitespace separated integers, one matrix row per line. Blank lines are ignored,
    ///  all other lines must have the same number of values.
    pub fn parse_rows(s: &str) -> Result<Matrix, MatrixError> {
        let mut cols = None;
        let mut rows = 0;
        let mut data = Vec::new();

        for (idx, line) in s.lines().enumerate() {
            let line_no = idx + 1;

            let mut num_values = 0;
            for token in line.split_whitespace() {
                let value: i64 = token.parse()
                    .map_err(|_| MatrixError::InvalidNumber { line: line_no, token: token.to_string() })?;
                data.push(value as f64);
                num_values += 1;
            }
            if num_values == 0 {
                continue;
            }

            match cols {
                None => cols = Some(num_values),
                Some(expected) if expected != num_values => {
                    return Err(MatrixError::RaggedRow { line: line_no, expected, actual: num_values });
                }
                Some(_) => {}
            }
            rows += 1;
        }

        Ok(Matrix { rows, cols: cols.unwrap_or(0), data })
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Matrix, MatrixError> {
        let s = std::fs::read_to_string(path)?;
        Self::parse_rows(&s)
    }
}

impl Display for Matrix {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (row_idx, row) in self.data.chunks(self.cols.max(1)).enumerate() {
            if row_idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "[")?;
            for (col_idx, v) in row.iter().enumerate() {
                if col_idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", v)?;
            }
            write!(f, "]")?;
        }
        write!(f, "]")
    }
}
