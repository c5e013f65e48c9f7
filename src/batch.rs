//! Tabular batch types.
//!
//! A batch is an immutable, reference-counted set of named fixed-width
//! columns. The cache machine only cares about its byte size and identity;
//! the typed accessors exist for producers, consumers and the spill codec.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("Column '{name}' has {actual} rows, expected {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Duplicate column name '{0}'")]
    DuplicateColumn(String),

    #[error("Buffer of {len} bytes is not a multiple of {dtype:?} width")]
    MisalignedBuffer { dtype: DataType, len: usize },

    #[error("Validity bitmap has {actual} bytes, need at least {needed}")]
    ValidityTooShort { needed: usize, actual: usize },
}

/// Physical element type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float16,
    Float32,
    Float64,
}

impl DataType {
    /// Width of one element in bytes.
    pub fn width(&self) -> usize {
        match self {
            DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 | DataType::Float16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
        }
    }
}

/// Rust element types that map onto a [`DataType`].
pub trait NativeType: bytemuck::Pod {
    const DTYPE: DataType;
}

macro_rules! native_type {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(impl NativeType for $ty {
            const DTYPE: DataType = DataType::$dtype;
        })*
    };
}

native_type!(
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    half::f16 => Float16,
    f32 => Float32,
    f64 => Float64,
);

/// A single fixed-width column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    dtype: DataType,
    len: usize,
    data: Bytes,
    /// Packed LSB-first validity bitmap; `None` means all values are valid.
    validity: Option<Bytes>,
}

impl Column {
    /// Build a column by copying typed values.
    pub fn from_values<T: NativeType>(values: &[T]) -> Self {
        Self {
            dtype: T::DTYPE,
            len: values.len(),
            data: Bytes::copy_from_slice(bytemuck::cast_slice(values)),
            validity: None,
        }
    }

    /// Wrap raw little-endian bytes without copying.
    pub fn from_bytes(
        dtype: DataType,
        data: Bytes,
        validity: Option<Bytes>,
    ) -> Result<Self, BatchError> {
        if data.len() % dtype.width() != 0 {
            return Err(BatchError::MisalignedBuffer {
                dtype,
                len: data.len(),
            });
        }
        let len = data.len() / dtype.width();
        if let Some(ref mask) = validity {
            let needed = len.div_ceil(8);
            if mask.len() < needed {
                return Err(BatchError::ValidityTooShort {
                    needed,
                    actual: mask.len(),
                });
            }
        }
        Ok(Self {
            dtype,
            len,
            data,
            validity,
        })
    }

    /// Attach a validity mask (`true` = valid). Returns a new column.
    pub fn with_validity(&self, valid: &[bool]) -> Result<Self, BatchError> {
        if valid.len() != self.len {
            return Err(BatchError::ValidityTooShort {
                needed: self.len.div_ceil(8),
                actual: valid.len().div_ceil(8),
            });
        }
        let mut mask = vec![0u8; self.len.div_ceil(8)];
        for (i, _) in valid.iter().enumerate().filter(|(_, v)| **v) {
            mask[i / 8] |= 1 << (i % 8);
        }
        Ok(Self {
            validity: Some(Bytes::from(mask)),
            ..self.clone()
        })
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn validity(&self) -> Option<&Bytes> {
        self.validity.as_ref()
    }

    /// Whether row `i` holds a value.
    pub fn is_valid(&self, i: usize) -> bool {
        match self.validity {
            Some(ref mask) => mask.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0),
            None => i < self.len,
        }
    }

    /// Read the column back as typed values, or `None` on a type mismatch.
    pub fn values<T: NativeType>(&self) -> Option<Vec<T>> {
        if T::DTYPE != self.dtype {
            return None;
        }
        Some(
            self.data
                .chunks_exact(self.dtype.width())
                .map(bytemuck::pod_read_unaligned::<T>)
                .collect(),
        )
    }

    /// Bytes held by this column (data plus validity).
    pub fn byte_size(&self) -> usize {
        self.data.len() + self.validity.as_ref().map_or(0, |m| m.len())
    }
}

#[derive(Debug, PartialEq, Eq)]
struct BatchInner {
    columns: Vec<(String, Column)>,
    num_rows: usize,
    byte_size: usize,
}

/// Immutable handle to a set of named columns.
///
/// Cloning is cheap and shares the underlying buffers; any transformation
/// produces a new batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabularBatch {
    inner: Arc<BatchInner>,
}

impl TabularBatch {
    /// Build a batch from named columns. All columns must have the same length
    /// and names must be unique.
    pub fn try_new<S: Into<String>>(
        columns: impl IntoIterator<Item = (S, Column)>,
    ) -> Result<Self, BatchError> {
        let columns: Vec<(String, Column)> =
            columns.into_iter().map(|(n, c)| (n.into(), c)).collect();

        let num_rows = columns.first().map_or(0, |(_, c)| c.len());
        for (i, (name, column)) in columns.iter().enumerate() {
            if column.len() != num_rows {
                return Err(BatchError::LengthMismatch {
                    name: name.clone(),
                    expected: num_rows,
                    actual: column.len(),
                });
            }
            if columns[..i].iter().any(|(other, _)| other == name) {
                return Err(BatchError::DuplicateColumn(name.clone()));
            }
        }

        let byte_size = columns.iter().map(|(_, c)| c.byte_size()).sum();
        Ok(Self {
            inner: Arc::new(BatchInner {
                columns,
                num_rows,
                byte_size,
            }),
        })
    }

    /// A batch with no columns and no rows.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(BatchInner {
                columns: Vec::new(),
                num_rows: 0,
                byte_size: 0,
            }),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.inner.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.inner.columns.len()
    }

    /// Total bytes across all column buffers. Fixed for the batch's lifetime.
    pub fn byte_size(&self) -> usize {
        self.inner.byte_size
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.inner.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.inner.columns.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.inner
            .columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    /// Return a new batch with `column` appended, or replacing a column of the
    /// same name.
    pub fn with_column(&self, name: &str, column: Column) -> Result<Self, BatchError> {
        let mut columns = self.inner.columns.clone();
        match columns.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = column,
            None => columns.push((name.to_string(), column)),
        }
        Self::try_new(columns)
    }

    /// Return a new batch with only the named columns, in the given order.
    /// Unknown names are skipped.
    pub fn select(&self, names: &[&str]) -> Result<Self, BatchError> {
        let columns = names
            .iter()
            .filter_map(|n| self.column(n).map(|c| (n.to_string(), c.clone())));
        Self::try_new(columns)
    }

    /// Whether two handles share the same underlying allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_byte_size() {
        let batch = TabularBatch::try_new([
            ("a", Column::from_values(&[1i32, 2, 3])),
            ("b", Column::from_values(&[1.0f64, 2.0, 3.0])),
        ])
        .unwrap();

        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.byte_size(), 3 * 4 + 3 * 8);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = TabularBatch::try_new([
            ("a", Column::from_values(&[1i32, 2, 3])),
            ("b", Column::from_values(&[1i32])),
        ])
        .unwrap_err();
        assert!(matches!(err, BatchError::LengthMismatch { .. }));
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let err = TabularBatch::try_new([
            ("a", Column::from_values(&[1u8])),
            ("a", Column::from_values(&[2u8])),
        ])
        .unwrap_err();
        assert_eq!(err, BatchError::DuplicateColumn("a".into()));
    }

    #[test]
    fn test_values_roundtrip_and_type_check() {
        let col = Column::from_values(&[half::f16::from_f32(1.5), half::f16::from_f32(-2.0)]);
        assert_eq!(col.dtype(), DataType::Float16);
        let back = col.values::<half::f16>().unwrap();
        assert_eq!(back[0].to_f32(), 1.5);
        assert!(col.values::<i16>().is_none());
    }

    #[test]
    fn test_u16_column() {
        let col = Column::from_values(&[7u16, 65535, 0]);
        assert_eq!(col.dtype(), DataType::UInt16);
        assert_eq!(col.byte_size(), 6);
        assert_eq!(col.values::<u16>().unwrap(), vec![7, 65535, 0]);
        assert!(col.values::<i16>().is_none());
    }

    #[test]
    fn test_validity_mask() {
        let col = Column::from_values(&[1i64, 2, 3])
            .with_validity(&[true, false, true])
            .unwrap();
        assert!(col.is_valid(0));
        assert!(!col.is_valid(1));
        assert!(col.is_valid(2));
        assert_eq!(col.byte_size(), 24 + 1);
    }

    #[test]
    fn test_with_column_is_copy_on_write() {
        let original = TabularBatch::try_new([("a", Column::from_values(&[1u32, 2]))]).unwrap();
        let extended = original
            .with_column("b", Column::from_values(&[3u32, 4]))
            .unwrap();

        assert_eq!(original.num_columns(), 1);
        assert_eq!(extended.num_columns(), 2);
        assert_eq!(extended.column("a"), original.column("a"));
    }

    #[test]
    fn test_misaligned_bytes_rejected() {
        let err = Column::from_bytes(DataType::Int32, Bytes::from_static(&[0u8; 5]), None)
            .unwrap_err();
        assert!(matches!(err, BatchError::MisalignedBuffer { .. }));
    }
}
