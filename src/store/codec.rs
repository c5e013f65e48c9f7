//! Spill file encoding for tabular batches.
//!
//! Layout: `TBC1` magic, flags byte, u32 LE header length, JSON header,
//! then every column's data and validity buffers back to back. With the
//! zstd flag set, the buffer section is zstd-compressed as one frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::{BatchError, Column, DataType, TabularBatch};
use crate::config::CompressionConfig;

const MAGIC: &[u8; 4] = b"TBC1";
const FLAG_ZSTD: u8 = 0b0000_0001;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("Bad magic: not a spilled batch")]
    BadMagic,

    #[error("Spilled batch truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid header: {0}")]
    Header(#[from] serde_json::Error),

    #[error("Invalid column data: {0}")]
    Batch(#[from] BatchError),
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchHeader {
    num_rows: usize,
    columns: Vec<ColumnHeader>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ColumnHeader {
    name: String,
    dtype: DataType,
    data_len: usize,
    validity_len: Option<usize>,
}

/// Encodes batches for the disk tier and decodes them back.
#[derive(Debug, Clone)]
pub struct BatchCodec {
    config: CompressionConfig,
}

impl BatchCodec {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Serialize a batch into a self-describing byte buffer.
    pub fn encode(&self, batch: &TabularBatch) -> Result<Vec<u8>, CodecError> {
        let header = BatchHeader {
            num_rows: batch.num_rows(),
            columns: batch
                .columns()
                .map(|(name, col)| ColumnHeader {
                    name: name.to_string(),
                    dtype: col.dtype(),
                    data_len: col.data().len(),
                    validity_len: col.validity().map(|v| v.len()),
                })
                .collect(),
        };
        let header = serde_json::to_vec(&header)?;

        let mut payload = BytesMut::with_capacity(batch.byte_size());
        for (_, col) in batch.columns() {
            payload.put_slice(col.data());
            if let Some(validity) = col.validity() {
                payload.put_slice(validity);
            }
        }

        let (flags, payload) = if self.config.disk_zstd_compression {
            let compressed = zstd::encode_all(&payload[..], self.config.zstd_level)?;
            (FLAG_ZSTD, compressed)
        } else {
            (0, payload.to_vec())
        };

        let mut out = Vec::with_capacity(MAGIC.len() + 5 + header.len() + payload.len());
        out.put_slice(MAGIC);
        out.put_u8(flags);
        out.put_u32_le(header.len() as u32);
        out.put_slice(&header);
        out.put_slice(&payload);
        Ok(out)
    }

    /// Rebuild a batch from bytes produced by [`BatchCodec::encode`].
    pub fn decode(&self, data: &[u8]) -> Result<TabularBatch, CodecError> {
        let mut buf = data;
        ensure_len(buf, MAGIC.len() + 5)?;
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(CodecError::BadMagic);
        }
        buf.advance(MAGIC.len());
        let flags = buf.get_u8();
        let header_len = buf.get_u32_le() as usize;

        ensure_len(buf, header_len)?;
        let header: BatchHeader = serde_json::from_slice(&buf[..header_len])?;
        buf.advance(header_len);

        let mut payload = if flags & FLAG_ZSTD != 0 {
            Bytes::from(zstd::decode_all(buf)?)
        } else {
            Bytes::copy_from_slice(buf)
        };

        let mut columns = Vec::with_capacity(header.columns.len());
        for col in header.columns {
            ensure_len(&payload, col.data_len)?;
            let data = payload.split_to(col.data_len);
            let validity = match col.validity_len {
                Some(len) => {
                    ensure_len(&payload, len)?;
                    Some(payload.split_to(len))
                }
                None => None,
            };
            columns.push((col.name, Column::from_bytes(col.dtype, data, validity)?));
        }

        let batch = TabularBatch::try_new(columns)?;
        if batch.num_columns() > 0 && batch.num_rows() != header.num_rows {
            return Err(CodecError::Batch(BatchError::LengthMismatch {
                name: "<batch>".to_string(),
                expected: header.num_rows,
                actual: batch.num_rows(),
            }));
        }
        Ok(batch)
    }
}

fn ensure_len(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> TabularBatch {
        TabularBatch::try_new([
            ("id", Column::from_values(&(0..512i64).collect::<Vec<_>>())),
            (
                "score",
                Column::from_values(&vec![0.25f32; 512])
                    .with_validity(&(0..512).map(|i| i % 3 != 0).collect::<Vec<_>>())
                    .unwrap(),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_zstd_roundtrip() {
        let codec = BatchCodec::new(CompressionConfig::default());
        let batch = sample_batch();

        let encoded = codec.encode(&batch).unwrap();
        assert!(encoded.len() < batch.byte_size()); // repetitive data compresses

        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_uncompressed_roundtrip() {
        let codec = BatchCodec::new(CompressionConfig {
            disk_zstd_compression: false,
            ..Default::default()
        });
        let batch = sample_batch();

        let decoded = codec.decode(&codec.encode(&batch).unwrap()).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_bad_magic() {
        let codec = BatchCodec::new(CompressionConfig::default());
        let err = codec.decode(b"NOPE\0\0\0\0\0").unwrap_err();
        assert!(matches!(err, CodecError::BadMagic));
    }

    #[test]
    fn test_truncated_input() {
        let codec = BatchCodec::new(CompressionConfig {
            disk_zstd_compression: false,
            ..Default::default()
        });
        let encoded = codec.encode(&sample_batch()).unwrap();
        let err = codec.decode(&encoded[..encoded.len() - 10]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }
}
