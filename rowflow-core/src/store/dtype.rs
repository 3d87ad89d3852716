//! Structured row types.
//!
//! A [`Dtype`] describes the fixed-width binary layout of one row of a
//! dataset: an ordered list of named fields, each a scalar kind with an
//! optional fixed shape (so a field may itself be a small vector, e.g. a
//! position triplet). Rows are encoded little-endian with no padding, and
//! the dtype is serialized into the container catalog so files stay
//! self-describing.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Scalar element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    /// Signed 8-bit integer.
    I8,
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer.
    U32,
    /// Unsigned 64-bit integer.
    U64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
}

impl Scalar {
    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// Short type name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }
}

/// One named field of a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Scalar element kind.
    pub scalar: Scalar,
    /// Fixed shape of the field; empty for a plain scalar.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shape: Vec<usize>,
}

impl Field {
    /// A plain scalar field.
    pub fn scalar(name: impl Into<String>, scalar: Scalar) -> Self {
        Self {
            name: name.into(),
            scalar,
            shape: Vec::new(),
        }
    }

    /// A fixed-shape vector field.
    pub fn vector(name: impl Into<String>, scalar: Scalar, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            scalar,
            shape,
        }
    }

    /// Number of scalar elements in the field.
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product::<usize>().max(1)
    }

    /// Encoded size of the field in bytes.
    pub fn byte_len(&self) -> usize {
        self.elem_count() * self.scalar.size()
    }
}

/// The row type of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dtype {
    /// Ordered fields; offsets follow declaration order with no padding.
    pub fields: Vec<Field>,
}

impl Dtype {
    /// A single-field row of the given scalar kind, named `value`.
    pub fn scalar(scalar: Scalar) -> Self {
        Self {
            fields: vec![Field::scalar("value", scalar)],
        }
    }

    /// A compound row from an ordered field list.
    pub fn compound(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Encoded row size in bytes.
    pub fn row_size(&self) -> usize {
        self.fields.iter().map(Field::byte_len).sum()
    }

    /// Look up a field and its byte offset within the row.
    pub fn field(&self, name: &str) -> Option<(&Field, usize)> {
        let mut offset = 0;
        for field in &self.fields {
            if field.name == name {
                return Some((field, offset));
            }
            offset += field.byte_len();
        }
        None
    }

    /// Human-readable type description, e.g. `{start: i64, stop: i64}`.
    pub fn describe(&self) -> String {
        if self.fields.len() == 1 && self.fields[0].name == "value" && self.fields[0].shape.is_empty()
        {
            return self.fields[0].scalar.name().to_string();
        }
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|f| {
                if f.shape.is_empty() {
                    format!("{}: {}", f.name, f.scalar.name())
                } else {
                    format!("{}: {}{:?}", f.name, f.scalar.name(), f.shape)
                }
            })
            .collect();
        format!("{{{}}}", parts.join(", "))
    }

    /// A zeroed row buffer.
    pub fn zero_row(&self) -> Vec<u8> {
        vec![0; self.row_size()]
    }

    /// Read element `idx` of `field` from a row as `i64`.
    ///
    /// Integer fields of any width are sign- or zero-extended; float fields
    /// return `None`.
    pub fn get_i64(&self, row: &[u8], field: &str, idx: usize) -> Option<i64> {
        let (f, offset) = self.field(field)?;
        if f.scalar.is_float() || idx >= f.elem_count() {
            return None;
        }
        let at = offset + idx * f.scalar.size();
        let bytes = &row[at..at + f.scalar.size()];
        Some(match f.scalar {
            Scalar::I8 => bytes[0] as i8 as i64,
            Scalar::I16 => LittleEndian::read_i16(bytes) as i64,
            Scalar::I32 => LittleEndian::read_i32(bytes) as i64,
            Scalar::I64 => LittleEndian::read_i64(bytes),
            Scalar::U8 => bytes[0] as i64,
            Scalar::U16 => LittleEndian::read_u16(bytes) as i64,
            Scalar::U32 => LittleEndian::read_u32(bytes) as i64,
            Scalar::U64 => LittleEndian::read_u64(bytes) as i64,
            Scalar::F32 | Scalar::F64 => unreachable!(),
        })
    }

    /// Read element `idx` of `field` from a row as `f64`.
    pub fn get_f64(&self, row: &[u8], field: &str, idx: usize) -> Option<f64> {
        let (f, offset) = self.field(field)?;
        if idx >= f.elem_count() {
            return None;
        }
        let at = offset + idx * f.scalar.size();
        let bytes = &row[at..at + f.scalar.size()];
        match f.scalar {
            Scalar::F32 => Some(LittleEndian::read_f32(bytes) as f64),
            Scalar::F64 => Some(LittleEndian::read_f64(bytes)),
            _ => self.get_i64(row, field, idx).map(|v| v as f64),
        }
    }

    /// Write element `idx` of `field` into a row from an `i64`.
    ///
    /// The value is truncated to the field width. Returns `false` when the
    /// field does not exist or is a float.
    pub fn put_i64(&self, row: &mut [u8], field: &str, idx: usize, value: i64) -> bool {
        let Some((f, offset)) = self.field(field) else {
            return false;
        };
        if f.scalar.is_float() || idx >= f.elem_count() {
            return false;
        }
        let at = offset + idx * f.scalar.size();
        let bytes = &mut row[at..at + f.scalar.size()];
        match f.scalar {
            Scalar::I8 => bytes[0] = value as i8 as u8,
            Scalar::I16 => LittleEndian::write_i16(bytes, value as i16),
            Scalar::I32 => LittleEndian::write_i32(bytes, value as i32),
            Scalar::I64 => LittleEndian::write_i64(bytes, value),
            Scalar::U8 => bytes[0] = value as u8,
            Scalar::U16 => LittleEndian::write_u16(bytes, value as u16),
            Scalar::U32 => LittleEndian::write_u32(bytes, value as u32),
            Scalar::U64 => LittleEndian::write_u64(bytes, value as u64),
            Scalar::F32 | Scalar::F64 => unreachable!(),
        }
        true
    }

    /// Write element `idx` of `field` into a row from an `f64`.
    pub fn put_f64(&self, row: &mut [u8], field: &str, idx: usize, value: f64) -> bool {
        let Some((f, offset)) = self.field(field) else {
            return false;
        };
        if idx >= f.elem_count() {
            return false;
        }
        let at = offset + idx * f.scalar.size();
        let bytes = &mut row[at..at + f.scalar.size()];
        match f.scalar {
            Scalar::F32 => LittleEndian::write_f32(bytes, value as f32),
            Scalar::F64 => LittleEndian::write_f64(bytes, value),
            _ => return self.put_i64(row, field, idx, value as i64),
        }
        true
    }

    /// Encode a slice of `i64` values as rows of this dtype.
    ///
    /// Only valid for single-scalar dtypes; a convenience for the common
    /// "one integer per row" datasets.
    pub fn pack_i64(&self, values: &[i64]) -> Vec<u8> {
        let field = &self.fields[0].name;
        let mut buf = vec![0; self.row_size() * values.len()];
        let size = self.row_size();
        for (i, v) in values.iter().enumerate() {
            self.put_i64(&mut buf[i * size..(i + 1) * size], field, 0, *v);
        }
        buf
    }

    /// Encode a slice of `f64` values as rows of this dtype.
    pub fn pack_f64(&self, values: &[f64]) -> Vec<u8> {
        let field = &self.fields[0].name;
        let mut buf = vec![0; self.row_size() * values.len()];
        let size = self.row_size();
        for (i, v) in values.iter().enumerate() {
            self.put_f64(&mut buf[i * size..(i + 1) * size], field, 0, *v);
        }
        buf
    }
}

/// Row type of a shared reference table: `(parent, child)` index pairs.
pub fn ref_dtype() -> Dtype {
    Dtype::compound(vec![
        Field::scalar("parent", Scalar::I64),
        Field::scalar("child", Scalar::I64),
    ])
}

/// Row type of a reference-region index: a half-open `[start, stop)` window.
///
/// `start == stop == 0` encodes the null region.
pub fn ref_region_dtype() -> Dtype {
    Dtype::compound(vec![
        Field::scalar("start", Scalar::I64),
        Field::scalar("stop", Scalar::I64),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_size_and_offsets() {
        let dtype = Dtype::compound(vec![
            Field::scalar("id", Scalar::U32),
            Field::vector("pos", Scalar::F32, vec![3]),
            Field::scalar("q", Scalar::F64),
        ]);
        assert_eq!(dtype.row_size(), 4 + 12 + 8);
        let (field, offset) = dtype.field("pos").unwrap();
        assert_eq!(offset, 4);
        assert_eq!(field.elem_count(), 3);
        let (_, offset) = dtype.field("q").unwrap();
        assert_eq!(offset, 16);
        assert!(dtype.field("missing").is_none());
    }

    #[test]
    fn roundtrip_scalars() {
        let dtype = Dtype::compound(vec![
            Field::scalar("a", Scalar::I16),
            Field::scalar("b", Scalar::F64),
            Field::vector("v", Scalar::I64, vec![2]),
        ]);
        let mut row = dtype.zero_row();
        assert!(dtype.put_i64(&mut row, "a", 0, -12));
        assert!(dtype.put_f64(&mut row, "b", 0, 2.5));
        assert!(dtype.put_i64(&mut row, "v", 1, 1 << 40));
        assert_eq!(dtype.get_i64(&row, "a", 0), Some(-12));
        assert_eq!(dtype.get_f64(&row, "b", 0), Some(2.5));
        assert_eq!(dtype.get_i64(&row, "v", 0), Some(0));
        assert_eq!(dtype.get_i64(&row, "v", 1), Some(1 << 40));
        // floats are not readable as integers
        assert_eq!(dtype.get_i64(&row, "b", 0), None);
    }

    #[test]
    fn pack_helpers() {
        let dtype = Dtype::scalar(Scalar::I64);
        let buf = dtype.pack_i64(&[10, 20, 30]);
        assert_eq!(buf.len(), 24);
        assert_eq!(dtype.get_i64(&buf[8..16], "value", 0), Some(20));
    }

    #[test]
    fn describe_forms() {
        assert_eq!(Dtype::scalar(Scalar::F32).describe(), "f32");
        assert_eq!(ref_region_dtype().describe(), "{start: i64, stop: i64}");
    }

    #[test]
    fn dtype_serde_roundtrip() {
        let dtype = ref_dtype();
        let json = serde_json::to_string(&dtype).unwrap();
        let back: Dtype = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dtype);
    }
}
