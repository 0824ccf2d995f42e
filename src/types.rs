//! Core types for embedding files: vectors, word-vector pairs and element types.

use crate::error::{Error, Result};
use half::f16;
use std::fmt;
use std::str::FromStr;

/// A word vector. Elements are held as `f32` whatever the on-disk element type.
pub type Vector = Vec<f32>;

/// A (word, vector) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct WordVector {
    /// The word.
    pub word: String,
    /// The associated vector.
    pub vector: Vector,
}

impl WordVector {
    /// Create a new pair.
    pub fn new(word: impl Into<String>, vector: Vector) -> Self {
        Self {
            word: word.into(),
            vector,
        }
    }
}

impl From<(String, Vector)> for WordVector {
    fn from((word, vector): (String, Vector)) -> Self {
        Self { word, vector }
    }
}

impl From<(&str, Vector)> for WordVector {
    fn from((word, vector): (&str, Vector)) -> Self {
        Self::new(word, vector)
    }
}

impl fmt::Display for WordVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WordVector({:?}, ", self.word)?;
        write_summary(f, &self.vector, 4, 5)?;
        write!(f, ")")
    }
}

/// Writes `[v0, v1, ...]`, eliding the middle of vectors longer than `threshold`.
pub(crate) fn write_summary(
    f: &mut impl fmt::Write,
    values: &[f32],
    precision: usize,
    threshold: usize,
) -> fmt::Result {
    let shown: Vec<String> = if values.len() > threshold {
        let head = values[..3].iter();
        let tail = values[values.len() - 3..].iter();
        head.map(|v| format!("{:.*}", precision, v))
            .chain(std::iter::once("...".to_string()))
            .chain(tail.map(|v| format!("{:.*}", precision, v)))
            .collect()
    } else {
        values.iter().map(|v| format!("{:.*}", precision, v)).collect()
    };
    write!(f, "[{}]", shown.join(", "))
}

/// Byte order of multi-byte elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the host.
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

/// Element kinds supported in raw vector data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    F16,
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
}

impl ElementKind {
    /// Size of one element in bytes.
    pub fn itemsize(self) -> usize {
        match self {
            ElementKind::I8 | ElementKind::U8 => 1,
            ElementKind::F16 | ElementKind::I16 => 2,
            ElementKind::F32 | ElementKind::I32 => 4,
            ElementKind::F64 | ElementKind::I64 => 8,
        }
    }

    fn code(self) -> char {
        match self {
            ElementKind::F16 | ElementKind::F32 | ElementKind::F64 => 'f',
            ElementKind::I8 | ElementKind::I16 | ElementKind::I32 | ElementKind::I64 => 'i',
            ElementKind::U8 => 'u',
        }
    }

    fn from_code(code: char, size: usize) -> Option<Self> {
        match (code, size) {
            ('f', 2) => Some(ElementKind::F16),
            ('f', 4) => Some(ElementKind::F32),
            ('f', 8) => Some(ElementKind::F64),
            ('i', 1) => Some(ElementKind::I8),
            ('i', 2) => Some(ElementKind::I16),
            ('i', 4) => Some(ElementKind::I32),
            ('i', 8) => Some(ElementKind::I64),
            ('u', 1) => Some(ElementKind::U8),
            _ => None,
        }
    }
}

/// Data type of vector elements: kind plus byte order.
///
/// Parsed from numpy-style descriptors (`"<f4"`, `">f8"`, `"|i1"`, `"float32"`)
/// and rendered as numpy's `dtype.str` (`"<f4"`), which is what VVM metadata stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DType {
    pub kind: ElementKind,
    pub order: ByteOrder,
}

impl DType {
    /// Little-endian single precision float, the default for every format.
    pub const F32: DType = DType::little(ElementKind::F32);
    /// Little-endian double precision float.
    pub const F64: DType = DType::little(ElementKind::F64);
    /// Little-endian half precision float.
    pub const F16: DType = DType::little(ElementKind::F16);

    /// A little-endian dtype of the given kind.
    pub const fn little(kind: ElementKind) -> Self {
        Self {
            kind,
            order: ByteOrder::Little,
        }
    }

    /// A big-endian dtype of the given kind.
    pub const fn big(kind: ElementKind) -> Self {
        Self {
            kind,
            order: ByteOrder::Big,
        }
    }

    /// Size of one element in bytes.
    pub fn itemsize(&self) -> usize {
        self.kind.itemsize()
    }

    /// Number of bytes taken by a vector of `len` elements.
    pub fn vector_bytes(&self, len: usize) -> usize {
        self.itemsize() * len
    }

    /// Round a value to the precision of this type (integers truncate toward zero).
    pub fn quantize(&self, value: f32) -> f32 {
        match self.kind {
            ElementKind::F16 => f16::from_f32(value).to_f32(),
            ElementKind::F32 | ElementKind::F64 => value,
            ElementKind::I8 => value as i8 as f32,
            ElementKind::I16 => value as i16 as f32,
            ElementKind::I32 => value as i32 as f32,
            ElementKind::I64 => value as i64 as f32,
            ElementKind::U8 => value as u8 as f32,
        }
    }

    /// Round every element of a vector in place.
    pub fn quantize_all(&self, vector: &mut [f32]) {
        if matches!(self.kind, ElementKind::F32 | ElementKind::F64) {
            return;
        }
        for value in vector.iter_mut() {
            *value = self.quantize(*value);
        }
    }

    /// Decode raw bytes into a vector. `bytes.len()` must be a multiple of the itemsize.
    pub fn decode(&self, bytes: &[u8]) -> Vector {
        let little = self.order == ByteOrder::Little;
        let chunks = bytes.chunks_exact(self.itemsize());
        match self.kind {
            ElementKind::F16 => chunks
                .map(|c| {
                    let b = [c[0], c[1]];
                    (if little { f16::from_le_bytes(b) } else { f16::from_be_bytes(b) }).to_f32()
                })
                .collect(),
            ElementKind::F32 => chunks
                .map(|c| {
                    let b = [c[0], c[1], c[2], c[3]];
                    if little { f32::from_le_bytes(b) } else { f32::from_be_bytes(b) }
                })
                .collect(),
            ElementKind::F64 => chunks
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    (if little { f64::from_le_bytes(b) } else { f64::from_be_bytes(b) }) as f32
                })
                .collect(),
            ElementKind::I8 => chunks.map(|c| c[0] as i8 as f32).collect(),
            ElementKind::U8 => chunks.map(|c| c[0] as f32).collect(),
            ElementKind::I16 => chunks
                .map(|c| {
                    let b = [c[0], c[1]];
                    (if little { i16::from_le_bytes(b) } else { i16::from_be_bytes(b) }) as f32
                })
                .collect(),
            ElementKind::I32 => chunks
                .map(|c| {
                    let b = [c[0], c[1], c[2], c[3]];
                    (if little { i32::from_le_bytes(b) } else { i32::from_be_bytes(b) }) as f32
                })
                .collect(),
            ElementKind::I64 => chunks
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    (if little { i64::from_le_bytes(b) } else { i64::from_be_bytes(b) }) as f32
                })
                .collect(),
        }
    }

    /// Append the raw encoding of `values` to `out`.
    pub fn encode_into(&self, values: &[f32], out: &mut Vec<u8>) {
        out.reserve(self.vector_bytes(values.len()));
        let little = self.order == ByteOrder::Little;
        macro_rules! push {
            ($v:expr) => {
                if little {
                    out.extend_from_slice(&$v.to_le_bytes())
                } else {
                    out.extend_from_slice(&$v.to_be_bytes())
                }
            };
        }
        for &value in values {
            match self.kind {
                ElementKind::F16 => push!(f16::from_f32(value)),
                ElementKind::F32 => push!(value),
                ElementKind::F64 => push!(value as f64),
                ElementKind::I8 => out.push(value as i8 as u8),
                ElementKind::U8 => out.push(value as u8),
                ElementKind::I16 => push!(value as i16),
                ElementKind::I32 => push!(value as i32),
                ElementKind::I64 => push!(value as i64),
            }
        }
    }
}

impl Default for DType {
    fn default() -> Self {
        DType::F32
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let order = if self.itemsize() == 1 {
            '|'
        } else if self.order == ByteOrder::Little {
            '<'
        } else {
            '>'
        };
        write!(f, "{}{}{}", order, self.kind.code(), self.itemsize())
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let named = match s {
            "float16" | "half" => Some(ElementKind::F16),
            "float32" | "single" => Some(ElementKind::F32),
            "float64" | "double" | "float" => Some(ElementKind::F64),
            "int8" => Some(ElementKind::I8),
            "int16" => Some(ElementKind::I16),
            "int32" => Some(ElementKind::I32),
            "int64" => Some(ElementKind::I64),
            "uint8" => Some(ElementKind::U8),
            _ => None,
        };
        if let Some(kind) = named {
            return Ok(DType::little(kind));
        }

        let invalid = || Error::Argument(format!("unsupported dtype: {:?}", s));
        let mut chars = s.chars();
        let (order, rest) = match chars.next() {
            Some('<') | Some('|') => (ByteOrder::Little, chars.as_str()),
            Some('>') => (ByteOrder::Big, chars.as_str()),
            Some('=') => (ByteOrder::native(), chars.as_str()),
            Some(_) => (ByteOrder::native(), s),
            None => return Err(invalid()),
        };
        let mut rest_chars = rest.chars();
        let code = rest_chars.next().ok_or_else(invalid)?;
        let size: usize = rest_chars.as_str().parse().map_err(|_| invalid())?;
        let kind = ElementKind::from_code(code, size).ok_or_else(invalid)?;
        Ok(DType { kind, order })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_parse_and_display() {
        assert_eq!("<f4".parse::<DType>().unwrap(), DType::F32);
        assert_eq!("float64".parse::<DType>().unwrap(), DType::F64);
        assert_eq!(
            ">f2".parse::<DType>().unwrap(),
            DType::big(ElementKind::F16)
        );
        assert_eq!(DType::F32.to_string(), "<f4");
        assert_eq!(DType::big(ElementKind::F64).to_string(), ">f8");
        assert_eq!(DType::little(ElementKind::I8).to_string(), "|i1");
        assert_eq!("|i1".parse::<DType>().unwrap().kind, ElementKind::I8);
        assert!("<c16".parse::<DType>().is_err());
        assert!("".parse::<DType>().is_err());
    }

    #[test]
    fn test_dtype_encode_decode() {
        let values = vec![1.5f32, -2.25, 0.0, 1024.0];
        for dtype in ["<f2", ">f2", "<f4", ">f4", "<f8", ">f8", "<i4", ">i2"] {
            let dtype: DType = dtype.parse().unwrap();
            let mut bytes = Vec::new();
            dtype.encode_into(&values, &mut bytes);
            assert_eq!(bytes.len(), dtype.vector_bytes(values.len()));
            let decoded = dtype.decode(&bytes);
            let mut expected = values.clone();
            dtype.quantize_all(&mut expected);
            assert_eq!(decoded, expected, "dtype {}", dtype);
        }
    }

    #[test]
    fn test_quantize() {
        assert_eq!(DType::little(ElementKind::I8).quantize(-3.7), -3.0);
        assert_eq!(DType::F32.quantize(0.1), 0.1);
        assert_ne!(DType::F16.quantize(0.1), 0.1);
    }

    #[test]
    fn test_word_vector_display() {
        let wv = WordVector::new("hello", vec![1.0, 2.0]);
        assert_eq!(wv.to_string(), "WordVector(\"hello\", [1.0000, 2.0000])");

        let long = WordVector::new("x", (0..8).map(|i| i as f32).collect());
        let shown = long.to_string();
        assert!(shown.contains("2.0000, ..., 5.0000"));
    }
}
