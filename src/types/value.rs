//! Host-side encoding of element values
//!
//! Elements are stored as the raw bytes the device sees. Reads and writes go
//! through `f64` and are converted with `as` casts, so out-of-range values
//! saturate the way Rust float-to-int casts do.

use super::{DataType, ScalarKind};
use bytemuck::Pod;
use std::fmt::{Display, LowerExp};

/// Value handed to `init_variable`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostValue {
    Scalar(f64),
    Vector([f64; 3]),
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Scalar(value)
    }
}

impl From<[f64; 3]> for HostValue {
    fn from(value: [f64; 3]) -> Self {
        HostValue::Vector(value)
    }
}

fn put<T: Pod>(dst: &mut [u8], value: T) {
    dst[..size_of::<T>()].copy_from_slice(bytemuck::bytes_of(&value));
}

fn get<T: Pod>(src: &[u8]) -> T {
    bytemuck::pod_read_unaligned(&src[..size_of::<T>()])
}

impl ScalarKind {
    fn encode(self, value: f64, dst: &mut [u8]) {
        match self {
            ScalarKind::F32 => put(dst, value as f32),
            ScalarKind::F64 => put(dst, value),
            ScalarKind::U32 => put(dst, value as u32),
            ScalarKind::I32 => put(dst, value as i32),
            ScalarKind::I8 => put(dst, value as i8),
            ScalarKind::U8 => put(dst, value as u8),
        }
    }

    fn decode(self, src: &[u8]) -> f64 {
        match self {
            ScalarKind::F32 => get::<f32>(src) as f64,
            ScalarKind::F64 => get::<f64>(src),
            ScalarKind::U32 => get::<u32>(src) as f64,
            ScalarKind::I32 => get::<i32>(src) as f64,
            ScalarKind::I8 => get::<i8>(src) as f64,
            ScalarKind::U8 => get::<u8>(src) as f64,
        }
    }

    fn literal(self, src: &[u8]) -> String {
        match self {
            ScalarKind::F32 => {
                let v = get::<f32>(src);
                float_literal(v, v as f64)
            }
            ScalarKind::F64 => {
                let v = get::<f64>(src);
                float_literal(v, v)
            }
            ScalarKind::U32 => format!("{}u", get::<u32>(src)),
            ScalarKind::I32 => get::<i32>(src).to_string(),
            ScalarKind::I8 => get::<i8>(src).to_string(),
            ScalarKind::U8 => get::<u8>(src).to_string(),
        }
    }
}

/// Plain decimal where it stays short, exponent notation otherwise
fn float_literal<T: Display + LowerExp>(value: T, magnitude: f64) -> String {
    let abs = magnitude.abs();
    if abs >= 1e16 || (abs != 0.0 && abs < 1e-5) {
        format!("{value:e}")
    } else {
        value.to_string()
    }
}

impl DataType {
    /// Write a scalar into one element; `None` for non-scalar types
    pub fn encode_scalar(self, value: f64, dst: &mut [u8]) -> Option<()> {
        if !self.is_scalar() {
            return None;
        }
        self.scalar_kind().encode(value, dst);
        Some(())
    }

    pub fn decode_scalar(self, src: &[u8]) -> Option<f64> {
        self.is_scalar().then(|| self.scalar_kind().decode(src))
    }

    /// Write x, y (and z plus a zero fourth component for 4-wide types)
    pub fn encode_vector(self, value: [f64; 3], dst: &mut [u8]) -> Option<()> {
        if !self.is_vector() {
            return None;
        }
        let kind = self.scalar_kind();
        let step = kind.size();
        let components = [value[0], value[1], value[2], 0.0];
        for (i, v) in components.iter().take(self.components()).enumerate() {
            kind.encode(*v, &mut dst[i * step..]);
        }
        Some(())
    }

    /// Read x, y and z (z is 0 for 2-wide types)
    pub fn decode_vector(self, src: &[u8]) -> Option<[f64; 3]> {
        if !self.is_vector() {
            return None;
        }
        let kind = self.scalar_kind();
        let step = kind.size();
        let mut out = [0.0; 3];
        for (i, slot) in out.iter_mut().take(self.components()).enumerate() {
            *slot = kind.decode(&src[i * step..]);
        }
        Some(out)
    }

    /// Render one element as a kernel-source literal
    pub fn literal(self, src: &[u8]) -> String {
        let kind = self.scalar_kind();
        if self.is_scalar() {
            return match self {
                DataType::Char | DataType::UChar => {
                    format!("({})({})", self.cl_name(), kind.literal(src))
                }
                _ => kind.literal(src),
            };
        }
        let step = kind.size();
        let parts: Vec<String> = (0..self.components())
            .map(|i| kind.literal(&src[i * step..]))
            .collect();
        format!("({})({})", self.cl_name(), parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(ty: DataType) -> Vec<u8> {
        vec![0; ty.size()]
    }

    #[test]
    fn test_scalar_round_trip() {
        let mut buf = element(DataType::Double);
        DataType::Double.encode_scalar(0.125, &mut buf).unwrap();
        assert_eq!(DataType::Double.decode_scalar(&buf), Some(0.125));

        let mut buf = element(DataType::Char);
        DataType::Char.encode_scalar(-7.0, &mut buf).unwrap();
        assert_eq!(DataType::Char.decode_scalar(&buf), Some(-7.0));
    }

    #[test]
    fn test_scalar_access_rejects_vectors() {
        let mut buf = element(DataType::Float2);
        assert_eq!(DataType::Float2.encode_scalar(1.0, &mut buf), None);
        assert_eq!(DataType::Float2.decode_scalar(&buf), None);
    }

    #[test]
    fn test_vector_fourth_component_zeroed() {
        let mut buf = vec![0xFF; 16];
        DataType::Int4
            .encode_vector([1.0, -2.0, 3.0], &mut buf)
            .unwrap();
        let ints: Vec<i32> = buf.chunks_exact(4).map(bytemuck::pod_read_unaligned).collect();
        assert_eq!(ints, vec![1, -2, 3, 0]);
        assert_eq!(DataType::Int4.decode_vector(&buf), Some([1.0, -2.0, 3.0]));
    }

    #[test]
    fn test_two_wide_vector_leaves_z() {
        let mut buf = element(DataType::Double2);
        DataType::Double2
            .encode_vector([0.5, 1.5, 9.0], &mut buf)
            .unwrap();
        assert_eq!(DataType::Double2.decode_vector(&buf), Some([0.5, 1.5, 0.0]));
    }

    #[test]
    fn test_literals() {
        let mut buf = element(DataType::Float);
        DataType::Float.encode_scalar(0.5, &mut buf).unwrap();
        assert_eq!(DataType::Float.literal(&buf), "0.5");

        let mut buf = element(DataType::Uint);
        DataType::Uint.encode_scalar(42.0, &mut buf).unwrap();
        assert_eq!(DataType::Uint.literal(&buf), "42u");

        let mut buf = element(DataType::Double);
        DataType::Double.encode_scalar(1e-9, &mut buf).unwrap();
        assert_eq!(DataType::Double.literal(&buf), "1e-9");

        let mut buf = element(DataType::Float4);
        DataType::Float4
            .encode_vector([1.0, 2.5, -3.0], &mut buf)
            .unwrap();
        assert_eq!(DataType::Float4.literal(&buf), "(float4)(1, 2.5, -3, 0)");

        let mut buf = element(DataType::UChar);
        DataType::UChar.encode_scalar(200.0, &mut buf).unwrap();
        assert_eq!(DataType::UChar.literal(&buf), "(uchar)(200)");
    }
}
