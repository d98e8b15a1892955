//! Element types of runtime variables
//!
//! Sizes and names follow the compute API's vector types, so `float4` takes 16
//! bytes and `double8` 64 bytes. Host access goes through `f64` scalars and
//! three-component `f64` vectors (see [`value`]).

pub mod value;

pub use value::HostValue;

use std::fmt;

/// Primitive component of a [`DataType`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    F32,
    F64,
    U32,
    I32,
    I8,
    U8,
}

impl ScalarKind {
    pub fn size(self) -> usize {
        match self {
            ScalarKind::F32 | ScalarKind::U32 | ScalarKind::I32 => 4,
            ScalarKind::F64 => 8,
            ScalarKind::I8 | ScalarKind::U8 => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, ScalarKind::F32 | ScalarKind::F64)
    }
}

/// Element type of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Float,
    Float2,
    Float4,
    Float8,
    Double,
    Double2,
    Double4,
    Double8,
    Uint,
    Uint2,
    Uint4,
    Int,
    Int2,
    Int4,
    Char,
    UChar,
}

impl DataType {
    pub const ALL: [DataType; 16] = [
        DataType::Float,
        DataType::Float2,
        DataType::Float4,
        DataType::Float8,
        DataType::Double,
        DataType::Double2,
        DataType::Double4,
        DataType::Double8,
        DataType::Uint,
        DataType::Uint2,
        DataType::Uint4,
        DataType::Int,
        DataType::Int2,
        DataType::Int4,
        DataType::Char,
        DataType::UChar,
    ];

    pub fn scalar_kind(self) -> ScalarKind {
        use DataType::*;
        match self {
            Float | Float2 | Float4 | Float8 => ScalarKind::F32,
            Double | Double2 | Double4 | Double8 => ScalarKind::F64,
            Uint | Uint2 | Uint4 => ScalarKind::U32,
            Int | Int2 | Int4 => ScalarKind::I32,
            Char => ScalarKind::I8,
            UChar => ScalarKind::U8,
        }
    }

    /// Number of components (1 for scalars)
    pub fn components(self) -> usize {
        use DataType::*;
        match self {
            Float | Double | Uint | Int | Char | UChar => 1,
            Float2 | Double2 | Uint2 | Int2 => 2,
            Float4 | Double4 | Uint4 | Int4 => 4,
            Float8 | Double8 => 8,
        }
    }

    /// Size of one element in bytes
    pub fn size(self) -> usize {
        self.scalar_kind().size() * self.components()
    }

    pub fn is_scalar(self) -> bool {
        self.components() == 1
    }

    /// Types accessible through the three-component host vector
    pub fn is_vector(self) -> bool {
        matches!(self.components(), 2 | 4)
    }

    /// Type name in kernel source
    pub fn cl_name(self) -> &'static str {
        use DataType::*;
        match self {
            Float => "float",
            Float2 => "float2",
            Float4 => "float4",
            Float8 => "float8",
            Double => "double",
            Double2 => "double2",
            Double4 => "double4",
            Double8 => "double8",
            Uint => "uint",
            Uint2 => "uint2",
            Uint4 => "uint4",
            Int => "int",
            Int2 => "int2",
            Int4 => "int4",
            Char => "char",
            UChar => "uchar",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cl_name())
    }
}
