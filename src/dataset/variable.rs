//! Typed variables: dimension names, an n-dimensional array and attributes.

use super::{AttrValue, Attributes, DatasetError};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element types supported end to end (DAP2 atomic types → Zarr v3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
    String,
}

impl DataType {
    /// The Zarr v3 data type name.
    pub fn zarr_name(&self) -> &'static str {
        match self {
            DataType::UInt8 => "uint8",
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::String => "string",
        }
    }

    /// Element size in bytes, `None` for variable-length strings.
    pub fn size(&self) -> Option<usize> {
        match self {
            DataType::UInt8 => Some(1),
            DataType::Int16 | DataType::UInt16 => Some(2),
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => Some(4),
            DataType::Float64 => Some(8),
            DataType::String => None,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.zarr_name())
    }
}

/// Array payload of a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableData {
    UInt8(ArrayD<u8>),
    Int16(ArrayD<i16>),
    UInt16(ArrayD<u16>),
    Int32(ArrayD<i32>),
    UInt32(ArrayD<u32>),
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
    String(ArrayD<String>),
}

/// Run `$body` with `$a` bound to the inner array of any variant.
macro_rules! with_array {
    ($data:expr, $a:ident => $body:expr) => {
        match $data {
            VariableData::UInt8($a) => $body,
            VariableData::Int16($a) => $body,
            VariableData::UInt16($a) => $body,
            VariableData::Int32($a) => $body,
            VariableData::UInt32($a) => $body,
            VariableData::Float32($a) => $body,
            VariableData::Float64($a) => $body,
            VariableData::String($a) => $body,
        }
    };
}
pub(crate) use with_array;

impl VariableData {
    pub fn data_type(&self) -> DataType {
        match self {
            VariableData::UInt8(_) => DataType::UInt8,
            VariableData::Int16(_) => DataType::Int16,
            VariableData::UInt16(_) => DataType::UInt16,
            VariableData::Int32(_) => DataType::Int32,
            VariableData::UInt32(_) => DataType::UInt32,
            VariableData::Float32(_) => DataType::Float32,
            VariableData::Float64(_) => DataType::Float64,
            VariableData::String(_) => DataType::String,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_array!(self, a => a.shape())
    }

    pub fn len(&self) -> usize {
        with_array!(self, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate in-memory payload size.
    pub fn nbytes(&self) -> usize {
        match self {
            VariableData::String(a) => a.iter().map(String::len).sum(),
            other => other.len() * other.data_type().size().unwrap_or(0),
        }
    }

    /// Reshape to `shape`, keeping logical element order.
    pub fn into_shape(self, shape: &[usize]) -> Result<Self, DatasetError> {
        let dim = IxDyn(shape);
        macro_rules! reshape {
            ($variant:ident, $a:expr) => {{
                let a = $a.as_standard_layout().into_owned();
                let got = a.len();
                a.into_shape_with_order(dim)
                    .map(VariableData::$variant)
                    .map_err(|_| DatasetError::ShapeMismatch {
                        expected: shape.to_vec(),
                        elements: got,
                    })
            }};
        }
        match self {
            VariableData::UInt8(a) => reshape!(UInt8, a),
            VariableData::Int16(a) => reshape!(Int16, a),
            VariableData::UInt16(a) => reshape!(UInt16, a),
            VariableData::Int32(a) => reshape!(Int32, a),
            VariableData::UInt32(a) => reshape!(UInt32, a),
            VariableData::Float32(a) => reshape!(Float32, a),
            VariableData::Float64(a) => reshape!(Float64, a),
            VariableData::String(a) => reshape!(String, a),
        }
    }

    /// Build from a flat vector and a shape.
    pub fn from_vec<T: IntoVariableData>(shape: &[usize], values: Vec<T>) -> Result<Self, DatasetError> {
        let elements = values.len();
        ArrayD::from_shape_vec(IxDyn(shape), values)
            .map(T::wrap)
            .map_err(|_| DatasetError::ShapeMismatch {
                expected: shape.to_vec(),
                elements,
            })
    }
}

/// Element types that can be wrapped into [`VariableData`].
pub trait IntoVariableData: Sized {
    fn wrap(array: ArrayD<Self>) -> VariableData;
}

macro_rules! impl_into_variable_data {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl IntoVariableData for $t {
                fn wrap(array: ArrayD<Self>) -> VariableData {
                    VariableData::$variant(array)
                }
            }

            impl From<ArrayD<$t>> for VariableData {
                fn from(array: ArrayD<$t>) -> Self {
                    VariableData::$variant(array)
                }
            }
        )*
    };
}

impl_into_variable_data!(
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    f32 => Float32,
    f64 => Float64,
    String => String,
);

/// A named-dimension array with attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub dims: Vec<String>,
    pub data: VariableData,
    pub attrs: Attributes,
}

impl Variable {
    /// Create a variable, checking that `dims` matches the array rank.
    pub fn new(dims: Vec<String>, data: VariableData) -> Result<Self, DatasetError> {
        if dims.len() != data.shape().len() {
            return Err(DatasetError::RankMismatch {
                dims: dims.len(),
                ndim: data.shape().len(),
            });
        }
        Ok(Self {
            dims,
            data,
            attrs: Attributes::new(),
        })
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    /// Length along a named dimension.
    pub fn size_of(&self, dim: &str) -> Option<usize> {
        self.dims
            .iter()
            .position(|d| d == dim)
            .map(|i| self.shape()[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array2};

    #[test]
    fn test_variable_rank_check() {
        let data = VariableData::from(Array2::<f32>::zeros((2, 3)).into_dyn());
        assert!(Variable::new(vec!["y".into(), "x".into()], data.clone()).is_ok());
        assert!(matches!(
            Variable::new(vec!["x".into()], data),
            Err(DatasetError::RankMismatch { dims: 1, ndim: 2 })
        ));
    }

    #[test]
    fn test_from_vec_and_reshape() {
        let data = VariableData::from_vec(&[2, 2], vec![1i16, 2, 3, 4]).unwrap();
        assert_eq!(data.data_type(), DataType::Int16);
        assert_eq!(data.shape(), &[2, 2]);
        assert_eq!(data.nbytes(), 8);

        let flat = data.into_shape(&[4]).unwrap();
        assert_eq!(flat, VariableData::Int16(arr1(&[1i16, 2, 3, 4]).into_dyn()));

        assert!(VariableData::from_vec(&[3], vec![1.0f64, 2.0]).is_err());
    }

    #[test]
    fn test_size_of() {
        let var = Variable::new(
            vec!["time".into(), "x".into()],
            VariableData::from(Array2::<f64>::zeros((4, 7)).into_dyn()),
        )
        .unwrap();
        assert_eq!(var.size_of("time"), Some(4));
        assert_eq!(var.size_of("x"), Some(7));
        assert_eq!(var.size_of("level"), None);
    }

    #[test]
    fn test_data_type_names() {
        assert_eq!(DataType::Float32.zarr_name(), "float32");
        assert_eq!(DataType::String.size(), None);
        assert!(DataType::Float64.is_float());
        assert!(!DataType::Int32.is_float());
    }
}
