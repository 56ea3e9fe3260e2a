use std::str::FromStr;

use num_enum::TryFromPrimitive;
use rmpv::Value;

use crate::errors::Error;

/// NT data type codes as they appear in binary value frames.
///
/// Codes 6-10 are implementation surface forms; `api_type` collapses them
/// to their wire representation before anything is emitted.
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash, TryFromPrimitive)]
pub enum DataType {
    Bool = 0,
    Float64 = 1,
    Int = 2,
    Float32 = 3,
    Str = 4,
    Bin = 5,
    UInt = 6,
    Json = 7,
    Raw = 8,
    Msgpack = 9,
    Protobuf = 10,
    BoolArray = 16,
    Float64Array = 17,
    IntArray = 18,
    Float32Array = 19,
    StrArray = 20,
}

impl DataType {
    /// The wire-visible type: `UInt` collapses to `Int`, `Json` to `Str`,
    /// `Raw`/`Msgpack`/`Protobuf` to `Bin`.
    pub fn api_type(self) -> DataType {
        match self {
            DataType::UInt => DataType::Int,
            DataType::Json => DataType::Str,
            DataType::Raw | DataType::Msgpack | DataType::Protobuf => DataType::Bin,
            other => other,
        }
    }

    /// The type spelling used in JSON announce messages.
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Bool => "boolean",
            DataType::Float64 => "double",
            DataType::Int | DataType::UInt => "int",
            DataType::Float32 => "float",
            DataType::Str => "string",
            DataType::Json => "json",
            DataType::Bin | DataType::Raw => "raw",
            DataType::Msgpack => "msgpack",
            DataType::Protobuf => "protobuf",
            DataType::BoolArray => "boolean[]",
            DataType::Float64Array => "double[]",
            DataType::IntArray => "int[]",
            DataType::Float32Array => "float[]",
            DataType::StrArray => "string[]",
        }
    }
}

impl FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boolean" => Ok(DataType::Bool),
            "double" => Ok(DataType::Float64),
            "int" => Ok(DataType::Int),
            "float" => Ok(DataType::Float32),
            "string" => Ok(DataType::Str),
            "json" => Ok(DataType::Json),
            "raw" => Ok(DataType::Raw),
            "msgpack" => Ok(DataType::Msgpack),
            "protobuf" => Ok(DataType::Protobuf),
            "boolean[]" => Ok(DataType::BoolArray),
            "double[]" => Ok(DataType::Float64Array),
            "int[]" => Ok(DataType::IntArray),
            "float[]" => Ok(DataType::Float32Array),
            "string[]" => Ok(DataType::StrArray),
            other => Err(Error::UnknownType(other.to_owned())),
        }
    }
}

/// A typed topic value.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Bool(bool),
    F64(f64),
    Int(i64),
    F32(f32),
    Str(String),
    Bin(Vec<u8>),
    UInt(u64),
    Json(String),
    Raw(Vec<u8>),
    Msgpack(Vec<u8>),
    Protobuf(Vec<u8>),
    BoolArray(Vec<bool>),
    F64Array(Vec<f64>),
    IntArray(Vec<i64>),
    F32Array(Vec<f32>),
    StrArray(Vec<String>),
}

impl DataValue {
    pub fn data_type(&self) -> DataType {
        match self {
            DataValue::Bool(_) => DataType::Bool,
            DataValue::F64(_) => DataType::Float64,
            DataValue::Int(_) => DataType::Int,
            DataValue::F32(_) => DataType::Float32,
            DataValue::Str(_) => DataType::Str,
            DataValue::Bin(_) => DataType::Bin,
            DataValue::UInt(_) => DataType::UInt,
            DataValue::Json(_) => DataType::Json,
            DataValue::Raw(_) => DataType::Raw,
            DataValue::Msgpack(_) => DataType::Msgpack,
            DataValue::Protobuf(_) => DataType::Protobuf,
            DataValue::BoolArray(_) => DataType::BoolArray,
            DataValue::F64Array(_) => DataType::Float64Array,
            DataValue::IntArray(_) => DataType::IntArray,
            DataValue::F32Array(_) => DataType::Float32Array,
            DataValue::StrArray(_) => DataType::StrArray,
        }
    }

    /// The wire-visible type of this value.
    pub fn api_type(&self) -> DataType {
        self.data_type().api_type()
    }

    /// The zero/empty value a freshly published topic of `data_type` holds.
    pub fn default_of(data_type: DataType) -> DataValue {
        match data_type {
            DataType::Bool => DataValue::Bool(false),
            DataType::Float64 => DataValue::F64(0.0),
            DataType::Int => DataValue::Int(0),
            DataType::Float32 => DataValue::F32(0.0),
            DataType::Str => DataValue::Str(String::new()),
            DataType::Bin => DataValue::Bin(Vec::new()),
            DataType::UInt => DataValue::UInt(0),
            DataType::Json => DataValue::Json(String::new()),
            DataType::Raw => DataValue::Raw(Vec::new()),
            DataType::Msgpack => DataValue::Msgpack(Vec::new()),
            DataType::Protobuf => DataValue::Protobuf(Vec::new()),
            DataType::BoolArray => DataValue::BoolArray(Vec::new()),
            DataType::Float64Array => DataValue::F64Array(Vec::new()),
            DataType::IntArray => DataValue::IntArray(Vec::new()),
            DataType::Float32Array => DataValue::F32Array(Vec::new()),
            DataType::StrArray => DataValue::StrArray(Vec::new()),
        }
    }

    /// Packs the value payload, excluding the type tag.
    pub fn to_msgpack(&self) -> Value {
        match self {
            DataValue::Bool(b) => Value::from(*b),
            DataValue::F64(f) => Value::from(*f),
            DataValue::Int(i) => Value::from(*i),
            DataValue::F32(f) => Value::F32(*f),
            DataValue::Str(s) | DataValue::Json(s) => Value::from(s.as_str()),
            DataValue::Bin(b)
            | DataValue::Raw(b)
            | DataValue::Msgpack(b)
            | DataValue::Protobuf(b) => Value::Binary(b.clone()),
            DataValue::UInt(u) => Value::from(*u),
            DataValue::BoolArray(xs) => {
                Value::Array(xs.iter().map(|x| Value::from(*x)).collect())
            }
            DataValue::F64Array(xs) => Value::Array(xs.iter().map(|x| Value::from(*x)).collect()),
            DataValue::IntArray(xs) => Value::Array(xs.iter().map(|x| Value::from(*x)).collect()),
            DataValue::F32Array(xs) => Value::Array(xs.iter().map(|x| Value::F32(*x)).collect()),
            DataValue::StrArray(xs) => {
                Value::Array(xs.iter().map(|x| Value::from(x.as_str())).collect())
            }
        }
    }

    /// Interprets a decoded MessagePack value as the declared type.
    ///
    /// An `Int` declaration whose payload only fits an unsigned encoding is
    /// tagged `UInt` internally; `api_type` still reports `Int`.
    pub fn from_msgpack(declared: DataType, value: Value) -> Result<DataValue, Error> {
        match declared {
            DataType::Bool => value
                .as_bool()
                .map(DataValue::Bool)
                .ok_or(Error::MalformedValue),
            DataType::Float64 => value
                .as_f64()
                .map(DataValue::F64)
                .ok_or(Error::MalformedValue),
            DataType::Int => match value {
                Value::Integer(n) => n
                    .as_i64()
                    .map(DataValue::Int)
                    .or_else(|| n.as_u64().map(DataValue::UInt))
                    .ok_or(Error::MalformedValue),
                _ => Err(Error::MalformedValue),
            },
            DataType::UInt => value
                .as_u64()
                .map(DataValue::UInt)
                .ok_or(Error::MalformedValue),
            DataType::Float32 => value
                .as_f64()
                .map(|f| DataValue::F32(f as f32))
                .ok_or(Error::MalformedValue),
            DataType::Str => into_string(value).map(DataValue::Str),
            DataType::Json => into_string(value).map(DataValue::Json),
            DataType::Bin => into_binary(value).map(DataValue::Bin),
            DataType::Raw => into_binary(value).map(DataValue::Raw),
            DataType::Msgpack => into_binary(value).map(DataValue::Msgpack),
            DataType::Protobuf => into_binary(value).map(DataValue::Protobuf),
            DataType::BoolArray => {
                into_array(value, |v| v.as_bool()).map(DataValue::BoolArray)
            }
            DataType::Float64Array => {
                into_array(value, |v| v.as_f64()).map(DataValue::F64Array)
            }
            DataType::IntArray => into_array(value, |v| v.as_i64()).map(DataValue::IntArray),
            DataType::Float32Array => {
                into_array(value, |v| v.as_f64().map(|f| f as f32)).map(DataValue::F32Array)
            }
            DataType::StrArray => match value {
                Value::Array(items) => items
                    .into_iter()
                    .map(into_string)
                    .collect::<Result<Vec<_>, _>>()
                    .map(DataValue::StrArray),
                _ => Err(Error::MalformedValue),
            },
        }
    }
}

fn into_string(value: Value) -> Result<String, Error> {
    match value {
        Value::String(s) => s.into_str().ok_or(Error::MalformedValue),
        _ => Err(Error::MalformedValue),
    }
}

fn into_binary(value: Value) -> Result<Vec<u8>, Error> {
    match value {
        Value::Binary(b) => Ok(b),
        // Some encoders pack opaque bytes as str
        Value::String(s) => Ok(s.into_bytes()),
        _ => Err(Error::MalformedValue),
    }
}

fn into_array<T, F>(value: Value, f: F) -> Result<Vec<T>, Error>
where
    F: Fn(&Value) -> Option<T>,
{
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| f(v).ok_or(Error::MalformedValue))
            .collect(),
        _ => Err(Error::MalformedValue),
    }
}
