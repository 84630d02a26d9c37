//! Conversion of values between scalar kinds.
//!
//! Used when a value written by a client does not have exactly the type of the
//! field it targets, e.g. writing the integer `4` into a `double` field, or the
//! string `"2.5"` from a command line.

use num::{NumCast, ToPrimitive};
use thiserror::Error;

use super::{ScalarArray, ScalarType, TypeDescriptor, Value};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Cannot convert {from} to {to}")]
pub struct ConversionError {
    pub from: String,
    pub to: String,
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => format!("string '{s}'"),
        v => v
            .infer_type()
            .map(|t| t.short_name())
            .unwrap_or_else(|| "union".to_owned()),
    }
}

fn cast<N: ToPrimitive + Copy + ToString>(
    value: N,
    target: ScalarType,
) -> Option<Value> {
    Some(match target {
        ScalarType::Boolean => Value::Bool(value.to_f64()? != 0.0),
        ScalarType::Byte => Value::Byte(NumCast::from(value)?),
        ScalarType::Short => Value::Short(NumCast::from(value)?),
        ScalarType::Int => Value::Int(NumCast::from(value)?),
        ScalarType::Long => Value::Long(NumCast::from(value)?),
        ScalarType::UByte => Value::UByte(NumCast::from(value)?),
        ScalarType::UShort => Value::UShort(NumCast::from(value)?),
        ScalarType::UInt => Value::UInt(NumCast::from(value)?),
        ScalarType::ULong => Value::ULong(NumCast::from(value)?),
        ScalarType::Float => Value::Float(NumCast::from(value)?),
        ScalarType::Double => Value::Double(NumCast::from(value)?),
        ScalarType::String => Value::String(value.to_string()),
    })
}

fn parse(text: &str, target: ScalarType) -> Option<Value> {
    let text = text.trim();
    Some(match target {
        ScalarType::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => return None,
        },
        ScalarType::Byte => Value::Byte(text.parse().ok()?),
        ScalarType::Short => Value::Short(text.parse().ok()?),
        ScalarType::Int => Value::Int(text.parse().ok()?),
        ScalarType::Long => Value::Long(text.parse().ok()?),
        ScalarType::UByte => Value::UByte(text.parse().ok()?),
        ScalarType::UShort => Value::UShort(text.parse().ok()?),
        ScalarType::UInt => Value::UInt(text.parse().ok()?),
        ScalarType::ULong => Value::ULong(text.parse().ok()?),
        ScalarType::Float => Value::Float(text.parse().ok()?),
        ScalarType::Double => Value::Double(text.parse().ok()?),
        ScalarType::String => Value::String(text.to_owned()),
    })
}

fn convert_scalar(value: &Value, target: ScalarType) -> Option<Value> {
    if value.scalar_type() == Some(target) {
        return Some(value.clone());
    }
    match value {
        Value::Bool(v) => match target {
            ScalarType::String => Some(Value::String(v.to_string())),
            _ => cast(*v as u8, target),
        },
        Value::Byte(v) => cast(*v, target),
        Value::Short(v) => cast(*v, target),
        Value::Int(v) => cast(*v, target),
        Value::Long(v) => cast(*v, target),
        Value::UByte(v) => cast(*v, target),
        Value::UShort(v) => cast(*v, target),
        Value::UInt(v) => cast(*v, target),
        Value::ULong(v) => cast(*v, target),
        Value::Float(v) => cast(*v, target),
        Value::Double(v) => cast(*v, target),
        Value::String(s) => parse(s, target),
        _ => None,
    }
}

impl Value {
    /// Convert this value so that it matches `desc`.
    ///
    /// Scalars convert between numeric kinds (failing if out of range) and to
    /// and from strings. A scalar becomes a one element array, and a one
    /// element array becomes a scalar. Structures must already match.
    pub fn convert_to(&self, desc: &TypeDescriptor) -> Result<Value, ConversionError> {
        let error = || ConversionError {
            from: describe(self),
            to: desc.short_name(),
        };
        match desc {
            TypeDescriptor::Scalar(target) => match self {
                Value::Array(array) if array.len() == 1 => array.to_values()[0].convert_to(desc),
                v => convert_scalar(v, *target).ok_or_else(error),
            },
            TypeDescriptor::BoundedString(bound) => {
                match convert_scalar(self, ScalarType::String) {
                    Some(Value::String(s)) if s.len() <= *bound as usize => Ok(Value::String(s)),
                    _ => Err(error()),
                }
            }
            TypeDescriptor::ScalarArray(target) => {
                let items = match self {
                    Value::Array(array) => array.to_values(),
                    v if v.scalar_type().is_some() => vec![v.clone()],
                    _ => return Err(error()),
                };
                let converted = items
                    .iter()
                    .map(|v| convert_scalar(v, *target))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(error)?;
                ScalarArray::from_values(*target, converted)
                    .map(Value::Array)
                    .ok_or_else(error)
            }
            _ => desc.check(self).map(|_| self.clone()).map_err(|_| error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_conversion() {
        let double = TypeDescriptor::Scalar(ScalarType::Double);
        assert_eq!(Value::Int(4).convert_to(&double), Ok(Value::Double(4.0)));
        assert_eq!(
            Value::Double(3.9).convert_to(&TypeDescriptor::Scalar(ScalarType::Int)),
            Ok(Value::Int(3))
        );
        assert!(
            Value::Int(300)
                .convert_to(&TypeDescriptor::Scalar(ScalarType::Byte))
                .is_err()
        );
        assert!(
            Value::Int(-1)
                .convert_to(&TypeDescriptor::Scalar(ScalarType::UInt))
                .is_err()
        );
    }

    #[test]
    fn test_string_conversion() {
        let double = TypeDescriptor::Scalar(ScalarType::Double);
        assert_eq!(Value::from(" 2.5").convert_to(&double), Ok(Value::Double(2.5)));
        assert!(Value::from("nope").convert_to(&double).is_err());
        assert_eq!(
            Value::Double(2.5).convert_to(&TypeDescriptor::Scalar(ScalarType::String)),
            Ok(Value::from("2.5"))
        );
        assert_eq!(
            Value::from("true").convert_to(&TypeDescriptor::Scalar(ScalarType::Boolean)),
            Ok(Value::Bool(true))
        );
        assert!(
            Value::from("too long")
                .convert_to(&TypeDescriptor::BoundedString(3))
                .is_err()
        );
    }

    #[test]
    fn test_array_conversion() {
        let doubles = TypeDescriptor::ScalarArray(ScalarType::Double);
        assert_eq!(
            Value::from(vec![1i32, 2]).convert_to(&doubles),
            Ok(Value::from(vec![1.0f64, 2.0]))
        );
        assert_eq!(Value::Int(7).convert_to(&doubles), Ok(Value::from(vec![7.0f64])));
        assert_eq!(
            Value::from(vec![7i16]).convert_to(&TypeDescriptor::Scalar(ScalarType::Long)),
            Ok(Value::Long(7))
        );
    }
}
