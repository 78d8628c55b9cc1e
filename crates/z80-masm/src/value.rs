//! Expression values and their coercion rules.

use std::fmt;

/// A value produced by expression evaluation.
///
/// Single-character strings double as numbers (their code point); longer
/// strings only support concatenation and equality.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Numeric view as i64 (floats truncate toward zero).
    pub fn as_int(&self) -> Result<i64, String> {
        match self {
            Self::Int(value) => Ok(*value),
            Self::Float(value) => Ok(*value as i64),
            Self::Str(text) => char_code(text),
        }
    }

    /// Numeric view as f64.
    pub fn as_float(&self) -> Result<f64, String> {
        match self {
            Self::Int(value) => Ok(*value as f64),
            Self::Float(value) => Ok(*value),
            Self::Str(text) => char_code(text).map(|code| code as f64),
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Self::Str(_))
    }

    /// A value is number-like when it is numeric or a one-character string.
    pub fn is_number(&self) -> bool {
        match self {
            Self::Int(_) | Self::Float(_) => true,
            Self::Str(text) => text.chars().count() == 1,
        }
    }

    /// Truthiness for conditions and logical operators.
    pub fn truthy(&self) -> Result<bool, String> {
        Ok(self.as_int()? != 0)
    }

    fn is_float_like(&self) -> bool {
        matches!(self, Self::Float(_))
    }

    /// Addition doubles as string concatenation.
    pub fn add(&self, rhs: &Self) -> Result<Self, String> {
        if let (Self::Str(a), Self::Str(b)) = (self, rhs) {
            return Ok(Self::Str(format!("{a}{b}")));
        }
        numeric2(self, rhs, i64::wrapping_add, |a, b| a + b)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self, String> {
        numeric2(self, rhs, i64::wrapping_sub, |a, b| a - b)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self, String> {
        numeric2(self, rhs, i64::wrapping_mul, |a, b| a * b)
    }

    pub fn div(&self, rhs: &Self) -> Result<Self, String> {
        if self.is_float_like() || rhs.is_float_like() {
            let divisor = rhs.as_float()?;
            if divisor == 0.0 {
                return Err("division by zero".to_string());
            }
            return Ok(Self::Float(self.as_float()? / divisor));
        }
        let divisor = rhs.as_int()?;
        if divisor == 0 {
            return Err("division by zero".to_string());
        }
        Ok(Self::Int(self.as_int()?.wrapping_div(divisor)))
    }

    pub fn rem(&self, rhs: &Self) -> Result<Self, String> {
        let divisor = rhs.as_int()?;
        if divisor == 0 {
            return Err("modulo by zero".to_string());
        }
        Ok(Self::Int(self.as_int()?.wrapping_rem(divisor)))
    }

    /// Equality is the one comparison strings support.
    pub fn eq_value(&self, rhs: &Self) -> bool {
        match (self, rhs) {
            (Self::Str(a), Self::Str(b)) => a == b,
            _ => match (self.as_int(), rhs.as_int()) {
                (Ok(a), Ok(b)) => a == b,
                // A multi-character string never equals a number.
                _ => false,
            },
        }
    }

    /// Relational comparison; rejected for strings.
    pub fn compare(&self, rhs: &Self) -> Result<std::cmp::Ordering, String> {
        if (self.is_string() && !self.is_number()) || (rhs.is_string() && !rhs.is_number()) {
            return Err("relational comparison of strings".to_string());
        }
        let a = self.as_float()?;
        let b = rhs.as_float()?;
        a.partial_cmp(&b).ok_or_else(|| "unordered comparison".to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Str(text) => write!(f, "{text}"),
        }
    }
}

fn char_code(text: &str) -> Result<i64, String> {
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => Ok(ch as i64),
        _ => Err(format!("string \"{text}\" used as a number")),
    }
}

fn numeric2(
    lhs: &Value,
    rhs: &Value,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, String> {
    if matches!(lhs, Value::Float(_)) || matches!(rhs, Value::Float(_)) {
        Ok(Value::Float(float_op(lhs.as_float()?, rhs.as_float()?)))
    } else {
        Ok(Value::Int(int_op(lhs.as_int()?, rhs.as_int()?)))
    }
}
