//! Marshaling helpers between host values and the embedded runtime's
//! representation, driven by JNI-style type signatures.
//!
//! `(ILjava/lang/String;)V` describes a method taking an `int` and a string
//! and returning nothing. [`to_foreign`] coerces a host [`Value`] into the
//! representation a signature requires; [`from_foreign`] is the inverse used
//! for results and proxy arguments.

use super::error::{BridgeError, Result};
use super::value::Value;
use std::fmt;

/// A parsed field or return type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signature {
    Void,
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    /// Slash-separated class name
    Object(String),
    Array(Box<Signature>),
}

impl Signature {
    pub fn is_primitive(&self) -> bool {
        !matches!(self, Signature::Object(_) | Signature::Array(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Signature::Object(class) if class == "java/lang/String")
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signature::Void => f.write_str("V"),
            Signature::Boolean => f.write_str("Z"),
            Signature::Byte => f.write_str("B"),
            Signature::Char => f.write_str("C"),
            Signature::Short => f.write_str("S"),
            Signature::Int => f.write_str("I"),
            Signature::Long => f.write_str("J"),
            Signature::Float => f.write_str("F"),
            Signature::Double => f.write_str("D"),
            Signature::Object(class) => write!(f, "L{};", class),
            Signature::Array(inner) => write!(f, "[{}", inner),
        }
    }
}

/// Parameter and return types of a method signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodSignature {
    pub params: Vec<Signature>,
    pub ret: Signature,
}

fn invalid(sig: &str) -> BridgeError {
    BridgeError::Misuse(format!("malformed type signature '{}'", sig))
}

fn parse_one(sig: &str, chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<Signature> {
    let c = chars.next().ok_or_else(|| invalid(sig))?;
    let parsed = match c {
        'V' => Signature::Void,
        'Z' => Signature::Boolean,
        'B' => Signature::Byte,
        'C' => Signature::Char,
        'S' => Signature::Short,
        'I' => Signature::Int,
        'J' => Signature::Long,
        'F' => Signature::Float,
        'D' => Signature::Double,
        'L' => {
            let mut class = String::new();
            loop {
                match chars.next() {
                    Some(';') => break,
                    Some(ch) => class.push(ch),
                    None => return Err(invalid(sig)),
                }
            }
            if class.is_empty() {
                return Err(invalid(sig));
            }
            Signature::Object(class)
        }
        '[' => {
            let inner = parse_one(sig, chars)?;
            if inner == Signature::Void {
                return Err(invalid(sig));
            }
            Signature::Array(Box::new(inner))
        }
        _ => return Err(invalid(sig)),
    };
    Ok(parsed)
}

/// Parse a single type signature such as `I` or `Ljava/lang/String;`.
pub fn parse_type(sig: &str) -> Result<Signature> {
    let mut chars = sig.chars().peekable();
    let parsed = parse_one(sig, &mut chars)?;
    if chars.next().is_some() {
        return Err(invalid(sig));
    }
    Ok(parsed)
}

/// Parse a method signature such as `(I[Ljava/lang/Object;)Z`.
pub fn parse_method(sig: &str) -> Result<MethodSignature> {
    let mut chars = sig.chars().peekable();
    if chars.next() != Some('(') {
        return Err(invalid(sig));
    }
    let mut params = Vec::new();
    loop {
        match chars.peek() {
            Some(')') => {
                chars.next();
                break;
            }
            Some(_) => {
                let param = parse_one(sig, &mut chars)?;
                if param == Signature::Void {
                    return Err(invalid(sig));
                }
                params.push(param);
            }
            None => return Err(invalid(sig)),
        }
    }
    let ret = parse_one(sig, &mut chars)?;
    if chars.next().is_some() {
        return Err(invalid(sig));
    }
    Ok(MethodSignature { params, ret })
}

fn mismatch(value: &Value, sig: &Signature) -> BridgeError {
    BridgeError::Conversion {
        value: format!("{} ({})", value, value.type_name()),
        signature: sig.to_string(),
    }
}

fn int_in_range(value: &Value, sig: &Signature, min: i64, max: i64) -> Result<Value> {
    match value {
        Value::Int(i) if (min..=max).contains(i) => Ok(Value::Int(*i)),
        Value::Char(c) if (*c as i64) <= max => Ok(Value::Int(*c as i64)),
        Value::Bool(b) if max >= 1 => Ok(Value::Int(*b as i64)),
        _ => Err(mismatch(value, sig)),
    }
}

/// Coerce a host value into the representation required by `sig`.
pub fn to_foreign(value: Value, sig: &Signature) -> Result<Value> {
    match sig {
        // Whatever a void method returns is discarded.
        Signature::Void => Ok(Value::Null),
        Signature::Boolean => match value {
            Value::Bool(b) => Ok(Value::Bool(b)),
            Value::Int(i) => Ok(Value::Bool(i != 0)),
            other => Err(mismatch(&other, sig)),
        },
        Signature::Byte => int_in_range(&value, sig, i8::MIN as i64, i8::MAX as i64),
        Signature::Short => int_in_range(&value, sig, i16::MIN as i64, i16::MAX as i64),
        Signature::Int => int_in_range(&value, sig, i32::MIN as i64, i32::MAX as i64),
        Signature::Long => int_in_range(&value, sig, i64::MIN, i64::MAX),
        Signature::Char => match value {
            Value::Char(c) => Ok(Value::Char(c)),
            Value::String(ref s) if s.chars().count() == 1 => {
                Ok(Value::Char(s.chars().next().unwrap_or_default()))
            }
            Value::Int(i) => u32::try_from(i)
                .ok()
                .and_then(char::from_u32)
                .map(Value::Char)
                .ok_or_else(|| mismatch(&value, sig)),
            other => Err(mismatch(&other, sig)),
        },
        Signature::Float | Signature::Double => match value {
            Value::Float(f) => Ok(Value::Float(f)),
            Value::Int(i) => Ok(Value::Float(i as f64)),
            other => Err(mismatch(&other, sig)),
        },
        Signature::Object(class) => match value {
            Value::Null | Value::Object(_) => Ok(value),
            Value::String(_) if class == "java/lang/String" || class == "java/lang/Object" => {
                Ok(value)
            }
            Value::String(s) if class == "java/lang/CharSequence" => Ok(Value::String(s)),
            // Scalars are boxed when the declared type is a reference type.
            Value::Bool(_) | Value::Char(_) | Value::Int(_) | Value::Float(_)
                if !sig.is_string() =>
            {
                Ok(value)
            }
            Value::Array(_) if class == "java/lang/Object" => Ok(value),
            other => Err(mismatch(&other, sig)),
        },
        Signature::Array(inner) => match value {
            Value::Null | Value::Object(_) => Ok(value),
            Value::Array(items) => items
                .into_iter()
                .map(|item| to_foreign(item, inner))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::String(s) if **inner == Signature::Char => {
                Ok(Value::Array(s.chars().map(Value::Char).collect()))
            }
            other => Err(mismatch(&other, sig)),
        },
    }
}

/// Convert a value produced by the embedded runtime into its host form.
pub fn from_foreign(value: Value, sig: &Signature) -> Result<Value> {
    match (sig, value) {
        (Signature::Void, _) => Ok(Value::Null),
        (Signature::Boolean, Value::Int(i)) => Ok(Value::Bool(i != 0)),
        (Signature::Char, Value::Int(i)) => u32::try_from(i)
            .ok()
            .and_then(char::from_u32)
            .map(Value::Char)
            .ok_or_else(|| mismatch(&Value::Int(i), sig)),
        (Signature::Float | Signature::Double, Value::Int(i)) => Ok(Value::Float(i as f64)),
        (Signature::Array(inner), Value::Array(items)) => items
            .into_iter()
            .map(|item| from_foreign(item, inner))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        (_, value) => Ok(value),
    }
}

/// Coerce positional arguments against a method signature.
pub fn args_to_foreign(args: Vec<Value>, sig: &MethodSignature) -> Result<Vec<Value>> {
    if args.len() != sig.params.len() {
        return Err(BridgeError::Misuse(format!(
            "expected {} argument(s), got {}",
            sig.params.len(),
            args.len()
        )));
    }
    args.into_iter()
        .zip(sig.params.iter())
        .map(|(arg, param)| to_foreign(arg, param))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::vm::Handle;

    #[test]
    fn test_parse_type() {
        assert_eq!(parse_type("I").unwrap(), Signature::Int);
        assert_eq!(
            parse_type("Ljava/lang/String;").unwrap(),
            Signature::Object("java/lang/String".to_string())
        );
        assert_eq!(
            parse_type("[[D").unwrap(),
            Signature::Array(Box::new(Signature::Array(Box::new(Signature::Double))))
        );
        assert!(parse_type("Ljava/lang/String").is_err());
        assert!(parse_type("II").is_err());
        assert!(parse_type("[V").is_err());
        assert!(parse_type("Q").is_err());
    }

    #[test]
    fn test_parse_method() {
        let sig = parse_method("(ILjava/lang/String;[Z)V").unwrap();
        assert_eq!(sig.params.len(), 3);
        assert_eq!(sig.params[0], Signature::Int);
        assert!(sig.params[1].is_string());
        assert_eq!(sig.ret, Signature::Void);

        let sig = parse_method("()Ljava/lang/Object;").unwrap();
        assert!(sig.params.is_empty());
        assert_eq!(sig.ret.to_string(), "Ljava/lang/Object;");

        assert!(parse_method("I)V").is_err());
        assert!(parse_method("(I").is_err());
        assert!(parse_method("(V)V").is_err());
        assert!(parse_method("()VV").is_err());
    }

    #[test]
    fn test_to_foreign_scalars() {
        assert_eq!(to_foreign(Value::Int(1), &Signature::Boolean).unwrap(), Value::Bool(true));
        assert_eq!(to_foreign(Value::Int(7), &Signature::Double).unwrap(), Value::Float(7.0));
        assert_eq!(to_foreign(Value::from("x"), &Signature::Char).unwrap(), Value::Char('x'));
        assert!(to_foreign(Value::Int(300), &Signature::Byte).is_err());
        assert!(to_foreign(Value::Int(i64::MAX), &Signature::Int).is_err());
        assert!(to_foreign(Value::from("abc"), &Signature::Int).is_err());
        assert_eq!(to_foreign(Value::from("ignored"), &Signature::Void).unwrap(), Value::Null);
    }

    #[test]
    fn test_to_foreign_references() {
        let string = Signature::Object("java/lang/String".to_string());
        let object = Signature::Object("java/lang/Object".to_string());
        let integer = Signature::Object("java/lang/Integer".to_string());

        assert_eq!(to_foreign(Value::from("s"), &string).unwrap(), Value::from("s"));
        assert_eq!(to_foreign(Value::Null, &string).unwrap(), Value::Null);
        assert!(to_foreign(Value::Int(1), &string).is_err());
        assert_eq!(to_foreign(Value::Int(2), &integer).unwrap(), Value::Int(2));
        assert_eq!(to_foreign(Value::from("s"), &object).unwrap(), Value::from("s"));

        let handle = Value::Object(Handle::from_raw(5));
        assert_eq!(to_foreign(handle.clone(), &string).unwrap(), handle);
    }

    #[test]
    fn test_to_foreign_arrays() {
        let ints = parse_type("[I").unwrap();
        let converted = to_foreign(Value::from(vec![1_i64, 2, 3]), &ints).unwrap();
        assert_eq!(converted, Value::from(vec![1_i64, 2, 3]));

        let chars = parse_type("[C").unwrap();
        assert_eq!(
            to_foreign(Value::from("ab"), &chars).unwrap(),
            Value::Array(vec![Value::Char('a'), Value::Char('b')])
        );
        assert!(to_foreign(Value::from(vec!["x"]), &ints).is_err());
    }

    #[test]
    fn test_from_foreign() {
        assert_eq!(from_foreign(Value::Int(0), &Signature::Boolean).unwrap(), Value::Bool(false));
        assert_eq!(from_foreign(Value::Int(65), &Signature::Char).unwrap(), Value::Char('A'));
        assert_eq!(from_foreign(Value::from("x"), &Signature::Void).unwrap(), Value::Null);
        assert_eq!(
            from_foreign(Value::from(vec![1_i64, 0]), &parse_type("[Z").unwrap()).unwrap(),
            Value::Array(vec![Value::Bool(true), Value::Bool(false)])
        );
    }

    #[test]
    fn test_args_to_foreign_checks_arity() {
        let sig = parse_method("(IZ)V").unwrap();
        let args = args_to_foreign(vec![Value::Int(1), Value::Int(0)], &sig).unwrap();
        assert_eq!(args, vec![Value::Int(1), Value::Bool(false)]);
        assert!(args_to_foreign(vec![Value::Int(1)], &sig).is_err());
    }
}
