use crate::entity::Entity;
use crate::error::{Error, Result};
use std::sync::Arc;
use yrs::Any;

/// A value stored in an entity field: a primitive, null, or an entity
/// reference. Equality is strict for primitives and by identity for
/// entities.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    Entity(Entity),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Self::Entity(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Rejects values outside the engine value space.
    pub(crate) fn check(&self) -> Result<()> {
        match self {
            Self::Number(n) if !n.is_finite() => {
                Err(Error::schema(format!("non-finite number {n}")))
            }
            _ => Ok(()),
        }
    }

    /// Converts a primitive to its stored shape. Entity references are
    /// encoded by the reference codec, never here.
    pub(crate) fn to_any(&self) -> Option<Any> {
        match self {
            Self::Null => Some(Any::Null),
            Self::Bool(b) => Some(Any::Bool(*b)),
            Self::Number(n) => Some(Any::Number(*n)),
            Self::String(s) => Some(Any::String(s.clone())),
            Self::Entity(_) => None,
        }
    }

    /// Reads a stored primitive back. Reference tuples are resolved by the
    /// reference codec before this is reached.
    pub(crate) fn from_any(any: &Any) -> Result<Self> {
        match any {
            Any::Null | Any::Undefined => Ok(Self::Null),
            Any::Bool(b) => Ok(Self::Bool(*b)),
            Any::Number(n) => Ok(Self::Number(*n)),
            Any::BigInt(n) => Ok(Self::Number(*n as f64)),
            Any::String(s) => Ok(Self::String(s.clone())),
            other => Err(Error::schema(format!("unsupported stored value {other:?}"))),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Entity(a), Self::Entity(b)) => a.same(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s.into())
    }
}

impl From<Entity> for Value {
    fn from(entity: Entity) -> Self {
        Self::Entity(entity)
    }
}

impl From<&Entity> for Value {
    fn from(entity: &Entity) -> Self {
        Self::Entity(entity.clone())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_equality_is_strict() {
        assert_eq!(Value::from(1i64), Value::Number(1.0));
        assert_ne!(Value::from(1i64), Value::Bool(true));
        assert_ne!(Value::from("1"), Value::Number(1.0));
        assert_eq!(Value::Null, Value::Null);
    }

    #[test]
    fn non_finite_numbers_are_rejected() {
        assert!(Value::Number(f64::NAN).check().is_err());
        assert!(Value::Number(f64::INFINITY).check().is_err());
        assert!(Value::Number(1.5).check().is_ok());
    }

    #[test]
    fn any_round_trip() {
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::Number(2.5),
            Value::from("x"),
        ] {
            let any = v.to_any().unwrap();
            assert_eq!(Value::from_any(&any).unwrap(), v);
        }
        assert_eq!(Value::from_any(&Any::Undefined).unwrap(), Value::Null);
    }
}
