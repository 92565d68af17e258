//! Path addressing for the value forest.
//!
//! Every node the scheduler hands out is identified by an [`AccessorPath`]:
//! an ordered sequence of attribute names and list indices leading from the
//! root value to the node. Paths are the only job identity that crosses the
//! process boundary, so they are plain JSON on the wire: an array whose
//! elements are integers (list indices) or strings (attribute names).

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

use crate::error::{DrvStreamError, Result};

/// One step into a value: a list index or an attribute name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Accessor {
    /// Zero-based index into a list.
    Index(u64),
    /// Attribute name in an attribute set. Never empty.
    Name(String),
}

impl Accessor {
    /// Parse an accessor from a JSON value: an integer becomes an
    /// [`Accessor::Index`], a non-empty string a [`Accessor::Name`].
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(i) => Ok(Self::Index(i)),
                None => Err(DrvStreamError::Type(format!(
                    "could not make an index out of json: {}",
                    value
                ))),
            },
            serde_json::Value::String(s) if !s.is_empty() => Ok(Self::Name(s.clone())),
            _ => Err(DrvStreamError::Type(format!(
                "could not make an accessor out of json: {}",
                value
            ))),
        }
    }
}

impl Serialize for Accessor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Index(i) => serializer.serialize_u64(*i),
            Self::Name(n) => serializer.serialize_str(n),
        }
    }
}

impl<'de> Deserialize<'de> for Accessor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct AccessorVisitor;

        impl Visitor<'_> for AccessorVisitor {
            type Value = Accessor;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer or a non-empty string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Accessor, E> {
                Ok(Accessor::Index(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Accessor, E> {
                u64::try_from(v)
                    .map(Accessor::Index)
                    .map_err(|_| E::custom(format!("negative list index: {}", v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Accessor, E> {
                if v.is_empty() {
                    Err(E::custom("empty attribute name"))
                } else {
                    Ok(Accessor::Name(v.to_owned()))
                }
            }
        }

        deserializer.deserialize_any(AccessorVisitor)
    }
}

impl fmt::Display for Accessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "[{}]", i),
            Self::Name(n) => write!(f, "\"{}\"", n),
        }
    }
}

/// An ordered sequence of accessors. The empty path denotes the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccessorPath(Vec<Accessor>);

impl AccessorPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse a path from its JSON text form, a JSON array of accessors.
    pub fn parse(s: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(s).map_err(|_| {
            DrvStreamError::Type(format!("error parsing accessor path json: {}", s))
        })?;

        let items = value.as_array().ok_or_else(|| {
            DrvStreamError::Type(format!(
                "expected a json list of accessors, got: {}",
                value
            ))
        })?;

        let mut path = Vec::with_capacity(items.len());
        for item in items {
            path.push(Accessor::from_json(item)?);
        }
        Ok(Self(path))
    }

    /// The path obtained by appending one accessor to this one.
    pub fn child(&self, accessor: Accessor) -> Self {
        let mut path = self.0.clone();
        path.push(accessor);
        Self(path)
    }

    pub fn accessors(&self) -> &[Accessor] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The JSON text form, suitable for a `do` frame payload.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("accessor path serialization cannot fail")
    }
}

impl From<Vec<Accessor>> for AccessorPath {
    fn from(path: Vec<Accessor>) -> Self {
        Self(path)
    }
}

impl Serialize for AccessorPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for accessor in &self.0 {
            seq.serialize_element(accessor)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for AccessorPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Vec::<Accessor>::deserialize(deserializer).map(Self)
    }
}

impl fmt::Display for AccessorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for accessor in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{}", accessor)?;
            first = false;
        }
        Ok(())
    }
}
