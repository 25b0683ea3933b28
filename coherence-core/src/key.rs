//! Directory keys: object ids and name bindings.
//!
//! Object keys and binding keys live in disjoint namespaces but share the
//! same access-state machinery, so both are wrapped in [`Key`].

use crate::ObjectId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of a name binding.
///
/// `Upper` is the position beyond all real names. The derived ordering places
/// it after every `Name`, which gives binding-range operations a well-defined
/// greatest key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BindingKey {
    Name(String),
    Upper,
}

impl BindingKey {
    /// Binding key for a real name.
    pub fn name(name: impl Into<String>) -> Self {
        BindingKey::Name(name.into())
    }

    pub fn is_upper(&self) -> bool {
        matches!(self, BindingKey::Upper)
    }

    /// The name, or `None` for the upper sentinel.
    pub fn as_name(&self) -> Option<&str> {
        match self {
            BindingKey::Name(name) => Some(name),
            BindingKey::Upper => None,
        }
    }
}

impl From<&str> for BindingKey {
    fn from(name: &str) -> Self {
        BindingKey::Name(name.to_string())
    }
}

impl From<String> for BindingKey {
    fn from(name: String) -> Self {
        BindingKey::Name(name)
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKey::Name(name) => write!(f, "{:?}", name),
            BindingKey::Upper => write!(f, "<upper>"),
        }
    }
}

/// A coherence unit tracked by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Key {
    Object(ObjectId),
    Binding(BindingKey),
}

impl Key {
    pub fn object(oid: ObjectId) -> Self {
        Key::Object(oid)
    }

    pub fn binding(key: impl Into<BindingKey>) -> Self {
        Key::Binding(key.into())
    }
}

impl From<ObjectId> for Key {
    fn from(oid: ObjectId) -> Self {
        Key::Object(oid)
    }
}

impl From<BindingKey> for Key {
    fn from(key: BindingKey) -> Self {
        Key::Binding(key)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Object(oid) => write!(f, "object {}", oid),
            Key::Binding(binding) => write!(f, "binding {}", binding),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upper_sorts_after_every_name() {
        let mut keys = vec![
            BindingKey::Upper,
            BindingKey::name("zzzz"),
            BindingKey::name(""),
            BindingKey::name("room1"),
        ];
        keys.sort();
        assert_eq!(keys.last(), Some(&BindingKey::Upper));
        assert_eq!(keys.first(), Some(&BindingKey::name("")));
    }

    #[test]
    fn test_object_and_binding_namespaces_disjoint() {
        let oid = Key::object(ObjectId::new(1).unwrap());
        let name = Key::binding("1");
        assert_ne!(oid, name);
    }

    #[test]
    fn test_display() {
        assert_eq!(Key::binding("room1").to_string(), "binding \"room1\"");
        assert_eq!(Key::binding(BindingKey::Upper).to_string(), "binding <upper>");
        assert_eq!(Key::object(ObjectId::new(42).unwrap()).to_string(), "object 42");
    }
}
