use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Name of a remote object, optionally scoped by a category.
#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct Identity {
    pub name: String,
    #[serde(default)]
    pub category: String,
}

impl Identity {
    /// # Errors
    ///
    /// Fails with `IllegalIdentity` when `name` is empty.
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Result<Self> {
        let identity = Self {
            name: name.into(),
            category: category.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    /// # Errors
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::new(
                ErrorKind::IllegalIdentity,
                "identity name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

impl std::str::FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (category, name) = s.split_once('/').unwrap_or(("", s));
        if name.contains('/') {
            return Err(Error::new(
                ErrorKind::IllegalIdentity,
                format!("too many `/` in identity: {s}"),
            ));
        }
        Self::new(name, category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_string_form() {
        let id: Identity = "printer".parse().unwrap();
        assert_eq!(id.name, "printer");
        assert!(id.category.is_empty());
        assert_eq!(id.to_string(), "printer");

        let id: Identity = "office/printer".parse().unwrap();
        assert_eq!(id.category, "office");
        assert_eq!(id.to_string(), "office/printer");

        let err = "office/".parse::<Identity>().unwrap_err();
        assert_eq!(err.kind, ErrorKind::IllegalIdentity);
        assert!("a/b/c".parse::<Identity>().is_err());
    }

    #[test]
    fn test_identity_order() {
        let a = Identity::new("a", "z").unwrap();
        let b = Identity::new("b", "a").unwrap();
        assert!(a < b);
    }
}
