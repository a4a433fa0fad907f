use anyhow::{anyhow, bail, ensure, Context, Result};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, sync::Arc};

const MAX_LEN: usize = 64;

/// Key for a printer in the config and on every `WorkerMsg`.
///
/// Ids end up in log lines and the TOML file, so they are limited to
/// `[A-Za-z0-9_-]`, the same alphabet `nanoid` generates from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrinterId(Arc<str>);

impl PrinterId {
    pub fn parse(id: &str) -> Result<Self> {
        ensure!(!id.is_empty(), "printer id is empty");
        ensure!(
            id.len() <= MAX_LEN,
            "printer id longer than {} bytes: {:?}",
            MAX_LEN,
            id
        );
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            bail!("printer id {:?} contains invalid character {:?}", id, c);
        }
        Ok(Self(Arc::from(id)))
    }

    /// For ids known to be valid, e.g. literals
    pub fn from_id(id: &str) -> Self {
        debug_assert!(Self::parse(id).is_ok(), "invalid printer id {:?}", id);
        Self(Arc::from(id))
    }

    pub fn generate() -> Self {
        Self(Arc::from(nanoid::nanoid!().as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrinterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PrinterId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PrinterId {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl Serialize for PrinterId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PrinterId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(|e| de::Error::custom(format!("{:#}", e)))
    }
}

/// MARK: Tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_parse() {
        for _ in 0..32 {
            let id = PrinterId::generate();
            assert_eq!(PrinterId::parse(id.as_str()).unwrap(), id);
        }
    }

    #[test]
    fn test_rejects_bad_ids() {
        assert!(PrinterId::parse("").is_err());
        assert!(PrinterId::parse("x1c bench").is_err());
        assert!(PrinterId::parse("a/b").is_err());
        assert!(PrinterId::parse(&"a".repeat(MAX_LEN + 1)).is_err());
        assert!(PrinterId::parse(&"a".repeat(MAX_LEN)).is_ok());
        assert_eq!("p1s_garage".parse::<PrinterId>().unwrap().to_string(), "p1s_garage");
    }

    #[test]
    fn test_serde() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Wrap {
            id: PrinterId,
        }

        let w: Wrap = toml::from_str(r#"id = "x1c-01""#).unwrap();
        assert_eq!(w.id, PrinterId::from_id("x1c-01"));
        assert_eq!(toml::to_string(&w).unwrap().trim(), r#"id = "x1c-01""#);

        let err = toml::from_str::<Wrap>(r#"id = """#).unwrap_err();
        assert!(err.to_string().contains("printer id is empty"));
        assert!(toml::from_str::<Wrap>(r#"id = "two words""#).is_err());
    }
}
