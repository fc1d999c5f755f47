//! Object identifiers
//!
//! Every object handled by DeltaCopy is addressed as
//! `<scheme>://<container>/<key>`, where the container is the bucket (S3)
//! or top-level directory (local backend) and the key is the hierarchical
//! object path inside it.

use crate::error::{DeltaCopyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A parsed object identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUri {
    scheme: String,
    container: String,
    key: String,
}

impl ObjectUri {
    /// Parse an identifier of the form `scheme://container/key`
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = split_scheme(uri)?;
        let (container, key) = rest
            .split_once('/')
            .ok_or_else(|| DeltaCopyError::InvalidUri(format!("{}: missing object key", uri)))?;

        if container.is_empty() {
            return Err(DeltaCopyError::InvalidUri(format!("{}: empty container", uri)));
        }
        let key = key.trim_start_matches('/');
        if key.is_empty() || key.ends_with('/') {
            return Err(DeltaCopyError::InvalidUri(format!("{}: empty object key", uri)));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            container: container.to_string(),
            key: key.to_string(),
        })
    }

    /// Build an identifier from parts
    pub fn new(scheme: &str, container: &str, key: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            container: container.to_string(),
            key: key.to_string(),
        }
    }

    /// URI scheme (`s3`, `local`, `mem`)
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Bucket or top-level directory
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Hierarchical object path inside the container
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.container, self.key)
    }
}

impl FromStr for ObjectUri {
    type Err = DeltaCopyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Location that receives delta objects: `scheme://container[/prefix]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetNamespace {
    scheme: String,
    container: String,
    prefix: Option<String>,
}

impl TargetNamespace {
    /// Parse a namespace; a trailing slash is ignored
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = split_scheme(uri)?;
        let rest = rest.trim_end_matches('/');
        let (container, prefix) = match rest.split_once('/') {
            Some((container, prefix)) => {
                let prefix = prefix.trim_matches('/');
                (container, (!prefix.is_empty()).then(|| prefix.to_string()))
            }
            None => (rest, None),
        };

        if container.is_empty() {
            return Err(DeltaCopyError::InvalidUri(format!("{}: empty container", uri)));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            container: container.to_string(),
            prefix,
        })
    }

    /// URI scheme of the namespace
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Bucket or top-level directory of the namespace
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Optional key prefix under the container
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Place an object key inside this namespace
    pub fn join(&self, key: &str) -> ObjectUri {
        let key = match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        };
        ObjectUri::new(&self.scheme, &self.container, &key)
    }
}

impl fmt::Display for TargetNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "{}://{}/{}", self.scheme, self.container, prefix),
            None => write!(f, "{}://{}", self.scheme, self.container),
        }
    }
}

impl FromStr for TargetNamespace {
    type Err = DeltaCopyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TargetNamespace {
    type Error = DeltaCopyError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TargetNamespace> for String {
    fn from(ns: TargetNamespace) -> Self {
        ns.to_string()
    }
}

fn split_scheme(uri: &str) -> Result<(&str, &str)> {
    let (scheme, rest) = uri
        .split_once("://")
        .ok_or_else(|| DeltaCopyError::InvalidUri(format!("{}: missing scheme", uri)))?;

    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-') {
        return Err(DeltaCopyError::InvalidUri(format!("{}: bad scheme", uri)));
    }
    Ok((scheme, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_uri() {
        let uri = ObjectUri::parse("s3://logs/app/2024/server.log").unwrap();
        assert_eq!(uri.scheme(), "s3");
        assert_eq!(uri.container(), "logs");
        assert_eq!(uri.key(), "app/2024/server.log");
        assert_eq!(uri.to_string(), "s3://logs/app/2024/server.log");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ObjectUri::parse("logs/app.log").is_err());
        assert!(ObjectUri::parse("s3://logs").is_err());
        assert!(ObjectUri::parse("s3://logs/").is_err());
        assert!(ObjectUri::parse("s3:///app.log").is_err());
        assert!(ObjectUri::parse("://logs/app.log").is_err());
    }

    #[test]
    fn test_namespace_join() {
        let ns = TargetNamespace::parse("s3://exports/deltas/").unwrap();
        assert_eq!(ns.prefix(), Some("deltas"));
        assert_eq!(ns.to_string(), "s3://exports/deltas");
        assert_eq!(ns.join("a/b.log").to_string(), "s3://exports/deltas/a/b.log");

        let bare = TargetNamespace::parse("local://exports").unwrap();
        assert_eq!(bare.prefix(), None);
        assert_eq!(bare.join("b.log").to_string(), "local://exports/b.log");
    }

    #[test]
    fn test_namespace_serde() {
        let ns: TargetNamespace = serde_json::from_str("\"mem://out/x\"").unwrap();
        assert_eq!(ns.container(), "out");
        assert_eq!(serde_json::to_string(&ns).unwrap(), "\"mem://out/x\"");
        assert!(serde_json::from_str::<TargetNamespace>("\"nope\"").is_err());
    }
}
