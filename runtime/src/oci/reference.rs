//! Image reference parsing.
//!
//! Parses references like `redis`, `redis:7` or `bitnami/redis:7` into a
//! repository path and tag on the configured registry.

use minibox_core::error::{BoxError, Result};

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Repository path (e.g., "library/redis")
    pub repository: String,
    /// Tag (e.g., "latest", "7")
    pub tag: String,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `redis` → library/redis:latest
    /// - `redis:7` → library/redis:7
    /// - `bitnami/redis` → bitnami/redis:latest
    ///
    /// `default_namespace` is prepended to names without a slash.
    pub fn parse(reference: &str, default_namespace: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BoxError::ConfigError("Empty image reference".to_string()));
        }
        if reference.contains('@') {
            return Err(BoxError::ConfigError(format!(
                "Digest references are not supported: '{}'",
                reference
            )));
        }

        // Tag separator is the last colon after the last slash
        let name_start = reference.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match reference[name_start..].rfind(':') {
            Some(colon) => {
                let split = name_start + colon;
                (&reference[..split], &reference[split + 1..])
            }
            None => (reference, DEFAULT_TAG),
        };

        if name.is_empty() || tag.is_empty() {
            return Err(BoxError::ConfigError(format!(
                "Invalid image reference '{}'",
                reference
            )));
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/".contains(c))
        {
            return Err(BoxError::ConfigError(format!(
                "Invalid repository name '{}': only lowercase letters, digits and ._-/ are allowed",
                name
            )));
        }

        let repository = if name.contains('/') || default_namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", default_namespace, name)
        };

        Ok(Self {
            repository,
            tag: tag.to_string(),
        })
    }

    /// Token scope granting pull access to this repository.
    pub fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.repository)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_name() {
        let r = ImageReference::parse("redis", "library").unwrap();
        assert_eq!(r.repository, "library/redis");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.to_string(), "library/redis:latest");
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = ImageReference::parse("alpine:3.19", "library").unwrap();
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag, "3.19");
    }

    #[test]
    fn test_parse_namespaced() {
        let r = ImageReference::parse("bitnami/redis:7", "library").unwrap();
        assert_eq!(r.repository, "bitnami/redis");
        assert_eq!(r.tag, "7");
    }

    #[test]
    fn test_pull_scope() {
        let r = ImageReference::parse("hello-world", "library").unwrap();
        assert_eq!(r.pull_scope(), "repository:library/hello-world:pull");
    }

    #[test]
    fn test_parse_rejects_empty_and_digest() {
        assert!(ImageReference::parse("", "library").is_err());
        assert!(ImageReference::parse("   ", "library").is_err());
        assert!(ImageReference::parse("redis@sha256:abc", "library").is_err());
        assert!(ImageReference::parse("redis:", "library").is_err());
        assert!(ImageReference::parse("Redis", "library").is_err());
    }
}
