//! OCI image reference parsing.
//!
//! Parses references like `registry.example.com:5000/team/app:v1` into
//! validated components.

use imagemerge_core::error::{MergeError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Maximum tag length.
const MAX_TAG_LEN: usize = 128;

/// Minimum hex length of a digest.
const MIN_DIGEST_HEX_LEN: usize = 32;

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname, with optional port (e.g., "docker.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/alpine", "team/app")
    pub repository: String,
    /// Tag (e.g., "latest", "v1")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `alpine` → docker.io/library/alpine:latest
    /// - `alpine:3.19` → docker.io/library/alpine:3.19
    /// - `team/app` → docker.io/team/app:latest
    /// - `ghcr.io/org/app:tag` → ghcr.io/org/app:tag
    /// - `ghcr.io/org/app@sha256:...` → ghcr.io/org/app@sha256:...
    pub fn parse(reference: &str) -> Result<Self> {
        let trimmed = reference.trim();
        let invalid = |message: String| MergeError::InvalidReference {
            reference: reference.to_string(),
            message,
        };

        if trimmed.is_empty() {
            return Err(invalid("empty reference".to_string()));
        }

        let (name_tag, digest) = match trimmed.rsplit_once('@') {
            Some((name_tag, digest)) => {
                validate_digest(digest).map_err(invalid)?;
                (name_tag, Some(digest.to_string()))
            }
            None => (trimmed, None),
        };

        // Only a colon after the last slash separates the tag.
        let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let colon = last_segment_start + colon;
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if let Some(tag) = &tag {
            validate_tag(tag).map_err(invalid)?;
        }

        let (registry, repository) = split_registry_repository(name).map_err(invalid)?;

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Short form without the default registry and `library/` namespace,
    /// as Docker prints it (`alpine:3.19`, `team/app:v1`).
    pub fn familiar(&self) -> String {
        let mut s = if self.registry == DEFAULT_REGISTRY {
            self.repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            format!("{}/{}", self.registry, self.repository)
        };
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split a name into registry and repository components.
fn split_registry_repository(name: &str) -> std::result::Result<(String, String), String> {
    let (registry, repository) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            validate_registry(first)?;
            (first.to_string(), rest.to_string())
        }
        _ if name.contains('/') => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        // Single name like "alpine" → "library/alpine" for Docker Hub
        _ => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
    };

    validate_repository(&repository)?;
    Ok((registry, repository))
}

fn validate_registry(registry: &str) -> std::result::Result<(), String> {
    let (host, port) = match registry.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (registry, None),
    };
    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(format!("invalid registry '{}'", registry));
    }
    if let Some(port) = port {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid registry port in '{}'", registry));
        }
    }
    Ok(())
}

/// Repository components are lowercase alphanumeric runs joined by `.`, `_`,
/// `__` or one or more `-`.
fn validate_repository(repository: &str) -> std::result::Result<(), String> {
    if repository.is_empty() {
        return Err("empty repository".to_string());
    }
    for component in repository.split('/') {
        if !is_valid_component(component) {
            return Err(format!("invalid repository component '{}'", component));
        }
    }
    Ok(())
}

fn is_valid_component(component: &str) -> bool {
    let is_alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let bytes: Vec<char> = component.chars().collect();
    let (Some(&first), Some(&last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    if !is_alnum(first) || !is_alnum(last) {
        return false;
    }

    let mut separator = String::new();
    for &c in &bytes {
        if is_alnum(c) {
            if !separator.is_empty() {
                let ok = separator == "."
                    || separator == "_"
                    || separator == "__"
                    || separator.chars().all(|s| s == '-');
                if !ok {
                    return false;
                }
                separator.clear();
            }
        } else if matches!(c, '.' | '_' | '-') {
            separator.push(c);
        } else {
            return false;
        }
    }
    true
}

fn validate_tag(tag: &str) -> std::result::Result<(), String> {
    let is_word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let mut chars = tag.chars();
    let valid = tag.len() <= MAX_TAG_LEN
        && chars.next().is_some_and(is_word)
        && chars.all(|c| is_word(c) || c == '.' || c == '-');
    if !valid {
        return Err(format!("invalid tag '{}'", tag));
    }
    Ok(())
}

fn validate_digest(digest: &str) -> std::result::Result<(), String> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err(format!(
            "invalid digest '{}': expected algorithm:hex",
            digest
        ));
    };
    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c));
    let hex_ok = hex.len() >= MIN_DIGEST_HEX_LEN && hex.chars().all(|c| c.is_ascii_hexdigit());
    if !algorithm_ok || !hex_ok {
        return Err(format!(
            "invalid digest '{}': expected algorithm:hex",
            digest
        ));
    }
    Ok(())
}
