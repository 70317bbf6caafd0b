//! Destination and source references of a merge.

use imagemerge_core::error::{MergeError, Result};

use crate::oci::ImageReference;

/// Minimum number of source images in a merge.
pub const MIN_SOURCES: usize = 2;

/// Parsed destination tag plus ordered source references.
///
/// Source order is significant: earlier sources win conflicting paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSet {
    destination: ImageReference,
    sources: Vec<ImageReference>,
}

impl ReferenceSet {
    /// Parse the destination tag and source references.
    ///
    /// The source count is checked before anything is parsed.
    pub fn parse<S: AsRef<str>>(tag: &str, sources: &[S]) -> Result<Self> {
        if sources.len() < MIN_SOURCES {
            return Err(MergeError::InsufficientSources {
                required: MIN_SOURCES,
                given: sources.len(),
            });
        }

        let destination = ImageReference::parse(tag)?;
        let sources = sources
            .iter()
            .map(|s| ImageReference::parse(s.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            destination,
            sources,
        })
    }

    pub fn destination(&self) -> &ImageReference {
        &self.destination
    }

    pub fn sources(&self) -> &[ImageReference] {
        &self.sources
    }

    /// History branch name for the source at `index`.
    ///
    /// The index prefix keeps two tags of one repository apart.
    pub fn branch_name(&self, index: usize) -> Option<String> {
        self.sources.get(index).map(|r| branch_name(index, r))
    }
}

/// Ref-safe branch name for a source image.
pub fn branch_name(index: usize, reference: &ImageReference) -> String {
    let flattened = reference
        .familiar()
        .chars()
        .map(|c| match c {
            '/' | ':' | '@' => '-',
            c => c,
        })
        .collect::<String>()
        .replace("..", "-");
    format!("src-{}-{}", index, flattened)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_set() {
        let set = ReferenceSet::parse("merged:latest", &["team/a:1", "team/b:2"]).unwrap();
        assert_eq!(set.destination().repository, "library/merged");
        assert_eq!(set.sources().len(), 2);
        assert_eq!(set.sources()[0].repository, "team/a");
        assert_eq!(set.sources()[1].tag.as_deref(), Some("2"));
    }

    #[test]
    fn test_insufficient_sources_checked_first() {
        // Invalid tag, but the count error wins
        let err = ReferenceSet::parse("NOT VALID", &["alpine"]).unwrap_err();
        assert!(matches!(
            err,
            MergeError::InsufficientSources {
                required: 2,
                given: 1
            }
        ));

        let none: [&str; 0] = [];
        let err = ReferenceSet::parse("merged", &none).unwrap_err();
        assert!(matches!(err, MergeError::InsufficientSources { given: 0, .. }));
    }

    #[test]
    fn test_invalid_tag() {
        let err = ReferenceSet::parse("Merged:Latest!", &["a", "b"]).unwrap_err();
        assert!(matches!(err, MergeError::InvalidReference { .. }));
    }

    #[test]
    fn test_invalid_source_names_the_reference() {
        let err = ReferenceSet::parse("merged", &["alpine", "bad//ref"]).unwrap_err();
        match err {
            MergeError::InvalidReference { reference, .. } => assert_eq!(reference, "bad//ref"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_branch_names() {
        let set = ReferenceSet::parse(
            "merged",
            &["alpine:3.19", "alpine:3.20", "ghcr.io/org/app:v1"],
        )
        .unwrap();
        assert_eq!(set.branch_name(0).unwrap(), "src-0-alpine-3.19");
        assert_eq!(set.branch_name(1).unwrap(), "src-1-alpine-3.20");
        assert_eq!(set.branch_name(2).unwrap(), "src-2-ghcr.io-org-app-v1");
        assert!(set.branch_name(3).is_none());
    }

    #[test]
    fn test_same_reference_twice_gets_distinct_branches() {
        let set = ReferenceSet::parse("merged", &["alpine", "alpine"]).unwrap();
        assert_ne!(set.branch_name(0), set.branch_name(1));
    }
}
