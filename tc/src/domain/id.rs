//! Identifiers for cells, peer groups, envelopes and correlation chains
//!
//! Cell ids use the format: `{6-char-hex}-cell-{slug}`
//! Example: `9c41e2-cell-revenue-figures`

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const SLUG_MAX: usize = 32;

/// Generate a cell id from a task title
///
/// The hex prefix is taken from the random tail of a UUIDv7 so ids minted in
/// the same millisecond still differ.
pub fn generate_id(title: &str) -> String {
    let uuid = Uuid::now_v7().simple().to_string();
    let hex = &uuid[uuid.len() - 6..];
    let slug = slugify(title);
    if slug.is_empty() {
        format!("{}-cell", hex)
    } else {
        format!("{}-cell-{}", hex, slug)
    }
}

/// Slugify a title for use in ids
pub fn slugify(title: &str) -> String {
    let slug = title
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    match slug.char_indices().nth(SLUG_MAX) {
        Some((cut, _)) => slug[..cut].trim_end_matches('-').to_string(),
        None => slug,
    }
}

/// Identity of a work cell
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    /// Mint a fresh id for a cell working on `title`
    pub fn generate(title: &str) -> Self {
        Self(generate_id(title))
    }

    /// Wrap an existing id string
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the hex prefix (first 6 chars)
    pub fn hex_prefix(&self) -> &str {
        self.0.get(..6).unwrap_or(&self.0)
    }

    /// Get the slug portion, if any
    pub fn slug(&self) -> Option<&str> {
        self.0.splitn(3, '-').nth(2)
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Sibling set sharing a lateral channel for one delegation episode
    PeerGroupId
);
uuid_id!(
    /// Identity of a single envelope
    EnvelopeId
);
uuid_id!(
    /// Ties every envelope of one submission together
    CorrelationId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_format() {
        let id = generate_id("Revenue Figures");
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 6);
        assert!(parts[0].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(parts[1], "cell");
        assert_eq!(parts[2], "revenue-figures");
    }

    #[test]
    fn test_generate_id_unique_within_millisecond() {
        let ids: std::collections::HashSet<String> = (0..64).map(|_| generate_id("same")).collect();
        assert!(ids.len() > 60);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello World"), "hello-world");
        assert_eq!(slugify("Don't Stop"), "dont-stop");
        assert_eq!(slugify("  --weird__input--  "), "weird-input");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn test_slugify_truncates() {
        let slug = slugify("a very long title that keeps going well past the slug limit");
        assert!(slug.chars().count() <= SLUG_MAX);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn test_cell_id_accessors() {
        let id = CellId::from_string("abc123-cell-root-task");
        assert_eq!(id.hex_prefix(), "abc123");
        assert_eq!(id.slug(), Some("root-task"));
        assert_eq!(id.to_string(), "abc123-cell-root-task");
    }

    #[test]
    fn test_empty_title_id() {
        let id = CellId::generate("!!!");
        assert!(id.as_str().ends_with("-cell"));
        assert_eq!(id.slug(), None);
    }
}
