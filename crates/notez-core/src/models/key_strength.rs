//! Key strength hints shown next to the title input.

use serde::{Deserialize, Serialize};

const COMMON_PHRASES: &[&str] = &[
    "hello", "test", "public", "password", "demo", "123", "abc", "temp",
];

/// Coarse strength of a note key, by length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrength {
    Weak,
    Medium,
    Strong,
}

impl KeyStrength {
    pub fn classify(key: &str) -> Self {
        match key.chars().count() {
            0..=5 => Self::Weak,
            6..=11 => Self::Medium,
            _ => Self::Strong,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Weak => "weak",
            Self::Medium => "medium",
            Self::Strong => "strong",
        }
    }
}

/// Keys containing a well-known phrase are likely shared "public boards".
pub fn is_common_phrase(key: &str) -> bool {
    let lower = key.to_lowercase();
    COMMON_PHRASES.iter().any(|phrase| lower.contains(phrase))
}
