//! Glob patterns over cache keys.

use std::fmt;

use regex::Regex;

/// A compiled key glob.
///
/// `*` matches any run of characters (including none). Every other character
/// matches itself. Matching is anchored at both ends.
///
/// # Example
///
/// ```rust
/// use swr_cache::KeyPattern;
///
/// let pattern = KeyPattern::new("issues_*").unwrap();
/// assert!(pattern.matches("issues_filtered_12"));
/// assert!(!pattern.matches("my_issues_12"));
/// ```
#[derive(Debug, Clone)]
pub struct KeyPattern {
    glob: String,
    regex: Regex,
}

impl KeyPattern {
    /// Compile a glob.
    pub fn new(glob: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&glob_to_regex(glob))?;
        Ok(Self {
            glob: glob.to_string(),
            regex,
        })
    }

    /// Whether `key` matches the whole pattern.
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// The source glob.
    pub fn as_str(&self) -> &str {
        &self.glob
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.glob)
    }
}

/// Translate a glob into an anchored regex source string.
pub fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 12);
    out.push_str("(?s)^");
    for (i, literal) in glob.split('*').enumerate() {
        if i > 0 {
            out.push_str(".*");
        }
        out.push_str(&regex::escape(literal));
    }
    out.push('$');
    out
}
