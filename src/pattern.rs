// Copyright 2025 Salvini
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Tag keyword filter convention shared by both backends

use anyhow::{Context, Result};
use regex::RegexBuilder;

/// Strip a `/.../` wrapper (optionally with a trailing `i` flag) from a
/// supplied pattern, leaving the bare pattern. `/^TEMP/i` and `^TEMP`
/// behave identically.
pub fn strip_wrapper(keywords: &str) -> &str {
    let mut bare = keywords;
    if let Some(rest) = bare.strip_prefix('/') {
        bare = rest;
    }
    if let Some(rest) = bare.strip_suffix("/i") {
        bare = rest;
    } else if let Some(rest) = bare.strip_suffix('/') {
        bare = rest;
    }
    bare
}

/// Case-insensitive tag filter. An empty pattern matches every tag.
#[derive(Debug, Clone)]
pub struct TagFilter {
    bare: String,
    re: Option<regex::Regex>,
}

impl TagFilter {
    pub fn new(keywords: &str) -> Result<Self> {
        let bare = strip_wrapper(keywords.trim()).to_string();
        let re = if bare.is_empty() {
            None
        } else {
            Some(
                RegexBuilder::new(&bare)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("invalid tag filter pattern: {bare}"))?,
            )
        };
        Ok(Self { bare, re })
    }

    pub fn matches(&self, tag: &str) -> bool {
        self.re.as_ref().map_or(true, |re| re.is_match(tag))
    }

    /// The bare pattern, for pushing down into a store-side regex query.
    pub fn source(&self) -> &str {
        &self.bare
    }
}

/// Anchored alternation matching exactly the given tags, for store-side
/// lookups of a known tag set.
pub fn exact_any(tags: &[String]) -> String {
    tags.iter()
        .map(|t| format!("^{}$", regex::escape(t)))
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_wrapper() {
        assert_eq!(strip_wrapper("^TEMP"), "^TEMP");
        assert_eq!(strip_wrapper("/^TEMP/"), "^TEMP");
        assert_eq!(strip_wrapper("/^TEMP/i"), "^TEMP");
        assert_eq!(strip_wrapper(""), "");
        assert_eq!(strip_wrapper("/"), "");
    }

    #[test]
    fn test_filter_matches_prefix_pattern() {
        let filter = TagFilter::new("^TEMP").unwrap();
        assert!(filter.matches("TEMP1"));
        assert!(filter.matches("TEMP2"));
        assert!(filter.matches("temp1")); // always case-insensitive
        assert!(!filter.matches("PRESS1"));
    }

    #[test]
    fn test_wrapped_pattern_equivalent_to_bare() {
        let bare = TagFilter::new("^TEMP").unwrap();
        let wrapped = TagFilter::new("/^TEMP/i").unwrap();
        for tag in ["TEMP1", "TEMP2", "PRESS1", "xTEMP"] {
            assert_eq!(bare.matches(tag), wrapped.matches(tag));
        }
    }

    #[test]
    fn test_empty_pattern_matches_everything() {
        let filter = TagFilter::new("").unwrap();
        assert!(filter.matches("ANYTHING"));
        assert_eq!(filter.source(), "");
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        assert!(TagFilter::new("(").is_err());
    }

    #[test]
    fn test_exact_any_escapes_metacharacters() {
        let pattern = exact_any(&["A.1".to_string(), "B2".to_string()]);
        assert_eq!(pattern, r"^A\.1$|^B2$");
        let re = RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .unwrap();
        assert!(re.is_match("a.1"));
        assert!(!re.is_match("Ax1"));
    }
}
