//! Allowlist pattern matching.
//!
//! Patterns are globs: `**` matches any characters including path
//! separators, `*` matches anything except a separator, `?` matches one
//! character. A pattern containing a path separator matches the resolved
//! absolute path; otherwise it matches the executable basename. Matching is
//! case-insensitive.

use glob::{MatchOptions, Pattern};

use super::ApprovalEntry;

/// What the executor resolved a command's first token to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecResolution {
    /// The executable as written in the command line.
    pub raw_executable: String,
    /// Absolute path after PATH search, when resolution succeeded.
    pub resolved_path: Option<String>,
    /// Basename of the executable.
    pub executable_name: String,
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: false,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Check one pattern against a resolution.
pub fn pattern_matches(pattern: &str, resolution: &ExecResolution) -> bool {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return false;
    }
    let compiled = match Pattern::new(trimmed) {
        Ok(p) => p,
        Err(err) => {
            tracing::warn!(
                target: "approvals",
                pattern = %trimmed,
                error = %err,
                "invalid allowlist pattern, skipping"
            );
            return false;
        }
    };

    let has_separator = trimmed.contains('/') || trimmed.contains('\\');
    if has_separator {
        match resolution.resolved_path.as_deref() {
            Some(path) => compiled.matches_with(path, match_options()),
            None => false,
        }
    } else {
        compiled.matches_with(&resolution.executable_name, match_options())
    }
}

/// Walk the entries in order; the first match wins.
pub fn match_allowlist<'a>(
    entries: &'a [ApprovalEntry],
    resolution: &ExecResolution,
) -> Option<&'a ApprovalEntry> {
    entries
        .iter()
        .find(|entry| pattern_matches(&entry.pattern, resolution))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rg_resolution() -> ExecResolution {
        ExecResolution {
            raw_executable: "rg".to_string(),
            resolved_path: Some("/opt/homebrew/bin/rg".to_string()),
            executable_name: "rg".to_string(),
        }
    }

    #[test]
    fn test_basename_match_case_insensitive() {
        assert!(pattern_matches("RG", &rg_resolution()));
        assert!(pattern_matches("rg", &rg_resolution()));
        assert!(!pattern_matches("ripgrep", &rg_resolution()));
    }

    #[test]
    fn test_single_star_does_not_cross_separator() {
        assert!(!pattern_matches("/opt/*/rg", &rg_resolution()));
        assert!(pattern_matches("/opt/*/bin/rg", &rg_resolution()));
    }

    #[test]
    fn test_double_star_crosses_separator() {
        assert!(pattern_matches("/opt/**/rg", &rg_resolution()));
        assert!(pattern_matches("/**/rg", &rg_resolution()));
    }

    #[test]
    fn test_path_pattern_is_case_insensitive() {
        let resolution = ExecResolution {
            raw_executable: "rg".to_string(),
            resolved_path: Some("/Opt/Homebrew/bin/RG".to_string()),
            executable_name: "RG".to_string(),
        };
        assert!(pattern_matches("/opt/homebrew/bin/rg", &resolution));
    }

    #[test]
    fn test_question_mark_matches_one_char() {
        assert!(pattern_matches("r?", &rg_resolution()));
        assert!(!pattern_matches("?", &rg_resolution()));
    }

    #[test]
    fn test_path_pattern_without_resolution_misses() {
        let resolution = ExecResolution {
            raw_executable: "rg".to_string(),
            resolved_path: None,
            executable_name: "rg".to_string(),
        };
        assert!(!pattern_matches("/opt/**/rg", &resolution));
        assert!(pattern_matches("rg", &resolution));
    }

    #[test]
    fn test_match_is_idempotent() {
        let resolution = rg_resolution();
        for _ in 0..3 {
            assert!(pattern_matches("/opt/**/rg", &resolution));
            assert!(!pattern_matches("/opt/*/rg", &resolution));
        }
    }

    #[test]
    fn test_first_match_wins() {
        let entries = vec![
            ApprovalEntry::new("/usr/bin/uname"),
            ApprovalEntry::new("rg"),
            ApprovalEntry::new("/opt/**/rg"),
        ];
        let matched = match_allowlist(&entries, &rg_resolution()).unwrap();
        assert_eq!(matched.pattern, "rg");
    }

    #[test]
    fn test_no_match_returns_none() {
        let entries = vec![ApprovalEntry::new("/usr/bin/uname")];
        assert!(match_allowlist(&entries, &rg_resolution()).is_none());
    }

    #[test]
    fn test_empty_and_invalid_patterns_never_match() {
        assert!(!pattern_matches("", &rg_resolution()));
        assert!(!pattern_matches("   ", &rg_resolution()));
        assert!(!pattern_matches("[", &rg_resolution()));
    }
}
