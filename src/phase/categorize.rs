//! Stderr-tail failure categorization (§4.4 step 5). Patterns are matched
//! case-insensitively against the last ~4 KiB of stderr; the first pattern
//! to match wins, in the priority order below.

use crate::errors::FailureCategory;
use regex::Regex;
use std::sync::OnceLock;

pub const STDERR_TAIL_BYTES: usize = 4096;

const RAW_PATTERNS: &[(FailureCategory, &str)] = &[
    (
        FailureCategory::Oom,
        r"(?i)out of memory|oom[- _]?killed|cuda out of memory|memoryerror",
    ),
    (
        FailureCategory::Timeout,
        r"(?i)timed? ?out|deadline exceeded",
    ),
    (
        FailureCategory::Truncation,
        r"(?i)truncated|unexpected end of (file|stream)|incomplete (read|write)",
    ),
    (
        FailureCategory::Quality,
        r"(?i)quality (check|gate) failed|validation tier|confidence below threshold",
    ),
    (
        FailureCategory::Schema,
        r"(?i)schema (error|violation)|jsondecodeerror|keyerror|validation error",
    ),
    (
        FailureCategory::Io,
        r"(?i)no such file or directory|permission denied|file not found|ioerror",
    ),
];

fn patterns() -> &'static Vec<(FailureCategory, Regex)> {
    static CELL: OnceLock<Vec<(FailureCategory, Regex)>> = OnceLock::new();
    CELL.get_or_init(|| {
        RAW_PATTERNS
            .iter()
            .map(|(cat, pat)| (*cat, Regex::new(pat).expect("static regex is valid")))
            .collect()
    })
}

/// Categorize a non-zero phase exit from its stderr tail.
pub fn categorize(stderr: &str) -> FailureCategory {
    let tail = tail_str(stderr, STDERR_TAIL_BYTES);
    for (category, re) in patterns() {
        if re.is_match(tail) {
            return *category;
        }
    }
    FailureCategory::Unknown
}

fn tail_str(s: &str, n: usize) -> &str {
    if s.len() <= n {
        return s;
    }
    let mut start = s.len() - n;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_oom() {
        assert_eq!(categorize("Killed\ncuda out of memory"), FailureCategory::Oom);
    }

    #[test]
    fn detects_timeout() {
        assert_eq!(categorize("operation timed out after 300s"), FailureCategory::Timeout);
    }

    #[test]
    fn detects_schema_before_io() {
        // schema pattern is checked ahead of io in priority order
        assert_eq!(categorize("jsondecodeerror: expecting value"), FailureCategory::Schema);
    }

    #[test]
    fn detects_io() {
        assert_eq!(
            categorize("FileNotFoundError: [Errno 2] No such file or directory: 'x.wav'"),
            FailureCategory::Io
        );
    }

    #[test]
    fn unmatched_stderr_is_unknown() {
        assert_eq!(categorize("some unrelated traceback"), FailureCategory::Unknown);
    }

    #[test]
    fn only_inspects_tail_bytes() {
        let mut noise = "x".repeat(STDERR_TAIL_BYTES * 2);
        noise.push_str("permission denied");
        assert_eq!(categorize(&noise), FailureCategory::Io);
    }
}
