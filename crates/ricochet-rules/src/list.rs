//! List-file loading shared by rules.
//!
//! One entry per line; `#` starts a comment, surrounding whitespace is
//! trimmed, blank lines are skipped.

use std::fs;
use std::path::Path;

use crate::error::RuleError;

/// Read a list file into trimmed, comment-free lines.
pub fn read_lines(path: impl AsRef<Path>) -> Result<Vec<String>, RuleError> {
    let data = fs::read_to_string(path)?;
    Ok(data
        .lines()
        .map(|line| {
            let line = line.split('#').next().unwrap_or("");
            line.trim().to_string()
        })
        .filter(|line| !line.is_empty())
        .collect())
}

/// Load a file of regexps matched against text.
pub fn load_regexps(path: impl AsRef<Path>) -> Result<Vec<regex::Regex>, RuleError> {
    read_lines(path)?
        .iter()
        .map(|line| regex::Regex::new(line).map_err(RuleError::from))
        .collect()
}

/// Load a file of regexps matched against raw bytes.
pub fn load_byte_regexps(path: impl AsRef<Path>) -> Result<Vec<regex::bytes::Regex>, RuleError> {
    read_lines(path)?
        .iter()
        .map(|line| regex::bytes::Regex::new(line).map_err(RuleError::from))
        .collect()
}
