//! Sectioned key/value configuration reader
//!
//! The on-disk format is a simple INI-style file:
//!
//! ```text
//! # comment
//! [tcp_proxy]
//! "port"="8080"
//!
//! [tcp_proxy\routes]
//! "route"="10.0.0.5 127.0.0.1:9100"
//! "route"="10.0.0.6 127.0.0.1:9100"
//! ```
//!
//! Rules:
//! - a section header is `[<name>]`
//! - lines whose first non-whitespace character is `#` are comments
//! - a value line is `"<name>"="<value>"`; the quotes are optional around
//!   either field but must be balanced when present
//! - a blank line ends a section
//! - section and value names compare case-insensitively
//! - the same name may repeat within a section (enumeration semantics)
//!
//! The reader re-scans the file on every query; configuration access happens
//! only at startup and on operator commands, never on the data path.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// A classified line of the configuration format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Line<'a> {
    Blank,
    Comment,
    Section(&'a str),
    Pair { name: &'a str, value: &'a str },
    Other,
}

/// Classify one raw line.
fn classify(raw: &str) -> Line<'_> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Line::Blank;
    }
    if trimmed.starts_with('#') {
        return Line::Comment;
    }
    if let Some(inner) = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    {
        return Line::Section(inner.trim());
    }
    if let Some((lhs, rhs)) = trimmed.split_once('=') {
        if let (Some(name), Some(value)) = (unquote(lhs.trim()), unquote(rhs.trim())) {
            return Line::Pair { name, value };
        }
        return Line::Other;
    }
    Line::Other
}

/// Strip one pair of surrounding double quotes.
///
/// Quotes are optional, but a field with an opening quote and no closing one
/// (or vice versa) is malformed and yields `None`.
fn unquote(field: &str) -> Option<&str> {
    if let Some(rest) = field.strip_prefix('"') {
        rest.strip_suffix('"')
    } else if field.ends_with('"') {
        None
    } else {
        Some(field)
    }
}

/// Handle to a configuration file on disk.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    /// Open a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::FileNotFound` if the path does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file contains the given section.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read.
    pub fn has_section(&self, section: &str) -> Result<bool, ConfigError> {
        let text = fs::read_to_string(&self.path)?;
        for raw in text.lines() {
            if let Line::Section(name) = classify(raw) {
                if name.eq_ignore_ascii_case(section) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// First value of `name` in `section`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if the section ends (blank line or end
    /// of file) without a matching value.
    pub fn get_string(&self, section: &str, name: &str) -> Result<String, ConfigError> {
        let mut found = None;
        self.scan(section, name, |value| {
            found = Some(value.to_string());
            false
        })?;
        found.ok_or_else(|| ConfigError::Missing {
            section: section.to_string(),
            name: name.to_string(),
        })
    }

    /// First value of `name` in `section`, parsed as an integer.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` if the value is not an integer.
    pub fn get_int(&self, section: &str, name: &str) -> Result<i64, ConfigError> {
        let value = self.get_string(section, name)?;
        value
            .parse()
            .map_err(|_| ConfigError::parse(format!("'{name}' is not an integer: \"{value}\"")))
    }

    /// First value of `name` in `section`, parsed as a boolean.
    ///
    /// Accepts `true` and `false`, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for any other value.
    pub fn get_bool(&self, section: &str, name: &str) -> Result<bool, ConfigError> {
        let value = self.get_string(section, name)?;
        if value.eq_ignore_ascii_case("true") {
            Ok(true)
        } else if value.eq_ignore_ascii_case("false") {
            Ok(false)
        } else {
            Err(ConfigError::parse(format!(
                "'{name}' is not a boolean: \"{value}\""
            )))
        }
    }

    /// Visit every value of `name` within `section`, in file order.
    ///
    /// The visitor returns a continue flag; returning `false` aborts the
    /// enumeration. The result is `true` when the enumeration ran to the end
    /// of the section, `false` when the visitor aborted it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read.
    pub fn enumerate<F>(&self, section: &str, name: &str, visit: F) -> Result<bool, ConfigError>
    where
        F: FnMut(&str) -> bool,
    {
        self.scan(section, name, visit)
    }

    /// Walk the file, feeding matching values to the visitor. `Ok(true)`
    /// means the section was exhausted, `Ok(false)` that the visitor stopped.
    fn scan<F>(&self, section: &str, name: &str, mut visit: F) -> Result<bool, ConfigError>
    where
        F: FnMut(&str) -> bool,
    {
        let text = fs::read_to_string(&self.path)?;
        let mut in_section = false;
        for raw in text.lines() {
            match classify(raw) {
                Line::Comment => {}
                Line::Section(header) if !in_section => {
                    in_section = header.eq_ignore_ascii_case(section);
                }
                Line::Blank if in_section => return Ok(true),
                Line::Pair { name: n, value } if in_section => {
                    if n.eq_ignore_ascii_case(name) && !visit(value) {
                        return Ok(false);
                    }
                }
                _ => {}
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_with(contents: &str) -> (NamedTempFile, ConfigFile) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let config = ConfigFile::open(file.path()).unwrap();
        (file, config)
    }

    #[test]
    fn test_open_missing_file() {
        let result = ConfigFile::open("/nonexistent/tcp-router.conf");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_get_string_quoted_and_bare() {
        let (_file, config) = config_with(
            "[tcp_proxy]\n\
             \"port\"=\"8080\"\n\
             host=example.net\n",
        );
        assert_eq!(config.get_string("tcp_proxy", "port").unwrap(), "8080");
        assert_eq!(config.get_string("tcp_proxy", "host").unwrap(), "example.net");
    }

    #[test]
    fn test_names_compare_case_insensitively() {
        let (_file, config) = config_with("[TCP_Proxy]\n\"Port\"=\"9000\"\n");
        assert_eq!(config.get_int("tcp_proxy", "PORT").unwrap(), 9000);
    }

    #[test]
    fn test_comments_are_skipped() {
        let (_file, config) = config_with(
            "# leading comment\n\
             [tcp_proxy]\n\
             # \"port\"=\"1\"\n\
             \"port\"=\"2\"\n",
        );
        assert_eq!(config.get_int("tcp_proxy", "port").unwrap(), 2);
    }

    #[test]
    fn test_blank_line_ends_section() {
        let (_file, config) = config_with(
            "[tcp_proxy]\n\
             \"port\"=\"8080\"\n\
             \n\
             \"orphan\"=\"1\"\n",
        );
        assert!(matches!(
            config.get_string("tcp_proxy", "orphan"),
            Err(ConfigError::Missing { .. })
        ));
    }

    #[test]
    fn test_unbalanced_quotes_are_not_a_value() {
        let (_file, config) = config_with("[s]\n\"port=\"8080\"\n\"port\"=\"1\"\n");
        assert_eq!(config.get_int("s", "port").unwrap(), 1);
    }

    #[test]
    fn test_get_bool() {
        let (_file, config) = config_with("[s]\n\"a\"=\"True\"\n\"b\"=\"FALSE\"\n\"c\"=\"yes\"\n");
        assert!(config.get_bool("s", "a").unwrap());
        assert!(!config.get_bool("s", "b").unwrap());
        assert!(matches!(config.get_bool("s", "c"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_enumerate_repeated_names() {
        let (_file, config) = config_with(
            "[tcp_proxy\\routes]\n\
             \"route\"=\"a\"\n\
             \"route\"=\"b\"\n\
             \"other\"=\"x\"\n\
             \"route\"=\"c\"\n",
        );
        let mut seen = Vec::new();
        let completed = config
            .enumerate("tcp_proxy\\routes", "route", |v| {
                seen.push(v.to_string());
                true
            })
            .unwrap();
        assert!(completed);
        assert_eq!(seen, ["a", "b", "c"]);
    }

    #[test]
    fn test_enumerate_visitor_abort() {
        let (_file, config) = config_with("[s]\n\"route\"=\"a\"\n\"route\"=\"b\"\n");
        let mut seen = Vec::new();
        let completed = config
            .enumerate("s", "route", |v| {
                seen.push(v.to_string());
                false
            })
            .unwrap();
        assert!(!completed);
        assert_eq!(seen, ["a"]);
    }

    #[test]
    fn test_has_section() {
        let (_file, config) = config_with("[tcp_proxy]\n\"port\"=\"1\"\n");
        assert!(config.has_section("TCP_PROXY").unwrap());
        assert!(!config.has_section("tcp_proxy\\routes").unwrap());
    }
}
