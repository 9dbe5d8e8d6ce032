use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Error;

/// A value in an MIT profile: a plain string or a nested `{ ... }` group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProfileValue {
    String(String),
    Group(Vec<(String, ProfileValue)>),
}

impl ProfileValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            Self::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&[(String, ProfileValue)]> {
        match self {
            Self::Group(relations) => Some(relations),
            Self::String(_) => None,
        }
    }
}

/// Parsed `krb5.conf`.
///
/// `include` and `includedir` directives are recorded but not followed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Krb5Config {
    path: PathBuf,
    sections: BTreeMap<String, Vec<(String, ProfileValue)>>,
    includes: Vec<PathBuf>,
}

impl Krb5Config {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| {
            Error::KerberosConfigUnreadable {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let config = Self::parse(path, &text)?;
        debug!(
            path = %path.display(),
            sections = config.sections.len(),
            default_realm = config.default_realm().unwrap_or(""),
            "loaded kerberos configuration"
        );
        Ok(config)
    }

    pub fn parse(path: &Path, text: &str) -> crate::Result<Self> {
        Parser::new(path).parse(text)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn includes(&self) -> &[PathBuf] {
        &self.includes
    }

    pub fn section(&self, name: &str) -> Option<&[(String, ProfileValue)]> {
        self.sections.get(name).map(Vec::as_slice)
    }

    /// First string value for `name` in `section`.
    pub fn get(&self, section: &str, name: &str) -> Option<&str> {
        self.section(section)?
            .iter()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| value.as_str())
    }

    pub fn default_realm(&self) -> Option<&str> {
        self.get("libdefaults", "default_realm")
    }

    pub fn realm_kdcs(&self, realm: &str) -> Vec<&str> {
        let Some(relations) = self
            .section("realms")
            .and_then(|realms| realms.iter().find(|(name, _)| name == realm))
            .and_then(|(_, value)| value.as_group())
        else {
            return Vec::new();
        };
        relations
            .iter()
            .filter(|(key, _)| key == "kdc")
            .filter_map(|(_, value)| value.as_str())
            .collect()
    }

    pub fn has_realm(&self, realm: &str) -> bool {
        self.section("realms")
            .is_some_and(|realms| realms.iter().any(|(name, _)| name == realm))
    }
}

struct Parser<'a> {
    path: &'a Path,
    config: Krb5Config,
    current_section: Option<String>,
    // Open groups: (relation name, relations collected so far, opening line).
    stack: Vec<(String, Vec<(String, ProfileValue)>, usize)>,
}

impl<'a> Parser<'a> {
    fn new(path: &'a Path) -> Self {
        Self {
            path,
            config: Krb5Config {
                path: path.to_path_buf(),
                ..Krb5Config::default()
            },
            current_section: None,
            stack: Vec::new(),
        }
    }

    fn error(&self, line: usize, message: impl Into<String>) -> Error {
        Error::KerberosConfigMalformed {
            path: self.path.to_path_buf(),
            line,
            message: message.into(),
        }
    }

    fn parse(mut self, text: &str) -> crate::Result<Krb5Config> {
        for (index, raw_line) in text.lines().enumerate() {
            let line_number = index + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if self.stack.is_empty() {
                if let Some(target) = line.strip_prefix("includedir ") {
                    self.config.includes.push(PathBuf::from(target.trim()));
                    continue;
                }
                if let Some(target) = line.strip_prefix("include ") {
                    self.config.includes.push(PathBuf::from(target.trim()));
                    continue;
                }
            }

            if line.starts_with('[') {
                if !self.stack.is_empty() {
                    return Err(self.error(line_number, "section header inside an open group"));
                }
                let header = line.trim_end_matches('*').trim_end();
                let Some(name) = header
                    .strip_prefix('[')
                    .and_then(|rest| rest.strip_suffix(']'))
                else {
                    return Err(self.error(line_number, "unterminated section header"));
                };
                let name = name.trim();
                if name.is_empty() {
                    return Err(self.error(line_number, "empty section name"));
                }
                self.config.sections.entry(name.to_owned()).or_default();
                self.current_section = Some(name.to_owned());
                continue;
            }

            if line.trim_end_matches('*').trim_end() == "}" {
                let Some((name, relations, _)) = self.stack.pop() else {
                    return Err(self.error(line_number, "unmatched closing brace"));
                };
                self.push_relation(line_number, name, ProfileValue::Group(relations))?;
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(self.error(line_number, "expected `name = value`"));
            };
            let key = key.trim().trim_end_matches('*').trim_end();
            if key.is_empty() {
                return Err(self.error(line_number, "relation without a name"));
            }
            if self.current_section.is_none() {
                return Err(self.error(line_number, "relation outside of a section"));
            }

            let value = value.trim();
            if value == "{" {
                self.stack.push((key.to_owned(), Vec::new(), line_number));
                continue;
            }
            let value = unquote(value);
            self.push_relation(line_number, key.to_owned(), ProfileValue::String(value))?;
        }

        if let Some((name, _, opened_at)) = self.stack.last() {
            return Err(self.error(*opened_at, format!("group `{name}` is never closed")));
        }
        Ok(self.config)
    }

    fn push_relation(
        &mut self,
        line_number: usize,
        key: String,
        value: ProfileValue,
    ) -> crate::Result<()> {
        if let Some((_, relations, _)) = self.stack.last_mut() {
            relations.push((key, value));
            return Ok(());
        }
        let Some(section) = self.current_section.as_ref() else {
            return Err(self.error(line_number, "relation outside of a section"));
        };
        self.config
            .sections
            .entry(section.clone())
            .or_default()
            .push((key, value));
        Ok(())
    }
}

fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    else {
        return value.to_owned();
    };

    let mut unquoted = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            unquoted.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => unquoted.push('\n'),
            Some('t') => unquoted.push('\t'),
            Some('b') => unquoted.push('\u{8}'),
            Some(other) => unquoted.push(other),
            None => unquoted.push('\\'),
        }
    }
    unquoted
}
