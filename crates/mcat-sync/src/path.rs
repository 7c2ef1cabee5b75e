use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// 1-based segment lookup; `level(1)` is the top-level field.
    pub fn level(&self, n: usize) -> Option<&str> {
        n.checked_sub(1)
            .and_then(|i| self.0.get(i))
            .map(String::as_str)
    }

    pub fn joined(&self) -> String {
        self.0.join(".")
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("empty path pattern")]
    Empty,
    #[error("empty segment in path pattern {0:?}")]
    EmptySegment(String),
    #[error("`**` may only end a path pattern: {0:?}")]
    MisplacedPrefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
}

/// Literal segments match exactly, `*` matches any single segment, and a
/// trailing `**` matches the prefix itself plus anything beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
    prefix: bool,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PatternError::Empty);
        }
        let parts: Vec<&str> = trimmed.split('.').collect();
        let mut segments = Vec::with_capacity(parts.len());
        let mut prefix = false;
        for (i, part) in parts.iter().enumerate() {
            match *part {
                "" => return Err(PatternError::EmptySegment(trimmed.to_string())),
                "**" if i + 1 == parts.len() => prefix = true,
                "**" => return Err(PatternError::MisplacedPrefix(trimmed.to_string())),
                "*" => segments.push(Segment::Any),
                literal => segments.push(Segment::Literal(literal.to_string())),
            }
        }
        Ok(Self {
            raw: trimmed.to_string(),
            segments,
            prefix,
        })
    }

    pub fn exact(segments: &[&str]) -> Self {
        Self {
            raw: segments.join("."),
            segments: segments
                .iter()
                .map(|s| Segment::Literal((*s).to_string()))
                .collect(),
            prefix: false,
        }
    }

    pub fn prefix(segments: &[&str]) -> Self {
        let mut pattern = Self::exact(segments);
        pattern.raw = if segments.is_empty() {
            "**".to_string()
        } else {
            format!("{}.**", pattern.raw)
        };
        pattern.prefix = true;
        pattern
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches<S: AsRef<str>>(&self, path: &[S]) -> bool {
        let length_ok = if self.prefix {
            path.len() >= self.segments.len()
        } else {
            path.len() == self.segments.len()
        };
        length_ok
            && self
                .segments
                .iter()
                .zip(path)
                .all(|(segment, part)| match segment {
                    Segment::Any => true,
                    Segment::Literal(lit) => lit == part.as_ref(),
                })
    }

    pub fn matches_dotted(&self, path: &str) -> bool {
        if path.is_empty() {
            return self.matches::<&str>(&[]);
        }
        let parts: Vec<&str> = path.split('.').collect();
        self.matches(&parts)
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        let segments = path.segments();
        (1..=segments.len()).any(|n| self.matches(&segments[..n]))
    }
}

impl TryFrom<String> for PathPattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PathPattern> for String {
    fn from(value: PathPattern) -> Self {
        value.raw
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
