//! Store paths.
//!
//! A path is a sequence of segments from a root down to a value. It can be
//! given presplit, or as a string using `.` between object keys and `[..]`
//! for indices or keys that contain dots: `modules.a.deps[0]`,
//! `modules["/srv/mods/a.rs"].active`.

use std::fmt;

use super::error::{StoreError, StoreResult};

/// A parsed, root-relative path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath(Vec<String>);

impl StorePath {
    /// The empty path, addressing a root itself.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse the string form of a path.
    pub fn parse(raw: &str) -> StoreResult<Self> {
        let invalid = |reason: &str| StoreError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut current = String::new();
        let mut after_bracket = false;
        let mut pending_dot = false;
        let mut chars = raw.chars();

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if current.is_empty() && !after_bracket {
                        return Err(invalid("empty segment"));
                    }
                    if !current.is_empty() {
                        segments.push(std::mem::take(&mut current));
                    }
                    after_bracket = false;
                    pending_dot = true;
                }
                '[' => {
                    if pending_dot {
                        return Err(invalid("`[` cannot follow `.`"));
                    }
                    if !current.is_empty() {
                        segments.push(std::mem::take(&mut current));
                    }
                    let mut inner = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        inner.push(c);
                    }
                    if !closed {
                        return Err(invalid("unclosed `[`"));
                    }
                    let inner = strip_quotes(&inner);
                    if inner.is_empty() {
                        return Err(invalid("empty segment"));
                    }
                    segments.push(inner.to_string());
                    after_bracket = true;
                }
                ']' => return Err(invalid("unmatched `]`")),
                c => {
                    if after_bracket {
                        return Err(invalid("expected `.` or `[` after `]`"));
                    }
                    current.push(c);
                    pending_dot = false;
                }
            }
        }

        if pending_dot {
            return Err(invalid("trailing `.`"));
        }
        if !current.is_empty() {
            segments.push(current);
        }
        Ok(Self(segments))
    }

    /// Build a path from presplit segments. Segments are taken verbatim.
    pub fn from_segments<I, S>(segments: I) -> StoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(StoreError::InvalidPath {
                path: format!("{segments:?}"),
                reason: "empty segment".to_string(),
            });
        }
        Ok(Self(segments))
    }

    /// Segments taken from existing store keys, which are already valid.
    pub(crate) fn from_keys(segments: Vec<String>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn push(&mut self, segment: impl Into<String>) {
        self.0.push(segment.into());
    }

    /// This path extended by one segment.
    pub fn join(&self, segment: impl Into<String>) -> Self {
        let mut joined = self.clone();
        joined.push(segment);
        joined
    }

    /// This path followed by every segment of `tail`.
    pub fn concat(&self, tail: &StorePath) -> Self {
        let mut joined = self.clone();
        joined.0.extend(tail.0.iter().cloned());
        joined
    }

    /// Whether `self` is a (non-strict) prefix of `other`.
    pub fn is_prefix_of(&self, other: &StorePath) -> bool {
        other.0.starts_with(&self.0)
    }

    pub fn into_segments(self) -> Vec<String> {
        self.0
    }
}

fn strip_quotes(inner: &str) -> &str {
    let bytes = inner.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &inner[1..inner.len() - 1];
        }
    }
    inner
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            let plain = !segment.contains(['.', '[', ']']);
            if plain && segment.parse::<usize>().is_err() {
                if i > 0 {
                    write!(f, ".")?;
                }
                write!(f, "{segment}")?;
            } else if plain {
                write!(f, "[{segment}]")?;
            } else {
                write!(f, "[\"{segment}\"]")?;
            }
        }
        Ok(())
    }
}

/// Anything a store operation accepts as a path.
pub trait IntoStorePath {
    fn into_store_path(self) -> StoreResult<StorePath>;
}

impl IntoStorePath for StorePath {
    fn into_store_path(self) -> StoreResult<StorePath> {
        Ok(self)
    }
}

impl IntoStorePath for &StorePath {
    fn into_store_path(self) -> StoreResult<StorePath> {
        Ok(self.clone())
    }
}

impl IntoStorePath for &str {
    fn into_store_path(self) -> StoreResult<StorePath> {
        StorePath::parse(self)
    }
}

impl IntoStorePath for &String {
    fn into_store_path(self) -> StoreResult<StorePath> {
        StorePath::parse(self)
    }
}

impl IntoStorePath for String {
    fn into_store_path(self) -> StoreResult<StorePath> {
        StorePath::parse(&self)
    }
}

impl IntoStorePath for Vec<String> {
    fn into_store_path(self) -> StoreResult<StorePath> {
        StorePath::from_segments(self)
    }
}

impl IntoStorePath for Vec<&str> {
    fn into_store_path(self) -> StoreResult<StorePath> {
        StorePath::from_segments(self)
    }
}

impl IntoStorePath for &[&str] {
    fn into_store_path(self) -> StoreResult<StorePath> {
        StorePath::from_segments(self.iter().copied())
    }
}

impl IntoStorePath for &[String] {
    fn into_store_path(self) -> StoreResult<StorePath> {
        StorePath::from_segments(self.iter().cloned())
    }
}

impl<const N: usize> IntoStorePath for [&str; N] {
    fn into_store_path(self) -> StoreResult<StorePath> {
        StorePath::from_segments(self)
    }
}

impl<const N: usize> IntoStorePath for &[&str; N] {
    fn into_store_path(self) -> StoreResult<StorePath> {
        StorePath::from_segments(self.iter().copied())
    }
}
