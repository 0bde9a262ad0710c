//! Syntactic path handling: drive root, bucket, or object within a bucket.
//!
//! Parsing never touches the store; whether a path exists is the engine's
//! concern.

use crate::errors::{NavError, NavResult};
use std::fmt;

pub const DELIMITER: char = '/';

/// Derived classification of an [`ObjectPath`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Drive,
    Bucket,
    Object,
}

/// A drive-relative location.
///
/// `path` only ever contains `/` separators and is `None` for drive and
/// bucket references.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ObjectPath {
    bucket: Option<String>,
    path: Option<String>,
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

impl ObjectPath {
    pub fn drive() -> Self {
        Self::default()
    }

    pub fn bucket(name: impl Into<String>) -> Self {
        Self {
            bucket: Some(name.into()),
            path: None,
        }
    }

    /// Object path within `bucket`. An empty `path` yields a bucket reference.
    pub fn object(bucket: impl Into<String>, path: &str) -> Self {
        let normalized = path.replace('\\', "/");
        Self {
            bucket: Some(bucket.into()),
            path: (!normalized.is_empty()).then_some(normalized),
        }
    }

    /// Split `raw` on its first separator: the bucket before it, the object
    /// path after it. Leading separators address the drive root.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim_start_matches(is_separator);
        if trimmed.is_empty() {
            return Self::drive();
        }
        match trimmed.find(is_separator) {
            Some(pos) => Self::object(&trimmed[..pos], &trimmed[pos + 1..]),
            None => Self::bucket(trimmed),
        }
    }

    /// Inverse of [`ObjectPath::parse`]: `bucket/path`, `bucket`, or `""`.
    pub fn render(&self) -> String {
        match (&self.bucket, &self.path) {
            (None, _) => String::new(),
            (Some(bucket), None) => bucket.clone(),
            (Some(bucket), Some(path)) => format!("{bucket}/{path}"),
        }
    }

    pub fn kind(&self) -> PathKind {
        match (&self.bucket, &self.path) {
            (None, _) => PathKind::Drive,
            (Some(_), None) => PathKind::Bucket,
            (Some(_), Some(_)) => PathKind::Object,
        }
    }

    pub fn bucket_name(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    pub fn object_name(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Object path without any trailing delimiter.
    pub fn trimmed_name(&self) -> Option<&str> {
        self.path.as_deref().map(|p| p.trim_end_matches(DELIMITER))
    }

    /// Whether the caller signalled folder intent with a trailing `/`.
    pub fn has_folder_intent(&self) -> bool {
        self.path.as_deref().is_some_and(|p| p.ends_with(DELIMITER))
    }

    /// Listing prefix under which this path's children live: `""` for a
    /// bucket, `path/` for an object path.
    pub fn folder_prefix(&self) -> String {
        match self.trimmed_name() {
            Some(name) if !name.is_empty() => format!("{name}{DELIMITER}"),
            _ => String::new(),
        }
    }

    /// Same location with a trailing delimiter, as used for marker objects.
    pub fn as_folder(&self) -> Self {
        match &self.bucket {
            Some(bucket) if self.path.is_some() => Self::object(bucket.clone(), &self.folder_prefix()),
            _ => self.clone(),
        }
    }

    /// Child location `name` beneath this path.
    pub fn join(&self, name: &str) -> Self {
        match &self.bucket {
            None => Self::parse(name),
            Some(bucket) => Self::object(bucket.clone(), &format!("{}{name}", self.folder_prefix())),
        }
    }

    /// Enclosing location; the drive is its own parent.
    pub fn parent(&self) -> Self {
        match (&self.bucket, self.trimmed_name()) {
            (None, _) | (Some(_), None) => Self::drive(),
            (Some(bucket), Some(name)) => match name.rfind(DELIMITER) {
                Some(pos) => Self::object(bucket.clone(), &name[..=pos]),
                None => Self::bucket(bucket.clone()),
            },
        }
    }

    /// Last segment, without trailing delimiter.
    pub fn leaf(&self) -> &str {
        match (&self.bucket, self.trimmed_name()) {
            (None, _) => "",
            (Some(bucket), None) => bucket,
            (Some(_), Some(name)) => name.rsplit(DELIMITER).next().unwrap_or(name),
        }
    }

    /// Strip this path's folder prefix from `child_full_path`, an object name
    /// in the same bucket (or a bucket name when `self` is the drive).
    pub fn relative_child_path<'a>(&self, child_full_path: &'a str) -> NavResult<&'a str> {
        if self.bucket.is_none() {
            return Ok(child_full_path);
        }
        let prefix = self.folder_prefix();
        child_full_path
            .strip_prefix(prefix.as_str())
            .ok_or_else(|| NavError::InvalidRelation {
                parent: self.render(),
                child: child_full_path.to_string(),
            })
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for ObjectPath {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_classify_paths() {
        assert_eq!(ObjectPath::parse("").kind(), PathKind::Drive);
        assert_eq!(ObjectPath::parse("/").kind(), PathKind::Drive);
        assert_eq!(ObjectPath::parse("b").kind(), PathKind::Bucket);
        assert_eq!(ObjectPath::parse("b/").kind(), PathKind::Bucket);
        assert_eq!(ObjectPath::parse("b/x.txt").kind(), PathKind::Object);
    }

    #[test]
    fn test_should_normalize_backslashes() {
        let p = ObjectPath::parse("b\\dir\\y.txt");
        assert_eq!(p.bucket_name(), Some("b"));
        assert_eq!(p.object_name(), Some("dir/y.txt"));
        assert_eq!(p.render(), "b/dir/y.txt");
    }

    #[test]
    fn test_should_round_trip_parse_and_render() {
        for raw in [
            "", "b", "b/", "b/x", "b/dir/", "b\\dir\\y", "/b/x", "b//x", "b/a/b/c.txt",
        ] {
            let once = ObjectPath::parse(raw);
            assert_eq!(ObjectPath::parse(&once.render()), once, "input {raw:?}");
        }
    }

    #[test]
    fn test_should_keep_folder_intent() {
        let p = ObjectPath::parse("b/dir/");
        assert!(p.has_folder_intent());
        assert_eq!(p.trimmed_name(), Some("dir"));
        assert_eq!(p.folder_prefix(), "dir/");
    }

    #[test]
    fn test_should_compute_relative_child_path() {
        let parent = ObjectPath::parse("b/dir");
        assert_eq!(parent.relative_child_path("dir/y.txt").unwrap(), "y.txt");
        assert_eq!(
            ObjectPath::bucket("b").relative_child_path("x.txt").unwrap(),
            "x.txt"
        );
        let err = parent.relative_child_path("other/y.txt").unwrap_err();
        assert!(matches!(err, NavError::InvalidRelation { .. }));
    }

    #[test]
    fn test_should_navigate_parent_and_join() {
        let p = ObjectPath::parse("b/dir/sub/f.txt");
        assert_eq!(p.parent(), ObjectPath::parse("b/dir/sub/"));
        assert_eq!(p.leaf(), "f.txt");
        assert_eq!(ObjectPath::parse("b/x").parent(), ObjectPath::bucket("b"));
        assert_eq!(ObjectPath::bucket("b").parent(), ObjectPath::drive());
        assert_eq!(ObjectPath::parse("b/dir").join("y"), ObjectPath::parse("b/dir/y"));
        assert_eq!(ObjectPath::drive().join("b"), ObjectPath::bucket("b"));
    }
}
