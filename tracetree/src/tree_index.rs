//! Tree indices: slash-delimited integer paths identifying a span within
//! its trace.
use std::error::Error;
use std::fmt;
use std::str::FromStr;

/// A path from the root span (`"0"`) down to some descendant
/// (`"0/2/1"`), matching insertion order depth-first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TreeIndex(Vec<u32>);

impl TreeIndex {
    /// The index of the root span.
    pub fn root() -> TreeIndex {
        TreeIndex(vec![0])
    }

    /// Returns the index of the `k`th child placeholder under `self`.
    pub fn child(&self, k: u32) -> TreeIndex {
        let mut path = self.0.clone();
        path.push(k);
        TreeIndex(path)
    }

    /// Returns `true` if `other` is this index or a descendant of it.
    pub fn is_ancestor_of(&self, other: &TreeIndex) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Returns the parent index, or `None` if this is the root.
    pub fn parent(&self) -> Option<TreeIndex> {
        if self.0.len() <= 1 {
            return None;
        }
        Some(TreeIndex(self.0[..self.0.len() - 1].to_vec()))
    }

    /// The path segments, root first.
    pub fn segments(&self) -> &[u32] {
        &self.0
    }

    /// The depth of this index (the root is depth 0).
    pub fn depth(&self) -> usize {
        self.0.len() - 1
    }
}

impl fmt::Display for TreeIndex {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.0 {
            if !first {
                fmt.write_str("/")?;
            }
            first = false;
            write!(fmt, "{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for TreeIndex {
    type Err = TreeIndexParseError;

    fn from_str(s: &str) -> Result<TreeIndex, TreeIndexParseError> {
        if s.is_empty() {
            return Err(TreeIndexParseError(()));
        }
        let mut path = Vec::new();
        for segment in s.split('/') {
            path.push(segment.parse().map_err(|_| TreeIndexParseError(()))?);
        }
        Ok(TreeIndex(path))
    }
}

/// The error returned when a string is not a valid `TreeIndex`.
#[derive(Debug)]
pub struct TreeIndexParseError(());

impl fmt::Display for TreeIndexParseError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("invalid tree index")
    }
}

impl Error for TreeIndexParseError {}
