//! Domain models shared by switch plugins and their callers.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on the number of hosts a single host expression may expand to.
pub const MAX_HOSTLIST_EXPANSION: usize = 65_536;

/// How processes are laid out over the nodes of a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementMode {
    /// Consecutive ranks fill one node before moving to the next.
    #[default]
    Block,
    /// Ranks are dealt round-robin over the nodes.
    Cyclic,
}

impl fmt::Display for PlacementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => f.write_str("block"),
            Self::Cyclic => f.write_str("cyclic"),
        }
    }
}

/// Static identification of a plugin implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginInfo {
    /// Human-readable description.
    pub name: &'static str,
    /// `<application>/<method>`, e.g. `switch/elan`.
    pub plugin_type: &'static str,
    /// Plugin interface version.
    pub version: u32,
}

/// Identity of one task within a step, as seen by `job_attach`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskIdentity {
    /// Relative node index of the task's node within the step.
    pub node_id: u32,
    /// Global process index of the task.
    pub proc_id: u32,
    /// Number of nodes in the step.
    pub node_count: u32,
    /// Number of processes in the step.
    pub proc_count: u32,
    /// Rank of the task.
    pub rank: u32,
}

/// Errors from parsing a compressed host expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostListError {
    #[error("unbalanced brackets in host expression '{0}'")]
    UnbalancedBrackets(String),

    #[error("invalid range '{0}' in host expression")]
    InvalidRange(String),

    #[error("host expression expands to more than {MAX_HOSTLIST_EXPANSION} hosts")]
    TooLarge,
}

/// Ordered list of host names participating in a step.
///
/// Duplicates are kept: resolution treats the result as a set, but failure
/// reporting still refers to each input host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostList(Vec<String>);

impl HostList {
    /// Expand a compressed host expression such as `n[1-3,7],login0`.
    ///
    /// Numeric ranges keep the zero padding of their lower bound, so
    /// `c[08-10]` yields `c08 c09 c10`.
    ///
    /// # Errors
    ///
    /// Returns [`HostListError`] on unbalanced brackets, malformed ranges, or
    /// when the expansion would exceed [`MAX_HOSTLIST_EXPANSION`] hosts.
    pub fn parse(expr: &str) -> Result<Self, HostListError> {
        let mut hosts = Vec::new();
        for token in split_top_level(expr)? {
            expand_token(token, &mut hosts)?;
        }
        Ok(Self(hosts))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for HostList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl From<Vec<String>> for HostList {
    fn from(hosts: Vec<String>) -> Self {
        Self(hosts)
    }
}

fn split_top_level(expr: &str) -> Result<Vec<&str>, HostListError> {
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in expr.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| HostListError::UnbalancedBrackets(expr.to_owned()))?;
            }
            ',' | ' ' if depth == 0 => {
                tokens.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(HostListError::UnbalancedBrackets(expr.to_owned()));
    }
    tokens.push(&expr[start..]);
    Ok(tokens.into_iter().filter(|t| !t.is_empty()).collect())
}

fn expand_token(token: &str, out: &mut Vec<String>) -> Result<(), HostListError> {
    let Some(open) = token.find('[') else {
        push_host(out, token.to_owned())?;
        return Ok(());
    };
    let close = token
        .find(']')
        .filter(|&c| c > open)
        .ok_or_else(|| HostListError::UnbalancedBrackets(token.to_owned()))?;
    let prefix = &token[..open];
    let suffix = &token[close + 1..];
    if suffix.contains('[') {
        return Err(HostListError::UnbalancedBrackets(token.to_owned()));
    }

    for range in token[open + 1..close].split(',') {
        let (lo, hi) = range.split_once('-').unwrap_or((range, range));
        let invalid = || HostListError::InvalidRange(range.to_owned());
        let lo_n: u64 = lo.parse().map_err(|_| invalid())?;
        let hi_n: u64 = hi.parse().map_err(|_| invalid())?;
        if hi_n < lo_n {
            return Err(invalid());
        }
        let width = lo.len();
        for n in lo_n..=hi_n {
            push_host(out, format!("{prefix}{n:0width$}{suffix}"))?;
        }
    }
    Ok(())
}

fn push_host(out: &mut Vec<String>, host: String) -> Result<(), HostListError> {
    if out.len() >= MAX_HOSTLIST_EXPANSION {
        return Err(HostListError::TooLarge);
    }
    out.push(host);
    Ok(())
}

/// Fixed-capacity set of hardware node IDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawNodeBitmap")]
pub struct NodeBitmap {
    capacity: u32,
    words: Vec<u64>,
}

#[derive(Deserialize)]
struct RawNodeBitmap {
    capacity: u32,
    words: Vec<u64>,
}

impl TryFrom<RawNodeBitmap> for NodeBitmap {
    type Error = String;

    fn try_from(raw: RawNodeBitmap) -> Result<Self, Self::Error> {
        if raw.words.len() != word_count(raw.capacity) {
            return Err(format!(
                "bitmap of capacity {} carries {} words",
                raw.capacity,
                raw.words.len()
            ));
        }
        let bitmap = Self {
            capacity: raw.capacity,
            words: raw.words,
        };
        if bitmap.last().is_some_and(|id| id >= bitmap.capacity) {
            return Err("bitmap has bits set beyond its capacity".to_owned());
        }
        Ok(bitmap)
    }
}

fn word_count(capacity: u32) -> usize {
    capacity.div_ceil(64) as usize
}

impl NodeBitmap {
    /// Empty bitmap able to hold node IDs `0..capacity`.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            words: vec![0; word_count(capacity)],
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Set `id`. Returns `false` when `id` is outside the capacity.
    pub fn set(&mut self, id: u32) -> bool {
        if id >= self.capacity {
            return false;
        }
        self.words[(id >> 6) as usize] |= 1 << (id & 63);
        true
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        id < self.capacity && self.words[(id >> 6) as usize] & (1 << (id & 63)) != 0
    }

    /// Number of set bits.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Lowest set node ID.
    #[must_use]
    pub fn first(&self) -> Option<u32> {
        self.iter().next()
    }

    /// Highest set node ID.
    #[must_use]
    pub fn last(&self) -> Option<u32> {
        let (index, word) = self
            .words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, w)| **w != 0)?;
        let index = u32::try_from(index).ok()?;
        Some((index << 6) + 63 - word.leading_zeros())
    }

    /// Set node IDs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().zip(0u32..).flat_map(|(&word, i)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros();
                rest &= rest - 1;
                Some((i << 6) + bit)
            })
        })
    }
}

impl fmt::Display for NodeBitmap {
    /// Compressed range form, e.g. `0-3,7`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids = self.iter().peekable();
        let mut first = true;
        while let Some(lo) = ids.next() {
            let mut hi = lo;
            while ids.peek() == Some(&(hi + 1)) {
                hi += 1;
                ids.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if lo == hi {
                write!(f, "{lo}")?;
            } else {
                write!(f, "{lo}-{hi}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_ranged_hosts() {
        let hosts = HostList::parse("n[1-3,7],login0").unwrap();
        let names: Vec<&str> = hosts.iter().collect();
        assert_eq!(names, ["n1", "n2", "n3", "n7", "login0"]);
    }

    #[test]
    fn keeps_zero_padding() {
        let hosts = HostList::parse("c[08-10]-ib").unwrap();
        let names: Vec<&str> = hosts.iter().collect();
        assert_eq!(names, ["c08-ib", "c09-ib", "c10-ib"]);
    }

    #[test]
    fn rejects_bad_expressions() {
        assert!(matches!(
            HostList::parse("n[1-3"),
            Err(HostListError::UnbalancedBrackets(_))
        ));
        assert!(matches!(
            HostList::parse("n[3-1]"),
            Err(HostListError::InvalidRange(_))
        ));
        assert!(matches!(
            HostList::parse("n[0-70000]"),
            Err(HostListError::TooLarge)
        ));
    }

    #[test]
    fn bitmap_set_and_query() {
        let mut bitmap = NodeBitmap::new(130);
        assert!(bitmap.is_empty());
        assert!(bitmap.set(0));
        assert!(bitmap.set(64));
        assert!(bitmap.set(129));
        assert!(!bitmap.set(130));
        assert_eq!(bitmap.count(), 3);
        assert!(bitmap.contains(64));
        assert!(!bitmap.contains(63));
        assert_eq!(bitmap.first(), Some(0));
        assert_eq!(bitmap.last(), Some(129));
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), [0, 64, 129]);
    }

    #[test]
    fn bitmap_display_compresses_runs() {
        let mut bitmap = NodeBitmap::new(16);
        for id in [0, 1, 2, 3, 7, 9, 10] {
            bitmap.set(id);
        }
        assert_eq!(bitmap.to_string(), "0-3,7,9-10");
    }

    #[test]
    fn bitmap_deserialize_rejects_wrong_word_count() {
        let raw = postcard::to_allocvec(&(8u32, vec![0u64, 0u64])).unwrap();
        assert!(postcard::from_bytes::<NodeBitmap>(&raw).is_err());
    }

    #[test]
    fn bitmap_deserialize_rejects_bits_past_capacity() {
        let raw = postcard::to_allocvec(&(8u32, vec![1u64 << 9])).unwrap();
        assert!(postcard::from_bytes::<NodeBitmap>(&raw).is_err());

        let raw = postcard::to_allocvec(&(8u32, vec![1u64 << 3])).unwrap();
        let bitmap = postcard::from_bytes::<NodeBitmap>(&raw).unwrap();
        assert!(bitmap.contains(3));
    }
}
