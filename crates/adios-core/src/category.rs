//! Operation categories and per-category tables.
//!
//! Every tunable, latency model and batch sub-queue is indexed by the closed
//! [`OpCategory`] enumeration. [`PerCategory`] is the fixed table type used
//! for all of them.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of operation categories.
pub const NUM_CATEGORIES: usize = 4;

/// Coarse classification of an I/O operation.
///
/// Declaration order is also the dispatch priority within a batch page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpCategory {
    /// Latency-sensitive reads.
    Read = 0,
    /// Throughput-oriented writes.
    Write = 1,
    /// Bulk discard/trim.
    Discard = 2,
    /// Everything else (flushes and other control operations).
    Other = 3,
}

impl OpCategory {
    /// All categories in dispatch priority order.
    pub const ALL: [OpCategory; NUM_CATEGORIES] = [
        OpCategory::Read,
        OpCategory::Write,
        OpCategory::Discard,
        OpCategory::Other,
    ];

    /// Returns the index for array access (0-3).
    #[inline]
    pub fn as_index(&self) -> usize {
        *self as usize
    }

    /// Lowercase name used in attribute and config keys.
    pub fn name(&self) -> &'static str {
        match self {
            OpCategory::Read => "read",
            OpCategory::Write => "write",
            OpCategory::Discard => "discard",
            OpCategory::Other => "other",
        }
    }
}

impl fmt::Display for OpCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpCategory::Read => write!(f, "Read"),
            OpCategory::Write => write!(f, "Write"),
            OpCategory::Discard => write!(f, "Discard"),
            OpCategory::Other => write!(f, "Other"),
        }
    }
}

impl FromStr for OpCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(OpCategory::Read),
            "write" => Ok(OpCategory::Write),
            "discard" => Ok(OpCategory::Discard),
            "other" => Ok(OpCategory::Other),
            _ => Err(format!("unknown operation category: {}", s)),
        }
    }
}

/// A value per operation category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerCategory<T> {
    /// Value for [`OpCategory::Read`].
    pub read: T,
    /// Value for [`OpCategory::Write`].
    pub write: T,
    /// Value for [`OpCategory::Discard`].
    pub discard: T,
    /// Value for [`OpCategory::Other`].
    pub other: T,
}

impl<T> PerCategory<T> {
    /// Builds a table by evaluating `f` for each category.
    pub fn from_fn(mut f: impl FnMut(OpCategory) -> T) -> Self {
        Self {
            read: f(OpCategory::Read),
            write: f(OpCategory::Write),
            discard: f(OpCategory::Discard),
            other: f(OpCategory::Other),
        }
    }

    /// Iterates `(category, value)` pairs in priority order.
    pub fn iter(&self) -> impl Iterator<Item = (OpCategory, &T)> {
        OpCategory::ALL.into_iter().map(move |c| (c, &self[c]))
    }
}

impl<T> Index<OpCategory> for PerCategory<T> {
    type Output = T;

    fn index(&self, category: OpCategory) -> &T {
        match category {
            OpCategory::Read => &self.read,
            OpCategory::Write => &self.write,
            OpCategory::Discard => &self.discard,
            OpCategory::Other => &self.other,
        }
    }
}

impl<T> IndexMut<OpCategory> for PerCategory<T> {
    fn index_mut(&mut self, category: OpCategory) -> &mut T {
        match category {
            OpCategory::Read => &mut self.read,
            OpCategory::Write => &mut self.write,
            OpCategory::Discard => &mut self.discard,
            OpCategory::Other => &mut self.other,
        }
    }
}
