//! Deterministic, sequence-number-keyed impairment rules.
//!
//! A forced rule says "always drop (corrupt, duplicate, hold back) the packet
//! with this sequence number".  Forced rules take precedence over the
//! probabilistic knobs of the channel, and they can be changed while the
//! router runs (see [`crate::control`]).
//!
//! Sequence lists use a small text syntax: comma-separated integers and
//! inclusive ranges, e.g. `"2,5-7"` for `{2, 5, 6, 7}`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// The four impairments that can be forced per sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImpairmentKind {
    Drop,
    Corrupt,
    Duplicate,
    Reorder,
}

impl ImpairmentKind {
    pub const ALL: [ImpairmentKind; 4] = [
        ImpairmentKind::Drop,
        ImpairmentKind::Corrupt,
        ImpairmentKind::Duplicate,
        ImpairmentKind::Reorder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ImpairmentKind::Drop => "drop",
            ImpairmentKind::Corrupt => "corrupt",
            ImpairmentKind::Duplicate => "dup",
            ImpairmentKind::Reorder => "reorder",
        }
    }
}

impl fmt::Display for ImpairmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImpairmentKind {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(ImpairmentKind::Drop),
            "corrupt" => Ok(ImpairmentKind::Corrupt),
            "dup" | "duplicate" => Ok(ImpairmentKind::Duplicate),
            "reorder" => Ok(ImpairmentKind::Reorder),
            other => Err(RuleError::UnknownKind(other.to_string())),
        }
    }
}

/// Errors from parsing rule kinds and sequence lists.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("unknown impairment kind {0:?} (expected drop, corrupt, dup or reorder)")]
    UnknownKind(String),
    #[error("invalid sequence number {0:?}")]
    InvalidNumber(String),
    #[error("sequence number {0} does not fit in 16 bits")]
    OutOfRange(u64),
    #[error("range {start}-{end} is reversed")]
    ReversedRange { start: u16, end: u16 },
}

/// Parse `"2,5-7"` into `{2, 5, 6, 7}`.
///
/// Whitespace around items is ignored and empty items are skipped, so `""`
/// yields the empty set.
pub fn parse_seq_list(list: &str) -> Result<BTreeSet<u16>, RuleError> {
    let mut out = BTreeSet::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.split_once('-') {
            Some((start, end)) => {
                let start = parse_seq(start)?;
                let end = parse_seq(end)?;
                if start > end {
                    return Err(RuleError::ReversedRange { start, end });
                }
                out.extend(start..=end);
            }
            None => {
                out.insert(parse_seq(item)?);
            }
        }
    }
    Ok(out)
}

fn parse_seq(s: &str) -> Result<u16, RuleError> {
    let s = s.trim();
    let n: u64 = s
        .parse()
        .map_err(|_| RuleError::InvalidNumber(s.to_string()))?;
    u16::try_from(n).map_err(|_| RuleError::OutOfRange(n))
}

/// Render a set compactly, collapsing consecutive runs into ranges.
pub fn format_seq_list(set: &BTreeSet<u16>) -> String {
    let mut parts = Vec::new();
    let mut iter = set.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end.wrapping_add(1))) && end != u16::MAX {
            end = iter.next().unwrap_or(end);
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(",")
}

// ---------------------------------------------------------------------------
// ForcedRules
// ---------------------------------------------------------------------------

/// The four forced rule sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForcedRules {
    pub drop: BTreeSet<u16>,
    pub corrupt: BTreeSet<u16>,
    pub duplicate: BTreeSet<u16>,
    pub reorder: BTreeSet<u16>,
    /// Consume a rule the first time it fires.
    pub once: bool,
}

impl ForcedRules {
    pub fn get(&self, kind: ImpairmentKind) -> &BTreeSet<u16> {
        match kind {
            ImpairmentKind::Drop => &self.drop,
            ImpairmentKind::Corrupt => &self.corrupt,
            ImpairmentKind::Duplicate => &self.duplicate,
            ImpairmentKind::Reorder => &self.reorder,
        }
    }

    fn get_mut(&mut self, kind: ImpairmentKind) -> &mut BTreeSet<u16> {
        match kind {
            ImpairmentKind::Drop => &mut self.drop,
            ImpairmentKind::Corrupt => &mut self.corrupt,
            ImpairmentKind::Duplicate => &mut self.duplicate,
            ImpairmentKind::Reorder => &mut self.reorder,
        }
    }

    pub fn add(&mut self, kind: ImpairmentKind, seqs: &BTreeSet<u16>) {
        self.get_mut(kind).extend(seqs.iter().copied());
    }

    pub fn remove(&mut self, kind: ImpairmentKind, seqs: &BTreeSet<u16>) {
        let set = self.get_mut(kind);
        for seq in seqs {
            set.remove(seq);
        }
    }

    pub fn set(&mut self, kind: ImpairmentKind, seqs: BTreeSet<u16>) {
        *self.get_mut(kind) = seqs;
    }

    pub fn clear(&mut self, kind: ImpairmentKind) {
        self.get_mut(kind).clear();
    }

    pub fn clear_all(&mut self) {
        for kind in ImpairmentKind::ALL {
            self.clear(kind);
        }
    }

    pub fn contains(&self, kind: ImpairmentKind, seq: u16) -> bool {
        self.get(kind).contains(&seq)
    }

    /// Membership test used by the channel: `true` if the rule fires.
    ///
    /// With [`ForcedRules::once`] set, a firing rule is removed.
    pub fn take(&mut self, kind: ImpairmentKind, seq: u16) -> bool {
        if self.once {
            self.get_mut(kind).remove(&seq)
        } else {
            self.contains(kind, seq)
        }
    }

    pub fn is_empty(&self) -> bool {
        ImpairmentKind::ALL.iter().all(|k| self.get(*k).is_empty())
    }
}

impl fmt::Display for ForcedRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, kind) in ImpairmentKind::ALL.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            let set = self.get(*kind);
            if set.is_empty() {
                write!(f, "{kind}=[]")?;
            } else {
                write!(f, "{kind}=[{}]", format_seq_list(set))?;
            }
        }
        Ok(())
    }
}
