//! Golden output sizes recorded against a specific on-disk format version.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static MOUNT_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"mounting version (\d+\.\d+)").expect("version regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Baseline {
    pub name: &'static str,
    pub lines: usize,
    pub format_version: &'static str,
}

/// `list -b inodes` on a fresh 1 GiB filesystem.
pub const LIST_INODES_LINES: Baseline = Baseline {
    name: "LIST_INODES_LINES",
    lines: 67,
    format_version: "1.6",
};

/// `list -b dirents` on a fresh 1 GiB filesystem: the lost+found entry
/// plus the mount and recovery chatter.
pub const LIST_DIRENTS_LINES: Baseline = Baseline {
    name: "LIST_DIRENTS_LINES",
    lines: 6,
    format_version: "1.6",
};

/// On-disk version the utility announced while opening the filesystem.
pub fn reported_format_version(output: &str) -> Option<&str> {
    MOUNT_VERSION
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Why a line count left its baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    /// The utility reports a different format version: refresh the baseline.
    FormatChanged { reported: String },
    /// Same format version, different output: the utility's behaviour changed.
    Regression,
    /// The output carries no version line to compare against.
    Unknown,
}

impl Baseline {
    pub fn classify(&self, output: &str) -> Drift {
        match reported_format_version(output) {
            Some(v) if v == self.format_version => Drift::Regression,
            Some(v) => Drift::FormatChanged {
                reported: v.to_string(),
            },
            None => Drift::Unknown,
        }
    }
}

impl fmt::Display for Drift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Drift::FormatChanged { reported } => {
                write!(f, "format version is now {reported}; update the baseline")
            }
            Drift::Regression => write!(f, "format version unchanged; behavioural regression"),
            Drift::Unknown => write!(f, "format version not reported; cannot attribute"),
        }
    }
}
