use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The closed set of operations the broker can perform against the
/// container runtime. Anything else does not exist at this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Start,
    Stop,
    Inspect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Start => write!(f, "start"),
            Operation::Stop => write!(f, "stop"),
            Operation::Inspect => write!(f, "inspect"),
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "start" => Ok(Operation::Start),
            "stop" => Ok(Operation::Stop),
            "inspect" => Ok(Operation::Inspect),
            _ => Err(format!("unknown operation: {s}")),
        }
    }
}

#[derive(Debug, Clone)]
struct AllowlistEntry {
    pattern: Regex,
    ops: Vec<Operation>,
}

/// The fixed set of container name patterns and operations this broker may
/// act on. Parsed once at startup; immutable for the process lifetime.
///
/// Config format: `pattern:op,op;pattern:op`, e.g.
/// `web[0-9]+:start,stop,inspect;cache-.*:inspect`. Patterns are anchored:
/// `web1` matches `web1`, never `web10`.
#[derive(Debug, Clone)]
pub struct Allowlist {
    entries: Vec<AllowlistEntry>,
}

impl Allowlist {
    /// True when `name` matches an entry that allows `op`. Pure function,
    /// no I/O, no allocation on the hot path.
    pub fn permits(&self, name: &str, op: Operation) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.ops.contains(&op) && entry.pattern.is_match(name))
    }
}

impl std::str::FromStr for Allowlist {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut entries = Vec::new();
        for part in s.split(';').filter(|p| !p.trim().is_empty()) {
            let (raw_pattern, raw_ops) = part
                .split_once(':')
                .ok_or_else(|| format!("allowlist entry missing ':' separator: {part}"))?;
            let pattern = Regex::new(&format!("^(?:{})$", raw_pattern.trim()))
                .map_err(|e| format!("invalid allowlist pattern {raw_pattern}: {e}"))?;
            let ops = raw_ops
                .split(',')
                .map(str::parse)
                .collect::<Result<Vec<Operation>, _>>()?;
            if ops.is_empty() {
                return Err(format!("allowlist entry has no operations: {part}"));
            }
            entries.push(AllowlistEntry { pattern, ops });
        }
        if entries.is_empty() {
            return Err("allowlist must contain at least one entry".to_string());
        }
        Ok(Allowlist { entries })
    }
}
