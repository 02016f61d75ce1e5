//! Semantic versions and version ranges for plugin dependencies.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Dot-separated pre-release identifiers, empty for a release.
    pub pre: Vec<String>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: Vec::new(),
        }
    }

    pub fn is_prerelease(&self) -> bool {
        !self.pre.is_empty()
    }

    pub fn parse(input: &str) -> Result<Self, String> {
        let partial = Partial::parse(input)?;
        match (partial.minor, partial.patch) {
            (Some(minor), Some(patch)) => Ok(Self {
                major: partial.major,
                minor,
                patch,
                pre: partial.pre,
            }),
            _ => Err(format!(
                "'{}' is not a full semantic version (expected MAJOR.MINOR.PATCH)",
                input
            )),
        }
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.pre.is_empty() {
            write!(f, "-{}", self.pre.join("."))?;
        }
        Ok(())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| compare_pre(&self.pre, &other.pre))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Version::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn compare_pre(a: &[String], b: &[String]) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        // a release sorts above any of its pre-releases
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }

    for (left, right) in a.iter().zip(b.iter()) {
        let ordering = match (left.parse::<u64>(), right.parse::<u64>()) {
            (Ok(l), Ok(r)) => l.cmp(&r),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => left.cmp(right),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    a.len().cmp(&b.len())
}

/// A possibly incomplete version as written inside a range (`1`, `1.2`, `1.2.3-rc.1`).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Partial {
    major: u64,
    minor: Option<u64>,
    patch: Option<u64>,
    pre: Vec<String>,
}

impl Partial {
    fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Err("empty version".to_string());
        }

        let without_build = input.split('+').next().unwrap_or(input);
        let (core, pre) = match without_build.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (without_build, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() > 3 {
            return Err(format!("'{}' has too many version components", input));
        }

        let mut numbers = Vec::with_capacity(3);
        for part in &parts {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(format!("'{}' is not a valid version component in '{}'", part, input));
            }
            if part.len() > 1 && part.starts_with('0') {
                return Err(format!("'{}' has a leading zero in '{}'", part, input));
            }
            let value = part
                .parse::<u64>()
                .map_err(|e| format!("invalid version component '{}': {}", part, e))?;
            numbers.push(value);
        }

        let pre = match pre {
            Some(pre) => {
                let identifiers: Vec<String> = pre.split('.').map(str::to_string).collect();
                if identifiers.iter().any(|id| {
                    id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                }) {
                    return Err(format!("'{}' has an invalid pre-release tag", input));
                }
                identifiers
            }
            None => Vec::new(),
        };

        if !pre.is_empty() && numbers.len() < 3 {
            return Err(format!(
                "'{}' has a pre-release tag on an incomplete version",
                input
            ));
        }

        Ok(Self {
            major: numbers[0],
            minor: numbers.get(1).copied(),
            patch: numbers.get(2).copied(),
            pre,
        })
    }

    fn floor(&self) -> Version {
        Version {
            major: self.major,
            minor: self.minor.unwrap_or(0),
            patch: self.patch.unwrap_or(0),
            pre: self.pre.clone(),
        }
    }

    /// Exclusive upper bound of everything the written components cover.
    fn ceiling(&self) -> Version {
        match (self.minor, self.patch) {
            (None, _) => Version::new(self.major + 1, 0, 0),
            (Some(minor), None) => Version::new(self.major, minor + 1, 0),
            (Some(minor), Some(patch)) => Version::new(self.major, minor, patch + 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Exact,
    Greater,
    GreaterEq,
    Less,
    LessEq,
    Caret,
    Tilde,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparator {
    op: Op,
    version: Partial,
}

impl Comparator {
    fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        let (op, rest) = if let Some(rest) = input.strip_prefix(">=") {
            (Op::GreaterEq, rest)
        } else if let Some(rest) = input.strip_prefix("<=") {
            (Op::LessEq, rest)
        } else if let Some(rest) = input.strip_prefix('>') {
            (Op::Greater, rest)
        } else if let Some(rest) = input.strip_prefix('<') {
            (Op::Less, rest)
        } else if let Some(rest) = input.strip_prefix('=') {
            (Op::Exact, rest)
        } else if let Some(rest) = input.strip_prefix('^') {
            (Op::Caret, rest)
        } else if let Some(rest) = input.strip_prefix('~') {
            (Op::Tilde, rest)
        } else {
            (Op::Exact, input)
        };

        Ok(Self {
            op,
            version: Partial::parse(rest)?,
        })
    }

    fn matches(&self, version: &Version) -> bool {
        let floor = self.version.floor();
        match self.op {
            Op::Exact => {
                if self.version.patch.is_some() {
                    *version == floor
                } else {
                    *version >= floor && *version < self.version.ceiling()
                }
            }
            Op::Greater => {
                if self.version.patch.is_some() {
                    *version > floor
                } else {
                    *version >= self.version.ceiling()
                }
            }
            Op::GreaterEq => *version >= floor,
            Op::Less => *version < floor,
            Op::LessEq => {
                if self.version.patch.is_some() {
                    *version <= floor
                } else {
                    *version < self.version.ceiling()
                }
            }
            Op::Tilde => {
                let upper = match self.version.minor {
                    Some(minor) => Version::new(self.version.major, minor + 1, 0),
                    None => Version::new(self.version.major + 1, 0, 0),
                };
                *version >= floor && *version < upper
            }
            Op::Caret => *version >= floor && *version < self.caret_ceiling(),
        }
    }

    fn caret_ceiling(&self) -> Version {
        let v = &self.version;
        match (v.major, v.minor, v.patch) {
            (0, Some(0), Some(patch)) => Version::new(0, 0, patch + 1),
            (0, Some(minor), _) => Version::new(0, minor + 1, 0),
            (major, _, _) => Version::new(major + 1, 0, 0),
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            Op::Exact => "=",
            Op::Greater => ">",
            Op::GreaterEq => ">=",
            Op::Less => "<",
            Op::LessEq => "<=",
            Op::Caret => "^",
            Op::Tilde => "~",
        };
        write!(f, "{}{}", op, self.version.major)?;
        if let Some(minor) = self.version.minor {
            write!(f, ".{}", minor)?;
        }
        if let Some(patch) = self.version.patch {
            write!(f, ".{}", patch)?;
        }
        if !self.version.pre.is_empty() {
            write!(f, "-{}", self.version.pre.join("."))?;
        }
        Ok(())
    }
}

/// A dependency version range: `*`, `1.2.3`, `=1.2.3`, `>=1.0`, `^1.2`, `~1.2.3`
/// or a comma-separated conjunction such as `>=1.0, <2.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReq {
    comparators: Vec<Comparator>,
}

impl VersionReq {
    /// Matches every version.
    pub fn any() -> Self {
        Self {
            comparators: Vec::new(),
        }
    }

    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.is_empty() {
            return Err("empty version range".to_string());
        }
        if input == "*" {
            return Ok(Self::any());
        }

        let comparators = input
            .split(',')
            .map(Comparator::parse)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid version range '{}': {}", input, e))?;

        Ok(Self { comparators })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.comparators.iter().all(|c| c.matches(version))
    }

    pub fn is_any(&self) -> bool {
        self.comparators.is_empty()
    }
}

impl Default for VersionReq {
    fn default() -> Self {
        Self::any()
    }
}

impl FromStr for VersionReq {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionReq::parse(s)
    }
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.comparators.is_empty() {
            return write!(f, "*");
        }
        let parts: Vec<String> = self.comparators.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join(", "))
    }
}

impl Serialize for VersionReq {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionReq {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        VersionReq::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Returns true if `version` satisfies the textual `requirement`.
pub fn version_satisfies(version: &str, requirement: &str) -> bool {
    match (Version::parse(version), VersionReq::parse(requirement)) {
        (Ok(version), Ok(req)) => req.matches(&version),
        _ => false,
    }
}
