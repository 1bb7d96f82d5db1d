//! Release tag parsing.
//!
//! A tag has the shape `v<major>.<minor>.<patch>[-](rc|dev)<n>`. Parsing is
//! pure: no filesystem, no network, same output for the same input.
//!
//! Anything after the numeric triple that is not exactly one pre-release
//! suffix is governed by [`TrailingPolicy`].

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ReleaseError, Result};

static SUFFIX_EXACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(-?)(rc|dev)([0-9]+)$").expect("suffix pattern compiles"));

static SUFFIX_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(-?)(rc|dev)([0-9]+)").expect("suffix pattern compiles"));

/// What to do with characters after the numeric triple that are not a
/// recognised pre-release suffix.
///
/// The policy never relaxes the grammar of what is parsed: leading zeros and
/// ordinal `0` are rejected either way, since they cannot survive
/// re-serialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingPolicy {
    /// Fail with `MalformedTag`.
    #[default]
    Reject,
    /// Capture a suffix at the start of the remainder and drop the rest.
    Ignore,
}

/// Pre-release flavour. `Development` sorts before `ReleaseCandidate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuffixKind {
    Development,
    ReleaseCandidate,
}

impl SuffixKind {
    /// The code used in tags and manifests.
    pub fn code(&self) -> &'static str {
        match self {
            SuffixKind::Development => "dev",
            SuffixKind::ReleaseCandidate => "rc",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "dev" => Some(SuffixKind::Development),
            "rc" => Some(SuffixKind::ReleaseCandidate),
            _ => None,
        }
    }
}

/// Pre-release marker, e.g. `-rc2`.
#[derive(Debug, Clone, Copy)]
pub struct Suffix {
    pub kind: SuffixKind,
    pub ordinal: u64,
    /// Whether the tag spelled a `-` before the code. Formatting only.
    pub separated: bool,
}

/// A release version derived from a tag.
///
/// Equality and ordering ignore [`Suffix::separated`]; `Display` reproduces it.
#[derive(Debug, Clone, Copy)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub suffix: Option<Suffix>,
}

impl Version {
    /// A final release `major.minor.patch`.
    pub fn final_release(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            suffix: None,
        }
    }

    /// A hyphenated pre-release such as `1.2.3-rc1`.
    pub fn pre_release(major: u64, minor: u64, patch: u64, kind: SuffixKind, ordinal: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            suffix: Some(Suffix {
                kind,
                ordinal,
                separated: true,
            }),
        }
    }

    /// Parse a tag with the default (strict) trailing policy.
    pub fn parse(tag: &str) -> Result<Self> {
        parse_tag(tag, TrailingPolicy::Reject)
    }

    pub fn is_final(&self) -> bool {
        self.suffix.is_none()
    }

    pub fn is_pre_release(&self) -> bool {
        self.suffix.is_some()
    }

    pub fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }

    /// The tag spelling of this version (`v` + canonical form).
    pub fn to_tag(&self) -> String {
        format!("v{self}")
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(suffix) = &self.suffix {
            let sep = if suffix.separated { "-" } else { "" };
            write!(f, "{sep}{}{}", suffix.kind.code(), suffix.ordinal)?;
        }
        Ok(())
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple()
            .cmp(&other.triple())
            .then_with(|| match (&self.suffix, &other.suffix) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.kind.cmp(&b.kind).then(a.ordinal.cmp(&b.ordinal)),
            })
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.triple().hash(state);
        self.suffix.map(|s| (s.kind, s.ordinal)).hash(state);
    }
}

impl FromStr for Version {
    type Err = ReleaseError;

    /// Accepts both `v1.2.3` and the bare canonical form `1.2.3`.
    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with('v') {
            Version::parse(s)
        } else {
            Version::parse(&format!("v{s}"))
        }
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse a raw tag into a [`Version`].
pub fn parse_tag(tag: &str, policy: TrailingPolicy) -> Result<Version> {
    let malformed = |reason: String| ReleaseError::MalformedTag {
        tag: tag.to_string(),
        reason,
    };

    let body = tag
        .strip_prefix('v')
        .ok_or_else(|| malformed("missing leading 'v'".to_string()))?;

    let mut parts = body.splitn(3, '.');
    let major_raw = parts.next().unwrap_or_default();
    let (minor_raw, rest) = match (parts.next(), parts.next()) {
        (Some(minor), Some(rest)) => (minor, rest),
        _ => {
            return Err(malformed(
                "expected three dot-separated version components".to_string(),
            ))
        }
    };

    let patch_len = rest.bytes().take_while(u8::is_ascii_digit).count();
    let (patch_raw, remainder) = rest.split_at(patch_len);

    let major = parse_component("major", major_raw).map_err(&malformed)?;
    let minor = parse_component("minor", minor_raw).map_err(&malformed)?;
    let patch = parse_component("patch", patch_raw).map_err(&malformed)?;

    let suffix = parse_suffix(remainder, policy).map_err(&malformed)?;

    Ok(Version {
        major,
        minor,
        patch,
        suffix,
    })
}

fn parse_component(name: &str, raw: &str) -> std::result::Result<u64, String> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!(
            "{name} component '{raw}' is not a non-negative integer"
        ));
    }
    if raw.len() > 1 && raw.starts_with('0') {
        return Err(format!("{name} component '{raw}' has a leading zero"));
    }
    raw.parse::<u64>()
        .map_err(|e| format!("{name} component '{raw}' is out of range: {e}"))
}

fn parse_suffix(
    remainder: &str,
    policy: TrailingPolicy,
) -> std::result::Result<Option<Suffix>, String> {
    if remainder.is_empty() {
        return Ok(None);
    }

    let pattern = match policy {
        TrailingPolicy::Reject => &*SUFFIX_EXACT,
        TrailingPolicy::Ignore => &*SUFFIX_PREFIX,
    };

    let Some(caps) = pattern.captures(remainder) else {
        return match policy {
            TrailingPolicy::Reject => Err(format!(
                "unrecognised trailing text '{remainder}' (expected rc<n> or dev<n>)"
            )),
            TrailingPolicy::Ignore => Ok(None),
        };
    };

    let kind = SuffixKind::from_code(&caps[2])
        .ok_or_else(|| format!("unknown pre-release code '{}'", &caps[2]))?;
    let digits = &caps[3];
    let ordinal = digits
        .parse::<u64>()
        .map_err(|e| format!("pre-release ordinal '{digits}' is out of range: {e}"))?;

    if ordinal == 0 {
        return Err("pre-release ordinal must be positive".to_string());
    }
    if digits.starts_with('0') {
        return Err(format!("pre-release ordinal '{digits}' has a leading zero"));
    }

    Ok(Some(Suffix {
        kind,
        ordinal,
        separated: !caps[1].is_empty(),
    }))
}
