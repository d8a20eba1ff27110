//! Bundle version comparison (semver-like, lenient)

use std::cmp::Ordering;

/// Parsed `major.minor.patch[-prerelease]`; missing or non-numeric parts are 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
}

impl Version {
    pub fn parse(version: &str) -> Self {
        let version = version.trim();
        let version = version.strip_prefix('v').unwrap_or(version);
        let (core, prerelease) = match version.split_once('-') {
            Some((core, pre)) => (core, Some(pre.to_string())),
            None => (version, None),
        };

        let mut nums = core.split('.').map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        });

        Self {
            major: nums.next().unwrap_or(0),
            minor: nums.next().unwrap_or(0),
            patch: nums.next().unwrap_or(0),
            prerelease,
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                // A release sorts after any of its prereleases
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub fn compare_versions(current: &str, other: &str) -> Ordering {
    Version::parse(current).cmp(&Version::parse(other))
}

/// Whether `candidate` is strictly newer than `current`
pub fn is_newer(current: &str, candidate: &str) -> bool {
    compare_versions(current, candidate) == Ordering::Less
}

/// Whether moving from `current` to `candidate` raises the leading component
pub fn is_major_bump(current: &str, candidate: &str) -> bool {
    Version::parse(candidate).major > Version::parse(current).major
}
