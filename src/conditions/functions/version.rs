use std::{cmp::Ordering, fmt, str::FromStr};

/// Version number in the loose format used by apps and operating systems: an optional leading
/// `v`, dot separated integer components and an optional `-postfix` (`v1.2.3-beta`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    components: Vec<i64>,
    postfix: String,
}

/// Error returned when a version string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version number format: \"{0}\"")]
pub struct InvalidVersion(pub String);

impl Version {
    /// Integer components, most significant first.
    pub fn components(&self) -> &[i64] {
        &self.components
    }

    /// Postfix including its leading dash, or empty.
    pub fn postfix(&self) -> &str {
        &self.postfix
    }

    /// Component-wise comparison. A longer version wins when the shared prefix is equal, and a
    /// version without a postfix is greater than the same version with one (`1.0 > 1.0-beta`).
    /// Two postfixed versions with equal components compare equal.
    pub fn compare(&self, other: &Version) -> Ordering {
        for (i, a) in self.components.iter().enumerate() {
            let Some(b) = other.components.get(i) else {
                return Ordering::Greater;
            };
            match a.cmp(b) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }
        if other.components.len() > self.components.len() {
            return Ordering::Less;
        }
        match (self.postfix.is_empty(), other.postfix.is_empty()) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => Ordering::Equal,
        }
    }
}

impl FromStr for Version {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidVersion(s.to_owned());

        let trimmed = s.strip_prefix('v').unwrap_or(s);
        let (numbers, postfix) = match trimmed.find('-') {
            Some(dash) => trimmed.split_at(dash),
            None => (trimmed, ""),
        };
        if numbers.is_empty() {
            return Err(invalid());
        }

        let components = numbers
            .split('.')
            .map(|component| component.parse::<i64>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Version {
            components,
            postfix: postfix.to_owned(),
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let numbers: Vec<String> = self.components.iter().map(i64::to_string).collect();
        write!(f, "{}{}", numbers.join("."), self.postfix)
    }
}

/// Component at `index`, or `None` when the version is malformed or shorter than that.
pub(crate) fn version_number_component(version: &str, index: i64) -> Option<i64> {
    let version = version
        .parse::<Version>()
        .inspect_err(|err| {
            log::debug!(target: "critical_moments", version; "{err}");
        })
        .ok()?;
    let index = usize::try_from(index).ok()?;
    version.components.get(index).copied()
}

/// Malformed versions never satisfy a comparison.
pub(crate) fn version_compare_expecting(a: &str, b: &str, expected: Ordering) -> bool {
    match (a.parse::<Version>(), b.parse::<Version>()) {
        (Ok(a), Ok(b)) => a.compare(&b) == expected,
        _ => {
            log::debug!(target: "critical_moments", a, b; "invalid version number format in comparison");
            false
        }
    }
}
