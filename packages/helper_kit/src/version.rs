use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Identity and version of a helper binary, as read from its Info.plist.
///
/// Two descriptors only order against each other when they describe the same
/// bundle identifier. Different identifiers are never greater.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HelperVersion {
    #[serde(rename = "bundleIdentifier")]
    identifier: String,
    #[serde(rename = "bundleVersion")]
    build_number: String,
    #[serde(rename = "bundleShortVersion")]
    short_version: String,
}

impl HelperVersion {
    pub fn new<I: Into<String>, B: Into<String>, S: Into<String>>(
        identifier: I,
        build_number: B,
        short_version: S,
    ) -> Self {
        HelperVersion {
            identifier: identifier.into(),
            build_number: build_number.into(),
            short_version: short_version.into(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn build_number(&self) -> &str {
        &self.build_number
    }

    pub fn short_version(&self) -> &str {
        &self.short_version
    }

    /// Short version decides first, build number breaks ties.
    pub fn is_greater_than(&self, other: &HelperVersion) -> bool {
        if self.identifier != other.identifier {
            return false;
        }

        match numeric_compare(&self.short_version, &other.short_version) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => {
                numeric_compare(&self.build_number, &other.build_number) == Ordering::Greater
            }
        }
    }

    pub fn is_greater_or_equal(&self, other: &HelperVersion) -> bool {
        self == other || self.is_greater_than(other)
    }
}

impl Display for HelperVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bundleIdentifier: {}, bundleVersion: {}, bundleShortVersion: {}",
            self.identifier, self.build_number, self.short_version
        )
    }
}

/// Compares strings the way Finder sorts file names: runs of ASCII digits
/// compare by numeric value, everything else compares character by character.
///
/// `"1.10"` is greater than `"1.9"` and `"10"` is greater than `"9"`.
pub fn numeric_compare(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let l_digits = take_digits(&mut left);
                let r_digits = take_digits(&mut right);

                let ord = compare_digit_runs(&l_digits, &r_digits);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(l), Some(r)) => {
                let ord = l.cmp(&r);
                if ord != Ordering::Equal {
                    return ord;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits<I: Iterator<Item = char>>(chars: &mut std::iter::Peekable<I>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        digits.push(c);
        chars.next();
    }
    digits
}

/* compare without parsing so arbitrarily long runs never overflow */
fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');

    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
