//! Poll-mode technologies and the per-cycle "found" bitmask.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Contactless physical/link layer a listener may implement.
///
/// Ordering of [`Technology::ALL`] is the fixed polling order used by the
/// detector and the collision resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Technology {
    /// NFC-A / ISO14443A
    A,
    /// NFC-B / ISO14443B
    B,
    /// NFC-F / FeliCa
    F,
    /// NFC-V / ISO15693
    V,
}

impl Technology {
    pub const ALL: [Technology; 4] = [Technology::A, Technology::B, Technology::F, Technology::V];

    const fn bit(self) -> u8 {
        match self {
            Technology::A => 0x01,
            Technology::B => 0x02,
            Technology::F => 0x04,
            Technology::V => 0x08,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Technology::A => "NFC-A",
            Technology::B => "NFC-B",
            Technology::F => "NFC-F",
            Technology::V => "NFC-V",
        }
    }
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Technology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().trim_start_matches("NFC-") {
            "A" => Ok(Technology::A),
            "B" => Ok(Technology::B),
            "F" => Ok(Technology::F),
            "V" => Ok(Technology::V),
            other => Err(format!("unknown technology '{other}'")),
        }
    }
}

/// Set of technologies, e.g. the ones enabled for polling or the ones
/// found during the current cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Technology>", into = "Vec<Technology>")]
pub struct TechSet(u8);

impl TechSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(0x0F)
    }

    pub fn insert(&mut self, tech: Technology) {
        self.0 |= tech.bit();
    }

    pub fn contains(&self, tech: Technology) -> bool {
        self.0 & tech.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Members in polling order (A, B, F, V).
    pub fn iter(&self) -> impl Iterator<Item = Technology> + '_ {
        Technology::ALL.into_iter().filter(|t| self.contains(*t))
    }
}

impl FromIterator<Technology> for TechSet {
    fn from_iter<I: IntoIterator<Item = Technology>>(iter: I) -> Self {
        let mut set = TechSet::empty();
        for tech in iter {
            set.insert(tech);
        }
        set
    }
}

impl From<Vec<Technology>> for TechSet {
    fn from(v: Vec<Technology>) -> Self {
        v.into_iter().collect()
    }
}

impl From<TechSet> for Vec<Technology> {
    fn from(set: TechSet) -> Self {
        set.iter().collect()
    }
}

impl FromStr for TechSet {
    type Err = String;

    /// Parses a comma separated list such as `A,F` or `nfc-a, nfc-v`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Technology::from_str)
            .collect()
    }
}

impl fmt::Display for TechSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("{}");
        }
        let names: Vec<&str> = self.iter().map(Technology::name).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}
