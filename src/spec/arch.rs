//! The architecture triple: platform, operating system, target
//! microarchitecture. Each component is independently constrained or
//! concrete.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// A possibly partial architecture constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Arch {
    pub platform: Option<String>,
    pub os: Option<String>,
    pub target: Option<String>,
}

impl Arch {
    pub fn is_unconstrained(&self) -> bool {
        self.platform.is_none() && self.os.is_none() && self.target.is_none()
    }

    pub fn is_concrete(&self) -> bool {
        self.platform.is_some() && self.os.is_some() && self.target.is_some()
    }

    /// Componentwise check that `self` meets every component `other` pins.
    pub fn satisfies(&self, other: &Arch) -> bool {
        fn part(a: &Option<String>, b: &Option<String>) -> bool {
            match (a, b) {
                (_, None) => true,
                (Some(a), Some(b)) => a == b,
                (None, Some(_)) => false,
            }
        }
        part(&self.platform, &other.platform)
            && part(&self.os, &other.os)
            && part(&self.target, &other.target)
    }

    /// Componentwise merge; `None` when two fixed components differ.
    pub fn constrain(&self, other: &Arch) -> Option<Arch> {
        fn part(a: &Option<String>, b: &Option<String>) -> Option<Option<String>> {
            match (a, b) {
                (Some(a), Some(b)) if a != b => None,
                (Some(a), _) => Some(Some(a.clone())),
                (None, b) => Some(b.clone()),
            }
        }
        Some(Arch {
            platform: part(&self.platform, &other.platform)?,
            os: part(&self.os, &other.os)?,
            target: part(&self.target, &other.target)?,
        })
    }

    /// Parses the `platform-os-target` form used by `arch=`.
    pub fn from_triple_text(text: &str) -> Option<Arch> {
        let mut parts = text.splitn(3, '-');
        let platform = parts.next()?;
        let os = parts.next()?;
        let target = parts.next()?;
        let piece = |s: &str| (s != "*").then(|| s.to_string());
        Some(Arch {
            platform: piece(platform),
            os: piece(os),
            target: piece(target),
        })
    }
}

impl Display for Arch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let star = "*";
        write!(
            f,
            "arch={}-{}-{}",
            self.platform.as_deref().unwrap_or(star),
            self.os.as_deref().unwrap_or(star),
            self.target.as_deref().unwrap_or(star)
        )
    }
}

/// A fully concrete architecture.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchTriple {
    pub platform: String,
    pub os: String,
    pub target: String,
}

impl ArchTriple {
    pub fn as_arch(&self) -> Arch {
        Arch {
            platform: Some(self.platform.clone()),
            os: Some(self.os.clone()),
            target: Some(self.target.clone()),
        }
    }
}

impl Display for ArchTriple {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.platform, self.os, self.target)
    }
}
