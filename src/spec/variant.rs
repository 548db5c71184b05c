//! Variant values and their legal domains.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// The value a variant is set to, or constrained to, on a spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariantValue {
    /// A boolean variant: `+feature` / `~feature`.
    Bool(bool),
    /// A single-valued variant: `backend=cuda`.
    Single(String),
    /// A multi-valued variant: `languages=c,cxx`. Sorted so that rendering
    /// and hashing are order independent.
    Multi(BTreeSet<String>),
}

impl VariantValue {
    pub fn multi<I: IntoIterator<Item = S>, S: Into<String>>(values: I) -> Self {
        VariantValue::Multi(values.into_iter().map(Into::into).collect())
    }

    /// Whether a spec holding `self` meets a constraint of `other`.
    /// Booleans and single values must match exactly; a multi-value
    /// satisfies any subset of itself, written either as a set or as one
    /// bare value.
    pub fn satisfies(&self, other: &VariantValue) -> bool {
        match (self, other) {
            (VariantValue::Bool(a), VariantValue::Bool(b)) => a == b,
            (VariantValue::Single(a), VariantValue::Single(b)) => a == b,
            (VariantValue::Multi(a), VariantValue::Multi(b)) => b.is_subset(a),
            (VariantValue::Multi(a), VariantValue::Single(b)) => a.contains(b),
            (VariantValue::Single(a), VariantValue::Multi(b)) => {
                b.len() == 1 && b.contains(a)
            }
            _ => false,
        }
    }

    /// The combination of two constraints on the same variant, or `None`
    /// when they cannot both hold. A single value and a set combine into
    /// their union; two differing single values conflict, since only
    /// explicitly multi-valued constraints may accumulate.
    pub fn constrain(&self, other: &VariantValue) -> Option<VariantValue> {
        match (self, other) {
            (VariantValue::Bool(a), VariantValue::Bool(b)) if a == b => Some(self.clone()),
            (VariantValue::Single(a), VariantValue::Single(b)) if a == b => Some(self.clone()),
            (VariantValue::Multi(a), VariantValue::Multi(b)) => {
                Some(VariantValue::Multi(a.union(b).cloned().collect()))
            }
            (VariantValue::Multi(a), VariantValue::Single(b))
            | (VariantValue::Single(b), VariantValue::Multi(a)) => {
                let mut merged = a.clone();
                merged.insert(b.clone());
                Some(VariantValue::Multi(merged))
            }
            _ => None,
        }
    }

    /// Renders the value together with its variant name in spec syntax.
    pub fn display_with_name<'a>(&'a self, name: &'a str) -> VariantDisplay<'a> {
        VariantDisplay { name, value: self }
    }
}

/// Helper to render `+name`, `~name` or `name=value`.
pub struct VariantDisplay<'a> {
    name: &'a str,
    value: &'a VariantValue,
}

impl Display for VariantDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.value {
            VariantValue::Bool(true) => write!(f, "+{}", self.name),
            VariantValue::Bool(false) => write!(f, "~{}", self.name),
            VariantValue::Single(v) => write!(f, "{}={}", self.name, v),
            VariantValue::Multi(vs) => {
                write!(f, "{}=", self.name)?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{v}")?;
                }
                Ok(())
            }
        }
    }
}

/// The legal values a package declares for one of its variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantDomain {
    /// `true` or `false`.
    Bool,
    /// Exactly one of the listed values.
    Enum(Vec<String>),
    /// Any subset of the listed values.
    Multi(Vec<String>),
    /// Any single string value (free-form, e.g. a path).
    AnyString,
}

impl VariantDomain {
    pub fn contains(&self, value: &VariantValue) -> bool {
        match (self, value) {
            (VariantDomain::Bool, VariantValue::Bool(_)) => true,
            (VariantDomain::Enum(allowed), VariantValue::Single(v)) => {
                allowed.iter().any(|a| a == v)
            }
            (VariantDomain::Multi(allowed), VariantValue::Multi(vs)) => {
                vs.iter().all(|v| allowed.iter().any(|a| a == v))
            }
            (VariantDomain::AnyString, VariantValue::Single(_)) => true,
            _ => false,
        }
    }
}
