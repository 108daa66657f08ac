use crate::core::errors::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A normalized distinguished name.
///
/// RDNs are stored leaf first, exactly as written, but trimmed and lower-cased
/// so that equality and ancestry checks are plain component comparisons.
/// The empty DN (root DSE) has no components and is an ancestor of every DN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dn {
    rdns: Vec<String>,
}

impl Dn {
    pub fn root() -> Self {
        Self { rdns: Vec::new() }
    }

    pub fn parse(dn: &str) -> Result<Self> {
        let trimmed = dn.trim();
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let mut rdns = Vec::new();
        for raw in trimmed.split(',') {
            let rdn = raw.trim();
            let (attr, value) = match rdn.split_once('=') {
                Some(parts) => parts,
                None => {
                    return Err(Error::InvalidDn {
                        dn: dn.to_string(),
                        reason: format!("rdn '{}' has no '='", rdn),
                    })
                }
            };

            let attr = attr.trim();
            let value = value.trim();
            if attr.is_empty() || value.is_empty() {
                return Err(Error::InvalidDn {
                    dn: dn.to_string(),
                    reason: format!("rdn '{}' has an empty type or value", rdn),
                });
            }

            rdns.push(format!("{}={}", attr.to_lowercase(), value.to_lowercase()));
        }

        Ok(Self { rdns })
    }

    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rdns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    /// True when `self` lies in the subtree rooted at `ancestor`, including
    /// `self == ancestor`.
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        if ancestor.rdns.len() > self.rdns.len() {
            return false;
        }
        let offset = self.rdns.len() - ancestor.rdns.len();
        self.rdns[offset..] == ancestor.rdns[..]
    }

    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            return None;
        }
        Some(Dn {
            rdns: self.rdns[1..].to_vec(),
        })
    }

    /// Builds `rdn,self`.
    pub fn child(&self, rdn: &str) -> Result<Dn> {
        let leaf = Dn::parse(rdn)?;
        let mut rdns = leaf.rdns;
        rdns.extend(self.rdns.iter().cloned());
        Ok(Dn { rdns })
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rdns.join(","))
    }
}

impl std::str::FromStr for Dn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Dn::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchScope {
    Object,
    OneLevel,
    Subtree,
}

/// A `(base, scope)` pair recorded in a transaction's read or write set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnSet {
    pub base: Dn,
    pub scope: SearchScope,
}

impl DnSet {
    pub fn new(base: Dn, scope: SearchScope) -> Self {
        Self { base, scope }
    }

    fn is_object(&self) -> bool {
        self.scope == SearchScope::Object
    }

    /// Whether a read of `self` may observe a write described by `write`.
    ///
    /// One-level scope is widened to subtree here.
    pub fn conflicts_with(&self, write: &DnSet) -> bool {
        match (self.is_object(), write.is_object()) {
            (true, true) => self.base == write.base,
            (true, false) => self.base.is_descendant_of(&write.base),
            (false, true) => write.base.is_descendant_of(&self.base),
            (false, false) => {
                self.base.is_descendant_of(&write.base) || write.base.is_descendant_of(&self.base)
            }
        }
    }
}
