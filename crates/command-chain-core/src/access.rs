use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{HierarchyError, Uic};

/// Name of an access level. Names are upper-cased; their meaning comes from a
/// configured [`LevelOrdering`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct AccessLevel(String);

impl AccessLevel {
    /// # Errors
    /// Returns [`HierarchyError::Validation`] for blank names or names with
    /// characters other than ASCII alphanumerics and `_`.
    pub fn parse(value: &str) -> Result<Self, HierarchyError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(HierarchyError::Validation("access level MUST be non-empty".to_string()));
        }
        if !trimmed.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
            return Err(HierarchyError::Validation(format!(
                "access level MUST contain only ASCII alphanumerics or '_': {trimmed}"
            )));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AccessLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AccessLevel {
    type Error = HierarchyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AccessLevel> for String {
    fn from(value: AccessLevel) -> Self {
        value.0
    }
}

/// The "satisfies" relation between a held level and a required level.
pub trait Satisfies {
    fn is_known(&self, level: &AccessLevel) -> bool;

    /// Every held level that meets `required`.
    ///
    /// # Errors
    /// Returns [`HierarchyError::UnknownAccessLevel`] when `required` is not configured.
    fn acceptable_levels(
        &self,
        required: &AccessLevel,
    ) -> Result<BTreeSet<AccessLevel>, HierarchyError>;

    /// # Errors
    /// Returns [`HierarchyError::UnknownAccessLevel`] when `required` is not configured.
    fn satisfies(&self, held: &AccessLevel, required: &AccessLevel) -> Result<bool, HierarchyError> {
        Ok(self.acceptable_levels(required)?.contains(held))
    }
}

/// Total order of levels, lowest first, plus optional extra grants for
/// deployments whose levels are not totally ordered.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LevelOrdering {
    levels: Vec<AccessLevel>,
    also_satisfies: BTreeMap<AccessLevel, BTreeSet<AccessLevel>>,
}

impl LevelOrdering {
    /// # Errors
    /// Returns [`HierarchyError::Validation`] when `levels` is empty or repeats a name.
    pub fn new(levels: Vec<AccessLevel>) -> Result<Self, HierarchyError> {
        if levels.is_empty() {
            return Err(HierarchyError::Validation(
                "access level ordering MUST list at least one level".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for level in &levels {
            if !seen.insert(level) {
                return Err(HierarchyError::Validation(format!(
                    "access level {level} is listed more than once"
                )));
            }
        }
        Ok(Self { levels, also_satisfies: BTreeMap::new() })
    }

    /// Declare that holding `held` also meets a request for `required`.
    ///
    /// # Errors
    /// Returns [`HierarchyError::UnknownAccessLevel`] when either level is not in the ordering.
    pub fn with_also_satisfies(
        mut self,
        required: AccessLevel,
        held: AccessLevel,
    ) -> Result<Self, HierarchyError> {
        for level in [&required, &held] {
            if !self.is_known(level) {
                return Err(HierarchyError::UnknownAccessLevel(level.to_string()));
            }
        }
        self.also_satisfies.entry(required).or_default().insert(held);
        Ok(self)
    }

    #[must_use]
    pub fn levels(&self) -> &[AccessLevel] {
        &self.levels
    }

    #[must_use]
    pub fn rank(&self, level: &AccessLevel) -> Option<usize> {
        self.levels.iter().position(|candidate| candidate == level)
    }
}

impl Satisfies for LevelOrdering {
    fn is_known(&self, level: &AccessLevel) -> bool {
        self.rank(level).is_some()
    }

    fn acceptable_levels(
        &self,
        required: &AccessLevel,
    ) -> Result<BTreeSet<AccessLevel>, HierarchyError> {
        let Some(rank) = self.rank(required) else {
            return Err(HierarchyError::UnknownAccessLevel(required.to_string()));
        };
        let mut acceptable: BTreeSet<AccessLevel> = self.levels[rank..].iter().cloned().collect();
        if let Some(extra) = self.also_satisfies.get(required) {
            acceptable.extend(extra.iter().cloned());
        }
        Ok(acceptable)
    }
}

/// Deployment-level access configuration, usually loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AccessPolicy {
    /// Lowest level first.
    pub levels: Vec<AccessLevel>,
    /// Required level mapped to extra held levels that also meet it.
    #[serde(default)]
    pub also_satisfies: BTreeMap<AccessLevel, Vec<AccessLevel>>,
    /// Units where every principal passes the check, such as in-processing holding units.
    #[serde(default)]
    pub open_units: Vec<Uic>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            levels: ["READ", "WRITE", "ADMIN"]
                .into_iter()
                .map(|name| AccessLevel(name.to_string()))
                .collect(),
            also_satisfies: BTreeMap::new(),
            open_units: Vec::new(),
        }
    }
}

impl AccessPolicy {
    /// # Errors
    /// Returns the validation errors of [`LevelOrdering::new`] and
    /// [`LevelOrdering::with_also_satisfies`].
    pub fn ordering(&self) -> Result<LevelOrdering, HierarchyError> {
        let mut ordering = LevelOrdering::new(self.levels.clone())?;
        for (required, extras) in &self.also_satisfies {
            for held in extras {
                ordering = ordering.with_also_satisfies(required.clone(), held.clone())?;
            }
        }
        Ok(ordering)
    }
}
