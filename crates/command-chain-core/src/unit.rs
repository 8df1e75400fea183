use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::HierarchyError;

const MAX_UIC_LEN: usize = 64;
const MAX_PRINCIPAL_LEN: usize = 128;

/// Unit identification code. Stored upper-cased; immutable once assigned.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Uic(String);

impl Uic {
    /// Normalize and validate a unit code.
    ///
    /// # Errors
    /// Returns [`HierarchyError::Validation`] when the code is empty, too long,
    /// or contains characters other than ASCII alphanumerics, `-` and `_`.
    pub fn parse(value: &str) -> Result<Self, HierarchyError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(HierarchyError::Validation("uic MUST be non-empty".to_string()));
        }
        if trimmed.len() > MAX_UIC_LEN {
            return Err(HierarchyError::Validation(format!(
                "uic MUST be at most {MAX_UIC_LEN} characters, got {}",
                trimmed.len()
            )));
        }
        if !trimmed.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_') {
            return Err(HierarchyError::Validation(format!(
                "uic MUST contain only ASCII alphanumerics, '-' or '_': {trimmed}"
            )));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Uic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Uic {
    type Error = HierarchyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Uic> for String {
    fn from(value: Uic) -> Self {
        value.0
    }
}

/// Identity of a user or soldier holding role assignments.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct PrincipalId(String);

impl PrincipalId {
    /// Validate a principal identity. Case is preserved.
    ///
    /// # Errors
    /// Returns [`HierarchyError::Validation`] when the identity is blank or too long.
    pub fn parse(value: &str) -> Result<Self, HierarchyError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(HierarchyError::Validation("principal MUST be non-empty".to_string()));
        }
        if trimmed.len() > MAX_PRINCIPAL_LEN {
            return Err(HierarchyError::Validation(format!(
                "principal MUST be at most {MAX_PRINCIPAL_LEN} characters"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PrincipalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PrincipalId {
    type Error = HierarchyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PrincipalId> for String {
    fn from(value: PrincipalId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Echelon {
    Team,
    Squad,
    Platoon,
    Company,
    Battalion,
    Brigade,
    Division,
    Corps,
    Acom,
    State,
    TaskForce,
    Unknown,
}

impl Echelon {
    pub const ALL: [Self; 12] = [
        Self::Team,
        Self::Squad,
        Self::Platoon,
        Self::Company,
        Self::Battalion,
        Self::Brigade,
        Self::Division,
        Self::Corps,
        Self::Acom,
        Self::State,
        Self::TaskForce,
        Self::Unknown,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Team => "TEAM",
            Self::Squad => "SQUAD",
            Self::Platoon => "PLATOON",
            Self::Company => "COMPANY",
            Self::Battalion => "BATTALION",
            Self::Brigade => "BRIGADE",
            Self::Division => "DIVISION",
            Self::Corps => "CORPS",
            Self::Acom => "ACOM",
            Self::State => "STATE",
            Self::TaskForce => "TASK_FORCE",
            Self::Unknown => "UNKNOWN",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        Self::ALL.into_iter().find(|echelon| echelon.as_str() == normalized)
    }
}

/// Value of the per-store edit counter.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct LogicalTime(pub u64);

impl LogicalTime {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for LogicalTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Denormalized relatives of one unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UnitClosure {
    /// Immediate parent first, root last.
    pub parent_uics: Vec<Uic>,
    pub child_uics: Vec<Uic>,
    pub subordinate_uics: Vec<Uic>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Unit {
    pub uic: Uic,
    pub display_name: String,
    pub short_name: String,
    pub echelon: Echelon,
    pub parent_uic: Option<Uic>,
    #[serde(default)]
    pub parent_uics: Vec<Uic>,
    #[serde(default)]
    pub child_uics: Vec<Uic>,
    #[serde(default)]
    pub subordinate_uics: Vec<Uic>,
    #[serde(default)]
    pub as_of_logical_time: LogicalTime,
}

impl Unit {
    #[must_use]
    pub fn closure(&self) -> UnitClosure {
        UnitClosure {
            parent_uics: self.parent_uics.clone(),
            child_uics: self.child_uics.clone(),
            subordinate_uics: self.subordinate_uics.clone(),
        }
    }

    pub fn apply_closure(&mut self, closure: UnitClosure, as_of: LogicalTime) {
        self.parent_uics = closure.parent_uics;
        self.child_uics = closure.child_uics;
        self.subordinate_uics = closure.subordinate_uics;
        self.as_of_logical_time = as_of;
    }

    /// Check the attribute invariants that do not depend on other units.
    ///
    /// # Errors
    /// Returns [`HierarchyError::Validation`] for blank names or self-parenting.
    pub fn validate(&self) -> Result<(), HierarchyError> {
        if self.display_name.trim().is_empty() {
            return Err(HierarchyError::Validation(format!(
                "display_name MUST be provided for unit {}",
                self.uic
            )));
        }
        if self.short_name.trim().is_empty() {
            return Err(HierarchyError::Validation(format!(
                "short_name MUST be provided for unit {}",
                self.uic
            )));
        }
        if self.parent_uic.as_ref() == Some(&self.uic) {
            return Err(HierarchyError::Validation(format!(
                "unit {} cannot be its own parent",
                self.uic
            )));
        }
        Ok(())
    }
}

/// Attributes for a unit that does not exist yet.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewUnit {
    pub uic: Uic,
    pub display_name: String,
    pub short_name: String,
    pub echelon: Echelon,
    pub parent_uic: Option<Uic>,
}

impl NewUnit {
    #[must_use]
    pub fn into_unit(self) -> Unit {
        Unit {
            uic: self.uic,
            display_name: self.display_name,
            short_name: self.short_name,
            echelon: self.echelon,
            parent_uic: self.parent_uic,
            parent_uics: Vec::new(),
            child_uics: Vec::new(),
            subordinate_uics: Vec::new(),
            as_of_logical_time: LogicalTime::default(),
        }
    }
}
