//! Transform identifiers, target profiles and include/exclude rule sets

use crate::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A named syntax rewrite the narrower knows how to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transform {
    ExponentiationOperator,
    NullishCoalescingOperator,
    LogicalAssignmentOperators,
    NumericSeparator,
    OptionalCatchBinding,
    BlockScoping,
}

impl Transform {
    pub const ALL: [Transform; 6] = [
        Transform::ExponentiationOperator,
        Transform::NullishCoalescingOperator,
        Transform::LogicalAssignmentOperators,
        Transform::NumericSeparator,
        Transform::OptionalCatchBinding,
        Transform::BlockScoping,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ExponentiationOperator => "exponentiation-operator",
            Self::NullishCoalescingOperator => "nullish-coalescing-operator",
            Self::LogicalAssignmentOperators => "logical-assignment-operators",
            Self::NumericSeparator => "numeric-separator",
            Self::OptionalCatchBinding => "optional-catch-binding",
            Self::BlockScoping => "block-scoping",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::ExponentiationOperator => "a ** b  ->  Math.pow(a, b)",
            Self::NullishCoalescingOperator => "a ?? b  ->  explicit null/undefined test",
            Self::LogicalAssignmentOperators => "a ||= b  ->  a || (a = b)",
            Self::NumericSeparator => "1_000  ->  1000",
            Self::OptionalCatchBinding => "catch {}  ->  catch (_unused) {}",
            Self::BlockScoping => "let/const declarations  ->  var",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Transform {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| {
            let known: Vec<&str> = Self::ALL.iter().map(|t| t.name()).collect();
            BuildError::invalid_format(format!(
                "Unknown transform '{}'. Known transforms: {}",
                s,
                known.join(", ")
            ))
        })
    }
}

/// Compatibility profile supplying the transforms used when neither list names one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetProfile {
    /// Hermes: native async functions, classes and `??`; no `**`, logical assignment or separators
    #[default]
    Hermes,
    Es5,
    Es2018,
    /// Everything is supported natively
    Esnext,
}

impl TargetProfile {
    pub fn default_transforms(self) -> BTreeSet<Transform> {
        use Transform::*;
        let transforms: &[Transform] = match self {
            Self::Hermes => &[
                ExponentiationOperator,
                LogicalAssignmentOperators,
                NumericSeparator,
            ],
            Self::Es5 => &Transform::ALL,
            Self::Es2018 => &[
                NullishCoalescingOperator,
                LogicalAssignmentOperators,
                NumericSeparator,
                OptionalCatchBinding,
            ],
            Self::Esnext => &[],
        };
        transforms.iter().copied().collect()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Hermes => "hermes",
            Self::Es5 => "es5",
            Self::Es2018 => "es2018",
            Self::Esnext => "esnext",
        }
    }
}

impl FromStr for TargetProfile {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hermes" => Ok(Self::Hermes),
            "es5" => Ok(Self::Es5),
            "es2018" => Ok(Self::Es2018),
            "esnext" => Ok(Self::Esnext),
            _ => Err(BuildError::invalid_format(format!(
                "Unknown target profile '{}'. Use hermes, es5, es2018 or esnext",
                s
            ))),
        }
    }
}

/// Explicit include/exclude overrides on top of a profile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureRuleSet {
    pub included: BTreeSet<Transform>,
    pub excluded: BTreeSet<Transform>,
}

impl FeatureRuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, transform: Transform) -> Self {
        self.included.insert(transform);
        self
    }

    pub fn exclude(mut self, transform: Transform) -> Self {
        self.excluded.insert(transform);
        self
    }

    /// Build from transform names, rejecting unknown identifiers
    pub fn from_names<I, J, S, T>(included: I, excluded: J) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let mut rules = Self::new();
        for name in included {
            rules.included.insert(name.as_ref().parse()?);
        }
        for name in excluded {
            rules.excluded.insert(name.as_ref().parse()?);
        }
        Ok(rules)
    }

    /// Transforms named in both lists; exclusion wins for these
    pub fn conflicts(&self) -> BTreeSet<Transform> {
        self.included.intersection(&self.excluded).copied().collect()
    }

    /// The transforms that actually run: (profile defaults + included) - excluded
    pub fn effective(&self, profile: TargetProfile) -> BTreeSet<Transform> {
        for transform in self.conflicts() {
            log::warn!(
                "Transform '{}' is both included and excluded; excluding it",
                transform
            );
        }

        let mut effective = profile.default_transforms();
        effective.extend(self.included.iter().copied());
        effective.retain(|t| !self.excluded.contains(t));
        effective
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_names_round_trip() {
        for transform in Transform::ALL {
            assert_eq!(transform.name().parse::<Transform>().unwrap(), transform);
        }
    }

    #[test]
    fn test_unknown_transform_rejected() {
        let err = "arrow-functions".parse::<Transform>().unwrap_err();
        assert!(err.to_string().contains("arrow-functions"));
    }

    #[test]
    fn test_exclusion_beats_inclusion() {
        for transform in Transform::ALL {
            let rules = FeatureRuleSet::new().include(transform).exclude(transform);
            for profile in [
                TargetProfile::Hermes,
                TargetProfile::Es5,
                TargetProfile::Es2018,
                TargetProfile::Esnext,
            ] {
                assert!(!rules.effective(profile).contains(&transform));
            }
        }
    }

    #[test]
    fn test_exclusion_overrides_profile() {
        let rules = FeatureRuleSet::new().exclude(Transform::ExponentiationOperator);
        let effective = rules.effective(TargetProfile::Hermes);
        assert!(!effective.contains(&Transform::ExponentiationOperator));
        assert!(effective.contains(&Transform::NumericSeparator));
    }

    #[test]
    fn test_inclusion_extends_profile() {
        let rules = FeatureRuleSet::new().include(Transform::BlockScoping);
        let effective = rules.effective(TargetProfile::Esnext);
        assert_eq!(effective.into_iter().collect::<Vec<_>>(), vec![Transform::BlockScoping]);
    }

    #[test]
    fn test_from_names() {
        let rules =
            FeatureRuleSet::from_names(["block-scoping"], ["numeric-separator"]).unwrap();
        assert!(rules.included.contains(&Transform::BlockScoping));
        assert!(rules.excluded.contains(&Transform::NumericSeparator));
        assert!(FeatureRuleSet::from_names(["nope"], Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!("Hermes".parse::<TargetProfile>().unwrap(), TargetProfile::Hermes);
        assert!("es3".parse::<TargetProfile>().is_err());
    }
}
