// Copyright Materialize, Inc. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Name references for plans, features, and feature-plan pairs.
//!
//! Every entity in the system is addressed by one of three reference shapes:
//!
//! * `plan:<name>@<version>`
//! * `feature:<name>`
//! * `feature:<name>@plan:<planName>@<version>`
//!
//! References are strict: there is no case folding, trimming, or any other
//! normalization, and every reference round-trips through its textual form
//! byte-identical. Comparison and hashing use the textual form, so the total
//! order over references is the lexicographic order of their strings.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use thiserror::Error;

const FEATURE_PREFIX: &str = "feature:";
const PLAN_PREFIX: &str = "plan:";

/// The error returned when parsing an invalid reference.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid reference {input:?}: {reason}")]
pub struct ParseError {
    /// The rejected input.
    pub input: String,
    /// What made the input invalid.
    pub reason: &'static str,
}

impl ParseError {
    pub(crate) fn new(input: &str, reason: &'static str) -> ParseError {
        ParseError {
            input: input.into(),
            reason,
        }
    }
}

/// Reports whether `s` is a valid reference name: one or more `:`-separated
/// segments, each starting with a letter and continuing with letters, digits,
/// or underscores.
fn is_name(s: &str) -> bool {
    !s.is_empty()
        && s.split(':').all(|seg| {
            let mut chars = seg.chars();
            match chars.next() {
                Some(c) if c.is_ascii_alphabetic() => {}
                _ => return false,
            }
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

/// Reports whether `s` is a valid version tag: one or more `.`-separated
/// non-empty alphanumeric runs.
fn is_version(s: &str) -> bool {
    !s.is_empty()
        && s.split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric()))
}

macro_rules! textual_ref {
    ($ty:ident) => {
        impl $ty {
            /// Returns the reference in its textual form.
            pub fn as_str(&self) -> &str {
                &self.text
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.text)
            }
        }

        impl PartialEq for $ty {
            fn eq(&self, other: &$ty) -> bool {
                self.text == other.text
            }
        }

        impl Eq for $ty {}

        impl PartialOrd for $ty {
            fn partial_cmp(&self, other: &$ty) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $ty {
            fn cmp(&self, other: &$ty) -> Ordering {
                self.text.cmp(&other.text)
            }
        }

        impl Hash for $ty {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.text.hash(state);
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.text)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<$ty, D::Error> {
                let s = String::deserialize(deserializer)?;
                $ty::parse(&s).map_err(de::Error::custom)
            }
        }
    };
}

/// A feature name without a plan: `feature:<name>`.
#[derive(Debug, Clone)]
pub struct Name {
    text: String,
}

textual_ref!(Name);

impl Name {
    /// Parses a feature name reference.
    pub fn parse(s: &str) -> Result<Name, ParseError> {
        let base = s
            .strip_prefix(FEATURE_PREFIX)
            .ok_or_else(|| ParseError::new(s, "must start with \"feature:\""))?;
        if base.contains('@') {
            return Err(ParseError::new(s, "feature name must not contain '@'"));
        }
        if !is_name(base) {
            return Err(ParseError::new(s, "malformed feature name"));
        }
        Ok(Name { text: s.into() })
    }

    /// The name with the `feature:` prefix removed.
    pub fn base(&self) -> &str {
        &self.text[FEATURE_PREFIX.len()..]
    }

    #[cfg(test)]
    pub fn new_unchecked(s: &str) -> Name {
        Name { text: s.into() }
    }
}

/// A plan reference: `plan:<name>@<version>`.
#[derive(Debug, Clone)]
pub struct Plan {
    text: String,
    // byte offset of the version within `text`
    version_off: usize,
}

textual_ref!(Plan);

impl Plan {
    /// Parses a plan reference.
    pub fn parse(s: &str) -> Result<Plan, ParseError> {
        let rest = s
            .strip_prefix(PLAN_PREFIX)
            .ok_or_else(|| ParseError::new(s, "must start with \"plan:\""))?;
        let at = rest
            .find('@')
            .ok_or_else(|| ParseError::new(s, "missing '@<version>'"))?;
        let (name, version) = (&rest[..at], &rest[at + 1..]);
        if name.contains(':') || !is_name(name) {
            return Err(ParseError::new(s, "malformed plan name"));
        }
        if !is_version(version) {
            return Err(ParseError::new(s, "malformed plan version"));
        }
        Ok(Plan {
            text: s.into(),
            version_off: PLAN_PREFIX.len() + at + 1,
        })
    }

    /// The plan name, without prefix or version.
    pub fn name(&self) -> &str {
        &self.text[PLAN_PREFIX.len()..self.version_off - 1]
    }

    /// The plan version.
    pub fn version(&self) -> &str {
        &self.text[self.version_off..]
    }

    #[cfg(test)]
    pub fn new_unchecked(s: &str) -> Plan {
        let at = s.rfind('@').expect("unchecked plan must contain '@'");
        Plan {
            text: s.into(),
            version_off: at + 1,
        }
    }
}

/// A feature under a specific plan version:
/// `feature:<name>@plan:<planName>@<version>`.
///
/// This is the primary billing key: a `FeaturePlan` projects to both a
/// [`Plan`] and a feature [`Name`].
#[derive(Debug, Clone)]
pub struct FeaturePlan {
    text: String,
    // byte offset of the embedded plan reference within `text`
    plan_off: usize,
}

textual_ref!(FeaturePlan);

impl FeaturePlan {
    /// Parses a feature-plan reference.
    pub fn parse(s: &str) -> Result<FeaturePlan, ParseError> {
        let base = s
            .strip_prefix(FEATURE_PREFIX)
            .ok_or_else(|| ParseError::new(s, "must start with \"feature:\""))?;
        let at = base
            .find('@')
            .ok_or_else(|| ParseError::new(s, "missing '@plan:...'"))?;
        if !is_name(&base[..at]) {
            return Err(ParseError::new(s, "malformed feature name"));
        }
        let plan_off = FEATURE_PREFIX.len() + at + 1;
        Plan::parse(&s[plan_off..]).map_err(|_| ParseError::new(s, "malformed plan reference"))?;
        Ok(FeaturePlan {
            text: s.into(),
            plan_off,
        })
    }

    /// Composes a feature-plan from a feature name and a plan.
    pub fn new(name: &Name, plan: &Plan) -> FeaturePlan {
        FeaturePlan {
            text: format!("{name}@{plan}"),
            plan_off: name.as_str().len() + 1,
        }
    }

    /// Projects the feature name, dropping the plan.
    pub fn name(&self) -> Name {
        Name {
            text: self.text[..self.plan_off - 1].into(),
        }
    }

    /// Projects the plan reference.
    pub fn plan(&self) -> Plan {
        Plan::parse(&self.text[self.plan_off..]).expect("validated on construction")
    }

    /// The feature name with the `feature:` prefix removed.
    pub fn base(&self) -> &str {
        &self.text[FEATURE_PREFIX.len()..self.plan_off - 1]
    }

    /// The version of the embedded plan.
    pub fn version(&self) -> &str {
        let plan = &self.text[self.plan_off..];
        let at = plan.rfind('@').expect("validated on construction");
        &plan[at + 1..]
    }

    #[cfg(test)]
    pub fn new_unchecked(s: &str) -> FeaturePlan {
        let at = s.find("@plan:").expect("unchecked feature-plan must embed a plan");
        FeaturePlan {
            text: s.into(),
            plan_off: at + 1,
        }
    }
}

/// Stably sorts feature-plans into groups by feature name, ordering each
/// group's members by version.
///
/// Group order follows the name order; references that compare equal keep
/// their relative input order.
pub fn sort_grouped_by_version(refs: &mut [FeaturePlan]) {
    refs.sort_by(|a, b| {
        a.base()
            .cmp(b.base())
            .then_with(|| a.version().cmp(b.version()))
            .then_with(|| a.cmp(b))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips() {
        for s in [
            "feature:convert",
            "feature:todo:lists",
            "feature:a1_b:c2",
            "plan:free@0",
            "plan:pro@1.2.3",
            "plan:enterprise@20230101",
            "feature:convert@plan:free@0",
            "feature:todo:lists@plan:pro@1.2",
        ] {
            if s.starts_with("plan:") {
                assert_eq!(Plan::parse(s).unwrap().to_string(), s);
            } else if s.contains('@') {
                assert_eq!(FeaturePlan::parse(s).unwrap().to_string(), s);
            } else {
                assert_eq!(Name::parse(s).unwrap().to_string(), s);
            }
        }
    }

    #[test]
    fn parse_rejects_malformed() {
        for s in [
            "",
            "convert",
            "feature:",
            "feature:9lives",
            "feature:a b",
            "feature:a@plan:",
            "feature:a@plan:x",
            "feature:a@plan:x@",
            "feature:a@plan:x@v!",
            "plan:free",
            "plan:free@",
            "plan:@1",
            "plan:a:b@1",
            "Plan:free@1",
            " feature:a",
        ] {
            assert!(
                Name::parse(s).is_err(),
                "Name::parse accepted {s:?}"
            );
            assert!(
                FeaturePlan::parse(s).is_err(),
                "FeaturePlan::parse accepted {s:?}"
            );
            assert!(
                Plan::parse(s).is_err(),
                "Plan::parse accepted {s:?}"
            );
        }
    }

    #[test]
    fn name_rejects_plan_suffix() {
        assert!(Name::parse("feature:a@plan:x@1").is_err());
    }

    #[test]
    fn projections() {
        let fp = FeaturePlan::parse("feature:todo:lists@plan:pro@7").unwrap();
        assert_eq!(fp.name().as_str(), "feature:todo:lists");
        assert_eq!(fp.name().base(), "todo:lists");
        assert_eq!(fp.plan().as_str(), "plan:pro@7");
        assert_eq!(fp.plan().name(), "pro");
        assert_eq!(fp.plan().version(), "7");
        assert_eq!(fp.version(), "7");

        let composed = FeaturePlan::new(&fp.name(), &fp.plan());
        assert_eq!(composed, fp);
    }

    #[test]
    fn total_order_is_textual() {
        let mut refs = vec![
            FeaturePlan::parse("feature:b@plan:x@1").unwrap(),
            FeaturePlan::parse("feature:a@plan:x@2").unwrap(),
            FeaturePlan::parse("feature:a@plan:x@1").unwrap(),
        ];
        refs.sort();
        let strs: Vec<_> = refs.iter().map(|r| r.as_str().to_string()).collect();
        assert_eq!(
            strs,
            [
                "feature:a@plan:x@1",
                "feature:a@plan:x@2",
                "feature:b@plan:x@1",
            ]
        );
    }

    #[test]
    fn grouped_sort_groups_by_name_then_version() {
        let mut refs = vec![
            FeaturePlan::parse("feature:b@plan:x@0").unwrap(),
            FeaturePlan::parse("feature:a@plan:z@2").unwrap(),
            FeaturePlan::parse("feature:b@plan:a@3").unwrap(),
            FeaturePlan::parse("feature:a@plan:y@1").unwrap(),
        ];
        sort_grouped_by_version(&mut refs);
        let strs: Vec<_> = refs.iter().map(|r| r.as_str().to_string()).collect();
        assert_eq!(
            strs,
            [
                "feature:a@plan:y@1",
                "feature:a@plan:z@2",
                "feature:b@plan:x@0",
                "feature:b@plan:a@3",
            ]
        );
    }

    #[test]
    fn serde_uses_textual_form() {
        let fp = FeaturePlan::parse("feature:a@plan:x@1").unwrap();
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, "\"feature:a@plan:x@1\"");
        let back: FeaturePlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
        assert!(serde_json::from_str::<FeaturePlan>("\"feature:a\"").is_err());
    }
}
