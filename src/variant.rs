//! Build variants: values carried by specs and declarations carried by recipes.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{InvalidVariantError, InvalidVariantReason};
use crate::spec::Spec;

/// The value of one variant on a spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariantValue {
    Bool(bool),
    Single(String),
    Multi(BTreeSet<String>),
}

impl VariantValue {
    /// Build a value from the tokens a parser or solver produced.
    pub fn from_token(token: &str) -> Self {
        match token {
            "true" | "True" | "TRUE" => VariantValue::Bool(true),
            "false" | "False" | "FALSE" => VariantValue::Bool(false),
            _ if token.contains(',') => VariantValue::Multi(
                token
                    .split(',')
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            _ => VariantValue::Single(token.to_string()),
        }
    }

    /// The value as the solver's value tokens.
    pub fn tokens(&self) -> BTreeSet<String> {
        match self {
            VariantValue::Bool(b) => BTreeSet::from([b.to_string()]),
            VariantValue::Single(v) => BTreeSet::from([v.clone()]),
            VariantValue::Multi(vs) => vs.clone(),
        }
    }

    /// Merge two constraints on the same variant, `None` if they exclude
    /// each other. Multi-valued constraints accumulate.
    pub fn intersect(&self, other: &VariantValue) -> Option<VariantValue> {
        match (self, other) {
            (VariantValue::Bool(a), VariantValue::Bool(b)) => (a == b).then(|| self.clone()),
            (VariantValue::Single(a), VariantValue::Single(b)) => (a == b).then(|| self.clone()),
            (VariantValue::Multi(a), VariantValue::Multi(b)) => {
                Some(VariantValue::Multi(a.union(b).cloned().collect()))
            }
            (VariantValue::Single(a), VariantValue::Multi(m))
            | (VariantValue::Multi(m), VariantValue::Single(a)) => {
                let mut all = m.clone();
                all.insert(a.clone());
                Some(VariantValue::Multi(all))
            }
            _ => None,
        }
    }

    /// `self` implies `other`.
    pub fn satisfies(&self, other: &VariantValue) -> bool {
        match (self, other) {
            (VariantValue::Bool(a), VariantValue::Bool(b)) => a == b,
            (VariantValue::Single(a), VariantValue::Single(b)) => a == b,
            (VariantValue::Multi(m), VariantValue::Single(b)) => m.contains(b),
            (VariantValue::Multi(a), VariantValue::Multi(b)) => b.is_subset(a),
            (VariantValue::Single(a), VariantValue::Multi(b)) => b.len() == 1 && b.contains(a),
            _ => false,
        }
    }

    /// Formats the value the way it appears after `name=`.
    pub fn value_string(&self) -> String {
        match self {
            VariantValue::Bool(b) => b.to_string(),
            VariantValue::Single(v) => v.clone(),
            VariantValue::Multi(vs) => vs.iter().cloned().collect::<Vec<_>>().join(","),
        }
    }
}

impl fmt::Display for VariantValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value_string())
    }
}

/// The values a declared variant may take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantDomain {
    Bool,
    Values(Vec<String>),
    /// Any token; the solver only considers the default and values that
    /// some spec or recipe mentions.
    Any,
}

/// A variant declaration on a recipe.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantDef {
    pub name: String,
    pub default: VariantValue,
    pub domain: VariantDomain,
    pub multi: bool,
    /// The variant exists only on nodes satisfying this condition.
    pub when: Option<Spec>,
    /// Only the default is chosen unless a request names this variant.
    pub sticky: bool,
    pub description: String,
}

impl VariantDef {
    pub fn boolean(name: &str, default: bool) -> Self {
        Self {
            name: name.to_string(),
            default: VariantValue::Bool(default),
            domain: VariantDomain::Bool,
            multi: false,
            when: None,
            sticky: false,
            description: String::new(),
        }
    }

    pub fn single(name: &str, default: &str, values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            default: VariantValue::Single(default.to_string()),
            domain: VariantDomain::Values(values.iter().map(|v| v.to_string()).collect()),
            multi: false,
            when: None,
            sticky: false,
            description: String::new(),
        }
    }

    pub fn multi(name: &str, default: &[&str], values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            default: VariantValue::Multi(default.iter().map(|v| v.to_string()).collect()),
            domain: VariantDomain::Values(values.iter().map(|v| v.to_string()).collect()),
            multi: true,
            when: None,
            sticky: false,
            description: String::new(),
        }
    }

    pub fn with_when(mut self, when: Spec) -> Self {
        self.when = Some(when);
        self
    }

    pub fn with_sticky(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }

    /// The tokens the declaration allows, before free-form extension.
    pub fn domain_tokens(&self) -> Vec<String> {
        match &self.domain {
            VariantDomain::Bool => vec!["false".to_string(), "true".to_string()],
            VariantDomain::Values(vs) => vs.clone(),
            VariantDomain::Any => self.default.tokens().into_iter().collect(),
        }
    }

    /// Turn a set of chosen tokens back into a value of the right shape.
    pub fn value_from_tokens(&self, tokens: &BTreeSet<String>) -> VariantValue {
        match (&self.domain, self.multi) {
            (VariantDomain::Bool, _) => VariantValue::Bool(tokens.contains("true")),
            (_, true) => VariantValue::Multi(tokens.clone()),
            (_, false) => VariantValue::Single(tokens.iter().next().cloned().unwrap_or_default()),
        }
    }

    /// Validate `value` against the declared domain, returning it in the
    /// declaration's shape (single tokens on multi-valued variants become sets).
    pub fn check(&self, package: &str, value: &VariantValue) -> Result<VariantValue, InvalidVariantError> {
        let invalid = |reason| InvalidVariantError {
            package: package.to_string(),
            variant: self.name.clone(),
            reason,
        };
        let tokens = value.tokens();
        if !self.multi && tokens.len() > 1 {
            return Err(invalid(InvalidVariantReason::MultipleValues));
        }
        let allowed = self.domain_tokens();
        if self.domain != VariantDomain::Any {
            if let Some(bad) = tokens.iter().find(|t| !allowed.contains(t)) {
                return Err(invalid(InvalidVariantReason::OutOfDomain {
                    value: bad.clone(),
                    allowed,
                }));
            }
        }
        Ok(self.value_from_tokens(&tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_shapes() {
        assert_eq!(VariantValue::from_token("true"), VariantValue::Bool(true));
        assert_eq!(VariantValue::from_token("v114"), VariantValue::Single("v114".into()));
        assert_eq!(
            VariantValue::from_token("a,b,a"),
            VariantValue::Multi(BTreeSet::from(["a".to_string(), "b".to_string()]))
        );
    }

    #[test]
    fn single_values_conflict() {
        let a = VariantValue::Single("x".into());
        let b = VariantValue::Single("y".into());
        assert!(a.intersect(&b).is_none());
        assert!(VariantValue::Bool(true).intersect(&VariantValue::Bool(false)).is_none());
    }

    #[test]
    fn multi_values_accumulate() {
        let a = VariantValue::from_token("a,b");
        let b = VariantValue::Single("c".into());
        assert_eq!(a.intersect(&b).unwrap().value_string(), "a,b,c");
    }

    #[test]
    fn multi_satisfies_member() {
        let node = VariantValue::from_token("a,b");
        assert!(node.satisfies(&VariantValue::Single("a".into())));
        assert!(!node.satisfies(&VariantValue::Single("c".into())));
        assert!(node.satisfies(&VariantValue::from_token("b,a")));
    }

    #[test]
    fn check_rejects_out_of_domain() {
        let def = VariantDef::single("api", "default", &["default", "v114"]);
        let err = def.check("hdf5", &VariantValue::Single("v200".into())).unwrap_err();
        assert!(matches!(err.reason, InvalidVariantReason::OutOfDomain { .. }));
    }

    #[test]
    fn check_rejects_several_values_on_single() {
        let def = VariantDef::single("api", "default", &["default", "v114"]);
        let err = def.check("hdf5", &VariantValue::from_token("default,v114")).unwrap_err();
        assert_eq!(err.reason, InvalidVariantReason::MultipleValues);
    }

    #[test]
    fn check_normalizes_multi() {
        let def = VariantDef::multi("langs", &["c"], &["c", "cxx", "fortran"]);
        let v = def.check("gcc", &VariantValue::Single("cxx".into())).unwrap();
        assert_eq!(v, VariantValue::Multi(BTreeSet::from(["cxx".to_string()])));
    }

    #[test]
    fn free_form_accepts_anything() {
        let def = VariantDef {
            domain: VariantDomain::Any,
            ..VariantDef::single("build_type", "Release", &[])
        };
        assert!(def.check("cmake", &VariantValue::Single("Weird".into())).is_ok());
    }
}
