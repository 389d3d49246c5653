//! Label and field selectors evaluated against cached objects.
//!
//! The label grammar follows the Kubernetes one: comma-separated terms of the form `k=v`,
//! `k==v`, `k!=v`, `k`, `!k`, `k in (a,b)` and `k notin (a,b)`. An empty selector matches
//! everything. Field selectors only understand `metadata.name` and `metadata.namespace`, which
//! is what the API server supports for every kind.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::Object;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("empty selector term")]
    EmptyTerm,
    #[error("unbalanced parentheses in {0:?}")]
    Unbalanced(String),
    #[error("invalid key {0:?}")]
    InvalidKey(String),
    #[error("invalid value {0:?}")]
    InvalidValue(String),
    #[error("invalid value set {0:?}")]
    InvalidSet(String),
    #[error("unsupported field {0:?} (expected metadata.name or metadata.namespace)")]
    UnsupportedField(String),
    #[error("missing operator in field term {0:?}")]
    MissingOperator(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    /// Also matches objects that do not carry the key at all.
    NotEquals(String, String),
    In(String, BTreeSet<String>),
    /// Also matches objects that do not carry the key at all.
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, set) => labels.get(k).is_some_and(|v| set.contains(v)),
            Requirement::NotIn(k, set) => labels.get(k).map_or(true, |v| !set.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(set: &BTreeSet<String>) -> String { set.iter().cloned().collect::<Vec<_>>().join(",") }
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::NotEquals(k, v) => write!(f, "{}!={}", k, v),
            Requirement::In(k, set) => write!(f, "{} in ({})", k, join(set)),
            Requirement::NotIn(k, set) => write!(f, "{} notin ({})", k, join(set)),
            Requirement::Exists(k) => write!(f, "{}", k),
            Requirement::DoesNotExist(k) => write!(f, "!{}", k),
        }
    }
}

/// Conjunction of label requirements.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self { Self::default() }

    pub fn is_everything(&self) -> bool { self.requirements.is_empty() }

    pub fn requirements(&self) -> &[Requirement] { &self.requirements }

    pub fn with(mut self, req: Requirement) -> Self {
        self.requirements.push(req);
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    pub fn matches_object<K: Object>(&self, obj: &K) -> bool {
        match obj.meta().labels.as_ref() {
            Some(labels) => self.matches(labels),
            None => self.matches(&BTreeMap::new()),
        }
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::everything());
        }
        let requirements = split_terms(s)?.into_iter().map(parse_label_term).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { requirements })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

// Split on commas that are not inside a `( ... )` value set.
fn split_terms(s: &str) -> Result<Vec<&str>, SelectorError> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.checked_sub(1).ok_or_else(|| SelectorError::Unbalanced(s.to_string()))?,
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::Unbalanced(s.to_string()));
    }
    out.push(&s[start..]);
    Ok(out)
}

fn parse_label_term(term: &str) -> Result<Requirement, SelectorError> {
    let term = term.trim();
    if term.is_empty() {
        return Err(SelectorError::EmptyTerm);
    }
    if let Some(rest) = term.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(key(rest)?));
    }
    if let Some((k, rest)) = term.split_once(char::is_whitespace) {
        let rest = rest.trim_start();
        if let Some(set) = rest.strip_prefix("notin") {
            return Ok(Requirement::NotIn(key(k)?, value_set(set)?));
        }
        if let Some(set) = rest.strip_prefix("in") {
            return Ok(Requirement::In(key(k)?, value_set(set)?));
        }
    }
    if let Some((k, v)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals(key(k)?, value(v)?));
    }
    if let Some((k, v)) = term.split_once("==") {
        return Ok(Requirement::Equals(key(k)?, value(v)?));
    }
    if let Some((k, v)) = term.split_once('=') {
        return Ok(Requirement::Equals(key(k)?, value(v)?));
    }
    Ok(Requirement::Exists(key(term)?))
}

fn key(raw: &str) -> Result<String, SelectorError> {
    let k = raw.trim();
    let ok = !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if ok { Ok(k.to_string()) } else { Err(SelectorError::InvalidKey(raw.to_string())) }
}

fn value(raw: &str) -> Result<String, SelectorError> {
    let v = raw.trim();
    if v.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        Ok(v.to_string())
    } else {
        Err(SelectorError::InvalidValue(raw.to_string()))
    }
}

fn value_set(raw: &str) -> Result<BTreeSet<String>, SelectorError> {
    let inner = raw
        .trim()
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| SelectorError::InvalidSet(raw.to_string()))?;
    let set = inner.split(',').map(value).collect::<Result<BTreeSet<_>, _>>()?;
    if set.iter().all(|v| v.is_empty()) {
        return Err(SelectorError::InvalidSet(raw.to_string()));
    }
    Ok(set)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Namespace,
}

impl Field {
    fn value_of<'a, K: Object>(&self, obj: &'a K) -> &'a str {
        let meta = obj.meta();
        match self {
            Field::Name => meta.name.as_deref().unwrap_or(""),
            Field::Namespace => meta.namespace.as_deref().unwrap_or(""),
        }
    }

    fn path(&self) -> &'static str {
        match self {
            Field::Name => "metadata.name",
            Field::Namespace => "metadata.namespace",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRequirement {
    Equals(Field, String),
    NotEquals(Field, String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldSelector {
    requirements: Vec<FieldRequirement>,
}

impl FieldSelector {
    pub fn everything() -> Self { Self::default() }

    pub fn is_everything(&self) -> bool { self.requirements.is_empty() }

    pub fn matches_object<K: Object>(&self, obj: &K) -> bool {
        self.requirements.iter().all(|r| match r {
            FieldRequirement::Equals(f, v) => f.value_of(obj) == v,
            FieldRequirement::NotEquals(f, v) => f.value_of(obj) != v,
        })
    }
}

impl FromStr for FieldSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::everything());
        }
        let mut requirements = Vec::new();
        for term in s.split(',') {
            let term = term.trim();
            if term.is_empty() {
                return Err(SelectorError::EmptyTerm);
            }
            let (path, v, negate) = if let Some((p, v)) = term.split_once("!=") {
                (p, v, true)
            } else if let Some((p, v)) = term.split_once("==") {
                (p, v, false)
            } else if let Some((p, v)) = term.split_once('=') {
                (p, v, false)
            } else {
                return Err(SelectorError::MissingOperator(term.to_string()));
            };
            let field = match path.trim() {
                "metadata.name" => Field::Name,
                "metadata.namespace" => Field::Namespace,
                other => return Err(SelectorError::UnsupportedField(other.to_string())),
            };
            let v = value(v)?;
            requirements.push(if negate { FieldRequirement::NotEquals(field, v) } else { FieldRequirement::Equals(field, v) });
        }
        Ok(Self { requirements })
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|r| match r {
                FieldRequirement::Equals(fld, v) => format!("{}={}", fld.path(), v),
                FieldRequirement::NotEquals(fld, v) => format!("{}!={}", fld.path(), v),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_every_operator() {
        let sel: LabelSelector = "app=web, tier==front,env!=prod,canary,!legacy,zone in (a, b),team notin (x)".parse().unwrap();
        assert_eq!(sel.requirements().len(), 7);
        assert_eq!(sel.requirements()[0], Requirement::Equals("app".into(), "web".into()));
        assert_eq!(sel.requirements()[1], Requirement::Equals("tier".into(), "front".into()));
        assert_eq!(sel.requirements()[2], Requirement::NotEquals("env".into(), "prod".into()));
        assert_eq!(sel.requirements()[3], Requirement::Exists("canary".into()));
        assert_eq!(sel.requirements()[4], Requirement::DoesNotExist("legacy".into()));
        assert_eq!(sel.requirements()[5], Requirement::In("zone".into(), ["a".to_string(), "b".to_string()].into()));
        assert_eq!(sel.requirements()[6], Requirement::NotIn("team".into(), ["x".to_string()].into()));
    }

    #[test]
    fn matching_semantics() {
        let sel: LabelSelector = "app=web,env!=prod,zone in (a,b),!legacy".parse().unwrap();
        assert!(sel.matches(&labels(&[("app", "web"), ("zone", "a")])));
        assert!(sel.matches(&labels(&[("app", "web"), ("zone", "b"), ("env", "dev")])));
        assert!(!sel.matches(&labels(&[("app", "web"), ("zone", "c")])));
        assert!(!sel.matches(&labels(&[("app", "web"), ("zone", "a"), ("env", "prod")])));
        assert!(!sel.matches(&labels(&[("app", "web"), ("zone", "a"), ("legacy", "true")])));
        assert!(!sel.matches(&labels(&[("zone", "a")])));

        // notin matches objects without the key
        let sel: LabelSelector = "team notin (x)".parse().unwrap();
        assert!(sel.matches(&labels(&[])));
        assert!(!sel.matches(&labels(&[("team", "x")])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel: LabelSelector = "  ".parse().unwrap();
        assert!(sel.is_everything());
        assert!(sel.matches(&labels(&[("any", "thing")])));
    }

    #[test]
    fn rejects_malformed_selectors() {
        assert_eq!("a=b,".parse::<LabelSelector>(), Err(SelectorError::EmptyTerm));
        assert!(matches!("zone in (a,b".parse::<LabelSelector>(), Err(SelectorError::Unbalanced(_))));
        assert!(matches!("zone in a,b".parse::<LabelSelector>(), Err(SelectorError::InvalidSet(_))));
        assert!(matches!("a b=c".parse::<LabelSelector>(), Err(SelectorError::InvalidKey(_))));
        assert!(matches!("a=b c".parse::<LabelSelector>(), Err(SelectorError::InvalidValue(_))));
    }

    #[test]
    fn display_is_canonical() {
        let sel: LabelSelector = "app == web,zone in (b,a), !legacy".parse().unwrap();
        assert_eq!(sel.to_string(), "app=web,zone in (a,b),!legacy");
    }

    #[test]
    fn field_selector_on_metadata() {
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some("a".into()), namespace: Some("default".into()), ..Default::default() },
            ..Default::default()
        };
        let sel: FieldSelector = "metadata.namespace=default,metadata.name!=b".parse().unwrap();
        assert!(sel.matches_object(&cm));
        let sel: FieldSelector = "metadata.name==b".parse().unwrap();
        assert!(!sel.matches_object(&cm));
        assert_eq!(sel.to_string(), "metadata.name=b");
        assert!(matches!("spec.nodeName=x".parse::<FieldSelector>(), Err(SelectorError::UnsupportedField(_))));
        assert!(matches!("metadata.name".parse::<FieldSelector>(), Err(SelectorError::MissingOperator(_))));
    }
}
