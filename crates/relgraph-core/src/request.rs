//! Resolution request expressions.
//!
//! Grammar:
//!
//! ```text
//! latest                      newest successful build on any channel
//! latest-on-<ref>             newest build reachable from a ref
//! latest-<channel>            newest build on one promotion channel
//! >=1.0.0 <2.0.0              comparator set (space or comma separated)
//! >=1.0.0 <2.0.0 || >=3.0.0   alternatives
//! [1.0.0,2.0.0)               interval; "(,2.0.0]", "[1.0.0,)", "[1.2.3]"
//! [1.0,2.0),[3.0,4.0)         union of intervals
//! 1.2.3                       exact version string
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use relgraph_state::Channel;
use semver::Version;

use crate::error::VersionParseError;
use crate::version::{cmp_precedence, parse_version};

/// A parsed resolution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionRequest {
    Exact(String),
    Range(VersionRange),
    Latest,
    /// Ref name as given; resolved verbatim, then under `refs/heads/`, then `refs/tags/`.
    LatestOnRef(String),
    LatestOnChannel(Channel),
}

impl ResolutionRequest {
    pub fn parse(expression: &str) -> Result<Self, VersionParseError> {
        let expr = expression.trim();
        if expr.is_empty() {
            return Err(VersionParseError::new(expression, "empty expression"));
        }
        if expr == "latest" {
            return Ok(ResolutionRequest::Latest);
        }
        if let Some(name) = expr.strip_prefix("latest-on-") {
            if name.is_empty() {
                return Err(VersionParseError::new(expression, "missing ref name"));
            }
            return Ok(ResolutionRequest::LatestOnRef(name.to_string()));
        }
        if let Some(channel) = expr.strip_prefix("latest-") {
            let channel = Channel::parse(channel)
                .map_err(|e| VersionParseError::new(expression, e.to_string()))?;
            return Ok(ResolutionRequest::LatestOnChannel(channel));
        }
        if expr.starts_with(&['[', '('][..]) {
            return Ok(ResolutionRequest::Range(VersionRange::parse_intervals(
                expr,
            )?));
        }
        if expr.starts_with(&['>', '<', '='][..]) {
            return Ok(ResolutionRequest::Range(VersionRange::parse_comparators(
                expr,
            )?));
        }
        Ok(ResolutionRequest::Exact(expr.to_string()))
    }
}

impl FromStr for ResolutionRequest {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResolutionRequest::parse(s)
    }
}

/// Canonical form; equal requests render identically.
impl fmt::Display for ResolutionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionRequest::Exact(v) => write!(f, "exact:{v}"),
            ResolutionRequest::Range(r) => write!(f, "range:{r}"),
            ResolutionRequest::Latest => f.write_str("latest"),
            ResolutionRequest::LatestOnRef(name) => write!(f, "latest-on:{name}"),
            ResolutionRequest::LatestOnChannel(c) => write!(f, "latest-channel:{c}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Eq => "=",
        }
    }

    fn admits(self, ord: Ordering) -> bool {
        match self {
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
            Op::Eq => ord == Ordering::Equal,
        }
    }
}

/// One bound predicate: `candidate <op> version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparator {
    pub op: Op,
    pub version: Version,
}

impl Comparator {
    fn new(op: Op, raw: &str, input: &str) -> Result<Self, VersionParseError> {
        let version = parse_version(raw)
            .map_err(|_| VersionParseError::new(input, format!("bad bound {raw:?}")))?;
        Ok(Self { op, version })
    }
}

/// Outcome of testing one version against a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeMatch {
    pub matched: bool,
    /// The candidate was not semver and was compared byte-wise.
    pub approximate: bool,
}

/// Disjunction of comparator sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    alternatives: Vec<Vec<Comparator>>,
}

impl VersionRange {
    pub fn alternatives(&self) -> &[Vec<Comparator>] {
        &self.alternatives
    }

    pub fn evaluate(&self, candidate: &str) -> RangeMatch {
        match parse_version(candidate) {
            Ok(version) => RangeMatch {
                matched: self.alternatives.iter().any(|set| {
                    set.iter()
                        .all(|c| c.op.admits(cmp_precedence(&version, &c.version)))
                }),
                approximate: false,
            },
            // byte-wise against the normalized bound, as printed by `Display`
            Err(_) => RangeMatch {
                matched: self.alternatives.iter().any(|set| {
                    set.iter().all(|c| {
                        let bound = c.version.to_string();
                        c.op.admits(candidate.as_bytes().cmp(bound.as_bytes()))
                    })
                }),
                approximate: true,
            },
        }
    }

    fn parse_comparators(input: &str) -> Result<Self, VersionParseError> {
        let mut alternatives = Vec::new();
        for part in input.split("||") {
            let mut set = Vec::new();
            let mut pending: Option<Op> = None;
            for token in part
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|t| !t.is_empty())
            {
                let (op, rest) = split_op(token);
                let op = match (pending.take(), op) {
                    (Some(_), Some(_)) => {
                        return Err(VersionParseError::new(input, "operator without version"))
                    }
                    (Some(op), None) => op,
                    (None, Some(op)) if rest.is_empty() => {
                        pending = Some(op);
                        continue;
                    }
                    (None, Some(op)) => op,
                    (None, None) => Op::Eq,
                };
                set.push(Comparator::new(op, rest, input)?);
            }
            if pending.is_some() {
                return Err(VersionParseError::new(input, "operator without version"));
            }
            if set.is_empty() {
                return Err(VersionParseError::new(input, "empty comparator set"));
            }
            alternatives.push(set);
        }
        Ok(Self { alternatives })
    }

    fn parse_intervals(input: &str) -> Result<Self, VersionParseError> {
        let mut alternatives = Vec::new();
        let mut rest = input.trim();
        while !rest.is_empty() {
            let lower_inclusive = match rest.chars().next() {
                Some('[') => true,
                Some('(') => false,
                _ => return Err(VersionParseError::new(input, "expected '[' or '('")),
            };
            let close = rest
                .find(&[']', ')'][..])
                .ok_or_else(|| VersionParseError::new(input, "unterminated interval"))?;
            let upper_inclusive = rest.as_bytes()[close] == b']';
            let body = &rest[1..close];
            rest = rest[close + 1..].trim_start();
            rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();

            let mut set = Vec::new();
            match body.split_once(',') {
                None => {
                    if !(lower_inclusive && upper_inclusive) {
                        return Err(VersionParseError::new(
                            input,
                            "single-version interval must be [v]",
                        ));
                    }
                    set.push(Comparator::new(Op::Eq, body.trim(), input)?);
                }
                Some((low, high)) => {
                    let (low, high) = (low.trim(), high.trim());
                    if !low.is_empty() {
                        let op = if lower_inclusive { Op::Ge } else { Op::Gt };
                        set.push(Comparator::new(op, low, input)?);
                    }
                    if !high.is_empty() {
                        let op = if upper_inclusive { Op::Le } else { Op::Lt };
                        set.push(Comparator::new(op, high, input)?);
                    }
                    if set.is_empty() {
                        return Err(VersionParseError::new(input, "interval has no bounds"));
                    }
                }
            }
            alternatives.push(set);
        }
        if alternatives.is_empty() {
            return Err(VersionParseError::new(input, "empty interval list"));
        }
        Ok(Self { alternatives })
    }
}

fn split_op(token: &str) -> (Option<Op>, &str) {
    for (prefix, op) in [
        (">=", Op::Ge),
        ("<=", Op::Le),
        (">", Op::Gt),
        ("<", Op::Lt),
        ("=", Op::Eq),
    ] {
        if let Some(rest) = token.strip_prefix(prefix) {
            return (Some(op), rest);
        }
    }
    (None, token)
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, set) in self.alternatives.iter().enumerate() {
            if i > 0 {
                f.write_str(" || ")?;
            }
            for (j, c) in set.iter().enumerate() {
                if j > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{}{}", c.op.as_str(), c.version)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(expr: &str) -> VersionRange {
        match ResolutionRequest::parse(expr).unwrap() {
            ResolutionRequest::Range(r) => r,
            other => panic!("expected range, got {other:?}"),
        }
    }

    #[test]
    fn symbolic_selectors() {
        assert_eq!(
            ResolutionRequest::parse("latest").unwrap(),
            ResolutionRequest::Latest
        );
        assert_eq!(
            ResolutionRequest::parse("latest-on-main").unwrap(),
            ResolutionRequest::LatestOnRef("main".into())
        );
        assert_eq!(
            ResolutionRequest::parse("latest-on-refs/heads/release/1.x").unwrap(),
            ResolutionRequest::LatestOnRef("refs/heads/release/1.x".into())
        );
        assert_eq!(
            ResolutionRequest::parse("latest-Stable").unwrap(),
            ResolutionRequest::LatestOnChannel(Channel::stable())
        );
        assert_eq!(
            ResolutionRequest::parse(" 1.2.3 ").unwrap(),
            ResolutionRequest::Exact("1.2.3".into())
        );
        assert!(ResolutionRequest::parse("").is_err());
        assert!(ResolutionRequest::parse("latest-on-").is_err());
    }

    #[test]
    fn comparator_set_is_conjunction() {
        let r = range(">=1.0.0 <2.0.0");
        assert!(r.evaluate("1.0.0").matched);
        assert!(r.evaluate("1.1.0").matched);
        assert!(!r.evaluate("2.0.0").matched);
        assert!(!r.evaluate("0.9.0").matched);
        // pure precedence: a prerelease of 2.0.0 is below 2.0.0
        assert!(r.evaluate("2.0.0-rc1").matched);
    }

    #[test]
    fn comparators_accept_commas_and_detached_operators() {
        assert_eq!(range(">=1.0.0, <2.0.0"), range(">= 1.0.0 < 2.0.0"));
        assert!(ResolutionRequest::parse(">=").is_err());
        assert!(ResolutionRequest::parse(">=1.0.0 <").is_err());
        assert!(ResolutionRequest::parse(">=abc").is_err());
    }

    #[test]
    fn alternatives_are_disjunction() {
        let r = range("<1.0.0 || >=3.0.0");
        assert!(r.evaluate("0.5.0").matched);
        assert!(r.evaluate("3.1.0").matched);
        assert!(!r.evaluate("2.0.0").matched);
    }

    #[test]
    fn maven_intervals() {
        let r = range("[1.0.0,2.0.0)");
        assert!(r.evaluate("1.0.0").matched);
        assert!(!r.evaluate("2.0.0").matched);

        let upper = range("(,2.0]");
        assert!(upper.evaluate("2.0.0").matched);
        assert!(upper.evaluate("0.1.0").matched);

        let exact = range("[1.2.3]");
        assert!(exact.evaluate("1.2.3").matched);
        assert!(!exact.evaluate("1.2.4").matched);

        let union = range("[1.0,2.0),[3.0,4.0)");
        assert_eq!(union.alternatives().len(), 2);
        assert!(union.evaluate("3.5.0").matched);
        assert!(!union.evaluate("2.5.0").matched);

        assert!(ResolutionRequest::parse("[1.0.0,2.0.0").is_err());
        assert!(ResolutionRequest::parse("(1.0.0)").is_err());
        assert!(ResolutionRequest::parse("[,]").is_err());
    }

    #[test]
    fn non_semver_candidate_is_approximate() {
        let r = range(">=1.0.0");
        let m = r.evaluate("nightly");
        assert!(m.approximate);
        // "n" sorts after "1" byte-wise
        assert!(m.matched);
    }

    #[test]
    fn equal_display_means_equal_matches() {
        let plain = range(">=1.0.0");
        let prefixed = range(">=v1.0.0");
        assert_eq!(plain.to_string(), prefixed.to_string());
        for candidate in ["nightly", "1.0.0", "0.9.0", "build-7"] {
            assert_eq!(plain.evaluate(candidate), prefixed.evaluate(candidate));
        }
    }

    #[test]
    fn display_is_canonical() {
        let a = ResolutionRequest::parse(">=1.0 <2").unwrap();
        let b = ResolutionRequest::parse(">=1.0.0,  <2.0.0").unwrap();
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a.to_string(), "range:>=1.0.0 <2.0.0");
    }
}
