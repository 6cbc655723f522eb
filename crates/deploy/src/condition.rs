//! Steady-state condition expressions for custom workloads.
//!
//! Grammar: clauses joined by `&&`, alternatives joined by `||` (`&&` binds tighter).
//! A clause is `<path> == <literal>`, `<path> != <literal>` or a bare `<path>`
//! (true when present and not `false`/`null`). Paths look like
//! `.status.conditions[0].status`; literals are quoted strings, numbers,
//! `true`, `false` or `null`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as Json;

static CLAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\.?[A-Za-z0-9_\-]+(?:\[\d+\])?(?:\.[A-Za-z0-9_\-]+(?:\[\d+\])?)*)\s*(?:(==|!=)\s*(.+?))?\s*$")
        .unwrap_or_else(|e| panic!("clause regex: {}", e))
});

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Eq,
    Ne,
    Truthy,
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    path: Vec<Segment>,
    op: Op,
    literal: Json,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(String, usize),
}

/// Parsed expression: OR of AND-groups.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    any: Vec<Vec<Clause>>,
}

impl Condition {
    pub fn parse(expr: &str) -> Result<Self, String> {
        if expr.trim().is_empty() {
            return Err("empty condition".into());
        }
        let mut any = Vec::new();
        for alt in expr.split("||") {
            let mut all = Vec::new();
            for raw in alt.split("&&") {
                all.push(parse_clause(raw)?);
            }
            any.push(all);
        }
        Ok(Self { any })
    }

    pub fn eval(&self, obj: &Json) -> bool {
        self.any.iter().any(|all| all.iter().all(|c| eval_clause(c, obj)))
    }
}

fn parse_clause(raw: &str) -> Result<Clause, String> {
    let caps = CLAUSE.captures(raw).ok_or_else(|| format!("cannot parse clause `{}`", raw.trim()))?;
    let path_s = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    let path = parse_path(path_s)?;
    let (op, literal) = match (caps.get(2).map(|m| m.as_str()), caps.get(3).map(|m| m.as_str())) {
        (Some("=="), Some(lit)) => (Op::Eq, parse_literal(lit)?),
        (Some("!="), Some(lit)) => (Op::Ne, parse_literal(lit)?),
        _ => (Op::Truthy, Json::Null),
    };
    Ok(Clause { path, op, literal })
}

fn parse_path(p: &str) -> Result<Vec<Segment>, String> {
    let s = p.strip_prefix('.').unwrap_or(p);
    let mut out = Vec::new();
    for seg in s.split('.') {
        if seg.is_empty() {
            return Err(format!("empty segment in path `{}`", p));
        }
        match seg.split_once('[') {
            Some((key, rest)) => {
                let idx = rest.strip_suffix(']').and_then(|i| i.parse::<usize>().ok()).ok_or_else(|| format!("bad index in `{}`", seg))?;
                out.push(Segment::Index(key.to_string(), idx));
            }
            None => out.push(Segment::Key(seg.to_string())),
        }
    }
    Ok(out)
}

fn parse_literal(lit: &str) -> Result<Json, String> {
    let t = lit.trim();
    if t.len() >= 2 && ((t.starts_with('\'') && t.ends_with('\'')) || (t.starts_with('"') && t.ends_with('"'))) {
        return Ok(Json::String(t[1..t.len() - 1].to_string()));
    }
    match t {
        "true" => Ok(Json::Bool(true)),
        "false" => Ok(Json::Bool(false)),
        "null" => Ok(Json::Null),
        _ => serde_json::from_str::<serde_json::Number>(t).map(Json::Number).map_err(|_| format!("bad literal `{}`", t)),
    }
}

fn lookup<'a>(obj: &'a Json, path: &[Segment]) -> Option<&'a Json> {
    let mut cur = obj;
    for seg in path {
        cur = match seg {
            Segment::Key(k) => cur.get(k)?,
            Segment::Index(k, i) => cur.get(k)?.get(*i)?,
        };
    }
    Some(cur)
}

fn eval_clause(c: &Clause, obj: &Json) -> bool {
    let found = lookup(obj, &c.path);
    match c.op {
        Op::Truthy => !matches!(found, None | Some(Json::Null) | Some(Json::Bool(false))),
        Op::Eq => loosely_equal(found.unwrap_or(&Json::Null), &c.literal),
        Op::Ne => !loosely_equal(found.unwrap_or(&Json::Null), &c.literal),
    }
}

/// Strings compare against numbers/bools by their text form.
fn loosely_equal(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::String(s), Json::Number(_) | Json::Bool(_)) => s == &b.to_string(),
        (Json::Number(_) | Json::Bool(_), Json::String(s)) => &a.to_string() == s,
        (Json::Number(x), Json::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj() -> Json {
        json!({"status": {"phase": "Ready", "replicas": 3, "conditions": [{"type": "Ready", "status": "True"}], "paused": false}})
    }

    #[test]
    fn equality_and_indexing() {
        assert!(Condition::parse(".status.phase == 'Ready'").unwrap().eval(&obj()));
        assert!(Condition::parse(".status.conditions[0].status == \"True\"").unwrap().eval(&obj()));
        assert!(Condition::parse(".status.replicas == 3 && .status.phase != 'Failed'").unwrap().eval(&obj()));
        assert!(!Condition::parse(".status.replicas == 4").unwrap().eval(&obj()));
    }

    #[test]
    fn or_and_truthiness() {
        assert!(Condition::parse(".status.paused || .status.phase == 'Ready'").unwrap().eval(&obj()));
        assert!(!Condition::parse(".status.paused").unwrap().eval(&obj()));
        assert!(!Condition::parse(".status.missing.deeper == 'x'").unwrap().eval(&obj()));
        assert!(Condition::parse(".status.missing == null").unwrap().eval(&obj()));
    }

    #[test]
    fn rejects_malformed() {
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse(".status.phase === 'x'").is_err());
        assert!(Condition::parse(".status[*].x == 1").is_err());
        assert!(Condition::parse(".status.phase == Ready").is_err());
    }
}
