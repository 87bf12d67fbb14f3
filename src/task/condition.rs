// Boolean predicates over a VarBag

use std::fmt;

use super::vars::VarBag;

/// A `when` gate for a task.
///
/// Kept as a tagged value rather than a closure so tasks stay `Debug` and
/// `Clone`, and a condition can be inspected without evaluating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Always,
    Never,
    /// Variable equals `"true"`
    If(String),
    /// Variable is anything but `"true"`
    IfNot(String),
    /// Variable is present and non-empty
    IfSet(String),
    IfEquals(String, String),
    Not(Box<Condition>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    pub fn eval(&self, vars: &VarBag) -> bool {
        match self {
            Condition::Always => true,
            Condition::Never => false,
            Condition::If(key) => vars.get_bool(key),
            Condition::IfNot(key) => !vars.get_bool(key),
            Condition::IfSet(key) => vars.get(key).is_some_and(|v| !v.is_empty()),
            Condition::IfEquals(key, value) => vars.get(key) == Some(value.as_str()),
            Condition::Not(inner) => !inner.eval(vars),
            // `all`/`any` short-circuit on the first false/true
            Condition::And(conds) => conds.iter().all(|c| c.eval(vars)),
            Condition::Or(conds) => conds.iter().any(|c| c.eval(vars)),
        }
    }

    pub fn and(self, other: Condition) -> Condition {
        match self {
            Condition::And(mut conds) => {
                conds.push(other);
                Condition::And(conds)
            }
            first => Condition::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Condition) -> Condition {
        match self {
            Condition::Or(mut conds) => {
                conds.push(other);
                Condition::Or(conds)
            }
            first => Condition::Or(vec![first, other]),
        }
    }
}

impl std::ops::Not for Condition {
    type Output = Condition;

    fn not(self) -> Condition {
        Condition::Not(Box::new(self))
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Always => write!(f, "always"),
            Condition::Never => write!(f, "never"),
            Condition::If(k) => write!(f, "{}", k),
            Condition::IfNot(k) => write!(f, "!{}", k),
            Condition::IfSet(k) => write!(f, "set({})", k),
            Condition::IfEquals(k, v) => write!(f, "{} == {:?}", k, v),
            Condition::Not(inner) => write!(f, "not ({})", inner),
            Condition::And(conds) => write_joined(f, conds, " and "),
            Condition::Or(conds) => write_joined(f, conds, " or "),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, conds: &[Condition], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, c) in conds.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", c)?;
    }
    write!(f, ")")
}

pub fn always() -> Condition {
    Condition::Always
}

pub fn never() -> Condition {
    Condition::Never
}

pub fn if_true(key: impl Into<String>) -> Condition {
    Condition::If(key.into())
}

pub fn if_not(key: impl Into<String>) -> Condition {
    Condition::IfNot(key.into())
}

pub fn if_set(key: impl Into<String>) -> Condition {
    Condition::IfSet(key.into())
}

pub fn if_equals(key: impl Into<String>, value: impl Into<String>) -> Condition {
    Condition::IfEquals(key.into(), value.into())
}

pub fn all(conds: impl IntoIterator<Item = Condition>) -> Condition {
    Condition::And(conds.into_iter().collect())
}

pub fn any(conds: impl IntoIterator<Item = Condition>) -> Condition {
    Condition::Or(conds.into_iter().collect())
}
