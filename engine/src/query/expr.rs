//! Query expressions.
//!
//! An [`Expr`] is a small tree of column references, literal values and
//! function calls. Before a live query runs, its expressions are compiled
//! against the query's alias list so column references resolve to tuple
//! slots.
//!
//! Logic is three-valued: comparing with null yields null, and a filter only
//! passes a row whose predicate is exactly `true`.
//!
//! Aggregates ([`count`], [`sum`], [`avg`], [`min`], [`max`]) are only valid
//! as top-level fields of a grouped query's `select`. Expressions evaluated
//! after grouping read the selected row through the [`SELECTED`] alias.

use super::order::compare_comparable;
use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::rc::Rc;

/// Built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Func {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Not,
    In,
    Like,
    ILike,
    IsNull,
    Upper,
    Lower,
    Length,
    Concat,
    Coalesce,
    Add,
}

/// Aggregate functions of grouped queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AggFunc {
    /// Non-null inputs
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// An expression over the rows bound to a query's aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Expr {
    /// A field of an aliased row. An empty path is the whole row.
    Ref { alias: String, path: Vec<String> },
    Val { value: Value },
    Func { func: Func, args: Vec<Expr> },
    Agg { func: AggFunc, arg: Box<Expr> },
}

/// Alias of the selected row in `having` and in the `order_by` of grouped
/// or distinct queries.
pub const SELECTED: &str = "$selected";

/// Reference a field of an aliased row, e.g. `col("todo", "owner.id")`.
pub fn col(alias: impl Into<String>, path: &str) -> Expr {
    Expr::Ref {
        alias: alias.into(),
        path: path
            .split('.')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

/// Reference the whole row bound to an alias.
pub fn row(alias: impl Into<String>) -> Expr {
    Expr::Ref {
        alias: alias.into(),
        path: Vec::new(),
    }
}

pub fn val(value: impl Into<Value>) -> Expr {
    Expr::Val {
        value: value.into(),
    }
}

fn call(func: Func, args: Vec<Expr>) -> Expr {
    Expr::Func { func, args }
}

pub fn eq(a: Expr, b: Expr) -> Expr {
    call(Func::Eq, vec![a, b])
}

pub fn ne(a: Expr, b: Expr) -> Expr {
    call(Func::Ne, vec![a, b])
}

pub fn gt(a: Expr, b: Expr) -> Expr {
    call(Func::Gt, vec![a, b])
}

pub fn gte(a: Expr, b: Expr) -> Expr {
    call(Func::Gte, vec![a, b])
}

pub fn lt(a: Expr, b: Expr) -> Expr {
    call(Func::Lt, vec![a, b])
}

pub fn lte(a: Expr, b: Expr) -> Expr {
    call(Func::Lte, vec![a, b])
}

pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Expr {
    call(Func::And, exprs.into_iter().collect())
}

pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Expr {
    call(Func::Or, exprs.into_iter().collect())
}

pub fn not(expr: Expr) -> Expr {
    call(Func::Not, vec![expr])
}

/// Membership in an array-valued expression.
pub fn in_array(expr: Expr, list: Expr) -> Expr {
    call(Func::In, vec![expr, list])
}

/// SQL `LIKE`: `%` matches any run, `_` any single character.
pub fn like(expr: Expr, pattern: Expr) -> Expr {
    call(Func::Like, vec![expr, pattern])
}

/// Case-insensitive [`like`].
pub fn ilike(expr: Expr, pattern: Expr) -> Expr {
    call(Func::ILike, vec![expr, pattern])
}

pub fn is_null(expr: Expr) -> Expr {
    call(Func::IsNull, vec![expr])
}

pub fn upper(expr: Expr) -> Expr {
    call(Func::Upper, vec![expr])
}

pub fn lower(expr: Expr) -> Expr {
    call(Func::Lower, vec![expr])
}

pub fn length(expr: Expr) -> Expr {
    call(Func::Length, vec![expr])
}

pub fn concat(exprs: impl IntoIterator<Item = Expr>) -> Expr {
    call(Func::Concat, exprs.into_iter().collect())
}

pub fn coalesce(exprs: impl IntoIterator<Item = Expr>) -> Expr {
    call(Func::Coalesce, exprs.into_iter().collect())
}

pub fn add(a: Expr, b: Expr) -> Expr {
    call(Func::Add, vec![a, b])
}

fn aggregate(func: AggFunc, arg: Expr) -> Expr {
    Expr::Agg {
        func,
        arg: Box::new(arg),
    }
}

/// Number of rows in the group where `expr` is not null.
pub fn count(expr: Expr) -> Expr {
    aggregate(AggFunc::Count, expr)
}

/// Sum of the numeric inputs; `0` for a group without any.
pub fn sum(expr: Expr) -> Expr {
    aggregate(AggFunc::Sum, expr)
}

/// Mean of the numeric inputs; null for a group without any.
pub fn avg(expr: Expr) -> Expr {
    aggregate(AggFunc::Avg, expr)
}

pub fn min(expr: Expr) -> Expr {
    aggregate(AggFunc::Min, expr)
}

pub fn max(expr: Expr) -> Expr {
    aggregate(AggFunc::Max, expr)
}

/// Reference a field of the selected row, e.g. in `having`.
pub fn selected(field: &str) -> Expr {
    Expr::Ref {
        alias: SELECTED.to_string(),
        path: vec![field.to_string()],
    }
}

impl Expr {
    /// Aliases referenced anywhere in the expression.
    pub fn aliases(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_aliases(&mut out);
        out
    }

    fn collect_aliases<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Ref { alias, .. } => {
                out.insert(alias.as_str());
            }
            Expr::Val { .. } => {}
            Expr::Func { args, .. } => {
                for arg in args {
                    arg.collect_aliases(out);
                }
            }
            Expr::Agg { arg, .. } => arg.collect_aliases(out),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Expr::Agg { .. })
    }

    /// Whether an aggregate appears anywhere in the expression.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expr::Agg { .. } => true,
            Expr::Func { args, .. } => args.iter().any(Expr::contains_aggregate),
            Expr::Ref { .. } | Expr::Val { .. } => false,
        }
    }

    /// Resolve alias references to tuple slots.
    pub(crate) fn compile(&self, aliases: &[String]) -> Result<CompiledExpr> {
        Ok(match self {
            Expr::Ref { alias, path } => {
                let slot = aliases
                    .iter()
                    .position(|a| a == alias)
                    .ok_or_else(|| Error::UnknownAlias(alias.clone()))?;
                CompiledExpr::Ref {
                    slot,
                    path: path.clone(),
                }
            }
            Expr::Val { value } => CompiledExpr::Val(value.clone()),
            Expr::Func { func, args } => CompiledExpr::Func {
                func: *func,
                args: args
                    .iter()
                    .map(|a| a.compile(aliases))
                    .collect::<Result<_>>()?,
            },
            Expr::Agg { func, .. } => {
                return Err(Error::InvalidAggregation(format!(
                    "{func:?} is only valid as a select field of a grouped query"
                )));
            }
        })
    }
}

/// Rows bound to a query's aliases, by slot. `None` is the missing side of
/// an outer join.
pub(crate) type Tuple = Vec<Option<Rc<Value>>>;

#[derive(Debug, Clone)]
pub(crate) enum CompiledExpr {
    Ref { slot: usize, path: Vec<String> },
    Val(Value),
    Func { func: Func, args: Vec<CompiledExpr> },
}

impl CompiledExpr {
    pub fn eval(&self, tuple: &Tuple) -> Value {
        match self {
            CompiledExpr::Ref { slot, path } => {
                let Some(Some(row)) = tuple.get(*slot) else {
                    return Value::Null;
                };
                lookup(row, path).cloned().unwrap_or(Value::Null)
            }
            CompiledExpr::Val(value) => value.clone(),
            CompiledExpr::Func { func, args } => apply(*func, args, tuple),
        }
    }

    /// Whether the expression evaluates to exactly `true`.
    pub fn is_true(&self, tuple: &Tuple) -> bool {
        matches!(self.eval(tuple), Value::Bool(true))
    }
}

fn lookup<'a>(row: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(row, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Loose equality: numbers compare numerically, everything else structurally.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_comparable(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value, accept: fn(Ordering) -> bool) -> Value {
    if a.is_null() || b.is_null() {
        return Value::Null;
    }
    Value::Bool(compare_comparable(a, b).is_some_and(accept))
}

fn apply(func: Func, args: &[CompiledExpr], tuple: &Tuple) -> Value {
    let arg = |i: usize| args.get(i).map_or(Value::Null, |a| a.eval(tuple));

    match func {
        Func::Eq | Func::Ne => {
            let (a, b) = (arg(0), arg(1));
            if a.is_null() || b.is_null() {
                return Value::Null;
            }
            Value::Bool(values_equal(&a, &b) == (func == Func::Eq))
        }
        Func::Gt => compare(&arg(0), &arg(1), |o| o == Ordering::Greater),
        Func::Gte => compare(&arg(0), &arg(1), |o| o != Ordering::Less),
        Func::Lt => compare(&arg(0), &arg(1), |o| o == Ordering::Less),
        Func::Lte => compare(&arg(0), &arg(1), |o| o != Ordering::Greater),
        Func::And => {
            let mut unknown = false;
            for a in args {
                match a.eval(tuple) {
                    Value::Bool(false) => return Value::Bool(false),
                    Value::Bool(true) => {}
                    _ => unknown = true,
                }
            }
            if unknown {
                Value::Null
            } else {
                Value::Bool(true)
            }
        }
        Func::Or => {
            let mut unknown = false;
            for a in args {
                match a.eval(tuple) {
                    Value::Bool(true) => return Value::Bool(true),
                    Value::Bool(false) => {}
                    _ => unknown = true,
                }
            }
            if unknown {
                Value::Null
            } else {
                Value::Bool(false)
            }
        }
        Func::Not => match arg(0) {
            Value::Bool(b) => Value::Bool(!b),
            _ => Value::Null,
        },
        Func::In => {
            let needle = arg(0);
            if needle.is_null() {
                return Value::Null;
            }
            match arg(1) {
                Value::Array(items) => Value::Bool(items.iter().any(|v| values_equal(&needle, v))),
                _ => Value::Null,
            }
        }
        Func::Like | Func::ILike => match (arg(0), arg(1)) {
            (Value::String(s), Value::String(p)) if func == Func::ILike => {
                Value::Bool(like_match(&s.to_lowercase(), &p.to_lowercase()))
            }
            (Value::String(s), Value::String(p)) => Value::Bool(like_match(&s, &p)),
            _ => Value::Null,
        },
        Func::IsNull => Value::Bool(arg(0).is_null()),
        Func::Upper => match arg(0) {
            Value::String(s) => Value::String(s.to_uppercase()),
            _ => Value::Null,
        },
        Func::Lower => match arg(0) {
            Value::String(s) => Value::String(s.to_lowercase()),
            _ => Value::Null,
        },
        Func::Length => match arg(0) {
            Value::String(s) => Value::from(s.chars().count()),
            Value::Array(items) => Value::from(items.len()),
            _ => Value::Null,
        },
        Func::Concat => {
            let mut out = String::new();
            for a in args {
                match a.eval(tuple) {
                    Value::Null => {}
                    Value::String(s) => out.push_str(&s),
                    other => out.push_str(&other.to_string()),
                }
            }
            Value::String(out)
        }
        Func::Coalesce => args
            .iter()
            .map(|a| a.eval(tuple))
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null),
        Func::Add => match (arg(0), arg(1)) {
            (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => a.checked_add(b).map_or(Value::Null, Value::from),
                _ => match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => serde_json::Number::from_f64(a + b)
                        .map_or(Value::Null, Value::Number),
                    _ => Value::Null,
                },
            },
            _ => Value::Null,
        },
    }
}

/// SQL `LIKE` matching over characters.
fn like_match(input: &str, pattern: &str) -> bool {
    let s: Vec<char> = input.chars().collect();
    let p: Vec<char> = pattern.chars().collect();

    // Greedy matching with backtracking to the last `%`
    let (mut si, mut pi) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while si < s.len() {
        if pi < p.len() && p[pi] == '%' {
            star = Some((pi, si));
            pi += 1;
        } else if pi < p.len() && (p[pi] == '_' || p[pi] == s[si]) {
            si += 1;
            pi += 1;
        } else if let Some((star_pi, star_si)) = star {
            pi = star_pi + 1;
            si = star_si + 1;
            star = Some((star_pi, star_si + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|c| *c == '%')
}
