//! Value ordering for `order_by` and comparisons.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Sort direction of an order-by clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// Placement of nulls, independent of direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nulls {
    #[default]
    First,
    Last,
}

fn type_rank(value: &serde_json::Value) -> u8 {
    match value {
        serde_json::Value::Null => 0,
        serde_json::Value::Bool(_) => 1,
        serde_json::Value::Number(_) => 2,
        serde_json::Value::String(_) => 3,
        serde_json::Value::Array(_) => 4,
        serde_json::Value::Object(_) => 5,
    }
}

/// Total ascending order over JSON values.
///
/// Values of different types order by type (null, bool, number, string,
/// array, object). Objects compare by their serialized form so the order is
/// deterministic.
pub fn compare_values(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    use serde_json::Value;

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                match compare_values(l, r) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Ordering for comparison operators: only values of the same type compare.
pub(crate) fn compare_comparable(
    a: &serde_json::Value,
    b: &serde_json::Value,
) -> Option<Ordering> {
    if a.is_null() || b.is_null() || type_rank(a) != type_rank(b) {
        return None;
    }
    Some(compare_values(a, b))
}

/// One evaluated order-by expression.
#[derive(Debug, Clone)]
pub(crate) struct SortPart {
    pub value: serde_json::Value,
    pub direction: Direction,
    pub nulls: Nulls,
}

impl SortPart {
    fn compare(&self, other: &SortPart) -> Ordering {
        match (self.value.is_null(), other.value.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => match self.nulls {
                Nulls::First => Ordering::Less,
                Nulls::Last => Ordering::Greater,
            },
            (false, true) => match self.nulls {
                Nulls::First => Ordering::Greater,
                Nulls::Last => Ordering::Less,
            },
            (false, false) => {
                let ord = compare_values(&self.value, &other.value);
                match self.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            }
        }
    }
}

/// Evaluated order-by tuple of a result row.
///
/// Paired with the row key in ordered indexes, so equal sort keys fall back
/// to key order.
#[derive(Debug, Clone)]
pub(crate) struct SortKey(pub Vec<SortPart>);

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.compare(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortKey {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(value: serde_json::Value, direction: Direction, nulls: Nulls) -> SortKey {
        SortKey(vec![SortPart {
            value,
            direction,
            nulls,
        }])
    }

    #[test]
    fn numbers_compare_numerically() {
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(1.5), &json!(1)), Ordering::Greater);
        assert_eq!(compare_values(&json!(-3), &json!(2.5)), Ordering::Less);
    }

    #[test]
    fn mixed_types_order_by_rank() {
        assert_eq!(compare_values(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(compare_values(&json!(true), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(99), &json!("a")), Ordering::Less);
        assert_eq!(compare_values(&json!("z"), &json!([])), Ordering::Less);
    }

    #[test]
    fn arrays_compare_lexicographically() {
        assert_eq!(compare_values(&json!([1, 2]), &json!([1, 3])), Ordering::Less);
        assert_eq!(compare_values(&json!([1]), &json!([1, 0])), Ordering::Less);
    }

    #[test]
    fn comparable_requires_same_type() {
        assert_eq!(compare_comparable(&json!(1), &json!("1")), None);
        assert_eq!(compare_comparable(&json!(null), &json!(1)), None);
        assert_eq!(
            compare_comparable(&json!("a"), &json!("b")),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn desc_reverses_values_but_not_nulls() {
        let a = key(json!(1), Direction::Desc, Nulls::First);
        let b = key(json!(2), Direction::Desc, Nulls::First);
        let n = key(json!(null), Direction::Desc, Nulls::First);
        assert!(b < a);
        assert!(n < b);

        let n_last = key(json!(null), Direction::Asc, Nulls::Last);
        let one = key(json!(1), Direction::Asc, Nulls::Last);
        assert!(one < n_last);
    }

    #[test]
    fn multi_part_keys() {
        let a = SortKey(vec![
            SortPart {
                value: json!("x"),
                direction: Direction::Asc,
                nulls: Nulls::First,
            },
            SortPart {
                value: json!(2),
                direction: Direction::Desc,
                nulls: Nulls::First,
            },
        ]);
        let mut b = a.clone();
        b.0[1].value = json!(5);
        assert!(b < a);
        assert_eq!(a, a.clone());
    }
}
