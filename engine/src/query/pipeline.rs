//! Incremental evaluation of a compiled query.
//!
//! Changes from source collections flow through a fixed chain of stages:
//!
//! 1. pushdown filters on each input, for aliases that are never
//!    null-extended by an outer join
//! 2. one join stage per joined alias, left-deep
//! 3. residual filters and predicate functions
//! 4. one of: projection and sort key evaluation, a group stage, or a
//!    distinct stage
//! 5. an ordered window when the query has `limit` or `offset`
//!
//! Join stages keep their inputs indexed by join value, so a change on
//! either side only revisits the rows sharing its old or new join value.
//! The group stage keeps per-group accumulators that rows are added to and
//! retracted from, so a change only recomputes the groups it touches.

use super::expr::{AggFunc, CompiledExpr, Expr, Tuple, SELECTED};
use super::order::{compare_values, SortKey, SortPart};
use super::{Direction, JoinKind, Nulls, Query, RowMapper, RowPredicate, Select};
use crate::{error::Result, CollectionName, Error, Key, RowDiagnostic};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

/// A change to one source row, routed to the alias slot it is bound to.
#[derive(Debug, Clone)]
pub(crate) struct SourceChange {
    pub slot: usize,
    pub key: Key,
    /// New visible value, `None` when the row was removed
    pub value: Option<Value>,
}

/// A result row and its sort key, or `None` when the key left the result.
pub(crate) type OutputRow = (Key, Option<(Value, Option<SortKey>)>);

#[derive(Debug, Default)]
pub(crate) struct PipelineOutput {
    pub rows: Vec<OutputRow>,
    pub diagnostics: Vec<RowDiagnostic>,
}

/// Source keys identifying one joined row; `Key::Null` for a missing side.
type RowId = Vec<Key>;

type Delta = Vec<(RowId, Option<Tuple>)>;

fn bind(width: usize, slot: usize, row: Rc<Value>) -> Tuple {
    let mut tuple = vec![None; width];
    tuple[slot] = Some(row);
    tuple
}

/// Hashable form of a join value. Null never joins.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum JoinValue {
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    Other(String),
}

impl JoinValue {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(JoinValue::Bool(*b)),
            Value::Number(n) => Some(match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => JoinValue::Int(i),
                // Whole floats join with integers
                (None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
                    JoinValue::Int(f as i64)
                }
                (None, Some(f)) => JoinValue::Float(f.to_bits()),
                (None, None) => JoinValue::Other(n.to_string()),
            }),
            Value::String(s) => Some(JoinValue::Str(s.clone())),
            other => Some(JoinValue::Other(other.to_string())),
        }
    }
}

struct JoinStage {
    kind: JoinKind,
    slot: usize,
    width: usize,
    /// Evaluated on left tuples
    left_key: CompiledExpr,
    /// Evaluated on a one-slot tuple holding the right row
    right_key: CompiledExpr,
    left: BTreeMap<RowId, Tuple>,
    left_index: HashMap<JoinValue, BTreeSet<RowId>>,
    right: BTreeMap<Key, Rc<Value>>,
    right_index: HashMap<JoinValue, BTreeSet<Key>>,
}

impl JoinStage {
    fn keeps_left(&self) -> bool {
        matches!(self.kind, JoinKind::Left | JoinKind::Full)
    }

    fn keeps_right(&self) -> bool {
        matches!(self.kind, JoinKind::Right | JoinKind::Full)
    }

    fn left_value(&self, tuple: &Tuple) -> Option<JoinValue> {
        JoinValue::of(&self.left_key.eval(tuple))
    }

    fn right_value(&self, row: &Rc<Value>) -> Option<JoinValue> {
        JoinValue::of(&self.right_key.eval(&vec![Some(row.clone())]))
    }

    fn process(&mut self, left_delta: Delta, right_delta: Vec<(Key, Option<Rc<Value>>)>) -> Delta {
        let mut lefts = BTreeSet::new();
        let mut rights = BTreeSet::new();

        for (id, tuple) in &left_delta {
            lefts.insert(id.clone());
            if self.keeps_right() {
                let old = self.left.get(id).and_then(|t| self.left_value(t));
                let new = tuple.as_ref().and_then(|t| self.left_value(t));
                for value in old.iter().chain(new.iter()) {
                    if let Some(keys) = self.right_index.get(value) {
                        rights.extend(keys.iter().cloned());
                    }
                }
            }
        }

        for (key, row) in &right_delta {
            rights.insert(key.clone());
            let old = self.right.get(key).and_then(|r| self.right_value(r));
            let new = row.as_ref().and_then(|r| self.right_value(r));
            for value in old.iter().chain(new.iter()) {
                if let Some(ids) = self.left_index.get(value) {
                    lefts.extend(ids.iter().cloned());
                }
            }
        }

        let before = self.outputs(&lefts, &rights);
        for (id, tuple) in left_delta {
            self.set_left(id, tuple);
        }
        for (key, row) in right_delta {
            self.set_right(key, row);
        }
        let after = self.outputs(&lefts, &rights);

        diff(before, after)
    }

    fn set_left(&mut self, id: RowId, tuple: Option<Tuple>) {
        if let Some(old) = self.left.remove(&id) {
            if let Some(value) = self.left_value(&old) {
                if let Some(ids) = self.left_index.get_mut(&value) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        self.left_index.remove(&value);
                    }
                }
            }
        }
        if let Some(tuple) = tuple {
            if let Some(value) = self.left_value(&tuple) {
                self.left_index.entry(value).or_default().insert(id.clone());
            }
            self.left.insert(id, tuple);
        }
    }

    fn set_right(&mut self, key: Key, row: Option<Rc<Value>>) {
        if let Some(old) = self.right.remove(&key) {
            if let Some(value) = self.right_value(&old) {
                if let Some(keys) = self.right_index.get_mut(&value) {
                    keys.remove(&key);
                    if keys.is_empty() {
                        self.right_index.remove(&value);
                    }
                }
            }
        }
        if let Some(row) = row {
            if let Some(value) = self.right_value(&row) {
                self.right_index.entry(value).or_default().insert(key.clone());
            }
            self.right.insert(key, row);
        }
    }

    /// Joined rows produced by the given left and right rows.
    fn outputs(&self, lefts: &BTreeSet<RowId>, rights: &BTreeSet<Key>) -> BTreeMap<RowId, Tuple> {
        let mut out = BTreeMap::new();

        for id in lefts {
            let Some(tuple) = self.left.get(id) else {
                continue;
            };
            let matches = self
                .left_value(tuple)
                .and_then(|value| self.right_index.get(&value))
                .filter(|keys| !keys.is_empty());

            match matches {
                Some(keys) => {
                    for key in keys {
                        if let Some(row) = self.right.get(key) {
                            let mut joined_id = id.clone();
                            joined_id.push(key.clone());
                            let mut joined = tuple.clone();
                            joined[self.slot] = Some(row.clone());
                            out.insert(joined_id, joined);
                        }
                    }
                }
                None if self.keeps_left() => {
                    let mut joined_id = id.clone();
                    joined_id.push(Key::Null);
                    out.insert(joined_id, tuple.clone());
                }
                None => {}
            }
        }

        if self.keeps_right() {
            for key in rights {
                let Some(row) = self.right.get(key) else {
                    continue;
                };
                let matched = self
                    .right_value(row)
                    .and_then(|value| self.left_index.get(&value))
                    .is_some_and(|ids| !ids.is_empty());
                if !matched {
                    let mut joined_id = vec![Key::Null; self.slot];
                    joined_id.push(key.clone());
                    out.insert(joined_id, bind(self.width, self.slot, row.clone()));
                }
            }
        }

        out
    }
}

fn diff(before: BTreeMap<RowId, Tuple>, after: BTreeMap<RowId, Tuple>) -> Delta {
    let mut out = Vec::new();
    for id in before.keys() {
        if !after.contains_key(id) {
            out.push((id.clone(), None));
        }
    }
    for (id, tuple) in after {
        if before.get(&id) != Some(&tuple) {
            out.push((id, Some(tuple)));
        }
    }
    out
}

/// Ordered `limit`/`offset` window over the full result.
#[derive(Default)]
struct Window {
    offset: usize,
    limit: Option<usize>,
    ordered: BTreeSet<(SortKey, Key)>,
    rows: HashMap<Key, (Value, SortKey)>,
}

impl Window {
    fn visible(&self) -> BTreeSet<Key> {
        let keys = self.ordered.iter().skip(self.offset).map(|(_, k)| k.clone());
        match self.limit {
            Some(n) => keys.take(n).collect(),
            None => keys.collect(),
        }
    }

    /// Apply result changes and return the changes to the window's contents.
    fn apply(&mut self, changes: Vec<OutputRow>) -> Vec<OutputRow> {
        let before = self.visible();
        let mut touched = BTreeSet::new();

        for (key, row) in changes {
            if let Some((_, sort)) = self.rows.remove(&key) {
                self.ordered.remove(&(sort, key.clone()));
            }
            if let Some((value, Some(sort))) = row {
                self.ordered.insert((sort.clone(), key.clone()));
                self.rows.insert(key.clone(), (value, sort));
            }
            touched.insert(key);
        }

        let after = self.visible();
        let mut out: Vec<OutputRow> = before
            .difference(&after)
            .map(|key| (key.clone(), None))
            .collect();
        for key in &after {
            if before.contains(key) && !touched.contains(key) {
                continue;
            }
            if let Some((value, sort)) = self.rows.get(key) {
                out.push((key.clone(), Some((value.clone(), Some(sort.clone())))));
            }
        }
        out
    }
}

type Order = Vec<(CompiledExpr, Direction, Nulls)>;

/// Sort key of a result row; empty when only a window needs one.
fn sort_key(order: &Order, sorted: bool, tuple: &Tuple) -> Option<SortKey> {
    sorted.then(|| {
        SortKey(
            order
                .iter()
                .map(|(expr, direction, nulls)| SortPart {
                    value: expr.eval(tuple),
                    direction: *direction,
                    nulls: *nulls,
                })
                .collect(),
        )
    })
}

/// One-slot tuple holding a selected row, the scope of [`SELECTED`].
fn selected_tuple(value: &Value) -> Tuple {
    vec![Some(Rc::new(value.clone()))]
}

/// JSON value ordered by [`compare_values`].
#[derive(Debug, Clone)]
struct Ordered(Value);

impl Ord for Ordered {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_values(&self.0, &other.0)
    }
}

impl PartialOrd for Ordered {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ordered {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ordered {}

fn step(n: &mut usize, add: bool) {
    if add {
        *n += 1;
    } else {
        *n = n.saturating_sub(1);
    }
}

/// Running state of one aggregate over one group. Nulls are ignored.
#[derive(Debug, Default)]
struct Accumulator {
    count: usize,
    /// Numeric inputs, split so integer sums stay exact
    numbers: usize,
    int_sum: i128,
    float_inputs: usize,
    float_sum: f64,
    /// Input multiset for min and max
    ordered: BTreeMap<Ordered, usize>,
}

impl Accumulator {
    fn update(&mut self, func: AggFunc, value: &Value, add: bool) {
        if value.is_null() {
            return;
        }
        step(&mut self.count, add);

        match func {
            AggFunc::Count => {}
            AggFunc::Sum | AggFunc::Avg => {
                let Value::Number(n) = value else {
                    return;
                };
                step(&mut self.numbers, add);
                match n.as_i64() {
                    Some(i) if add => self.int_sum += i128::from(i),
                    Some(i) => self.int_sum -= i128::from(i),
                    None => {
                        let f = n.as_f64().unwrap_or(0.0);
                        step(&mut self.float_inputs, add);
                        if add {
                            self.float_sum += f;
                        } else {
                            self.float_sum -= f;
                        }
                        // Drop rounding residue once the last float leaves
                        if self.float_inputs == 0 {
                            self.float_sum = 0.0;
                        }
                    }
                }
            }
            AggFunc::Min | AggFunc::Max => {
                let key = Ordered(value.clone());
                if add {
                    *self.ordered.entry(key).or_insert(0) += 1;
                } else if let Some(n) = self.ordered.get_mut(&key) {
                    *n -= 1;
                    if *n == 0 {
                        self.ordered.remove(&key);
                    }
                }
            }
        }
    }

    fn total(&self) -> f64 {
        self.int_sum as f64 + self.float_sum
    }

    fn result(&self, func: AggFunc) -> Value {
        match func {
            AggFunc::Count => Value::from(self.count),
            AggFunc::Sum if self.float_inputs == 0 => i64::try_from(self.int_sum)
                .map(Value::from)
                .unwrap_or_else(|_| float(self.total())),
            AggFunc::Sum => float(self.total()),
            AggFunc::Avg if self.numbers == 0 => Value::Null,
            AggFunc::Avg => float(self.total() / self.numbers as f64),
            AggFunc::Min => self
                .ordered
                .keys()
                .next()
                .map_or(Value::Null, |v| v.0.clone()),
            AggFunc::Max => self
                .ordered
                .keys()
                .next_back()
                .map_or(Value::Null, |v| v.0.clone()),
        }
    }
}

fn float(f: f64) -> Value {
    serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
}

/// Key of a group: the grouping value itself when it is a valid key.
fn group_key(values: &[Value]) -> Key {
    fn part(value: &Value) -> Key {
        match value {
            Value::Null => Key::Null,
            other => Key::from_value(other).unwrap_or_else(|| Key::Str(other.to_string())),
        }
    }
    match values {
        [] => Key::Str("single_group".into()),
        [value] => part(value),
        values => Key::Composite(values.iter().map(part).collect()),
    }
}

/// Where a grouped select field reads from.
enum GroupField {
    Key(usize),
    Aggregate(usize),
}

struct Group {
    values: Vec<Value>,
    rows: usize,
    accumulators: Vec<Accumulator>,
}

struct Member {
    group: Key,
    inputs: Vec<Value>,
}

struct GroupStage {
    keys: Vec<CompiledExpr>,
    aggregates: Vec<(AggFunc, CompiledExpr)>,
    fields: Vec<(String, GroupField)>,
    /// Evaluated over the selected row
    having: Vec<CompiledExpr>,
    /// Group of every admitted joined row
    members: HashMap<Key, Member>,
    groups: BTreeMap<Key, Group>,
}

impl GroupStage {
    fn compile(query: &Query, aliases: &[String]) -> Result<Self> {
        let Some(Select::Fields(select)) = &query.select else {
            return Err(Error::InvalidAggregation(
                "grouped queries require a select of named fields".into(),
            ));
        };

        let mut aggregates = Vec::new();
        let mut fields = Vec::with_capacity(select.len());
        for (name, expr) in select {
            let field = match expr {
                Expr::Agg { func, arg } => {
                    aggregates.push((*func, arg.compile(aliases)?));
                    GroupField::Aggregate(aggregates.len() - 1)
                }
                other => query
                    .group_by
                    .iter()
                    .position(|g| g == other)
                    .map(GroupField::Key)
                    .ok_or_else(|| {
                        Error::InvalidAggregation(format!(
                            "select field '{name}' must be an aggregate or a group_by expression"
                        ))
                    })?,
            };
            fields.push((name.clone(), field));
        }

        let scope = [SELECTED.to_string()];
        Ok(Self {
            keys: query
                .group_by
                .iter()
                .map(|e| e.compile(aliases))
                .collect::<Result<_>>()?,
            aggregates,
            fields,
            having: query
                .having
                .iter()
                .map(|h| query.over_selected(h)?.compile(&scope))
                .collect::<Result<_>>()?,
            members: HashMap::new(),
            groups: BTreeMap::new(),
        })
    }

    fn retract(&mut self, member: &Member) {
        if let Some(group) = self.groups.get_mut(&member.group) {
            group.rows = group.rows.saturating_sub(1);
            for ((func, _), (acc, value)) in self
                .aggregates
                .iter()
                .zip(group.accumulators.iter_mut().zip(&member.inputs))
            {
                acc.update(*func, value, false);
            }
        }
    }

    fn admit(&mut self, key: Key, tuple: &Tuple) -> Key {
        let values: Vec<Value> = self.keys.iter().map(|k| k.eval(tuple)).collect();
        let inputs: Vec<Value> = self.aggregates.iter().map(|(_, e)| e.eval(tuple)).collect();
        let id = group_key(&values);

        let width = self.aggregates.len();
        let group = self.groups.entry(id.clone()).or_insert_with(|| Group {
            values,
            rows: 0,
            accumulators: (0..width).map(|_| Accumulator::default()).collect(),
        });
        group.rows += 1;
        for ((func, _), (acc, value)) in self
            .aggregates
            .iter()
            .zip(group.accumulators.iter_mut().zip(&inputs))
        {
            acc.update(*func, value, true);
        }

        self.members.insert(
            key,
            Member {
                group: id.clone(),
                inputs,
            },
        );
        id
    }

    fn select(&self, group: &Group) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(name, field)| {
                    let value = match field {
                        GroupField::Key(i) => group.values.get(*i).cloned(),
                        GroupField::Aggregate(i) => group
                            .accumulators
                            .get(*i)
                            .zip(self.aggregates.get(*i))
                            .map(|(acc, (func, _))| acc.result(*func)),
                    };
                    (name.clone(), value.unwrap_or(Value::Null))
                })
                .collect(),
        )
    }

    /// Move rows between groups and return the changed groups.
    fn apply(
        &mut self,
        changes: Vec<(Key, Option<Tuple>)>,
        order: &Order,
        sorted: bool,
    ) -> Vec<OutputRow> {
        let mut touched = BTreeSet::new();
        for (key, tuple) in changes {
            if let Some(member) = self.members.remove(&key) {
                self.retract(&member);
                touched.insert(member.group);
            }
            if let Some(tuple) = tuple {
                touched.insert(self.admit(key, &tuple));
            }
        }

        let mut out = Vec::with_capacity(touched.len());
        for id in touched {
            let row = match self.groups.get(&id) {
                Some(group) if group.rows > 0 => {
                    let value = self.select(group);
                    let scope = selected_tuple(&value);
                    self.having
                        .iter()
                        .all(|h| h.is_true(&scope))
                        .then(|| (value, sort_key(order, sorted, &scope)))
                }
                _ => {
                    self.groups.remove(&id);
                    None
                }
            };
            out.push((id, row));
        }
        out
    }
}

/// Result rows collapsed by selected value.
#[derive(Default)]
struct DistinctStage {
    /// Value key of every admitted row
    members: HashMap<Key, Key>,
    /// Value and number of rows carrying it, by value key
    values: BTreeMap<Key, (Value, usize)>,
}

impl DistinctStage {
    fn apply(
        &mut self,
        changes: Vec<(Key, Option<Value>)>,
        order: &Order,
        sorted: bool,
    ) -> Vec<OutputRow> {
        let mut touched = BTreeSet::new();
        for (key, value) in changes {
            if let Some(id) = self.members.remove(&key) {
                if let Some((_, n)) = self.values.get_mut(&id) {
                    *n -= 1;
                    if *n == 0 {
                        self.values.remove(&id);
                    }
                }
                touched.insert(id);
            }
            if let Some(value) = value {
                let id = Key::Str(value.to_string());
                self.values.entry(id.clone()).or_insert((value, 0)).1 += 1;
                self.members.insert(key, id.clone());
                touched.insert(id);
            }
        }

        touched
            .into_iter()
            .map(|id| {
                let row = self.values.get(&id).map(|(value, _)| {
                    let sort = sort_key(order, sorted, &selected_tuple(value));
                    (value.clone(), sort)
                });
                (id, row)
            })
            .collect()
    }
}

/// What the pipeline emits per admitted joined row.
enum Shape {
    /// One result row per joined row
    Rows,
    Grouped(GroupStage),
    Distinct(DistinctStage),
}

enum Projection {
    /// The row of a single-alias query
    Row,
    /// `{alias: row}` for every alias
    Namespaced,
    Fields(Vec<(String, CompiledExpr)>),
    Fn(RowMapper),
}

/// Runtime form of a [`Query`].
pub(crate) struct Pipeline {
    name: CollectionName,
    aliases: Vec<String>,
    pushdown: Vec<Vec<CompiledExpr>>,
    stages: Vec<JoinStage>,
    residual: Vec<CompiledExpr>,
    predicates: Vec<RowPredicate>,
    projection: Projection,
    shape: Shape,
    /// Over the joined row, or over the selected row for grouped and
    /// distinct queries
    order: Order,
    /// Whether result rows carry a sort key
    sorted: bool,
    window: Option<Window>,
}

impl Pipeline {
    pub fn compile(query: &Query, name: &str) -> Result<Self> {
        query.validate()?;
        let aliases = query.aliases();
        let width = aliases.len();

        // Slots an outer join may fill with a missing row
        let mut nullable = vec![false; width];
        for (i, join) in query.joins.iter().enumerate() {
            let slot = i + 1;
            match join.kind {
                JoinKind::Inner => {}
                JoinKind::Left => nullable[slot] = true,
                JoinKind::Right => nullable[..slot].iter_mut().for_each(|n| *n = true),
                JoinKind::Full => nullable[..=slot].iter_mut().for_each(|n| *n = true),
            }
        }

        let mut pushdown = vec![Vec::new(); width];
        let mut residual = Vec::new();
        for filter in &query.filters {
            let compiled = filter.compile(&aliases)?;
            let refs = filter.aliases();
            let target = match refs.len() {
                1 => refs
                    .first()
                    .and_then(|alias| aliases.iter().position(|a| a == alias)),
                _ => None,
            };
            match target {
                Some(slot) if !nullable[slot] => pushdown[slot].push(compiled),
                _ => residual.push(compiled),
            }
        }

        let mut stages = Vec::with_capacity(query.joins.len());
        for (i, join) in query.joins.iter().enumerate() {
            let slot = i + 1;
            let (left, right) = join.sides(&aliases[..slot])?;
            stages.push(JoinStage {
                kind: join.kind,
                slot,
                width,
                left_key: left.compile(&aliases)?,
                right_key: right.compile(std::slice::from_ref(&join.alias))?,
                left: BTreeMap::new(),
                left_index: HashMap::new(),
                right: BTreeMap::new(),
                right_index: HashMap::new(),
            });
        }

        let projection = match &query.select {
            // Grouped rows are built by the group stage
            _ if query.is_grouped() => Projection::Row,
            None if width == 1 => Projection::Row,
            None => Projection::Namespaced,
            Some(Select::Fields(fields)) => Projection::Fields(
                fields
                    .iter()
                    .map(|(name, expr)| Ok((name.clone(), expr.compile(&aliases)?)))
                    .collect::<Result<_>>()?,
            ),
            Some(Select::Fn(f)) => Projection::Fn(f.clone()),
        };

        let shape = if query.is_grouped() {
            Shape::Grouped(GroupStage::compile(query, &aliases)?)
        } else if query.distinct {
            Shape::Distinct(DistinctStage::default())
        } else {
            Shape::Rows
        };

        let scope = [SELECTED.to_string()];
        let order: Order = query
            .order_by
            .iter()
            .map(|o| {
                let expr = if query.orders_selected() {
                    query.over_selected(&o.expr)?.compile(&scope)?
                } else {
                    o.expr.compile(&aliases)?
                };
                Ok((expr, o.direction, o.nulls))
            })
            .collect::<Result<_>>()?;

        let window = (query.limit.is_some() || query.offset.is_some()).then(|| Window {
            offset: query.offset.unwrap_or(0),
            limit: query.limit,
            ..Window::default()
        });
        let sorted = !order.is_empty() || window.is_some();

        Ok(Self {
            name: name.to_string(),
            aliases,
            pushdown,
            stages,
            residual,
            predicates: query.predicates.clone(),
            projection,
            shape,
            order,
            sorted,
            window,
        })
    }

    pub fn is_ordered(&self) -> bool {
        !self.order.is_empty()
    }

    /// Feed a batch of source changes and return the changes to the result.
    ///
    /// Within one batch the last change to a source row wins.
    pub fn process(&mut self, changes: Vec<SourceChange>) -> PipelineOutput {
        let width = self.aliases.len();
        let mut inputs: Vec<BTreeMap<Key, Option<Rc<Value>>>> = vec![BTreeMap::new(); width];

        for change in changes {
            let Some(input) = inputs.get_mut(change.slot) else {
                continue;
            };
            let row = change
                .value
                .map(Rc::new)
                .filter(|row| passes(&self.pushdown[change.slot], width, change.slot, row));
            input.insert(change.key, row);
        }

        let mut inputs = inputs.into_iter();
        let mut delta: Delta = inputs
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|(key, row)| (vec![key], row.map(|r| bind(width, 0, r))))
            .collect();

        for (stage, right) in self.stages.iter_mut().zip(inputs) {
            delta = stage.process(delta, right.into_iter().collect());
        }

        self.finish(delta)
    }

    fn finish(&mut self, delta: Delta) -> PipelineOutput {
        let mut output = PipelineOutput::default();

        let mut admitted = Vec::with_capacity(delta.len());
        for (id, tuple) in delta {
            let key = match <[Key; 1]>::try_from(id) {
                Ok([key]) => key,
                Err(parts) => Key::Composite(parts),
            };
            let tuple = match tuple {
                Some(tuple) => match self.admits(&tuple) {
                    Ok(true) => Some(tuple),
                    Ok(false) => None,
                    Err(message) => {
                        self.exclude(&mut output, &key, message);
                        None
                    }
                },
                None => None,
            };
            admitted.push((key, tuple));
        }

        output.rows = if let Shape::Grouped(stage) = &mut self.shape {
            stage.apply(admitted, &self.order, self.sorted)
        } else {
            let mut projected = Vec::with_capacity(admitted.len());
            for (key, tuple) in admitted {
                let row = tuple.and_then(|tuple| match self.project(&tuple) {
                    Ok(value) => Some((value, tuple)),
                    Err(message) => {
                        self.exclude(&mut output, &key, message);
                        None
                    }
                });
                projected.push((key, row));
            }

            match &mut self.shape {
                Shape::Distinct(stage) => stage.apply(
                    projected
                        .into_iter()
                        .map(|(key, row)| (key, row.map(|(value, _)| value)))
                        .collect(),
                    &self.order,
                    self.sorted,
                ),
                _ => projected
                    .into_iter()
                    .map(|(key, row)| {
                        let row = row.map(|(value, tuple)| {
                            let sort = sort_key(&self.order, self.sorted, &tuple);
                            (value, sort)
                        });
                        (key, row)
                    })
                    .collect(),
            }
        };

        if let Some(window) = &mut self.window {
            output.rows = window.apply(std::mem::take(&mut output.rows));
        }

        output
    }

    fn exclude(&self, output: &mut PipelineOutput, key: &Key, message: String) {
        tracing::warn!(
            collection = %self.name,
            key = %key,
            error = %message,
            "Row excluded from live query"
        );
        output.diagnostics.push(RowDiagnostic {
            collection: self.name.clone(),
            key: key.clone(),
            message,
        });
    }

    /// Whether a joined row passes the residual filters and predicates.
    fn admits(&self, tuple: &Tuple) -> std::result::Result<bool, String> {
        if !self.residual.iter().all(|p| p.is_true(tuple)) {
            return Ok(false);
        }

        if !self.predicates.is_empty() {
            let namespaced = self.namespaced(tuple);
            for predicate in &self.predicates {
                if !predicate(&namespaced)? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn project(&self, tuple: &Tuple) -> std::result::Result<Value, String> {
        Ok(match &self.projection {
            Projection::Row => tuple
                .first()
                .and_then(|row| row.as_deref())
                .cloned()
                .unwrap_or(Value::Null),
            Projection::Namespaced => self.namespaced(tuple),
            Projection::Fields(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, expr)| (name.clone(), expr.eval(tuple)))
                    .collect(),
            ),
            Projection::Fn(f) => f(&self.namespaced(tuple))?,
        })
    }

    fn namespaced(&self, tuple: &Tuple) -> Value {
        Value::Object(
            self.aliases
                .iter()
                .zip(tuple.iter())
                .map(|(alias, row)| {
                    (
                        alias.clone(),
                        row.as_deref().cloned().unwrap_or(Value::Null),
                    )
                })
                .collect(),
        )
    }
}

fn passes(filters: &[CompiledExpr], width: usize, slot: usize, row: &Rc<Value>) -> bool {
    if filters.is_empty() {
        return true;
    }
    let tuple = bind(width, slot, row.clone());
    filters.iter().all(|f| f.is_true(&tuple))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{avg, col, count, eq, gt, max, min, selected, sum, val, Query};
    use crate::{field_key, Collection, CollectionConfig, Store};
    use serde_json::json;

    fn collection(store: &Store, name: &str) -> Collection {
        store
            .create_collection(CollectionConfig::new(name, field_key("id")))
            .unwrap()
    }

    fn change(slot: usize, key: &str, value: Option<Value>) -> SourceChange {
        SourceChange {
            slot,
            key: Key::from(key),
            value,
        }
    }

    fn rows(output: &PipelineOutput) -> Vec<(String, Option<Value>)> {
        output
            .rows
            .iter()
            .map(|(k, r)| (k.to_string(), r.as_ref().map(|(v, _)| v.clone())))
            .collect()
    }

    #[test]
    fn filter_and_project_single_source() {
        let store = Store::new();
        let todos = collection(&store, "todos");
        let query = Query::from("t", &todos)
            .filter(eq(col("t", "done"), val(false)))
            .select([("title", col("t", "text"))]);
        let mut pipeline = Pipeline::compile(&query, "open").unwrap();

        let out = pipeline.process(vec![
            change(0, "1", Some(json!({"id": "1", "text": "a", "done": false}))),
            change(0, "2", Some(json!({"id": "2", "text": "b", "done": true}))),
        ]);
        assert_eq!(
            rows(&out),
            vec![
                ("1".into(), Some(json!({"title": "a"}))),
                ("2".into(), None),
            ]
        );

        // Failing the filter after an update removes the row
        let out = pipeline.process(vec![change(
            0,
            "1",
            Some(json!({"id": "1", "text": "a", "done": true})),
        )]);
        assert_eq!(rows(&out), vec![("1".into(), None)]);
    }

    #[test]
    fn inner_join_revisits_rows_sharing_a_join_value() {
        let store = Store::new();
        let messages = collection(&store, "messages");
        let users = collection(&store, "users");
        let query = Query::from("m", &messages).join(
            "u",
            &users,
            eq(col("m", "authorId"), col("u", "id")),
        );
        let mut pipeline = Pipeline::compile(&query, "feed").unwrap();

        let out = pipeline.process(vec![
            change(0, "m1", Some(json!({"id": "m1", "authorId": "u1"}))),
            change(0, "m2", Some(json!({"id": "m2", "authorId": "u2"}))),
        ]);
        assert!(out.rows.is_empty());

        let out = pipeline.process(vec![change(1, "u1", Some(json!({"id": "u1", "name": "ann"})))]);
        assert_eq!(out.rows.len(), 1);
        let (key, row) = &out.rows[0];
        assert_eq!(key, &Key::Composite(vec![Key::from("m1"), Key::from("u1")]));
        let (value, _) = row.as_ref().unwrap();
        assert_eq!(value["u"]["name"], json!("ann"));
        assert_eq!(value["m"]["id"], json!("m1"));

        let out = pipeline.process(vec![change(1, "u1", None)]);
        assert_eq!(rows(&out), vec![("[m1,u1]".into(), None)]);
    }

    #[test]
    fn left_join_null_extends_then_upgrades() {
        let store = Store::new();
        let messages = collection(&store, "messages");
        let users = collection(&store, "users");
        let query = Query::from("m", &messages).left_join(
            "u",
            &users,
            eq(col("m", "authorId"), col("u", "id")),
        );
        let mut pipeline = Pipeline::compile(&query, "feed").unwrap();

        let out = pipeline.process(vec![change(
            0,
            "m1",
            Some(json!({"id": "m1", "authorId": "u1"})),
        )]);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].0.to_string(), "[m1,null]");
        assert_eq!(out.rows[0].1.as_ref().unwrap().0["u"], json!(null));

        let out = pipeline.process(vec![change(1, "u1", Some(json!({"id": "u1"})))]);
        let keys: Vec<_> = rows(&out).into_iter().map(|(k, r)| (k, r.is_some())).collect();
        assert_eq!(
            keys,
            vec![("[m1,null]".into(), false), ("[m1,u1]".into(), true)]
        );
    }

    #[test]
    fn right_and_full_joins_keep_unmatched_right_rows() {
        let store = Store::new();
        let messages = collection(&store, "messages");
        let users = collection(&store, "users");

        for kind in [JoinKind::Right, JoinKind::Full] {
            let query = Query::from("m", &messages).join_with(
                kind,
                "u",
                &users,
                eq(col("m", "authorId"), col("u", "id")),
            );
            let mut pipeline = Pipeline::compile(&query, "feed").unwrap();

            let out = pipeline.process(vec![change(1, "u1", Some(json!({"id": "u1"})))]);
            assert_eq!(rows(&out)[0].0, "[null,u1]");

            let out = pipeline.process(vec![change(
                0,
                "m1",
                Some(json!({"id": "m1", "authorId": "u1"})),
            )]);
            let keys: Vec<_> = rows(&out).into_iter().map(|(k, r)| (k, r.is_some())).collect();
            assert_eq!(
                keys,
                vec![("[null,u1]".into(), false), ("[m1,u1]".into(), true)]
            );
        }
    }

    #[test]
    fn null_join_values_never_match() {
        let store = Store::new();
        let messages = collection(&store, "messages");
        let users = collection(&store, "users");
        let query = Query::from("m", &messages).join(
            "u",
            &users,
            eq(col("m", "authorId"), col("u", "managerId")),
        );
        let mut pipeline = Pipeline::compile(&query, "feed").unwrap();

        let out = pipeline.process(vec![
            change(0, "m1", Some(json!({"id": "m1", "authorId": null}))),
            change(1, "u1", Some(json!({"id": "u1", "managerId": null}))),
        ]);
        assert!(out.rows.is_empty());
    }

    #[test]
    fn filter_on_outer_side_is_not_pushed_down() {
        let store = Store::new();
        let messages = collection(&store, "messages");
        let users = collection(&store, "users");
        let query = Query::from("m", &messages)
            .left_join("u", &users, eq(col("m", "authorId"), col("u", "id")))
            .filter(eq(col("u", "active"), val(true)));
        let pipeline = Pipeline::compile(&query, "feed").unwrap();
        assert!(pipeline.pushdown[1].is_empty());
        assert_eq!(pipeline.residual.len(), 1);

        let query = Query::from("m", &messages)
            .join("u", &users, eq(col("m", "authorId"), col("u", "id")))
            .filter(eq(col("u", "active"), val(true)));
        let pipeline = Pipeline::compile(&query, "feed").unwrap();
        assert_eq!(pipeline.pushdown[1].len(), 1);
        assert!(pipeline.residual.is_empty());
    }

    #[test]
    fn failing_projection_reports_diagnostic() {
        let store = Store::new();
        let todos = collection(&store, "todos");
        let query = Query::from("t", &todos).select_fn(|row| {
            row["t"]["text"]
                .as_str()
                .map(|s| json!(s.len()))
                .ok_or_else(|| "text is not a string".to_string())
        });
        let mut pipeline = Pipeline::compile(&query, "lengths").unwrap();

        let out = pipeline.process(vec![
            change(0, "1", Some(json!({"id": "1", "text": "abc"}))),
            change(0, "2", Some(json!({"id": "2", "text": 7}))),
        ]);
        assert_eq!(
            rows(&out),
            vec![("1".into(), Some(json!(3))), ("2".into(), None)]
        );
        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.diagnostics[0].key, Key::from("2"));
        assert_eq!(out.diagnostics[0].collection, "lengths");
    }

    #[test]
    fn window_tracks_top_rows() {
        let store = Store::new();
        let scores = collection(&store, "scores");
        let query = Query::from("s", &scores)
            .filter(gt(col("s", "points"), val(0)))
            .order_by(col("s", "points"), Direction::Desc)
            .limit(2);
        let mut pipeline = Pipeline::compile(&query, "top").unwrap();

        let out = pipeline.process(vec![
            change(0, "a", Some(json!({"id": "a", "points": 10}))),
            change(0, "b", Some(json!({"id": "b", "points": 20}))),
            change(0, "c", Some(json!({"id": "c", "points": 5}))),
        ]);
        let mut keys: Vec<_> = out.rows.iter().map(|(k, _)| k.to_string()).collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        // c overtakes a
        let out = pipeline.process(vec![change(0, "c", Some(json!({"id": "c", "points": 15})))]);
        let changes: Vec<_> = rows(&out).into_iter().map(|(k, r)| (k, r.is_some())).collect();
        assert_eq!(changes, vec![("a".into(), false), ("c".into(), true)]);

        // Changes outside the window are silent
        let out = pipeline.process(vec![change(0, "a", Some(json!({"id": "a", "points": 11})))]);
        assert!(out.rows.is_empty());
    }

    #[test]
    fn group_accumulators_follow_moves_and_deletes() {
        let store = Store::new();
        let messages = collection(&store, "messages");
        let query = Query::from("m", &messages)
            .group_by([col("m", "authorId")])
            .select([
                ("author", col("m", "authorId")),
                ("n", count(col("m", "id"))),
                ("total", sum(col("m", "likes"))),
                ("mean", avg(col("m", "likes"))),
                ("low", min(col("m", "likes"))),
                ("high", max(col("m", "likes"))),
            ]);
        let mut pipeline = Pipeline::compile(&query, "stats").unwrap();

        let out = pipeline.process(vec![
            change(0, "m1", Some(json!({"id": "m1", "authorId": "u1", "likes": 2}))),
            change(0, "m2", Some(json!({"id": "m2", "authorId": "u1", "likes": 5}))),
            change(0, "m3", Some(json!({"id": "m3", "authorId": "u2", "likes": 1.5}))),
        ]);
        assert_eq!(
            rows(&out),
            vec![
                (
                    "u1".into(),
                    Some(json!({
                        "author": "u1", "n": 2, "total": 7, "mean": 3.5, "low": 2, "high": 5
                    }))
                ),
                (
                    "u2".into(),
                    Some(json!({
                        "author": "u2", "n": 1, "total": 1.5, "mean": 1.5, "low": 1.5, "high": 1.5
                    }))
                ),
            ]
        );

        // Moving a row retracts it from its old group
        let out = pipeline.process(vec![change(
            0,
            "m2",
            Some(json!({"id": "m2", "authorId": "u2", "likes": 5})),
        )]);
        assert_eq!(
            rows(&out),
            vec![
                (
                    "u1".into(),
                    Some(json!({
                        "author": "u1", "n": 1, "total": 2, "mean": 2.0, "low": 2, "high": 2
                    }))
                ),
                (
                    "u2".into(),
                    Some(json!({
                        "author": "u2", "n": 2, "total": 6.5, "mean": 3.25, "low": 1.5, "high": 5
                    }))
                ),
            ]
        );

        // An emptied group leaves the result
        let out = pipeline.process(vec![change(0, "m1", None)]);
        assert_eq!(rows(&out), vec![("u1".into(), None)]);
    }

    #[test]
    fn having_filters_groups() {
        let store = Store::new();
        let messages = collection(&store, "messages");
        let query = Query::from("m", &messages)
            .group_by([col("m", "authorId")])
            .select([("author", col("m", "authorId")), ("n", count(col("m", "id")))])
            .having(gt(count(col("m", "id")), val(1)))
            .order_by(selected("n"), Direction::Desc);
        let mut pipeline = Pipeline::compile(&query, "busy").unwrap();

        let out = pipeline.process(vec![
            change(0, "m1", Some(json!({"id": "m1", "authorId": "u1"}))),
            change(0, "m2", Some(json!({"id": "m2", "authorId": "u2"}))),
        ]);
        assert_eq!(rows(&out), vec![("u1".into(), None), ("u2".into(), None)]);

        let out = pipeline.process(vec![change(
            0,
            "m3",
            Some(json!({"id": "m3", "authorId": "u1"})),
        )]);
        assert_eq!(
            rows(&out),
            vec![("u1".into(), Some(json!({"author": "u1", "n": 2})))]
        );
        let (_, row) = &out.rows[0];
        assert!(row.as_ref().unwrap().1.is_some());
    }

    #[test]
    fn aggregate_without_group_by_spans_all_rows() {
        let store = Store::new();
        let scores = collection(&store, "scores");
        let query = Query::from("s", &scores).select([("best", max(col("s", "points")))]);
        let mut pipeline = Pipeline::compile(&query, "best").unwrap();

        let out = pipeline.process(vec![
            change(0, "a", Some(json!({"id": "a", "points": 10}))),
            change(0, "b", Some(json!({"id": "b", "points": null}))),
        ]);
        assert_eq!(rows(&out), vec![("single_group".into(), Some(json!({"best": 10})))]);

        let out = pipeline.process(vec![change(0, "a", None)]);
        assert_eq!(rows(&out), vec![("single_group".into(), Some(json!({"best": null})))]);
    }

    #[test]
    fn distinct_keeps_a_value_while_any_row_carries_it() {
        let store = Store::new();
        let messages = collection(&store, "messages");
        let query = Query::from("m", &messages)
            .select([("author", col("m", "authorId"))])
            .distinct();
        let mut pipeline = Pipeline::compile(&query, "authors").unwrap();

        let out = pipeline.process(vec![
            change(0, "m1", Some(json!({"id": "m1", "authorId": "u1"}))),
            change(0, "m2", Some(json!({"id": "m2", "authorId": "u1"}))),
            change(0, "m3", Some(json!({"id": "m3", "authorId": "u2"}))),
        ]);
        let values: Vec<_> = out
            .rows
            .iter()
            .filter_map(|(_, r)| r.as_ref().map(|(v, _)| v.clone()))
            .collect();
        assert_eq!(values, vec![json!({"author": "u1"}), json!({"author": "u2"})]);

        let out = pipeline.process(vec![change(0, "m1", None)]);
        assert!(out.rows.iter().all(|(_, r)| r.is_some()));

        let out = pipeline.process(vec![change(0, "m2", None)]);
        assert_eq!(out.rows.len(), 1);
        assert!(out.rows[0].1.is_none());
    }

    #[test]
    fn find_one_without_order_keeps_lowest_key() {
        let store = Store::new();
        let todos = collection(&store, "todos");
        let query = Query::from("t", &todos).find_one();
        let mut pipeline = Pipeline::compile(&query, "first").unwrap();

        let out = pipeline.process(vec![
            change(0, "b", Some(json!({"id": "b"}))),
            change(0, "a", Some(json!({"id": "a"}))),
        ]);
        assert_eq!(rows(&out), vec![("a".into(), Some(json!({"id": "a"})))]);

        let out = pipeline.process(vec![change(0, "a", None)]);
        assert_eq!(
            rows(&out),
            vec![("a".into(), None), ("b".into(), Some(json!({"id": "b"})))]
        );
    }
}
