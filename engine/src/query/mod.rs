//! Live query definitions.
//!
//! A [`Query`] names its source collections under aliases and describes how
//! to join, filter, project and order their rows:
//!
//! ```ignore
//! let query = Query::from("m", &messages)
//!     .join("u", &users, eq(col("m", "authorId"), col("u", "id")))
//!     .filter(eq(col("m", "archived"), val(false)))
//!     .order_by(col("m", "sentAt"), Direction::Desc)
//!     .limit(50);
//! ```
//!
//! Grouped queries aggregate per group and may filter groups with `having`:
//!
//! ```ignore
//! let totals = Query::from("o", &orders)
//!     .group_by([col("o", "customerId")])
//!     .select([
//!         ("customerId", col("o", "customerId")),
//!         ("total", sum(col("o", "amount"))),
//!     ])
//!     .having(gt(selected("total"), val(100)))
//!     .order_by(selected("total"), Direction::Desc);
//! ```
//!
//! Wrapping a query in a [`CollectionConfigBuilder`] gives it an identity; the
//! store turns the builder into a derived collection whose rows are kept up to
//! date incrementally.

mod expr;
mod order;
pub(crate) mod pipeline;

pub use expr::{
    add, and, avg, coalesce, col, concat, count, eq, gt, gte, ilike, in_array, is_null, length,
    like, lower, lt, lte, max, min, ne, not, or, row, selected, sum, upper, val, AggFunc, Expr,
    Func, SELECTED,
};
pub use order::{compare_values, Direction, Nulls};
pub(crate) use order::SortKey;

use crate::{error::Result, Collection, CollectionId, CollectionName, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

/// Kind of join between the rows so far and a joined collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
    Right,
    Full,
}

/// Fallible row predicate. Receives the namespaced row `{alias: row}`.
pub type RowPredicate = Rc<dyn Fn(&Value) -> std::result::Result<bool, String>>;

/// Fallible projection. Receives the namespaced row `{alias: row}`.
pub type RowMapper = Rc<dyn Fn(&Value) -> std::result::Result<Value, String>>;

/// Projection of a query's result rows.
#[derive(Clone)]
pub enum Select {
    /// Build an object from named expressions
    Fields(Vec<(String, Expr)>),
    Fn(RowMapper),
}

impl fmt::Debug for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Select::Fields(fields) => f.debug_tuple("Fields").field(fields).finish(),
            Select::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: Direction,
    pub nulls: Nulls,
}

#[derive(Debug, Clone)]
pub struct Join {
    pub alias: String,
    pub collection: Collection,
    pub kind: JoinKind,
    /// Equality between an expression over earlier aliases and one over
    /// the joined alias, in either order
    pub on: Expr,
}

impl Join {
    /// Split the condition into (earlier side, joined side).
    pub(crate) fn sides(&self, earlier: &[String]) -> Result<(&Expr, &Expr)> {
        let invalid = |reason: &str| Error::InvalidJoinCondition {
            alias: self.alias.clone(),
            reason: reason.to_string(),
        };

        let Expr::Func {
            func: Func::Eq,
            args,
        } = &self.on
        else {
            return Err(invalid("join condition must be an equality"));
        };
        let [a, b] = args.as_slice() else {
            return Err(invalid("equality takes exactly two operands"));
        };

        let only = |expr: &Expr, allowed: &[String]| {
            let refs = expr.aliases();
            !refs.is_empty() && refs.iter().all(|r| allowed.iter().any(|a| a == r))
        };
        let joined = std::slice::from_ref(&self.alias);

        if only(a, earlier) && only(b, joined) {
            Ok((a, b))
        } else if only(b, earlier) && only(a, joined) {
            Ok((b, a))
        } else {
            Err(invalid(
                "one side must reference only the joined alias and the other only earlier aliases",
            ))
        }
    }
}

/// A live query over one or more collections.
#[derive(Clone)]
pub struct Query {
    pub(crate) from: (String, Collection),
    pub(crate) joins: Vec<Join>,
    pub(crate) filters: Vec<Expr>,
    pub(crate) predicates: Vec<RowPredicate>,
    pub(crate) select: Option<Select>,
    pub(crate) order_by: Vec<OrderBy>,
    pub(crate) limit: Option<usize>,
    pub(crate) offset: Option<usize>,
    pub(crate) group_by: Vec<Expr>,
    pub(crate) having: Vec<Expr>,
    pub(crate) distinct: bool,
    pub(crate) single_result: bool,
}

impl Query {
    pub fn from(alias: impl Into<String>, collection: &Collection) -> Self {
        Self {
            from: (alias.into(), collection.clone()),
            joins: Vec::new(),
            filters: Vec::new(),
            predicates: Vec::new(),
            select: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            group_by: Vec::new(),
            having: Vec::new(),
            distinct: false,
            single_result: false,
        }
    }

    /// Inner join.
    pub fn join(self, alias: impl Into<String>, collection: &Collection, on: Expr) -> Self {
        self.join_with(JoinKind::Inner, alias, collection, on)
    }

    pub fn left_join(self, alias: impl Into<String>, collection: &Collection, on: Expr) -> Self {
        self.join_with(JoinKind::Left, alias, collection, on)
    }

    pub fn right_join(self, alias: impl Into<String>, collection: &Collection, on: Expr) -> Self {
        self.join_with(JoinKind::Right, alias, collection, on)
    }

    pub fn full_join(self, alias: impl Into<String>, collection: &Collection, on: Expr) -> Self {
        self.join_with(JoinKind::Full, alias, collection, on)
    }

    pub fn join_with(
        mut self,
        kind: JoinKind,
        alias: impl Into<String>,
        collection: &Collection,
        on: Expr,
    ) -> Self {
        self.joins.push(Join {
            alias: alias.into(),
            collection: collection.clone(),
            kind,
            on,
        });
        self
    }

    /// Keep rows for which `expr` is true. Multiple filters are combined with `and`.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filters.push(expr);
        self
    }

    /// Keep rows accepted by a function. An `Err` excludes the row and is
    /// reported as a diagnostic.
    pub fn filter_fn(
        mut self,
        f: impl Fn(&Value) -> std::result::Result<bool, String> + 'static,
    ) -> Self {
        self.predicates.push(Rc::new(f));
        self
    }

    pub fn select<K: Into<String>>(mut self, fields: impl IntoIterator<Item = (K, Expr)>) -> Self {
        self.select = Some(Select::Fields(
            fields.into_iter().map(|(k, e)| (k.into(), e)).collect(),
        ));
        self
    }

    /// Project rows with a function. An `Err` excludes the row and is
    /// reported as a diagnostic.
    pub fn select_fn(
        mut self,
        f: impl Fn(&Value) -> std::result::Result<Value, String> + 'static,
    ) -> Self {
        self.select = Some(Select::Fn(Rc::new(f)));
        self
    }

    pub fn order_by(self, expr: Expr, direction: Direction) -> Self {
        self.order_by_with(expr, direction, Nulls::default())
    }

    pub fn order_by_with(mut self, expr: Expr, direction: Direction, nulls: Nulls) -> Self {
        self.order_by.push(OrderBy {
            expr,
            direction,
            nulls,
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.offset = Some(n);
        self
    }

    /// Produce one row per distinct value of `exprs`. Every select field must
    /// then be an aggregate or one of the grouping expressions.
    pub fn group_by(mut self, exprs: impl IntoIterator<Item = Expr>) -> Self {
        self.group_by.extend(exprs);
        self
    }

    /// Keep groups for which `expr` is true. Evaluated over the selected row;
    /// aggregates and grouping expressions that are also selected may be
    /// used directly.
    pub fn having(mut self, expr: Expr) -> Self {
        self.having.push(expr);
        self
    }

    /// Collapse result rows with equal selected values into one.
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Keep only the first result row. Without `order_by` the row with the
    /// lowest key is kept.
    pub fn find_one(mut self) -> Self {
        self.limit = Some(1);
        self.single_result = true;
        self
    }

    pub fn is_single_result(&self) -> bool {
        self.single_result
    }

    /// Whether results are per group rather than per joined row.
    pub fn is_grouped(&self) -> bool {
        let aggregates = match &self.select {
            Some(Select::Fields(fields)) => fields.iter().any(|(_, e)| e.is_aggregate()),
            _ => false,
        };
        aggregates || !self.group_by.is_empty()
    }

    /// Whether `order_by` and `having` run after grouping or `distinct`,
    /// over the selected row.
    pub(crate) fn orders_selected(&self) -> bool {
        self.is_grouped() || self.distinct
    }

    /// Rewrite an expression evaluated after grouping or `distinct` to read
    /// the selected row. Sub-expressions equal to a select field become
    /// references to that field.
    pub(crate) fn over_selected(&self, expr: &Expr) -> Result<Expr> {
        let fields = match &self.select {
            Some(Select::Fields(fields)) => fields.as_slice(),
            _ => &[],
        };
        let rewritten = to_selected(expr, fields);

        if let Some(alias) = rewritten.aliases().into_iter().find(|a| *a != SELECTED) {
            return Err(Error::InvalidAggregation(format!(
                "alias '{alias}' is out of scope after aggregation; select the value and \
                 reference it with `selected`"
            )));
        }
        if rewritten.contains_aggregate() {
            return Err(Error::InvalidAggregation(
                "aggregates in having or order_by must also be selected".into(),
            ));
        }
        Ok(rewritten)
    }

    /// Aliases in binding order: the `from` alias first, then each join.
    pub fn aliases(&self) -> Vec<String> {
        std::iter::once(self.from.0.clone())
            .chain(self.joins.iter().map(|j| j.alias.clone()))
            .collect()
    }

    /// Source collections by alias, in binding order.
    pub fn sources(&self) -> Vec<(&str, &Collection)> {
        std::iter::once((self.from.0.as_str(), &self.from.1))
            .chain(self.joins.iter().map(|j| (j.alias.as_str(), &j.collection)))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let aliases = self.aliases();

        let mut seen = HashSet::new();
        for alias in &aliases {
            if !seen.insert(alias.as_str()) {
                return Err(Error::DuplicateAlias(alias.clone()));
            }
        }

        for (i, join) in self.joins.iter().enumerate() {
            join.sides(&aliases[..=i])?;
        }

        let known = |expr: &Expr| {
            expr.aliases()
                .into_iter()
                .find(|a| !seen.contains(a))
                .map_or(Ok(()), |a| Err(Error::UnknownAlias(a.to_string())))
        };
        let row_scoped = |expr: &Expr| {
            if expr.contains_aggregate() {
                return Err(Error::InvalidAggregation(
                    "aggregates are only valid as select fields".into(),
                ));
            }
            known(expr)
        };
        for join in &self.joins {
            row_scoped(&join.on)?;
        }
        for filter in &self.filters {
            row_scoped(filter)?;
        }
        for expr in &self.group_by {
            row_scoped(expr)?;
        }

        if self.is_grouped() {
            self.validate_grouped_select(&row_scoped)?;
        } else if let Some(Select::Fields(fields)) = &self.select {
            for (_, expr) in fields {
                row_scoped(expr)?;
            }
        }

        if self.distinct && self.select.is_none() {
            return Err(Error::InvalidAggregation("distinct requires a select".into()));
        }
        if self.distinct && self.is_grouped() {
            return Err(Error::InvalidAggregation(
                "distinct cannot be combined with grouping".into(),
            ));
        }
        if !self.having.is_empty() && !self.is_grouped() {
            return Err(Error::InvalidAggregation(
                "having requires group_by or an aggregate".into(),
            ));
        }
        for expr in &self.having {
            self.over_selected(expr)?;
        }

        for order in &self.order_by {
            if self.orders_selected() {
                self.over_selected(&order.expr)?;
            } else {
                row_scoped(&order.expr)?;
            }
        }

        if (self.limit.is_some() || self.offset.is_some())
            && self.order_by.is_empty()
            && !self.single_result
        {
            return Err(Error::LimitOffsetRequireOrderBy);
        }

        Ok(())
    }

    fn validate_grouped_select(&self, row_scoped: &dyn Fn(&Expr) -> Result<()>) -> Result<()> {
        let Some(Select::Fields(fields)) = &self.select else {
            return Err(Error::InvalidAggregation(
                "grouped queries require a select of named fields".into(),
            ));
        };
        for (name, expr) in fields {
            match expr {
                Expr::Agg { arg, .. } => row_scoped(arg)?,
                other if self.group_by.contains(other) => {}
                _ => {
                    return Err(Error::InvalidAggregation(format!(
                        "select field '{name}' must be an aggregate or a group_by expression"
                    )))
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("from", &(&self.from.0, self.from.1.name()))
            .field("joins", &self.joins)
            .field("filters", &self.filters)
            .field("predicates", &self.predicates.len())
            .field("select", &self.select)
            .field("order_by", &self.order_by)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("group_by", &self.group_by)
            .field("having", &self.having)
            .field("distinct", &self.distinct)
            .field("single_result", &self.single_result)
            .finish()
    }
}

/// A validated query with the id of the collection it produces.
///
/// Registered with the store for every live query; also reachable from the
/// derived collection's [`Utils`](crate::Utils).
pub struct CollectionConfigBuilder {
    id: CollectionName,
    query: Query,
}

impl CollectionConfigBuilder {
    pub fn new(id: impl Into<CollectionName>, query: Query) -> Result<Self> {
        query.validate()?;
        Ok(Self {
            id: id.into(),
            query,
        })
    }

    /// Name of the derived collection.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Whether the derived collection holds at most one row, read with
    /// [`Collection::first`].
    pub fn is_single_result(&self) -> bool {
        self.query.single_result
    }

    /// Distinct source collections, in binding order.
    pub fn sources(&self) -> Vec<Collection> {
        let mut seen: HashSet<CollectionId> = HashSet::new();
        self.query
            .sources()
            .into_iter()
            .filter(|(_, c)| seen.insert(c.id()))
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub(crate) fn compile(&self) -> Result<pipeline::Pipeline> {
        pipeline::Pipeline::compile(&self.query, &self.id)
    }
}

/// Replace sub-expressions equal to a select field with a reference to it.
fn to_selected(expr: &Expr, fields: &[(String, Expr)]) -> Expr {
    if let Some((name, _)) = fields.iter().find(|(_, field)| field == expr) {
        return Expr::Ref {
            alias: SELECTED.to_string(),
            path: vec![name.clone()],
        };
    }
    match expr {
        Expr::Func { func, args } => Expr::Func {
            func: *func,
            args: args.iter().map(|a| to_selected(a, fields)).collect(),
        },
        other => other.clone(),
    }
}

impl fmt::Debug for CollectionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionConfigBuilder")
            .field("id", &self.id)
            .field("query", &self.query)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{field_key, CollectionConfig, Store};

    fn collections() -> (Store, Collection, Collection) {
        let store = Store::new();
        let messages = store
            .create_collection(CollectionConfig::new("messages", field_key("id")))
            .unwrap();
        let users = store
            .create_collection(CollectionConfig::new("users", field_key("id")))
            .unwrap();
        (store, messages, users)
    }

    #[test]
    fn join_sides_accept_either_order() {
        let (_store, messages, users) = collections();
        let query = Query::from("m", &messages).join(
            "u",
            &users,
            eq(col("u", "id"), col("m", "authorId")),
        );
        let (earlier, joined) = query.joins[0].sides(&["m".to_string()]).unwrap();
        assert_eq!(earlier, &col("m", "authorId"));
        assert_eq!(joined, &col("u", "id"));
    }

    #[test]
    fn join_requires_equality() {
        let (_store, messages, users) = collections();
        let query = Query::from("m", &messages).join(
            "u",
            &users,
            gt(col("m", "authorId"), col("u", "id")),
        );
        assert!(matches!(
            query.validate(),
            Err(Error::InvalidJoinCondition { alias, .. }) if alias == "u"
        ));
    }

    #[test]
    fn join_sides_must_be_separable() {
        let (_store, messages, users) = collections();
        let query = Query::from("m", &messages).join(
            "u",
            &users,
            eq(col("m", "authorId"), val(1)),
        );
        assert!(matches!(
            query.validate(),
            Err(Error::InvalidJoinCondition { .. })
        ));
    }

    #[test]
    fn duplicate_and_unknown_aliases() {
        let (_store, messages, users) = collections();
        let dup = Query::from("m", &messages).join("m", &users, eq(col("m", "a"), col("m", "b")));
        assert_eq!(dup.validate(), Err(Error::DuplicateAlias("m".into())));

        let unknown = Query::from("m", &messages).filter(eq(col("x", "id"), val(1)));
        assert_eq!(unknown.validate(), Err(Error::UnknownAlias("x".into())));
    }

    #[test]
    fn limit_requires_order_by() {
        let (_store, messages, _) = collections();
        let query = Query::from("m", &messages).limit(10);
        assert_eq!(query.validate(), Err(Error::LimitOffsetRequireOrderBy));

        let query = Query::from("m", &messages)
            .order_by(col("m", "sentAt"), Direction::Asc)
            .offset(5);
        assert!(query.validate().is_ok());
    }

    #[test]
    fn grouped_select_fields_must_be_aggregates_or_keys() {
        let (_store, messages, _) = collections();
        let query = Query::from("m", &messages)
            .group_by([col("m", "authorId")])
            .select([("author", col("m", "authorId")), ("n", count(col("m", "id")))]);
        assert!(query.validate().is_ok());
        assert!(query.is_grouped());

        let query = Query::from("m", &messages)
            .group_by([col("m", "authorId")])
            .select([("text", col("m", "text"))]);
        assert!(matches!(query.validate(), Err(Error::InvalidAggregation(_))));

        // An aggregate alone groups the whole input
        let query = Query::from("m", &messages).select([("n", count(col("m", "id")))]);
        assert!(query.validate().is_ok());

        let query = Query::from("m", &messages).filter(gt(count(col("m", "id")), val(1)));
        assert!(matches!(query.validate(), Err(Error::InvalidAggregation(_))));
    }

    #[test]
    fn having_and_order_read_the_selected_row() {
        let (_store, messages, _) = collections();
        let grouped = || {
            Query::from("m", &messages)
                .group_by([col("m", "authorId")])
                .select([("author", col("m", "authorId")), ("n", count(col("m", "id")))])
        };

        let query = grouped()
            .having(gt(count(col("m", "id")), val(1)))
            .order_by(selected("n"), Direction::Desc);
        assert!(query.validate().is_ok());

        let query = grouped().having(gt(sum(col("m", "likes")), val(1)));
        assert!(matches!(query.validate(), Err(Error::InvalidAggregation(_))));

        let query = grouped().order_by(col("m", "sentAt"), Direction::Asc);
        assert!(matches!(query.validate(), Err(Error::InvalidAggregation(_))));

        let query = Query::from("m", &messages).having(gt(selected("n"), val(1)));
        assert!(matches!(query.validate(), Err(Error::InvalidAggregation(_))));
    }

    #[test]
    fn distinct_requires_a_plain_select() {
        let (_store, messages, _) = collections();
        let query = Query::from("m", &messages).distinct();
        assert!(matches!(query.validate(), Err(Error::InvalidAggregation(_))));

        let query = Query::from("m", &messages)
            .select([("author", col("m", "authorId"))])
            .distinct()
            .order_by(col("m", "authorId"), Direction::Asc);
        assert!(query.validate().is_ok());

        let query = Query::from("m", &messages)
            .select([("n", count(col("m", "id")))])
            .distinct();
        assert!(matches!(query.validate(), Err(Error::InvalidAggregation(_))));
    }

    #[test]
    fn find_one_needs_no_order() {
        let (_store, messages, _) = collections();
        let query = Query::from("m", &messages).find_one();
        assert!(query.validate().is_ok());
        assert!(query.is_single_result());
        assert_eq!(query.limit, Some(1));
    }

    #[test]
    fn builder_sources_are_distinct() {
        let (_store, messages, users) = collections();
        let query = Query::from("a", &users)
            .join("b", &users, eq(col("a", "managerId"), col("b", "id")))
            .join("m", &messages, eq(col("m", "authorId"), col("a", "id")));
        let builder = CollectionConfigBuilder::new("org", query).unwrap();
        let ids: Vec<_> = builder.sources().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![users.id(), messages.id()]);
        assert_eq!(builder.id(), "org");
    }
}
