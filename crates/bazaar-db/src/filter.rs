//! Filter forest: named groups of predicates combined by AND/OR.
//!
//! Groups live in an arena and refer to their parent by [`GroupHandle`]. A
//! parent must exist when a group is created and is never retargeted, so a
//! parent always sits before its children in the arena and the forest can
//! not contain cycles.
//!
//! [`FilterForest::condition`] folds the forest into a backend-neutral
//! [`Condition`] tree. Empty groups are pruned there, so no backend ever has
//! to render an empty clause.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use bazaar_types::{ColumnType, Value};

use crate::error::DbError;
use crate::query::Query;

/// Group that plain `add_filter` calls land in.
pub const DEFAULT_GROUP: &str = "default";

/// Group that survives `clear_filters`.
pub const STATIC_GROUP: &str = "static";

// ---------------------------------------------------------------------------
// Operators and operands
// ---------------------------------------------------------------------------

/// Comparison operator of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// `=`
    Eq,
    /// `!=` or `<>`
    NotEq,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `LIKE` (substring match unless the pattern has its own wildcard)
    Like,
    /// `IN` (literal list or sub-collection)
    In,
}

impl Operator {
    /// Parse one of `=`, `!=`, `<>`, `>`, `>=`, `<`, `<=`, `LIKE`, `IN`.
    pub fn parse(token: &str) -> Result<Self, DbError> {
        let token = token.trim();
        let op = match token {
            "=" => Self::Eq,
            "!=" | "<>" => Self::NotEq,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "<" => Self::Lt,
            "<=" => Self::Le,
            t if t.eq_ignore_ascii_case("like") => Self::Like,
            t if t.eq_ignore_ascii_case("in") => Self::In,
            other => return Err(DbError::UnsupportedOperator(other.to_owned())),
        };
        Ok(op)
    }

    /// SQL spelling.
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Like => "LIKE",
            Self::In => "IN",
        }
    }

    /// Whether the operator orders values.
    pub const fn is_ordering(self) -> bool {
        matches!(self, Self::Gt | Self::Ge | Self::Lt | Self::Le)
    }
}

impl FromStr for Operator {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl core::fmt::Display for Operator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Right-hand side of a predicate.
#[derive(Debug, Clone)]
pub enum Operand {
    /// A single value.
    Value(Value),
    /// A list of values (`IN`, or multi-value array membership).
    List(Vec<Value>),
    /// Another collection's query, used as `IN (SELECT ...)`.
    Select(Box<Query>),
}

macro_rules! operand_from_value {
    ($($source:ty),* $(,)?) => {
        $(
            impl From<$source> for Operand {
                fn from(v: $source) -> Self {
                    Self::Value(v.into())
                }
            }
        )*
    };
}

operand_from_value!(Value, bool, i32, i64, f64, Decimal, String, &str, DateTime<Utc>);

impl<T: Into<Value>> From<Vec<T>> for Operand {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<Query> for Operand {
    fn from(query: Query) -> Self {
        Self::Select(Box::new(query))
    }
}

/// A validated predicate with its operand already in the column's
/// representation.
#[derive(Debug, Clone)]
pub struct Predicate {
    /// Column the predicate tests.
    pub column: String,
    /// Logical type of the column.
    pub kind: ColumnType,
    /// Operator.
    pub op: Operator,
    /// Coerced operand. `LIKE` patterns are already wildcard-wrapped.
    pub operand: Operand,
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

/// How a group combines its predicates and children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Join {
    /// All must hold.
    #[default]
    And,
    /// Any may hold.
    Or,
}

impl Join {
    /// `Or` when `or` is set, `And` otherwise.
    pub const fn from_or(or: bool) -> Self {
        if or { Self::Or } else { Self::And }
    }
}

/// Position of a group in its forest's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupHandle(usize);

/// A named group of predicates.
#[derive(Debug, Clone)]
pub struct FilterGroup {
    name: String,
    join: Join,
    parent: Option<GroupHandle>,
    predicates: Vec<Predicate>,
}

impl FilterGroup {
    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Combination mode.
    pub const fn join(&self) -> Join {
        self.join
    }

    /// Parent group, if any.
    pub const fn parent(&self) -> Option<GroupHandle> {
        self.parent
    }

    /// Predicates added directly to the group.
    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }
}

/// Backend-neutral boolean tree built from a forest.
#[derive(Debug)]
pub enum Condition<'a> {
    /// Conjunction.
    All(Vec<Self>),
    /// Disjunction.
    Any(Vec<Self>),
    /// Leaf predicate.
    Predicate(&'a Predicate),
}

/// Arena of filter groups addressed by name.
#[derive(Debug, Clone, Default)]
pub struct FilterForest {
    groups: Vec<FilterGroup>,
    index: HashMap<String, GroupHandle>,
}

impl FilterForest {
    /// Create an empty forest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle of a named group.
    pub fn handle(&self, name: &str) -> Option<GroupHandle> {
        self.index.get(name).copied()
    }

    /// Group behind a handle.
    pub fn group(&self, handle: GroupHandle) -> Option<&FilterGroup> {
        self.groups.get(handle.0)
    }

    /// Whether the forest holds no predicates at all.
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.predicates.is_empty())
    }

    fn create(&mut self, name: &str, join: Join, parent: Option<GroupHandle>) -> GroupHandle {
        let handle = GroupHandle(self.groups.len());
        self.groups.push(FilterGroup {
            name: name.to_owned(),
            join,
            parent,
            predicates: Vec::new(),
        });
        self.index.insert(name.to_owned(), handle);
        handle
    }

    /// Create or update a group.
    ///
    /// An existing group gets its join mode replaced; its parent can only be
    /// confirmed, never changed. A parent name that does not exist fails
    /// with [`DbError::UnknownFilterGroup`].
    pub fn setup_group(&mut self, name: &str, join: Join, parent: Option<&str>) -> Result<GroupHandle, DbError> {
        let parent_handle = parent
            .map(|p| self.handle(p).ok_or_else(|| DbError::UnknownFilterGroup(p.to_owned())))
            .transpose()?;

        let Some(handle) = self.handle(name) else {
            return Ok(self.create(name, join, parent_handle));
        };
        let group = self
            .groups
            .get_mut(handle.0)
            .ok_or_else(|| DbError::UnknownFilterGroup(name.to_owned()))?;
        if let (Some(requested), Some(p)) = (parent_handle, parent) {
            if group.parent != Some(requested) {
                return Err(DbError::FilterGroupParent {
                    group: name.to_owned(),
                    parent: p.to_owned(),
                });
            }
        }
        group.join = join;
        Ok(handle)
    }

    /// Append a predicate, creating the group as a parentless AND group if
    /// it does not exist yet.
    pub fn push(&mut self, group: &str, predicate: Predicate) {
        let handle = self
            .handle(group)
            .unwrap_or_else(|| self.create(group, Join::And, None));
        if let Some(target) = self.groups.get_mut(handle.0) {
            target.predicates.push(predicate);
        }
    }

    /// Remove every group except the static one and the groups nested in
    /// it. A nested static group becomes a root group.
    pub fn clear(&mut self) {
        if let Some(group) = self.handle(STATIC_GROUP).and_then(|h| self.groups.get_mut(h.0)) {
            group.parent = None;
        }
        let mut kept = vec![false; self.groups.len()];
        for (i, group) in self.groups.iter().enumerate() {
            let parent_kept = group.parent.is_some_and(|p| kept.get(p.0).copied().unwrap_or(false));
            if let Some(slot) = kept.get_mut(i) {
                *slot = group.name == STATIC_GROUP || parent_kept;
            }
        }
        let mut position = 0_usize;
        self.retain(|_| {
            let keep = kept.get(position).copied().unwrap_or(false);
            position = position.saturating_add(1);
            keep
        });
    }

    /// Remove a group together with all of its descendants.
    ///
    /// Returns `false` if no such group exists.
    pub fn remove_group(&mut self, name: &str) -> bool {
        let Some(root) = self.handle(name) else {
            return false;
        };
        let mut doomed = vec![false; self.groups.len()];
        for (i, group) in self.groups.iter().enumerate() {
            let parent_doomed = group
                .parent
                .is_some_and(|p| doomed.get(p.0).copied().unwrap_or(false));
            if let Some(slot) = doomed.get_mut(i) {
                *slot = i == root.0 || parent_doomed;
            }
        }
        let mut position = 0;
        self.retain(|_| {
            let keep = !doomed.get(position).copied().unwrap_or(false);
            position = position.saturating_add(1);
            keep
        });
        true
    }

    /// Keep the groups `keep` accepts, visiting in arena order, and remap
    /// parent handles. Groups whose parent is dropped are dropped too.
    fn retain(&mut self, mut keep: impl FnMut(&FilterGroup) -> bool) {
        let old = std::mem::take(&mut self.groups);
        let mut remap: Vec<Option<GroupHandle>> = Vec::with_capacity(old.len());
        for mut group in old {
            let parent = group.parent.map(|p| remap.get(p.0).copied().flatten());
            let parent_gone = matches!(parent, Some(None));
            if keep(&group) && !parent_gone {
                group.parent = parent.flatten();
                remap.push(Some(GroupHandle(self.groups.len())));
                self.groups.push(group);
            } else {
                remap.push(None);
            }
        }
        self.index = self
            .groups
            .iter()
            .enumerate()
            .map(|(i, g)| (g.name.clone(), GroupHandle(i)))
            .collect();
    }

    /// Every predicate in the forest, for in-place operand rewriting.
    pub fn predicates_mut(&mut self) -> impl Iterator<Item = &mut Predicate> {
        self.groups.iter_mut().flat_map(|g| g.predicates.iter_mut())
    }

    /// Fold the forest into a condition. `None` when nothing filters.
    ///
    /// Each group yields its own predicates followed by its children's
    /// conditions, joined by its mode. Root groups are AND-ed together.
    pub fn condition(&self) -> Option<Condition<'_>> {
        let roots: Vec<Condition<'_>> = self
            .groups
            .iter()
            .enumerate()
            .filter(|(_, g)| g.parent.is_none())
            .filter_map(|(i, _)| self.group_condition(i))
            .collect();
        collapse(roots, Join::And)
    }

    fn group_condition(&self, index: usize) -> Option<Condition<'_>> {
        let group = self.groups.get(index)?;
        let mut parts: Vec<Condition<'_>> = group.predicates.iter().map(Condition::Predicate).collect();
        parts.extend(
            self.groups
                .iter()
                .enumerate()
                .skip(index.saturating_add(1))
                .filter(|(_, g)| g.parent == Some(GroupHandle(index)))
                .filter_map(|(i, _)| self.group_condition(i)),
        );
        collapse(parts, group.join)
    }
}

fn collapse(mut parts: Vec<Condition<'_>>, join: Join) -> Option<Condition<'_>> {
    match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => Some(match join {
            Join::And => Condition::All(parts),
            Join::Or => Condition::Any(parts),
        }),
    }
}
