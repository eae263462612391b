//! Row selection: filters, ordering and ranges.

use serde_json::Value;
use std::cmp::Ordering;

use super::Row;

/// A predicate on one row.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
  Eq(String, Value),
  Gte(String, Value),
  Lte(String, Value),
  /// Case-insensitive pattern; `%` matches any run, `_` one character
  ILike(String, String),
  In(String, Vec<Value>),
  /// Matches when any inner filter matches
  Or(Vec<Filter>),
}

impl Filter {
  pub fn eq(column: &str, value: impl Into<Value>) -> Self {
    Filter::Eq(column.to_string(), value.into())
  }

  pub fn ilike(column: &str, pattern: impl Into<String>) -> Self {
    Filter::ILike(column.to_string(), pattern.into())
  }

  pub fn is_in(column: &str, values: impl IntoIterator<Item = Value>) -> Self {
    Filter::In(column.to_string(), values.into_iter().collect())
  }

  pub fn matches(&self, row: &Row) -> bool {
    match self {
      Filter::Eq(column, value) => row.get(column) == Some(value),
      Filter::Gte(column, value) => row
        .get(column)
        .and_then(|v| compare(v, value))
        .is_some_and(|o| o != Ordering::Less),
      Filter::Lte(column, value) => row
        .get(column)
        .and_then(|v| compare(v, value))
        .is_some_and(|o| o != Ordering::Greater),
      Filter::ILike(column, pattern) => match row.get(column) {
        Some(Value::String(s)) => ilike(s, pattern),
        _ => false,
      },
      Filter::In(column, values) => row.get(column).is_some_and(|v| values.contains(v)),
      Filter::Or(filters) => filters.iter().any(|f| f.matches(row)),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
  pub column: String,
  pub ascending: bool,
}

/// Filters, ordering and an inclusive offset range applied to a collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Select {
  pub filters: Vec<Filter>,
  pub order: Option<Order>,
  /// Inclusive `(from, to)` row offsets after ordering
  pub range: Option<(usize, usize)>,
  pub limit: Option<usize>,
}

impl Select {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
    self.order = Some(Order {
      column: column.to_string(),
      ascending,
    });
    self
  }

  pub fn range(mut self, from: usize, to: usize) -> Self {
    self.range = Some((from, to));
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn matches(&self, row: &Row) -> bool {
    self.filters.iter().all(|f| f.matches(row))
  }

  /// Run the selection over `rows`, cloning the survivors.
  pub fn apply<'a>(&self, rows: impl Iterator<Item = &'a Row>) -> Vec<Row> {
    let mut selected: Vec<Row> = rows.filter(|r| self.matches(r)).cloned().collect();

    if let Some(order) = &self.order {
      selected.sort_by(|a, b| {
        let ord = match (a.get(&order.column), b.get(&order.column)) {
          (Some(x), Some(y)) => compare(x, y).unwrap_or(Ordering::Equal),
          (Some(_), None) => Ordering::Less,
          (None, Some(_)) => Ordering::Greater,
          (None, None) => Ordering::Equal,
        };
        if order.ascending {
          ord
        } else {
          ord.reverse()
        }
      });
    }

    let selected: Vec<Row> = match self.range {
      Some((from, to)) if to >= from => selected
        .into_iter()
        .skip(from)
        .take((to - from).saturating_add(1))
        .collect(),
      Some(_) => Vec::new(),
      None => selected,
    };

    match self.limit {
      Some(limit) => selected.into_iter().take(limit).collect(),
      None => selected,
    }
  }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
    (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
    (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
    _ => None,
  }
}

fn ilike(text: &str, pattern: &str) -> bool {
  let text: Vec<char> = text.to_lowercase().chars().collect();
  let pattern: Vec<char> = pattern.to_lowercase().chars().collect();

  // matched[j]: pattern[..j] matches text[..i] for the current i
  let mut matched = vec![false; pattern.len() + 1];
  matched[0] = true;
  for j in 1..=pattern.len() {
    matched[j] = matched[j - 1] && pattern[j - 1] == '%';
  }

  for c in &text {
    let mut next = vec![false; pattern.len() + 1];
    for j in 1..=pattern.len() {
      next[j] = match pattern[j - 1] {
        '%' => next[j - 1] || matched[j],
        '_' => matched[j - 1],
        p => matched[j - 1] && p == *c,
      };
    }
    matched = next;
  }

  matched[pattern.len()]
}
