//! Row filters for select/update/delete.

use serde_json::Value;

use crate::types::{Row, value_as_id};

/// A column filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value`
    Eq(String, Value),
    /// `column IN (values)`
    In(String, Vec<Value>),
}

impl Filter {
    fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Eq(column, value) => row.get(column).is_some_and(|v| same_value(v, value)),
            Filter::In(column, values) => row
                .get(column)
                .is_some_and(|v| values.iter().any(|candidate| same_value(v, candidate))),
        }
    }
}

/// Sort order for select results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// A query against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    /// Start a query on a table.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    /// Add an equality filter.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.into(), value.into()));
        self
    }

    /// Add a membership filter.
    pub fn is_in<V: Into<Value>>(
        mut self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.filters.push(Filter::In(
            column.into(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Order results by a column.
    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    /// Limit the number of rows returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check whether a row satisfies every filter.
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Render the query as REST query parameters.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = Vec::with_capacity(self.filters.len() + 2);
        for filter in &self.filters {
            match filter {
                Filter::Eq(column, value) => {
                    params.push((column.clone(), format!("eq.{}", render(value))));
                }
                Filter::In(column, values) => {
                    let list = values.iter().map(render).collect::<Vec<_>>().join(",");
                    params.push((column.clone(), format!("in.({})", list)));
                }
            }
        }
        if let Some(order) = &self.order {
            let dir = if order.ascending { "asc" } else { "desc" };
            params.push(("order".to_string(), format!("{}.{}", order.column, dir)));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

fn render(value: &Value) -> String {
    value_as_id(value).unwrap_or_else(|| value.to_string())
}

/// Compare ids loosely so `1` and `"1"` refer to the same row.
fn same_value(a: &Value, b: &Value) -> bool {
    match (value_as_id(a), value_as_id(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_to_params() {
        let query = Query::table("shout_comments")
            .eq("shout_id", "s1")
            .is_in("user_id", ["u1", "u2"])
            .order_by("created_at", true)
            .limit(20);

        assert_eq!(
            query.to_params(),
            vec![
                ("shout_id".to_string(), "eq.s1".to_string()),
                ("user_id".to_string(), "in.(u1,u2)".to_string()),
                ("order".to_string(), "created_at.asc".to_string()),
                ("limit".to_string(), "20".to_string()),
            ]
        );
    }

    #[test]
    fn test_matches() {
        let row = json!({"shout_id": "s1", "user_id": 7, "is_read": false});
        let row = row.as_object().unwrap();

        assert!(Query::table("t").eq("shout_id", "s1").matches(row));
        assert!(Query::table("t").eq("user_id", "7").matches(row));
        assert!(Query::table("t").eq("is_read", false).matches(row));
        assert!(!Query::table("t").eq("shout_id", "s2").matches(row));
        assert!(!Query::table("t").eq("missing", "x").matches(row));
        assert!(Query::table("t").is_in("user_id", [1, 7]).matches(row));
    }

    proptest! {
        /// An `in` filter matches exactly when one of its `eq` parts would.
        #[test]
        fn prop_in_is_union_of_eq(
            value in 0u32..20,
            candidates in prop::collection::vec(0u32..20, 0..6),
        ) {
            let row = json!({"user_id": value.to_string()});
            let row = row.as_object().unwrap();

            let any_eq = candidates
                .iter()
                .any(|c| Query::table("t").eq("user_id", *c).matches(row));
            let in_match = Query::table("t")
                .is_in("user_id", candidates.iter().copied())
                .matches(row);
            prop_assert_eq!(in_match, any_eq);
        }
    }
}
