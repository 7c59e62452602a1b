//! Row filters and their parameters.
//!
//! A [`SetupFilter`] restricts which rows of one table are selected for a
//! client. It declares typed parameters, the joins needed to reach the
//! columns it tests, and where-clauses binding each parameter to a column:
//!
//! ```
//! use rowsync_core::{JoinKind, SetupFilter};
//!
//! let filter = SetupFilter::new("OrderLine")
//!     .with_parameter("CustomerId", "Order", "customer_id")
//!     .with_join(JoinKind::Inner, "Order", ("Order", "id"), ("OrderLine", "order_id"))
//!     .with_where("Order", "customer_id", "CustomerId");
//! assert!(filter.validate().is_ok());
//! ```

use crate::error::{CoreError, CoreResult};
use crate::schema::SyncSchema;
use rowsync_codec::{DataType, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Where a parameter gets its type from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterSource {
    /// Typed like a column of a table, which becomes the owning table.
    Column {
        /// Owning table.
        table: String,
        /// Column the parameter is typed after.
        column: String,
    },
    /// A free-standing typed parameter.
    Custom {
        /// Declared type.
        data_type: DataType,
        /// Maximum length for text and bytes.
        max_len: Option<usize>,
    },
}

/// A declared filter parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterParameter {
    /// Parameter name.
    pub name: String,
    /// Type source.
    pub source: ParameterSource,
    /// When true, a `NULL` value disables the where-clauses using it.
    pub nullable: bool,
    /// Value used when the caller does not bind one.
    pub default: Option<Value>,
}

/// Join kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    /// Rows without a match are excluded.
    Inner,
    /// Rows without a match are kept with null columns.
    Left,
    /// Equivalent to `Inner` for deciding whether a filtered row is selected.
    Right,
}

/// One join on the path from the filtered table to a tested column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterJoin {
    /// Join kind.
    pub kind: JoinKind,
    /// Table brought into scope by this join.
    pub table: String,
    /// Left side of the `ON` clause, `(table, column)`.
    pub left: (String, String),
    /// Right side of the `ON` clause, `(table, column)`.
    pub right: (String, String),
}

impl FilterJoin {
    /// Returns the `(table, column)` pair on the joined table and on the
    /// already reachable side, in that order.
    pub fn sides(&self) -> Option<(&(String, String), &(String, String))> {
        if self.left.0 == self.table {
            Some((&self.left, &self.right))
        } else if self.right.0 == self.table {
            Some((&self.right, &self.left))
        } else {
            None
        }
    }
}

/// A where-clause: `table.column = parameter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterWhere {
    /// Table holding the tested column.
    pub table: String,
    /// Tested column.
    pub column: String,
    /// Parameter the column is compared to.
    pub parameter: String,
}

/// A named row-level filter on one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupFilter {
    /// Filtered table.
    pub table: String,
    /// Declared parameters.
    pub parameters: Vec<FilterParameter>,
    /// Joins in declaration order.
    pub joins: Vec<FilterJoin>,
    /// Where-clauses, combined with `AND`.
    pub wheres: Vec<FilterWhere>,
}

impl SetupFilter {
    /// Creates an empty filter on `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            parameters: Vec::new(),
            joins: Vec::new(),
            wheres: Vec::new(),
        }
    }

    /// Declares a parameter typed after `table.column`.
    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        self.parameters.push(FilterParameter {
            name: name.into(),
            source: ParameterSource::Column {
                table: table.into(),
                column: column.into(),
            },
            nullable: false,
            default: None,
        });
        self
    }

    /// Declares a free-standing typed parameter.
    pub fn with_custom_parameter(
        mut self,
        name: impl Into<String>,
        data_type: DataType,
        max_len: Option<usize>,
    ) -> Self {
        self.parameters.push(FilterParameter {
            name: name.into(),
            source: ParameterSource::Custom { data_type, max_len },
            nullable: false,
            default: None,
        });
        self
    }

    /// Makes the last declared parameter nullable with an optional default.
    pub fn nullable(mut self, default: Option<Value>) -> Self {
        if let Some(param) = self.parameters.last_mut() {
            param.nullable = true;
            param.default = default;
        }
        self
    }

    /// Declares a join.
    pub fn with_join(
        mut self,
        kind: JoinKind,
        table: impl Into<String>,
        left: (&str, &str),
        right: (&str, &str),
    ) -> Self {
        self.joins.push(FilterJoin {
            kind,
            table: table.into(),
            left: (left.0.to_string(), left.1.to_string()),
            right: (right.0.to_string(), right.1.to_string()),
        });
        self
    }

    /// Declares a where-clause.
    pub fn with_where(
        mut self,
        table: impl Into<String>,
        column: impl Into<String>,
        parameter: impl Into<String>,
    ) -> Self {
        self.wheres.push(FilterWhere {
            table: table.into(),
            column: column.into(),
            parameter: parameter.into(),
        });
        self
    }

    /// Name used to specialise generated objects for this filter.
    pub fn name(&self) -> String {
        let names: Vec<&str> = self.parameters.iter().map(|p| p.name.as_str()).collect();
        if names.is_empty() {
            "filter".to_string()
        } else {
            names.join("_")
        }
    }

    /// Finds a declared parameter.
    pub fn parameter(&self, name: &str) -> Option<&FilterParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Columns of the filtered table that tracking rows must remember so
    /// that deletes can still be filtered once the live row is gone.
    pub fn tracked_columns(&self) -> Vec<String> {
        let mut columns = BTreeSet::new();
        for clause in &self.wheres {
            if clause.table == self.table {
                columns.insert(clause.column.clone());
            }
        }
        for join in &self.joins {
            for (table, column) in [&join.left, &join.right] {
                if *table == self.table {
                    columns.insert(column.clone());
                }
            }
        }
        columns.into_iter().collect()
    }

    /// Checks that every where-clause uses a declared parameter and every
    /// join is reachable from the filtered table or a parameter's table.
    pub fn validate(&self) -> CoreResult<()> {
        let mut declared = BTreeSet::new();
        for param in &self.parameters {
            if !declared.insert(param.name.as_str()) {
                return Err(CoreError::invalid_setup(format!(
                    "filter on {}: parameter {} declared twice",
                    self.table, param.name
                )));
            }
        }

        let mut reachable: BTreeSet<&str> = BTreeSet::new();
        reachable.insert(self.table.as_str());
        for param in &self.parameters {
            if let ParameterSource::Column { table, .. } = &param.source {
                reachable.insert(table.as_str());
            }
        }

        let mut joined: BTreeSet<&str> = BTreeSet::new();
        joined.insert(self.table.as_str());
        for join in &self.joins {
            let (_, other) = join.sides().ok_or_else(|| {
                CoreError::invalid_setup(format!(
                    "filter on {}: join to {} does not reference it",
                    self.table, join.table
                ))
            })?;
            if !reachable.contains(other.0.as_str()) {
                return Err(CoreError::invalid_setup(format!(
                    "filter on {}: join target {} is not reachable from {}",
                    self.table, join.table, other.0
                )));
            }
            reachable.insert(join.table.as_str());
            joined.insert(join.table.as_str());
        }

        for clause in &self.wheres {
            if !declared.contains(clause.parameter.as_str()) {
                return Err(CoreError::invalid_setup(format!(
                    "filter on {}: where-clause uses undeclared parameter {}",
                    self.table, clause.parameter
                )));
            }
            if !joined.contains(clause.table.as_str()) {
                return Err(CoreError::invalid_setup(format!(
                    "filter on {}: where-clause tests {} which is never joined",
                    self.table, clause.table
                )));
            }
        }

        Ok(())
    }

    /// Resolves parameter values for one run.
    ///
    /// Missing values fall back to the declared default, then to `NULL` for
    /// nullable parameters. Values are type-checked against the declared type
    /// or, for column parameters, against the column in `schema` when the
    /// owning table is part of it.
    pub fn bind(&self, parameters: &SyncParameters, schema: &SyncSchema) -> CoreResult<BoundFilter> {
        let mut values = BTreeMap::new();

        for param in &self.parameters {
            let value = match parameters.get(&param.name) {
                Some(value) => value.clone(),
                None => match (&param.default, param.nullable) {
                    (Some(default), _) => default.clone(),
                    (None, true) => Value::Null,
                    (None, false) => {
                        return Err(CoreError::invalid_parameter(&param.name, "no value bound"))
                    }
                },
            };

            if value.is_null() && !param.nullable {
                return Err(CoreError::invalid_parameter(&param.name, "not nullable"));
            }

            let check = match &param.source {
                ParameterSource::Custom { data_type, max_len } => {
                    value.check_type(*data_type, *max_len)
                }
                ParameterSource::Column { table, column } => {
                    match schema.table(table).and_then(|t| t.column(column)) {
                        Some(col) => value.check_type(col.data_type, col.max_len),
                        None => Ok(()),
                    }
                }
            };
            check.map_err(|e| CoreError::invalid_parameter(&param.name, e.to_string()))?;

            values.insert(param.name.clone(), value);
        }

        Ok(BoundFilter {
            filter: self.clone(),
            values,
        })
    }
}

/// Caller-supplied filter parameter values for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncParameters(BTreeMap<String, Value>);

impl SyncParameters {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Looks up a value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Returns true if no value is bound.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over bound values in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Stable fingerprint of the bound values.
    pub fn fingerprint(&self) -> CoreResult<String> {
        Ok(rowsync_codec::fingerprint(&self.0)?)
    }
}

/// A filter with every parameter resolved to a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundFilter {
    /// The filter definition.
    pub filter: SetupFilter,
    /// Resolved parameter values.
    pub values: BTreeMap<String, Value>,
}

impl BoundFilter {
    /// Returns true if the where-clause is satisfied by `actual` for the
    /// given parameter, honouring nullable parameters bound to `NULL`.
    pub fn clause_matches(&self, clause: &FilterWhere, actual: Option<&Value>) -> bool {
        let expected = self.values.get(&clause.parameter).unwrap_or(&Value::Null);
        let nullable = self
            .filter
            .parameter(&clause.parameter)
            .map(|p| p.nullable)
            .unwrap_or(false);

        if expected.is_null() && nullable {
            return true;
        }
        match actual {
            Some(actual) => !actual.is_null() && actual == expected,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, TableSchema};

    fn order_line_filter() -> SetupFilter {
        SetupFilter::new("OrderLine")
            .with_parameter("CustomerId", "Order", "customer_id")
            .with_join(JoinKind::Inner, "Order", ("Order", "id"), ("OrderLine", "order_id"))
            .with_where("Order", "customer_id", "CustomerId")
    }

    fn schema() -> SyncSchema {
        SyncSchema::new(vec![TableSchema::new(
            "Order",
            vec![
                ColumnSchema::new("id", DataType::Integer),
                ColumnSchema::new("customer_id", DataType::Integer),
            ],
            &["id"],
        )])
    }

    #[test]
    fn valid_filter_passes() {
        assert!(order_line_filter().validate().is_ok());
    }

    #[test]
    fn undeclared_parameter_rejected() {
        let filter = SetupFilter::new("Customer").with_where("Customer", "region", "Region");
        let err = filter.validate().unwrap_err();
        assert!(err.to_string().contains("undeclared parameter Region"));
    }

    #[test]
    fn unreachable_join_rejected() {
        let filter = SetupFilter::new("OrderLine")
            .with_custom_parameter("Region", DataType::Text, Some(8))
            .with_join(JoinKind::Inner, "Address", ("Address", "id"), ("Customer", "address_id"))
            .with_where("Address", "region", "Region");
        let err = filter.validate().unwrap_err();
        assert!(err.to_string().contains("not reachable"));
    }

    #[test]
    fn where_on_unjoined_table_rejected() {
        let filter = SetupFilter::new("OrderLine")
            .with_parameter("CustomerId", "Order", "customer_id")
            .with_where("Order", "customer_id", "CustomerId");
        assert!(filter.validate().is_err());
    }

    #[test]
    fn tracked_columns_cover_where_and_join() {
        let filter = order_line_filter().with_custom_parameter("Sku", DataType::Text, None).with_where(
            "OrderLine",
            "sku",
            "Sku",
        );
        assert_eq!(filter.tracked_columns(), vec!["order_id", "sku"]);
    }

    #[test]
    fn bind_uses_defaults_and_checks_types() {
        let filter = order_line_filter();
        assert!(filter.bind(&SyncParameters::new(), &schema()).is_err());

        let bound = filter
            .bind(&SyncParameters::new().with("CustomerId", 7i64), &schema())
            .unwrap();
        assert_eq!(bound.values["CustomerId"], Value::Integer(7));

        let wrong = SyncParameters::new().with("CustomerId", "seven");
        assert!(matches!(
            filter.bind(&wrong, &schema()),
            Err(CoreError::InvalidFilterParameter { .. })
        ));

        let filter = SetupFilter::new("Customer")
            .with_custom_parameter("Region", DataType::Text, None)
            .nullable(None)
            .with_where("Customer", "region", "Region");
        let bound = filter.bind(&SyncParameters::new(), &schema()).unwrap();
        let clause = &filter.wheres[0];
        assert!(bound.clause_matches(clause, Some(&Value::Text("EU".into()))));
    }

    #[test]
    fn clause_matching() {
        let bound = order_line_filter()
            .bind(&SyncParameters::new().with("CustomerId", 1i64), &schema())
            .unwrap();
        let clause = &bound.filter.wheres[0];
        assert!(bound.clause_matches(clause, Some(&Value::Integer(1))));
        assert!(!bound.clause_matches(clause, Some(&Value::Integer(2))));
        assert!(!bound.clause_matches(clause, Some(&Value::Null)));
        assert!(!bound.clause_matches(clause, None));
    }
}
