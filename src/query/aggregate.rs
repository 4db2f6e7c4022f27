use crate::core::Value;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateType {
    Count,
    Sum,
    Average,
    Maximum,
    Minimum,
}

impl AggregateType {
    pub fn sql(&self) -> &'static str {
        match self {
            AggregateType::Count => "COUNT",
            AggregateType::Sum => "SUM",
            AggregateType::Average => "AVG",
            AggregateType::Maximum => "MAX",
            AggregateType::Minimum => "MIN",
        }
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

/// An aggregate function applied to one field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateFunction {
    pub aggregate_type: AggregateType,
    pub field: String,
}

impl AggregateFunction {
    pub fn new(aggregate_type: AggregateType, field: &str) -> Self {
        Self {
            aggregate_type,
            field: field.to_string(),
        }
    }

    pub fn count(field: &str) -> Self {
        Self::new(AggregateType::Count, field)
    }

    pub fn sum(field: &str) -> Self {
        Self::new(AggregateType::Sum, field)
    }

    pub fn average(field: &str) -> Self {
        Self::new(AggregateType::Average, field)
    }

    pub fn maximum(field: &str) -> Self {
        Self::new(AggregateType::Maximum, field)
    }

    pub fn minimum(field: &str) -> Self {
        Self::new(AggregateType::Minimum, field)
    }
}

/// Result of one aggregate function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub function: AggregateFunction,
    pub value: Value,
}

/// Grouping key of a grouped aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grouping {
    Text(String),
    Date(NaiveDate),
}

impl Grouping {
    pub fn from_value(value: &Value) -> Grouping {
        match value.as_date() {
            Some(date) => Grouping::Date(date),
            None => Grouping::Text(match value {
                Value::Text(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            }),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Grouping::Text(s) => Some(s),
            Grouping::Date(_) => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Grouping::Date(d) => Some(*d),
            Grouping::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupingAggregation {
    pub groupings: Vec<Grouping>,
    pub aggregations: Vec<Aggregation>,
}

impl GroupingAggregation {
    pub fn aggregation(&self, field: &str) -> Option<&Aggregation> {
        self.aggregations.iter().find(|a| a.function.field == field)
    }
}
