// ============================================================================
// Restriction Model
// ============================================================================
//
// Criteria are a closed sum type. Each variant fixes the arity of its
// operands, and each operator enum lists only the kinds valid for that
// arity, so a BETWEEN with one operand or an AND with a field name cannot be
// constructed.
//
// ============================================================================

pub mod builder;
pub mod translator;

pub use builder::CriteriaBuilder;
pub use translator::{RestrictionTranslator, RestrictionTranslatorMapper};

use crate::core::{DbError, ErrorCode, Result, Value};
use std::fmt;

/// Flat list of every restriction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestrictionType {
    Equals,
    IEquals,
    NotEquals,
    INotEquals,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    Between,
    NotBetween,
    Amongst,
    NotAmongst,
    Like,
    ILike,
    NotLike,
    BeginsWith,
    IBeginsWith,
    NotBeginWith,
    EndsWith,
    IEndsWith,
    NotEndWith,
    IsNull,
    IsNotNull,
    And,
    Or,
}

impl RestrictionType {
    pub fn is_compound(&self) -> bool {
        matches!(self, RestrictionType::And | RestrictionType::Or)
    }

    /// Operator symbol used by the human-readable translator.
    pub fn symbol(&self) -> &'static str {
        match self {
            RestrictionType::Equals => "==",
            RestrictionType::IEquals => "== (any case)",
            RestrictionType::NotEquals => "!=",
            RestrictionType::INotEquals => "!= (any case)",
            RestrictionType::LessThan => "<",
            RestrictionType::LessOrEqual => "<=",
            RestrictionType::GreaterThan => ">",
            RestrictionType::GreaterOrEqual => ">=",
            RestrictionType::Between => "between",
            RestrictionType::NotBetween => "not between",
            RestrictionType::Amongst => "in",
            RestrictionType::NotAmongst => "not in",
            RestrictionType::Like => "like",
            RestrictionType::ILike => "like (any case)",
            RestrictionType::NotLike => "not like",
            RestrictionType::BeginsWith => "begins with",
            RestrictionType::IBeginsWith => "begins with (any case)",
            RestrictionType::NotBeginWith => "not begin with",
            RestrictionType::EndsWith => "ends with",
            RestrictionType::IEndsWith => "ends with (any case)",
            RestrictionType::NotEndWith => "not end with",
            RestrictionType::IsNull => "is null",
            RestrictionType::IsNotNull => "is not null",
            RestrictionType::And => "and",
            RestrictionType::Or => "or",
        }
    }
}

impl fmt::Display for RestrictionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullOp {
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equals,
    IEquals,
    NotEquals,
    INotEquals,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    Like,
    ILike,
    NotLike,
    BeginsWith,
    IBeginsWith,
    NotBeginWith,
    EndsWith,
    IEndsWith,
    NotEndWith,
}

impl CompareOp {
    pub fn is_case_insensitive(&self) -> bool {
        matches!(
            self,
            CompareOp::IEquals
                | CompareOp::INotEquals
                | CompareOp::ILike
                | CompareOp::IBeginsWith
                | CompareOp::IEndsWith
        )
    }

    pub fn restriction_type(&self) -> RestrictionType {
        match self {
            CompareOp::Equals => RestrictionType::Equals,
            CompareOp::IEquals => RestrictionType::IEquals,
            CompareOp::NotEquals => RestrictionType::NotEquals,
            CompareOp::INotEquals => RestrictionType::INotEquals,
            CompareOp::LessThan => RestrictionType::LessThan,
            CompareOp::LessOrEqual => RestrictionType::LessOrEqual,
            CompareOp::GreaterThan => RestrictionType::GreaterThan,
            CompareOp::GreaterOrEqual => RestrictionType::GreaterOrEqual,
            CompareOp::Like => RestrictionType::Like,
            CompareOp::ILike => RestrictionType::ILike,
            CompareOp::NotLike => RestrictionType::NotLike,
            CompareOp::BeginsWith => RestrictionType::BeginsWith,
            CompareOp::IBeginsWith => RestrictionType::IBeginsWith,
            CompareOp::NotBeginWith => RestrictionType::NotBeginWith,
            CompareOp::EndsWith => RestrictionType::EndsWith,
            CompareOp::IEndsWith => RestrictionType::IEndsWith,
            CompareOp::NotEndWith => RestrictionType::NotEndWith,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Between,
    NotBetween,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Amongst,
    NotAmongst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    pub fn sql(&self) -> &'static str {
        match self {
            LogicalOp::And => "AND",
            LogicalOp::Or => "OR",
        }
    }
}

/// Right-hand operand: a literal or another field of the same entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Value(Value),
    Field(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Restriction {
    Null {
        op: NullOp,
        field: String,
    },
    Compare {
        op: CompareOp,
        field: String,
        param: Param,
    },
    Range {
        op: RangeOp,
        field: String,
        lower: Param,
        upper: Param,
    },
    Set {
        op: SetOp,
        field: String,
        values: Vec<Value>,
    },
    Compound(CompoundRestriction),
}

impl Restriction {
    /// True for compounds that hold no leaf restriction at any depth.
    pub fn is_vacuous(&self) -> bool {
        match self {
            Restriction::Compound(compound) => compound.is_vacuous(),
            _ => false,
        }
    }

    pub fn compare(op: CompareOp, field: &str, value: impl Into<Value>) -> Self {
        Restriction::Compare {
            op,
            field: field.to_string(),
            param: Param::Value(value.into()),
        }
    }

    pub fn compare_field(op: CompareOp, field: &str, other_field: &str) -> Self {
        Restriction::Compare {
            op,
            field: field.to_string(),
            param: Param::Field(other_field.to_string()),
        }
    }

    pub fn range(op: RangeOp, field: &str, lower: impl Into<Value>, upper: impl Into<Value>) -> Self {
        Restriction::Range {
            op,
            field: field.to_string(),
            lower: Param::Value(lower.into()),
            upper: Param::Value(upper.into()),
        }
    }

    pub fn range_field(op: RangeOp, field: &str, lower_field: &str, upper_field: &str) -> Self {
        Restriction::Range {
            op,
            field: field.to_string(),
            lower: Param::Field(lower_field.to_string()),
            upper: Param::Field(upper_field.to_string()),
        }
    }

    /// Multi-value restriction. An empty value list is a programmer error.
    pub fn set<I, V>(op: SetOp, field: &str, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return Err(DbError::coded(
                ErrorCode::EmptyMultiValueRestriction,
                format!("Multi-value restriction on '{}' has no values", field),
            ));
        }
        Ok(Restriction::Set {
            op,
            field: field.to_string(),
            values,
        })
    }

    pub fn null(op: NullOp, field: &str) -> Self {
        Restriction::Null {
            op,
            field: field.to_string(),
        }
    }

    pub fn restriction_type(&self) -> RestrictionType {
        match self {
            Restriction::Null { op: NullOp::IsNull, .. } => RestrictionType::IsNull,
            Restriction::Null { op: NullOp::IsNotNull, .. } => RestrictionType::IsNotNull,
            Restriction::Compare { op, .. } => op.restriction_type(),
            Restriction::Range { op: RangeOp::Between, .. } => RestrictionType::Between,
            Restriction::Range { op: RangeOp::NotBetween, .. } => RestrictionType::NotBetween,
            Restriction::Set { op: SetOp::Amongst, .. } => RestrictionType::Amongst,
            Restriction::Set { op: SetOp::NotAmongst, .. } => RestrictionType::NotAmongst,
            Restriction::Compound(compound) => match compound.op {
                LogicalOp::And => RestrictionType::And,
                LogicalOp::Or => RestrictionType::Or,
            },
        }
    }

    /// Field the restriction applies to; `None` for compounds.
    pub fn field(&self) -> Option<&str> {
        match self {
            Restriction::Null { field, .. }
            | Restriction::Compare { field, .. }
            | Restriction::Range { field, .. }
            | Restriction::Set { field, .. } => Some(field),
            Restriction::Compound(_) => None,
        }
    }

    /// Every field name referenced, including field-to-field operands.
    pub fn collect_fields(&self, out: &mut Vec<String>) {
        match self {
            Restriction::Compound(compound) => {
                for restriction in &compound.restrictions {
                    restriction.collect_fields(out);
                }
            }
            Restriction::Compare { field, param, .. } => {
                out.push(field.clone());
                if let Param::Field(other) = param {
                    out.push(other.clone());
                }
            }
            Restriction::Range { field, lower, upper, .. } => {
                out.push(field.clone());
                for param in [lower, upper] {
                    if let Param::Field(other) = param {
                        out.push(other.clone());
                    }
                }
            }
            Restriction::Null { field, .. } | Restriction::Set { field, .. } => {
                out.push(field.clone())
            }
        }
    }
}

/// AND/OR of child restrictions.
#[derive(Debug, Clone, PartialEq)]
pub struct CompoundRestriction {
    pub op: LogicalOp,
    pub restrictions: Vec<Restriction>,
}

impl CompoundRestriction {
    pub fn new(op: LogicalOp) -> Self {
        Self {
            op,
            restrictions: Vec::new(),
        }
    }

    pub fn and() -> Self {
        Self::new(LogicalOp::And)
    }

    pub fn or() -> Self {
        Self::new(LogicalOp::Or)
    }

    /// Append a child. Compounds without any leaf restriction are dropped
    /// since they constrain nothing.
    pub fn add(&mut self, restriction: Restriction) {
        if !restriction.is_vacuous() {
            self.restrictions.push(restriction);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.restrictions.is_empty()
    }

    /// True when no leaf restriction is reachable from this compound.
    pub fn is_vacuous(&self) -> bool {
        self.restrictions.iter().all(Restriction::is_vacuous)
    }

    /// Children that constrain something, in insertion order.
    pub fn effective(&self) -> impl Iterator<Item = &Restriction> {
        self.restrictions.iter().filter(|r| !r.is_vacuous())
    }

    pub fn len(&self) -> usize {
        self.restrictions.len()
    }

    pub fn clear(&mut self) {
        self.restrictions.clear();
    }

    /// True when any leaf restriction applies to `field`.
    pub fn is_restricted_field(&self, field: &str) -> bool {
        self.restrictions.iter().any(|r| match r {
            Restriction::Compound(inner) => inner.is_restricted_field(field),
            other => other.field() == Some(field),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vacuous_compounds_are_not_added() {
        let mut root = CompoundRestriction::and();
        root.add(Restriction::compare(CompareOp::Equals, "name", "x"));
        let mut nested = CompoundRestriction::or();
        nested.restrictions.push(Restriction::Compound(CompoundRestriction::and()));
        root.add(Restriction::Compound(nested));
        root.add(Restriction::Compound(CompoundRestriction::or()));
        assert_eq!(root.len(), 1);

        let mut direct = CompoundRestriction::or();
        direct.restrictions.push(Restriction::Compound(CompoundRestriction::and()));
        direct.restrictions.push(Restriction::null(NullOp::IsNull, "name"));
        assert!(!direct.is_vacuous());
        assert_eq!(direct.effective().count(), 1);
    }

    #[test]
    fn test_empty_set_restriction_is_rejected() {
        let err = Restriction::set(SetOp::Amongst, "id", Vec::<i64>::new()).unwrap_err();
        assert!(err.is_code(ErrorCode::EmptyMultiValueRestriction));
    }

    #[test]
    fn test_restriction_type_mapping() {
        let r = Restriction::compare(CompareOp::ILike, "name", "ad");
        assert_eq!(r.restriction_type(), RestrictionType::ILike);
        assert_eq!(r.field(), Some("name"));

        let mut compound = CompoundRestriction::or();
        compound.add(r);
        let compound = Restriction::Compound(compound);
        assert_eq!(compound.restriction_type(), RestrictionType::Or);
        assert!(compound.restriction_type().is_compound());
    }

    #[test]
    fn test_restricted_field_lookup_descends_into_compounds() {
        let mut inner = CompoundRestriction::or();
        inner.add(Restriction::null(NullOp::IsNull, "deletedOn"));
        let mut root = CompoundRestriction::and();
        root.add(Restriction::compare(CompareOp::Equals, "status", "OPEN"));
        root.add(Restriction::Compound(inner));

        assert!(root.is_restricted_field("deletedOn"));
        assert!(!root.is_restricted_field("name"));
    }

    #[test]
    fn test_collect_fields_includes_field_operands() {
        let r = Restriction::range_field(RangeOp::Between, "age", "minAge", "maxAge");
        let mut fields = Vec::new();
        r.collect_fields(&mut fields);
        assert_eq!(fields, vec!["age", "minAge", "maxAge"]);
    }
}
