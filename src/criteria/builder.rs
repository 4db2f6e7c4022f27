use super::{CompareOp, CompoundRestriction, LogicalOp, NullOp, RangeOp, Restriction, SetOp};
use crate::core::{DbError, Result, Value};

/// Builds nested criteria with explicit `begin_and`/`begin_or` and
/// `end_compound` brackets.
///
/// ```
/// use unifydb::criteria::CriteriaBuilder;
///
/// # fn main() -> unifydb::Result<()> {
/// let criteria = CriteriaBuilder::new()
///     .begin_or()?
///     .add_equals("status", "OPEN")?
///     .add_is_null("closedOn")?
///     .end_compound()?
///     .build()?;
/// assert!(criteria.restriction_type().is_compound());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct CriteriaBuilder {
    stack: Vec<CompoundRestriction>,
    root: Option<CompoundRestriction>,
}

impl CriteriaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_and(self) -> Result<Self> {
        self.begin_compound(LogicalOp::And)
    }

    pub fn begin_or(self) -> Result<Self> {
        self.begin_compound(LogicalOp::Or)
    }

    fn begin_compound(mut self, op: LogicalOp) -> Result<Self> {
        if self.stack.is_empty() && self.root.is_some() {
            return Err(DbError::InvalidState(
                "Criteria already has a root compound restriction".into(),
            ));
        }
        self.stack.push(CompoundRestriction::new(op));
        Ok(self)
    }

    pub fn end_compound(mut self) -> Result<Self> {
        let compound = self
            .stack
            .pop()
            .ok_or_else(|| DbError::InvalidState("Compound restriction is not started".into()))?;
        if compound.is_empty() {
            return Err(DbError::InvalidState(
                "Compound restriction must have at least one sub-restriction".into(),
            ));
        }

        match self.stack.last_mut() {
            Some(parent) => parent.add(Restriction::Compound(compound)),
            None => self.root = Some(compound),
        }
        Ok(self)
    }

    pub fn add_restriction(mut self, restriction: Restriction) -> Result<Self> {
        let current = self.stack.last_mut().ok_or_else(|| {
            DbError::InvalidState("No compound restriction context is open".into())
        })?;
        current.add(restriction);
        Ok(self)
    }

    pub fn add_compare(self, op: CompareOp, field: &str, value: impl Into<Value>) -> Result<Self> {
        self.add_restriction(Restriction::compare(op, field, value))
    }

    pub fn add_compare_field(self, op: CompareOp, field: &str, other_field: &str) -> Result<Self> {
        self.add_restriction(Restriction::compare_field(op, field, other_field))
    }

    pub fn add_equals(self, field: &str, value: impl Into<Value>) -> Result<Self> {
        self.add_compare(CompareOp::Equals, field, value)
    }

    pub fn add_not_equals(self, field: &str, value: impl Into<Value>) -> Result<Self> {
        self.add_compare(CompareOp::NotEquals, field, value)
    }

    pub fn add_less_than(self, field: &str, value: impl Into<Value>) -> Result<Self> {
        self.add_compare(CompareOp::LessThan, field, value)
    }

    pub fn add_greater_than(self, field: &str, value: impl Into<Value>) -> Result<Self> {
        self.add_compare(CompareOp::GreaterThan, field, value)
    }

    pub fn add_like(self, field: &str, value: &str) -> Result<Self> {
        self.add_compare(CompareOp::Like, field, value)
    }

    pub fn add_ilike(self, field: &str, value: &str) -> Result<Self> {
        self.add_compare(CompareOp::ILike, field, value)
    }

    pub fn add_begins_with(self, field: &str, value: &str) -> Result<Self> {
        self.add_compare(CompareOp::BeginsWith, field, value)
    }

    pub fn add_ends_with(self, field: &str, value: &str) -> Result<Self> {
        self.add_compare(CompareOp::EndsWith, field, value)
    }

    pub fn add_between(
        self,
        field: &str,
        lower: impl Into<Value>,
        upper: impl Into<Value>,
    ) -> Result<Self> {
        self.add_restriction(Restriction::range(RangeOp::Between, field, lower, upper))
    }

    pub fn add_not_between(
        self,
        field: &str,
        lower: impl Into<Value>,
        upper: impl Into<Value>,
    ) -> Result<Self> {
        self.add_restriction(Restriction::range(RangeOp::NotBetween, field, lower, upper))
    }

    pub fn add_amongst<I, V>(self, field: &str, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let restriction = Restriction::set(SetOp::Amongst, field, values)?;
        self.add_restriction(restriction)
    }

    pub fn add_not_amongst<I, V>(self, field: &str, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let restriction = Restriction::set(SetOp::NotAmongst, field, values)?;
        self.add_restriction(restriction)
    }

    pub fn add_is_null(self, field: &str) -> Result<Self> {
        self.add_restriction(Restriction::null(NullOp::IsNull, field))
    }

    pub fn add_is_not_null(self, field: &str) -> Result<Self> {
        self.add_restriction(Restriction::null(NullOp::IsNotNull, field))
    }

    /// Finish building. Every `begin_*` must have been closed.
    pub fn build(self) -> Result<Restriction> {
        if !self.stack.is_empty() {
            return Err(DbError::InvalidState(format!(
                "{} compound restriction(s) still open",
                self.stack.len()
            )));
        }
        self.root
            .map(Restriction::Compound)
            .ok_or_else(|| DbError::InvalidState("Criteria has no root compound restriction".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::RestrictionType;

    #[test]
    fn test_nested_compound_build() {
        let criteria = CriteriaBuilder::new()
            .begin_and()
            .unwrap()
            .add_equals("status", "OPEN")
            .unwrap()
            .begin_or()
            .unwrap()
            .add_less_than("age", 18)
            .unwrap()
            .add_greater_than("age", 65)
            .unwrap()
            .end_compound()
            .unwrap()
            .end_compound()
            .unwrap()
            .build()
            .unwrap();

        match criteria {
            Restriction::Compound(root) => {
                assert_eq!(root.op, LogicalOp::And);
                assert_eq!(root.len(), 2);
                assert_eq!(root.restrictions[1].restriction_type(), RestrictionType::Or);
            }
            other => panic!("unexpected restriction {:?}", other),
        }
    }

    #[test]
    fn test_end_without_begin_fails() {
        assert!(CriteriaBuilder::new().end_compound().is_err());
    }

    #[test]
    fn test_empty_compound_fails() {
        let result = CriteriaBuilder::new().begin_and().unwrap().end_compound();
        assert!(result.is_err());
    }

    #[test]
    fn test_add_without_context_fails() {
        assert!(CriteriaBuilder::new().add_equals("id", 1).is_err());
    }

    #[test]
    fn test_build_with_open_compound_fails() {
        let builder = CriteriaBuilder::new()
            .begin_and()
            .unwrap()
            .add_is_null("name")
            .unwrap();
        assert!(builder.build().is_err());
    }
}
