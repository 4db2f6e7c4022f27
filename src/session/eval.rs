use crate::core::{DbError, Record, Result, Value};
use crate::criteria::{
    CompareOp, CompoundRestriction, LogicalOp, NullOp, Param, RangeOp, Restriction, SetOp,
};
use crate::entity::EntityInfo;
use lru::LruCache;
use regex::Regex;
use std::cmp::Ordering;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

lazy_static::lazy_static! {
    static ref LIKE_REGEX_CACHE: Mutex<LruCache<String, Arc<Regex>>> =
        Mutex::new(LruCache::new(NonZeroUsize::new(256).unwrap_or(NonZeroUsize::MIN)));
}

/// Translate a SQL LIKE pattern into an anchored regex.
fn like_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    regex.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    regex
}

fn cached_like_regex(pattern: &str) -> Result<Arc<Regex>> {
    let mut cache = LIKE_REGEX_CACHE.lock()?;
    if let Some(regex) = cache.get(pattern) {
        return Ok(Arc::clone(regex));
    }
    let regex = Regex::new(&like_to_regex(pattern))
        .map(Arc::new)
        .map_err(|e| DbError::InvalidArgument(format!("Invalid LIKE pattern '{}': {}", pattern, e)))?;
    cache.put(pattern.to_string(), Arc::clone(&regex));
    Ok(regex)
}

/// SQL LIKE match.
pub fn like_match(text: &str, pattern: &str) -> Result<bool> {
    if !pattern.contains(['%', '_', '\\']) {
        return Ok(text == pattern);
    }
    Ok(cached_like_regex(pattern)?.is_match(text))
}

/// Evaluates restrictions against stored records. Stored records hold
/// forward-transformed values, so literal operands are forward-transformed
/// the same way before comparison.
pub struct Evaluator<'a> {
    info: &'a EntityInfo,
}

impl<'a> Evaluator<'a> {
    pub fn new(info: &'a EntityInfo) -> Self {
        Self { info }
    }

    pub fn matches_criteria(&self, record: &Record, criteria: &CompoundRestriction) -> Result<bool> {
        self.matches_compound(record, criteria)
    }

    pub fn matches(&self, record: &Record, restriction: &Restriction) -> Result<bool> {
        match restriction {
            Restriction::Null { op, field } => {
                let is_null = record.get(field).is_null();
                Ok(match op {
                    NullOp::IsNull => is_null,
                    NullOp::IsNotNull => !is_null,
                })
            }
            Restriction::Compare { op, field, param } => {
                let left = record.get(field);
                let right = self.operand(record, field, param)?;
                self.compare(*op, left, &right)
            }
            Restriction::Range {
                op,
                field,
                lower,
                upper,
            } => {
                let value = record.get(field);
                let lower = self.operand(record, field, lower)?;
                let upper = self.operand(record, field, upper)?;
                if value.is_null() || lower.is_null() || upper.is_null() {
                    return Ok(false);
                }
                let within = value.compare(&lower)? != Ordering::Less
                    && value.compare(&upper)? != Ordering::Greater;
                Ok(match op {
                    RangeOp::Between => within,
                    RangeOp::NotBetween => !within,
                })
            }
            Restriction::Set { op, field, values } => {
                let value = record.get(field);
                if value.is_null() {
                    return Ok(false);
                }
                let mut found = false;
                for candidate in values {
                    if *value == self.forward(field, candidate)? {
                        found = true;
                        break;
                    }
                }
                Ok(match op {
                    SetOp::Amongst => found,
                    SetOp::NotAmongst => !found,
                })
            }
            Restriction::Compound(compound) => self.matches_compound(record, compound),
        }
    }

    fn matches_compound(&self, record: &Record, compound: &CompoundRestriction) -> Result<bool> {
        match compound.op {
            LogicalOp::And => {
                for restriction in compound.effective() {
                    if !self.matches(record, restriction)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            LogicalOp::Or => {
                if compound.is_vacuous() {
                    return Ok(true);
                }
                for restriction in compound.effective() {
                    if self.matches(record, restriction)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn forward(&self, field: &str, value: &Value) -> Result<Value> {
        match self.info.field(field) {
            Some(info) => info.forward(value),
            None => Ok(value.clone()),
        }
    }

    fn operand(&self, record: &Record, field: &str, param: &Param) -> Result<Value> {
        match param {
            Param::Value(value) => self.forward(field, value),
            Param::Field(other) => Ok(record.get(other).clone()),
        }
    }

    fn compare(&self, op: CompareOp, left: &Value, right: &Value) -> Result<bool> {
        if left.is_null() || right.is_null() {
            return Ok(false);
        }
        let (left, right) = if op.is_case_insensitive() {
            (left.to_lowercase(), right.to_lowercase())
        } else {
            (left.clone(), right.clone())
        };

        let like = |prefix: &str, suffix: &str| -> Result<bool> {
            match (&left, &right) {
                (Value::Text(text), Value::Text(pattern)) => {
                    like_match(text, &format!("{}{}{}", prefix, pattern, suffix))
                }
                _ => Err(DbError::TypeMismatch(format!(
                    "LIKE requires text operands, got {} and {}",
                    left.type_name(),
                    right.type_name()
                ))),
            }
        };

        match op {
            CompareOp::Equals | CompareOp::IEquals => Ok(left == right),
            CompareOp::NotEquals | CompareOp::INotEquals => Ok(left != right),
            CompareOp::LessThan => Ok(left.compare(&right)? == Ordering::Less),
            CompareOp::LessOrEqual => Ok(left.compare(&right)? != Ordering::Greater),
            CompareOp::GreaterThan => Ok(left.compare(&right)? == Ordering::Greater),
            CompareOp::GreaterOrEqual => Ok(left.compare(&right)? != Ordering::Less),
            CompareOp::Like | CompareOp::ILike => like("%", "%"),
            CompareOp::NotLike => like("%", "%").map(|m| !m),
            CompareOp::BeginsWith | CompareOp::IBeginsWith => like("", "%"),
            CompareOp::NotBeginWith => like("", "%").map(|m| !m),
            CompareOp::EndsWith | CompareOp::IEndsWith => like("%", ""),
            CompareOp::NotEndWith => like("%", "").map(|m| !m),
        }
    }
}
