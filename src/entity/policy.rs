use crate::core::{Record, Result, Value};
use crate::query::QueryDef;
use chrono::NaiveDateTime;

/// Per-entity hooks invoked by sessions around mutations and queries.
///
/// `now` is the session's current time when `is_set_now` returns true and
/// `None` otherwise.
pub trait EntityPolicy: Send + Sync {
    /// Called before a record is inserted. May return the id to use.
    fn pre_create(&self, _record: &mut Record, _now: Option<NaiveDateTime>) -> Result<Option<i64>> {
        Ok(None)
    }

    fn pre_update(&self, _record: &mut Record, _now: Option<NaiveDateTime>) -> Result<()> {
        Ok(())
    }

    fn pre_delete(&self, _record: &mut Record, _now: Option<NaiveDateTime>) -> Result<()> {
        Ok(())
    }

    fn pre_query(&self, _query: &mut QueryDef) -> Result<()> {
        Ok(())
    }

    fn on_create_error(&self, _record: &mut Record) {}

    fn on_update_error(&self, _record: &mut Record) {}

    fn on_delete_error(&self, _record: &mut Record) {}

    fn is_set_now(&self) -> bool {
        false
    }
}

/// Maintains an optimistic-locking version number: starts at 1 on create and
/// increments on every update. A failed update restores the previous number.
pub struct VersionedEntityPolicy {
    version_field: String,
}

impl VersionedEntityPolicy {
    pub fn new(version_field: &str) -> Self {
        Self {
            version_field: version_field.to_string(),
        }
    }
}

impl EntityPolicy for VersionedEntityPolicy {
    fn pre_create(&self, record: &mut Record, _now: Option<NaiveDateTime>) -> Result<Option<i64>> {
        record.set(self.version_field.clone(), Value::Integer(1));
        Ok(None)
    }

    fn pre_update(&self, record: &mut Record, _now: Option<NaiveDateTime>) -> Result<()> {
        let current = record.get(&self.version_field).as_i64().unwrap_or(0);
        record.set(self.version_field.clone(), Value::Integer(current + 1));
        Ok(())
    }

    fn on_update_error(&self, record: &mut Record) {
        if let Some(current) = record.get(&self.version_field).as_i64() {
            record.set(self.version_field.clone(), Value::Integer(current - 1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioned_policy_lifecycle() {
        let policy = VersionedEntityPolicy::new("versionNo");
        let mut record = Record::new("account");

        policy.pre_create(&mut record, None).unwrap();
        assert_eq!(record.get("versionNo"), &Value::Integer(1));

        policy.pre_update(&mut record, None).unwrap();
        assert_eq!(record.get("versionNo"), &Value::Integer(2));

        policy.on_update_error(&mut record);
        assert_eq!(record.get("versionNo"), &Value::Integer(1));
    }
}
