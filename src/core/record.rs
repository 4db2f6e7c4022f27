use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use super::Value;

/// Name of the primary key field every entity carries.
pub const ID_FIELD: &str = "id";

/// Child association held by a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChildSlot {
    Single(Option<Box<Record>>),
    List(Vec<Record>),
}

impl ChildSlot {
    pub fn records(&self) -> Vec<&Record> {
        match self {
            ChildSlot::Single(Some(child)) => vec![child.as_ref()],
            ChildSlot::Single(None) => Vec::new(),
            ChildSlot::List(list) => list.iter().collect(),
        }
    }
}

/// Untyped entity row exchanged between the `Database` facade and sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    entity: String,
    fields: BTreeMap<String, Value>,
    children: BTreeMap<String, ChildSlot>,
}

impl Record {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            fields: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn id(&self) -> Option<i64> {
        self.fields.get(ID_FIELD).and_then(Value::as_i64)
    }

    pub fn set_id(&mut self, id: i64) {
        self.fields.insert(ID_FIELD.to_string(), Value::Integer(id));
    }

    pub fn get(&self, field: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.fields.get(field).unwrap_or(&NULL)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Builder-style `set`.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn child(&self, name: &str) -> Option<&ChildSlot> {
        self.children.get(name)
    }

    pub fn set_child(&mut self, name: impl Into<String>, child: Option<Record>) {
        self.children
            .insert(name.into(), ChildSlot::Single(child.map(Box::new)));
    }

    pub fn set_child_list(&mut self, name: impl Into<String>, list: Vec<Record>) {
        self.children.insert(name.into(), ChildSlot::List(list));
    }

    pub fn with_child_list(mut self, name: impl Into<String>, list: Vec<Record>) -> Self {
        self.set_child_list(name, list);
        self
    }

    pub fn children(&self) -> &BTreeMap<String, ChildSlot> {
        &self.children
    }

    pub fn clear_children(&mut self) {
        self.children.clear();
    }

    /// Copy of this record with only scalar fields.
    pub fn without_children(&self) -> Record {
        Record {
            entity: self.entity.clone(),
            fields: self.fields.clone(),
            children: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_reads_as_null() {
        let record = Record::new("author").with("name", "Ada");
        assert_eq!(record.get("name"), &Value::Text("Ada".into()));
        assert!(record.get("age").is_null());
        assert_eq!(record.id(), None);
    }

    #[test]
    fn test_child_slot_records() {
        let mut record = Record::new("book");
        record.set_child("cover", Some(Record::new("cover")));
        record.set_child_list("pages", vec![Record::new("page"), Record::new("page")]);
        assert_eq!(record.child("cover").unwrap().records().len(), 1);
        assert_eq!(record.child("pages").unwrap().records().len(), 2);
        assert!(record.without_children().children().is_empty());
    }
}
