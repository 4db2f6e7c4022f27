use crate::core::Value;

/// Ordered field assignments for `update_fields_by_id` and `update_all`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    assignments: Vec<(String, Value)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `value` to `field`, replacing an earlier assignment.
    pub fn add(mut self, field: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        match self.assignments.iter_mut().find(|(f, _)| f == field) {
            Some(entry) => entry.1 = value,
            None => self.assignments.push((field.to_string(), value)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.assignments.iter().map(|(f, v)| (f.as_str(), v))
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.assignments
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v)
    }
}
