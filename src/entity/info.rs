use super::policy::{EntityPolicy, VersionedEntityPolicy};
use crate::core::{ID_FIELD, Result, Value};
use std::fmt;
use std::sync::Arc;

/// Converts field values between their in-memory and stored forms
/// (encryption, encoding and the like).
pub trait FieldTransformer: Send + Sync {
    fn forward(&self, value: &Value) -> Result<Value>;

    fn reverse(&self, value: &Value) -> Result<Value>;
}

#[derive(Clone)]
pub struct FieldInfo {
    pub name: String,
    pub column: String,
    pub transformer: Option<Arc<dyn FieldTransformer>>,
}

impl FieldInfo {
    pub fn is_transformed(&self) -> bool {
        self.transformer.is_some()
    }

    /// Apply the forward transformation, if any.
    pub fn forward(&self, value: &Value) -> Result<Value> {
        match &self.transformer {
            Some(transformer) if !value.is_null() => transformer.forward(value),
            _ => Ok(value.clone()),
        }
    }

    pub fn reverse(&self, value: &Value) -> Result<Value> {
        match &self.transformer {
            Some(transformer) if !value.is_null() => transformer.reverse(value),
            _ => Ok(value.clone()),
        }
    }
}

impl fmt::Debug for FieldInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldInfo")
            .field("name", &self.name)
            .field("column", &self.column)
            .field("transformed", &self.is_transformed())
            .finish()
    }
}

/// A field that only exists in the list view of an entity. Its value is
/// `property` of the `foreign_entity` record whose id equals `key`.
#[derive(Debug, Clone)]
pub struct ListOnlyInfo {
    pub name: String,
    pub column: String,
    pub key: String,
    pub foreign_entity: String,
    pub property: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Editable,
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildCardinality {
    Single,
    Many,
}

/// Parent-to-child association. Child rows point back to the parent through
/// `fk_field`.
#[derive(Debug, Clone)]
pub struct ChildInfo {
    pub name: String,
    pub child_entity: String,
    pub fk_field: String,
    pub kind: ChildKind,
    pub cardinality: ChildCardinality,
}

pub struct EntityInfo {
    name: String,
    table: String,
    view: String,
    version_field: Option<String>,
    fields: Vec<FieldInfo>,
    list_only: Vec<ListOnlyInfo>,
    children: Vec<ChildInfo>,
    unique_constraints: Vec<Vec<String>>,
    policy: Option<Arc<dyn EntityPolicy>>,
}

impl EntityInfo {
    pub fn builder(name: &str) -> EntityInfoBuilder {
        EntityInfoBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn list_only(&self) -> &[ListOnlyInfo] {
        &self.list_only
    }

    pub fn is_list_only(&self, name: &str) -> bool {
        self.list_only.iter().any(|lo| lo.name == name)
    }

    pub fn is_versioned(&self) -> bool {
        self.version_field.is_some()
    }

    pub fn version_field(&self) -> Option<&str> {
        self.version_field.as_deref()
    }

    pub fn children(&self) -> &[ChildInfo] {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&ChildInfo> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn unique_constraints(&self) -> &[Vec<String>] {
        &self.unique_constraints
    }

    pub fn policy(&self) -> Option<&Arc<dyn EntityPolicy>> {
        self.policy.as_ref()
    }

    /// Column for `field`. List-only fields resolve only when `view` is set.
    pub fn column(&self, field: &str, view: bool) -> Option<&str> {
        if let Some(info) = self.field(field) {
            return Some(&info.column);
        }
        if view {
            return self
                .list_only
                .iter()
                .find(|lo| lo.name == field)
                .map(|lo| lo.column.as_str());
        }
        None
    }

    /// Ordered field-to-column mapping for the table, or for the view when
    /// `view` is set.
    pub fn field_to_column_map(&self, view: bool) -> Vec<(String, String)> {
        let mut map: Vec<(String, String)> = self
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.column.clone()))
            .collect();
        if view {
            map.extend(
                self.list_only
                    .iter()
                    .map(|lo| (lo.name.clone(), lo.column.clone())),
            );
        }
        map
    }
}

impl fmt::Debug for EntityInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityInfo")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("view", &self.view)
            .field("version_field", &self.version_field)
            .field("fields", &self.fields)
            .field("children", &self.children)
            .finish()
    }
}

fn default_column(field: &str) -> String {
    let mut column = String::with_capacity(field.len() + 4);
    for (i, ch) in field.chars().enumerate() {
        if ch.is_uppercase() && i > 0 {
            column.push('_');
        }
        column.push(ch.to_ascii_uppercase());
    }
    column
}

pub struct EntityInfoBuilder {
    name: String,
    table: Option<String>,
    view: Option<String>,
    version_field: Option<String>,
    fields: Vec<FieldInfo>,
    list_only: Vec<ListOnlyInfo>,
    children: Vec<ChildInfo>,
    unique_constraints: Vec<Vec<String>>,
    policy: Option<Arc<dyn EntityPolicy>>,
}

impl EntityInfoBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            table: None,
            view: None,
            version_field: None,
            fields: vec![FieldInfo {
                name: ID_FIELD.to_string(),
                column: default_column(ID_FIELD),
                transformer: None,
            }],
            list_only: Vec::new(),
            children: Vec::new(),
            unique_constraints: Vec::new(),
            policy: None,
        }
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn view(mut self, view: &str) -> Self {
        self.view = Some(view.to_string());
        self
    }

    /// Add a field mapped to its default column (upper snake case).
    pub fn field(self, name: &str) -> Self {
        let column = default_column(name);
        self.column_field(name, &column)
    }

    pub fn column_field(mut self, name: &str, column: &str) -> Self {
        self.fields.push(FieldInfo {
            name: name.to_string(),
            column: column.to_string(),
            transformer: None,
        });
        self
    }

    pub fn transformed_field(mut self, name: &str, transformer: Arc<dyn FieldTransformer>) -> Self {
        self.fields.push(FieldInfo {
            name: name.to_string(),
            column: default_column(name),
            transformer: Some(transformer),
        });
        self
    }

    /// Mark the entity as versioned. Unless a policy is set explicitly the
    /// entity gets a `VersionedEntityPolicy` on `version_field`.
    pub fn versioned(mut self, version_field: &str) -> Self {
        self.version_field = Some(version_field.to_string());
        self.field(version_field)
    }

    pub fn list_only(mut self, name: &str, key: &str, foreign_entity: &str, property: &str) -> Self {
        self.list_only.push(ListOnlyInfo {
            name: name.to_string(),
            column: default_column(name),
            key: key.to_string(),
            foreign_entity: foreign_entity.to_string(),
            property: property.to_string(),
        });
        self
    }

    pub fn child(mut self, name: &str, child_entity: &str, fk_field: &str, kind: ChildKind) -> Self {
        self.children.push(ChildInfo {
            name: name.to_string(),
            child_entity: child_entity.to_string(),
            fk_field: fk_field.to_string(),
            kind,
            cardinality: ChildCardinality::Single,
        });
        self
    }

    pub fn child_list(mut self, name: &str, child_entity: &str, fk_field: &str, kind: ChildKind) -> Self {
        self.children.push(ChildInfo {
            name: name.to_string(),
            child_entity: child_entity.to_string(),
            fk_field: fk_field.to_string(),
            kind,
            cardinality: ChildCardinality::Many,
        });
        self
    }

    pub fn unique_constraint(mut self, fields: &[&str]) -> Self {
        self.unique_constraints
            .push(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn policy(mut self, policy: Arc<dyn EntityPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> EntityInfo {
        let table = self.table.unwrap_or_else(|| default_column(&self.name));
        let view = self.view.unwrap_or_else(|| format!("V_{}", table));
        let policy = match (self.policy, &self.version_field) {
            (Some(policy), _) => Some(policy),
            (None, Some(version_field)) => {
                Some(Arc::new(VersionedEntityPolicy::new(version_field)) as Arc<dyn EntityPolicy>)
            }
            (None, None) => None,
        };

        EntityInfo {
            name: self.name,
            table,
            view,
            version_field: self.version_field,
            fields: self.fields,
            list_only: self.list_only,
            children: self.children,
            unique_constraints: self.unique_constraints,
            policy,
        }
    }
}
