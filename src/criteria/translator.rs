use super::{Param, Restriction};
use crate::core::Value;

/// Supplies display labels and value renderings for the translator.
pub trait RestrictionTranslatorMapper {
    fn label(&self, field: &str) -> Option<String>;

    fn value(&self, _field: &str, _value: &Value) -> Option<String> {
        None
    }
}

/// Renders restrictions as human-readable text, e.g.
/// `$f{status} == 'OPEN' and ($f{age} < 18 or $f{age} > 65)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RestrictionTranslator;

impl RestrictionTranslator {
    pub fn new() -> Self {
        Self
    }

    pub fn translate(&self, restriction: Option<&Restriction>) -> String {
        self.translate_with(restriction, None)
    }

    pub fn translate_with(
        &self,
        restriction: Option<&Restriction>,
        mapper: Option<&dyn RestrictionTranslatorMapper>,
    ) -> String {
        match restriction {
            None => "fetch all".to_string(),
            Some(restriction) => {
                let mut sb = String::new();
                self.write(&mut sb, restriction, mapper, 0);
                sb
            }
        }
    }

    fn write(
        &self,
        sb: &mut String,
        restriction: &Restriction,
        mapper: Option<&dyn RestrictionTranslatorMapper>,
        depth: usize,
    ) {
        let symbol = restriction.restriction_type().symbol();
        match restriction {
            Restriction::Null { field, .. } => {
                write_field(sb, field, mapper);
                sb.push(' ');
                sb.push_str(symbol);
            }
            Restriction::Compare { field, param, .. } => {
                write_field(sb, field, mapper);
                sb.push(' ');
                sb.push_str(symbol);
                sb.push(' ');
                write_param(sb, field, param, mapper);
            }
            Restriction::Range { field, lower, upper, .. } => {
                write_field(sb, field, mapper);
                sb.push(' ');
                sb.push_str(symbol);
                sb.push_str(" (");
                write_param(sb, field, lower, mapper);
                sb.push_str(", ");
                write_param(sb, field, upper, mapper);
                sb.push(')');
            }
            Restriction::Set { field, values, .. } => {
                write_field(sb, field, mapper);
                sb.push(' ');
                sb.push_str(symbol);
                sb.push_str(" (");
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        sb.push_str(", ");
                    }
                    write_value(sb, field, value, mapper);
                }
                sb.push(')');
            }
            Restriction::Compound(compound) if compound.is_vacuous() => {}
            Restriction::Compound(compound) => {
                let sub = depth > 0;
                if sub {
                    sb.push('(');
                }
                for (i, child) in compound.effective().enumerate() {
                    if i > 0 {
                        sb.push(' ');
                        sb.push_str(symbol);
                        sb.push(' ');
                    }
                    self.write(sb, child, mapper, depth + 1);
                }
                if sub {
                    sb.push(')');
                }
            }
        }
    }
}

fn write_field(sb: &mut String, field: &str, mapper: Option<&dyn RestrictionTranslatorMapper>) {
    match mapper.and_then(|m| m.label(field)).filter(|l| !l.trim().is_empty()) {
        Some(label) => sb.push_str(&label),
        None => {
            sb.push_str("$f{");
            sb.push_str(field);
            sb.push('}');
        }
    }
}

fn write_param(
    sb: &mut String,
    field: &str,
    param: &Param,
    mapper: Option<&dyn RestrictionTranslatorMapper>,
) {
    match param {
        Param::Field(other) => write_field(sb, other, mapper),
        Param::Value(value) => write_value(sb, field, value, mapper),
    }
}

fn write_value(
    sb: &mut String,
    field: &str,
    value: &Value,
    mapper: Option<&dyn RestrictionTranslatorMapper>,
) {
    if let Some(mapped) = mapper.and_then(|m| m.value(field, value)) {
        sb.push_str(&mapped);
        return;
    }
    match value {
        Value::Text(s) => {
            sb.push('\'');
            sb.push_str(s);
            sb.push('\'');
        }
        other => sb.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::CriteriaBuilder;

    struct Labels;

    impl RestrictionTranslatorMapper for Labels {
        fn label(&self, field: &str) -> Option<String> {
            (field == "age").then(|| "Age".to_string())
        }
    }

    #[test]
    fn test_translate_nested_criteria() {
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

        let text = RestrictionTranslator::new().translate(Some(&criteria));
        assert_eq!(
            text,
            "$f{status} == 'OPEN' and ($f{age} < 18 or $f{age} > 65)"
        );
    }

    #[test]
    fn test_translate_with_labels() {
        let criteria = CriteriaBuilder::new()
            .begin_and()
            .unwrap()
            .add_between("age", 20, 30)
            .unwrap()
            .end_compound()
            .unwrap()
            .build()
            .unwrap();
        let text = RestrictionTranslator::new().translate_with(Some(&criteria), Some(&Labels));
        assert_eq!(text, "Age between (20, 30)");
    }

    #[test]
    fn test_translate_none_is_fetch_all() {
        assert_eq!(RestrictionTranslator::new().translate(None), "fetch all");
    }
}
