use super::{DialectPolicies, SqlDialect};

/// Reference dialect using ANSI `OFFSET ... FETCH` pagination.
#[derive(Debug, Clone, Default)]
pub struct AnsiDialect {
    policies: DialectPolicies,
}

impl AnsiDialect {
    pub fn new(policies: DialectPolicies) -> Self {
        Self { policies }
    }
}

impl SqlDialect for AnsiDialect {
    fn name(&self) -> &str {
        "ansi"
    }

    fn policies(&self) -> &DialectPolicies {
        &self.policies
    }

    fn pagination_clause(&self, offset: i32, limit: i32) -> String {
        let mut clause = String::new();
        if offset > 0 {
            clause.push_str(&format!("OFFSET {} ROWS", offset));
        }
        if limit > 0 {
            if !clause.is_empty() {
                clause.push(' ');
            }
            clause.push_str(&format!("FETCH NEXT {} ROWS ONLY", limit));
        }
        clause
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Record, Value};
    use crate::criteria::{Restriction, RestrictionType, SetOp};
    use crate::entity::EntityInfo;
    use crate::query::{NativeQuery, OrderType, QueryDef, SqlJoinType, Update};

    fn book() -> EntityInfo {
        EntityInfo::builder("book")
            .field("title")
            .field("authorId")
            .versioned("versionNo")
            .build()
    }

    fn dialect(max_clause_values: usize) -> AnsiDialect {
        AnsiDialect::new(DialectPolicies {
            max_clause_values,
            all_upper_case: false,
        })
    }

    #[test]
    fn test_amongst_is_chunked_by_max_clause_values() {
        let info = book();
        let ids: Vec<i64> = (1..=7).collect();
        let restriction = Restriction::set(SetOp::Amongst, "id", ids).unwrap();

        let stmt = dialect(3).prepare_criteria(&info, &restriction, false).unwrap();
        assert_eq!(
            stmt.sql,
            "(ID IN (?, ?, ?) OR ID IN (?, ?, ?) OR ID IN (?))"
        );
        assert_eq!(stmt.params.len(), 7);
        assert_eq!(stmt.sql.matches(" IN (").count(), 3);
    }

    #[test]
    fn test_not_amongst_chunks_join_with_and() {
        let info = book();
        let restriction = Restriction::set(SetOp::NotAmongst, "id", vec![1, 2, 3]).unwrap();
        let sql = dialect(2).translate_criteria(&info, &restriction, false).unwrap();
        assert_eq!(sql, "(ID NOT IN (1, 2) AND ID NOT IN (3))");
    }

    #[test]
    fn test_large_amongst_chunk_sizes_sum_to_total() {
        let info = book();
        let ids: Vec<i64> = (0..2500).collect();
        let restriction = Restriction::set(SetOp::Amongst, "id", ids).unwrap();
        let stmt = dialect(1000).prepare_criteria(&info, &restriction, false).unwrap();

        let chunks: Vec<usize> = stmt
            .sql
            .split(" OR ")
            .map(|chunk| chunk.matches('?').count())
            .collect();
        assert_eq!(chunks, vec![1000, 1000, 500]);
        assert_eq!(chunks.iter().sum::<usize>(), stmt.params.len());
    }

    #[test]
    fn test_prepare_find_with_order_and_pagination() {
        let info = book();
        let mut query = QueryDef::new("book");
        query.add_restriction(Restriction::compare(
            crate::criteria::CompareOp::Equals,
            "authorId",
            4,
        ));
        query.add_order("title", OrderType::Descending);
        query.set_offset(10);
        query.set_limit(5);

        let stmt = dialect(1000).prepare_find(&info, &query, false).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT ID, TITLE, AUTHOR_ID, VERSION_NO FROM BOOK WHERE AUTHOR_ID = ? \
             ORDER BY TITLE DESC OFFSET 10 ROWS FETCH NEXT 5 ROWS ONLY"
        );
        assert_eq!(stmt.params, vec![Value::Integer(4)]);
    }

    #[test]
    fn test_prepare_find_ignores_empty_compound() {
        let info = book();
        let mut query = QueryDef::new("book");
        query.add_restriction(Restriction::compare(
            crate::criteria::CompareOp::Equals,
            "title",
            "x",
        ));
        query.add_restriction(Restriction::Compound(crate::criteria::CompoundRestriction::or()));

        let stmt = dialect(1000).prepare_find(&info, &query, false).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT ID, TITLE, AUTHOR_ID, VERSION_NO FROM BOOK WHERE TITLE = ?"
        );

        let mut only_empty = QueryDef::new("book");
        only_empty.add_restriction(Restriction::Compound(crate::criteria::CompoundRestriction::and()));
        assert!(only_empty.is_empty_criteria());
    }

    #[test]
    fn test_update_by_id_with_version_check() {
        let info = book();
        let record = Record::new("book")
            .with("id", 9)
            .with("title", "Emma")
            .with("authorId", 2)
            .with("versionNo", 4);
        let stmt = dialect(1000)
            .prepare_update_by_id(&info, &record, Some(3))
            .unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE BOOK SET TITLE = ?, AUTHOR_ID = ?, VERSION_NO = ? WHERE ID = ? AND VERSION_NO = ?"
        );
        assert_eq!(stmt.params.last(), Some(&Value::Integer(3)));
    }

    #[test]
    fn test_update_all_binds_assignments_before_criteria() {
        let info = book();
        let mut query = QueryDef::new("book");
        query.add_restriction(Restriction::compare(
            crate::criteria::CompareOp::LessThan,
            "id",
            100,
        ));
        let update = Update::new().add("title", "Untitled");
        let stmt = dialect(1000).prepare_update_all(&info, &query, &update).unwrap();
        assert_eq!(stmt.sql, "UPDATE BOOK SET TITLE = ? WHERE ID < ?");
        assert_eq!(
            stmt.params,
            vec![Value::Text("Untitled".into()), Value::Integer(100)]
        );
    }

    #[test]
    fn test_generate_native_query() {
        let query = NativeQuery::builder()
            .schema_name("lib")
            .table_name("book")
            .add_column("book", "title")
            .add_column("author", "name")
            .add_join(SqlJoinType::Inner, "book", "author_id", "author", "id")
            .begin_compound_filter(RestrictionType::And)
            .unwrap()
            .add_simple_filter(RestrictionType::IBeginsWith, "author", "name", Some("Jo".into()), None)
            .unwrap()
            .add_simple_filter(RestrictionType::Between, "book", "pages", Some(100.into()), Some(200.into()))
            .unwrap()
            .end_compound_filter()
            .unwrap()
            .add_order(OrderType::Ascending, "book", "title")
            .limit(10)
            .build()
            .unwrap();

        let sql = AnsiDialect::new(DialectPolicies {
            max_clause_values: 1000,
            all_upper_case: true,
        })
        .generate_native_query(&query)
        .unwrap();
        assert_eq!(
            sql,
            "SELECT BOOK.TITLE, AUTHOR.NAME FROM LIB.BOOK INNER JOIN LIB.AUTHOR ON BOOK.AUTHOR_ID = AUTHOR.ID \
             WHERE (LOWER(AUTHOR.NAME) LIKE 'jo%' AND BOOK.PAGES BETWEEN 100 AND 200) \
             ORDER BY BOOK.TITLE ASC FETCH NEXT 10 ROWS ONLY"
        );
    }

    #[test]
    fn test_native_multi_value_filter_is_chunked() {
        let query = NativeQuery::builder()
            .table_name("T")
            .begin_compound_filter(RestrictionType::Or)
            .unwrap()
            .add_multi_value_filter(
                RestrictionType::Amongst,
                "T",
                "ID",
                vec![1.into(), 2.into(), 3.into()],
            )
            .unwrap()
            .end_compound_filter()
            .unwrap()
            .build()
            .unwrap();
        let sql = dialect(2).generate_native_query(&query).unwrap();
        assert_eq!(sql, "SELECT * FROM T WHERE (T.ID IN (1, 2) OR T.ID IN (3))");
    }
}
