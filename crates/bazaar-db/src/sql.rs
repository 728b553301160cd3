//! Statement generation for the SQL engines.
//!
//! [`SqlCompiler`] turns a [`Query`] into `SELECT`/`COUNT`/`DISTINCT`/
//! `DELETE` text and builds the upsert and DDL statements. Literals come
//! from [`Dialect::encode_coerced`]; identifiers are always quoted.

use bazaar_types::{ColumnType, ID_COLUMN, IdKind, Record, Value, new_opaque_id};

use crate::codec::{Dialect, quote_ident};
use crate::error::DbError;
use crate::filter::{Condition, Operand, Operator, Predicate};
use crate::query::Query;
use crate::schema::{METADATA_COLLECTION, MetadataRow};

/// Expression that never holds; stands in for an empty `IN` list.
const NEVER: &str = "1 = 0";

/// Expression that always holds.
const ALWAYS: &str = "1 = 1";

/// An upsert statement and the id it writes, when known up front.
#[derive(Debug, Clone)]
pub struct SaveStatement {
    /// `INSERT ... RETURNING "_id"` text.
    pub sql: String,
    /// Id of the written record, unless the backend assigns it.
    pub id: Option<String>,
}

/// Generates statements for one dialect and id strategy.
#[derive(Debug, Clone, Copy)]
pub struct SqlCompiler {
    dialect: Dialect,
    ids: IdKind,
}

impl SqlCompiler {
    /// Create a compiler.
    pub const fn new(dialect: Dialect, ids: IdKind) -> Self {
        Self { dialect, ids }
    }

    /// Target dialect.
    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Id strategy.
    pub const fn ids(&self) -> IdKind {
        self.ids
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// `SELECT` honoring filters, sort, projection and pagination.
    pub fn select(&self, query: &Query) -> Result<String, DbError> {
        let mut sql = format!("SELECT {} FROM {}", projection(query), quote_ident(query.collection()));
        self.push_where(&mut sql, query)?;
        self.push_order_and_window(&mut sql, query);
        Ok(sql)
    }

    /// `SELECT COUNT(*)`; sort and pagination are ignored.
    pub fn count(&self, query: &Query) -> Result<String, DbError> {
        let mut sql = format!("SELECT COUNT(*) AS cnt FROM {}", quote_ident(query.collection()));
        self.push_where(&mut sql, query)?;
        Ok(sql)
    }

    /// `SELECT DISTINCT column`; sort and pagination are ignored.
    pub fn distinct(&self, query: &Query, column: &str) -> Result<String, DbError> {
        query.column_type(column)?;
        let mut sql = format!(
            "SELECT DISTINCT {} FROM {}",
            quote_ident(column),
            quote_ident(query.collection())
        );
        self.push_where(&mut sql, query)?;
        Ok(sql)
    }

    /// `DELETE` of every row matching the filters.
    pub fn delete(&self, query: &Query) -> Result<String, DbError> {
        let mut sql = format!("DELETE FROM {}", quote_ident(query.collection()));
        self.push_where(&mut sql, query)?;
        Ok(sql)
    }

    /// `SELECT` of one row by id. Filters do not apply.
    pub fn load_by_id(&self, query: &Query, id: &str) -> Result<String, DbError> {
        Ok(format!(
            "SELECT {} FROM {} WHERE {} = {}",
            projection(query),
            quote_ident(query.collection()),
            quote_ident(ID_COLUMN),
            self.id_literal(id)?
        ))
    }

    /// `DELETE` of one row by id.
    pub fn delete_by_id(&self, collection: &str, id: &str) -> Result<String, DbError> {
        Ok(format!(
            "DELETE FROM {} WHERE {} = {}",
            quote_ident(collection),
            quote_ident(ID_COLUMN),
            self.id_literal(id)?
        ))
    }

    /// Sub-select used by `IN (SELECT ...)`.
    pub fn subselect(&self, query: &Query) -> Result<String, DbError> {
        self.subselect_as(query, false)
    }

    /// Sub-select whose column is cast to text when `as_text` is set, to
    /// match a text-cast left-hand side.
    fn subselect_as(&self, query: &Query, as_text: bool) -> Result<String, DbError> {
        let selected = quote_ident(query.subselect_column());
        let selected = if as_text { self.dialect.text_cast(&selected) } else { selected };
        let mut sql = format!("SELECT {selected} FROM {}", quote_ident(query.collection()));
        self.push_where(&mut sql, query)?;
        self.push_order_and_window(&mut sql, query);
        Ok(sql)
    }

    fn id_literal(&self, id: &str) -> Result<String, DbError> {
        self.dialect.encode_literal(&Value::from(id), &ColumnType::Id, self.ids)
    }

    fn push_where(&self, sql: &mut String, query: &Query) -> Result<(), DbError> {
        if let Some(condition) = query.filters().condition() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.condition(&condition)?);
        }
        Ok(())
    }

    fn push_order_and_window(&self, sql: &mut String, query: &Query) {
        if !query.sort_keys().is_empty() {
            let keys: Vec<String> = query
                .sort_keys()
                .iter()
                .map(|k| format!("{} {}", quote_ident(&k.column), if k.descending { "DESC" } else { "ASC" }))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }
        if let Some(window) = self.dialect.pagination(query.offset(), query.limit()) {
            sql.push(' ');
            sql.push_str(&window);
        }
    }

    // =========================================================================
    // Predicates
    // =========================================================================

    /// Render a condition tree; composite nodes are parenthesized.
    pub fn condition(&self, condition: &Condition<'_>) -> Result<String, DbError> {
        let (parts, glue) = match condition {
            Condition::Predicate(p) => return self.predicate(p),
            Condition::All(parts) => (parts, " AND "),
            Condition::Any(parts) => (parts, " OR "),
        };
        let rendered = parts
            .iter()
            .map(|part| self.condition(part))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("({})", rendered.join(glue)))
    }

    /// Render a single predicate.
    pub fn predicate(&self, p: &Predicate) -> Result<String, DbError> {
        let column = quote_ident(&p.column);

        if p.kind.is_array() {
            return self.array_predicate(&column, p);
        }

        let cast = p.kind.is_text() || p.op == Operator::Like;
        let lhs = if cast { self.dialect.text_cast(&column) } else { column.clone() };

        match (&p.operand, p.op) {
            (Operand::Select(sub), _) => Ok(format!("{lhs} IN ({})", self.subselect_as(sub, cast)?)),
            (Operand::List(items), _) if items.is_empty() => Ok(NEVER.to_owned()),
            (Operand::List(items), _) => {
                let literals = items
                    .iter()
                    .map(|v| self.dialect.encode_coerced(v, &p.kind, self.ids))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("{lhs} IN ({})", literals.join(", ")))
            }
            (Operand::Value(Value::Null), Operator::Eq) => Ok(format!("{column} IS NULL")),
            (Operand::Value(Value::Null), _) => Ok(format!("{column} IS NOT NULL")),
            (Operand::Value(pattern), Operator::Like) => Ok(format!(
                "{lhs} {} {}",
                self.dialect.like_operator(),
                self.dialect.quote_text(&pattern.to_string())?
            )),
            (Operand::Value(value), op) => Ok(format!(
                "{lhs} {} {}",
                op.as_sql(),
                self.dialect.encode_coerced(value, &p.kind, self.ids)?
            )),
        }
    }

    fn array_predicate(&self, column: &str, p: &Predicate) -> Result<String, DbError> {
        let Operand::List(items) = &p.operand else {
            return Err(DbError::UnsupportedOperator(format!("{} on array column {}", p.op, p.column)));
        };
        let negate = p.op == Operator::NotEq;
        if items.is_empty() {
            return Ok(if negate { ALWAYS } else { NEVER }.to_owned());
        }
        let tests = items
            .iter()
            .map(|item| self.dialect.array_contains(column, item))
            .collect::<Result<Vec<_>, _>>()?;
        let any = if tests.len() == 1 {
            tests.join("")
        } else {
            format!("({})", tests.join(" OR "))
        };
        Ok(if negate { format!("NOT {any}") } else { any })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Upsert a record. Keys must be registered columns; `_id`, when
    /// present and not null, selects the row to update.
    pub fn save(&self, query: &Query, record: &Record) -> Result<SaveStatement, DbError> {
        let table = quote_ident(query.collection());
        let id = match record.get(ID_COLUMN) {
            Some(Value::Null) | None => match self.ids {
                IdKind::Integer => None,
                IdKind::Opaque => Some(new_opaque_id()),
            },
            Some(id) => Some(id.coerce(&ColumnType::Id)?.to_string()),
        };

        let mut columns = Vec::with_capacity(record.len());
        let mut values = Vec::with_capacity(record.len());
        if let Some(id) = &id {
            columns.push(quote_ident(ID_COLUMN));
            values.push(self.id_literal(id)?);
        }
        for (name, value) in record.iter().filter(|(name, _)| name.as_str() != ID_COLUMN) {
            let kind = query.column_type(name)?;
            columns.push(quote_ident(name));
            values.push(self.dialect.encode_literal(value, &kind, self.ids)?);
        }

        let returning = format!("RETURNING {}", quote_ident(ID_COLUMN));
        if columns.is_empty() {
            return Ok(SaveStatement {
                sql: format!("INSERT INTO {table} DEFAULT VALUES {returning}"),
                id,
            });
        }

        let updates: Vec<String> = columns
            .iter()
            .skip(usize::from(id.is_some()))
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        let conflict = if updates.is_empty() {
            "DO NOTHING".to_owned()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        let on_conflict = if id.is_some() {
            format!(" ON CONFLICT ({}) {conflict}", quote_ident(ID_COLUMN))
        } else {
            String::new()
        };
        Ok(SaveStatement {
            sql: format!(
                "INSERT INTO {table} ({}) VALUES ({}){on_conflict} {returning}",
                columns.join(", "),
                values.join(", ")
            ),
            id,
        })
    }

    /// Move the `_id` sequence past explicitly saved integer ids, so the
    /// next generated id cannot collide with an existing row. `None` when
    /// the backend already does this (`SQLite` `AUTOINCREMENT`) or ids are
    /// opaque.
    pub fn sync_id_sequence(&self, collection: &str) -> Result<Option<String>, DbError> {
        if self.dialect != Dialect::Postgres || self.ids != IdKind::Integer {
            return Ok(None);
        }
        let table = quote_ident(collection);
        let id = quote_ident(ID_COLUMN);
        let name = self.dialect.quote_text(&table)?;
        Ok(Some(format!(
            "SELECT setval(pg_get_serial_sequence({name}, '{ID_COLUMN}'), \
             GREATEST((SELECT MAX({id}) FROM {table}), 1))"
        )))
    }

    // =========================================================================
    // Schema
    // =========================================================================

    /// `CREATE TABLE` for a collection with just its `_id` column.
    pub fn create_table(&self, collection: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(collection),
            self.dialect.id_definition(self.ids)
        )
    }

    /// `CREATE TABLE` for the metadata collection.
    pub fn create_metadata_table(&self) -> String {
        let text = self.dialect.native_type(&ColumnType::Varchar(None), self.ids);
        let flag = self.dialect.native_type(&ColumnType::Boolean, self.ids);
        format!(
            "CREATE TABLE IF NOT EXISTS {table} ({id}, {collection} {text} NOT NULL, \
             {column} {text} NOT NULL, {kind} {text} NOT NULL, {indexed} {flag} NOT NULL, \
             UNIQUE ({collection}, {column}))",
            table = quote_ident(METADATA_COLLECTION),
            id = self.dialect.id_definition(IdKind::Integer),
            collection = quote_ident("collection"),
            column = quote_ident("column"),
            kind = quote_ident("type"),
            indexed = quote_ident("indexed"),
        )
    }

    /// Read every metadata row.
    pub fn select_metadata(&self) -> String {
        format!(
            "SELECT {}, {}, {}, {} FROM {}",
            quote_ident("collection"),
            quote_ident("column"),
            quote_ident("type"),
            quote_ident("indexed"),
            quote_ident(METADATA_COLLECTION)
        )
    }

    /// Insert a metadata row.
    pub fn insert_metadata(&self, row: &MetadataRow) -> Result<String, DbError> {
        Ok(format!(
            "INSERT INTO {} ({}, {}, {}, {}) VALUES ({}, {}, {}, {})",
            quote_ident(METADATA_COLLECTION),
            quote_ident("collection"),
            quote_ident("column"),
            quote_ident("type"),
            quote_ident("indexed"),
            self.dialect.quote_text(&row.collection)?,
            self.dialect.quote_text(&row.column)?,
            self.dialect.quote_text(&row.kind)?,
            self.dialect.encode_coerced(&Value::Bool(row.indexed), &ColumnType::Boolean, self.ids)?,
        ))
    }

    /// Delete a metadata row.
    pub fn delete_metadata(&self, collection: &str, column: &str) -> Result<String, DbError> {
        Ok(format!(
            "DELETE FROM {} WHERE {} = {} AND {} = {}",
            quote_ident(METADATA_COLLECTION),
            quote_ident("collection"),
            self.dialect.quote_text(collection)?,
            quote_ident("column"),
            self.dialect.quote_text(column)?,
        ))
    }

    /// `ALTER TABLE ... ADD COLUMN`.
    pub fn add_column(&self, collection: &str, column: &str, kind: &ColumnType) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote_ident(collection),
            quote_ident(column),
            self.dialect.native_type(kind, self.ids)
        )
    }

    /// `ALTER TABLE ... DROP COLUMN`.
    pub fn drop_column(&self, collection: &str, column: &str) -> String {
        format!("ALTER TABLE {} DROP COLUMN {}", quote_ident(collection), quote_ident(column))
    }

    /// `CREATE INDEX` on one column.
    pub fn create_index(&self, collection: &str, column: &str) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            index_name(collection, column),
            quote_ident(collection),
            quote_ident(column)
        )
    }

    /// `DROP INDEX` created by [`SqlCompiler::create_index`].
    pub fn drop_index(&self, collection: &str, column: &str) -> String {
        format!("DROP INDEX IF EXISTS {}", index_name(collection, column))
    }
}

fn projection(query: &Query) -> String {
    let columns = query.result_columns();
    if columns.is_empty() {
        return "*".to_owned();
    }
    std::iter::once(ID_COLUMN)
        .chain(columns.iter().map(String::as_str).filter(|c| *c != ID_COLUMN))
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}

fn index_name(collection: &str, column: &str) -> String {
    quote_ident(&format!("{collection}_{column}_idx"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::schema::ColumnCatalog;
    use bazaar_types::Column;

    fn catalog() -> ColumnCatalog {
        let catalog = ColumnCatalog::new();
        for (name, kind) in [
            ("bool", "bool"),
            ("int", "int"),
            ("name", "varchar"),
            ("tags", "[]text"),
            ("category_id", "id"),
        ] {
            catalog.insert("item", Column::new(name, ColumnType::parse(kind).unwrap(), false));
        }
        catalog.insert("link", Column::new("item_id", ColumnType::Id, true));
        catalog.insert("link", Column::new("label", ColumnType::Text, false));
        catalog
    }

    fn compiler() -> SqlCompiler {
        SqlCompiler::new(Dialect::Postgres, IdKind::Integer)
    }

    #[test]
    fn plain_select() {
        let query = Query::new("item", catalog());
        assert_eq!(compiler().select(&query).unwrap(), "SELECT * FROM \"item\"");
    }

    #[test]
    fn grouped_filters_compile_to_nested_clauses() {
        let mut query = Query::new("item", catalog());
        query.setup_filter_group("default", true, None).unwrap();
        query.setup_filter_group("case1", false, Some("default")).unwrap();
        query.setup_filter_group("case2", false, Some("default")).unwrap();
        query.add_group_filter("case1", "bool", "=", true).unwrap();
        query.add_group_filter("case1", "int", "<", 5).unwrap();
        query.add_group_filter("case2", "int", "=", 9).unwrap();
        assert_eq!(
            compiler().count(&query).unwrap(),
            "SELECT COUNT(*) AS cnt FROM \"item\" WHERE ((\"bool\" = TRUE AND \"int\" < 5) OR \"int\" = 9)"
        );
    }

    #[test]
    fn sort_and_window() {
        let mut query = Query::new("item", catalog());
        query.add_sort("int", true).unwrap();
        query.add_sort("name", false).unwrap();
        query.set_limit(1, 2);
        query.set_result_columns(&["int"]).unwrap();
        assert_eq!(
            compiler().select(&query).unwrap(),
            "SELECT \"_id\", \"int\" FROM \"item\" ORDER BY \"int\" DESC, \"name\" ASC LIMIT 2 OFFSET 1"
        );
    }

    #[test]
    fn text_columns_are_cast_and_like_is_case_insensitive() {
        let mut query = Query::new("item", catalog());
        query.add_filter("name", "like", "o'k").unwrap();
        assert_eq!(
            compiler().select(&query).unwrap(),
            "SELECT * FROM \"item\" WHERE \"name\"::text ILIKE E'%o''k%'"
        );
    }

    #[test]
    fn in_lists_and_empty_lists() {
        let mut query = Query::new("item", catalog());
        query.add_filter("int", "in", vec![1, 2]).unwrap();
        assert_eq!(
            compiler().delete(&query).unwrap(),
            "DELETE FROM \"item\" WHERE \"int\" IN (1, 2)"
        );
        query.clear_filters();
        query.add_filter("int", "in", Vec::<i64>::new()).unwrap();
        assert_eq!(compiler().delete(&query).unwrap(), "DELETE FROM \"item\" WHERE 1 = 0");
    }

    #[test]
    fn nested_collection_becomes_subselect() {
        let mut links = Query::new("link", catalog());
        links.set_result_columns(&["item_id"]).unwrap();
        let mut query = Query::new("item", catalog());
        query.add_filter("_id", "in", links).unwrap();
        assert_eq!(
            compiler().select(&query).unwrap(),
            "SELECT * FROM \"item\" WHERE \"_id\" IN (SELECT \"item_id\" FROM \"link\")"
        );
    }

    #[test]
    fn text_subselects_cast_like_scalar_lists() {
        let mut labels = Query::new("link", catalog());
        labels.set_result_columns(&["label"]).unwrap();
        let mut query = Query::new("item", catalog());
        query.add_filter("name", "in", labels).unwrap();
        assert_eq!(
            compiler().select(&query).unwrap(),
            "SELECT * FROM \"item\" WHERE \"name\"::text IN (SELECT \"label\"::text FROM \"link\")"
        );

        let mut scalar = Query::new("item", catalog());
        scalar.add_filter("name", "in", vec!["a", "b"]).unwrap();
        assert!(
            SqlCompiler::new(Dialect::Sqlite, IdKind::Integer)
                .select(&scalar)
                .unwrap()
                .ends_with("WHERE CAST(\"name\" AS TEXT) IN ('a', 'b')")
        );
    }

    #[test]
    fn array_membership_is_or_joined() {
        let mut query = Query::new("item", catalog());
        query.add_filter("tags", "=", vec!["a", "b"]).unwrap();
        assert_eq!(
            compiler().count(&query).unwrap(),
            "SELECT COUNT(*) AS cnt FROM \"item\" WHERE (strpos((',' || \"tags\" || ','), E',a,') > 0 \
             OR strpos((',' || \"tags\" || ','), E',b,') > 0)"
        );
        query.clear_filters();
        query.add_filter("tags", "!=", "a").unwrap();
        assert!(compiler().count(&query).unwrap().ends_with("WHERE NOT strpos((',' || \"tags\" || ','), E',a,') > 0"));
    }

    #[test]
    fn null_comparisons_use_is() {
        let mut query = Query::new("item", catalog());
        query.add_filter("category_id", "!=", Value::Null).unwrap();
        assert_eq!(
            compiler().select(&query).unwrap(),
            "SELECT * FROM \"item\" WHERE \"category_id\" IS NOT NULL"
        );
    }

    #[test]
    fn upsert_with_id_updates_other_columns() {
        let query = Query::new("item", catalog());
        let mut record = Record::new();
        record.insert("_id".to_owned(), Value::from("7"));
        record.insert("int".to_owned(), Value::Int(3));
        let statement = compiler().save(&query, &record).unwrap();
        assert_eq!(statement.id.as_deref(), Some("7"));
        assert_eq!(
            statement.sql,
            "INSERT INTO \"item\" (\"_id\", \"int\") VALUES (7, 3) \
             ON CONFLICT (\"_id\") DO UPDATE SET \"int\" = excluded.\"int\" RETURNING \"_id\""
        );
    }

    #[test]
    fn insert_without_id_lets_backend_assign() {
        let query = Query::new("item", catalog());
        let mut record = Record::new();
        record.insert("bool".to_owned(), Value::Bool(false));
        let statement = SqlCompiler::new(Dialect::Sqlite, IdKind::Integer).save(&query, &record).unwrap();
        assert!(statement.id.is_none());
        assert_eq!(statement.sql, "INSERT INTO \"item\" (\"bool\") VALUES (0) RETURNING \"_id\"");
        record.insert("nope".to_owned(), Value::Int(1));
        assert!(matches!(
            compiler().save(&query, &record),
            Err(DbError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn explicit_integer_ids_advance_the_postgres_sequence() {
        assert_eq!(
            compiler().sync_id_sequence("item").unwrap().as_deref(),
            Some(
                "SELECT setval(pg_get_serial_sequence(E'\"item\"', '_id'), \
                 GREATEST((SELECT MAX(\"_id\") FROM \"item\"), 1))"
            )
        );
        assert!(SqlCompiler::new(Dialect::Sqlite, IdKind::Integer).sync_id_sequence("item").unwrap().is_none());
        assert!(SqlCompiler::new(Dialect::Postgres, IdKind::Opaque).sync_id_sequence("item").unwrap().is_none());
    }

    #[test]
    fn opaque_ids_are_generated() {
        let query = Query::new("item", catalog());
        let statement = SqlCompiler::new(Dialect::Sqlite, IdKind::Opaque)
            .save(&query, &Record::new())
            .unwrap();
        let id = statement.id.unwrap();
        assert!(IdKind::Opaque.accepts(&id));
        assert!(statement.sql.contains("DO NOTHING"));
    }

    #[test]
    fn load_by_id_ignores_filters() {
        let mut query = Query::new("item", catalog());
        query.add_filter("int", "=", 1).unwrap();
        assert_eq!(
            compiler().load_by_id(&query, "5").unwrap(),
            "SELECT * FROM \"item\" WHERE \"_id\" = 5"
        );
    }
}
