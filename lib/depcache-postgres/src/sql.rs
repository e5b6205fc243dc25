//! SQL text for the row store operations.
//!
//! Identifiers are always double-quoted so table and column names keep their
//! case. Placeholders are numbered from `$1` in the order values are bound.

use depcache::{ScalarType, TableSchema};

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn ident_list<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn sql_type(ty: ScalarType) -> &'static str {
    match ty {
        ScalarType::Integer => "BIGINT",
        ScalarType::Real => "DOUBLE PRECISION",
        ScalarType::Text => "TEXT",
        ScalarType::Boolean => "BOOLEAN",
        ScalarType::Blob => "BYTEA",
    }
}

/// Map an `information_schema.columns.data_type` back to a scalar type.
pub fn scalar_type(data_type: &str) -> ScalarType {
    match data_type {
        "bigint" | "integer" | "smallint" => ScalarType::Integer,
        "double precision" | "real" | "numeric" => ScalarType::Real,
        "boolean" => ScalarType::Boolean,
        "bytea" => ScalarType::Blob,
        _ => ScalarType::Text,
    }
}

/// `CREATE TABLE` plus the table comment.
pub fn create_table(schema: &TableSchema) -> Vec<String> {
    let mut defs = vec![format!(
        "{} BIGSERIAL PRIMARY KEY",
        quote_ident(&schema.rowid_column())
    )];
    for column in &schema.columns {
        let not_null = if column.not_null { " NOT NULL" } else { "" };
        defs.push(format!(
            "{} {}{}",
            quote_ident(&column.name),
            sql_type(column.ty),
            not_null
        ));
    }
    if !schema.superkey.is_empty() {
        defs.push(format!("UNIQUE ({})", ident_list(&schema.superkey)));
    }

    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&schema.name),
        defs.join(", ")
    )];

    let mut comment = schema.docstr.clone();
    if !schema.depends_on.is_empty() {
        comment.push_str(&format!(" (depends on {})", schema.depends_on.join(", ")));
    }
    if !comment.is_empty() {
        statements.push(format!(
            "COMMENT ON TABLE {} IS {}",
            quote_ident(&schema.name),
            quote_literal(&comment)
        ));
    }
    statements
}

pub fn table_exists() -> &'static str {
    "SELECT EXISTS(SELECT 1 FROM information_schema.tables \
     WHERE table_schema = current_schema() AND table_name = $1)"
}

pub fn column_types() -> &'static str {
    "SELECT column_name, data_type FROM information_schema.columns \
     WHERE table_schema = current_schema() AND table_name = $1"
}

pub fn insert_returning(table: &str, columns: &[String], rowid_column: &str) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
        quote_ident(table),
        ident_list(columns),
        placeholders(1, columns.len()),
        quote_ident(rowid_column)
    )
}

pub fn insert_if_absent(
    table: &str,
    columns: &[String],
    key_columns: &[String],
    rowid_column: &str,
) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO NOTHING RETURNING {}",
        quote_ident(table),
        ident_list(columns),
        placeholders(1, columns.len()),
        ident_list(key_columns),
        quote_ident(rowid_column)
    )
}

/// Select `columns` (prefixed with the rowid) of the rows whose rowid is in
/// the array bound to `$1`.
pub fn select_by_ids(table: &str, columns: &[String], rowid_column: &str) -> String {
    let mut selected = vec![quote_ident(rowid_column)];
    selected.extend(columns.iter().map(|c| quote_ident(c)));
    format!(
        "SELECT {} FROM {} WHERE {} = ANY($1)",
        selected.join(", "),
        quote_ident(table),
        quote_ident(rowid_column)
    )
}

/// Select `where_columns` followed by `columns` of the rows matching any of
/// `tuples` parameter tuples.
pub fn select_where(
    table: &str,
    columns: &[String],
    where_columns: &[String],
    tuples: usize,
) -> String {
    let mut selected: Vec<String> = where_columns.iter().map(|c| quote_ident(c)).collect();
    selected.extend(columns.iter().map(|c| quote_ident(c)));

    let width = where_columns.len();
    let clauses: Vec<String> = (0..tuples)
        .map(|t| {
            let terms: Vec<String> = where_columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = ${}", quote_ident(c), t * width + i + 1))
                .collect();
            format!("({})", terms.join(" AND "))
        })
        .collect();

    format!(
        "SELECT {} FROM {} WHERE {}",
        selected.join(", "),
        quote_ident(table),
        clauses.join(" OR ")
    )
}

pub fn delete_by_ids(table: &str, rowid_column: &str) -> String {
    format!(
        "DELETE FROM {} WHERE {} = ANY($1)",
        quote_ident(table),
        quote_ident(rowid_column)
    )
}
