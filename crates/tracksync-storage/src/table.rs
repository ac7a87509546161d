//! Table definitions derived from the entity catalog, plus the SQL generated from them.

use indexmap::IndexMap;
use tracksync_core::{ColumnDef, EntityKind, FieldType, JunctionDef, Record, Value};

use crate::StoreError;

/// PostgreSQL caps one statement at 65535 bind parameters.
pub const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Entity,
    Junction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: &'static str,
    pub references: &'static str,
}

#[derive(Debug, Clone)]
pub struct TableDef {
    pub relation: &'static str,
    pub kind: TableKind,
    pub columns: Vec<ColumnDef>,
    pub key: Vec<&'static str>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableDef {
    pub fn entity(kind: EntityKind) -> Self {
        Self {
            relation: kind.relation_name(),
            kind: TableKind::Entity,
            columns: kind.schema().columns.to_vec(),
            key: vec!["id"],
            foreign_keys: Vec::new(),
        }
    }

    pub fn junction(junction: &JunctionDef) -> Self {
        let [parent, child] = junction.key_columns();
        Self {
            relation: junction.table,
            kind: TableKind::Junction,
            columns: vec![
                ColumnDef {
                    name: parent,
                    field_type: FieldType::Identifier,
                },
                ColumnDef {
                    name: child,
                    field_type: FieldType::Identifier,
                },
            ],
            key: vec![parent, child],
            foreign_keys: vec![
                ForeignKey {
                    column: parent,
                    references: junction.parent_table,
                },
                ForeignKey {
                    column: child,
                    references: junction.child_table,
                },
            ],
        }
    }

    /// Every entity table followed by every junction table, so DDL can run in order.
    pub fn catalog() -> Vec<TableDef> {
        EntityKind::ALL
            .into_iter()
            .map(TableDef::entity)
            .chain(tracksync_core::all_junctions().map(TableDef::junction))
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_key(&self, column: &str) -> bool {
        self.key.iter().any(|k| *k == column)
    }

    pub fn qualified_name(&self) -> String {
        qualify(self.relation)
    }

    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", quote_ident(c.name), c.field_type.sql_type());
                if self.kind == TableKind::Entity && self.is_key(c.name) {
                    def.push_str(" PRIMARY KEY");
                } else if self.is_key(c.name) {
                    def.push_str(" NOT NULL");
                }
                def
            })
            .collect();

        if self.kind == TableKind::Junction {
            parts.push(format!("PRIMARY KEY ({})", self.key_list()));
            for fk in &self.foreign_keys {
                parts.push(format!(
                    "FOREIGN KEY ({}) REFERENCES {} (\"id\") ON DELETE CASCADE",
                    quote_ident(fk.column),
                    qualify(fk.references)
                ));
            }
        }

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.qualified_name(),
            parts.join(",\n    ")
        )
    }

    /// Multi-row insert of `rows` rows over `columns`. Entity tables overwrite
    /// every non-key column from the incoming row; junction rows are left as is.
    pub fn upsert_sql(&self, columns: &[&ColumnDef], rows: usize) -> String {
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c.name))
            .collect::<Vec<_>>()
            .join(", ");

        let width = columns.len();
        let values = (0..rows)
            .map(|row| {
                let placeholders = (1..=width)
                    .map(|col| format!("${}", row * width + col))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({placeholders})")
            })
            .collect::<Vec<_>>()
            .join(", ");

        let updates = columns
            .iter()
            .filter(|c| !self.is_key(c.name))
            .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c.name)))
            .collect::<Vec<_>>();

        let conflict = if self.kind == TableKind::Entity && !updates.is_empty() {
            format!("DO UPDATE SET {}", updates.join(", "))
        } else {
            "DO NOTHING".to_string()
        };

        format!(
            "INSERT INTO {} ({column_list}) VALUES {values} ON CONFLICT ({}) {conflict}",
            self.qualified_name(),
            self.key_list()
        )
    }

    pub fn select_all_sql(&self) -> String {
        format!(
            "SELECT {} FROM {} ORDER BY {}",
            self.column_list(),
            self.qualified_name(),
            self.key_list()
        )
    }

    pub fn select_by_id_sql(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE \"id\" = $1",
            self.column_list(),
            self.qualified_name()
        )
    }

    fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| quote_ident(c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn key_list(&self) -> String {
        self.key
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// `linear.issues` -> `"linear"."issues"`.
pub fn qualify(relation: &str) -> String {
    match relation.split_once('.') {
        Some((schema, table)) => format!("{}.{}", quote_ident(schema), quote_ident(table)),
        None => quote_ident(relation),
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Rows sharing one column set, bound by one statement shape.
#[derive(Debug)]
pub struct RowGroup<'a> {
    pub columns: Vec<&'a ColumnDef>,
    pub rows: Vec<Vec<&'a Value>>,
}

impl RowGroup<'_> {
    pub fn rows_per_statement(&self) -> usize {
        (MAX_BIND_PARAMS / self.columns.len().max(1)).max(1)
    }
}

/// Validated rows, de-duplicated by key, ready to bind.
#[derive(Debug)]
pub struct PreparedWrite<'a> {
    pub groups: Vec<RowGroup<'a>>,
}

impl PreparedWrite<'_> {
    pub fn row_count(&self) -> usize {
        self.groups.iter().map(|g| g.rows.len()).sum()
    }
}

/// Check every record against `table` and collapse duplicate keys, last
/// occurrence winning. Rows are grouped by the columns they carry, so a
/// column a record lacks is never written for that record.
pub fn prepare_rows<'a>(
    table: &'a TableDef,
    records: &'a [Record],
) -> Result<PreparedWrite<'a>, StoreError> {
    for (index, record) in records.iter().enumerate() {
        for key in &table.key {
            if record.get(key).map_or(true, Value::is_null) {
                return Err(StoreError::MissingKey {
                    relation: table.relation.to_string(),
                    column: key.to_string(),
                    index,
                });
            }
        }
        for (column, value) in record.iter() {
            let def = table.column(column).ok_or_else(|| StoreError::UnknownColumn {
                relation: table.relation.to_string(),
                column: column.to_string(),
            })?;
            if !def.field_type.accepts(value) {
                return Err(StoreError::TypeMismatch {
                    relation: table.relation.to_string(),
                    column: column.to_string(),
                    expected: def.field_type,
                    found: value.kind_name(),
                });
            }
        }
    }

    let mut by_key: IndexMap<Vec<&str>, &Record> = IndexMap::with_capacity(records.len());
    for record in records {
        let key = table
            .key
            .iter()
            .map(|k| record.get(k).and_then(Value::as_str).unwrap_or_default())
            .collect();
        by_key.insert(key, record);
    }

    let mut groups: IndexMap<Vec<&str>, RowGroup<'a>> = IndexMap::new();
    for record in by_key.into_values() {
        let columns: Vec<&ColumnDef> = table
            .columns
            .iter()
            .filter(|c| record.contains(c.name))
            .collect();
        let row = columns
            .iter()
            .filter_map(|c| record.get(c.name))
            .collect();
        groups
            .entry(columns.iter().map(|c| c.name).collect())
            .or_insert_with(|| RowGroup {
                columns,
                rows: Vec::new(),
            })
            .rows
            .push(row);
    }

    Ok(PreparedWrite {
        groups: groups.into_values().collect(),
    })
}
