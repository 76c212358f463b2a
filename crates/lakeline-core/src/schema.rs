//! Writer schema and the compatibility check run before upserts and inserts.
//!
//! The table schema is the writer schema recorded in the latest completed
//! commit. A new writer schema is compatible when it can still read every
//! existing record:
//!
//! - Every table column appears in the writer schema.
//! - Shared columns keep their type, except for the widening promotions
//!   `Int32 -> Int64` and `Float32 -> Float64`.
//! - A shared column may become nullable but not the other way round.
//! - New columns must be nullable.
//!
//! Anything beyond this check (defaults, renames, reordering semantics) is
//! not handled here.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Boolean.
    Boolean,
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
    /// UTF-8 string.
    String,
    /// Opaque bytes.
    Binary,
    /// Microsecond timestamp.
    TimestampMicros,
}

impl FieldType {
    fn can_widen_to(self, to: FieldType) -> bool {
        self == to
            || matches!(
                (self, to),
                (FieldType::Int32, FieldType::Int64) | (FieldType::Float32, FieldType::Float64)
            )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::Boolean => "boolean",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::Float32 => "float32",
            FieldType::Float64 => "float64",
            FieldType::String => "string",
            FieldType::Binary => "binary",
            FieldType::TimestampMicros => "timestamp_micros",
        };
        f.write_str(s)
    }
}

/// One column of a writer schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    /// Column name.
    pub name: String,
    /// Logical type.
    pub data_type: FieldType,
    /// Whether the column accepts nulls.
    pub nullable: bool,
}

impl SchemaField {
    /// Build a column.
    pub fn new(name: impl Into<String>, data_type: FieldType, nullable: bool) -> Self {
        SchemaField {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// Ordered list of columns written by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterSchema {
    fields: Vec<SchemaField>,
}

/// Errors raised by schema validation.
#[derive(Debug, Snafu)]
pub enum SchemaCompatibilityError {
    /// The schema lists the same column twice.
    #[snafu(display("Duplicate column {column} in writer schema"))]
    DuplicateColumn {
        /// The repeated column name.
        column: String,
    },

    /// The writer schema drops a table column.
    #[snafu(display("Writer schema is missing table column {column}"))]
    MissingColumn {
        /// The name of the missing column.
        column: String,
    },

    /// A shared column changed type in a non-widening way.
    #[snafu(display(
        "Type mismatch for column {column}: table has {table_type}, writer has {writer_type}"
    ))]
    TypeMismatch {
        /// The column name.
        column: String,
        /// The type in the table schema.
        table_type: FieldType,
        /// The type in the writer schema.
        writer_type: FieldType,
    },

    /// A nullable table column became non-nullable.
    #[snafu(display("Column {column} is nullable in the table but not in the writer schema"))]
    NullabilityNarrowed {
        /// The column name.
        column: String,
    },

    /// A column added by the writer is not nullable.
    #[snafu(display("New column {column} must be nullable"))]
    NonNullableAddition {
        /// The column name.
        column: String,
    },

    /// The stored schema could not be parsed.
    #[snafu(display("Invalid schema JSON: {source}"))]
    InvalidSchemaJson {
        /// Underlying serde_json error.
        source: serde_json::Error,
    },
}

/// A convenience type alias for results of schema operations.
pub type SchemaResult<T> = Result<T, SchemaCompatibilityError>;

impl WriterSchema {
    /// Build a schema, rejecting duplicate column names.
    pub fn new(fields: Vec<SchemaField>) -> SchemaResult<Self> {
        let mut seen = HashSet::new();
        for field in &fields {
            ensure!(
                seen.insert(field.name.as_str()),
                DuplicateColumnSnafu {
                    column: field.name.clone()
                }
            );
        }
        Ok(WriterSchema { fields })
    }

    /// Columns in declaration order.
    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    /// Serialize for commit metadata.
    pub fn to_json(&self) -> String {
        // A Vec of plain structs always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a schema stored in commit metadata.
    pub fn from_json(json: &str) -> SchemaResult<Self> {
        let schema: WriterSchema = serde_json::from_str(json).context(InvalidSchemaJsonSnafu)?;
        WriterSchema::new(schema.fields)
    }

    fn by_name(&self) -> HashMap<&str, &SchemaField> {
        self.fields.iter().map(|f| (f.name.as_str(), f)).collect()
    }
}

/// Check that `writer` can evolve `table` (see the module docs for the rules).
pub fn ensure_schema_compatible(table: &WriterSchema, writer: &WriterSchema) -> SchemaResult<()> {
    let writer_cols = writer.by_name();
    for table_field in table.fields() {
        let writer_field =
            writer_cols
                .get(table_field.name.as_str())
                .context(MissingColumnSnafu {
                    column: table_field.name.clone(),
                })?;

        ensure!(
            table_field.data_type.can_widen_to(writer_field.data_type),
            TypeMismatchSnafu {
                column: table_field.name.clone(),
                table_type: table_field.data_type,
                writer_type: writer_field.data_type,
            }
        );
        ensure!(
            !table_field.nullable || writer_field.nullable,
            NullabilityNarrowedSnafu {
                column: table_field.name.clone()
            }
        );
    }

    let table_cols = table.by_name();
    for writer_field in writer.fields() {
        if !table_cols.contains_key(writer_field.name.as_str()) {
            ensure!(
                writer_field.nullable,
                NonNullableAdditionSnafu {
                    column: writer_field.name.clone()
                }
            );
        }
    }
    Ok(())
}
