//! Column type inference shared by the versioned store and the relational export.

use serde::{Deserialize, Serialize};

use crate::{ColumnMapping, FieldValue, PropertyRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    BigInt,
    Double,
    Boolean,
    Timestamp,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }

    pub fn widen(self, other: ColumnType) -> ColumnType {
        match (self, other) {
            (a, b) if a == b => a,
            (ColumnType::BigInt, ColumnType::Double) | (ColumnType::Double, ColumnType::BigInt) => {
                ColumnType::Double
            }
            _ => ColumnType::Text,
        }
    }
}

/// Text unless every non-null value agrees; integers mixed with floats widen to double.
pub fn infer_column_type<'a>(values: impl IntoIterator<Item = &'a FieldValue>) -> ColumnType {
    let mut inferred: Option<ColumnType> = None;
    for value in values {
        let Some(kind) = value.kind() else {
            continue;
        };
        inferred = Some(match inferred {
            None => kind,
            Some(current) => current.widen(kind),
        });
        if inferred == Some(ColumnType::Text) {
            break;
        }
    }
    inferred.unwrap_or(ColumnType::Text)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferredSchema {
    pub mapping: ColumnMapping,
    pub columns: Vec<ColumnDef>,
}

impl InferredSchema {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

pub fn infer_schema(records: &[PropertyRecord]) -> InferredSchema {
    let mapping = ColumnMapping::build(records.iter().flat_map(|r| r.field_names()));
    let columns = mapping
        .iter_in_order()
        .map(|(original, sanitized)| {
            let column_type = infer_column_type(records.iter().filter_map(|r| r.get(original)));
            ColumnDef::new(sanitized, column_type)
        })
        .collect();
    InferredSchema { mapping, columns }
}
