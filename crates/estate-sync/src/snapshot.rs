//! Parquet encoding of typed record snapshots.

use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use bytes::Bytes;
use chrono::DateTime;
use estate_core::{ColumnDef, ColumnType, FieldValue, PropertyRecord};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::error::MergeError;

const UTC: &str = "UTC";

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Text => DataType::Utf8,
        ColumnType::BigInt => DataType::Int64,
        ColumnType::Double => DataType::Float64,
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into())),
    }
}

fn column_type(data_type: &DataType) -> Option<ColumnType> {
    match data_type {
        DataType::Utf8 => Some(ColumnType::Text),
        DataType::Int64 => Some(ColumnType::BigInt),
        DataType::Float64 => Some(ColumnType::Double),
        DataType::Boolean => Some(ColumnType::Boolean),
        DataType::Timestamp(TimeUnit::Microsecond, _) => Some(ColumnType::Timestamp),
        _ => None,
    }
}

fn typed_values<T>(
    column: &ColumnDef,
    records: &[PropertyRecord],
    convert: impl Fn(&FieldValue) -> Option<T>,
) -> Result<Vec<Option<T>>, MergeError> {
    records
        .iter()
        .enumerate()
        .map(|(row, record)| match record.get(&column.name) {
            None | Some(FieldValue::Null) => Ok(None),
            Some(value) => convert(value).map(Some).ok_or_else(|| MergeError::Encode {
                column: column.name.clone(),
                row,
                expected: column.column_type,
                found: value
                    .kind()
                    .map(|k| format!("{k:?}"))
                    .unwrap_or_else(|| "null".to_string()),
            }),
        })
        .collect()
}

fn build_array(column: &ColumnDef, records: &[PropertyRecord]) -> Result<ArrayRef, MergeError> {
    let array: ArrayRef = match column.column_type {
        ColumnType::Text => Arc::new(StringArray::from(typed_values(column, records, FieldValue::as_text)?)),
        ColumnType::BigInt => Arc::new(Int64Array::from(typed_values(column, records, FieldValue::as_i64)?)),
        ColumnType::Double => Arc::new(Float64Array::from(typed_values(column, records, FieldValue::as_f64)?)),
        ColumnType::Boolean => {
            Arc::new(BooleanArray::from(typed_values(column, records, FieldValue::as_bool)?))
        }
        ColumnType::Timestamp => {
            let micros = typed_values(column, records, |v| v.as_timestamp().map(|ts| ts.timestamp_micros()))?;
            Arc::new(TimestampMicrosecondArray::from(micros).with_timezone(UTC))
        }
    };
    Ok(array)
}

pub fn encode_snapshot(columns: &[ColumnDef], records: &[PropertyRecord]) -> Result<Vec<u8>, MergeError> {
    if columns.is_empty() {
        return Err(MergeError::EmptySchema);
    }
    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|c| ArrowField::new(&c.name, arrow_type(c.column_type), true))
            .collect::<Vec<_>>(),
    ));
    let arrays = columns
        .iter()
        .map(|c| build_array(c, records))
        .collect::<Result<Vec<_>, _>>()?;
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buffer)
}

fn decode_column(
    array: &dyn Array,
    column: &ColumnDef,
    rows: &mut [PropertyRecord],
) -> Result<(), MergeError> {
    let mismatch = || MergeError::Decode(format!("column {} is not {:?}", column.name, column.column_type));
    let mut put = |idx: usize, value: Option<FieldValue>| {
        rows[idx].insert(column.name.clone(), value.unwrap_or(FieldValue::Null))
    };

    match column.column_type {
        ColumnType::Text => {
            let values = array.as_any().downcast_ref::<StringArray>().ok_or_else(mismatch)?;
            for (idx, value) in values.iter().enumerate() {
                put(idx, value.map(|v| FieldValue::Text(v.to_string())));
            }
        }
        ColumnType::BigInt => {
            let values = array.as_any().downcast_ref::<Int64Array>().ok_or_else(mismatch)?;
            for (idx, value) in values.iter().enumerate() {
                put(idx, value.map(FieldValue::Integer));
            }
        }
        ColumnType::Double => {
            let values = array.as_any().downcast_ref::<Float64Array>().ok_or_else(mismatch)?;
            for (idx, value) in values.iter().enumerate() {
                put(idx, value.map(FieldValue::Float));
            }
        }
        ColumnType::Boolean => {
            let values = array.as_any().downcast_ref::<BooleanArray>().ok_or_else(mismatch)?;
            for (idx, value) in values.iter().enumerate() {
                put(idx, value.map(FieldValue::Boolean));
            }
        }
        ColumnType::Timestamp => {
            let values = array
                .as_any()
                .downcast_ref::<TimestampMicrosecondArray>()
                .ok_or_else(mismatch)?;
            for (idx, value) in values.iter().enumerate() {
                let value = match value {
                    Some(micros) => Some(FieldValue::Timestamp(
                        DateTime::from_timestamp_micros(micros).ok_or_else(|| {
                            MergeError::Decode(format!("timestamp out of range in {}: {micros}", column.name))
                        })?,
                    )),
                    None => None,
                };
                put(idx, value);
            }
        }
    }
    Ok(())
}

/// Decode a snapshot. Every record carries every column; null cells decode to `FieldValue::Null`.
pub fn decode_snapshot(bytes: Vec<u8>) -> Result<(Vec<ColumnDef>, Vec<PropertyRecord>), MergeError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))?;
    let columns = builder
        .schema()
        .fields()
        .iter()
        .map(|field| {
            column_type(field.data_type())
                .map(|t| ColumnDef::new(field.name().as_str(), t))
                .ok_or_else(|| {
                    MergeError::Decode(format!(
                        "unsupported type {} for column {}",
                        field.data_type(),
                        field.name()
                    ))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::new();
    for batch in builder.build()? {
        let batch = batch?;
        let mut rows = vec![PropertyRecord::new(); batch.num_rows()];
        for (idx, column) in columns.iter().enumerate() {
            decode_column(batch.column(idx).as_ref(), column, &mut rows)?;
        }
        records.extend(rows);
    }
    Ok((columns, records))
}
