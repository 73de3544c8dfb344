// Arrow to row conversion
//
// Turns DataFusion record batches into `Row`s. Each Arrow type is mapped to a
// `CellValue` once, here at the engine boundary; lists and structs become
// nested JSON, and anything without a dedicated mapping is rendered with
// Arrow's display formatting.

use anyhow::{anyhow, Result};
use datafusion::arrow::array::*;
use datafusion::arrow::datatypes::DataType;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::arrow::util::display::array_value_to_string;

use crate::models::{CellValue, Row};

/// Convert query output batches into rows, in batch order
pub fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<Row>> {
    let total: usize = batches.iter().map(RecordBatch::num_rows).sum();
    let mut rows = Vec::with_capacity(total);

    for batch in batches {
        let schema = batch.schema();
        for row_idx in 0..batch.num_rows() {
            let mut row = Row::with_capacity(batch.num_columns());
            for (col_idx, field) in schema.fields().iter().enumerate() {
                let value = cell_value(batch.column(col_idx), row_idx)?;
                row.push(field.name().clone(), value);
            }
            rows.push(row);
        }
    }

    Ok(rows)
}

fn downcast<T: 'static>(array: &ArrayRef) -> Result<&T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("Failed to downcast {:?} array", array.data_type()))
}

/// Convert a single array value
pub fn cell_value(array: &ArrayRef, row_idx: usize) -> Result<CellValue> {
    if array.is_null(row_idx) {
        return Ok(CellValue::Null);
    }

    let value = match array.data_type() {
        DataType::Null => CellValue::Null,
        DataType::Boolean => CellValue::Bool(downcast::<BooleanArray>(array)?.value(row_idx)),

        DataType::Int8 => CellValue::Int(downcast::<Int8Array>(array)?.value(row_idx) as i64),
        DataType::Int16 => CellValue::Int(downcast::<Int16Array>(array)?.value(row_idx) as i64),
        DataType::Int32 => CellValue::Int(downcast::<Int32Array>(array)?.value(row_idx) as i64),
        DataType::Int64 => CellValue::Int(downcast::<Int64Array>(array)?.value(row_idx)),
        DataType::UInt8 => CellValue::Int(downcast::<UInt8Array>(array)?.value(row_idx) as i64),
        DataType::UInt16 => CellValue::Int(downcast::<UInt16Array>(array)?.value(row_idx) as i64),
        DataType::UInt32 => CellValue::Int(downcast::<UInt32Array>(array)?.value(row_idx) as i64),
        DataType::UInt64 => {
            let value = downcast::<UInt64Array>(array)?.value(row_idx);
            // Values past i64::MAX keep their digits as text
            match i64::try_from(value) {
                Ok(v) => CellValue::Int(v),
                Err(_) => CellValue::Text(value.to_string()),
            }
        }

        DataType::Float32 => CellValue::Float(downcast::<Float32Array>(array)?.value(row_idx) as f64),
        DataType::Float64 => CellValue::Float(downcast::<Float64Array>(array)?.value(row_idx)),
        DataType::Decimal128(_, scale) => {
            let raw = downcast::<Decimal128Array>(array)?.value(row_idx);
            CellValue::Float(raw as f64 / 10f64.powi(*scale as i32))
        }

        DataType::Utf8 => CellValue::Text(downcast::<StringArray>(array)?.value(row_idx).to_string()),
        DataType::LargeUtf8 => {
            CellValue::Text(downcast::<LargeStringArray>(array)?.value(row_idx).to_string())
        }
        DataType::Utf8View => {
            CellValue::Text(downcast::<StringViewArray>(array)?.value(row_idx).to_string())
        }

        // Binary values are rendered as hex
        DataType::Binary => CellValue::Text(hex(downcast::<BinaryArray>(array)?.value(row_idx))),
        DataType::LargeBinary => {
            CellValue::Text(hex(downcast::<LargeBinaryArray>(array)?.value(row_idx)))
        }

        DataType::List(_) => {
            let values = downcast::<ListArray>(array)?.value(row_idx);
            CellValue::Nested(list_to_json(&values)?)
        }
        DataType::LargeList(_) => {
            let values = downcast::<LargeListArray>(array)?.value(row_idx);
            CellValue::Nested(list_to_json(&values)?)
        }
        DataType::Struct(fields) => {
            let structs = downcast::<StructArray>(array)?;
            let mut object = serde_json::Map::with_capacity(fields.len());
            for (field, column) in fields.iter().zip(structs.columns()) {
                object.insert(field.name().clone(), cell_value(column, row_idx)?.into_json());
            }
            CellValue::Nested(serde_json::Value::Object(object))
        }

        // Dates, timestamps, intervals and the rest
        _ => CellValue::Text(array_value_to_string(array, row_idx)?),
    };

    Ok(value)
}

fn list_to_json(values: &ArrayRef) -> Result<serde_json::Value> {
    (0..values.len())
        .map(|i| cell_value(values, i).map(CellValue::into_json))
        .collect::<Result<Vec<_>>>()
        .map(serde_json::Value::Array)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
