use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::{Row, Statement};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::results::ResultSet;
use crate::types::RowValues;

/// Extracts a `RowValues` from a `tokio_postgres` Row at the given index.
///
/// `numeric` becomes `Int` when it has no scale and fits, otherwise `Float`;
/// `uuid` becomes `Text`; one-dimensional arrays of scalars become JSON arrays.
///
/// # Errors
/// Returns `BrokerError::Execution` if the column type has no `RowValues` mapping.
pub fn postgres_extract_value(row: &Row, idx: usize) -> Result<RowValues, BrokerError> {
    let type_info = row.columns()[idx].type_();
    if let Kind::Array(member) = type_info.kind() {
        return extract_array(row, idx, member);
    }

    let value = match type_info.name() {
        "int2" => row
            .try_get::<_, Option<i16>>(idx)?
            .map_or(RowValues::Null, |v| RowValues::Int(i64::from(v))),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)?
            .map_or(RowValues::Null, |v| RowValues::Int(i64::from(v))),
        "int8" => row
            .try_get::<_, Option<i64>>(idx)?
            .map_or(RowValues::Null, RowValues::Int),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)?
            .map_or(RowValues::Null, |v| RowValues::Float(f64::from(v))),
        "float8" => row
            .try_get::<_, Option<f64>>(idx)?
            .map_or(RowValues::Null, RowValues::Float),
        "numeric" => row
            .try_get::<_, Option<Decimal>>(idx)?
            .map_or(RowValues::Null, numeric_value),
        "uuid" => row
            .try_get::<_, Option<Uuid>>(idx)?
            .map_or(RowValues::Null, |v| RowValues::Text(v.to_string())),
        "bool" => row
            .try_get::<_, Option<bool>>(idx)?
            .map_or(RowValues::Null, RowValues::Bool),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map_or(RowValues::Null, RowValues::Timestamp),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map_or(RowValues::Null, |v| RowValues::Timestamp(v.naive_utc())),
        "date" => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map_or(RowValues::Null, RowValues::Timestamp),
        "json" | "jsonb" => row
            .try_get::<_, Option<Value>>(idx)?
            .map_or(RowValues::Null, RowValues::JSON),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map_or(RowValues::Null, RowValues::Blob),
        // text, varchar, bpchar, name and anything else that decodes as a string
        other => row
            .try_get::<_, Option<String>>(idx)
            .map_err(|e| unsupported(row, idx, other, &e))?
            .map_or(RowValues::Null, RowValues::Text),
    };
    Ok(value)
}

fn numeric_value(d: Decimal) -> RowValues {
    if d.scale() == 0 {
        if let Some(i) = d.to_i64() {
            return RowValues::Int(i);
        }
    }
    d.to_f64()
        .map_or_else(|| RowValues::Text(d.to_string()), RowValues::Float)
}

fn unsupported(row: &Row, idx: usize, type_name: &str, e: &tokio_postgres::Error) -> BrokerError {
    BrokerError::Execution(format!(
        "column {} has unsupported type {type_name}: {e}",
        row.columns()[idx].name()
    ))
}

fn extract_array(row: &Row, idx: usize, member: &Type) -> Result<RowValues, BrokerError> {
    match member.name() {
        "int2" => json_array::<i16, _>(row, idx, Value::from),
        "int4" => json_array::<i32, _>(row, idx, Value::from),
        "int8" => json_array::<i64, _>(row, idx, Value::from),
        "float4" => json_array::<f32, _>(row, idx, |v| Value::from(f64::from(v))),
        "float8" => json_array::<f64, _>(row, idx, Value::from),
        "numeric" => json_array::<Decimal, _>(row, idx, |v| numeric_value(v).to_json()),
        "bool" => json_array::<bool, _>(row, idx, Value::from),
        "uuid" => json_array::<Uuid, _>(row, idx, |v| Value::from(v.to_string())),
        "json" | "jsonb" => json_array::<Value, _>(row, idx, |v| v),
        other if <&str as tokio_postgres::types::ToSql>::accepts(member) => {
            json_array::<String, _>(row, idx, Value::from).map_err(|_| {
                BrokerError::Execution(format!(
                    "column {} has an unreadable {other}[] value",
                    row.columns()[idx].name()
                ))
            })
        }
        other => Err(BrokerError::Execution(format!(
            "column {} has unsupported type {other}[]",
            row.columns()[idx].name()
        ))),
    }
}

/// Decode a one-dimensional array column into a JSON array; SQL NULL elements
/// become JSON null.
fn json_array<'a, T, F>(row: &'a Row, idx: usize, to_json: F) -> Result<RowValues, BrokerError>
where
    T: FromSql<'a>,
    F: Fn(T) -> Value,
{
    let items = row.try_get::<_, Option<Vec<Option<T>>>>(idx)?;
    Ok(items.map_or(RowValues::Null, |items| {
        RowValues::JSON(Value::Array(
            items
                .into_iter()
                .map(|item| item.map_or(Value::Null, &to_json))
                .collect(),
        ))
    }))
}

/// Build a result set using statement metadata for column names.
///
/// # Errors
/// Returns errors from row value extraction.
pub fn build_result_set_from_statement(
    stmt: &Statement,
    rows: &[Row],
) -> Result<ResultSet, BrokerError> {
    let column_names: Vec<String> = stmt
        .columns()
        .iter()
        .map(|col| col.name().to_string())
        .collect();
    let column_count = column_names.len();

    let mut result_set = ResultSet::with_capacity(rows.len());
    result_set.set_column_names(Arc::new(column_names));

    for row in rows {
        let mut row_values = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            row_values.push(postgres_extract_value(row, idx)?);
        }
        result_set.add_row_values(row_values);
    }

    Ok(result_set)
}
