use std::error::Error;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde_json::Value;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_util::bytes;
use uuid::Uuid;

use crate::types::RowValues;

type BindResult = Result<IsNull, Box<dyn Error + Sync + Send>>;

/// Borrowed view of `RowValues` as driver parameters.
pub struct Params<'a> {
    references: Vec<&'a (dyn ToSql + Sync)>,
}

impl<'a> Params<'a> {
    #[must_use]
    pub fn convert(params: &'a [RowValues]) -> Params<'a> {
        let mut references = Vec::with_capacity(params.len());
        for p in params {
            references.push(p as &(dyn ToSql + Sync));
        }
        Params { references }
    }

    /// Get a reference to the underlying parameter array
    #[must_use]
    pub fn as_refs(&self) -> &[&(dyn ToSql + Sync)] {
        &self.references
    }
}

/// Types a `String` binds to: text, varchar, bpchar, name, unknown and the
/// text-like extension types.
fn is_text(ty: &Type) -> bool {
    <&str as ToSql>::accepts(ty)
}

fn mismatch(value: &RowValues, ty: &Type) -> Box<dyn Error + Sync + Send> {
    format!("cannot bind a {} value to a {ty} parameter", value.kind_name()).into()
}

fn bind_int(i: i64, ty: &Type, out: &mut bytes::BytesMut) -> BindResult {
    match *ty {
        Type::INT2 => i16::try_from(i)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(i)?.to_sql(ty, out),
        Type::INT8 => i.to_sql(ty, out),
        #[allow(clippy::cast_precision_loss)]
        Type::FLOAT4 => (i as f32).to_sql(ty, out),
        #[allow(clippy::cast_precision_loss)]
        Type::FLOAT8 => (i as f64).to_sql(ty, out),
        Type::NUMERIC => Decimal::from(i).to_sql(ty, out),
        _ if is_text(ty) => i.to_string().to_sql(ty, out),
        _ => Err(mismatch(&RowValues::Int(i), ty)),
    }
}

fn bind_float(f: f64, ty: &Type, out: &mut bytes::BytesMut) -> BindResult {
    match *ty {
        #[allow(clippy::cast_possible_truncation)]
        Type::FLOAT4 => (f as f32).to_sql(ty, out),
        Type::FLOAT8 => f.to_sql(ty, out),
        Type::NUMERIC => Decimal::from_f64(f)
            .ok_or_else(|| format!("{f} has no numeric representation"))?
            .to_sql(ty, out),
        Type::INT2 | Type::INT4 | Type::INT8 => bind_int(integral(f)?, ty, out),
        _ if is_text(ty) => f.to_string().to_sql(ty, out),
        _ => Err(mismatch(&RowValues::Float(f), ty)),
    }
}

/// `f` as an `i64` when it has no fractional part and fits.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn integral(f: f64) -> Result<i64, Box<dyn Error + Sync + Send>> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Ok(f as i64)
    } else {
        Err(format!("{f} is not an integer").into())
    }
}

fn bind_text(s: &str, ty: &Type, out: &mut bytes::BytesMut) -> BindResult {
    if is_text(ty) {
        return s.to_sql(ty, out);
    }
    let raw = s.trim();
    match *ty {
        Type::INT2 | Type::INT4 | Type::INT8 => bind_int(raw.parse()?, ty, out),
        Type::FLOAT4 | Type::FLOAT8 => bind_float(raw.parse()?, ty, out),
        Type::NUMERIC => raw.parse::<Decimal>()?.to_sql(ty, out),
        Type::UUID => Uuid::parse_str(raw)?.to_sql(ty, out),
        Type::BOOL => raw.parse::<bool>()?.to_sql(ty, out),
        Type::JSON | Type::JSONB => serde_json::from_str::<Value>(s)?.to_sql(ty, out),
        _ => Err(mismatch(&RowValues::Text(s.to_string()), ty)),
    }
}

fn bind_timestamp(dt: &NaiveDateTime, ty: &Type, out: &mut bytes::BytesMut) -> BindResult {
    match *ty {
        Type::TIMESTAMP => dt.to_sql(ty, out),
        Type::TIMESTAMPTZ => dt.and_utc().to_sql(ty, out),
        Type::DATE => dt.date().to_sql(ty, out),
        _ if is_text(ty) => dt.to_string().to_sql(ty, out),
        _ => Err(mismatch(&RowValues::Timestamp(*dt), ty)),
    }
}

impl ToSql for RowValues {
    fn to_sql(&self, ty: &Type, out: &mut bytes::BytesMut) -> BindResult {
        match self {
            RowValues::Null => Ok(IsNull::Yes),
            RowValues::Int(i) => bind_int(*i, ty, out),
            RowValues::Float(f) => bind_float(*f, ty, out),
            RowValues::Text(s) => bind_text(s, ty, out),
            RowValues::Timestamp(dt) => bind_timestamp(dt, ty, out),
            RowValues::Bool(b) => match *ty {
                Type::BOOL => b.to_sql(ty, out),
                _ if is_text(ty) => b.to_string().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            RowValues::JSON(jsval) => match *ty {
                Type::JSON | Type::JSONB => jsval.to_sql(ty, out),
                _ if is_text(ty) => jsval.to_string().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            RowValues::Blob(bytes) => match *ty {
                Type::BYTEA => bytes.to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
        }
    }

    fn accepts(ty: &Type) -> bool {
        is_text(ty)
            || matches!(
                *ty,
                Type::INT2
                    | Type::INT4
                    | Type::INT8
                    | Type::FLOAT4
                    | Type::FLOAT8
                    | Type::NUMERIC
                    | Type::UUID
                    | Type::BOOL
                    | Type::TIMESTAMP
                    | Type::TIMESTAMPTZ
                    | Type::DATE
                    | Type::JSON
                    | Type::JSONB
                    | Type::BYTEA
            )
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(value: &RowValues, ty: &Type) -> Result<Vec<u8>, String> {
        let mut out = bytes::BytesMut::new();
        value.to_sql(ty, &mut out).map_err(|e| e.to_string())?;
        Ok(out.to_vec())
    }

    #[test]
    fn ints_are_encoded_for_the_column_type() {
        assert_eq!(bind(&RowValues::Int(5), &Type::FLOAT8).unwrap(), 5.0f64.to_be_bytes());
        assert_eq!(bind(&RowValues::Int(5), &Type::FLOAT4).unwrap(), 5.0f32.to_be_bytes());
        assert_eq!(bind(&RowValues::Int(5), &Type::INT2).unwrap(), 5i16.to_be_bytes());
        assert_eq!(bind(&RowValues::Int(7), &Type::TEXT).unwrap(), b"7");
        assert!(bind(&RowValues::Int(70_000), &Type::INT2).is_err());
    }

    #[test]
    fn floats_only_bind_to_integers_when_whole() {
        assert_eq!(bind(&RowValues::Float(3.0), &Type::INT4).unwrap(), 3i32.to_be_bytes());
        assert!(bind(&RowValues::Float(2.5), &Type::INT8).is_err());
        assert!(bind(&RowValues::Float(f64::NAN), &Type::INT8).is_err());
        assert_eq!(bind(&RowValues::Float(2.5), &Type::VARCHAR).unwrap(), b"2.5");
        assert!(bind(&RowValues::Float(0.5), &Type::NUMERIC).is_ok());
    }

    #[test]
    fn text_is_parsed_for_typed_columns() {
        let padded = RowValues::Text(" 12 ".into());
        assert_eq!(bind(&padded, &Type::INT8).unwrap(), 12i64.to_be_bytes());
        assert!(bind(&RowValues::Text("12.50".into()), &Type::NUMERIC).is_ok());
        let id = Uuid::new_v4();
        assert_eq!(
            bind(&RowValues::Text(id.to_string()), &Type::UUID).unwrap(),
            id.as_bytes()
        );
        assert!(bind(&RowValues::Text("twelve".into()), &Type::INT8).is_err());
    }

    #[test]
    fn bools_and_mismatches() {
        assert_eq!(bind(&RowValues::Bool(true), &Type::TEXT).unwrap(), b"true");
        let err = bind(&RowValues::Bool(true), &Type::INT4).unwrap_err();
        assert!(err.contains("cannot bind a bool value to a int4 parameter"), "{err}");
        assert!(bind(&RowValues::Blob(vec![1, 2]), &Type::TEXT).is_err());
        assert!(bind(&RowValues::Null, &Type::INT4).unwrap().is_empty());
    }

    #[test]
    fn accepts_numeric_and_uuid_but_not_single_char() {
        assert!(RowValues::accepts(&Type::NUMERIC));
        assert!(RowValues::accepts(&Type::UUID));
        assert!(RowValues::accepts(&Type::NAME));
        assert!(!RowValues::accepts(&Type::CHAR));
    }
}
