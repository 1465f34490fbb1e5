#![cfg(feature = "test-utils")]

use std::time::Duration;

use chrono::NaiveDate;
use serde_json::json;
use tunnel_broker::prelude::*;
use tunnel_broker::test_utils::{setup_postgres_embedded, stop_postgres_embedded};

async fn executor_for(
    pg: &tunnel_broker::test_utils::EmbeddedPostgres,
) -> Result<QueryExecutor, BrokerError> {
    let settings = PoolSettings {
        max_size: 2,
        acquire_timeout: Some(Duration::from_secs(5)),
        ..PoolSettings::default()
    };
    let pool = ConnectionPool::connect(pg.dial_target(), &settings).await?;
    Ok(QueryExecutor::new(pool, true))
}

async fn count(exec: &QueryExecutor, table: &str) -> i64 {
    let rows = exec
        .execute(QueryRequest::fetch(format!("SELECT count(*) AS n FROM {table}")))
        .await
        .into_rows()
        .expect("count query succeeds");
    *rows.results[0].get("n").and_then(RowValues::as_int).expect("count is an integer")
}

#[test]
fn fetch_commit_and_execute_modes() -> Result<(), Box<dyn std::error::Error>> {
    let pg = setup_postgres_embedded("exec_modes")?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let exec = executor_for(&pg).await?;

        let outcome = exec.execute(QueryRequest::fetch("SELECT 1 AS x").label("w1")).await;
        let rows = outcome.rows().expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.results[0].get("x"), Some(&RowValues::Int(1)));

        let created = exec
            .execute(QueryRequest::execute(
                "CREATE TABLE t (id INT PRIMARY KEY, note TEXT, score FLOAT8, seen TIMESTAMP, \
                 meta JSONB)",
            ))
            .await;
        assert_eq!(created.row_count(), Some(0));

        let seen = NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(12, 30, 0))
            .expect("valid timestamp");
        let insert = "INSERT INTO t (id, note, score, seen, meta) VALUES (%s, %s, %s, %s, %s)";
        let inserted = exec
            .execute(
                QueryRequest::commit(insert)
                    .params(vec![
                        RowValues::Int(5),
                        RowValues::Text("five".into()),
                        RowValues::Float(2.5),
                        RowValues::Timestamp(seen),
                        RowValues::JSON(json!({"source": "test"})),
                    ])
                    .label("w1"),
            )
            .await;
        assert_eq!(inserted.row_count(), Some(1));

        let fetched = exec
            .execute(
                QueryRequest::fetch("SELECT * FROM t WHERE id = %s").params([RowValues::Int(5)]),
            )
            .await
            .into_rows()
            .expect("rows");
        let row = fetched.first().expect("one row");
        assert_eq!(row.get("id"), Some(&RowValues::Int(5)));
        assert_eq!(row.get("note").and_then(RowValues::as_text), Some("five"));
        assert_eq!(row.get("score").and_then(RowValues::as_float), Some(2.5));
        assert_eq!(row.get("seen").and_then(RowValues::as_timestamp), Some(seen));
        assert_eq!(row.get("meta"), Some(&RowValues::JSON(json!({"source": "test"}))));

        let updated = exec
            .execute(QueryRequest::execute("UPDATE t SET note = %s WHERE id > %s").params(vec![
                RowValues::Null,
                RowValues::Int(0),
            ]))
            .await;
        assert_eq!(updated.row_count(), Some(1));

        let empty = exec
            .execute(
                QueryRequest::fetch("SELECT id FROM t WHERE id = %s").params([RowValues::Int(99)]),
            )
            .await;
        assert!(empty.rows().is_some_and(ResultSet::is_empty));

        assert_eq!(exec.pool().checked_out(), 0);
        exec.pool().close_all();
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    stop_postgres_embedded(pg);
    Ok(())
}

#[test]
fn failed_commit_rolls_back_and_returns_no_result() -> Result<(), Box<dyn std::error::Error>> {
    let pg = setup_postgres_embedded("exec_rollback")?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let exec = executor_for(&pg).await?;
        exec.execute(QueryRequest::execute("CREATE TABLE t (id INT PRIMARY KEY)")).await;

        // The duplicate key fails the whole statement, so neither row may survive.
        let outcome = exec
            .execute(
                QueryRequest::commit("INSERT INTO t (id) VALUES (%s), (%s)")
                    .params(vec![RowValues::Int(1), RowValues::Int(1)])
                    .label("w2"),
            )
            .await;
        assert!(outcome.is_no_result());
        assert_eq!(count(&exec, "t").await, 0);

        let err = exec
            .try_execute(QueryRequest::commit("INSERT INTO t (id) VALUES ('not a number')"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Query(_)));

        // The connection that ran the failed transaction is usable again.
        let ok = exec
            .execute(
                QueryRequest::commit("INSERT INTO t (id) VALUES (%s)").params([RowValues::Int(2)]),
            )
            .await;
        assert_eq!(ok.row_count(), Some(1));
        assert_eq!(count(&exec, "t").await, 1);
        assert_eq!(exec.pool().checked_out(), 0);

        exec.pool().close_all();
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    stop_postgres_embedded(pg);
    Ok(())
}

#[test]
fn errors_are_contained_as_no_result() -> Result<(), Box<dyn std::error::Error>> {
    let pg = setup_postgres_embedded("exec_contained")?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let exec = executor_for(&pg).await?;

        assert!(exec.execute(QueryRequest::fetch("SELEC 1")).await.is_no_result());
        assert!(
            exec.execute_named(Some("w3"), "SELECT 1", &[], "fetchall")
                .await
                .is_no_result()
        );
        assert!(
            exec.execute_named(Some("w3"), "SELECT 1 AS x", &[], " Fetch ")
                .await
                .rows()
                .is_some()
        );

        // Without translation the server sees a literal %s and rejects it.
        let raw = QueryRequest::fetch("SELECT %s AS x")
            .params([RowValues::Int(1)])
            .translation(TranslationMode::ForceOff);
        assert!(exec.execute(raw).await.is_no_result());

        let native = QueryRequest::fetch("SELECT $1::INT8 AS x").params([RowValues::Int(7)]);
        let rows = exec.execute(native).await.into_rows().expect("rows");
        assert_eq!(rows.results[0].get("x"), Some(&RowValues::Int(7)));

        assert_eq!(exec.pool().checked_out(), 0);

        exec.pool().close_all();
        let closed = exec.try_execute(QueryRequest::fetch("SELECT 1")).await.unwrap_err();
        assert!(matches!(closed, BrokerError::PoolClosed));
        assert!(exec.execute(QueryRequest::fetch("SELECT 1")).await.is_no_result());
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    stop_postgres_embedded(pg);
    Ok(())
}

#[test]
fn values_are_converted_to_the_column_type() -> Result<(), Box<dyn std::error::Error>> {
    let pg = setup_postgres_embedded("exec_conversions")?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let exec = executor_for(&pg).await?;
        exec.execute(QueryRequest::execute(
            "CREATE TABLE p (id INT PRIMARY KEY, score FLOAT8, label TEXT, \
             amount NUMERIC(10, 2), token UUID, tags TEXT[] DEFAULT ARRAY['a', 'b'], \
             counts INT4[] DEFAULT ARRAY[1, NULL, 3])",
        ))
        .await;

        let token = "6f1c1a5e-8a52-4f3e-9d0c-6a0e2a3b9c11";
        let insert = "INSERT INTO p (id, score, label, amount, token) VALUES (%s, %s, %s, %s, %s)";
        let first = exec
            .execute(QueryRequest::commit(insert).params(vec![
                RowValues::Int(1),
                RowValues::Int(5),
                RowValues::Int(7),
                RowValues::Float(0.5),
                RowValues::Text(token.into()),
            ]))
            .await;
        assert_eq!(first.row_count(), Some(1));
        let second = exec
            .execute(QueryRequest::commit(insert).params(vec![
                RowValues::Float(2.0),
                RowValues::Float(1.25),
                RowValues::Bool(true),
                RowValues::Int(3),
                RowValues::Null,
            ]))
            .await;
        assert_eq!(second.row_count(), Some(1));

        // A fractional float cannot become an INT key; nothing is written.
        let lossy = exec
            .execute(QueryRequest::commit(insert).params(vec![
                RowValues::Float(2.5),
                RowValues::Null,
                RowValues::Null,
                RowValues::Null,
                RowValues::Null,
            ]))
            .await;
        assert!(lossy.is_no_result());
        assert_eq!(count(&exec, "p").await, 2);

        let rows = exec
            .execute(QueryRequest::fetch("SELECT * FROM p ORDER BY id"))
            .await
            .into_rows()
            .expect("rows");
        let one = &rows.results[0];
        assert_eq!(one.get("score"), Some(&RowValues::Float(5.0)));
        assert_eq!(one.get("label").and_then(RowValues::as_text), Some("7"));
        assert_eq!(one.get("amount"), Some(&RowValues::Float(0.5)));
        assert_eq!(one.get("token").and_then(RowValues::as_text), Some(token));
        assert_eq!(one.get("tags"), Some(&RowValues::JSON(json!(["a", "b"]))));
        assert_eq!(one.get("counts"), Some(&RowValues::JSON(json!([1, null, 3]))));
        let two = &rows.results[1];
        assert_eq!(two.get("id"), Some(&RowValues::Int(2)));
        assert_eq!(two.get("label").and_then(RowValues::as_text), Some("true"));
        assert_eq!(two.get("amount"), Some(&RowValues::Float(3.0)));
        assert_eq!(two.get("token"), Some(&RowValues::Null));

        let aggregates = exec
            .execute(QueryRequest::fetch(
                "SELECT avg(id) AS mean, sum(id::INT8) AS total, gen_random_uuid() AS fresh FROM p",
            ))
            .await
            .into_rows()
            .expect("aggregates over numeric and uuid columns are readable");
        let row = aggregates.first().expect("one row");
        assert_eq!(row.get("mean"), Some(&RowValues::Float(1.5)));
        assert_eq!(row.get("total"), Some(&RowValues::Int(3)));
        assert_eq!(row.get("fresh").and_then(RowValues::as_text).map(str::len), Some(36));

        assert_eq!(exec.pool().checked_out(), 0);
        exec.pool().close_all();
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    stop_postgres_embedded(pg);
    Ok(())
}
