//! Runs against a real bastion. Set the usual `SSH_*`/`DB_*` variables (or a `.env`
//! file) and run with `cargo test -- --ignored`.

use std::sync::Arc;
use std::thread;

use tunnel_broker::prelude::*;

#[test]
#[ignore = "needs a reachable SSH bastion and database"]
fn global_broker_over_a_real_tunnel() {
    let broker = tunnel_broker::instance().expect("broker starts from the environment");
    let again = tunnel_broker::instance().expect("second call reuses the broker");
    assert!(Arc::ptr_eq(&broker, &again));

    let status = broker.status();
    assert!(status.tunnel_running);
    assert!(status.local_port.is_some());

    let workers: Vec<_> = (0..4)
        .map(|i| {
            thread::spawn(move || {
                let broker = tunnel_broker::instance().expect("shared broker");
                let label = format!("worker-{i}");
                broker.execute(
                    Some(label.as_str()),
                    "SELECT %s::INT8 AS x",
                    &[RowValues::Int(i)],
                    OperationMode::Fetch,
                )
            })
        })
        .collect();
    for (i, worker) in workers.into_iter().enumerate() {
        let outcome = worker.join().expect("worker thread");
        let rows = outcome.rows().expect("rows");
        let expected = RowValues::Int(i64::try_from(i).expect("small index"));
        assert_eq!(rows.results[0].get("x"), Some(&expected));
    }
    assert_eq!(broker.status().pool.checked_out, 0);

    tunnel_broker::shutdown();
    tunnel_broker::shutdown();
    assert!(broker.is_closed());
    assert!(!broker.status().tunnel_running);
    assert!(
        broker
            .execute(None, "SELECT 1", &[], OperationMode::Fetch)
            .is_no_result()
    );

    let fresh = tunnel_broker::instance().expect("broker restarts after shutdown");
    assert!(!Arc::ptr_eq(&broker, &fresh));
    tunnel_broker::shutdown();
}
