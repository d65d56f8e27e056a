//! Kernel-dispatch scenarios: failure isolation, unknown kernels, and the
//! fatality of misrouted dispatch.

mod common;

use std::collections::HashMap;

use common::{key_owned_by, shard_of, TestCluster, IO_TIMEOUT};
use tessella_worker::plugins::decode_i64;
use tessella_worker::rpc;

const NUM_SHARDS: usize = 4;

#[tokio::test]
async fn failed_kernel_preserves_buffered_updates() {
    let cluster = TestCluster::start(2).await;
    cluster.create_table(1, NUM_SHARDS as i32, "replace").await;

    let key = key_owned_by(NUM_SHARDS, 2, 1, "f");
    let key_str = String::from_utf8(key.clone()).unwrap();
    let kernel_shard = (0..NUM_SHARDS)
        .find(|shard| cluster.owner_of_shard(*shard) == 0)
        .unwrap() as i32;

    let resp = cluster
        .run_kernel(
            0,
            1,
            kernel_shard,
            "update-then-fail",
            &[("key", &key_str), ("value", "10")],
        )
        .await;
    assert!(resp.error.contains("induced mid-run failure"));
    assert!(resp.elapsed_seconds >= 0.0);

    // The worker stayed healthy and the buffered update survived the
    // failure: an explicit flush still delivers it.
    cluster.flush(0).await;
    let owner_view = cluster
        .get(1, 1, shard_of(&key, NUM_SHARDS) as i32, &key)
        .await;
    assert!(!owner_view.missing_key);
    assert_eq!(decode_i64(&owner_view.kv_data[0].value), Some(10));

    cluster.shutdown_all().await;
}

#[tokio::test]
async fn unknown_kernel_is_reported_not_fatal() {
    let cluster = TestCluster::start(1).await;
    cluster.create_table(1, 1, "replace").await;

    let resp = cluster
        .run_kernel(0, 1, 0, "no-such-kernel", &[])
        .await;
    assert!(resp.error.contains("unknown kernel"));

    // The worker still serves requests afterwards.
    let data = cluster.get(0, 1, 0, b"anything").await;
    assert!(data.missing_key);

    cluster.shutdown_all().await;
}

#[tokio::test]
async fn misrouted_kernel_dispatch_is_fatal() {
    let mut cluster = TestCluster::start(2).await;
    cluster.create_table(1, NUM_SHARDS as i32, "replace").await;

    // Shard 0 is worker-0-owned; dispatch its kernel to worker 1.
    let err = cluster
        .client(1)
        .run_kernel(rpc::RunKernelReq {
            table: 1,
            shard: 0,
            kernel: "update".into(),
            kernel_args: HashMap::new(),
            task_args: HashMap::from([
                ("key".to_string(), "poison".to_string()),
                ("value".to_string(), "1".to_string()),
            ]),
        })
        .await
        .expect_err("misrouted dispatch must be rejected");
    assert_eq!(err.code(), tonic::Code::FailedPrecondition);

    // The misrouted worker terminates with a non-zero exit code without
    // having run the kernel.
    let victim = cluster.workers.remove(1);
    let code = tokio::time::timeout(IO_TIMEOUT, victim.wait_for_shutdown())
        .await
        .expect("worker exits in time")
        .expect("worker exits");
    assert_ne!(code, 0);

    let untouched = cluster
        .get(0, 1, shard_of(b"poison", NUM_SHARDS) as i32, b"poison")
        .await;
    assert!(untouched.missing_key);
}
