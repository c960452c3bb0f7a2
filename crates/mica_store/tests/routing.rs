//! Failure-path routing: stale caches, dead sessions, and unreachable
//! servers must converge (or fail cleanly) through the retry machinery.

mod common;

use common::{full_tablet, indexlet_record, Cluster};
use mica_rpc::wire::Status;
use mica_rpc::wrapper::RpcError;
use mica_store::master_client;
use mica_store::object_finder::{TableConfig, TabletState};

const TABLE: u64 = 1;
const INDEX: u8 = 0;

#[tokio::test]
async fn stale_route_converges_after_migration() -> anyhow::Result<()> {
    let cluster = Cluster::new(2);
    // The indexlet actually lives on master 2...
    master_client::take_indexlet_ownership(&cluster.context, 2, TABLE, INDEX, 10, b"\x00", b"\xff")
        .await?;
    // ...but the first coordinator snapshot (mis)routes it to master 1.
    cluster.coordinator.set_table_config(
        TABLE,
        TableConfig {
            tablets: vec![full_tablet(1, TABLE, TabletState::Normal)],
            indexlets: vec![indexlet_record(1, TABLE, INDEX, b"\x00", b"\xff")],
        },
    );
    // Warm the cache with the stale route.
    let stale = cluster
        .finder
        .lookup_indexlet(TABLE, INDEX, b"apple")
        .await?
        .expect("stale record cached");
    assert_eq!(stale.server_id, 1);
    let fetches_before = cluster.coordinator.calls();
    let sends_before = cluster.transport.completed_count();

    // The migration lands in the coordinator.
    cluster.coordinator.set_table_config(
        TABLE,
        TableConfig {
            tablets: vec![full_tablet(2, TABLE, TabletState::Normal)],
            indexlets: vec![indexlet_record(2, TABLE, INDEX, b"\x00", b"\xff")],
        },
    );

    // First attempt hits master 1, draws UNKNOWN_INDEXLET, flushes,
    // refetches, and lands on master 2.
    assert!(master_client::insert_index_entry(&cluster.finder, TABLE, INDEX, b"apple", 7).await?);
    assert_eq!(cluster.coordinator.calls(), fetches_before + 1);
    // One rejected attempt on master 1, one successful attempt on master 2.
    assert_eq!(cluster.transport.completed_count(), sends_before + 2);

    let page = master_client::lookup_index_keys(&cluster.finder, TABLE, INDEX, b"a", 0, b"b", 16)
        .await?
        .expect("index exists");
    assert_eq!(page.hashes, vec![7]);
    Ok(())
}

#[tokio::test]
async fn dead_session_is_flushed_and_retried() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    master_client::take_indexlet_ownership(&cluster.context, 1, TABLE, INDEX, 10, b"\x00", b"\xff")
        .await?;
    cluster.coordinator.set_table_config(
        TABLE,
        TableConfig {
            tablets: vec![full_tablet(1, TABLE, TabletState::Normal)],
            indexlets: vec![indexlet_record(1, TABLE, INDEX, b"\x00", b"\xff")],
        },
    );

    cluster.transport.fail_next("connection reset");
    assert!(master_client::insert_index_entry(&cluster.finder, TABLE, INDEX, b"apple", 7).await?);
    assert_eq!(cluster.transport.failed_count(), 1);

    let page = master_client::lookup_index_keys(&cluster.finder, TABLE, INDEX, b"a", 0, b"b", 16)
        .await?
        .expect("index exists");
    assert_eq!(page.hashes, vec![7]);
    Ok(())
}

#[tokio::test]
async fn server_id_rpc_retries_transport_errors_while_target_is_up() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    cluster.transport.fail_next("connection reset");
    master_client::take_tablet_ownership(&cluster.context, 1, 5, 0, u64::MAX).await?;
    assert_eq!(cluster.transport.failed_count(), 1);
    assert!(cluster.master(1).tablets().owns(5, 12345));

    master_client::drop_tablet_ownership(&cluster.context, 1, 5, 0, u64::MAX).await?;
    assert!(!cluster.master(1).tablets().owns(5, 12345));
    Ok(())
}

#[tokio::test]
async fn crashed_or_unknown_server_fails_with_server_not_up() {
    let cluster = Cluster::new(2);
    cluster.context.server_list.mark_crashed(2);
    let err = master_client::take_tablet_ownership(&cluster.context, 2, 5, 0, u64::MAX)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::ServerNotUp));

    let err = master_client::take_tablet_ownership(&cluster.context, 99, 5, 0, u64::MAX)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::ServerNotUp));
}

#[tokio::test]
async fn remote_rejections_carry_their_status() -> anyhow::Result<()> {
    let cluster = Cluster::new(1);
    master_client::take_indexlet_ownership(&cluster.context, 1, TABLE, INDEX, 10, b"a", b"m")
        .await?;

    // Overlapping ownership is rejected by the master.
    let err =
        master_client::take_indexlet_ownership(&cluster.context, 1, TABLE, INDEX, 11, b"b", b"z")
            .await
            .unwrap_err();
    assert!(matches!(err, RpcError::Remote(Status::InternalError)));

    // Dropping a range nobody owns names the missing indexlet.
    let err =
        master_client::drop_indexlet_ownership(&cluster.context, 1, TABLE, INDEX, b"x", b"z")
            .await
            .unwrap_err();
    assert!(matches!(err, RpcError::Remote(Status::UnknownIndexlet)));

    let err = master_client::drop_tablet_ownership(&cluster.context, 1, 5, 0, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(Status::UnknownTablet)));
    Ok(())
}
