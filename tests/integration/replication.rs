#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use strata::storage::{
    BTreeMap, LeafPageMovePlan, LocalCluster, MapOptions, RunMode, Storage, StorageConfig,
};
use strata::types::{HostId, Result, StrataError};

const IDLE: Duration = Duration::from_secs(10);

struct Node {
    storage: Arc<Storage>,
    orders: BTreeMap<u64, String>,
}

fn node(cluster: &Arc<LocalCluster>, host: &str, mode: RunMode) -> Result<Node> {
    let config = StorageConfig::in_memory()
        .handler_count(2)
        .page_split_size(1024)
        .run_mode(mode, host);
    let storage = Arc::new(Storage::open(config)?);
    let orders = storage.open_map("orders", &MapOptions::new())?;
    cluster.join(host, &storage);
    Ok(Node { storage, orders })
}

fn hosts(names: &[&str]) -> Vec<HostId> {
    names.iter().map(|name| name.to_string()).collect()
}

fn is_remote_on(result: Result<Option<String>>, host: &str) -> bool {
    matches!(result, Err(StrataError::RemotePage(hosts)) if hosts == [host.to_string()])
}

#[test]
fn sharded_scale_in_moves_every_leaf() -> Result<()> {
    let cluster = LocalCluster::new();
    let leaving = node(&cluster, "n1", RunMode::Sharding)?;
    let staying = node(&cluster, "n2", RunMode::Sharding)?;
    for key in 0..500 {
        leaving.orders.put(key, format!("order-{key}"))?;
    }
    assert!(leaving.orders.wait_idle(IDLE));
    let leaves = leaving.orders.shape().leaves;
    assert!(leaves > 1);

    let moved = leaving
        .storage
        .scale_in(RunMode::Sharding, &hosts(&["n1", "n2"]), &hosts(&["n2"]))?;
    assert_eq!(moved, leaves);
    assert_eq!(staying.orders.len(), 500);
    assert_eq!(staying.orders.get(&250)?, Some("order-250".to_string()));
    assert_eq!(leaving.orders.len(), 0);
    assert_eq!(leaving.orders.shape().leaves, 0);

    assert!(is_remote_on(leaving.orders.get(&250), "n2"));
    // Writes against the moved range are delegated to the new owner.
    assert_eq!(
        leaving.orders.put(250, "changed".to_string())?,
        Some("order-250".to_string())
    );
    assert_eq!(leaving.orders.put(9_999, "late".to_string())?, None);
    assert_eq!(staying.orders.get(&250)?, Some("changed".to_string()));
    assert_eq!(staying.orders.get(&9_999)?, Some("late".to_string()));
    assert_eq!(leaving.orders.remove(0)?, Some("order-0".to_string()));
    assert_eq!(staying.orders.get(&0)?, None);
    Ok(())
}

#[test]
fn scale_in_is_a_no_op_outside_sharding() -> Result<()> {
    let cluster = LocalCluster::new();
    let first = node(&cluster, "n1", RunMode::Replication)?;
    let _second = node(&cluster, "n2", RunMode::Replication)?;
    first.orders.put(1, "a".to_string())?;
    let moved = first
        .storage
        .scale_in(RunMode::Replication, &hosts(&["n1", "n2"]), &hosts(&["n2"]))?;
    assert_eq!(moved, 0);
    assert_eq!(first.orders.get(&1)?, Some("a".to_string()));
    Ok(())
}

#[test]
fn scale_out_ships_root_pages() -> Result<()> {
    let cluster = LocalCluster::new();
    let source = node(&cluster, "n1", RunMode::Sharding)?;
    let target = node(&cluster, "n2", RunMode::Sharding)?;
    for key in 0..400 {
        source.orders.put(key, format!("v{key}"))?;
    }
    assert!(source.orders.wait_idle(IDLE));
    assert!(source.orders.shape().nodes >= 1);

    source.storage.scale_out(&hosts(&["n2"]))?;
    // The new node knows the key ranges but holds no rows itself.
    let shape = target.orders.shape();
    assert_eq!(shape.leaves, 0);
    assert!(shape.remotes > 1, "{shape:?}");
    assert!(is_remote_on(target.orders.get(&10), "n1"));

    assert_eq!(target.orders.put(10, "via n2".to_string())?, Some("v10".to_string()));
    assert_eq!(source.orders.get(&10)?, Some("via n2".to_string()));
    Ok(())
}

#[test]
fn single_leaf_root_is_copied_whole() -> Result<()> {
    let cluster = LocalCluster::new();
    let source = node(&cluster, "n1", RunMode::Replication)?;
    let target = node(&cluster, "n2", RunMode::Replication)?;
    for key in 0..5 {
        source.orders.put(key, format!("v{key}"))?;
    }
    source.storage.scale_out(&hosts(&["n2"]))?;
    assert_eq!(target.orders.get(&3)?, Some("v3".to_string()));
    assert_eq!(target.orders.shape().leaves, 1);
    Ok(())
}

#[test]
fn planned_leaf_forwards_writes_until_finalized() -> Result<()> {
    let cluster = LocalCluster::new();
    let owner = node(&cluster, "n1", RunMode::Sharding)?;
    let receiver = node(&cluster, "n2", RunMode::Sharding)?;
    for key in 0..20 {
        owner.orders.put(key, format!("v{key}"))?;
    }

    let plan = owner
        .orders
        .plan_leaf_move(&5, LeafPageMovePlan::new("n1", hosts(&["n2"])))?;
    assert_eq!(plan.replication_hosts, hosts(&["n2"]));
    assert_eq!(receiver.orders.get(&5)?, Some("v5".to_string()));

    // A rival plan from another mover loses the first round.
    let rival = owner
        .orders
        .plan_leaf_move(&5, LeafPageMovePlan::new("n3", hosts(&["n3"])))?;
    assert_eq!(rival.moving_host, "n1");

    owner.orders.put(5, "moved".to_string())?;
    assert_eq!(receiver.orders.get(&5)?, Some("moved".to_string()));
    // Reads stay local until the move is finalized.
    assert_eq!(owner.orders.get(&5)?, Some("v5".to_string()));

    assert!(owner.orders.finalize_leaf_move(&5)?);
    assert!(is_remote_on(owner.orders.get(&5), "n2"));
    assert!(!owner.orders.finalize_leaf_move(&5)?);
    Ok(())
}

#[test]
fn leaving_node_rejects_delegated_writes() -> Result<()> {
    let cluster = LocalCluster::new();
    let leaving = node(&cluster, "n1", RunMode::Sharding)?;
    let staying = node(&cluster, "n2", RunMode::Sharding)?;
    leaving.orders.put(1, "one".to_string())?;
    leaving
        .storage
        .scale_in(RunMode::Sharding, &hosts(&["n1", "n2"]), &hosts(&["n2"]))?;
    cluster.leave("n2");
    drop(staying);
    assert!(leaving.orders.put(1, "again".to_string()).is_err());
    Ok(())
}
