//! Cluster storage over in-process partitions.

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{download, open_store, upload, FlakyStore};
use shale::cluster::{
    ClusterCrdtStorage, ConnectionFactory, PartitionScheme, RendezvousPartitionGroup,
    StaticDiscovery,
};
use shale::storage::{CrdtStore, LocalCrdtStorage, StoreError};
use shale::Lww;
use tempfile::TempDir;

struct Cluster {
    storage: ClusterCrdtStorage<u64, String, String>,
    nodes: BTreeMap<String, LocalCrdtStorage<u64, String>>,
    kill_switches: BTreeMap<String, Arc<AtomicBool>>,
    scheme: PartitionScheme<String>,
    _dirs: Vec<TempDir>,
}

fn cluster(names: &[&str], replication: usize, min_active: usize) -> Cluster {
    let mut nodes = BTreeMap::new();
    let mut kill_switches = BTreeMap::new();
    let mut wrapped: BTreeMap<String, Arc<FlakyStore>> = BTreeMap::new();
    let mut dirs = Vec::new();

    for name in names {
        let dir = TempDir::new().unwrap();
        let store = open_store(dir.path());
        let (flaky, dead) = FlakyStore::new(Arc::new(store.clone()));
        nodes.insert(name.to_string(), store);
        kill_switches.insert(name.to_string(), dead);
        wrapped.insert(name.to_string(), Arc::new(flaky));
        dirs.push(dir);
    }

    let scheme = PartitionScheme::new(vec![RendezvousPartitionGroup::new(
        names.iter().map(|n| n.to_string()).collect::<BTreeSet<_>>(),
        replication,
    )
    .with_min_active(min_active)])
    .with_buckets(256);

    let factory: ConnectionFactory<u64, String, String> = {
        let wrapped = wrapped.clone();
        Arc::new(move |partition, _addr| {
            wrapped
                .get(partition)
                .map(|store| Arc::clone(store) as Arc<dyn CrdtStore<u64, String>>)
                .ok_or_else(|| StoreError::NotFound {
                    what: format!("partition {partition}"),
                })
        })
    };

    let storage = ClusterCrdtStorage::new(Arc::new(Lww), factory);
    storage.update_partition_scheme(scheme.clone());

    Cluster {
        storage,
        nodes,
        kill_switches,
        scheme,
        _dirs: dirs,
    }
}

impl Cluster {
    fn kill(&self, name: &str) {
        self.kill_switches[name].store(true, Ordering::SeqCst);
    }

    fn revive(&self, name: &str) {
        self.kill_switches[name].store(false, Ordering::SeqCst);
    }
}

#[test]
fn survives_one_node_outage_with_replication_two() {
    let cluster = cluster(&["n0", "n1", "n2"], 2, 2);

    let batch: Vec<(u64, u64, &str)> = (0..1000u64).map(|key| (key, 1, "v")).collect();
    upload(&cluster.storage, &batch);

    cluster.kill("n2");

    let got = download(&cluster.storage, 0);
    assert_eq!(got.len(), 1000);
    let keys: BTreeSet<u64> = got.iter().map(|(key, _, _)| *key).collect();
    assert_eq!(keys.len(), 1000);
}

#[test]
fn read_fails_below_threshold_and_recovers() {
    let cluster = cluster(&["n0", "n1", "n2"], 2, 2);
    upload(&cluster.storage, &[(1, 1, "a")]);

    cluster.kill("n1");
    cluster.kill("n2");
    let err = cluster.storage.download(0).err().expect("read must fail");
    assert!(matches!(err, StoreError::IncompleteCluster { .. }));

    cluster.revive("n1");
    assert_eq!(download(&cluster.storage, 0).len(), 1);
}

#[test]
fn write_fails_fast_when_cluster_is_incomplete() {
    let cluster = cluster(&["n0", "n1", "n2"], 2, 2);
    cluster.kill("n0");
    cluster.kill("n1");

    let err = cluster.storage.upload().err().expect("write must fail");
    assert!(matches!(err, StoreError::IncompleteCluster { .. }));
}

#[test]
fn writes_land_on_exactly_the_sharded_replicas() {
    let cluster = cluster(&["n0", "n1", "n2"], 2, 2);

    let batch: Vec<(u64, u64, &str)> = (0..200u64).map(|key| (key, 1, "v")).collect();
    upload(&cluster.storage, &batch);

    let alive: Vec<String> = cluster.nodes.keys().cloned().collect();
    let sharder = cluster.scheme.create_sharder(&alive).expect("sharder");

    let mut per_node: BTreeMap<&str, BTreeSet<u64>> = BTreeMap::new();
    for (name, node) in &cluster.nodes {
        per_node.insert(
            name,
            download(node, 0).into_iter().map(|(key, _, _)| key).collect(),
        );
    }

    for key in 0..200u64 {
        let expected: BTreeSet<&str> = sharder
            .shard(&key)
            .iter()
            .map(|index| alive[*index as usize].as_str())
            .collect();
        assert_eq!(expected.len(), 2);
        for (name, keys) in &per_node {
            assert_eq!(
                keys.contains(&key),
                expected.contains(name),
                "key {key} misplaced on {name}"
            );
        }
    }
}

#[test]
fn ping_reflects_cluster_health() {
    let cluster = cluster(&["n0", "n1", "n2"], 2, 2);
    cluster.storage.ping().expect("healthy");

    cluster.kill("n1");
    cluster.storage.ping().expect("one loss tolerated");

    cluster.kill("n2");
    assert!(matches!(
        cluster.storage.ping(),
        Err(StoreError::IncompleteCluster { .. })
    ));
}

#[test]
fn cluster_take_empties_every_replica() {
    let cluster = cluster(&["n0", "n1", "n2"], 2, 2);
    upload(&cluster.storage, &[(1, 1, "a"), (2, 1, "b"), (3, 1, "c")]);

    let mut session = cluster.storage.take().unwrap();
    let mut taken = Vec::new();
    while let Some(item) = session.next() {
        taken.push(item.unwrap().key);
    }
    session.commit().unwrap();

    assert_eq!(taken, vec![1, 2, 3]);
    assert!(download(&cluster.storage, 0).is_empty());
    for node in cluster.nodes.values() {
        assert!(download(node, 0).is_empty());
    }
}

#[test]
fn repartition_moves_keys_to_their_scheme_homes() {
    let cluster = cluster(&["n0", "n1", "n2"], 2, 2);

    // Data living only on n0, as if the scheme used to map it there.
    upload(&cluster.nodes["n0"], &[(1, 1, "one"), (2, 1, "two"), (3, 1, "three")]);

    let moved = cluster.storage.repartition(&"n0".to_string()).unwrap();
    assert_eq!(moved, 3);

    let alive: Vec<String> = cluster.nodes.keys().cloned().collect();
    let sharder = cluster.scheme.create_sharder(&alive).expect("sharder");

    for key in [1u64, 2, 3] {
        let expected: BTreeSet<&str> = sharder
            .shard(&key)
            .iter()
            .map(|index| alive[*index as usize].as_str())
            .collect();
        for (name, node) in &cluster.nodes {
            let present = download(node, 0).iter().any(|(k, _, _)| *k == key);
            assert_eq!(
                present,
                expected.contains(name.as_str()),
                "key {key} misplaced on {name} after repartition"
            );
        }
    }

    // The cluster view is unchanged.
    let keys: BTreeSet<u64> = download(&cluster.storage, 0)
        .into_iter()
        .map(|(key, _, _)| key)
        .collect();
    assert_eq!(keys, BTreeSet::from([1, 2, 3]));
}

#[test]
fn repartition_aborts_cleanly_when_source_is_down() {
    let cluster = cluster(&["n0", "n1", "n2"], 2, 2);
    upload(&cluster.nodes["n0"], &[(1, 1, "one")]);

    cluster.kill("n0");
    let err = cluster
        .storage
        .repartition(&"n0".to_string())
        .err()
        .expect("must abort");
    assert!(matches!(err, StoreError::IncompleteCluster { .. }));

    cluster.revive("n0");
    assert_eq!(download(&cluster.nodes["n0"], 0).len(), 1);
}

#[test]
fn discovery_start_requires_valid_cluster_unless_forced() {
    let cluster = cluster(&["n0", "n1", "n2"], 2, 2);
    cluster.kill("n0");
    cluster.kill("n1");

    let discovery = StaticDiscovery::new(cluster.scheme.clone());
    let err = cluster.storage.start(&discovery, false).err().expect("must fail");
    assert!(matches!(err, StoreError::IncompleteCluster { .. }));

    let discovery = StaticDiscovery::new(cluster.scheme.clone());
    let handle = cluster
        .storage
        .start(&discovery, true)
        .expect("force start");
    handle.shutdown();
}
