//! Cluster storage: the same five operations against remote peers, routed
//! by the partition scheme.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender};

use crate::core::{CrdtData, CrdtEntry, CrdtFunction, CrdtKey, CrdtState, CrdtTombstone};
use crate::metrics::{MetricsSnapshot, StoreMetrics};
use crate::storage::merge::{EntryStream, KWayMerge};
use crate::storage::{CrdtStore, DataStream, RemoveSink, StoreError, TakeSession, UploadSink};

use super::discovery::DiscoveryService;
use super::partition::{PartitionId, PartitionScheme, RendezvousSharder};

/// Builds the storage endpoint for one partition: remote client in
/// production, in-process store in tests.
pub type ConnectionFactory<K, S, P> =
    Arc<dyn Fn(&P, Option<&str>) -> Result<Arc<dyn CrdtStore<K, S>>, StoreError> + Send + Sync>;

struct ClusterState<K, S, P: Ord> {
    scheme: Option<Arc<PartitionScheme<P>>>,
    stores: BTreeMap<P, Arc<dyn CrdtStore<K, S>>>,
}

struct ClusterInner<K, S, P: Ord> {
    function: Arc<dyn CrdtFunction<S>>,
    factory: ConnectionFactory<K, S, P>,
    state: Mutex<ClusterState<K, S, P>>,
    metrics: Arc<StoreMetrics>,
}

pub struct ClusterCrdtStorage<K, S, P: PartitionId> {
    inner: Arc<ClusterInner<K, S, P>>,
}

impl<K, S, P: PartitionId> Clone for ClusterCrdtStorage<K, S, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub struct ClusterHandle {
    shutdown: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl ClusterHandle {
    pub fn shutdown(mut self) {
        self.shutdown.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ClusterHandle {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl<K: CrdtKey, S: CrdtState, P: PartitionId> ClusterCrdtStorage<K, S, P> {
    pub fn new(function: Arc<dyn CrdtFunction<S>>, factory: ConnectionFactory<K, S, P>) -> Self {
        Self {
            inner: Arc::new(ClusterInner {
                function,
                factory,
                state: Mutex::new(ClusterState {
                    scheme: None,
                    stores: BTreeMap::new(),
                }),
                metrics: Arc::new(StoreMetrics::default()),
            }),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Wait for the first scheme, verify the cluster answers pings (unless
    /// `force_start`), then keep applying discovery ticks until shutdown.
    pub fn start(
        &self,
        discovery: &dyn DiscoveryService<P>,
        force_start: bool,
    ) -> Result<ClusterHandle, StoreError> {
        let updates = discovery.subscribe();
        let first = updates.recv().map_err(|_| StoreError::IncompleteCluster {
            reason: "discovery ended before delivering a scheme".to_string(),
        })?;
        self.update_partition_scheme(first);

        match self.ping() {
            Ok(()) => {}
            Err(err) if force_start => {
                tracing::warn!("force start despite failing initial ping: {}", err);
            }
            Err(err) => return Err(err),
        }

        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded::<()>(0);
        let cluster = self.clone();
        let join = thread::spawn(move || run_discovery_loop(cluster, updates, shutdown_rx));
        Ok(ClusterHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }

    /// Swap in a new scheme: keep connections whose partition id survives,
    /// connect the new ones. In-flight operations finish against the
    /// snapshot they captured.
    pub fn update_partition_scheme(&self, scheme: PartitionScheme<P>) {
        let partitions = scheme.partitions();
        let mut state = self.inner.state.lock().expect("cluster state lock poisoned");
        state.stores.retain(|partition, _| partitions.contains(partition));
        for partition in &partitions {
            if state.stores.contains_key(partition) {
                continue;
            }
            match (self.inner.factory)(partition, scheme.address_of(partition)) {
                Ok(store) => {
                    state.stores.insert(partition.clone(), store);
                }
                Err(err) => {
                    tracing::warn!(%partition, "partition connection failed: {}", err);
                }
            }
        }
        tracing::debug!(partitions = partitions.len(), "partition scheme updated");
        state.scheme = Some(Arc::new(scheme));
    }

    fn snapshot(
        &self,
    ) -> Result<(Arc<PartitionScheme<P>>, BTreeMap<P, Arc<dyn CrdtStore<K, S>>>), StoreError> {
        let state = self.inner.state.lock().expect("cluster state lock poisoned");
        let scheme = state.scheme.clone().ok_or_else(|| StoreError::IncompleteCluster {
            reason: "no partition scheme discovered yet".to_string(),
        })?;
        Ok((scheme, state.stores.clone()))
    }

    fn open_upload_sinks(
        &self,
        stores: &BTreeMap<P, Arc<dyn CrdtStore<K, S>>>,
    ) -> (Vec<P>, Vec<Box<dyn UploadSink<K, S>>>) {
        let mut alive = Vec::new();
        let mut sinks = Vec::new();
        for (partition, store) in stores {
            match store.upload() {
                Ok(sink) => {
                    alive.push(partition.clone());
                    sinks.push(sink);
                }
                Err(err) => {
                    tracing::warn!(%partition, "upload unavailable: {}", err);
                }
            }
        }
        (alive, sinks)
    }

    fn merged_read(
        &self,
        scheme: &PartitionScheme<P>,
        sources: Vec<EntryStream<K, S>>,
        responsive: Vec<P>,
    ) -> Result<DataStream<K, S>, StoreError> {
        if !scheme.is_read_valid(&responsive) {
            return Err(StoreError::IncompleteCluster {
                reason: format!(
                    "read threshold not met with {} responsive partitions",
                    responsive.len()
                ),
            });
        }
        let merged = KWayMerge::new(Arc::clone(&self.inner.function), sources)?;
        Ok(Box::new(merged.filter_map(|item| match item {
            Ok(entry) => entry.into_data().map(Ok),
            Err(err) => Some(Err(err)),
        })))
    }

    /// Drain one partition's local content and push it back through the
    /// cluster write path, letting the current scheme redistribute it.
    pub fn repartition(&self, source: &P) -> Result<u64, StoreError> {
        let (scheme, stores) = self.snapshot()?;
        let source_store = stores.get(source).ok_or_else(|| StoreError::NotFound {
            what: format!("partition {source}"),
        })?;

        let (alive, mut sinks) = self.open_upload_sinks(&stores);
        if !alive.contains(source) {
            return Err(StoreError::IncompleteCluster {
                reason: format!("source partition {source} not accepting uploads"),
            });
        }
        if alive.len() < 2 {
            return Err(StoreError::IncompleteCluster {
                reason: "nowhere to repartition to".to_string(),
            });
        }
        let sharder = scheme
            .create_sharder(&alive)
            .ok_or_else(|| StoreError::IncompleteCluster {
                reason: "scheme invalid for writes".to_string(),
            })?;

        // If take fails, nothing has been deleted and nothing was sent.
        let mut session = source_store.take()?;
        let mut moved = 0u64;
        while let Some(item) = session.next() {
            let data = item?;
            for index in sharder.shard(&data.key) {
                sinks[*index as usize].push(data.clone())?;
            }
            moved += 1;
            StoreMetrics::record(&self.inner.metrics.repartitioned_items);
        }
        for sink in sinks.drain(..) {
            sink.close()?;
        }
        // Every destination acked; only now give up the source copy.
        session.commit()?;
        tracing::info!(%source, entries = moved, "repartition complete");
        Ok(moved)
    }
}

fn run_discovery_loop<K: CrdtKey, S: CrdtState, P: PartitionId>(
    cluster: ClusterCrdtStorage<K, S, P>,
    updates: Receiver<PartitionScheme<P>>,
    shutdown: Receiver<()>,
) {
    loop {
        crossbeam::select! {
            recv(shutdown) -> _ => break,
            recv(updates) -> msg => match msg {
                Ok(scheme) => cluster.update_partition_scheme(scheme),
                Err(_) => {
                    tracing::info!("discovery stream ended; keeping last scheme");
                    break;
                }
            }
        }
    }
}

impl<K: CrdtKey, S: CrdtState, P: PartitionId> CrdtStore<K, S>
    for ClusterCrdtStorage<K, S, P>
{
    /// Open a sink on every live replica and split each entry to the
    /// replicas its key shards to. Fails before consuming input when the
    /// cluster is write-invalid.
    fn upload(&self) -> Result<Box<dyn UploadSink<K, S>>, StoreError> {
        let (scheme, stores) = self.snapshot()?;
        let (alive, sinks) = self.open_upload_sinks(&stores);
        let sharder = scheme
            .create_sharder(&alive)
            .ok_or_else(|| StoreError::IncompleteCluster {
                reason: "scheme invalid for writes".to_string(),
            })?;
        Ok(Box::new(ClusterUploadSink {
            sinks,
            sharder,
            metrics: Arc::clone(&self.inner.metrics),
        }))
    }

    fn download(&self, since: u64) -> Result<DataStream<K, S>, StoreError> {
        let (scheme, stores) = self.snapshot()?;
        let mut responsive = Vec::new();
        let mut sources: Vec<EntryStream<K, S>> = Vec::new();
        for (partition, store) in &stores {
            match store.download(since) {
                Ok(stream) => {
                    responsive.push(partition.clone());
                    sources.push(Box::new(
                        stream.map(|item| item.map(CrdtEntry::Data)),
                    ));
                }
                Err(err) => {
                    tracing::warn!(%partition, "download unavailable: {}", err);
                }
            }
        }
        let metrics = Arc::clone(&self.inner.metrics);
        let stream = self.merged_read(&scheme, sources, responsive)?;
        Ok(Box::new(stream.inspect(move |item| {
            if item.is_ok() {
                StoreMetrics::record(&metrics.downloaded_items);
            }
        })))
    }

    fn take(&self) -> Result<Box<dyn TakeSession<K, S>>, StoreError> {
        let (scheme, stores) = self.snapshot()?;
        let mut responsive = Vec::new();
        let mut sessions: Vec<SharedTake<K, S>> = Vec::new();
        let mut sources: Vec<EntryStream<K, S>> = Vec::new();
        for (partition, store) in &stores {
            match store.take() {
                Ok(session) => {
                    let shared: SharedTake<K, S> = Arc::new(Mutex::new(Some(session)));
                    responsive.push(partition.clone());
                    sources.push(Box::new(SharedTakeStream {
                        session: Arc::clone(&shared),
                    }));
                    sessions.push(shared);
                }
                Err(err) => {
                    tracing::warn!(%partition, "take unavailable: {}", err);
                }
            }
        }
        let stream = self.merged_read(&scheme, sources, responsive)?;
        Ok(Box::new(ClusterTakeSession {
            stream,
            sessions,
            metrics: Arc::clone(&self.inner.metrics),
        }))
    }

    fn remove(&self) -> Result<Box<dyn RemoveSink<K>>, StoreError> {
        let (scheme, stores) = self.snapshot()?;
        let mut alive = Vec::new();
        let mut sinks = Vec::new();
        for (partition, store) in &stores {
            match store.remove() {
                Ok(sink) => {
                    alive.push(partition.clone());
                    sinks.push(sink);
                }
                Err(err) => {
                    tracing::warn!(%partition, "remove unavailable: {}", err);
                }
            }
        }
        let sharder = scheme
            .create_sharder(&alive)
            .ok_or_else(|| StoreError::IncompleteCluster {
                reason: "scheme invalid for writes".to_string(),
            })?;
        Ok(Box::new(ClusterRemoveSink {
            sinks,
            sharder,
            metrics: Arc::clone(&self.inner.metrics),
        }))
    }

    /// Healthy iff the responsive partitions still form a valid sharder.
    fn ping(&self) -> Result<(), StoreError> {
        let (scheme, stores) = self.snapshot()?;
        let mut responsive = Vec::new();
        for (partition, store) in &stores {
            match store.ping() {
                Ok(()) => responsive.push(partition.clone()),
                Err(err) => tracing::warn!(%partition, "ping failed: {}", err),
            }
        }
        scheme
            .create_sharder(&responsive)
            .map(|_| ())
            .ok_or_else(|| StoreError::IncompleteCluster {
                reason: format!("{} of {} partitions responsive", responsive.len(), stores.len()),
            })
    }
}

struct ClusterUploadSink<K, S> {
    sinks: Vec<Box<dyn UploadSink<K, S>>>,
    sharder: RendezvousSharder,
    metrics: Arc<StoreMetrics>,
}

impl<K: CrdtKey, S: CrdtState> UploadSink<K, S> for ClusterUploadSink<K, S> {
    fn push(&mut self, data: CrdtData<K, S>) -> Result<(), StoreError> {
        let selected = self.sharder.shard(&data.key);
        for index in &selected[..selected.len().saturating_sub(1)] {
            self.sinks[*index as usize].push(data.clone())?;
        }
        if let Some(last) = selected.last() {
            self.sinks[*last as usize].push(data)?;
        }
        StoreMetrics::record(&self.metrics.uploaded_items);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        for sink in self.sinks {
            sink.close()?;
        }
        Ok(())
    }
}

struct ClusterRemoveSink<K> {
    sinks: Vec<Box<dyn RemoveSink<K>>>,
    sharder: RendezvousSharder,
    metrics: Arc<StoreMetrics>,
}

impl<K: CrdtKey> RemoveSink<K> for ClusterRemoveSink<K> {
    fn push(&mut self, tombstone: CrdtTombstone<K>) -> Result<(), StoreError> {
        let selected = self.sharder.shard(&tombstone.key);
        for index in &selected[..selected.len().saturating_sub(1)] {
            self.sinks[*index as usize].push(tombstone.clone())?;
        }
        if let Some(last) = selected.last() {
            self.sinks[*last as usize].push(tombstone)?;
        }
        StoreMetrics::record(&self.metrics.removed_items);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        for sink in self.sinks {
            sink.close()?;
        }
        Ok(())
    }
}

type SharedTake<K, S> = Arc<Mutex<Option<Box<dyn TakeSession<K, S>>>>>;

struct SharedTakeStream<K, S> {
    session: SharedTake<K, S>,
}

impl<K, S> Iterator for SharedTakeStream<K, S> {
    type Item = Result<CrdtEntry<K, S>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut guard = self.session.lock().expect("take session lock poisoned");
        let session = guard.as_mut()?;
        session.next().map(|item| item.map(CrdtEntry::Data))
    }
}

struct ClusterTakeSession<K, S> {
    stream: DataStream<K, S>,
    sessions: Vec<SharedTake<K, S>>,
    metrics: Arc<StoreMetrics>,
}

impl<K: CrdtKey, S: CrdtState> TakeSession<K, S> for ClusterTakeSession<K, S> {
    fn next(&mut self) -> Option<Result<CrdtData<K, S>, StoreError>> {
        let item = self.stream.next();
        if matches!(item, Some(Ok(_))) {
            StoreMetrics::record(&self.metrics.taken_items);
        }
        item
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        // Release the merge (and with it the stream-side borrows of the
        // per-partition sessions) before committing each one.
        self.stream = Box::new(std::iter::empty());
        for shared in &self.sessions {
            let session = shared
                .lock()
                .expect("take session lock poisoned")
                .take();
            if let Some(session) = session {
                session.commit()?;
            }
        }
        Ok(())
    }
}
