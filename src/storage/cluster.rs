//! In-process [`ReplicationChannel`] connecting several [`Storage`] nodes.
//!
//! Used by tests and single-process deployments that shard maps across
//! storages living in the same address space.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::trace;

use super::replication::{ReplicationChannel, StorageAck, StorageRequest};
use super::store::Storage;
use crate::primitives::concurrency::AsyncHandler;
use crate::types::{HostId, Result, StrataError};

/// Routes requests to storages registered under their host id.
#[derive(Default)]
pub struct LocalCluster {
    nodes: RwLock<HashMap<HostId, Weak<Storage>>>,
}

impl LocalCluster {
    /// Empty cluster.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `storage` as `host` and points its maps at this cluster.
    pub fn join(self: &Arc<Self>, host: impl Into<HostId>, storage: &Arc<Storage>) {
        self.nodes
            .write()
            .insert(host.into(), Arc::downgrade(storage));
        storage.set_replication_channel(self.clone());
    }

    /// Removes `host`; later requests addressed to it fail.
    pub fn leave(&self, host: &str) {
        self.nodes.write().remove(host);
    }

    fn node(&self, host: &str) -> Result<Arc<Storage>> {
        self.nodes
            .read()
            .get(host)
            .and_then(Weak::upgrade)
            .ok_or_else(|| StrataError::Remote(format!("unknown host {host}")))
    }

    fn deliver(&self, hosts: &[HostId], request: &StorageRequest) -> Result<StorageAck> {
        let mut first = None;
        for host in hosts {
            trace!(host = %host, map = %request.map_name, op = request.op.name(), "cluster.deliver");
            let ack = self.node(host)?.handle_request(request)?;
            first.get_or_insert(ack);
        }
        first.ok_or(StrataError::Invalid("request without target hosts"))
    }
}

impl ReplicationChannel for LocalCluster {
    fn send(&self, hosts: &[HostId], request: StorageRequest, handler: AsyncHandler<StorageAck>) {
        handler(self.deliver(hosts, &request));
    }

    fn replicate_pages(&self, hosts: &[HostId], pages: Bytes) -> Result<()> {
        for host in hosts {
            self.node(host)?.replicate_from(&pages)?;
        }
        Ok(())
    }

    fn move_leaf_page(&self, hosts: &[HostId], map_name: &str, page: Bytes) -> Result<()> {
        for host in hosts {
            self.node(host)?.receive_leaf_page(map_name, &page)?;
        }
        Ok(())
    }
}
