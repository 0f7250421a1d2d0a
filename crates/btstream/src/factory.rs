//! Replica construction from configuration.

use std::sync::Arc;

use crate::config::{Config, ReplicaConfig};
use crate::error::StreamError;
use crate::replica::Replica;
use crate::replica_file::FileReplica;
use crate::replica_memory::MemoryReplica;

/// Builds every configured replica.
///
/// A single malformed entry fails the whole build: a controller must not
/// start with a silently missing destination.
pub fn build_replicas(config: &Config) -> Result<Vec<Arc<dyn Replica>>, StreamError> {
    let mut replicas: Vec<Arc<dyn Replica>> = Vec::with_capacity(config.replicas.len());
    for entry in &config.replicas {
        let replica: Arc<dyn Replica> = match entry {
            ReplicaConfig::File(cfg) => Arc::new(FileReplica::new(cfg)?),
            ReplicaConfig::Memory(cfg) => Arc::new(MemoryReplica::from_config(cfg)),
        };
        replicas.push(replica);
    }
    Ok(replicas)
}
