use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{Ms, ResourceVector};

/// Reports the resources the cluster can actually offer reservations.
/// Consulted once per admission, before the plan lock is taken.
#[async_trait]
pub trait ClusterResources: Send + Sync {
    async fn cluster_resource(&self, now: Ms) -> ResourceVector;
}

#[derive(Debug, Clone, Default)]
struct ClusterState {
    total: ResourceVector,
    /// Resources carried by nodes with each label.
    labels: BTreeMap<String, ResourceVector>,
    /// Labels whose nodes may not host reservations.
    excluded: BTreeSet<String>,
}

/// A cluster whose size is set by configuration, with optional node labels
/// that can be kept out of reservable capacity.
#[derive(Debug, Default)]
pub struct StaticClusterResources {
    state: RwLock<ClusterState>,
}

impl StaticClusterResources {
    pub fn new(total: ResourceVector) -> Self {
        Self {
            state: RwLock::new(ClusterState {
                total,
                ..ClusterState::default()
            }),
        }
    }

    pub async fn set_total(&self, total: ResourceVector) {
        self.state.write().await.total = total;
    }

    pub async fn set_label(&self, label: impl Into<String>, resources: ResourceVector) {
        self.state.write().await.labels.insert(label.into(), resources);
    }

    pub async fn exclude_label(&self, label: impl Into<String>) {
        self.state.write().await.excluded.insert(label.into());
    }

    pub async fn include_label(&self, label: &str) {
        self.state.write().await.excluded.remove(label);
    }
}

#[async_trait]
impl ClusterResources for StaticClusterResources {
    async fn cluster_resource(&self, _now: Ms) -> ResourceVector {
        let state = self.state.read().await;
        state
            .excluded
            .iter()
            .filter_map(|label| state.labels.get(label))
            .fold(state.total, |acc, r| acc.saturating_sub(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn total_without_labels() {
        let cluster = StaticClusterResources::new(ResourceVector::new(8192, 8));
        assert_eq!(cluster.cluster_resource(0).await, ResourceVector::new(8192, 8));
    }

    #[tokio::test]
    async fn excluded_labels_are_subtracted() {
        let cluster = StaticClusterResources::new(ResourceVector::new(8192, 8));
        cluster.set_label("gpu", ResourceVector::new(2048, 2)).await;
        cluster.set_label("ssd", ResourceVector::new(1024, 1)).await;

        // Labelled but not excluded: still reservable
        assert_eq!(cluster.cluster_resource(0).await, ResourceVector::new(8192, 8));

        cluster.exclude_label("gpu").await;
        assert_eq!(cluster.cluster_resource(0).await, ResourceVector::new(6144, 6));

        cluster.exclude_label("unknown").await;
        assert_eq!(cluster.cluster_resource(0).await, ResourceVector::new(6144, 6));

        cluster.include_label("gpu").await;
        assert_eq!(cluster.cluster_resource(0).await, ResourceVector::new(8192, 8));
    }

    #[tokio::test]
    async fn shrinking_cluster() {
        let cluster = StaticClusterResources::new(ResourceVector::new(8192, 8));
        cluster.set_total(ResourceVector::new(4096, 4)).await;
        assert_eq!(cluster.cluster_resource(0).await, ResourceVector::new(4096, 4));
    }
}
