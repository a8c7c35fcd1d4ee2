//! Liveness cluster
//!
//! Wraps N node clients behind one [`NodeClient`]. Every delegated call goes
//! to the node picked by the most recent liveness decision; there is no
//! per-call failover. A failure between ticks is only noticed on the next
//! tick, so failover latency is bounded by the check period.

use crate::{connector::*, metrics::*, types::*, Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Minimum active/total channel ratio for a node to be eligible
    pub threshold: f64,
    /// Liveness check period (seconds)
    pub check_period_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            threshold: crate::DEFAULT_LIVENESS_THRESHOLD,
            check_period_secs: crate::DEFAULT_LIVENESS_PERIOD_SECONDS,
        }
    }
}

/// N-way failover node client
pub struct LivenessCluster {
    /// Candidate nodes, in priority order
    nodes: Vec<Arc<dyn NodeClient>>,
    /// Index into `nodes`
    active: RwLock<usize>,
    /// Config
    config: ClusterConfig,
    /// Name
    name: String,
}

impl std::fmt::Debug for LivenessCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessCluster")
            .field("nodes", &self.nodes.iter().map(|n| n.name()).collect::<Vec<_>>())
            .field("active", &*self.active.read())
            .field("config", &self.config)
            .finish()
    }
}

impl LivenessCluster {
    /// Create cluster; the first node starts out active
    pub fn new(nodes: Vec<Arc<dyn NodeClient>>, config: ClusterConfig) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::Unavailable("cluster has no nodes".to_string()));
        }
        let name = format!(
            "cluster[{}]",
            nodes.iter().map(|n| n.name()).collect::<Vec<_>>().join(",")
        );
        CLUSTER_ACTIVE_NODE.set(0);
        Ok(Self {
            nodes,
            active: RwLock::new(0),
            config,
            name,
        })
    }

    /// Node all calls currently go to
    pub fn active_node(&self) -> Arc<dyn NodeClient> {
        let index = *self.active.read();
        self.nodes[index].clone()
    }

    /// Index of the active node
    pub fn active_index(&self) -> usize {
        *self.active.read()
    }

    /// Check every node in order and make the first eligible one active.
    ///
    /// Returns the active index after the check. If no node is eligible the
    /// previous choice is kept.
    pub async fn check_liveness(&self) -> usize {
        for (index, node) in self.nodes.iter().enumerate() {
            match node.get_info().await {
                Ok(info) => {
                    let ratio = info.active_channel_ratio();
                    if ratio >= self.config.threshold {
                        LIVENESS_CHECKS_TOTAL
                            .with_label_values(&[node.name(), "eligible"])
                            .inc();
                        self.select(index);
                        return index;
                    }
                    debug!(node = node.name(), ratio, "Node below channel threshold");
                    LIVENESS_CHECKS_TOTAL
                        .with_label_values(&[node.name(), "below_threshold"])
                        .inc();
                }
                Err(e) => {
                    debug!(node = node.name(), error = %e, "Liveness check failed");
                    LIVENESS_CHECKS_TOTAL
                        .with_label_values(&[node.name(), "unreachable"])
                        .inc();
                }
            }
        }

        let current = self.active_index();
        warn!(
            active = self.nodes[current].name(),
            "No eligible node, keeping previous active node"
        );
        current
    }

    fn select(&self, index: usize) {
        let mut active = self.active.write();
        if *active != index {
            info!(
                from = self.nodes[*active].name(),
                to = self.nodes[index].name(),
                "Switching active node"
            );
            *active = index;
            CLUSTER_ACTIVE_NODE.set(index as i64);
            CLUSTER_SWITCHES_TOTAL.inc();
        }
    }

    /// Liveness loop: one check immediately, then every period until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.check_period_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            nodes = self.nodes.len(),
            threshold = self.config.threshold,
            period_secs = self.config.check_period_secs,
            "Liveness loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Liveness loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    self.check_liveness().await;
                }
            }
        }
    }
}

async fn observe<T, F>(node: &Arc<dyn NodeClient>, method: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let result = call.await;
    NODE_REQUEST_DURATION
        .with_label_values(&[node.name(), method])
        .observe(start.elapsed().as_secs_f64());
    let status = if result.is_ok() { "success" } else { "failure" };
    NODE_REQUESTS_TOTAL
        .with_label_values(&[node.name(), method, status])
        .inc();
    result
}

#[async_trait]
impl NodeClient for LivenessCluster {
    async fn add_invoice(&self, request: &AddInvoiceRequest) -> Result<AddInvoiceResponse> {
        let node = self.active_node();
        observe(&node, "add_invoice", node.add_invoice(request)).await
    }

    async fn pay_exact(&self, request: &PayRequest) -> Result<PayResponse> {
        let node = self.active_node();
        observe(&node, "pay_exact", node.pay_exact(request)).await
    }

    async fn subscribe_invoices(&self, from_add_index: u64) -> Result<InvoiceUpdateStream> {
        let node = self.active_node();
        observe(&node, "subscribe_invoices", node.subscribe_invoices(from_add_index))
            .await
    }

    async fn track_payment(&self, r_hash: &Hash32) -> Result<PaymentTrack> {
        let node = self.active_node();
        observe(&node, "track_payment", node.track_payment(r_hash)).await
    }

    async fn get_info(&self) -> Result<NodeInfo> {
        let node = self.active_node();
        observe(&node, "get_info", node.get_info()).await
    }

    async fn decode_payment_request(
        &self,
        payment_request: &str,
    ) -> Result<DecodedPaymentRequest> {
        let node = self.active_node();
        observe(&node, "decode_payment_request", node.decode_payment_request(payment_request))
            .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedNode;

    fn info(active: u32, inactive: u32) -> NodeInfo {
        NodeInfo {
            num_active_channels: active,
            num_inactive_channels: inactive,
            ..Default::default()
        }
    }

    fn cluster(threshold: f64) -> (Arc<SimulatedNode>, Arc<SimulatedNode>, LivenessCluster) {
        let a = Arc::new(SimulatedNode::new("a"));
        let b = Arc::new(SimulatedNode::new("b"));
        let cluster = LivenessCluster::new(
            vec![a.clone() as Arc<dyn NodeClient>, b.clone() as Arc<dyn NodeClient>],
            ClusterConfig {
                threshold,
                check_period_secs: 1,
            },
        )
        .unwrap();
        (a, b, cluster)
    }

    #[test]
    fn test_empty_cluster_rejected() {
        assert!(matches!(
            LivenessCluster::new(vec![], ClusterConfig::default()),
            Err(Error::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_failover_to_second_node() {
        let (a, b, cluster) = cluster(0.5);
        a.set_info(info(10, 0));
        b.set_info(info(10, 0));

        assert_eq!(cluster.check_liveness().await, 0);
        assert_eq!(cluster.active_node().name(), "a");

        a.set_unreachable(true);
        assert_eq!(cluster.check_liveness().await, 1);
        assert_eq!(cluster.active_node().name(), "b");

        // A recovers and takes over again by priority
        a.set_unreachable(false);
        assert_eq!(cluster.check_liveness().await, 0);
    }

    #[tokio::test]
    async fn test_below_threshold_not_eligible() {
        let (a, b, cluster) = cluster(0.5);
        a.set_info(info(1, 9));
        b.set_info(info(6, 4));
        assert_eq!(cluster.check_liveness().await, 1);
    }

    #[tokio::test]
    async fn test_no_eligible_keeps_previous() {
        let (a, b, cluster) = cluster(0.5);
        a.set_unreachable(true);
        b.set_info(info(5, 0));
        assert_eq!(cluster.check_liveness().await, 1);

        b.set_unreachable(true);
        assert_eq!(cluster.check_liveness().await, 1);
        assert_eq!(cluster.active_node().name(), "b");
    }

    #[tokio::test]
    async fn test_zero_channels_only_eligible_at_zero_threshold() {
        let (a, b, strict) = cluster(0.1);
        a.set_info(info(0, 0));
        b.set_info(info(0, 0));
        strict.check_liveness().await;
        assert_eq!(strict.active_index(), 0);
        a.set_unreachable(true);
        // b has no channels: ratio 0 < 0.1, keep a
        assert_eq!(strict.check_liveness().await, 0);

        let (a, b, lenient) = cluster(0.0);
        a.set_unreachable(true);
        b.set_info(info(0, 0));
        assert_eq!(lenient.check_liveness().await, 1);
    }

    #[tokio::test]
    async fn test_calls_follow_active_node() {
        let (a, b, cluster) = cluster(0.0);
        a.set_unreachable(true);
        cluster.check_liveness().await;

        let response = cluster
            .add_invoice(&AddInvoiceRequest {
                amount_sat: 10,
                memo: String::new(),
                description_hash: None,
                preimage: [3u8; 32],
                expiry_secs: 3600,
            })
            .await
            .unwrap();

        assert!(b.has_invoice(&response.r_hash));
        assert!(!a.has_invoice(&response.r_hash));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let (a, _b, cluster) = cluster(0.0);
        a.set_info(info(1, 0));
        let cluster = Arc::new(cluster);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let cluster = cluster.clone();
            let cancel = cancel.clone();
            async move { cluster.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(cluster.active_index(), 0);
    }
}
