//! Hub wiring
//!
//! Builds the ledger, node backend, broker and managers from [`Config`],
//! and spawns the long-running tasks: settlement stream supervisor,
//! reconciler, liveness loop and event sinks.

use crate::{
    config::{Config, NodeBackend},
    events::{EventPublisher, InvoiceEvent},
    invoices::InvoiceManager,
    payments::PaymentManager,
    reconcile::PendingPaymentReconciler,
    subscription::{InvoiceUpdateSubscription, SubscriptionSupervisor},
    Error, Result,
};
use ledger_core::Ledger;
use message_bus::{forward, Broker, NatsForwarder, WebhookForwarder};
use node_adapters::{LivenessCluster, NodeClient, SimulatedNode};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Running background tasks of a [`Hub`]
#[derive(Debug)]
pub struct HubHandle {
    /// Settlement stream supervisor; an error here is fatal for the process
    pub supervisor: JoinHandle<Result<()>>,
    /// Reconciler, liveness loop and sinks
    pub tasks: Vec<JoinHandle<()>>,
}

impl HubHandle {
    /// Wait for every non-fatal task to stop
    pub async fn join_tasks(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Accounting hub
pub struct Hub {
    config: Config,
    ledger: Arc<Ledger>,
    node: Arc<dyn NodeClient>,
    cluster: Option<Arc<LivenessCluster>>,
    simulated: Vec<Arc<SimulatedNode>>,
    broker: Arc<Broker<InvoiceEvent>>,
    invoices: Arc<InvoiceManager>,
    payments: Arc<PaymentManager>,
    reconciler: Arc<PendingPaymentReconciler>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("node", &self.node.name())
            .field("clustered", &self.cluster.is_some())
            .field("broker", &self.broker)
            .finish()
    }
}

impl Hub {
    /// Open the ledger and build the configured node backend
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let ledger = Arc::new(Ledger::open(config.ledger.clone())?);

        let simulated: Vec<Arc<SimulatedNode>> = match config.node.backend {
            NodeBackend::Simulated => config
                .node
                .nodes
                .iter()
                .map(|name| Arc::new(SimulatedNode::new(name.clone())))
                .collect(),
        };

        let (node, cluster): (Arc<dyn NodeClient>, _) = match simulated.as_slice() {
            [] => return Err(Error::Config("at least one node is required".into())),
            [single] => (single.clone() as Arc<dyn NodeClient>, None),
            many => {
                let nodes = many
                    .iter()
                    .map(|node| node.clone() as Arc<dyn NodeClient>)
                    .collect();
                let cluster = Arc::new(LivenessCluster::new(nodes, config.cluster.clone())?);
                (cluster.clone() as Arc<dyn NodeClient>, Some(cluster))
            }
        };

        let mut hub = Self::new(config, ledger, node, cluster);
        hub.simulated = simulated;
        Ok(hub)
    }

    /// Wire managers around an existing ledger and node client
    pub fn new(
        config: Config,
        ledger: Arc<Ledger>,
        node: Arc<dyn NodeClient>,
        cluster: Option<Arc<LivenessCluster>>,
    ) -> Self {
        let broker = Arc::new(Broker::new(config.broker.clone()));
        let events = EventPublisher::new(broker.clone(), ledger.clone());

        let invoices = Arc::new(InvoiceManager::new(
            ledger.clone(),
            node.clone(),
            events.clone(),
            config.invoices.clone(),
        ));
        let payments = Arc::new(PaymentManager::new(
            ledger.clone(),
            node.clone(),
            events,
            config.fees.clone(),
            config.payments.clone(),
        ));
        let reconciler = Arc::new(PendingPaymentReconciler::new(
            ledger.clone(),
            node.clone(),
            payments.clone(),
            config.reconcile.clone(),
        ));

        Self {
            config,
            ledger,
            node,
            cluster,
            simulated: Vec::new(),
            broker,
            invoices,
            payments,
            reconciler,
        }
    }

    /// Ledger store
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Node client every manager talks to
    pub fn node(&self) -> &Arc<dyn NodeClient> {
        &self.node
    }

    /// Liveness cluster, when more than one node is configured
    pub fn cluster(&self) -> Option<&Arc<LivenessCluster>> {
        self.cluster.as_ref()
    }

    /// Simulated nodes built by [`Hub::from_config`]
    pub fn simulated_nodes(&self) -> &[Arc<SimulatedNode>] {
        &self.simulated
    }

    /// Event broker
    pub fn broker(&self) -> &Arc<Broker<InvoiceEvent>> {
        &self.broker
    }

    /// Incoming invoice manager
    pub fn invoices(&self) -> &Arc<InvoiceManager> {
        &self.invoices
    }

    /// Outgoing payment manager
    pub fn payments(&self) -> &Arc<PaymentManager> {
        &self.payments
    }

    /// Pending payment reconciler
    pub fn reconciler(&self) -> &Arc<PendingPaymentReconciler> {
        &self.reconciler
    }

    /// Spawn the background tasks. All of them stop when `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> Result<HubHandle> {
        // Sinks are built first so a bad sink config spawns nothing
        let sinks = &self.config.sinks;
        let webhook = match &sinks.webhook {
            Some(config) => Some(Arc::new(WebhookForwarder::new(config.clone())?)),
            None => None,
        };
        let nats = match &sinks.nats {
            Some(config) => Some(Arc::new(
                NatsForwarder::connect(&config.url, config.subject_prefix.clone()).await?,
            )),
            None => None,
        };

        let subscription = InvoiceUpdateSubscription::new(
            self.ledger.clone(),
            self.node.clone(),
            self.invoices.clone(),
        );
        let supervisor = SubscriptionSupervisor::new(subscription, self.config.supervisor.clone());
        let supervisor = {
            let cancel = cancel.clone();
            tokio::spawn(async move { supervisor.run(cancel).await })
        };

        let mut tasks = Vec::new();
        {
            let reconciler = self.reconciler.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { reconciler.run(cancel).await }));
        }

        if let Some(cluster) = &self.cluster {
            let cluster = cluster.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { cluster.run(cancel).await }));
        }

        for topic in &sinks.topics {
            if let Some(webhook) = &webhook {
                let subscription = self.broker.subscribe(topic.as_str());
                let webhook = webhook.clone();
                let cancel = cancel.clone();
                tasks.push(tokio::spawn(async move {
                    forward(subscription, webhook, cancel).await;
                }));
            }
            if let Some(nats) = &nats {
                let subscription = self.broker.subscribe(topic.as_str());
                let nats = nats.clone();
                let cancel = cancel.clone();
                tasks.push(tokio::spawn(async move {
                    forward(subscription, nats, cancel).await;
                }));
            }
        }

        info!(
            node = self.node.name(),
            clustered = self.cluster.is_some(),
            sink_topics = sinks.topics.len(),
            "Hub started"
        );
        Ok(HubHandle { supervisor, tasks })
    }
}
