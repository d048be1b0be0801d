use crate::pubsub::{ItemLimit, NodeConfig, PepFeatures, PubSubItem, PubSubService};
use crate::{
    DeviceBundle, DeviceListEntry, DeviceListItem, Error, Result, BUNDLES_NODE, DEVICES_NODE,
    DEVICE_LIST_ITEM_ID,
};
use async_trait::async_trait;
use tracing::debug;

/// Exchange of device lists and bundles with other accounts.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn fetch_bundle(&self, jid: &str, device_id: u32) -> Result<DeviceBundle>;

    /// All items of `jid`'s device list node. A missing node yields no items.
    async fn fetch_device_list(&self, jid: &str) -> Result<Vec<DeviceListItem>>;

    /// Device ids of the bundles currently published by the own account.
    async fn own_bundle_ids(&self) -> Result<Vec<u32>>;

    async fn publish_own_bundle(&self, device_id: u32, bundle: &DeviceBundle) -> Result<()>;
    async fn retract_own_bundle(&self, device_id: u32) -> Result<()>;
    async fn delete_own_bundles(&self) -> Result<()>;

    async fn publish_own_device_list(&self, devices: &[DeviceListEntry]) -> Result<()>;
    async fn delete_own_device_list(&self) -> Result<()>;

    async fn subscribe(&self, jid: &str) -> Result<()>;
    async fn unsubscribe(&self, jid: &str) -> Result<()>;
}

/// Ways of getting an item onto an own PEP node, in the order they are
/// tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishStrategy {
    WithOptions,
    ConfigureExisting,
    CreateAndConfigure,
    CreateThenConfigure,
}

impl PublishStrategy {
    fn applicable(features: &PepFeatures, node_exists: bool) -> Vec<Self> {
        let mut strategies = Vec::new();
        if features.publish_options && (node_exists || features.auto_create) {
            strategies.push(Self::WithOptions);
        }
        if node_exists && features.config_node {
            strategies.push(Self::ConfigureExisting);
        }
        if !node_exists && features.create_and_configure {
            strategies.push(Self::CreateAndConfigure);
        }
        if !node_exists && features.create_nodes && features.config_node {
            strategies.push(Self::CreateThenConfigure);
        }
        strategies
    }
}

/// `DeviceDirectory` on top of PEP.
///
/// The device list is a singleton item `current` on the devices node. Every
/// device publishes its bundle as an item named after its device id on the
/// bundles node. Both nodes are open to everyone.
pub struct PepDirectory<S> {
    service: S,
    own_jid: String,
}

impl<S: PubSubService> PepDirectory<S> {
    pub fn new(service: S, own_jid: impl Into<String>) -> Self {
        Self {
            service,
            own_jid: own_jid.into(),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    fn bundle_node_configs(features: &PepFeatures) -> Vec<NodeConfig> {
        let mut limits = Vec::with_capacity(4);
        if features.config_node_max {
            limits.push(ItemLimit::Max);
        }
        limits.extend([ItemLimit::Count(1000), ItemLimit::Count(100), ItemLimit::Count(10)]);
        limits.into_iter().map(NodeConfig::open_with_limit).collect()
    }

    async fn publish(
        &self,
        node: &str,
        item: PubSubItem,
        configs: impl Fn(&PepFeatures) -> Vec<NodeConfig>,
    ) -> Result<()> {
        let features = self.service.own_features().await?;
        let node_exists = self.service.own_node_exists(node).await?;
        let strategies = PublishStrategy::applicable(&features, node_exists);
        if strategies.is_empty() {
            return Err(Error::Directory(format!(
                "server offers no way to publish to {node}"
            )));
        }

        let configs = configs(&features);
        let mut last_error = None;
        for strategy in strategies {
            for config in &configs {
                match self.try_publish(strategy, node, item.clone(), config).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        debug!(node, ?strategy, ?config, error = %e, "publish attempt failed");
                        last_error = Some(e);
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Directory(format!("could not publish to {node}"))))
    }

    async fn try_publish(
        &self,
        strategy: PublishStrategy,
        node: &str,
        item: PubSubItem,
        config: &NodeConfig,
    ) -> Result<()> {
        match strategy {
            PublishStrategy::WithOptions => {
                self.service.publish_own_item(node, item, Some(config)).await
            }
            PublishStrategy::ConfigureExisting => {
                self.service.configure_own_node(node, config).await?;
                self.service.publish_own_item(node, item, None).await
            }
            PublishStrategy::CreateAndConfigure => {
                if !self.service.own_node_exists(node).await? {
                    self.service.create_own_node(node, Some(config)).await?;
                } else {
                    self.service.configure_own_node(node, config).await?;
                }
                self.service.publish_own_item(node, item, None).await
            }
            PublishStrategy::CreateThenConfigure => {
                if !self.service.own_node_exists(node).await? {
                    self.service.create_own_node(node, None).await?;
                }
                self.service.configure_own_node(node, config).await?;
                self.service.publish_own_item(node, item, None).await
            }
        }
    }
}

#[async_trait]
impl<S: PubSubService> DeviceDirectory for PepDirectory<S> {
    async fn fetch_bundle(&self, jid: &str, device_id: u32) -> Result<DeviceBundle> {
        let item = self
            .service
            .request_item(jid, BUNDLES_NODE, &device_id.to_string())
            .await?;
        Ok(serde_json::from_str(&item.payload)?)
    }

    async fn fetch_device_list(&self, jid: &str) -> Result<Vec<DeviceListItem>> {
        let items = self.service.request_items(jid, DEVICES_NODE).await?;
        items
            .into_iter()
            .map(|item| {
                Ok(DeviceListItem {
                    id: item.id,
                    devices: serde_json::from_str(&item.payload)?,
                })
            })
            .collect()
    }

    async fn own_bundle_ids(&self) -> Result<Vec<u32>> {
        let ids = self
            .service
            .request_item_ids(&self.own_jid, BUNDLES_NODE)
            .await?;
        Ok(ids.iter().filter_map(|id| id.parse().ok()).collect())
    }

    async fn publish_own_bundle(&self, device_id: u32, bundle: &DeviceBundle) -> Result<()> {
        let item = PubSubItem {
            id: device_id.to_string(),
            payload: serde_json::to_string(bundle)?,
        };
        self.publish(BUNDLES_NODE, item, Self::bundle_node_configs)
            .await
    }

    async fn retract_own_bundle(&self, device_id: u32) -> Result<()> {
        self.service
            .retract_own_item(BUNDLES_NODE, &device_id.to_string())
            .await
    }

    async fn delete_own_bundles(&self) -> Result<()> {
        self.service.delete_own_node(BUNDLES_NODE).await
    }

    async fn publish_own_device_list(&self, devices: &[DeviceListEntry]) -> Result<()> {
        let item = PubSubItem {
            id: DEVICE_LIST_ITEM_ID.to_string(),
            payload: serde_json::to_string(devices)?,
        };
        self.publish(DEVICES_NODE, item, |_| vec![NodeConfig::open()])
            .await
    }

    async fn delete_own_device_list(&self) -> Result<()> {
        self.service.delete_own_node(DEVICES_NODE).await
    }

    async fn subscribe(&self, jid: &str) -> Result<()> {
        self.service.subscribe(jid, DEVICES_NODE).await
    }

    async fn unsubscribe(&self, jid: &str) -> Result<()> {
        self.service.unsubscribe(jid, DEVICES_NODE).await
    }
}
