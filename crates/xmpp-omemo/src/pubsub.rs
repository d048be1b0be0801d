use crate::Result;
use async_trait::async_trait;

/// PEP capabilities of the own server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PepFeatures {
    pub publish_options: bool,
    pub auto_create: bool,
    pub create_nodes: bool,
    pub create_and_configure: bool,
    pub config_node: bool,
    /// Whether `max` is accepted as an item limit.
    pub config_node_max: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemLimit {
    Max,
    Count(u32),
}

/// Configuration of an own node. Every node is open to everyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub max_items: Option<ItemLimit>,
}

impl NodeConfig {
    pub fn open() -> Self {
        Self { max_items: None }
    }

    pub fn open_with_limit(limit: ItemLimit) -> Self {
        Self {
            max_items: Some(limit),
        }
    }
}

/// One item of a PEP node. The payload is the JSON form of the item's
/// content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubItem {
    pub id: String,
    pub payload: String,
}

/// Raw publish/subscribe operations on the own PEP service and on contacts'
/// PEP services.
#[async_trait]
pub trait PubSubService: Send + Sync {
    async fn own_features(&self) -> Result<PepFeatures>;
    async fn own_node_exists(&self, node: &str) -> Result<bool>;
    async fn create_own_node(&self, node: &str, config: Option<&NodeConfig>) -> Result<()>;
    async fn configure_own_node(&self, node: &str, config: &NodeConfig) -> Result<()>;

    /// Publishes `item`, passing `options` as publish options if given.
    async fn publish_own_item(
        &self,
        node: &str,
        item: PubSubItem,
        options: Option<&NodeConfig>,
    ) -> Result<()>;

    async fn retract_own_item(&self, node: &str, item_id: &str) -> Result<()>;
    async fn delete_own_node(&self, node: &str) -> Result<()>;

    async fn request_items(&self, jid: &str, node: &str) -> Result<Vec<PubSubItem>>;
    async fn request_item(&self, jid: &str, node: &str, item_id: &str) -> Result<PubSubItem>;
    async fn request_item_ids(&self, jid: &str, node: &str) -> Result<Vec<String>>;

    async fn subscribe(&self, jid: &str, node: &str) -> Result<()>;
    async fn unsubscribe(&self, jid: &str, node: &str) -> Result<()>;
}
