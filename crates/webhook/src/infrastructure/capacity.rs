//! Cluster capacity lookups for the validating webhook.

use std::collections::BTreeSet;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::Api;
use kube::Client;
use tracing::debug;

use crate::admission::quantity::ParsedQuantity;
use crate::infrastructure::k8s::KubernetesError;

/// Reports which resource names the cluster can currently satisfy.
#[async_trait]
pub trait CapacitySource: Send + Sync {
    /// Union of resource names with a non-zero allocatable amount on any node.
    async fn allocatable_resource_names(
        &self,
    ) -> Result<BTreeSet<String>, Report<KubernetesError>>;
}

/// [`CapacitySource`] backed by the node list.
pub struct NodeCapacity {
    client: Client,
}

impl NodeCapacity {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CapacitySource for NodeCapacity {
    async fn allocatable_resource_names(
        &self,
    ) -> Result<BTreeSet<String>, Report<KubernetesError>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let nodes = nodes
            .list(&ListParams::default())
            .await
            .change_context(KubernetesError::RequestFailed {
                message: "Failed to list nodes".to_string(),
            })?;
        let names = advertised_resource_names(&nodes.items);
        debug!(
            nodes = nodes.items.len(),
            resources = names.len(),
            "Read cluster capacity"
        );
        Ok(names)
    }
}

/// Resource names with a non-zero allocatable amount on at least one node.
///
/// Amounts that cannot be parsed are counted as advertised.
pub fn advertised_resource_names(nodes: &[Node]) -> BTreeSet<String> {
    nodes
        .iter()
        .filter_map(|node| node.status.as_ref()?.allocatable.as_ref())
        .flatten()
        .filter(|(_, quantity)| {
            ParsedQuantity::parse(&quantity.0)
                .map(|parsed| !parsed.is_zero())
                .unwrap_or(true)
        })
        .map(|(name, _)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use similar_asserts::assert_eq;

    use super::*;

    fn node(allocatable: &[(&str, &str)]) -> Node {
        Node {
            status: Some(NodeStatus {
                allocatable: Some(
                    allocatable
                        .iter()
                        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn union_skips_zero_amounts() {
        let nodes = vec![
            node(&[("cpu", "4"), ("bitfusion.io/gpu", "0")]),
            node(&[("memory", "16Gi"), ("nvidia.com/gpu", "1")]),
            Node::default(),
        ];

        let names = advertised_resource_names(&nodes);

        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["cpu", "memory", "nvidia.com/gpu"]
        );
    }

    #[test]
    fn resource_advertised_on_any_node_counts() {
        let nodes = vec![
            node(&[("bitfusion.io/gpu", "0")]),
            node(&[("bitfusion.io/gpu", "100")]),
        ];

        assert!(advertised_resource_names(&nodes).contains("bitfusion.io/gpu"));
    }
}
