use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::config::AppConfig;
use crate::node::Node;

type NodeFactory =
    dyn Fn(HashMap<String, serde_json::Value>) -> Result<Box<dyn Node>> + Send + Sync;

/// Explicit node registry, populated once at startup. The host asks it for
/// nodes by type name; nothing registers itself implicitly.
pub struct NodeRegistry {
    factories: HashMap<String, Box<NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, node_type: &str, factory: F)
    where
        F: Fn(HashMap<String, serde_json::Value>) -> Result<Box<dyn Node>> + Send + Sync + 'static,
    {
        self.factories
            .insert(node_type.to_string(), Box::new(factory));
    }

    pub fn create(
        &self,
        node_type: &str,
        params: HashMap<String, serde_json::Value>,
    ) -> Result<Box<dyn Node>> {
        let factory = self
            .factories
            .get(node_type)
            .ok_or_else(|| anyhow!("unknown node type: {node_type}"))?;

        factory(params)
    }

    pub fn list_node_types(&self) -> Vec<&str> {
        let mut node_types: Vec<&str> = self.factories.keys().map(|v| v.as_str()).collect();
        node_types.sort_unstable();
        node_types
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register every node type this crate provides.
///
/// The keys match the node-type names the host's workflow documents use, so
/// graphs round-trip cleanly between UI and plugin.
pub fn register_all_nodes(registry: &mut NodeRegistry, config: &AppConfig) {
    use crate::nodes::first_stage::FirstStageNode;
    use crate::nodes::model_loader::ModelLoaderNode;
    use crate::nodes::restore_sampler::RestoreSamplerNode;
    use crate::nodes::vae_decode::VaeDecodeNode;
    use crate::nodes::vae_encode::VaeEncodeNode;

    let loader_config = config.clone();
    registry.register("RestorationModelLoader", move |_params| {
        Ok(Box::new(ModelLoaderNode::new(&loader_config)?))
    });
    registry.register("VaeEncode", |_params| Ok(Box::new(VaeEncodeNode::new())));
    registry.register("VaeDecode", |_params| Ok(Box::new(VaeDecodeNode::new())));
    registry.register("FirstStage", |_params| Ok(Box::new(FirstStageNode::new())));
    registry.register("RestorationSampler", |_params| {
        Ok(Box::new(RestoreSamplerNode::new()))
    });
}

pub fn build_default_registry(config: &AppConfig) -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_all_nodes(&mut registry, config);
    registry
}
