use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::types::{PortData, PortType};

/// Extra validation metadata a port can declare.
///
/// Scalar ports carry a range and step so the host can render a slider;
/// string ports can restrict themselves to a fixed set of choices.
#[derive(Debug, Clone, PartialEq)]
pub enum PortConstraints {
    Range { min: f64, max: f64, step: f64 },
    Choices(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortDefinition {
    pub name: String,
    pub port_type: PortType,
    pub required: bool,
    pub default_value: Option<serde_json::Value>,
    pub constraints: Option<PortConstraints>,
}

impl PortDefinition {
    pub fn required(name: &str, port_type: PortType) -> Self {
        Self {
            name: name.to_string(),
            port_type,
            required: true,
            default_value: None,
            constraints: None,
        }
    }

    pub fn optional(name: &str, port_type: PortType, default: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            port_type,
            required: false,
            default_value: Some(default),
            constraints: None,
        }
    }

    pub fn with_range(mut self, min: f64, max: f64, step: f64) -> Self {
        self.constraints = Some(PortConstraints::Range { min, max, step });
        self
    }

    pub fn with_choices(mut self, choices: &[&str]) -> Self {
        self.constraints = Some(PortConstraints::Choices(
            choices.iter().map(|c| c.to_string()).collect(),
        ));
        self
    }
}

/// Batch progress shared between a node and the host.
///
/// Nodes set the total when they learn the batch size and advance once per
/// item; the host polls `fraction` to drive its indicator.
#[derive(Debug, Default)]
pub struct Progress {
    total: AtomicU64,
    done: AtomicU64,
}

impl Progress {
    pub fn start(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
    }

    pub fn advance(&self) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fraction(&self) -> Option<f32> {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        let done = self.done.load(Ordering::Relaxed);
        Some((done as f32 / total as f32).clamp(0.0, 1.0))
    }
}

#[derive(Default)]
pub struct ExecutionContext {
    pub progress: Arc<Progress>,
}

/// Core node trait that all plugin nodes implement.
pub trait Node: Send {
    fn node_type(&self) -> &str;
    fn input_ports(&self) -> Vec<PortDefinition>;
    fn output_ports(&self) -> Vec<PortDefinition>;
    fn execute(
        &mut self,
        inputs: &HashMap<String, PortData>,
        ctx: &ExecutionContext,
    ) -> Result<HashMap<String, PortData>>;
}

/// Input lookup helpers shared by the node adapters. Missing optional inputs
/// fall back to the provided default; type mismatches are reported with the
/// port name.
pub fn require_int(inputs: &HashMap<String, PortData>, name: &str, default: i64) -> Result<i64> {
    match inputs.get(name) {
        Some(PortData::Int(v)) => Ok(*v),
        Some(_) => anyhow::bail!("{name} must be an Int"),
        None => Ok(default),
    }
}

pub fn require_float(inputs: &HashMap<String, PortData>, name: &str, default: f64) -> Result<f64> {
    match inputs.get(name) {
        Some(PortData::Float(v)) => Ok(*v),
        Some(PortData::Int(v)) => Ok(*v as f64),
        Some(_) => anyhow::bail!("{name} must be a Float"),
        None => Ok(default),
    }
}

pub fn require_bool(inputs: &HashMap<String, PortData>, name: &str, default: bool) -> Result<bool> {
    match inputs.get(name) {
        Some(PortData::Bool(v)) => Ok(*v),
        Some(_) => anyhow::bail!("{name} must be a Bool"),
        None => Ok(default),
    }
}

pub fn require_str(
    inputs: &HashMap<String, PortData>,
    name: &str,
    default: &str,
) -> Result<String> {
    match inputs.get(name) {
        Some(PortData::Str(v)) => Ok(v.clone()),
        Some(_) => anyhow::bail!("{name} must be a Str"),
        None => Ok(default.to_string()),
    }
}

pub fn require_path(
    inputs: &HashMap<String, PortData>,
    name: &str,
) -> Result<std::path::PathBuf> {
    match inputs.get(name) {
        Some(PortData::Path(p)) => Ok(p.clone()),
        Some(_) => anyhow::bail!("{name} must be a Path"),
        None => anyhow::bail!("{name} is required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_definition_builders() {
        let input = PortDefinition::required("image", PortType::Image);
        assert_eq!(input.name, "image");
        assert!(input.required);
        assert!(input.default_value.is_none());
        assert!(input.constraints.is_none());

        let steps = PortDefinition::optional("steps", PortType::Int, serde_json::json!(45))
            .with_range(3.0, 4096.0, 1.0);
        assert!(!steps.required);
        assert_eq!(steps.default_value, Some(serde_json::json!(45)));
        assert_eq!(
            steps.constraints,
            Some(PortConstraints::Range {
                min: 3.0,
                max: 4096.0,
                step: 1.0
            })
        );

        let dtype = PortDefinition::optional("dtype", PortType::Str, serde_json::json!("auto"))
            .with_choices(&["auto", "fp16", "bf16", "fp32"]);
        match dtype.constraints {
            Some(PortConstraints::Choices(choices)) => {
                assert_eq!(choices, vec!["auto", "fp16", "bf16", "fp32"]);
            }
            other => panic!("expected choices, got {other:?}"),
        }
    }

    #[test]
    fn test_progress_fraction() {
        let progress = Progress::default();
        assert_eq!(progress.fraction(), None);

        progress.start(4);
        assert_eq!(progress.fraction(), Some(0.0));
        progress.advance();
        progress.advance();
        assert_eq!(progress.fraction(), Some(0.5));
        progress.advance();
        progress.advance();
        assert_eq!(progress.fraction(), Some(1.0));
    }

    #[test]
    fn test_progress_restart_resets_done() {
        let progress = Progress::default();
        progress.start(2);
        progress.advance();
        progress.advance();
        progress.start(5);
        assert_eq!(progress.fraction(), Some(0.0));
    }

    #[test]
    fn test_input_helpers() {
        let mut inputs = HashMap::new();
        inputs.insert("steps".to_string(), PortData::Int(20));
        inputs.insert("scale".to_string(), PortData::Float(4.5));
        inputs.insert("tiled".to_string(), PortData::Bool(true));
        inputs.insert("prompt".to_string(), PortData::Str("hi".to_string()));

        assert_eq!(require_int(&inputs, "steps", 45).expect("int"), 20);
        assert_eq!(require_int(&inputs, "missing", 45).expect("int"), 45);
        assert_eq!(require_float(&inputs, "scale", 1.0).expect("float"), 4.5);
        // Int is accepted where a Float is expected; hosts send both.
        assert_eq!(require_float(&inputs, "steps", 1.0).expect("float"), 20.0);
        assert!(require_bool(&inputs, "tiled", false).expect("bool"));
        assert_eq!(require_str(&inputs, "prompt", "").expect("str"), "hi");
        assert!(require_path(&inputs, "prompt").is_err());
        assert!(require_path(&inputs, "missing").is_err());
        assert!(require_int(&inputs, "prompt", 0).is_err());
    }
}
