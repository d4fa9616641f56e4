//! The metrics meta message: what each column of the following data means.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::series::mapping::{Mapping, MappingNode};

/// One metric column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricDesc {
    pub name: String,

    /// Per-instance metrics (network interfaces, disks…) nest one level deeper.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derive: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `{metrics: [...], now?, timestamp?, ...}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsMeta {
    #[serde(default)]
    pub metrics: Vec<MetricDesc>,

    /// Server wall clock (ms) when the message was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub now: Option<f64>,

    /// Sample time (ms) of the first row of the next data message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MetricsMeta {
    /// Builds the name mapping for this layout.
    ///
    /// `path_names` replaces metric names position by position; an empty
    /// instance name maps to `/`.
    pub fn mapping(&self, path_names: Option<&[String]>) -> Mapping {
        let mut mapping = Mapping::new();
        for (i, metric) in self.metrics.iter().enumerate() {
            let name = path_names
                .and_then(|names| names.get(i))
                .cloned()
                .unwrap_or_else(|| metric.name.clone());

            let mut node = MappingNode::new(i);
            for (j, instance) in metric.instances.iter().flatten().enumerate() {
                let instance = if instance.is_empty() { "/" } else { instance.as_str() };
                node.children.insert(instance, MappingNode::new(j));
            }
            mapping.insert(name, node);
        }
        mapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mapping_indexes_metrics_and_instances() {
        // Arrange
        let meta: MetricsMeta = serde_json::from_value(json!({
            "metrics": [
                {"name": "cpu.basic.user", "units": "millisec"},
                {"name": "network.interface.in.bytes", "instances": ["eth0", ""]}
            ],
            "now": 1000,
            "timestamp": 900
        }))
        .unwrap();

        // Act
        let mapping = meta.mapping(None);

        // Assert
        assert_eq!(mapping.get("cpu.basic.user").unwrap().index, 0);
        let net = mapping.get("network.interface.in.bytes").unwrap();
        assert_eq!(net.index, 1);
        assert_eq!(net.children.get("eth0").unwrap().index, 0);
        assert_eq!(net.children.get("/").unwrap().index, 1);
    }

    #[test]
    fn test_path_names_override_metric_names() {
        let meta: MetricsMeta = serde_json::from_value(json!({
            "metrics": [{"name": "a"}, {"name": "b"}]
        }))
        .unwrap();

        let names = vec!["first".to_owned(), "second".to_owned()];
        let mapping = meta.mapping(Some(&names));

        assert!(mapping.get("a").is_none());
        assert_eq!(mapping.get("second").unwrap().index, 1);
    }
}
