//! Named transition groups: a shared enabled flag that gates every member
//! transition, default config inherited by members, and a serializable
//! description. Condition functions cannot serialize; rehydration takes
//! them back from a caller-supplied map keyed `"from->to"`.

use serde::{Deserialize, Serialize};

use crate::types::RetryPolicy;

/// Defaults applied to member transitions that leave the matching knob
/// unset.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryPolicy>,
}

/// One member edge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupEdge {
    pub from: String,
    pub to: String,
    /// Per-edge override of the group defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<GroupConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl GroupEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            config: None,
            tags: Vec::new(),
        }
    }

    /// Key into the condition map used on rehydration.
    pub fn key(&self) -> String {
        edge_key(&self.from, &self.to)
    }
}

pub fn edge_key(from: &str, to: &str) -> String {
    format!("{from}->{to}")
}

/// A transition group. This is plain serializable data; the machine owns
/// the registry and the behavioral side (filtering, defaults).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub config: GroupConfig,
    pub transitions: Vec<GroupEdge>,
    /// A disabled ancestor disables this group too.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_group: Option<String>,
}

impl TransitionGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            enabled: true,
            config: GroupConfig::default(),
            transitions: Vec::new(),
            parent_group: None,
        }
    }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn config(mut self, config: GroupConfig) -> Self {
        self.config = config;
        self
    }

    pub fn edge(mut self, edge: GroupEdge) -> Self {
        self.transitions.push(edge);
        self
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_group = Some(parent.into());
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> TransitionGroup {
        TransitionGroup::new("network")
            .namespace("io")
            .config(GroupConfig {
                priority: Some(5),
                debounce: Some(100),
                retry_config: Some(RetryPolicy::new(3, 20)),
            })
            .edge(GroupEdge::new("idle", "connecting"))
            .edge(GroupEdge {
                from: "connecting".into(),
                to: "online".into(),
                config: Some(GroupConfig {
                    priority: Some(9),
                    ..Default::default()
                }),
                tags: vec!["happy-path".into()],
            })
            .parent("root")
    }

    #[test]
    fn json_round_trip_is_lossless() {
        let group = sample();
        let restored = TransitionGroup::from_json(&group.to_json().unwrap()).unwrap();
        assert_eq!(restored, group);
    }

    #[test]
    fn wire_field_names() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["name"], json!("network"));
        assert_eq!(value["namespace"], json!("io"));
        assert_eq!(value["enabled"], json!(true));
        assert_eq!(value["parentGroup"], json!("root"));
        assert_eq!(value["config"]["retryConfig"]["maxAttempts"], json!(3));
        assert_eq!(value["config"]["retryConfig"]["delay"], json!(20));
        assert_eq!(value["transitions"][0]["from"], json!("idle"));
        assert_eq!(value["transitions"][1]["tags"][0], json!("happy-path"));
    }

    #[test]
    fn optional_fields_are_omitted() {
        let plain = TransitionGroup::new("g").edge(GroupEdge::new("a", "b"));
        let value = serde_json::to_value(&plain).unwrap();
        assert!(value.get("namespace").is_none());
        assert!(value.get("parentGroup").is_none());
        assert!(value["transitions"][0].get("config").is_none());
        assert!(value["transitions"][0].get("tags").is_none());
    }

    #[test]
    fn edge_keys() {
        assert_eq!(GroupEdge::new("a", "b").key(), "a->b");
    }
}
