use std::collections::BTreeMap;

use dslink_protocol::Value;

use crate::node::NodeView;

/// A node on another link, rebuilt from `list` updates.
///
/// Plain data: mutating it changes nothing remotely.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteNode {
    name: String,
    path: String,
    configs: BTreeMap<String, Value>,
    attributes: BTreeMap<String, Value>,
    children: BTreeMap<String, RemoteNode>,
    value: Option<Value>,
}

impl RemoteNode {
    pub fn new(path: &str) -> Self {
        let path = if path.is_empty() { "/" } else { path };
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            name,
            path: path.to_string(),
            ..Default::default()
        }
    }

    fn child_path(&self, name: &str) -> String {
        if self.path.ends_with('/') {
            format!("{}{name}", self.path)
        } else {
            format!("{}/{name}", self.path)
        }
    }

    /// Configs, keys without `$`.
    pub fn configs(&self) -> &BTreeMap<String, Value> {
        &self.configs
    }

    /// Attributes, keys without `@`.
    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn child(&self, name: &str) -> Option<&RemoteNode> {
        self.children.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = &RemoteNode> {
        self.children.values()
    }

    /// Last value seen in a list summary, if any.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Fold one batch of list updates into this node.
    pub(crate) fn apply_updates(&mut self, updates: &[Value]) {
        for update in updates {
            match update {
                Value::Array(pair) => {
                    let Some(key) = pair.first().and_then(Value::as_str) else {
                        continue;
                    };
                    let value = pair.get(1).cloned().unwrap_or_default();
                    self.apply_entry(key, value);
                }
                Value::Map(_) => {
                    let removal = update.get("change").and_then(Value::as_str) == Some("remove");
                    if let (true, Some(name)) = (removal, update.get("name").and_then(Value::as_str)) {
                        self.remove_entry(name);
                    }
                }
                _ => tracing::debug!(path = %self.path, "ignoring list update {update}"),
            }
        }
    }

    fn apply_entry(&mut self, key: &str, value: Value) {
        if let Some(config) = key.strip_prefix('$') {
            self.configs.insert(config.to_string(), value);
        } else if let Some(attribute) = key.strip_prefix('@') {
            self.attributes.insert(attribute.to_string(), value);
        } else {
            let mut child = RemoteNode::new(&self.child_path(key));
            if let Some(summary) = value.as_map() {
                for (k, v) in summary {
                    if let Some(config) = k.strip_prefix('$') {
                        child.configs.insert(config.to_string(), v.clone());
                    } else if let Some(attribute) = k.strip_prefix('@') {
                        child.attributes.insert(attribute.to_string(), v.clone());
                    } else if k == "value" {
                        child.value = Some(v.clone());
                    }
                }
            }
            self.children.insert(key.to_string(), child);
        }
    }

    fn remove_entry(&mut self, name: &str) {
        if let Some(config) = name.strip_prefix('$') {
            self.configs.remove(config);
        } else if let Some(attribute) = name.strip_prefix('@') {
            self.attributes.remove(attribute);
        } else {
            self.children.remove(name);
        }
    }
}

impl NodeView for RemoteNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn config(&self, key: &str) -> Option<Value> {
        self.configs.get(key.strip_prefix('$').unwrap_or(key)).cloned()
    }

    fn attribute(&self, key: &str) -> Option<Value> {
        self.attributes.get(key.strip_prefix('@').unwrap_or(key)).cloned()
    }

    fn child_names(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    fn current_value(&self) -> Value {
        self.value.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    fn raw(json: &str) -> Vec<Value> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn rebuilds_from_list_updates() {
        let mut node = RemoteNode::new("/downstream/weather");
        node.apply_updates(&raw(
            r#"[["$is","node"],["$name","Weather"],["@site","roof"],
                ["temp",{"$type":"number","$is":"node","value":21.5}],
                ["wind",{"$is":"node"}]]"#,
        ));
        assert_eq!(node.name(), "weather");
        assert_eq!(node.profile(), "node");
        assert_eq!(node.config("$name"), Some(Value::from("Weather")));
        assert_eq!(node.attribute("site"), Some(Value::from("roof")));
        assert_eq!(node.child_names(), vec!["temp", "wind"]);

        let temp = node.child("temp").unwrap();
        assert_eq!(temp.path(), "/downstream/weather/temp");
        assert_eq!(temp.value(), Some(&Value::Double(21.5)));

        node.apply_updates(&raw(r#"[{"name":"wind","change":"remove"},{"name":"@site","change":"remove"}]"#));
        assert_eq!(node.child_names(), vec!["temp"]);
        assert!(node.attribute("site").is_none());
    }

    #[test]
    fn mirrors_local_list_output() {
        let local = Node::detached_root();
        local
            .create_child("n")
            .unwrap()
            .display_name("N")
            .value(3)
            .build()
            .unwrap();

        let mut remote = RemoteNode::new("/");
        remote.apply_updates(&local.list_updates());
        let n = remote.child("n").unwrap();
        assert_eq!(n.path(), "/n");
        assert_eq!(n.config("name"), Some(Value::from("N")));
        assert_eq!(n.current_value(), Value::Int(3));
    }
}
