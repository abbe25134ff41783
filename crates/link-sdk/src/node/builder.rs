use std::sync::atomic::Ordering;

use dslink_protocol::{Permission, Value};

use super::{ActionHandler, Node, CLASS_KEY};
use crate::types::Result;

/// Stages a child node.  Nothing is visible to list streams or
/// subscribers until [`build`](Self::build).
///
/// ```ignore
/// let temp = root
///     .create_child("temperature")?
///     .display_name("Temperature")
///     .value_type("number")
///     .attribute("unit", "°C")
///     .value(21.5)
///     .build()?;
/// ```
#[must_use = "a staged node joins the tree only when built"]
pub struct NodeBuilder {
    parent: Node,
    node: Node,
}

impl NodeBuilder {
    pub(crate) fn new(parent: Node, node: Node) -> Self {
        Self { parent, node }
    }

    /// The node being built.
    pub fn node(&self) -> &Node {
        &self.node
    }

    /// `$name`
    pub fn display_name(self, name: &str) -> Self {
        self.config("name", name)
    }

    /// `$is`
    pub fn profile(self, profile: &str) -> Self {
        self.config("is", profile)
    }

    /// `$type`
    pub fn value_type(self, type_name: &str) -> Self {
        self.config("type", type_name)
    }

    /// `$writable`
    pub fn writable(self, permission: Permission) -> Self {
        self.config("writable", permission)
    }

    /// `$hidden`
    pub fn hidden(self, hidden: bool) -> Self {
        self.config("hidden", hidden)
    }

    pub fn config(self, key: &str, value: impl Into<Value>) -> Self {
        self.node.configs().set(key, value);
        self
    }

    pub fn attribute(self, key: &str, value: impl Into<Value>) -> Self {
        self.node.attributes().set(key, value);
        self
    }

    pub fn private_config(self, key: &str, value: impl Into<Value>) -> Self {
        self.node.private_configs().set(key, value);
        self
    }

    /// Tag with a node class registered on the responder.
    pub fn class(self, name: &str) -> Self {
        self.private_config(CLASS_KEY, name)
    }

    /// Initial value.  Sets `$type` from the value when none was given.
    pub fn value(self, value: impl Into<Value>) -> Self {
        let value = value.into();
        if !self.node.configs().contains("type") && !value.is_null() {
            self.node.configs().set("type", value.type_name());
        }
        self.node.value().set(value);
        self
    }

    pub fn action(self, handler: ActionHandler) -> Self {
        self.node.set_action(handler);
        self
    }

    /// Add the node to its parent and make it live.
    pub fn build(self) -> Result<Node> {
        self.parent.add_child(&self.node)?;
        self.node.0.building.store(false, Ordering::SeqCst);
        if let Some(core) = self.node.core() {
            core.on_node_built(&self.node);
        }
        Ok(self.node)
    }
}
