use serde::{Deserialize, Serialize};

use crate::core::{ElementNode, Node};

/// Structural role of a node. A node's class fully determines how it is edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeClass {
    Leaf,
    Inline,
    #[default]
    Text,
    TextBlock,
    Block,
    Void,
    /// Plugin-level class for declarations that contribute no node shape.
    Generic,
}

impl NodeClass {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeClass::Leaf => "leaf",
            NodeClass::Inline => "inline",
            NodeClass::Text => "text",
            NodeClass::TextBlock => "textblock",
            NodeClass::Block => "block",
            NodeClass::Void => "void",
            NodeClass::Generic => "generic",
        }
    }

    /// Whether text can be typed directly into nodes of this class.
    pub fn accepts_text(self) -> bool {
        match self {
            NodeClass::Leaf | NodeClass::Inline | NodeClass::Text | NodeClass::TextBlock => true,
            NodeClass::Block | NodeClass::Void | NodeClass::Generic => false,
        }
    }

    /// Classes whose nodes must carry a document-unique id.
    pub fn requires_id(self) -> bool {
        match self {
            NodeClass::Leaf | NodeClass::Inline | NodeClass::Block | NodeClass::Void => true,
            NodeClass::Text | NodeClass::TextBlock | NodeClass::Generic => false,
        }
    }

    /// Block-level classes that may not live inside a text-classed ancestor.
    pub fn is_block_level(self) -> bool {
        matches!(self, NodeClass::Block | NodeClass::TextBlock)
    }
}

impl std::fmt::Display for NodeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn element(node: &Node) -> Option<&ElementNode> {
    match node {
        Node::Element(el) => Some(el),
        Node::Text(_) => None,
    }
}

fn class_is(node: &Node, class: NodeClass) -> bool {
    element(node).is_some_and(|el| el.class == class)
}

/// Text leaves are implicitly `leaf`; elements may also declare it.
pub fn is_leaf(node: &Node) -> bool {
    match node {
        Node::Text(_) => true,
        Node::Element(el) => el.class == NodeClass::Leaf,
    }
}

pub fn is_inline(node: &Node) -> bool {
    class_is(node, NodeClass::Inline)
}

pub fn is_text(node: &Node) -> bool {
    element(node).is_some_and(|el| matches!(el.class, NodeClass::Text | NodeClass::TextBlock))
}

/// Legacy alias of [`is_text`].
pub fn is_text_block(node: &Node) -> bool {
    is_text(node)
}

pub fn is_block(node: &Node) -> bool {
    class_is(node, NodeClass::Block)
}

pub fn is_void(node: &Node) -> bool {
    class_is(node, NodeClass::Void)
}

pub fn is_of_type(node: &Node, kind: &str) -> bool {
    element(node).is_some_and(|el| el.kind == kind)
}

pub fn has_id(node: &Node, id: &str) -> bool {
    element(node).is_some_and(|el| el.id.as_deref() == Some(id))
}
