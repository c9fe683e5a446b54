use crate::core::{Document, ElementNode, Node};
use crate::plugin::PluginRegistry;
use crate::spellcheck::SpellcheckEngine;

/// Copy of `doc` with transient leaf decorations filled in for rendering:
/// spelling errors from `spellcheck` and placeholders for empty elements.
pub fn decorate(
    doc: &Document,
    registry: &PluginRegistry,
    spellcheck: Option<&SpellcheckEngine>,
) -> Document {
    let mut out = doc.clone();
    for node in &mut out.children {
        let Node::Element(el) = node else {
            continue;
        };
        if let Some(engine) = spellcheck {
            for (path, decoration) in engine.decorations(el) {
                if let Some(Node::Text(leaf)) = leaf_mut(el, &path) {
                    leaf.decorations.spelling_errors.push(decoration);
                }
            }
        }
        decorate_placeholders(el, registry);
    }
    out
}

fn decorate_placeholders(el: &mut ElementNode, registry: &PluginRegistry) {
    let empty = el
        .children
        .iter()
        .all(|c| matches!(c, Node::Text(t) if t.text.is_empty()));
    if empty {
        if let Some(Node::Text(leaf)) = el.children.first_mut() {
            leaf.decorations.placeholder = registry.placeholder(&el.kind).map(str::to_string);
        }
        return;
    }
    for child in &mut el.children {
        if let Node::Element(child) = child {
            decorate_placeholders(child, registry);
        }
    }
}

fn leaf_mut<'a>(el: &'a mut ElementNode, path: &[usize]) -> Option<&'a mut Node> {
    let (&first, rest) = path.split_first()?;
    let mut node = el.children.get_mut(first)?;
    for &ix in rest {
        node = match node {
            Node::Element(el) => el.children.get_mut(ix)?,
            Node::Text(_) => return None,
        };
    }
    Some(node)
}
