//! Fixpoint repair of structural invariants.
//!
//! [`Normalizer::next_correction`] scans the document top-down and returns the
//! first correction it finds. The editor applies it and scans again from the
//! top, until a full scan finds nothing. Per element the rules run in order:
//!
//! 1. unwrap block-level nodes nested in a text-classed ancestor,
//! 2. repair container shape against the declared child slots,
//! 3. assign fresh ids to structural nodes with a missing or colliding id,
//! 4. run the component's own `normalize_node`,
//! 5. element defaults (a text leaf in empty elements, merged adjacent leaves),
//!    skipped when step 4 reported the node as handled.

use std::collections::HashMap;

use crate::classify::NodeClass;
use crate::core::{Document, ElementNode, Node};
use crate::id::IdGenerator;
use crate::ops::{Op, Path};
use crate::plugin::{ComponentEntry, PluginRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    NonEmptyDocument,
    Unwrap,
    ShapeRepair,
    AssignId,
    PluginCustom,
    ElementDefaults,
}

impl Rule {
    pub fn id(self) -> &'static str {
        match self {
            Rule::NonEmptyDocument => "core.non_empty_document",
            Rule::Unwrap => "core.unwrap_block_in_text",
            Rule::ShapeRepair => "core.shape_repair",
            Rule::AssignId => "core.assign_id",
            Rule::PluginCustom => "plugin.normalize_node",
            Rule::ElementDefaults => "core.element_defaults",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub rule: Rule,
    pub path: Path,
    pub ops: Vec<Op>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeOutcome {
    Unhandled,
    /// The node is handled; a non-empty op list is applied as a correction.
    Handled(Vec<Op>),
}

#[derive(Clone, Copy)]
pub struct NodeEntry<'a> {
    pub node: &'a ElementNode,
    pub path: &'a [usize],
}

/// Read-only view handed to component `normalize_node` callbacks.
pub struct NormalizeCx<'a> {
    pub doc: &'a Document,
    pub registry: &'a PluginRegistry,
    ids: &'a dyn IdGenerator,
}

impl NormalizeCx<'_> {
    pub fn fresh_id(&self) -> String {
        self.ids.next_id()
    }
}

pub trait NormalizeNode: Send + Sync {
    fn normalize(&self, cx: &NormalizeCx<'_>, entry: NodeEntry<'_>) -> NormalizeOutcome;
}

impl<F> NormalizeNode for F
where
    F: Fn(&NormalizeCx<'_>, NodeEntry<'_>) -> NormalizeOutcome + Send + Sync,
{
    fn normalize(&self, cx: &NormalizeCx<'_>, entry: NodeEntry<'_>) -> NormalizeOutcome {
        self(cx, entry)
    }
}

pub struct Normalizer<'a> {
    registry: &'a PluginRegistry,
    ids: &'a dyn IdGenerator,
    default_block_type: &'a str,
}

impl<'a> Normalizer<'a> {
    pub fn new(
        registry: &'a PluginRegistry,
        ids: &'a dyn IdGenerator,
        default_block_type: &'a str,
    ) -> Self {
        Self {
            registry,
            ids,
            default_block_type,
        }
    }

    /// `fresh` holds paths of subtrees inserted or split off by the edit being
    /// normalized; on an id collision those lose their id, not older nodes.
    pub fn next_correction(&self, doc: &Document, fresh: &[Path]) -> Option<Correction> {
        if doc.children.is_empty() {
            let mut node = self.default_element();
            node.id = Some(self.ids.next_id());
            return Some(Correction {
                rule: Rule::NonEmptyDocument,
                path: vec![0],
                ops: vec![Op::InsertNode {
                    path: vec![0],
                    node: Node::Element(node),
                }],
            });
        }

        let ids = IdIndex::build(doc, fresh);
        let cx = NormalizeCx {
            doc,
            registry: self.registry,
            ids: self.ids,
        };
        self.scan(&doc.children, &mut Vec::new(), false, &ids, &cx)
    }

    pub fn default_element(&self) -> ElementNode {
        let class = self
            .registry
            .class_of(self.default_block_type)
            .unwrap_or(NodeClass::Text);
        ElementNode::new(self.default_block_type, class).with_child(Node::text(""))
    }

    fn scan(
        &self,
        children: &[Node],
        path: &mut Path,
        in_text: bool,
        ids: &IdIndex,
        cx: &NormalizeCx<'_>,
    ) -> Option<Correction> {
        for (ix, node) in children.iter().enumerate() {
            let Node::Element(el) = node else {
                continue;
            };

            path.push(ix);
            if let Some(correction) = self.visit(el, path, children.len(), in_text, ids, cx) {
                return Some(correction);
            }
            let child_in_text = in_text || matches!(el.class, NodeClass::Text | NodeClass::TextBlock);
            if let Some(correction) = self.scan(&el.children, path, child_in_text, ids, cx) {
                return Some(correction);
            }
            path.pop();
        }
        None
    }

    fn visit(
        &self,
        el: &ElementNode,
        path: &[usize],
        siblings: usize,
        in_text: bool,
        ids: &IdIndex,
        cx: &NormalizeCx<'_>,
    ) -> Option<Correction> {
        let correction = |rule: Rule, ops: Vec<Op>| {
            tracing::debug!(
                target: "plate::normalize",
                rule = rule.id(),
                ?path,
                kind = %el.kind,
                ops = ops.len(),
                "normalization correction"
            );
            Some(Correction {
                rule,
                path: path.to_vec(),
                ops,
            })
        };

        if in_text && el.class.is_block_level() && path.len() > 1 {
            return correction(Rule::Unwrap, unwrap_ops(el, path, siblings));
        }

        if let Some(ops) = self.repair_shape(el, path) {
            return correction(Rule::ShapeRepair, ops);
        }

        let structural = path.len() == 1 || el.class.requires_id();
        if structural && ids.needs_fresh_id(el, path) {
            return correction(
                Rule::AssignId,
                vec![Op::SetNodeId {
                    path: path.to_vec(),
                    id: Some(self.ids.next_id()),
                }],
            );
        }

        let mut handled = false;
        if let Some(custom) = self
            .registry
            .constraints(&el.kind)
            .and_then(|c| c.normalize_node.as_ref())
        {
            match custom.normalize(cx, NodeEntry { node: el, path }) {
                NormalizeOutcome::Handled(ops) if !ops.is_empty() => {
                    return correction(Rule::PluginCustom, ops);
                }
                NormalizeOutcome::Handled(_) => handled = true,
                NormalizeOutcome::Unhandled => {}
            }
        }

        if !handled {
            if let Some(ops) = element_defaults(el, path) {
                return correction(Rule::ElementDefaults, ops);
            }
        }

        None
    }

    fn repair_shape(&self, el: &ElementNode, path: &[usize]) -> Option<Vec<Op>> {
        let entry = self.registry.entry(&el.kind)?;
        let slots: Vec<(String, &ComponentEntry)> = entry
            .component
            .children
            .iter()
            .filter_map(|slot| {
                let kind = slot.kind.as_deref()?;
                Some((format!("{}/{kind}", el.kind), slot))
            })
            .collect();
        if slots.is_empty() {
            return None;
        }

        let meaningful = el.children.iter().any(|child| match child {
            Node::Element(_) => true,
            Node::Text(t) => !t.text.is_empty(),
        });
        if !meaningful {
            return Some(vec![Op::RemoveNode {
                path: path.to_vec(),
            }]);
        }

        let count_of = |key: &str| {
            el.children
                .iter()
                .filter(|c| matches!(c, Node::Element(ch) if ch.kind == key))
                .count()
        };

        let mut wanted: HashMap<&str, usize> = HashMap::new();
        for (ix, (key, slot)) in slots.iter().enumerate() {
            let occurrence = {
                let seen = wanted.entry(key.as_str()).or_default();
                *seen += 1;
                *seen
            };
            if slot.optional || count_of(key) >= occurrence {
                continue;
            }

            let earlier: Vec<&str> = slots[..ix].iter().map(|(k, _)| k.as_str()).collect();
            let at = el
                .children
                .iter()
                .rposition(|c| matches!(c, Node::Element(ch) if earlier.contains(&ch.kind.as_str())))
                .map_or(0, |p| p + 1);
            let mut insert_path = path.to_vec();
            insert_path.push(at);
            return Some(vec![Op::InsertNode {
                path: insert_path,
                node: self.synthesize(key, slot),
            }]);
        }

        let mut checked: Vec<&str> = Vec::new();
        for (key, _) in &slots {
            if checked.contains(&key.as_str()) {
                continue;
            }
            checked.push(key);
            let allowed = wanted.get(key.as_str()).copied().unwrap_or(0);
            let mut matching = el
                .children
                .iter()
                .enumerate()
                .filter_map(|(ix, c)| match c {
                    Node::Element(ch) if ch.kind == *key => Some((ix, ch)),
                    _ => None,
                });
            let Some((extra_ix, extra)) = matching.nth(allowed) else {
                continue;
            };
            return Some(self.lift_excess(path, extra_ix, extra));
        }

        None
    }

    /// Moves an excess slot child out of its container as a default node.
    /// Type-specific properties of the lifted node are dropped.
    fn lift_excess(&self, container: &[usize], ix: usize, extra: &ElementNode) -> Vec<Op> {
        let mut lifted = self.default_element();
        lifted.id = extra.id.clone();
        lifted.lang = extra.lang.clone();
        if !extra.children.is_empty() {
            lifted.children = extra.children.clone();
        }

        let mut remove_path = container.to_vec();
        remove_path.push(ix);
        let mut insert_path = container.to_vec();
        if let Some(last) = insert_path.last_mut() {
            *last += 1;
        }
        vec![
            Op::RemoveNode { path: remove_path },
            Op::InsertNode {
                path: insert_path,
                node: Node::Element(lifted),
            },
        ]
    }

    /// Builds an empty node for a slot, with its own required slots filled.
    fn synthesize(&self, key: &str, slot: &ComponentEntry) -> Node {
        let mut el = ElementNode::new(key, slot.class.unwrap_or_default());
        for child in slot.children.iter().filter(|c| !c.optional) {
            if let Some(kind) = child.kind.as_deref() {
                el.children.push(self.synthesize(&format!("{key}/{kind}"), child));
            }
        }
        if el.children.is_empty() {
            el.children.push(Node::text(""));
        }
        Node::Element(el)
    }
}

/// Splits the parent around `el` and splices `el`'s children in its place.
fn unwrap_ops(el: &ElementNode, path: &[usize], siblings: usize) -> Vec<Op> {
    let Some((&ix, parent)) = path.split_last() else {
        return Vec::new();
    };

    let mut ops = Vec::new();
    if ix + 1 < siblings {
        ops.push(Op::SplitNode {
            path: parent.to_vec(),
            position: ix + 1,
            id: None,
        });
    }

    let mut at = path.to_vec();
    if ix > 0 {
        ops.push(Op::SplitNode {
            path: parent.to_vec(),
            position: ix,
            id: None,
        });
        at = parent.to_vec();
        if let Some(last) = at.last_mut() {
            *last += 1;
        }
        at.push(0);
    }

    ops.push(Op::RemoveNode { path: at.clone() });
    for (k, child) in el.children.iter().enumerate() {
        let mut child_path = at.clone();
        if let Some(last) = child_path.last_mut() {
            *last += k;
        }
        ops.push(Op::InsertNode {
            path: child_path,
            node: child.clone(),
        });
    }
    ops
}

fn element_defaults(el: &ElementNode, path: &[usize]) -> Option<Vec<Op>> {
    if el.children.is_empty() {
        let mut insert_path = path.to_vec();
        insert_path.push(0);
        return Some(vec![Op::InsertNode {
            path: insert_path,
            node: Node::text(""),
        }]);
    }

    for ix in 1..el.children.len() {
        let (Node::Text(left), Node::Text(right)) = (&el.children[ix - 1], &el.children[ix]) else {
            continue;
        };
        if left.marks != right.marks {
            continue;
        }
        let mut merge_path = path.to_vec();
        merge_path.push(ix);
        return Some(vec![Op::MergeNode {
            path: merge_path,
            position: left.text.len(),
        }]);
    }

    None
}

/// Occurrences of every element id, and which occurrence keeps a shared id.
struct IdIndex {
    counts: HashMap<String, usize>,
    keepers: HashMap<String, Path>,
}

impl IdIndex {
    fn build(doc: &Document, fresh: &[Path]) -> Self {
        let mut occurrences: Vec<(&str, Path)> = Vec::new();
        fn walk<'d>(children: &'d [Node], path: &mut Path, out: &mut Vec<(&'d str, Path)>) {
            for (ix, node) in children.iter().enumerate() {
                let Node::Element(el) = node else {
                    continue;
                };
                path.push(ix);
                if let Some(id) = el.id.as_deref().filter(|id| !id.is_empty()) {
                    out.push((id, path.clone()));
                }
                walk(&el.children, path, out);
                path.pop();
            }
        }
        walk(&doc.children, &mut Vec::new(), &mut occurrences);

        let is_fresh = |path: &Path| fresh.iter().any(|f| path.starts_with(f));

        let mut counts: HashMap<String, usize> = HashMap::new();
        for (id, _) in &occurrences {
            *counts.entry((*id).to_string()).or_default() += 1;
        }

        let mut keepers: HashMap<String, Path> = HashMap::new();
        for (id, path) in &occurrences {
            if counts[*id] > 1 && !is_fresh(path) && !keepers.contains_key(*id) {
                keepers.insert((*id).to_string(), path.clone());
            }
        }
        for (id, path) in &occurrences {
            if counts[*id] > 1 && !keepers.contains_key(*id) {
                keepers.insert((*id).to_string(), path.clone());
            }
        }

        Self { counts, keepers }
    }

    fn needs_fresh_id(&self, el: &ElementNode, path: &[usize]) -> bool {
        let Some(id) = el.id.as_deref().filter(|id| !id.is_empty()) else {
            return true;
        };
        if self.counts.get(id).copied().unwrap_or(0) < 2 {
            return false;
        }
        self.keepers.get(id).is_some_and(|keeper| keeper.as_slice() != path)
    }
}
