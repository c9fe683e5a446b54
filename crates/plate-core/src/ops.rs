use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::core::{Marks, Node, PropsPatch, Selection};

pub type Path = Vec<usize>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    InsertText {
        #[serde(default)]
        path: Path,
        offset: usize,
        text: String,
    },
    RemoveText {
        #[serde(default)]
        path: Path,
        range: Range<usize>,
    },
    InsertNode {
        #[serde(default)]
        path: Path,
        node: Node,
    },
    RemoveNode {
        #[serde(default)]
        path: Path,
    },
    /// Splits the node at `path`; everything from `position` on (children, or
    /// text bytes for a leaf) moves into a new next sibling carrying `id`.
    SplitNode {
        #[serde(default)]
        path: Path,
        position: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Merges the node at `path` into its previous sibling, whose length
    /// before the merge is `position`.
    MergeNode {
        #[serde(default)]
        path: Path,
        position: usize,
    },
    SetNodeProps {
        #[serde(default)]
        path: Path,
        patch: PropsPatch,
    },
    SetTextMarks {
        #[serde(default)]
        path: Path,
        #[serde(default)]
        marks: Marks,
    },
    SetNodeId {
        #[serde(default)]
        path: Path,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    SetSelection {
        selection: Selection,
    },
}

impl Op {
    /// Operations that change document text and so invalidate spell checks.
    pub fn is_text_mutation(&self) -> bool {
        matches!(
            self,
            Op::InsertText { .. }
                | Op::RemoveText { .. }
                | Op::SplitNode { .. }
                | Op::MergeNode { .. }
        )
    }

    pub fn is_selection_only(&self) -> bool {
        matches!(self, Op::SetSelection { .. })
    }
}

/// Where `path` ends up after `op` is applied, or `None` if `op` removed it.
pub fn transform_path(path: &[usize], op: &Op) -> Option<Path> {
    let mut out = path.to_vec();
    match op {
        Op::InsertNode { path: at, .. } => {
            if let Some(depth) = sibling_depth(path, at) {
                if path[depth] >= at[depth] {
                    out[depth] += 1;
                }
            }
        }
        Op::RemoveNode { path: at } => {
            if path.starts_with(at) {
                return None;
            }
            if let Some(depth) = sibling_depth(path, at) {
                if path[depth] > at[depth] {
                    out[depth] -= 1;
                }
            }
        }
        Op::SplitNode {
            path: at, position, ..
        } => {
            if path.len() > at.len() && path.starts_with(at) {
                let depth = at.len();
                if path[depth] >= *position {
                    let last = at.len() - 1;
                    out[last] += 1;
                    out[depth] -= position;
                }
            } else if let Some(depth) = sibling_depth(path, at) {
                if path[depth] > at[depth] {
                    out[depth] += 1;
                }
            }
        }
        Op::MergeNode { path: at, position } => {
            let Some((&last, _)) = at.split_last() else {
                return Some(out);
            };
            if last == 0 {
                return Some(out);
            }
            let depth = at.len() - 1;
            if path.starts_with(at) {
                out[depth] -= 1;
                if path.len() > at.len() {
                    out[at.len()] += position;
                }
            } else if let Some(depth) = sibling_depth(path, at) {
                if path[depth] > at[depth] {
                    out[depth] -= 1;
                }
            }
        }
        Op::InsertText { .. }
        | Op::RemoveText { .. }
        | Op::SetNodeProps { .. }
        | Op::SetTextMarks { .. }
        | Op::SetNodeId { .. }
        | Op::SetSelection { .. } => {}
    }
    Some(out)
}

/// Depth at which `path` shares `at`'s parent, if it sits at or below that level.
fn sibling_depth(path: &[usize], at: &[usize]) -> Option<usize> {
    let (_, parent) = at.split_last()?;
    if path.len() > parent.len() && path.starts_with(parent) {
        Some(parent.len())
    } else {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub ops: Vec<Op>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_after: Option<Selection>,
    #[serde(default)]
    pub meta: TransactionMeta,
}

impl Transaction {
    pub fn new(ops: Vec<Op>) -> Self {
        Self {
            ops,
            selection_after: None,
            meta: TransactionMeta::default(),
        }
    }

    pub fn selection_after(mut self, selection_after: Selection) -> Self {
        self.selection_after = Some(selection_after);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.meta.source = Some(source.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Node;

    fn insert(path: Path) -> Op {
        Op::InsertNode {
            path,
            node: Node::text(""),
        }
    }

    #[test]
    fn insert_shifts_later_siblings_and_their_subtrees() {
        assert_eq!(transform_path(&[2, 1], &insert(vec![1])), Some(vec![3, 1]));
        assert_eq!(transform_path(&[0, 1], &insert(vec![1])), Some(vec![0, 1]));
        assert_eq!(transform_path(&[1], &insert(vec![1])), Some(vec![2]));
    }

    #[test]
    fn remove_drops_subtree_and_shifts_siblings_back() {
        let op = Op::RemoveNode { path: vec![1] };
        assert_eq!(transform_path(&[1, 0], &op), None);
        assert_eq!(transform_path(&[3], &op), Some(vec![2]));
        assert_eq!(transform_path(&[0, 4], &op), Some(vec![0, 4]));
    }

    #[test]
    fn split_moves_tail_children_into_new_sibling() {
        let op = Op::SplitNode {
            path: vec![0],
            position: 2,
            id: None,
        };
        assert_eq!(transform_path(&[0, 1], &op), Some(vec![0, 1]));
        assert_eq!(transform_path(&[0, 3, 0], &op), Some(vec![1, 1, 0]));
        assert_eq!(transform_path(&[1], &op), Some(vec![2]));
        assert_eq!(transform_path(&[0], &op), Some(vec![0]));
    }

    #[test]
    fn merge_reparents_children_onto_previous_sibling() {
        let op = Op::MergeNode {
            path: vec![1],
            position: 3,
        };
        assert_eq!(transform_path(&[1, 0], &op), Some(vec![0, 3]));
        assert_eq!(transform_path(&[1], &op), Some(vec![0]));
        assert_eq!(transform_path(&[2], &op), Some(vec![1]));
    }

    #[test]
    fn only_text_changing_ops_are_text_mutations() {
        assert!(
            Op::InsertText {
                path: vec![0, 0],
                offset: 0,
                text: "a".into()
            }
            .is_text_mutation()
        );
        assert!(
            Op::MergeNode {
                path: vec![1],
                position: 0
            }
            .is_text_mutation()
        );
        assert!(!insert(vec![0]).is_text_mutation());
        assert!(
            !Op::SetSelection {
                selection: Selection::default()
            }
            .is_text_mutation()
        );
    }
}
