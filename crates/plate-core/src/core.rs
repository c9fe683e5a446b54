use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::classify::NodeClass;
use crate::debounce::{Clock, Debounce, SystemClock};
use crate::hotkey::KeyEvent;
use crate::id::{IdGenerator, UuidIds};
use crate::normalize::Normalizer;
use crate::ops::{Op, Path, Transaction, transform_path};
use crate::plugin::{
    ConsumeError, Consumed, ConsumerInput, Constraints, PluginDefinition, PluginRegistry,
    RegistryError,
};
use crate::spellcheck::SpellingDecoration;

pub type Properties = BTreeMap<String, Value>;
/// Mark flags keyed by the plugin name that owns the mark.
pub type Marks = BTreeMap<String, bool>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Document {
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Document {
    pub fn new(children: Vec<Node>) -> Self {
        Self { children }
    }

    pub fn node(&self, path: &[usize]) -> Option<&Node> {
        let (&first, rest) = path.split_first()?;
        let mut node = self.children.get(first)?;
        for &ix in rest {
            node = match node {
                Node::Element(el) => el.children.get(ix)?,
                Node::Text(_) => return None,
            };
        }
        Some(node)
    }

    pub fn find_by_id(&self, id: &str) -> Option<(Path, &ElementNode)> {
        fn walk<'a>(children: &'a [Node], id: &str, path: &mut Path) -> Option<&'a ElementNode> {
            for (ix, node) in children.iter().enumerate() {
                let Node::Element(el) = node else {
                    continue;
                };
                path.push(ix);
                if el.id.as_deref() == Some(id) {
                    return Some(el);
                }
                if let Some(found) = walk(&el.children, id, path) {
                    return Some(found);
                }
                path.pop();
            }
            None
        }

        let mut path = Vec::new();
        let found = walk(&self.children, id, &mut path)?;
        Some((path, found))
    }

    pub fn top_level_index(&self, id: &str) -> Option<usize> {
        self.children
            .iter()
            .position(|node| matches!(node, Node::Element(el) if el.id.as_deref() == Some(id)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Element(ElementNode),
    Text(TextNode),
}

impl Node {
    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(TextNode::new(text))
    }

    pub fn paragraph(text: impl Into<String>) -> Self {
        Node::Element(
            ElementNode::new(crate::plugin::TEXT, NodeClass::Text).with_child(Node::text(text)),
        )
    }

    pub fn as_element(&self) -> Option<&ElementNode> {
        match self {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        }
    }

    /// Plain text of every leaf below this node, in document order.
    pub fn string(&self) -> String {
        let mut out = String::new();
        collect_text(self, &mut out);
        out
    }
}

fn collect_text(node: &Node, out: &mut String) {
    match node {
        Node::Text(t) => out.push_str(&t.text),
        Node::Element(el) => el.children.iter().for_each(|c| collect_text(c, out)),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub class: NodeClass,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub children: Vec<Node>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
}

impl ElementNode {
    pub fn new(kind: impl Into<String>, class: NodeClass) -> Self {
        Self {
            id: None,
            class,
            kind: kind.into(),
            children: Vec::new(),
            properties: Properties::new(),
            lang: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Node>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextNode {
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub marks: Marks,
    /// Computed per render pass; never persisted or compared.
    #[serde(skip)]
    pub decorations: Decorations,
}

impl TextNode {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            marks: Marks::new(),
            decorations: Decorations::default(),
        }
    }

    pub fn with_mark(mut self, mark: impl Into<String>) -> Self {
        self.marks.insert(mark.into(), true);
        self
    }
}

impl PartialEq for TextNode {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text && self.marks == other.marks
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decorations {
    pub spelling_errors: Vec<SpellingDecoration>,
    pub placeholder: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Point {
    #[serde(default)]
    pub path: Path,
    pub offset: usize,
}

impl Point {
    pub fn new(path: Path, offset: usize) -> Self {
        Self { path, offset }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: Point,
    pub focus: Point,
}

impl Default for Point {
    fn default() -> Self {
        Self::new(vec![0, 0], 0)
    }
}

impl Selection {
    pub fn collapsed(point: Point) -> Self {
        Self {
            anchor: point.clone(),
            focus: point,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }

    /// Anchor and focus in document order.
    pub fn ordered(&self) -> (&Point, &Point) {
        if self.anchor <= self.focus {
            (&self.anchor, &self.focus)
        } else {
            (&self.focus, &self.anchor)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropsPatch {
    #[serde(default)]
    pub set: Properties,
    #[serde(default)]
    pub remove: Vec<String>,
}

fn patch_apply(props: &mut Properties, patch: &PropsPatch) -> PropsPatch {
    let mut old_set = Properties::new();
    let mut old_remove: Vec<String> = Vec::new();

    for (k, v) in &patch.set {
        if let Some(prev) = props.insert(k.clone(), v.clone()) {
            old_set.insert(k.clone(), prev);
        } else {
            old_remove.push(k.clone());
        }
    }

    for key in &patch.remove {
        if let Some(prev) = props.remove(key) {
            old_set.insert(key.clone(), prev);
        }
    }

    PropsPatch {
        set: old_set,
        remove: old_remove,
    }
}

#[derive(Debug, Clone)]
pub struct UndoRecord {
    pub inverse_ops: Vec<Op>,
    pub selection_before: Selection,
    pub selection_after: Selection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    pub max_undo: usize,
    /// Upper bound on corrections applied by one normalization run.
    pub max_normalize_iterations: usize,
    pub verbose: bool,
    pub default_block_type: String,
    pub default_lang: String,
    pub spellcheck_debounce_ms: u64,
    pub commit_debounce_ms: u64,
}

impl EditorConfig {
    pub fn with_defaults(mut self) -> Self {
        if self.max_undo == 0 {
            self.max_undo = 200;
        }
        if self.max_normalize_iterations == 0 {
            self.max_normalize_iterations = 1000;
        }
        if self.default_block_type.is_empty() {
            self.default_block_type = crate::plugin::TEXT.to_string();
        }
        if self.default_lang.is_empty() {
            self.default_lang = "en".to_string();
        }
        if self.spellcheck_debounce_ms == 0 {
            self.spellcheck_debounce_ms = 500;
        }
        if self.commit_debounce_ms == 0 {
            self.commit_debounce_ms = 300;
        }
        self
    }

    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Self>(s).map(Self::with_defaults)
    }

    pub fn spellcheck_debounce(&self) -> Duration {
        Duration::from_millis(self.spellcheck_debounce_ms)
    }

    pub fn commit_debounce(&self) -> Duration {
        Duration::from_millis(self.commit_debounce_ms)
    }
}

/// Host-injectable time and identity sources.
#[derive(Clone)]
pub struct EditorServices {
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}

impl Default for EditorServices {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidIds),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("normalization did not converge after {0} corrections")]
    NormalizeDidNotConverge(usize),
}

impl From<PathError> for ApplyError {
    fn from(value: PathError) -> Self {
        ApplyError::InvalidPath(value.0)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PathError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakOutcome {
    /// A touched node forbids breaks; nothing changed.
    Suppressed,
    InsertedDefault { id: String },
    Split,
}

pub type CommitListener = Box<dyn FnMut(&Document, &[Op]) + Send>;

/// State to return to when an edit fails part way.
struct Checkpoint {
    selection: Selection,
    log_len: usize,
    pending_len: usize,
}

pub struct Editor {
    doc: Document,
    selection: Selection,
    registry: PluginRegistry,
    config: EditorConfig,
    services: EditorServices,
    undo_stack: Vec<UndoRecord>,
    redo_stack: Vec<UndoRecord>,
    log: Vec<Op>,
    commit: Debounce,
    pending_commit: Vec<Op>,
    commit_listener: Option<CommitListener>,
    /// Unknown node types already reported.
    unknown_types: BTreeSet<String>,
}

impl Editor {
    pub fn new(doc: Document, selection: Selection, registry: PluginRegistry) -> Self {
        Self::build(
            doc,
            selection,
            registry,
            EditorConfig::default(),
            EditorServices::default(),
        )
    }

    pub fn build(
        doc: Document,
        selection: Selection,
        mut registry: PluginRegistry,
        config: EditorConfig,
        services: EditorServices,
    ) -> Self {
        let config = config.with_defaults();
        registry.set_verbose(config.verbose);
        let commit = Debounce::new(config.commit_debounce(), services.clock.clone());
        let mut editor = Self {
            doc,
            selection,
            registry,
            config,
            services,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            log: Vec::new(),
            commit,
            pending_commit: Vec::new(),
            commit_listener: None,
            unknown_types: BTreeSet::new(),
        };
        if let Err(err) = editor.normalize() {
            tracing::warn!(target: "plate::normalize", %err, "initial document did not normalize");
        }
        editor.undo_stack.clear();
        editor.log.clear();
        editor.pending_commit.clear();
        editor.commit.cancel();
        editor
    }

    pub fn with_builtin_plugins() -> Self {
        let doc = Document::new(vec![Node::paragraph("")]);
        let selection = Selection::collapsed(Point::new(vec![0, 0], 0));
        Self::new(doc, selection, PluginRegistry::builtin())
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn services(&self) -> &EditorServices {
        &self.services
    }

    pub fn fresh_id(&self) -> String {
        self.services.ids.next_id()
    }

    /// Registers a plugin on this editor and re-normalizes against it.
    pub fn register_plugin(&mut self, plugin: PluginDefinition) -> Result<(), RegistryError> {
        self.registry.register(plugin)?;
        if let Err(err) = self.normalize() {
            tracing::warn!(target: "plate::normalize", %err, "normalization after plugin registration failed");
        }
        Ok(())
    }

    pub fn set_selection(&mut self, selection: Selection) {
        let op = Op::SetSelection { selection };
        if apply_op_to(&mut self.doc, &mut self.selection, op.clone()).is_ok() {
            self.record(op);
        }
        self.normalize_selection_in_place();
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Reverts the last undo step. A step that no longer applies stays on
    /// the stack and leaves the document untouched.
    pub fn undo(&mut self) -> bool {
        let Some(record) = self.undo_stack.pop() else {
            return false;
        };

        match self.replay(record.inverse_ops.clone(), record.selection_before.clone()) {
            Ok(redo_ops) => {
                self.redo_stack.push(UndoRecord {
                    inverse_ops: redo_ops,
                    ..record
                });
                true
            }
            Err(err) => {
                tracing::warn!(target: "plate::normalize", %err, "undo step could not be applied");
                self.undo_stack.push(record);
                false
            }
        }
    }

    pub fn redo(&mut self) -> bool {
        let Some(record) = self.redo_stack.pop() else {
            return false;
        };

        match self.replay(record.inverse_ops.clone(), record.selection_after.clone()) {
            Ok(undo_ops) => {
                self.undo_stack.push(UndoRecord {
                    inverse_ops: undo_ops,
                    ..record
                });
                true
            }
            Err(err) => {
                tracing::warn!(target: "plate::normalize", %err, "redo step could not be applied");
                self.redo_stack.push(record);
                false
            }
        }
    }

    /// Applies recorded ops for undo/redo and returns their inverses.
    fn replay(&mut self, ops: Vec<Op>, selection: Selection) -> Result<Vec<Op>, ApplyError> {
        let checkpoint = self.checkpoint();
        let mut inverse_ops: Vec<Op> = Vec::new();
        for op in ops {
            match self.apply_op(op.clone()) {
                Ok(inv) => {
                    inverse_ops.push(inv);
                    self.record(op);
                }
                Err(err) => {
                    self.rollback(inverse_ops, checkpoint);
                    return Err(err);
                }
            }
        }

        self.selection = selection;
        if let Err(err) = self.normalize_with_inverse_ops(&mut Vec::new(), &mut inverse_ops) {
            self.rollback(inverse_ops, checkpoint);
            return Err(err);
        }
        self.normalize_selection_in_place();
        self.commit.trigger();

        inverse_ops.reverse();
        Ok(inverse_ops)
    }

    /// Applies `tx` atomically, then normalizes to a fixed point. The
    /// transaction and its corrections form one undo step.
    ///
    /// If an op or the normalization that follows fails, everything applied
    /// so far is reverted and no undo step is recorded.
    pub fn apply(&mut self, tx: Transaction) -> Result<(), ApplyError> {
        let checkpoint = self.checkpoint();
        let mut inverse_ops: Vec<Op> = Vec::new();
        let mut fresh: Vec<Path> = Vec::new();

        for op in tx.ops {
            match self.apply_op(op.clone()) {
                Ok(inv) => inverse_ops.push(inv),
                Err(err) => {
                    self.rollback(inverse_ops, checkpoint);
                    return Err(err);
                }
            }
            track_fresh(&mut fresh, &op);
            self.record(op);
        }

        if let Some(sel) = tx.selection_after {
            self.selection = sel;
        }

        if let Err(err) = self.normalize_with_inverse_ops(&mut fresh, &mut inverse_ops) {
            self.rollback(inverse_ops, checkpoint);
            return Err(err);
        }
        inverse_ops.reverse();

        self.normalize_selection_in_place();
        self.push_undo(inverse_ops, checkpoint.selection);
        self.commit.trigger();
        Ok(())
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            selection: self.selection.clone(),
            log_len: self.log.len(),
            pending_len: self.pending_commit.len(),
        }
    }

    /// Reverts `inverse_ops` (in application order) and forgets the ops
    /// logged since `checkpoint`.
    fn rollback(&mut self, inverse_ops: Vec<Op>, checkpoint: Checkpoint) {
        for op in inverse_ops.into_iter().rev() {
            if let Err(err) = self.apply_op(op) {
                tracing::warn!(target: "plate::normalize", %err, "rollback op failed");
            }
        }
        self.selection = checkpoint.selection;
        self.log.truncate(checkpoint.log_len);
        self.pending_commit.truncate(checkpoint.pending_len);
    }

    fn push_undo(&mut self, inverse_ops: Vec<Op>, selection_before: Selection) {
        let selection_after = self.selection.clone();
        self.undo_stack.push(UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
        });
        self.redo_stack.clear();
        if self.undo_stack.len() > self.config.max_undo {
            self.undo_stack.remove(0);
        }
    }

    /// Runs normalization on the current state, which may have been produced
    /// outside this editor. Returns the number of corrections applied.
    /// Failure reverts the partial corrections.
    pub fn normalize(&mut self) -> Result<usize, ApplyError> {
        let checkpoint = self.checkpoint();
        let mut inverse_ops = Vec::new();
        if let Err(err) = self.normalize_with_inverse_ops(&mut Vec::new(), &mut inverse_ops) {
            self.rollback(inverse_ops, checkpoint);
            return Err(err);
        }
        let corrections = inverse_ops.len();
        self.normalize_selection_in_place();
        if corrections > 0 {
            inverse_ops.reverse();
            self.push_undo(inverse_ops, checkpoint.selection);
            self.commit.trigger();
        }
        Ok(corrections)
    }

    /// Swaps in externally produced content, dropping history. Content that
    /// cannot be normalized is rejected and the current document kept.
    pub fn replace_document(&mut self, doc: Document) -> Result<usize, ApplyError> {
        let previous = std::mem::replace(&mut self.doc, doc);
        let selection = self.selection.clone();
        match self.normalize() {
            Ok(corrections) => {
                self.undo_stack.clear();
                self.redo_stack.clear();
                Ok(corrections)
            }
            Err(err) => {
                self.doc = previous;
                self.selection = selection;
                Err(err)
            }
        }
    }

    /// Runs corrections to a fixed point, pushing each inverse onto
    /// `inverse_ops` as it goes so callers can revert a failed run.
    fn normalize_with_inverse_ops(
        &mut self,
        fresh: &mut Vec<Path>,
        inverse_ops: &mut Vec<Op>,
    ) -> Result<(), ApplyError> {
        let limit = self.config.max_normalize_iterations;
        let mut corrections = 0;
        loop {
            let correction = Normalizer::new(
                &self.registry,
                self.services.ids.as_ref(),
                &self.config.default_block_type,
            )
            .next_correction(&self.doc, fresh);
            let Some(correction) = correction else {
                if corrections > 0 {
                    tracing::trace!(target: "plate::normalize", corrections, "normalization converged");
                }
                self.report_unknown_types();
                return Ok(());
            };
            if corrections == limit {
                return Err(ApplyError::NormalizeDidNotConverge(limit));
            }
            corrections += 1;

            for op in correction.ops {
                let inv = self.apply_op(op.clone())?;
                inverse_ops.push(inv);
                track_fresh(fresh, &op);
                self.record(op);
            }
        }
    }

    fn report_unknown_types(&mut self) {
        let mut kinds = BTreeSet::new();
        element_kinds(&self.doc.children, &mut kinds);
        for kind in kinds {
            if self.registry.entry(kind).is_none() && self.unknown_types.insert(kind.to_string()) {
                tracing::warn!(target: "plate::registry", kind, "unknown node type treated as void");
            }
        }
    }

    fn normalize_selection_in_place(&mut self) {
        self.selection = normalize_selection(&self.doc, &self.selection);
    }

    fn apply_op(&mut self, op: Op) -> Result<Op, ApplyError> {
        apply_op_to(&mut self.doc, &mut self.selection, op)
    }

    fn record(&mut self, op: Op) {
        if !op.is_selection_only() {
            self.pending_commit.push(op.clone());
        }
        self.log.push(op);
    }

    /// Ops applied since the last drain, normalization corrections included.
    pub fn drain_log(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.log)
    }

    pub fn set_commit_listener(&mut self, listener: impl FnMut(&Document, &[Op]) + Send + 'static) {
        self.commit_listener = Some(Box::new(listener));
    }

    /// Delivers accumulated edits once the commit window has elapsed.
    pub fn poll_commit(&mut self) -> bool {
        if !self.commit.poll() {
            return false;
        }
        self.deliver_commit();
        true
    }

    pub fn flush_commit(&mut self) -> bool {
        if !self.commit.force() {
            return false;
        }
        self.deliver_commit();
        true
    }

    /// Stops the pending commit. Accumulated ops ride along with the next one.
    pub fn cancel_commit(&mut self) -> bool {
        self.commit.cancel()
    }

    fn deliver_commit(&mut self) {
        let ops = std::mem::take(&mut self.pending_commit);
        if let Some(listener) = self.commit_listener.as_mut() {
            listener(&self.doc, &ops);
        }
    }

    /// An empty node of the default block type with a fresh id.
    pub fn default_node(&self) -> Node {
        let kind = self.config.default_block_type.as_str();
        let class = self.registry.class_of(kind).unwrap_or(NodeClass::Text);
        Node::Element(
            ElementNode::new(kind, class)
                .with_id(self.fresh_id())
                .with_child(Node::text("")),
        )
    }

    pub fn is_void(&self, node: &Node) -> bool {
        match node {
            Node::Element(el) => self.registry.is_void(&el.kind),
            Node::Text(_) => false,
        }
    }

    fn in_void(&self, point: &Point) -> bool {
        (1..=point.path.len()).any(|len| {
            self.doc
                .node(&point.path[..len])
                .is_some_and(|node| matches!(node, Node::Element(_)) && self.is_void(node))
        })
    }

    /// Whether an element on either selection edge sets `pick` to false.
    fn selection_denies(&self, pick: impl Fn(&Constraints) -> Option<bool>) -> bool {
        [&self.selection.anchor, &self.selection.focus]
            .into_iter()
            .any(|point| {
                (1..=point.path.len()).any(|len| match self.doc.node(&point.path[..len]) {
                    Some(Node::Element(el)) => self
                        .registry
                        .constraints(&el.kind)
                        .is_some_and(|c| pick(c) == Some(false)),
                    _ => false,
                })
            })
    }

    pub fn insert_text(&mut self, text: &str) -> Result<bool, ApplyError> {
        if text.is_empty() {
            return Ok(false);
        }
        let (start, end) = self.selection.ordered();
        let (start, end) = (start.clone(), end.clone());
        if self.in_void(&start) {
            tracing::debug!(target: "plate::normalize", path = ?start.path, "text input inside void node ignored");
            return Ok(false);
        }

        let mut ops = Vec::new();
        if start.path == end.path && start.offset < end.offset {
            ops.push(Op::RemoveText {
                path: start.path.clone(),
                range: start.offset..end.offset,
            });
        }
        ops.push(Op::InsertText {
            path: start.path.clone(),
            offset: start.offset,
            text: text.to_string(),
        });
        let caret = Point::new(start.path, start.offset + text.len());
        self.apply(
            Transaction::new(ops)
                .selection_after(Selection::collapsed(caret))
                .source("insert_text"),
        )?;
        Ok(true)
    }

    pub fn insert_soft_break(&mut self) -> Result<bool, ApplyError> {
        if self.selection_denies(|c| c.allow_soft_break) {
            return Ok(false);
        }
        self.insert_text("\n")
    }

    /// Enter-key behavior.
    pub fn insert_break(&mut self) -> Result<BreakOutcome, ApplyError> {
        if self.selection_denies(|c| c.allow_break) {
            tracing::debug!(target: "plate::normalize", "break suppressed by node constraints");
            return Ok(BreakOutcome::Suppressed);
        }

        let (start, end) = self.selection.ordered();
        let (start, end) = (start.clone(), end.clone());
        let Some(&top) = start.path.first() else {
            return Err(ApplyError::InvalidPath("selection has an empty path".into()));
        };

        if self.selection.is_collapsed() && (self.in_void(&start) || self.at_block_end(&start)) {
            let node = self.default_node();
            let id = node
                .as_element()
                .and_then(|el| el.id.clone())
                .unwrap_or_default();
            self.apply(
                Transaction::new(vec![Op::InsertNode {
                    path: vec![top + 1],
                    node,
                }])
                .selection_after(Selection::collapsed(Point::new(vec![top + 1, 0], 0)))
                .source("insert_break"),
            )?;
            return Ok(BreakOutcome::InsertedDefault { id });
        }

        let mut ops = Vec::new();
        if start.path == end.path && start.offset < end.offset {
            ops.push(Op::RemoveText {
                path: start.path.clone(),
                range: start.offset..end.offset,
            });
        }
        ops.push(Op::SplitNode {
            path: start.path.clone(),
            position: start.offset,
            id: None,
        });
        let block_len = self.enclosing_text_block(&start.path);
        for depth in (block_len..start.path.len()).rev() {
            ops.push(Op::SplitNode {
                path: start.path[..depth].to_vec(),
                position: start.path[depth] + 1,
                id: None,
            });
        }

        let mut caret_path = start.path[..block_len].to_vec();
        if let Some(last) = caret_path.last_mut() {
            *last += 1;
        }
        caret_path.resize(start.path.len(), 0);
        self.apply(
            Transaction::new(ops)
                .selection_after(Selection::collapsed(Point::new(caret_path, 0)))
                .source("insert_break"),
        )?;
        Ok(BreakOutcome::Split)
    }

    /// Path length of the innermost text-classed element around `path`, the
    /// outermost node a break splits. Falls back to the top-level node.
    fn enclosing_text_block(&self, path: &[usize]) -> usize {
        (1..path.len())
            .rev()
            .find(|&len| {
                matches!(
                    self.doc.node(&path[..len]),
                    Some(Node::Element(el)) if matches!(el.class, NodeClass::Text | NodeClass::TextBlock)
                )
            })
            .unwrap_or(1)
    }

    /// Whether `point` sits at the end of the last text leaf of its top-level node.
    fn at_block_end(&self, point: &Point) -> bool {
        let Some(top) = point.path.first().and_then(|&ix| self.doc.children.get(ix)) else {
            return false;
        };
        let mut path = vec![point.path[0]];
        match last_text_point(top, &mut path) {
            Some(last) => last.path == point.path && point.offset >= last.offset,
            None => true,
        }
    }

    /// Runs the first matching action that is enabled and reports handling it.
    pub fn handle_hotkey(&mut self, event: &KeyEvent) -> bool {
        let focus_node = self
            .selection
            .focus
            .path
            .first()
            .and_then(|&ix| self.doc.children.get(ix))
            .cloned();
        let candidates: Vec<_> = self
            .registry
            .actions()
            .iter()
            .filter(|a| a.is_hotkey(event))
            .map(|a| a.action.clone())
            .collect();

        for action in candidates {
            if let (Some(visibility), Some(node)) = (&action.visibility, &focus_node) {
                let v = visibility(node);
                if !v.visible || !v.enabled {
                    continue;
                }
            }
            if (action.handler)(self) {
                tracing::debug!(target: "plate::registry", action = %action.name, "hotkey handled");
                return true;
            }
        }
        false
    }

    pub fn run_action(&mut self, plugin: &str, action: &str) -> bool {
        let handler = self
            .registry
            .actions()
            .iter()
            .find(|a| a.plugin == plugin && a.name() == action)
            .map(|a| a.action.handler.clone());
        handler.is_some_and(|handler| handler(self))
    }

    /// Feeds pasted or dropped input through the first accepting consumer.
    pub fn consume(&mut self, input: &ConsumerInput) -> Result<(), ConsumeError> {
        let Some((consumer, _)) = self.registry.find_consumer(input) else {
            return Err(ConsumeError::Unsupported {
                mime: input.mime.clone(),
            });
        };
        match consumer.consume(input)? {
            Consumed::Text(text) => {
                self.insert_text(&text)?;
            }
            Consumed::Node(node) => {
                let index = self
                    .selection
                    .focus
                    .path
                    .first()
                    .map_or(self.doc.children.len(), |ix| ix + 1);
                self.apply(
                    Transaction::new(vec![Op::InsertNode {
                        path: vec![index],
                        node,
                    }])
                    .selection_after(Selection::collapsed(Point::new(vec![index], 0)))
                    .source("consume"),
                )?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Editor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Editor")
            .field("doc", &self.doc)
            .field("selection", &self.selection)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("undo", &self.undo_stack.len())
            .field("redo", &self.redo_stack.len())
            .finish_non_exhaustive()
    }
}

/// Keeps paths of nodes created during one edit current as later ops shift them.
fn element_kinds<'a>(children: &'a [Node], out: &mut BTreeSet<&'a str>) {
    for node in children {
        if let Node::Element(el) = node {
            out.insert(el.kind.as_str());
            element_kinds(&el.children, out);
        }
    }
}

fn track_fresh(fresh: &mut Vec<Path>, op: &Op) {
    fresh.retain_mut(|path| match transform_path(path, op) {
        Some(next) => {
            *path = next;
            true
        }
        None => false,
    });
    match op {
        Op::InsertNode { path, .. } => fresh.push(path.clone()),
        Op::SplitNode { path, .. } => {
            if let Some(next) = next_sibling(path) {
                fresh.push(next);
            }
        }
        _ => {}
    }
}

fn next_sibling(path: &[usize]) -> Option<Path> {
    let (&last, parent) = path.split_last()?;
    let mut next = parent.to_vec();
    next.push(last + 1);
    Some(next)
}

pub(crate) fn apply_op_to(
    doc: &mut Document,
    selection: &mut Selection,
    op: Op,
) -> Result<Op, ApplyError> {
    match op {
        Op::InsertText { path, offset, text } => {
            let text_node = node_text_mut(doc, &path)?;
            let offset = clamp_to_char_boundary(&text_node.text, offset);
            text_node.text.insert_str(offset, &text);
            let len = text.len();
            transform_selection(
                selection,
                &Op::InsertText {
                    path: path.clone(),
                    offset,
                    text,
                },
            );
            Ok(Op::RemoveText {
                path,
                range: offset..offset + len,
            })
        }
        Op::RemoveText { path, range } => {
            let text_node = node_text_mut(doc, &path)?;
            let start =
                clamp_to_char_boundary(&text_node.text, range.start.min(text_node.text.len()));
            let end = clamp_to_char_boundary(&text_node.text, range.end.min(text_node.text.len()));
            if start >= end {
                return Ok(Op::InsertText {
                    path,
                    offset: start,
                    text: String::new(),
                });
            }
            let removed = text_node.text[start..end].to_string();
            text_node.text.replace_range(start..end, "");
            transform_selection(
                selection,
                &Op::RemoveText {
                    path: path.clone(),
                    range: start..end,
                },
            );
            Ok(Op::InsertText {
                path,
                offset: start,
                text: removed,
            })
        }
        Op::InsertNode { path, node } => {
            insert_node(doc, &path, node)?;
            let inverse = Op::RemoveNode { path };
            if let Op::RemoveNode { path } = &inverse {
                transform_selection_insert_node(selection, path);
            }
            Ok(inverse)
        }
        Op::RemoveNode { path } => {
            let removed = remove_node(doc, &path)?;
            transform_selection(selection, &Op::RemoveNode { path: path.clone() });
            Ok(Op::InsertNode {
                path,
                node: removed,
            })
        }
        Op::SplitNode { path, position, id } => {
            let next = next_sibling(&path)
                .ok_or_else(|| PathError("Cannot split the document root".into()))?;
            let (right, position) = match node_mut(doc, &path)? {
                Node::Text(t) => {
                    let position = clamp_to_char_boundary(&t.text, position);
                    let tail = t.text.split_off(position);
                    let mut right = TextNode::new(tail);
                    right.marks = t.marks.clone();
                    (Node::Text(right), position)
                }
                Node::Element(el) => {
                    if position > el.children.len() {
                        return Err(ApplyError::InvalidPath(format!(
                            "Split position out of bounds: {position} > {}",
                            el.children.len()
                        )));
                    }
                    let tail = el.children.split_off(position);
                    let right = ElementNode {
                        id,
                        class: el.class,
                        kind: el.kind.clone(),
                        children: tail,
                        properties: el.properties.clone(),
                        lang: el.lang.clone(),
                    };
                    (Node::Element(right), position)
                }
            };
            insert_node(doc, &next, right)?;
            transform_selection(
                selection,
                &Op::SplitNode {
                    path,
                    position,
                    id: None,
                },
            );
            Ok(Op::MergeNode {
                path: next,
                position,
            })
        }
        Op::MergeNode { path, .. } => {
            let Some((&ix, parent)) = path.split_last() else {
                return Err(ApplyError::InvalidPath("Empty merge path".into()));
            };
            if ix == 0 {
                return Err(ApplyError::InvalidPath(
                    "Cannot merge a node without a previous sibling".into(),
                ));
            }
            let mut prev_path = parent.to_vec();
            prev_path.push(ix - 1);

            match (doc.node(&prev_path), doc.node(&path)) {
                (Some(Node::Text(_)), Some(Node::Text(_)))
                | (Some(Node::Element(_)), Some(Node::Element(_))) => {}
                _ => {
                    return Err(ApplyError::InvalidPath(format!(
                        "Cannot merge {path:?} into a node of a different kind"
                    )));
                }
            }

            let removed = remove_node(doc, &path)?;
            let (position, id) = match (node_mut(doc, &prev_path)?, removed) {
                (Node::Text(left), Node::Text(right)) => {
                    let at = left.text.len();
                    left.text.push_str(&right.text);
                    (at, None)
                }
                (Node::Element(left), Node::Element(right)) => {
                    let at = left.children.len();
                    left.children.extend(right.children);
                    (at, right.id)
                }
                _ => return Err(ApplyError::InvalidPath("Merge kinds diverged".into())),
            };
            transform_selection(
                selection,
                &Op::MergeNode {
                    path,
                    position,
                },
            );
            Ok(Op::SplitNode {
                path: prev_path,
                position,
                id,
            })
        }
        Op::SetNodeProps { path, patch } => {
            let old = match node_mut(doc, &path)? {
                Node::Element(el) => patch_apply(&mut el.properties, &patch),
                Node::Text(_) => {
                    return Err(ApplyError::InvalidPath("Text has no properties".into()));
                }
            };
            Ok(Op::SetNodeProps { path, patch: old })
        }
        Op::SetTextMarks { path, marks } => {
            let text_node = node_text_mut(doc, &path)?;
            let old = std::mem::replace(&mut text_node.marks, marks);
            Ok(Op::SetTextMarks { path, marks: old })
        }
        Op::SetNodeId { path, id } => {
            let old = match node_mut(doc, &path)? {
                Node::Element(el) => std::mem::replace(&mut el.id, id),
                Node::Text(_) => return Err(ApplyError::InvalidPath("Text has no id".into())),
            };
            Ok(Op::SetNodeId { path, id: old })
        }
        Op::SetSelection { selection: next } => {
            let old = std::mem::replace(selection, next);
            Ok(Op::SetSelection { selection: old })
        }
    }
}

fn clamp_to_char_boundary(s: &str, mut ix: usize) -> usize {
    ix = ix.min(s.len());
    while ix > 0 && !s.is_char_boundary(ix) {
        ix -= 1;
    }
    ix
}

fn transform_selection(selection: &mut Selection, op: &Op) {
    for point in [&mut selection.anchor, &mut selection.focus] {
        transform_point(point, op);
    }
}

fn transform_selection_insert_node(selection: &mut Selection, path: &[usize]) {
    let Some((&index, parent)) = path.split_last() else {
        return;
    };
    let depth = parent.len();
    for point in [&mut selection.anchor, &mut selection.focus] {
        if point.path.len() > depth && point.path.starts_with(parent) && point.path[depth] >= index {
            point.path[depth] += 1;
        }
    }
}

fn transform_point(point: &mut Point, op: &Op) {
    match op {
        Op::InsertText { path, offset, text } if point.path == *path => {
            if point.offset >= *offset {
                point.offset = point.offset.saturating_add(text.len());
            }
            return;
        }
        Op::RemoveText { path, range } if point.path == *path => {
            if point.offset >= range.end {
                point.offset -= range.end - range.start;
            } else if point.offset > range.start {
                point.offset = range.start;
            }
            return;
        }
        Op::SplitNode { path, position, .. } if point.path == *path => {
            if point.offset >= *position {
                if let Some(next) = next_sibling(path) {
                    point.path = next;
                    point.offset -= position;
                }
            }
            return;
        }
        Op::MergeNode { path, position } if point.path == *path => {
            point.offset += position;
        }
        _ => {}
    }

    match transform_path(&point.path, op) {
        Some(path) => point.path = path,
        // Point was inside the removed subtree. Map it to a nearby point.
        None => {
            if let Op::RemoveNode { path } = op {
                if let Some((&index, parent)) = path.split_last() {
                    point.path = parent.to_vec();
                    point.path.push(index.saturating_sub(1));
                    point.offset = 0;
                }
            }
        }
    }
}

fn node_mut<'a>(doc: &'a mut Document, path: &[usize]) -> Result<&'a mut Node, PathError> {
    let Some((&first, rest)) = path.split_first() else {
        return Err(PathError("Empty path".into()));
    };

    let len = doc.children.len();
    let mut node = doc
        .children
        .get_mut(first)
        .ok_or_else(|| PathError(format!("Path out of bounds at depth 0: {first} >= {len}")))?;
    for (depth, &ix) in rest.iter().enumerate() {
        node = match node {
            Node::Element(el) => {
                let len = el.children.len();
                el.children.get_mut(ix).ok_or_else(|| {
                    PathError(format!(
                        "Path out of bounds at depth {}: {ix} >= {len}",
                        depth + 1
                    ))
                })?
            }
            Node::Text(_) => {
                return Err(PathError(format!("Non-container node at depth {depth}")));
            }
        };
    }
    Ok(node)
}

fn node_text_mut<'a>(doc: &'a mut Document, path: &[usize]) -> Result<&'a mut TextNode, PathError> {
    match node_mut(doc, path)? {
        Node::Text(t) => Ok(t),
        Node::Element(_) => Err(PathError("Expected Text node".into())),
    }
}

fn children_mut<'a>(doc: &'a mut Document, parent: &[usize]) -> Result<&'a mut Vec<Node>, PathError> {
    if parent.is_empty() {
        return Ok(&mut doc.children);
    }
    match node_mut(doc, parent)? {
        Node::Element(el) => Ok(&mut el.children),
        Node::Text(_) => Err(PathError("Parent is not a container".into())),
    }
}

fn insert_node(doc: &mut Document, path: &[usize], node: Node) -> Result<(), PathError> {
    let Some((&index, parent)) = path.split_last() else {
        return Err(PathError("Empty insert path".into()));
    };
    let children = children_mut(doc, parent)?;
    if index > children.len() {
        return Err(PathError(format!(
            "Insert index out of bounds: {index} > {}",
            children.len()
        )));
    }
    children.insert(index, node);
    Ok(())
}

fn remove_node(doc: &mut Document, path: &[usize]) -> Result<Node, PathError> {
    let Some((&index, parent)) = path.split_last() else {
        return Err(PathError("Empty remove path".into()));
    };
    let children = children_mut(doc, parent)?;
    if index >= children.len() {
        return Err(PathError(format!(
            "Remove index out of bounds: {index} >= {}",
            children.len()
        )));
    }
    Ok(children.remove(index))
}

/// Snaps both edges of `selection` onto existing text leaves.
pub fn normalize_selection(doc: &Document, selection: &Selection) -> Selection {
    let fallback = first_text_point(&doc.children, &mut Vec::new()).unwrap_or(Point {
        path: vec![0],
        offset: 0,
    });

    let anchor = normalize_point(doc, &selection.anchor).unwrap_or_else(|| {
        normalize_point(doc, &selection.focus).unwrap_or_else(|| fallback.clone())
    });
    let focus = normalize_point(doc, &selection.focus).unwrap_or_else(|| anchor.clone());

    Selection { anchor, focus }
}

fn normalize_point(doc: &Document, point: &Point) -> Option<Point> {
    if point.path.is_empty() || doc.children.is_empty() {
        return None;
    }

    let mut resolved: Path = Vec::new();
    let mut children: &[Node] = &doc.children;
    for &wanted in &point.path {
        if children.is_empty() {
            break;
        }
        let ix = wanted.min(children.len() - 1);
        resolved.push(ix);
        match &children[ix] {
            Node::Text(t) => {
                return Some(Point {
                    path: resolved,
                    offset: clamp_to_char_boundary(&t.text, point.offset),
                });
            }
            Node::Element(el) => children = &el.children,
        }
    }

    first_text_point(children, &mut resolved)
}

fn first_text_point(children: &[Node], path: &mut Path) -> Option<Point> {
    for (ix, node) in children.iter().enumerate() {
        path.push(ix);
        match node {
            Node::Text(_) => return Some(Point::new(path.clone(), 0)),
            Node::Element(el) => {
                if let Some(point) = first_text_point(&el.children, path) {
                    return Some(point);
                }
            }
        }
        path.pop();
    }
    None
}

fn last_text_point(node: &Node, path: &mut Path) -> Option<Point> {
    match node {
        Node::Text(t) => Some(Point::new(path.clone(), t.text.len())),
        Node::Element(el) => el.children.iter().enumerate().rev().find_map(|(ix, child)| {
            path.push(ix);
            let found = last_text_point(child, path);
            path.pop();
            found
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debounce::ManualClock;
    use crate::id::SequentialIds;

    fn doc(children: Vec<Node>) -> Document {
        Document::new(children)
    }

    #[test]
    fn split_then_merge_restores_text_and_caret() {
        let mut d = doc(vec![Node::paragraph("hello")]);
        let mut sel = Selection::collapsed(Point::new(vec![0, 0], 3));

        let inverse = apply_op_to(
            &mut d,
            &mut sel,
            Op::SplitNode {
                path: vec![0, 0],
                position: 2,
                id: None,
            },
        )
        .unwrap();
        assert_eq!(d.node(&[0, 1]).map(Node::string).as_deref(), Some("llo"));
        assert_eq!(sel.focus, Point::new(vec![0, 1], 1));

        apply_op_to(&mut d, &mut sel, inverse).unwrap();
        assert_eq!(d, doc(vec![Node::paragraph("hello")]));
        assert_eq!(sel.focus, Point::new(vec![0, 0], 3));
    }

    #[test]
    fn element_split_copies_type_and_properties_but_not_id() {
        let el = ElementNode::new("core/heading", NodeClass::Text)
            .with_id("h")
            .with_property("level", Value::from(2))
            .with_children([Node::text("a"), Node::text("b")]);
        let mut d = doc(vec![Node::Element(el)]);
        let mut sel = Selection::default();

        apply_op_to(
            &mut d,
            &mut sel,
            Op::SplitNode {
                path: vec![0],
                position: 1,
                id: Some("h2".into()),
            },
        )
        .unwrap();

        let right = d.children[1].as_element().unwrap();
        assert_eq!(right.kind, "core/heading");
        assert_eq!(right.id.as_deref(), Some("h2"));
        assert_eq!(right.properties.get("level"), Some(&Value::from(2)));
    }

    #[test]
    fn node_mut_reports_out_of_bounds_depth() {
        let mut d = doc(vec![Node::paragraph("x")]);
        let err = node_mut(&mut d, &[0, 4]).unwrap_err();
        assert!(err.0.contains("depth 1"), "{err}");
    }

    #[test]
    fn selection_snaps_into_nearest_text() {
        let d = doc(vec![Node::paragraph("abc")]);
        let sel = normalize_selection(&d, &Selection::collapsed(Point::new(vec![3, 9], 10)));
        assert_eq!(sel.focus, Point::new(vec![0, 0], 3));
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config = EditorConfig::from_json_str(r#"{"max_undo": 5}"#).unwrap();
        assert_eq!(config.max_undo, 5);
        assert_eq!(config.max_normalize_iterations, 1000);
        assert_eq!(config.default_block_type, "core/text");
        assert_eq!(config.spellcheck_debounce_ms, 500);
    }

    #[test]
    fn decorations_do_not_affect_equality() {
        let mut a = TextNode::new("x");
        a.decorations.placeholder = Some("Type".into());
        assert_eq!(a, TextNode::new("x"));
    }

    #[test]
    fn unknown_types_are_reported_once() {
        let mystery = ElementNode::new("vendor/mystery", NodeClass::Void)
            .with_id("m")
            .with_child(Node::text(""));
        let para = ElementNode::new(crate::plugin::TEXT, NodeClass::Text)
            .with_id("p")
            .with_child(Node::text("hi"));

        let ((), events) = crate::test_log::capture(|| {
            let mut editor = Editor::build(
                doc(vec![Node::Element(mystery), Node::Element(para)]),
                Selection::collapsed(Point::new(vec![1, 0], 2)),
                PluginRegistry::builtin(),
                EditorConfig::default(),
                EditorServices {
                    clock: Arc::new(ManualClock::new()),
                    ids: Arc::new(SequentialIds::new("n")),
                },
            );
            for _ in 0..3 {
                editor.insert_text("!").unwrap();
            }
        });

        let warnings = events
            .iter()
            .filter(|(level, m)| *level == tracing::Level::WARN && m == "unknown node type treated as void")
            .count();
        assert_eq!(warnings, 1);
    }
}
