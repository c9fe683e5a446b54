use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::classify::NodeClass;
use crate::core::{ApplyError, Editor, ElementNode, Marks, Node, PropsPatch};
use crate::hotkey::{HotkeyError, HotkeyMatcher, KeyEvent};
use crate::normalize::{NormalizeCx, NormalizeNode, NormalizeOutcome, NodeEntry};
use crate::ops::{Op, Transaction};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("component entry under {parent:?} is missing `type`")]
    MissingChildType { parent: String },
    #[error("action {action:?} of plugin {plugin:?} has an invalid hotkey")]
    InvalidHotkey {
        plugin: String,
        action: String,
        #[source]
        source: HotkeyError,
    },
}

pub type ActionHandler = Arc<dyn Fn(&mut Editor) -> bool + Send + Sync>;
pub type VisibilityFn = Arc<dyn Fn(&Node) -> Visibility + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visibility {
    pub visible: bool,
    pub enabled: bool,
    pub active: bool,
}

impl Default for Visibility {
    fn default() -> Self {
        Self {
            visible: true,
            enabled: true,
            active: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct Constraints {
    pub allow_break: Option<bool>,
    pub allow_soft_break: Option<bool>,
    pub normalize_node: Option<Arc<dyn NormalizeNode>>,
}

impl std::fmt::Debug for Constraints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Constraints")
            .field("allow_break", &self.allow_break)
            .field("allow_soft_break", &self.allow_soft_break)
            .field("normalize_node", &self.normalize_node.is_some())
            .finish()
    }
}

/// Declared shape of one component and its child slots.
#[derive(Debug, Clone, Default)]
pub struct ComponentEntry {
    pub kind: Option<String>,
    pub class: Option<NodeClass>,
    pub placeholder: Option<String>,
    /// Optional slots are never synthesized by shape repair.
    pub optional: bool,
    pub children: Vec<ComponentEntry>,
    pub constraints: Constraints,
}

impl ComponentEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_type(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    pub fn class(mut self, class: NodeClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = Some(placeholder.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn child(mut self, child: ComponentEntry) -> Self {
        self.children.push(child);
        self
    }

    pub fn allow_break(mut self, allow: bool) -> Self {
        self.constraints.allow_break = Some(allow);
        self
    }

    pub fn allow_soft_break(mut self, allow: bool) -> Self {
        self.constraints.allow_soft_break = Some(allow);
        self
    }

    pub fn normalize_node(mut self, normalize: impl NormalizeNode + 'static) -> Self {
        self.constraints.normalize_node = Some(Arc::new(normalize));
        self
    }
}

#[derive(Clone)]
pub struct ActionSpec {
    pub name: String,
    pub hotkey: Option<String>,
    pub handler: ActionHandler,
    pub visibility: Option<VisibilityFn>,
}

impl ActionSpec {
    pub fn new(
        name: impl Into<String>,
        handler: impl Fn(&mut Editor) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            hotkey: None,
            handler: Arc::new(handler),
            visibility: None,
        }
    }

    pub fn hotkey(mut self, hotkey: impl Into<String>) -> Self {
        self.hotkey = Some(hotkey.into());
        self
    }

    pub fn visibility(
        mut self,
        visibility: impl Fn(&Node) -> Visibility + Send + Sync + 'static,
    ) -> Self {
        self.visibility = Some(Arc::new(visibility));
        self
    }
}

impl std::fmt::Debug for ActionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionSpec")
            .field("name", &self.name)
            .field("hotkey", &self.hotkey)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInput {
    pub mime: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Consumes {
    pub accept: bool,
    pub output_type: Option<String>,
    pub aggregate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Consumed {
    Node(Node),
    Text(String),
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("no consumer accepts {mime:?}")]
    Unsupported { mime: String },
    #[error("consumer failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// Paste/drop adapter turning foreign input into document content.
pub trait Consumer: Send + Sync {
    fn consumes(&self, input: &ConsumerInput) -> Consumes;
    fn consume(&self, input: &ConsumerInput) -> Result<Consumed, ConsumeError>;
}

/// One node type's contribution: shape, actions and paste adapter.
#[derive(Clone)]
pub struct PluginDefinition {
    pub name: String,
    pub class: NodeClass,
    pub component: Option<ComponentEntry>,
    pub actions: Vec<ActionSpec>,
    pub consumer: Option<Arc<dyn Consumer>>,
}

impl PluginDefinition {
    pub fn new(name: impl Into<String>, class: NodeClass) -> Self {
        Self {
            name: name.into(),
            class,
            component: None,
            actions: Vec::new(),
            consumer: None,
        }
    }

    pub fn component(mut self, component: ComponentEntry) -> Self {
        self.component = Some(component);
        self
    }

    pub fn action(mut self, action: ActionSpec) -> Self {
        self.actions.push(action);
        self
    }

    pub fn consumer(mut self, consumer: impl Consumer + 'static) -> Self {
        self.consumer = Some(Arc::new(consumer));
        self
    }

    /// The root component, with its class defaulted to the plugin's own.
    fn root_component(&self) -> Option<ComponentEntry> {
        if self.component.is_none() && self.class == NodeClass::Generic {
            return None;
        }
        let mut root = self.component.clone().unwrap_or_default();
        root.class.get_or_insert(self.class);
        Some(root)
    }
}

impl std::fmt::Debug for PluginDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDefinition")
            .field("name", &self.name)
            .field("class", &self.class)
            .field("component", &self.component)
            .field("actions", &self.actions)
            .field("consumer", &self.consumer.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Aggregated `/`-joined key this entry is stored under.
    pub key: String,
    /// The component's own type segment.
    pub kind: String,
    pub class: NodeClass,
    pub component: ComponentEntry,
    /// Key of the parent entry, if any.
    pub parent: Option<String>,
}

pub type ComponentMap = HashMap<String, RegistryEntry>;

#[derive(Clone)]
pub struct RegisteredAction {
    pub plugin: String,
    pub action: ActionSpec,
    matcher: Option<HotkeyMatcher>,
}

impl RegisteredAction {
    pub fn name(&self) -> &str {
        &self.action.name
    }

    pub fn is_hotkey(&self, event: &KeyEvent) -> bool {
        self.matcher.as_ref().is_some_and(|m| m.matches(event))
    }
}

impl std::fmt::Debug for RegisteredAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAction")
            .field("plugin", &self.plugin)
            .field("action", &self.action)
            .finish()
    }
}

/// Adds `plugin`, replacing a same-named plugin in place. Returns the index
/// of the replaced plugin.
pub fn register_plugin(
    plugins: &mut Vec<PluginDefinition>,
    plugin: PluginDefinition,
) -> Option<usize> {
    match plugins.iter().position(|p| p.name == plugin.name) {
        Some(ix) => {
            tracing::warn!(
                target: "plate::registry",
                plugin = %plugin.name,
                index = ix,
                "plugin registered twice; overriding previous definition"
            );
            plugins[ix] = plugin;
            Some(ix)
        }
        None => {
            plugins.push(plugin);
            None
        }
    }
}

/// Inserts `entry` under `root_type` and each child under `root_type/child`,
/// recursively. Nothing is inserted if any child lacks a type.
pub fn register_components(
    map: &mut ComponentMap,
    root_type: &str,
    entry: &ComponentEntry,
    verbose: bool,
) -> Result<(), RegistryError> {
    validate_component(root_type, entry)?;
    insert_components(map, root_type, entry, None, verbose);
    Ok(())
}

fn validate_component(key: &str, entry: &ComponentEntry) -> Result<(), RegistryError> {
    for child in &entry.children {
        let Some(kind) = child.kind.as_deref().filter(|k| !k.is_empty()) else {
            return Err(RegistryError::MissingChildType {
                parent: key.to_string(),
            });
        };
        validate_component(&format!("{key}/{kind}"), child)?;
    }
    Ok(())
}

fn insert_components(
    map: &mut ComponentMap,
    key: &str,
    entry: &ComponentEntry,
    parent: Option<&str>,
    verbose: bool,
) {
    let class = entry.class.unwrap_or_else(|| {
        tracing::warn!(
            target: "plate::registry",
            key,
            "component has no class; defaulting to text"
        );
        NodeClass::Text
    });

    let kind = entry
        .kind
        .clone()
        .unwrap_or_else(|| key.rsplit('/').next().unwrap_or(key).to_string());

    let previous = map.insert(
        key.to_string(),
        RegistryEntry {
            key: key.to_string(),
            kind,
            class,
            component: entry.clone(),
            parent: parent.map(str::to_string),
        },
    );
    if previous.is_some() && verbose {
        tracing::info!(target: "plate::registry", key, "component key re-registered");
    }

    for child in &entry.children {
        if let Some(kind) = child.kind.as_deref() {
            insert_components(map, &format!("{key}/{kind}"), child, Some(key), verbose);
        }
    }
}

fn component_keys(key: &str, entry: &ComponentEntry, out: &mut Vec<String>) {
    out.push(key.to_string());
    for child in &entry.children {
        if let Some(kind) = child.kind.as_deref() {
            component_keys(&format!("{key}/{kind}"), child, out);
        }
    }
}

/// Flattens every plugin's actions in registration order, compiling hotkeys once.
pub fn register_actions(
    plugins: &[PluginDefinition],
) -> Result<Vec<RegisteredAction>, RegistryError> {
    let mut actions = Vec::new();
    for plugin in plugins {
        actions.extend(compile_actions(plugin)?);
    }
    Ok(actions)
}

fn compile_actions(plugin: &PluginDefinition) -> Result<Vec<RegisteredAction>, RegistryError> {
    plugin
        .actions
        .iter()
        .map(|action| {
            let matcher = action
                .hotkey
                .as_deref()
                .map(HotkeyMatcher::compile)
                .transpose()
                .map_err(|source| RegistryError::InvalidHotkey {
                    plugin: plugin.name.clone(),
                    action: action.name.clone(),
                    source,
                })?;
            Ok(RegisteredAction {
                plugin: plugin.name.clone(),
                action: action.clone(),
                matcher,
            })
        })
        .collect()
}

/// Per-editor plugin state. Never shared between editors.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<PluginDefinition>,
    components: ComponentMap,
    actions: Vec<RegisteredAction>,
    verbose: bool,
}

impl PluginRegistry {
    pub fn new(
        plugins: impl IntoIterator<Item = PluginDefinition>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for plugin in plugins {
            registry.register(plugin)?;
        }
        Ok(registry)
    }

    pub fn builtin() -> Self {
        Self::new(builtin_plugins()).expect("builtin registry must be valid")
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn register(&mut self, plugin: PluginDefinition) -> Result<(), RegistryError> {
        if let Some(root) = plugin.root_component() {
            validate_component(&plugin.name, &root)?;
        }
        compile_actions(&plugin)?;

        let name = plugin.name.clone();
        let root = plugin.root_component();
        let mut stale = Vec::new();
        if let Some(old) = self.plugin(&name).and_then(PluginDefinition::root_component) {
            component_keys(&name, &old, &mut stale);
        }
        register_plugin(&mut self.plugins, plugin);

        let mut keys = Vec::new();
        if let Some(root) = root {
            component_keys(&name, &root, &mut keys);
            insert_components(&mut self.components, &name, &root, None, self.verbose);
        }
        // An override may declare fewer children than the plugin it replaces.
        for key in stale.iter().filter(|key| !keys.contains(key)) {
            self.components.remove(key);
        }
        self.actions = register_actions(&self.plugins)?;
        Ok(())
    }

    pub fn plugins(&self) -> &[PluginDefinition] {
        &self.plugins
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginDefinition> {
        self.plugins.iter().find(|p| p.name == name)
    }

    pub fn components(&self) -> &ComponentMap {
        &self.components
    }

    pub fn entry(&self, key: &str) -> Option<&RegistryEntry> {
        self.components.get(key)
    }

    pub fn parent_of(&self, key: &str) -> Option<&RegistryEntry> {
        let parent = self.components.get(key)?.parent.as_deref()?;
        self.components.get(parent)
    }

    pub fn constraints(&self, kind: &str) -> Option<&Constraints> {
        self.components.get(kind).map(|e| &e.component.constraints)
    }

    pub fn class_of(&self, kind: &str) -> Option<NodeClass> {
        self.components.get(kind).map(|e| e.class)
    }

    pub fn placeholder(&self, kind: &str) -> Option<&str> {
        self.components.get(kind)?.component.placeholder.as_deref()
    }

    /// Unknown types are void so the editor never edits what it cannot
    /// interpret. The editor warns about them once, when it first sees them.
    pub fn is_void(&self, kind: &str) -> bool {
        match self.components.get(kind) {
            Some(entry) => entry.class == NodeClass::Void,
            None => {
                tracing::trace!(target: "plate::registry", kind, "unknown node type treated as void");
                true
            }
        }
    }

    /// Whether other blocks may be dropped inside nodes of this type.
    pub fn is_nestable(&self, kind: &str) -> bool {
        self.components
            .get(kind)
            .is_some_and(|e| e.class == NodeClass::Block && e.component.children.is_empty())
    }

    pub fn actions(&self) -> &[RegisteredAction] {
        &self.actions
    }

    pub fn find_consumer(&self, input: &ConsumerInput) -> Option<(Arc<dyn Consumer>, Consumes)> {
        self.plugins.iter().find_map(|plugin| {
            let consumer = plugin.consumer.as_ref()?;
            let consumes = consumer.consumes(input);
            consumes.accept.then(|| (consumer.clone(), consumes))
        })
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.iter().map(|p| &p.name).collect::<Vec<_>>())
            .field("components", &self.components.len())
            .field("actions", &self.actions.len())
            .finish()
    }
}

pub const TEXT: &str = "core/text";
pub const HEADING: &str = "core/heading";
pub const CODE: &str = "core/code";
pub const QUOTE: &str = "core/quote";
pub const IMAGE: &str = "core/image";
pub const DIVIDER: &str = "core/divider";
pub const LINK: &str = "core/link";
pub const MENTION: &str = "core/mention";
pub const BOLD: &str = "core/bold";
pub const ITALIC: &str = "core/italic";

pub fn builtin_plugins() -> Vec<PluginDefinition> {
    vec![
        PluginDefinition::new(TEXT, NodeClass::Text)
            .component(ComponentEntry::new().placeholder("Type something")),
        PluginDefinition::new(HEADING, NodeClass::Text)
            .component(ComponentEntry::new().normalize_node(ClampHeadingLevel)),
        PluginDefinition::new(CODE, NodeClass::Text).component(
            ComponentEntry::new()
                .allow_break(false)
                .allow_soft_break(true),
        ),
        PluginDefinition::new(QUOTE, NodeClass::Block),
        PluginDefinition::new(IMAGE, NodeClass::Block)
            .component(
                ComponentEntry::new().child(
                    ComponentEntry::of_type("caption")
                        .class(NodeClass::Text)
                        .placeholder("Write a caption")
                        .allow_break(false),
                ),
            )
            .consumer(ImageUrlConsumer),
        PluginDefinition::new(DIVIDER, NodeClass::Void)
            .action(ActionSpec::new("insert", insert_divider).hotkey("mod+shift+-")),
        PluginDefinition::new(LINK, NodeClass::Inline),
        PluginDefinition::new(MENTION, NodeClass::Void),
        PluginDefinition::new(BOLD, NodeClass::Leaf)
            .action(ActionSpec::new("toggle", |editor| toggle_mark(editor, BOLD)).hotkey("mod+b")),
        PluginDefinition::new(ITALIC, NodeClass::Leaf)
            .action(ActionSpec::new("toggle", |editor| toggle_mark(editor, ITALIC)).hotkey("mod+i")),
    ]
}

struct ClampHeadingLevel;

impl NormalizeNode for ClampHeadingLevel {
    fn normalize(&self, _cx: &NormalizeCx<'_>, entry: NodeEntry<'_>) -> NormalizeOutcome {
        let level = entry.node.properties.get("level").and_then(Value::as_u64);
        let clamped = level.unwrap_or(1).clamp(1, 6);
        if level == Some(clamped) {
            return NormalizeOutcome::Unhandled;
        }
        let mut patch = PropsPatch::default();
        patch.set.insert("level".to_string(), Value::from(clamped));
        NormalizeOutcome::Handled(vec![Op::SetNodeProps {
            path: entry.path.to_vec(),
            patch,
        }])
    }
}

fn insert_divider(editor: &mut Editor) -> bool {
    let index = editor
        .selection()
        .focus
        .path
        .first()
        .map_or(editor.doc().children.len(), |ix| ix + 1);

    let divider = ElementNode::new(DIVIDER, NodeClass::Void).with_child(Node::text(""));
    let paragraph = editor.default_node();
    let tx = Transaction::new(vec![
        Op::InsertNode {
            path: vec![index],
            node: Node::Element(divider),
        },
        Op::InsertNode {
            path: vec![index + 1],
            node: paragraph,
        },
    ])
    .selection_after(crate::core::Selection::collapsed(crate::core::Point::new(
        vec![index + 1, 0],
        0,
    )))
    .source("action:core/divider.insert");

    match editor.apply(tx) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(target: "plate::registry", %err, "failed to insert divider");
            false
        }
    }
}

fn toggle_mark(editor: &mut Editor, mark: &str) -> bool {
    let path = editor.selection().focus.path.clone();
    let Some(Node::Text(leaf)) = editor.doc().node(&path) else {
        return false;
    };
    let mut marks: Marks = leaf.marks.clone();
    if marks.remove(mark).is_none() {
        marks.insert(mark.to_string(), true);
    }
    editor
        .apply(Transaction::new(vec![Op::SetTextMarks { path, marks }]).source("action:toggle_mark"))
        .is_ok()
}

struct ImageUrlConsumer;

const IMAGE_EXTENSIONS: [&str; 6] = [".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg"];

impl Consumer for ImageUrlConsumer {
    fn consumes(&self, input: &ConsumerInput) -> Consumes {
        let url = input.data.trim().to_ascii_lowercase();
        let accept = matches!(input.mime.as_str(), "text/uri-list" | "text/plain")
            && (url.starts_with("http://") || url.starts_with("https://"))
            && IMAGE_EXTENSIONS.iter().any(|ext| url.ends_with(ext));
        Consumes {
            accept,
            output_type: accept.then(|| IMAGE.to_string()),
            aggregate: false,
        }
    }

    fn consume(&self, input: &ConsumerInput) -> Result<Consumed, ConsumeError> {
        let url = input.data.trim();
        if url.is_empty() {
            return Err(ConsumeError::Failed("empty image url".into()));
        }
        let caption = ElementNode::new(format!("{IMAGE}/caption"), NodeClass::Text)
            .with_child(Node::text(""));
        let image = ElementNode::new(IMAGE, NodeClass::Block)
            .with_property("url", Value::from(url))
            .with_child(Node::Element(caption));
        Ok(Consumed::Node(Node::Element(image)))
    }
}
