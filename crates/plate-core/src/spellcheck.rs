//! Incremental spell checking against a host-provided checker.
//!
//! The engine keeps a lookup table from top-level node id to the text it last
//! checked and the errors found in it. A cycle plans which nodes changed,
//! sends them to the checker as one batch, and merges the answer back.
//! Results are merged without a version check: a slow cycle that resolves
//! after a newer one overwrites the newer entries.

use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Document, ElementNode, Node, TextNode};
use crate::debounce::{Clock, Debounce};
use crate::id::IdGenerator;
use crate::ops::{Op, Path, Transaction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Suggestion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpellingError {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpellcheckEntry {
    pub lang: String,
    pub text: String,
    #[serde(default)]
    pub errors: Vec<SpellingError>,
}

pub type LookupTable = BTreeMap<String, SpellcheckEntry>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub text: String,
    pub lang: String,
}

/// One error as reported by the host, before it is given an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckedError {
    pub text: String,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Byte range of one error occurrence inside a text leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpellingDecoration {
    pub error_id: String,
    pub range: Range<usize>,
}

#[derive(Debug, Error)]
pub enum SpellcheckError {
    #[error("spell checker failed: {0}")]
    Checker(String),
    #[error("spell checker returned {got} results for a batch of {expected}")]
    BatchMismatch { expected: usize, got: usize },
}

/// The host's checker. Must answer with exactly one error list per request.
pub trait SpellChecker {
    fn check(
        &self,
        batch: Vec<CheckRequest>,
    ) -> impl Future<Output = Result<Vec<Vec<CheckedError>>, SpellcheckError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCheck {
    pub node_id: String,
    pub lang: String,
    pub text: String,
}

/// Nodes whose text changed since their last check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckPlan {
    pub checks: Vec<PlannedCheck>,
}

impl CheckPlan {
    pub fn requests(&self) -> Vec<CheckRequest> {
        self.checks
            .iter()
            .map(|c| CheckRequest {
                text: c.text.clone(),
                lang: c.lang.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpellcheckOutcome {
    /// Nothing changed; callers keep their state as is.
    NoUpdate,
    /// Ids of the nodes whose entries were rewritten.
    Updated(Vec<String>),
    /// The checker failed or broke its contract; the table is untouched.
    Discarded,
}

pub struct SpellcheckEngine {
    table: LookupTable,
    default_lang: String,
    ids: Arc<dyn IdGenerator>,
}

impl SpellcheckEngine {
    pub fn new(default_lang: impl Into<String>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            table: LookupTable::new(),
            default_lang: default_lang.into(),
            ids,
        }
    }

    pub fn with_table(mut self, table: LookupTable) -> Self {
        self.table = table;
        self
    }

    pub fn table(&self) -> &LookupTable {
        &self.table
    }

    pub fn entry(&self, node_id: &str) -> Option<&SpellcheckEntry> {
        self.table.get(node_id)
    }

    pub fn plan(&self, doc: &Document) -> Option<CheckPlan> {
        let mut checks = Vec::new();
        for node in &doc.children {
            let Node::Element(el) = node else {
                continue;
            };
            let Some(id) = el.id.as_deref().filter(|id| !id.is_empty()) else {
                continue;
            };

            let text = node.string();
            if self.table.get(id).is_some_and(|entry| entry.text == text) {
                continue;
            }
            if text.trim().is_empty() {
                continue;
            }
            checks.push(PlannedCheck {
                node_id: id.to_string(),
                lang: el.lang.clone().unwrap_or_else(|| self.default_lang.clone()),
                text,
            });
        }

        if checks.is_empty() {
            tracing::trace!(target: "plate::spellcheck", "no node needs a recheck");
            return None;
        }
        Some(CheckPlan { checks })
    }

    /// Writes one cycle's results into the table. On a length mismatch nothing
    /// is written.
    pub fn merge(
        &mut self,
        plan: CheckPlan,
        results: Vec<Vec<CheckedError>>,
    ) -> Result<Vec<String>, SpellcheckError> {
        if results.len() != plan.len() {
            return Err(SpellcheckError::BatchMismatch {
                expected: plan.len(),
                got: results.len(),
            });
        }

        let mut updated = Vec::with_capacity(plan.len());
        for (check, errors) in plan.checks.into_iter().zip(results) {
            let errors = errors
                .into_iter()
                .map(|e| SpellingError {
                    id: self.ids.next_id(),
                    text: e.text,
                    level: e.level,
                    suggestions: e.suggestions,
                })
                .collect();
            self.table.insert(
                check.node_id.clone(),
                SpellcheckEntry {
                    lang: check.lang,
                    text: check.text,
                    errors,
                },
            );
            updated.push(check.node_id);
        }
        Ok(updated)
    }

    pub async fn run<C: SpellChecker>(&mut self, doc: &Document, checker: &C) -> SpellcheckOutcome {
        let Some(plan) = self.plan(doc) else {
            return SpellcheckOutcome::NoUpdate;
        };
        tracing::debug!(target: "plate::spellcheck", batch = plan.len(), "checking changed nodes");

        let results = match checker.check(plan.requests()).await {
            Ok(results) => results,
            Err(err) => {
                tracing::warn!(target: "plate::spellcheck", %err, "spell check cycle failed");
                return SpellcheckOutcome::Discarded;
            }
        };

        match self.merge(plan, results) {
            Ok(updated) => SpellcheckOutcome::Updated(updated),
            Err(err) => {
                tracing::warn!(target: "plate::spellcheck", %err, "discarding spell check results");
                SpellcheckOutcome::Discarded
            }
        }
    }

    /// Whole-word occurrences of each known error, per text leaf of `node`.
    /// Leaf paths are relative to `node`.
    pub fn decorations(&self, node: &ElementNode) -> Vec<(Path, SpellingDecoration)> {
        let Some(entry) = node.id.as_deref().and_then(|id| self.table.get(id)) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for (path, leaf) in text_leaves(node) {
            for error in &entry.errors {
                for range in word_occurrences(&leaf.text, &error.text) {
                    out.push((
                        path.clone(),
                        SpellingDecoration {
                            error_id: error.id.clone(),
                            range,
                        },
                    ));
                }
            }
        }
        out
    }

    /// Replaces the first occurrence of an error with one of its suggestions.
    pub fn apply_suggestion(
        &self,
        doc: &Document,
        node_id: &str,
        error_id: &str,
        suggestion_ix: usize,
    ) -> Option<Transaction> {
        let error = self
            .table
            .get(node_id)?
            .errors
            .iter()
            .find(|e| e.id == error_id)?;
        let replacement = error.suggestions.get(suggestion_ix)?;
        let (node_path, node) = doc.find_by_id(node_id)?;

        let (leaf_path, range) = text_leaves(node).into_iter().find_map(|(path, leaf)| {
            let range = word_occurrences(&leaf.text, &error.text).into_iter().next()?;
            Some((path, range))
        })?;

        let mut path = node_path;
        path.extend(leaf_path);
        Some(
            Transaction::new(vec![
                Op::RemoveText {
                    path: path.clone(),
                    range: range.clone(),
                },
                Op::InsertText {
                    path,
                    offset: range.start,
                    text: replacement.text.clone(),
                },
            ])
            .source("spellcheck:apply_suggestion"),
        )
    }
}

impl std::fmt::Debug for SpellcheckEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpellcheckEngine")
            .field("table", &self.table)
            .field("default_lang", &self.default_lang)
            .finish_non_exhaustive()
    }
}

fn text_leaves(node: &ElementNode) -> Vec<(Path, &TextNode)> {
    fn walk<'a>(children: &'a [Node], path: &mut Path, out: &mut Vec<(Path, &'a TextNode)>) {
        for (ix, child) in children.iter().enumerate() {
            path.push(ix);
            match child {
                Node::Text(t) => out.push((path.clone(), t)),
                Node::Element(el) => walk(&el.children, path, out),
            }
            path.pop();
        }
    }

    let mut out = Vec::new();
    walk(&node.children, &mut Vec::new(), &mut out);
    out
}

fn word_occurrences(haystack: &str, word: &str) -> Vec<Range<usize>> {
    if word.is_empty() {
        return Vec::new();
    }
    let is_word_char = |c: char| c.is_alphanumeric() || c == '\'';
    haystack
        .match_indices(word)
        .filter(|(start, _)| {
            let end = start + word.len();
            let before = haystack[..*start].chars().next_back();
            let after = haystack[end..].chars().next();
            !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
        })
        .map(|(start, _)| start..start + word.len())
        .collect()
}

/// An engine wired to a checker behind a trailing-edge debounce.
pub struct SpellcheckSession<C> {
    engine: SpellcheckEngine,
    checker: C,
    debounce: Debounce,
}

impl<C: SpellChecker> SpellcheckSession<C> {
    pub fn new(engine: SpellcheckEngine, checker: C, delay: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            checker,
            debounce: Debounce::new(delay, clock),
        }
    }

    pub fn engine(&self) -> &SpellcheckEngine {
        &self.engine
    }

    pub fn checker(&self) -> &C {
        &self.checker
    }

    /// Arms the debounce if any op changed text. Returns whether it did.
    pub fn observe(&mut self, ops: &[Op]) -> bool {
        if !ops.iter().any(Op::is_text_mutation) {
            return false;
        }
        self.debounce.trigger();
        true
    }

    pub fn is_pending(&self) -> bool {
        self.debounce.is_pending()
    }

    /// Runs a cycle if the debounce window has elapsed.
    pub async fn tick(&mut self, doc: &Document) -> Option<SpellcheckOutcome> {
        if !self.debounce.poll() {
            return None;
        }
        Some(self.engine.run(doc, &self.checker).await)
    }

    /// Runs the pending cycle now.
    pub async fn flush(&mut self, doc: &Document) -> Option<SpellcheckOutcome> {
        if !self.debounce.force() {
            return None;
        }
        Some(self.engine.run(doc, &self.checker).await)
    }

    pub fn cancel(&mut self) -> bool {
        self.debounce.cancel()
    }
}
