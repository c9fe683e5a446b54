use std::cell::RefCell;
use std::future::{Future, ready};
use std::sync::Arc;
use std::time::Duration;

use manos_plate_core::{
    CheckRequest, CheckedError, Document, Editor, EditorConfig, EditorServices, ElementNode,
    LookupTable, ManualClock, Node, NodeClass, Op, PluginRegistry, Point, Selection,
    SequentialIds, SpellChecker, SpellcheckEngine, SpellcheckEntry, SpellcheckError,
    SpellcheckOutcome, SpellcheckSession, SpellingError, Suggestion, TEXT, decorate,
};

/// Flags words found in `fixes` and records every batch it is sent.
#[derive(Default)]
struct Dictionary {
    fixes: Vec<(&'static str, &'static str)>,
    calls: RefCell<Vec<Vec<CheckRequest>>>,
    /// Drop this many results from every answer.
    short_by: usize,
}

impl Dictionary {
    fn new(fixes: &[(&'static str, &'static str)]) -> Self {
        Self {
            fixes: fixes.to_vec(),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl SpellChecker for Dictionary {
    fn check(
        &self,
        batch: Vec<CheckRequest>,
    ) -> impl Future<Output = Result<Vec<Vec<CheckedError>>, SpellcheckError>> {
        self.calls.borrow_mut().push(batch.clone());
        let mut results: Vec<Vec<CheckedError>> = batch
            .iter()
            .map(|req| {
                req.text
                    .split_whitespace()
                    .filter_map(|word| {
                        let (_, fix) = self.fixes.iter().find(|(bad, _)| *bad == word)?;
                        Some(CheckedError {
                            text: word.to_string(),
                            suggestions: vec![Suggestion::new(*fix)],
                            level: None,
                        })
                    })
                    .collect()
            })
            .collect();
        results.truncate(results.len().saturating_sub(self.short_by));
        ready(Ok(results))
    }
}

struct Offline;

impl SpellChecker for Offline {
    fn check(
        &self,
        _batch: Vec<CheckRequest>,
    ) -> impl Future<Output = Result<Vec<Vec<CheckedError>>, SpellcheckError>> {
        ready(Err(SpellcheckError::Checker("host unreachable".into())))
    }
}

fn para(id: &str, text: &str) -> Node {
    Node::Element(
        ElementNode::new(TEXT, NodeClass::Text)
            .with_id(id)
            .with_child(Node::text(text)),
    )
}

fn engine() -> SpellcheckEngine {
    SpellcheckEngine::new("en", Arc::new(SequentialIds::new("err")))
}

fn entry(text: &str, errors: Vec<SpellingError>) -> SpellcheckEntry {
    SpellcheckEntry {
        lang: "en".into(),
        text: text.into(),
        errors,
    }
}

#[test]
fn only_changed_nodes_are_rechecked_in_one_batch() {
    let cat_error = SpellingError {
        id: "old".into(),
        text: "cat".into(),
        level: Some("hint".into()),
        suggestions: vec![Suggestion::new("cart")],
    };
    let mut table = LookupTable::new();
    table.insert("a".into(), entry("cat", vec![cat_error]));
    table.insert("b".into(), entry("dog", Vec::new()));
    let mut engine = engine().with_table(table.clone());

    let doc = Document::new(vec![para("a", "cat"), para("b", "dag")]);
    let checker = Dictionary::new(&[("dag", "dog")]);
    let outcome = pollster::block_on(engine.run(&doc, &checker));

    assert_eq!(outcome, SpellcheckOutcome::Updated(vec!["b".into()]));
    assert_eq!(
        checker.calls.borrow().as_slice(),
        [vec![CheckRequest {
            text: "dag".into(),
            lang: "en".into()
        }]]
    );
    assert_eq!(engine.entry("a"), table.get("a"));
    assert_eq!(engine.entry("b").unwrap().errors[0].text, "dag");
}

#[test]
fn short_answer_discards_the_whole_cycle() {
    let mut table = LookupTable::new();
    table.insert("a".into(), entry("old", Vec::new()));
    let mut engine = engine().with_table(table.clone());

    let doc = Document::new(vec![para("a", "teh cat"), para("b", "a dgo")]);
    let checker = Dictionary {
        short_by: 1,
        ..Dictionary::new(&[("teh", "the"), ("dgo", "dog")])
    };
    let outcome = pollster::block_on(engine.run(&doc, &checker));

    assert_eq!(outcome, SpellcheckOutcome::Discarded);
    assert_eq!(checker.calls(), 1);
    assert_eq!(engine.table(), &table);
}

#[test]
fn merge_reports_the_mismatch() {
    let mut engine = engine();
    let doc = Document::new(vec![para("a", "one"), para("b", "two")]);
    let plan = engine.plan(&doc).unwrap();

    let err = engine.merge(plan, vec![Vec::new()]).unwrap_err();
    assert!(matches!(
        err,
        SpellcheckError::BatchMismatch {
            expected: 2,
            got: 1
        }
    ));
    assert!(engine.table().is_empty());
}

#[test]
fn checker_failure_keeps_the_table() {
    let mut engine = engine();
    let doc = Document::new(vec![para("a", "words")]);
    assert_eq!(
        pollster::block_on(engine.run(&doc, &Offline)),
        SpellcheckOutcome::Discarded
    );
    assert!(engine.table().is_empty());
}

#[test]
fn blank_and_unchanged_text_is_never_sent() {
    let mut engine = engine();
    let checker = Dictionary::new(&[]);
    let doc = Document::new(vec![para("a", "   "), para("b", ""), para("c", "fine")]);

    let first = pollster::block_on(engine.run(&doc, &checker));
    assert_eq!(first, SpellcheckOutcome::Updated(vec!["c".into()]));
    let second = pollster::block_on(engine.run(&doc, &checker));
    assert_eq!(second, SpellcheckOutcome::NoUpdate);
    assert_eq!(checker.calls(), 1);
}

#[test]
fn node_lang_overrides_the_default() {
    let engine = engine();
    let node = ElementNode::new(TEXT, NodeClass::Text)
        .with_id("a")
        .with_lang("de")
        .with_child(Node::text("Hallo"));
    let plan = engine.plan(&Document::new(vec![Node::Element(node)])).unwrap();
    assert_eq!(plan.requests()[0].lang, "de");
}

fn editor(children: Vec<Node>, clock: &ManualClock) -> Editor {
    Editor::build(
        Document::new(children),
        Selection::collapsed(Point::new(vec![0, 0], 10)),
        PluginRegistry::builtin(),
        EditorConfig::default(),
        EditorServices {
            clock: Arc::new(clock.clone()),
            ids: Arc::new(SequentialIds::new("n")),
        },
    )
}

#[test]
fn typing_is_checked_after_the_debounce_window() {
    let clock = ManualClock::new();
    let mut editor = editor(vec![para("x", "hello wrol")], &clock);
    let mut session = SpellcheckSession::new(
        engine(),
        Dictionary::new(&[("wrold", "world")]),
        editor.config().spellcheck_debounce(),
        Arc::new(clock.clone()),
    );

    editor.insert_text("d").unwrap();
    assert!(session.observe(&editor.drain_log()));

    clock.advance(Duration::from_millis(499));
    assert_eq!(pollster::block_on(session.tick(editor.doc())), None);
    assert_eq!(session.checker().calls(), 0);

    clock.advance(Duration::from_millis(1));
    let outcome = pollster::block_on(session.tick(editor.doc()));
    assert_eq!(outcome, Some(SpellcheckOutcome::Updated(vec!["x".into()])));

    let entry = session.engine().entry("x").unwrap();
    assert_eq!(entry.text, "hello wrold");
    assert_eq!(entry.errors.len(), 1);
    assert_eq!(entry.errors[0].text, "wrold");
    assert!(entry.errors[0].suggestions.iter().any(|s| s.text == "world"));

    let decorated = decorate(editor.doc(), editor.registry(), Some(session.engine()));
    let Some(Node::Text(leaf)) = decorated.node(&[0, 0]) else {
        panic!("expected text leaf");
    };
    assert_eq!(leaf.decorations.spelling_errors.len(), 1);
    assert_eq!(leaf.decorations.spelling_errors[0].range, 6..11);

    let error_id = entry.errors[0].id.clone();
    let tx = session
        .engine()
        .apply_suggestion(editor.doc(), "x", &error_id, 0)
        .unwrap();
    editor.apply(tx).unwrap();
    assert_eq!(editor.doc().children[0].string(), "hello world");
}

#[test]
fn selection_changes_never_schedule_a_check() {
    let clock = ManualClock::new();
    let mut session = SpellcheckSession::new(
        engine(),
        Dictionary::new(&[]),
        Duration::from_millis(500),
        Arc::new(clock.clone()),
    );

    let moved = Op::SetSelection {
        selection: Selection::collapsed(Point::new(vec![0, 0], 1)),
    };
    assert!(!session.observe(&[moved]));
    assert!(!session.is_pending());
}

#[test]
fn cancel_and_flush_control_the_pending_cycle() {
    let clock = ManualClock::new();
    let doc = Document::new(vec![para("a", "teh")]);
    let mut session = SpellcheckSession::new(
        engine(),
        Dictionary::new(&[("teh", "the")]),
        Duration::from_millis(500),
        Arc::new(clock.clone()),
    );
    let typed = [Op::InsertText {
        path: vec![0, 0],
        offset: 0,
        text: "t".into(),
    }];

    session.observe(&typed);
    assert!(session.cancel());
    clock.advance(Duration::from_secs(1));
    assert_eq!(pollster::block_on(session.tick(&doc)), None);
    assert_eq!(session.checker().calls(), 0);

    session.observe(&typed);
    let flushed = pollster::block_on(session.flush(&doc));
    assert_eq!(flushed, Some(SpellcheckOutcome::Updated(vec!["a".into()])));
    assert_eq!(pollster::block_on(session.flush(&doc)), None);
}

#[test]
fn late_stale_result_overwrites_newer_entry() {
    let mut engine = engine();
    let checker = Dictionary::new(&[("teh", "the")]);

    let older = Document::new(vec![para("a", "teh")]);
    let newer = Document::new(vec![para("a", "the")]);
    let older_plan = engine.plan(&older).unwrap();
    let newer_plan = engine.plan(&newer).unwrap();

    let older_results = pollster::block_on(checker.check(older_plan.requests())).unwrap();
    let newer_results = pollster::block_on(checker.check(newer_plan.requests())).unwrap();

    engine.merge(newer_plan, newer_results).unwrap();
    engine.merge(older_plan, older_results).unwrap();

    let entry = engine.entry("a").unwrap();
    assert_eq!(entry.text, "teh");
    assert_eq!(entry.errors.len(), 1);
}

#[test]
fn every_error_gets_its_own_id() {
    let mut engine = engine();
    let doc = Document::new(vec![para("a", "teh teh"), para("b", "teh")]);
    let checker = Dictionary::new(&[("teh", "the")]);
    pollster::block_on(engine.run(&doc, &checker));

    let mut ids: Vec<_> = engine
        .table()
        .values()
        .flat_map(|e| e.errors.iter().map(|err| err.id.clone()))
        .collect();
    let total = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(total, 3);
    assert_eq!(ids.len(), 3);
}
