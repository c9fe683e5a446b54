use std::sync::Arc;

use anyhow::Result;
use manos_plate_core::{
    Decorations, Document, DocumentValue, Editor, EditorConfig, EditorServices, ElementNode,
    ExchangeError, ManualClock, Node, NodeClass, Op, PluginRegistry, Point, Selection,
    SequentialIds, TEXT, TextNode,
};
use serde_json::json;

#[test]
fn documents_travel_in_a_versioned_envelope() -> Result<()> {
    let doc = Document::new(vec![Node::Element(
        ElementNode::new(TEXT, NodeClass::Text)
            .with_id("p")
            .with_child(Node::Text(TextNode::new("hi").with_mark("core/bold"))),
    )]);

    let value = serde_json::to_value(DocumentValue::from_document(doc.clone()))?;
    assert_eq!(
        value,
        json!({
            "schema": "manos-plate",
            "version": 1,
            "document": {
                "children": [{
                    "node": "element",
                    "id": "p",
                    "class": "text",
                    "type": "core/text",
                    "children": [
                        { "node": "text", "text": "hi", "marks": { "core/bold": true } }
                    ]
                }]
            }
        })
    );

    let back: DocumentValue = serde_json::from_value(value)?;
    assert_eq!(back.into_document(), doc);
    Ok(())
}

#[test]
fn missing_envelope_fields_take_defaults() -> Result<()> {
    let value = DocumentValue::from_json_str(
        r#"{ "document": { "children": [
            { "node": "element", "type": "core/quote", "class": "block" }
        ] } }"#,
    )?;
    assert_eq!(value.schema, "manos-plate");
    assert_eq!(value.version, 1);

    let quote = value.document.children[0]
        .as_element()
        .expect("expected element");
    assert_eq!(quote.class, NodeClass::Block);
    assert!(quote.id.is_none());
    assert!(quote.children.is_empty());
    Ok(())
}

#[test]
fn decorations_are_never_persisted() -> Result<()> {
    let mut leaf = TextNode::new("draft");
    leaf.decorations = Decorations {
        spelling_errors: Vec::new(),
        placeholder: Some("Type something".into()),
    };

    let json = serde_json::to_value(Node::Text(leaf.clone()))?;
    assert_eq!(json, json!({ "node": "text", "text": "draft" }));

    let back: Node = serde_json::from_value(json)?;
    assert_eq!(back, Node::Text(leaf));
    let Node::Text(back) = back else {
        panic!("expected text leaf");
    };
    assert_eq!(back.decorations, Decorations::default());
    Ok(())
}

#[test]
fn ops_are_tagged_by_kind() -> Result<()> {
    let op = Op::InsertText {
        path: vec![0, 1],
        offset: 3,
        text: "x".into(),
    };
    let json = serde_json::to_value(&op)?;
    assert_eq!(
        json,
        json!({ "op": "insert_text", "path": [0, 1], "offset": 3, "text": "x" })
    );
    assert_eq!(serde_json::from_value::<Op>(json)?, op);

    let merge: Op = serde_json::from_value(json!({ "op": "merge_node", "path": [2], "position": 4 }))?;
    assert_eq!(
        merge,
        Op::MergeNode {
            path: vec![2],
            position: 4
        }
    );
    Ok(())
}

#[test]
fn partial_config_fills_in_defaults() -> Result<()> {
    let config = EditorConfig::from_json_str(r#"{ "max_undo": 5, "default_lang": "de" }"#)?;
    assert_eq!(config.max_undo, 5);
    assert_eq!(config.default_lang, "de");
    assert_eq!(config.max_normalize_iterations, 1000);
    assert_eq!(config.default_block_type, TEXT);
    assert_eq!(config.spellcheck_debounce().as_millis(), 500);
    assert_eq!(config.commit_debounce().as_millis(), 300);
    assert!(!config.verbose);

    assert!(EditorConfig::from_json_str(r#"{ "max_undo": "lots" }"#).is_err());
    Ok(())
}

#[test]
fn foreign_or_future_envelopes_are_rejected() {
    let other = r#"{ "schema": "slate", "document": { "children": [] } }"#;
    assert!(matches!(
        DocumentValue::decode(other),
        Err(ExchangeError::UnknownSchema(ref s)) if s == "slate"
    ));

    let future = r#"{ "version": 2, "document": { "children": [] } }"#;
    assert!(matches!(
        DocumentValue::decode(future),
        Err(ExchangeError::TooNew { found: 2, .. })
    ));

    assert!(matches!(
        DocumentValue::decode("{"),
        Err(ExchangeError::Json(_))
    ));
}

#[test]
fn imported_documents_are_normalized_and_start_a_fresh_history() -> Result<()> {
    let mut editor = Editor::build(
        Document::new(vec![Node::paragraph("old")]),
        Selection::collapsed(Point::new(vec![0, 0], 0)),
        PluginRegistry::builtin(),
        EditorConfig::default(),
        EditorServices {
            clock: Arc::new(ManualClock::new()),
            ids: Arc::new(SequentialIds::new("n")),
        },
    );
    editor.insert_text("x")?;
    assert!(editor.can_undo());

    let value = DocumentValue::decode(
        r#"{ "document": { "children": [
            { "node": "element", "type": "core/text", "id": "a",
              "children": [{ "node": "text", "text": "one" }] },
            { "node": "element", "type": "core/text", "id": "a",
              "children": [{ "node": "text", "text": "two" }] }
        ] } }"#,
    )?;
    let corrections = editor.import_value(value)?;
    assert!(corrections > 0);
    assert!(!editor.can_undo());

    let exported = editor.export_value();
    let ids: Vec<_> = exported
        .document
        .children
        .iter()
        .filter_map(|n| n.as_element()?.id.clone())
        .collect();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], "a");
    assert_ne!(ids[1], "a");

    let json = exported.to_json_pretty()?;
    assert_eq!(DocumentValue::decode(&json)?, exported);
    Ok(())
}
