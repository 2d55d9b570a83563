//! XML fragments, elements, text nodes and tree traversal.

use serde_json::json;
use weave_core::{
    Attrs, Doc, DocOptions, Origin, PrelimXmlElement, PrelimXmlText, SharedRef, XmlIn,
};

fn doc_with_client(client: u64) -> Doc {
    Doc::with_options(DocOptions {
        client_id: Some(client),
        gc: true,
    })
}

fn element(name: &str) -> PrelimXmlElement {
    PrelimXmlElement::new(name)
}

#[test]
fn build_and_serialize_a_tree() {
    let mut doc = doc_with_client(100_000);
    let fragment = doc.get_xml_fragment("prosemirror").unwrap();
    doc.transact(|txn| {
        let mut paragraph = element("p");
        paragraph
            .children
            .push(XmlIn::Text(PrelimXmlText("hello".to_string())));
        let mut div = element("div");
        div.attributes.push(("class".to_string(), "note".into()));
        div.children.push(XmlIn::Element(paragraph));
        fragment.push(txn, vec![XmlIn::Element(div)]).unwrap();
    });

    assert_eq!(
        fragment.to_string(&doc).unwrap(),
        "<div class=\"note\"><p>hello</p></div>"
    );
    assert_eq!(fragment.len(&doc).unwrap(), 1);
}

#[test]
fn element_attributes() {
    let mut doc = doc_with_client(100_000);
    let fragment = doc.get_xml_fragment("f").unwrap();
    doc.transact(|txn| fragment.push(txn, vec![XmlIn::Element(element("div"))]).unwrap());
    let div = match fragment.first_child(&doc).unwrap() {
        Some(SharedRef::XmlElement(div)) => div,
        other => panic!("expected element, got {other:?}"),
    };

    doc.transact(|txn| {
        div.insert_attribute(txn, "height", "30px").unwrap();
        div.insert_attribute(txn, "hidden", true).unwrap();
    });
    assert_eq!(div.node_name(&doc).unwrap(), "div");
    assert_eq!(
        div.get_attribute(&doc, "height").unwrap(),
        Some(weave_core::Out::Json(json!("30px")))
    );
    assert_eq!(
        div.to_string(&doc).unwrap(),
        "<div height=\"30px\" hidden=\"true\"></div>"
    );

    doc.transact(|txn| div.remove_attribute(txn, "hidden").unwrap());
    assert_eq!(div.to_string(&doc).unwrap(), "<div height=\"30px\"></div>");
    assert_eq!(
        div.attributes(&doc)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect::<Vec<_>>(),
        vec!["height".to_string()]
    );
}

#[test]
fn siblings_and_first_child() {
    let mut doc = doc_with_client(100_000);
    let fragment = doc.get_xml_fragment("f").unwrap();
    doc.transact(|txn| {
        fragment
            .push(
                txn,
                vec![
                    XmlIn::Element(element("a")),
                    XmlIn::Element(element("b")),
                    XmlIn::Element(element("c")),
                ],
            )
            .unwrap();
    });

    let b = match fragment.get(&doc, 1).unwrap() {
        Some(SharedRef::XmlElement(b)) => b,
        other => panic!("expected element, got {other:?}"),
    };
    let prev = b.prev_sibling(&doc).unwrap();
    let next = b.next_sibling(&doc).unwrap();
    match (prev, next) {
        (Some(SharedRef::XmlElement(prev)), Some(SharedRef::XmlElement(next))) => {
            assert_eq!(prev.node_name(&doc).unwrap(), "a");
            assert_eq!(next.node_name(&doc).unwrap(), "c");
        }
        other => panic!("unexpected siblings: {other:?}"),
    }

    let first = match fragment.first_child(&doc).unwrap() {
        Some(SharedRef::XmlElement(first)) => first,
        other => panic!("expected element, got {other:?}"),
    };
    assert_eq!(first.node_name(&doc).unwrap(), "a");
    assert!(first.prev_sibling(&doc).unwrap().is_none());
}

#[test]
fn insert_after_reference_child() {
    let mut doc = doc_with_client(100_000);
    let fragment = doc.get_xml_fragment("f").unwrap();
    doc.transact(|txn| {
        fragment
            .push(
                txn,
                vec![XmlIn::Element(element("a")), XmlIn::Element(element("c"))],
            )
            .unwrap();
    });
    let a = fragment.first_child(&doc).unwrap().unwrap();
    doc.transact(|txn| {
        fragment
            .insert_after(txn, Some(&a), vec![XmlIn::Element(element("b"))])
            .unwrap();
    });
    assert_eq!(fragment.to_string(&doc).unwrap(), "<a></a><b></b><c></c>");

    doc.transact(|txn| {
        fragment
            .insert_after(txn, None, vec![XmlIn::Element(element("z"))])
            .unwrap();
    });
    assert_eq!(
        fragment.to_string(&doc).unwrap(),
        "<z></z><a></a><b></b><c></c>"
    );
}

#[test]
fn tree_walker_filters_descendants_depth_first() {
    let mut doc = doc_with_client(100_000);
    let fragment = doc.get_xml_fragment("f").unwrap();
    doc.transact(|txn| {
        let mut inner = element("p");
        inner
            .children
            .push(XmlIn::Text(PrelimXmlText("deep".to_string())));
        let mut outer = element("div");
        outer.children.push(XmlIn::Element(inner));
        outer.children.push(XmlIn::Element(element("span")));
        fragment
            .push(txn, vec![XmlIn::Element(outer), XmlIn::Element(element("p"))])
            .unwrap();
    });

    let names: Vec<String> = fragment
        .tree_walker(&doc, |node| matches!(node, SharedRef::XmlElement(_)))
        .unwrap()
        .map(|node| match node {
            SharedRef::XmlElement(el) => el.node_name(&doc).unwrap(),
            other => panic!("filter let through {other:?}"),
        })
        .collect();
    assert_eq!(names, vec!["div", "p", "span", "p"]);

    let text_nodes = fragment
        .tree_walker(&doc, |node| matches!(node, SharedRef::XmlText(_)))
        .unwrap()
        .count();
    assert_eq!(text_nodes, 1);
}

#[test]
fn xml_text_renders_formatting_as_tags() {
    let mut doc = doc_with_client(100_000);
    let fragment = doc.get_xml_fragment("f").unwrap();
    doc.transact(|txn| {
        fragment
            .push(txn, vec![XmlIn::Text(PrelimXmlText("hello world".to_string()))])
            .unwrap();
    });
    let text = match fragment.first_child(&doc).unwrap() {
        Some(SharedRef::XmlText(text)) => text,
        other => panic!("expected xml text, got {other:?}"),
    };

    let mut bold = Attrs::new();
    bold.insert("bold".to_string(), json!(true));
    doc.transact(|txn| text.format(txn, 0, 5, bold).unwrap());
    assert_eq!(
        text.to_string(&doc).unwrap(),
        "<bold>hello</bold> world"
    );

    let mut link = Attrs::new();
    link.insert("a".to_string(), json!({"href": "x"}));
    doc.transact(|txn| text.format(txn, 6, 5, link).unwrap());
    assert_eq!(
        text.to_string(&doc).unwrap(),
        "<bold>hello</bold> <a href=\"x\">world</a>"
    );
}

#[test]
fn xml_trees_converge_across_replicas() {
    let mut a = doc_with_client(100_000);
    let fragment_a = a.get_xml_fragment("f").unwrap();
    a.transact(|txn| {
        let mut div = element("div");
        div.attributes.push(("id".to_string(), "root".into()));
        div.children
            .push(XmlIn::Text(PrelimXmlText("body".to_string())));
        fragment_a.push(txn, vec![XmlIn::Element(div)]).unwrap();
    });

    let mut b = doc_with_client(200_000);
    b.apply_update(&a.encode_state_as_update().unwrap(), Origin::None)
        .unwrap();
    let fragment_b = b.get_xml_fragment("f").unwrap();
    assert_eq!(
        fragment_b.to_string(&b).unwrap(),
        fragment_a.to_string(&a).unwrap()
    );
    assert_eq!(
        fragment_b.to_string(&b).unwrap(),
        "<div id=\"root\">body</div>"
    );
}
