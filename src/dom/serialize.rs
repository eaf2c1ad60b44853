use std::io::Write;

use thiserror::Error;
use xml::writer::{EmitterConfig, EventWriter, XmlEvent};

use super::tree::{DocumentTree, NodeId};

#[derive(Debug, Error)]
#[error("could not serialize document: {0}")]
pub struct SerializeError(#[from] xml::writer::Error);

/// Writes the document out as indented UTF-8 XML with a declaration,
/// matching the layout the game's own files use.
pub fn serialize(tree: &DocumentTree) -> Result<Vec<u8>, SerializeError> {
    let mut output = Vec::new();

    let mut writer = EmitterConfig::new()
        .perform_indent(true)
        .create_writer(&mut output);

    write_node(tree, tree.root(), &mut writer)?;

    Ok(output)
}

fn write_node<W: Write>(
    tree: &DocumentTree,
    id: NodeId,
    writer: &mut EventWriter<W>,
) -> Result<(), SerializeError> {
    if let Some(comment) = tree.comment_text(id) {
        writer.write(XmlEvent::comment(comment))?;
        return Ok(());
    }

    let tag = tree.tag(id).expect("nodes are either elements or comments");

    let mut start = XmlEvent::start_element(tag);
    for attr in tree.attributes(id) {
        start = start.attr(attr.name.as_str(), &attr.value);
    }
    writer.write(start)?;

    if let Some(text) = tree.text(id) {
        writer.write(XmlEvent::characters(text))?;
    }

    for &child in tree.children(id) {
        write_node(tree, child, writer)?;
    }

    writer.write(XmlEvent::end_element())?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dom::{parse, ElementTemplate};

    #[test]
    fn round_trips_through_parse() {
        let tree = DocumentTree::from_root(
            ElementTemplate::new("data")
                .with_child(
                    ElementTemplate::new("Tech")
                        .with_attribute("id", "7")
                        .with_attribute("cost", "a < b & c")
                        .with_child(ElementTemplate::new("name").with_text("Hull \"Mk2\"")),
                )
                .with_node(crate::dom::NodeTemplate::Comment(" keep me ".to_owned())),
        );

        let bytes = serialize(&tree).unwrap();
        assert!(bytes.starts_with(b"<?xml"));

        let reparsed = parse(&bytes).unwrap();
        let root = reparsed.root();

        let tech = reparsed.children(root)[0];
        assert_eq!(reparsed.attribute(tech, "cost"), Some("a < b & c"));

        let name = reparsed.children(tech)[0];
        assert_eq!(reparsed.text(name), Some("Hull \"Mk2\""));

        let comment = reparsed.children(root)[1];
        assert_eq!(reparsed.comment_text(comment), Some(" keep me "));
    }

    #[test]
    fn attribute_order_is_preserved() {
        let tree = DocumentTree::from_root(
            ElementTemplate::new("data").with_child(
                ElementTemplate::new("re")
                    .with_attribute("n", "950")
                    .with_attribute("t", "5")
                    .with_attribute("x", "0"),
            ),
        );

        let text = String::from_utf8(serialize(&tree).unwrap()).unwrap();
        let n = text.find("n=").unwrap();
        let t = text.find("t=").unwrap();
        let x = text.find("x=").unwrap();
        assert!(n < t && t < x);
    }
}
