use thiserror::Error;
use xml::reader::{ParserConfig, XmlEvent};

use super::tree::{Attribute, DocumentTree, NodeId};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed XML: {0}")]
    Xml(#[from] xml::reader::Error),

    #[error("document has no root element")]
    NoRoot,
}

/// Parses a complete document, failing on the first error.
pub fn parse(source: &[u8]) -> Result<DocumentTree, ParseError> {
    let mut builder = TreeBuilder::new();

    for event in reader_config().create_reader(source) {
        if !builder.handle(event?) {
            break;
        }
    }

    builder.finish().ok_or(ParseError::NoRoot)
}

/// Parses as much of a document as possible.
///
/// Content up to the first error is kept, so a file with a malformed tail
/// still yields the leading entries. Returns the partial tree (or `None`
/// when not even a root element could be read) along with the error that
/// stopped the parse, if any. The caller decides how loudly to report it.
pub fn parse_recovering(source: &[u8]) -> (Option<DocumentTree>, Option<ParseError>) {
    let mut builder = TreeBuilder::new();
    let mut problem = None;

    for event in reader_config().create_reader(source) {
        match event {
            Ok(event) => {
                if !builder.handle(event) {
                    break;
                }
            }
            Err(err) => {
                problem = Some(err.into());
                break;
            }
        }
    }

    (builder.finish(), problem)
}

fn reader_config() -> ParserConfig {
    ParserConfig::new()
        .ignore_comments(false)
        .cdata_to_characters(true)
        .coalesce_characters(true)
}

struct TreeBuilder {
    tree: Option<DocumentTree>,
    stack: Vec<NodeId>,
    // Depth inside an ignored trailing element, 0 while inside the real
    // document.
    skip_depth: usize,
}

impl TreeBuilder {
    fn new() -> Self {
        TreeBuilder {
            tree: None,
            stack: Vec::new(),
            skip_depth: 0,
        }
    }

    /// Feeds one event into the builder. Returns `false` once the document
    /// is finished.
    fn handle(&mut self, event: XmlEvent) -> bool {
        match event {
            XmlEvent::StartElement {
                name, attributes, ..
            } => {
                if self.skip_depth > 0 {
                    self.skip_depth += 1;
                    return true;
                }

                let attributes: Vec<Attribute> = attributes
                    .into_iter()
                    .map(|attr| Attribute::new(attr.name.local_name, attr.value))
                    .collect();

                match (&mut self.tree, self.stack.last().copied()) {
                    (None, _) => {
                        let mut tree = DocumentTree::new(&name.local_name);
                        let root = tree.root();
                        for attr in attributes {
                            tree.set_attribute(root, &attr.name, &attr.value);
                        }
                        self.stack.push(root);
                        self.tree = Some(tree);
                    }
                    (Some(tree), Some(parent)) => {
                        let id = tree.append_element(parent, &name.local_name);
                        for attr in attributes {
                            tree.set_attribute(id, &attr.name, &attr.value);
                        }
                        self.stack.push(id);
                    }
                    (Some(_), None) => {
                        // A second root element. Ignore it and everything
                        // inside it.
                        log::debug!("ignoring extra root element <{}>", name.local_name);
                        self.skip_depth = 1;
                    }
                }
            }
            XmlEvent::EndElement { .. } => {
                if self.skip_depth > 0 {
                    self.skip_depth -= 1;
                } else {
                    self.stack.pop();
                }
            }
            XmlEvent::Characters(chunk) => {
                if self.skip_depth == 0 {
                    if let (Some(tree), Some(&current)) = (&mut self.tree, self.stack.last()) {
                        tree.push_text(current, &chunk);
                    }
                }
            }
            XmlEvent::Comment(text) => {
                if self.skip_depth == 0 {
                    if let (Some(tree), Some(&current)) = (&mut self.tree, self.stack.last()) {
                        tree.append_comment(current, text);
                    }
                }
            }
            XmlEvent::EndDocument => return false,
            // Whitespace between elements, processing instructions, and the
            // document prolog carry nothing we keep.
            _ => {}
        }

        true
    }

    fn finish(self) -> Option<DocumentTree> {
        self.tree
    }
}
