use std::collections::HashSet;

/// Handle to a node in a [`DocumentTree`].
///
/// Ids are cheap to copy and stay valid for the lifetime of the tree they
/// came from, including across detaches. Using an id with a tree other than
/// the one that minted it is a logic error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

/// A single `name="value"` pair on an element.
///
/// Attributes keep their document order, which matters for serialization
/// and for variable listings in mod manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

impl Attribute {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Attribute {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug)]
struct Node {
    parent: Option<NodeId>,
    kind: NodeKind,
}

#[derive(Debug)]
enum NodeKind {
    Element(ElementData),
    Comment(String),
}

#[derive(Debug)]
struct ElementData {
    tag: String,
    attributes: Vec<Attribute>,
    text: Option<String>,
    children: Vec<NodeId>,
}

/// An XML document held as an arena of nodes.
///
/// There is always exactly one root element. Elements own their attributes,
/// their concatenated character data, and an ordered child list that can
/// contain both elements and comments. Detached subtrees stay in the arena
/// and their ids remain usable, they are just no longer reachable from the
/// root.
#[derive(Debug)]
pub struct DocumentTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl DocumentTree {
    /// Creates a document containing just an empty root element.
    pub fn new(root_tag: &str) -> Self {
        let mut tree = DocumentTree {
            nodes: Vec::new(),
            root: NodeId(0),
        };

        let root = tree.push_node(
            None,
            NodeKind::Element(ElementData {
                tag: root_tag.to_owned(),
                attributes: Vec::new(),
                text: None,
                children: Vec::new(),
            }),
        );
        tree.root = root;
        tree
    }

    /// Builds a whole document from an owned template.
    pub fn from_root(template: ElementTemplate) -> Self {
        let mut tree = DocumentTree::new(&template.tag);
        let root = tree.root;

        {
            let data = tree.element_mut(root);
            data.attributes = template.attributes;
            data.text = template.text;
        }

        for child in &template.children {
            tree.append_template(root, child);
        }

        tree
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::Element(_))
    }

    pub fn is_comment(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::Comment(_))
    }

    /// The element's tag name, or `None` for comment nodes.
    pub fn tag(&self, id: NodeId) -> Option<&str> {
        match &self.node(id).kind {
            NodeKind::Element(data) => Some(&data.tag),
            NodeKind::Comment(_) => None,
        }
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Option<&str> {
        match &self.node(id).kind {
            NodeKind::Element(data) => data
                .attributes
                .iter()
                .find(|attr| attr.name == name)
                .map(|attr| attr.value.as_str()),
            NodeKind::Comment(_) => None,
        }
    }

    pub fn attributes(&self, id: NodeId) -> &[Attribute] {
        match &self.node(id).kind {
            NodeKind::Element(data) => &data.attributes,
            NodeKind::Comment(_) => &[],
        }
    }

    /// Concatenated character data of the element, or `None` when the
    /// element has none (an empty element reads as `None`, not `Some("")`).
    pub fn text(&self, id: NodeId) -> Option<&str> {
        match &self.node(id).kind {
            NodeKind::Element(data) => data.text.as_deref(),
            NodeKind::Comment(_) => None,
        }
    }

    pub fn comment_text(&self, id: NodeId) -> Option<&str> {
        match &self.node(id).kind {
            NodeKind::Comment(text) => Some(text),
            NodeKind::Element(_) => None,
        }
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match &self.node(id).kind {
            NodeKind::Element(data) => &data.children,
            NodeKind::Comment(_) => &[],
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    /// Index of `id` within its parent's child list, or `None` for the root
    /// and for detached nodes.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        let parent = self.node(id).parent?;
        self.children(parent).iter().position(|&child| child == id)
    }

    /// Child elements of `id`, skipping comments.
    pub fn child_elements(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children(id)
            .iter()
            .copied()
            .filter(move |&child| self.is_element(child))
    }

    /// Pre-order traversal starting at (and including) `id`.
    pub fn descendants(&self, id: NodeId) -> Descendants<'_> {
        Descendants {
            tree: self,
            stack: vec![id],
        }
    }

    /// Sets or replaces an attribute, keeping its position if it already
    /// exists and appending otherwise.
    pub fn set_attribute(&mut self, id: NodeId, name: &str, value: &str) {
        let data = self.element_mut(id);
        match data.attributes.iter_mut().find(|attr| attr.name == name) {
            Some(attr) => attr.value = value.to_owned(),
            None => data.attributes.push(Attribute::new(name, value)),
        }
    }

    pub fn remove_attribute(&mut self, id: NodeId, name: &str) -> Option<String> {
        let data = self.element_mut(id);
        let index = data.attributes.iter().position(|attr| attr.name == name)?;
        Some(data.attributes.remove(index).value)
    }

    pub fn set_text(&mut self, id: NodeId, text: Option<String>) {
        self.element_mut(id).text = text;
    }

    /// Appends a run of character data, concatenating with any text already
    /// present. Used by the parser, which can see several text events for
    /// one element.
    pub fn push_text(&mut self, id: NodeId, chunk: &str) {
        let data = self.element_mut(id);
        match &mut data.text {
            Some(text) => text.push_str(chunk),
            None => data.text = Some(chunk.to_owned()),
        }
    }

    /// Creates an empty element as the last child of `parent`.
    pub fn append_element(&mut self, parent: NodeId, tag: &str) -> NodeId {
        let id = self.push_node(
            Some(parent),
            NodeKind::Element(ElementData {
                tag: tag.to_owned(),
                attributes: Vec::new(),
                text: None,
                children: Vec::new(),
            }),
        );
        self.element_mut(parent).children.push(id);
        id
    }

    pub fn append_comment(&mut self, parent: NodeId, text: String) -> NodeId {
        let id = self.push_node(Some(parent), NodeKind::Comment(text));
        self.element_mut(parent).children.push(id);
        id
    }

    /// Deep-copies a template into the tree as the last child of `parent`.
    pub fn append_template(&mut self, parent: NodeId, template: &NodeTemplate) -> NodeId {
        let index = self.children(parent).len();
        self.insert_template(parent, index, template)
    }

    /// Deep-copies a template into the tree at `index` within `parent`'s
    /// child list.
    pub fn insert_template(
        &mut self,
        parent: NodeId,
        index: usize,
        template: &NodeTemplate,
    ) -> NodeId {
        let id = self.create_detached(template);
        self.node_mut(id).parent = Some(parent);
        self.element_mut(parent).children.insert(index, id);
        id
    }

    /// Deep-copies the subtree rooted at `id` into an owned template, which
    /// can then be inserted into this or any other tree.
    pub fn snapshot(&self, id: NodeId) -> NodeTemplate {
        match &self.node(id).kind {
            NodeKind::Comment(text) => NodeTemplate::Comment(text.clone()),
            NodeKind::Element(data) => NodeTemplate::Element(ElementTemplate {
                tag: data.tag.clone(),
                attributes: data.attributes.clone(),
                text: data.text.clone(),
                children: data
                    .children
                    .iter()
                    .map(|&child| self.snapshot(child))
                    .collect(),
            }),
        }
    }

    /// Unlinks `id` from its parent. The subtree stays in the arena and the
    /// id remains valid. Detaching the root or an already detached node is a
    /// no-op.
    pub fn detach(&mut self, id: NodeId) {
        let parent = match self.node(id).parent {
            Some(parent) => parent,
            None => return,
        };

        self.element_mut(parent).children.retain(|&child| child != id);
        self.node_mut(id).parent = None;
    }

    /// Replaces the child list of `parent` with a new ordering of the same
    /// ids.
    pub fn reorder_children(&mut self, parent: NodeId, order: Vec<NodeId>) {
        debug_assert_eq!(
            order.iter().copied().collect::<HashSet<_>>(),
            self.children(parent).iter().copied().collect::<HashSet<_>>(),
            "reorder_children must be given a permutation of the existing children"
        );

        self.element_mut(parent).children = order;
    }

    fn push_node(&mut self, parent: Option<NodeId>, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { parent, kind });
        id
    }

    fn create_detached(&mut self, template: &NodeTemplate) -> NodeId {
        match template {
            NodeTemplate::Comment(text) => self.push_node(None, NodeKind::Comment(text.clone())),
            NodeTemplate::Element(element) => {
                let id = self.push_node(
                    None,
                    NodeKind::Element(ElementData {
                        tag: element.tag.clone(),
                        attributes: element.attributes.clone(),
                        text: element.text.clone(),
                        children: Vec::new(),
                    }),
                );

                for child in &element.children {
                    let child_id = self.create_detached(child);
                    self.node_mut(child_id).parent = Some(id);
                    self.element_mut(id).children.push(child_id);
                }

                id
            }
        }
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    fn element_mut(&mut self, id: NodeId) -> &mut ElementData {
        match &mut self.node_mut(id).kind {
            NodeKind::Element(data) => data,
            NodeKind::Comment(_) => panic!("node {:?} is a comment, not an element", id),
        }
    }
}

pub struct Descendants<'a> {
    tree: &'a DocumentTree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        let children = self.tree.children(id);
        self.stack.extend(children.iter().rev().copied());
        Some(id)
    }
}

/// Owned description of a node, used to build subtrees and to copy them
/// between documents.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeTemplate {
    Element(ElementTemplate),
    Comment(String),
}

/// Owned description of an element and everything under it.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementTemplate {
    pub tag: String,
    pub attributes: Vec<Attribute>,
    pub text: Option<String>,
    pub children: Vec<NodeTemplate>,
}

impl ElementTemplate {
    pub fn new<S: Into<String>>(tag: S) -> Self {
        ElementTemplate {
            tag: tag.into(),
            attributes: Vec::new(),
            text: None,
            children: Vec::new(),
        }
    }

    pub fn with_attribute<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.attributes.push(Attribute::new(name, value));
        self
    }

    pub fn with_text<S: Into<String>>(mut self, text: S) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: ElementTemplate) -> Self {
        self.children.push(NodeTemplate::Element(child));
        self
    }

    pub fn with_node(mut self, node: NodeTemplate) -> Self {
        self.children.push(node);
        self
    }
}

impl From<ElementTemplate> for NodeTemplate {
    fn from(template: ElementTemplate) -> Self {
        NodeTemplate::Element(template)
    }
}
