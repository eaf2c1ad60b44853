//! Path expressions over a [`DocumentTree`].
//!
//! This is the query subset that section registries and patch scripts are
//! written against: `/` and `//` steps, element names or `*`, `.` as a
//! no-op step, and predicates testing attributes (`[@a]`, `[not(@a)]`,
//! `[@a='v']`, `[@a!='v']`), positions (`[3]`, `[last()]`), and `and`
//! conjunctions of those. Anything outside the subset is a parse error up
//! front rather than a silent no-match at evaluation time.
//!
//! Queries always evaluate against the document, so absolute and relative
//! forms of the same path select the same nodes. Results are in document
//! order with duplicates removed. Positional predicates index into the
//! candidate group of a single context node, re-numbered after each
//! preceding predicate, which matches how the expressions behave in a full
//! XPath engine.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::tree::{DocumentTree, NodeId};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("empty path expression")]
    Empty,

    #[error("unsupported path expression {expression:?}: {reason}")]
    Unsupported { expression: String, reason: String },
}

/// A parsed path expression, ready to evaluate against any document.
#[derive(Debug, Clone)]
pub struct PathQuery {
    expression: String,
    steps: Vec<Step>,
}

#[derive(Debug, Clone)]
struct Step {
    axis: Axis,
    test: NameTest,
    predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Axis {
    Child,
    Descendant,
    Current,
}

#[derive(Debug, Clone)]
enum NameTest {
    Any,
    Named(String),
}

#[derive(Debug, Clone)]
enum Predicate {
    HasAttribute(String),
    LacksAttribute(String),
    AttributeEquals { name: String, value: String },
    AttributeDiffers { name: String, value: String },
    Position(usize),
    Last,
    All(Vec<Predicate>),
}

#[derive(Debug, Clone, Copy)]
enum Context {
    Document,
    Node(NodeId),
}

impl PathQuery {
    /// Selects every element the expression matches, in document order.
    pub fn evaluate(&self, tree: &DocumentTree) -> Vec<NodeId> {
        let mut contexts = vec![Context::Document];

        for step in &self.steps {
            let mut next = Vec::new();
            let mut seen = HashSet::new();

            for &context in &contexts {
                if step.axis == Axis::Current {
                    next.push(context);
                    continue;
                }

                let group = step.candidates(tree, context);
                let group = apply_predicates(tree, group, &step.predicates);

                for id in group {
                    if seen.insert(id) {
                        next.push(Context::Node(id));
                    }
                }
            }

            contexts = next;
        }

        contexts
            .into_iter()
            .filter_map(|context| match context {
                Context::Node(id) => Some(id),
                Context::Document => None,
            })
            .collect()
    }

    /// Like [`evaluate`](Self::evaluate), but yields only the first match.
    pub fn first(&self, tree: &DocumentTree) -> Option<NodeId> {
        self.evaluate(tree).into_iter().next()
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl fmt::Display for PathQuery {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        out.write_str(&self.expression)
    }
}

impl FromStr for PathQuery {
    type Err = QueryError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let expression = source.trim();
        if expression.is_empty() {
            return Err(QueryError::Empty);
        }

        let unsupported = |reason: &str| QueryError::Unsupported {
            expression: expression.to_owned(),
            reason: reason.to_owned(),
        };

        let mut rest = expression;
        let mut axis = Axis::Child;
        if let Some(stripped) = rest.strip_prefix("//") {
            axis = Axis::Descendant;
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('/') {
            rest = stripped;
        }

        if rest.is_empty() {
            return Err(unsupported("expected a step after the leading separator"));
        }

        let mut steps = Vec::new();
        loop {
            let (segment, next_axis, remainder) =
                take_segment(rest).map_err(|reason| unsupported(&reason))?;

            steps.push(parse_segment(segment, axis).map_err(|reason| unsupported(&reason))?);

            match remainder {
                Some(remainder) => {
                    axis = next_axis;
                    rest = remainder;
                }
                None => break,
            }
        }

        Ok(PathQuery {
            expression: expression.to_owned(),
            steps,
        })
    }
}

impl Step {
    fn candidates(&self, tree: &DocumentTree, context: Context) -> Vec<NodeId> {
        let matches_test = |id: NodeId| match (&self.test, tree.tag(id)) {
            (_, None) => false,
            (NameTest::Any, Some(_)) => true,
            (NameTest::Named(name), Some(tag)) => name == tag,
        };

        match (self.axis, context) {
            (Axis::Child, Context::Document) => {
                let root = tree.root();
                if matches_test(root) {
                    vec![root]
                } else {
                    Vec::new()
                }
            }
            (Axis::Child, Context::Node(id)) => tree
                .children(id)
                .iter()
                .copied()
                .filter(|&child| matches_test(child))
                .collect(),
            (Axis::Descendant, Context::Document) => tree
                .descendants(tree.root())
                .filter(|&id| matches_test(id))
                .collect(),
            (Axis::Descendant, Context::Node(id)) => tree
                .descendants(id)
                .skip(1)
                .filter(|&id| matches_test(id))
                .collect(),
            (Axis::Current, _) => unreachable!("current steps are handled before candidates"),
        }
    }
}

fn apply_predicates(
    tree: &DocumentTree,
    mut group: Vec<NodeId>,
    predicates: &[Predicate],
) -> Vec<NodeId> {
    for predicate in predicates {
        let len = group.len();
        group = group
            .into_iter()
            .enumerate()
            .filter(|&(index, id)| predicate.matches(tree, id, index, len))
            .map(|(_, id)| id)
            .collect();
    }

    group
}

impl Predicate {
    fn matches(&self, tree: &DocumentTree, id: NodeId, index: usize, len: usize) -> bool {
        match self {
            Predicate::HasAttribute(name) => tree.attribute(id, name).is_some(),
            Predicate::LacksAttribute(name) => tree.attribute(id, name).is_none(),
            Predicate::AttributeEquals { name, value } => tree.attribute(id, name) == Some(value),
            Predicate::AttributeDiffers { name, value } => tree
                .attribute(id, name)
                .map_or(false, |actual| actual != value),
            Predicate::Position(position) => index + 1 == *position,
            Predicate::Last => index + 1 == len,
            Predicate::All(parts) => parts
                .iter()
                .all(|part| part.matches(tree, id, index, len)),
        }
    }
}

/// Splits off the leading step of `rest`, returning the step text, the axis
/// of the step that follows it, and the remainder (if any). Slashes inside
/// predicates and quoted literals do not split.
fn take_segment(rest: &str) -> Result<(&str, Axis, Option<&str>), String> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for (offset, ch) in rest.char_indices() {
        match (quote, ch) {
            (Some(open), _) if ch == open => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(ch),
            (None, '[') => depth += 1,
            (None, ']') => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unbalanced ']'".to_owned())?;
            }
            (None, '/') if depth == 0 => {
                let segment = &rest[..offset];
                let after = &rest[offset + 1..];
                if let Some(after) = after.strip_prefix('/') {
                    return Ok((segment, Axis::Descendant, Some(after)));
                }
                return Ok((segment, Axis::Child, Some(after)));
            }
            (None, _) => {}
        }
    }

    if quote.is_some() {
        return Err("unterminated string literal".to_owned());
    }
    if depth != 0 {
        return Err("unterminated predicate".to_owned());
    }

    Ok((rest, Axis::Child, None))
}

fn parse_segment(segment: &str, axis: Axis) -> Result<Step, String> {
    if segment.is_empty() {
        return Err("empty step".to_owned());
    }

    if segment == "." {
        return Ok(Step {
            axis: Axis::Current,
            test: NameTest::Any,
            predicates: Vec::new(),
        });
    }

    if segment == ".." {
        return Err("parent steps are not supported".to_owned());
    }

    let name_end = segment.find('[').unwrap_or(segment.len());
    let name = &segment[..name_end];

    if name.is_empty() {
        return Err("a step needs an element name before its predicates".to_owned());
    }
    if name.contains('@') || name.contains(']') {
        return Err(format!("invalid step name {:?}", name));
    }

    let test = if name == "*" {
        NameTest::Any
    } else {
        NameTest::Named(name.to_owned())
    };

    let mut predicates = Vec::new();
    let mut rest = &segment[name_end..];
    while !rest.is_empty() {
        let inner_len = matching_bracket(rest)?;
        predicates.push(parse_predicate(&rest[1..inner_len])?);
        rest = &rest[inner_len + 1..];
    }

    Ok(Step {
        axis,
        test,
        predicates,
    })
}

/// `rest` starts with `[`; returns the byte offset of the matching `]`.
fn matching_bracket(rest: &str) -> Result<usize, String> {
    debug_assert!(rest.starts_with('['));
    let mut quote: Option<char> = None;

    for (offset, ch) in rest.char_indices().skip(1) {
        match (quote, ch) {
            (Some(open), _) if ch == open => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(ch),
            (None, ']') => return Ok(offset),
            (None, '[') => return Err("nested predicates are not supported".to_owned()),
            (None, _) => {}
        }
    }

    Err("unterminated predicate".to_owned())
}

fn parse_predicate(body: &str) -> Result<Predicate, String> {
    let parts = split_on_and(body);
    if parts.len() > 1 {
        let parts = parts
            .into_iter()
            .map(parse_condition)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Predicate::All(parts));
    }

    parse_condition(body)
}

fn parse_condition(body: &str) -> Result<Predicate, String> {
    let body = body.trim();
    if body.is_empty() {
        return Err("empty predicate".to_owned());
    }

    if body == "last()" {
        return Ok(Predicate::Last);
    }

    if body.bytes().all(|byte| byte.is_ascii_digit()) {
        let position: usize = body
            .parse()
            .map_err(|_| format!("position {:?} is out of range", body))?;
        if position == 0 {
            return Err("positions are 1-based".to_owned());
        }
        return Ok(Predicate::Position(position));
    }

    if let Some(inner) = body.strip_prefix("not(").and_then(|s| s.strip_suffix(')')) {
        match parse_condition(inner)? {
            Predicate::HasAttribute(name) => return Ok(Predicate::LacksAttribute(name)),
            _ => return Err("only attribute presence can be negated".to_owned()),
        }
    }

    let attribute = body
        .strip_prefix('@')
        .ok_or_else(|| format!("unsupported predicate {:?}", body))?;

    if let Some(op_at) = attribute.find(|ch| ch == '=' || ch == '!') {
        let name = attribute[..op_at].trim();
        let (op_len, differs) = if attribute[op_at..].starts_with("!=") {
            (2, true)
        } else if attribute[op_at..].starts_with('=') {
            (1, false)
        } else {
            return Err(format!("unsupported operator in {:?}", body));
        };

        if name.is_empty() {
            return Err("attribute comparison is missing a name".to_owned());
        }

        let value = unquote(attribute[op_at + op_len..].trim())?;
        let name = name.to_owned();
        return Ok(if differs {
            Predicate::AttributeDiffers { name, value }
        } else {
            Predicate::AttributeEquals { name, value }
        });
    }

    let name = attribute.trim();
    if name.is_empty() {
        return Err("attribute test is missing a name".to_owned());
    }
    Ok(Predicate::HasAttribute(name.to_owned()))
}

fn unquote(literal: &str) -> Result<String, String> {
    let mut chars = literal.chars();
    let open = chars.next();

    match open {
        Some(quote @ ('\'' | '"')) => {
            let inner = &literal[1..];
            match inner.strip_suffix(quote) {
                Some(value) if !value.contains(quote) => Ok(value.to_owned()),
                _ => Err(format!("malformed string literal {:?}", literal)),
            }
        }
        _ => Err(format!(
            "attribute comparisons need a quoted value, got {:?}",
            literal
        )),
    }
}

/// Splits on top-level ` and `, respecting quoted literals and parentheses.
fn split_on_and(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut parens = 0usize;
    let mut start = 0;

    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let ch = bytes[i] as char;
        match (quote, ch) {
            (Some(open), _) if ch == open => quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => quote = Some(ch),
            (None, '(') => parens += 1,
            (None, ')') => parens = parens.saturating_sub(1),
            (None, ' ') if parens == 0 && body[i..].starts_with(" and ") => {
                parts.push(&body[start..i]);
                i += 5;
                start = i;
                continue;
            }
            (None, _) => {}
        }
        i += 1;
    }

    parts.push(&body[start..]);
    parts
}
