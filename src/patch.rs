//! The patch script interpreter.
//!
//! After merging, mods may ship `patches/` scripts that edit the merged
//! documents surgically. A script is an XML file whose root children are
//! operations:
//!
//! ```xml
//! <patch>
//!     <Operation Class="AttributeSet">
//!         <xpath>/data/Tech[@id="42"]</xpath>
//!         <attribute>cost</attribute>
//!         <value>100</value>
//!     </Operation>
//! </patch>
//! ```
//!
//! Each operation selects targets with a path expression, optionally
//! gates itself on an `<enable>` or `<disable>` flag, and then mutates
//! every selected element. `$name` variables from the mod's info.xml are
//! substituted into values and gate flags before use, never into the
//! documents being patched. An operation that matches nothing is skipped
//! with a note; a malformed operation fails the mod.

use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use thiserror::Error;

use crate::dom::query::{PathQuery, QueryError};
use crate::dom::{DocumentTree, NodeId, NodeTemplate};
use crate::library::{registry, Baseline, OverlaySet};
use crate::manifest::ModManifest;

/// The operations a patch script can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOpKind {
    AttributeSet,
    AttributeAdd,
    AttributeRemove,
    AttributeMath,
    NodeAddLast,
    NodeAddFirst,
    NodeInsertAfter,
    NodeInsertBefore,
    NodeRemove,
    NodeReplace,
}

impl fmt::Display for PatchOpKind {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PatchOpKind::AttributeSet => "AttributeSet",
            PatchOpKind::AttributeAdd => "AttributeAdd",
            PatchOpKind::AttributeRemove => "AttributeRemove",
            PatchOpKind::AttributeMath => "AttributeMath",
            PatchOpKind::NodeAddLast => "AddNodeLast",
            PatchOpKind::NodeAddFirst => "AddNodeFirst",
            PatchOpKind::NodeInsertAfter => "InsertNodeAfter",
            PatchOpKind::NodeInsertBefore => "InsertNodeBefore",
            PatchOpKind::NodeRemove => "RemoveNode",
            PatchOpKind::NodeReplace => "ReplaceNode",
        };
        out.write_str(name)
    }
}

impl FromStr for PatchOpKind {
    type Err = PatchError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let kind = match source {
            "SetAttribute" | "AttributeSet" => PatchOpKind::AttributeSet,
            "AddAttribute" | "AttributeAdd" => PatchOpKind::AttributeAdd,
            "RemoveAttribute" | "AttributeRemove" => PatchOpKind::AttributeRemove,
            "MathAttribute" | "AttributeMath" => PatchOpKind::AttributeMath,
            "Add" | "AddNode" | "NodeAdd" | "AddLast" | "AddNodeLast" | "NodeAddLast" => {
                PatchOpKind::NodeAddLast
            }
            "AddFirst" | "AddNodeFirst" | "NodeAddFirst" => PatchOpKind::NodeAddFirst,
            "Insert" | "InsertNode" | "NodeInsert" | "InsertAfter" | "InsertNodeAfter"
            | "NodeInsertAfter" => PatchOpKind::NodeInsertAfter,
            "InsertBefore" | "InsertNodeBefore" | "NodeInsertBefore" => {
                PatchOpKind::NodeInsertBefore
            }
            "Remove" | "RemoveNode" | "NodeRemove" => PatchOpKind::NodeRemove,
            "Replace" | "ReplaceNode" | "NodeReplace" => PatchOpKind::NodeReplace,
            _ => return Err(PatchError::UnknownKind(source.to_owned())),
        };
        Ok(kind)
    }
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("the operation has no Class attribute")]
    MissingClass,

    #[error("unknown patch class {0:?}")]
    UnknownKind(String),

    #[error("{kind} has no <xpath> to select targets")]
    MissingQuery { kind: PatchOpKind },

    #[error("bad target expression: {0}")]
    Query(#[from] QueryError),

    #[error("{kind} needs an <attribute> element naming the attribute")]
    MissingAttributeField { kind: PatchOpKind },

    #[error("{kind} needs a non-empty <value> element")]
    MissingValueField { kind: PatchOpKind },

    #[error("attribute {name} already exists on an element matched by {query}")]
    AttributeExists { name: String, query: String },

    #[error("attribute {name} is missing from an element matched by {query}")]
    AttributeAbsent { name: String, query: String },

    #[error("{value:?} is not a number")]
    NotNumeric { value: String },

    #[error("unknown opType {0:?}; expected add, subtract, multiply, or divide")]
    UnknownMathOp(String),

    #[error("math on attribute {attribute} produced a non-finite result")]
    NotFinite { attribute: String },

    #[error("the matched element has no parent to insert into")]
    NoParent,

    #[error("ReplaceNode needs at least one node inside its <value>")]
    EmptyReplacement,

    #[error("{value:?} is not a truth flag")]
    BadFlag { value: String },
}

/// Runs every patch script of one mod against the merged documents.
///
/// Scripts are applied in registry document order, and within a document
/// in file name order. The first failing operation aborts the mod's
/// remaining patches; earlier operations stay applied.
pub fn apply_patches(
    baseline: &mut Baseline,
    patches: &OverlaySet,
    manifest: &ModManifest,
) -> anyhow::Result<()> {
    for &document in registry::DOCUMENTS {
        let chunks = patches.get(document);
        if chunks.is_empty() {
            continue;
        }

        let target = baseline.expect_document_mut(document)?;
        for chunk in chunks {
            apply_chunk(target, chunk, manifest, document)
                .with_context(|| format!("patching {}", document))?;
        }
    }

    Ok(())
}

fn apply_chunk(
    target: &mut DocumentTree,
    script: &DocumentTree,
    manifest: &ModManifest,
    document: &str,
) -> anyhow::Result<()> {
    let root = script.root();

    let opted_out = script
        .child_elements(root)
        .any(|child| script.tag(child) == Some("Noload"));
    if opted_out {
        log::info!("a patch file for {} asks not to be loaded; skipping it", document);
        return Ok(());
    }

    for (index, operation) in script.child_elements(root).enumerate() {
        apply_operation(target, script, operation, manifest)
            .with_context(|| format!("operation {}", index + 1))?;
    }

    Ok(())
}

fn apply_operation(
    target: &mut DocumentTree,
    script: &DocumentTree,
    operation: NodeId,
    manifest: &ModManifest,
) -> anyhow::Result<()> {
    let class = script
        .attribute(operation, "Class")
        .ok_or(PatchError::MissingClass)?;
    let kind: PatchOpKind = class.parse()?;

    let expression =
        child_text(script, operation, "xpath").ok_or(PatchError::MissingQuery { kind })?;
    let query: PathQuery = expression.parse().map_err(PatchError::Query)?;

    log::debug!("applying {} at {}", kind, query);

    let matches = query.evaluate(target);
    if matches.is_empty() {
        log::info!("{} at {} matched nothing; not performed", kind, query);
        return Ok(());
    }

    if let Some(enable) = child_text(script, operation, "enable") {
        let flag = manifest.substitute(enable);
        if !parse_flag(&flag)? {
            log::debug!("{} at {} is switched off by its enable flag", kind, query);
            return Ok(());
        }
    }
    if let Some(disable) = child_text(script, operation, "disable") {
        let flag = manifest.substitute(disable);
        if parse_flag(&flag)? {
            log::debug!("{} at {} is switched off by its disable flag", kind, query);
            return Ok(());
        }
    }

    match kind {
        PatchOpKind::AttributeSet => {
            let attribute = required_attribute_field(script, operation, kind)?;
            let value = required_value_text(script, operation, kind, manifest)?;
            for &element in &matches {
                target.set_attribute(element, attribute, &value);
            }
        }

        PatchOpKind::AttributeAdd => {
            let attribute = required_attribute_field(script, operation, kind)?;
            let value = required_value_text(script, operation, kind, manifest)?;
            for &element in &matches {
                if target.attribute(element, attribute).is_some() {
                    return Err(PatchError::AttributeExists {
                        name: attribute.to_owned(),
                        query: query.expression().to_owned(),
                    }
                    .into());
                }
            }
            for &element in &matches {
                target.set_attribute(element, attribute, &value);
            }
        }

        PatchOpKind::AttributeRemove => {
            let attribute = required_attribute_field(script, operation, kind)?;
            for &element in &matches {
                if target.attribute(element, attribute).is_none() {
                    return Err(PatchError::AttributeAbsent {
                        name: attribute.to_owned(),
                        query: query.expression().to_owned(),
                    }
                    .into());
                }
            }
            for &element in &matches {
                target.remove_attribute(element, attribute);
            }
        }

        PatchOpKind::AttributeMath => {
            let attribute = required_attribute_field(script, operation, kind)?;
            let value_element = child_element(script, operation, "value")
                .ok_or(PatchError::MissingValueField { kind })?;

            let operation_name = script
                .attribute(value_element, "opType")
                .unwrap_or_default();
            let math: MathOp = operation_name.parse()?;

            let operand_text = script
                .text(value_element)
                .map(|text| manifest.substitute(text))
                .ok_or(PatchError::MissingValueField { kind })?;
            let operand: f64 =
                operand_text
                    .trim()
                    .parse()
                    .map_err(|_| PatchError::NotNumeric {
                        value: operand_text.clone(),
                    })?;

            for &element in &matches {
                let current = target
                    .attribute(element, attribute)
                    .ok_or_else(|| PatchError::AttributeAbsent {
                        name: attribute.to_owned(),
                        query: query.expression().to_owned(),
                    })?
                    .to_owned();

                // A decimal point in the stored value decides whether the
                // result is written back as a float or an integer.
                let stores_float = current.contains('.');
                let base: f64 = current
                    .trim()
                    .parse()
                    .map_err(|_| PatchError::NotNumeric {
                        value: current.clone(),
                    })?;

                let result = math.apply(base, operand);
                if !result.is_finite() {
                    return Err(PatchError::NotFinite {
                        attribute: attribute.to_owned(),
                    }
                    .into());
                }

                let formatted = if stores_float {
                    format!("{:.1}", result)
                } else {
                    (result as i64).to_string()
                };
                target.set_attribute(element, attribute, &formatted);
            }
        }

        PatchOpKind::NodeAddLast => {
            let additions = value_nodes(script, operation, kind)?;
            for &element in &matches {
                for addition in &additions {
                    target.append_template(element, addition);
                }
            }
        }

        PatchOpKind::NodeAddFirst => {
            let additions = value_nodes(script, operation, kind)?;
            for &element in &matches {
                for (offset, addition) in additions.iter().enumerate() {
                    target.insert_template(element, offset, addition);
                }
            }
        }

        PatchOpKind::NodeInsertAfter | PatchOpKind::NodeInsertBefore => {
            let additions = value_nodes(script, operation, kind)?;
            for &element in &matches {
                let parent = target.parent(element).ok_or(PatchError::NoParent)?;
                let position = target.position(element).unwrap_or(0);
                let base = if kind == PatchOpKind::NodeInsertAfter {
                    position + 1
                } else {
                    position
                };
                for (offset, addition) in additions.iter().enumerate() {
                    target.insert_template(parent, base + offset, addition);
                }
            }
        }

        PatchOpKind::NodeRemove => {
            for &element in &matches {
                if target.parent(element).is_none() {
                    return Err(PatchError::NoParent.into());
                }
                target.detach(element);
            }
        }

        PatchOpKind::NodeReplace => {
            let value_element = child_element(script, operation, "value")
                .ok_or(PatchError::MissingValueField { kind })?;
            let replacement = script
                .children(value_element)
                .first()
                .map(|&child| script.snapshot(child))
                .ok_or(PatchError::EmptyReplacement)?;

            for &element in &matches {
                let parent = target.parent(element).ok_or(PatchError::NoParent)?;
                let position = target.position(element).unwrap_or(0);
                target.insert_template(parent, position, &replacement);
                target.detach(element);
            }
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum MathOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl MathOp {
    fn apply(self, base: f64, operand: f64) -> f64 {
        match self {
            MathOp::Add => base + operand,
            MathOp::Subtract => base - operand,
            MathOp::Multiply => base * operand,
            MathOp::Divide => base / operand,
        }
    }
}

impl FromStr for MathOp {
    type Err = PatchError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source {
            "add" => Ok(MathOp::Add),
            "subtract" => Ok(MathOp::Subtract),
            "multiply" => Ok(MathOp::Multiply),
            "divide" => Ok(MathOp::Divide),
            other => Err(PatchError::UnknownMathOp(other.to_owned())),
        }
    }
}

/// Reads a gate flag. Truthy and falsy spellings are accepted in any
/// case; anything else is an error rather than a silent guess.
fn parse_flag(value: &str) -> Result<bool, PatchError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "y" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "n" | "false" | "no" | "off" => Ok(false),
        _ => Err(PatchError::BadFlag {
            value: value.to_owned(),
        }),
    }
}

fn child_element(tree: &DocumentTree, parent: NodeId, tag: &str) -> Option<NodeId> {
    tree.child_elements(parent)
        .find(|&child| tree.tag(child) == Some(tag))
}

fn child_text<'a>(tree: &'a DocumentTree, parent: NodeId, tag: &str) -> Option<&'a str> {
    child_element(tree, parent, tag).and_then(|child| tree.text(child))
}

fn required_attribute_field<'a>(
    script: &'a DocumentTree,
    operation: NodeId,
    kind: PatchOpKind,
) -> Result<&'a str, PatchError> {
    child_text(script, operation, "attribute").ok_or(PatchError::MissingAttributeField { kind })
}

fn required_value_text(
    script: &DocumentTree,
    operation: NodeId,
    kind: PatchOpKind,
    manifest: &ModManifest,
) -> Result<String, PatchError> {
    let element =
        child_element(script, operation, "value").ok_or(PatchError::MissingValueField { kind })?;
    let text = script
        .text(element)
        .ok_or(PatchError::MissingValueField { kind })?;
    Ok(manifest.substitute(text))
}

fn value_nodes(
    script: &DocumentTree,
    operation: NodeId,
    kind: PatchOpKind,
) -> Result<Vec<NodeTemplate>, PatchError> {
    let element =
        child_element(script, operation, "value").ok_or(PatchError::MissingValueField { kind })?;
    Ok(script
        .children(element)
        .iter()
        .map(|&child| script.snapshot(child))
        .collect())
}
