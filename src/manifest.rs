//! Mod descriptors and activation order.
//!
//! Each mod directory may carry an `info.xml` describing the mod:
//!
//! ```xml
//! <mod>
//!   <name>More Hull Types</name>
//!   <modid>123456</modid>
//!   <variables>
//!     <variable name="$COST" value="250"/>
//!   </variables>
//! </mod>
//! ```
//!
//! Everything is optional. The name defaults to the directory name, the
//! numeric id (used as the atlas page id for generated textures) defaults
//! to absent, and the variable list to empty. Activation order comes from
//! the caller, either directly or via a JSON load-order file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use memofs::{IoResultExt, Vfs};
use serde::{Deserialize, Serialize};

use crate::dom::{self, DocumentTree};

/// One mod, as the pipeline sees it: where it lives and what its
/// descriptor declares.
#[derive(Debug, Clone)]
pub struct ModManifest {
    pub name: String,
    pub path: PathBuf,
    /// Numeric content prefix from `<modid>`. Kept as declared; validation
    /// (positive, present) happens where a page id is actually needed.
    pub prefix: Option<u32>,
    pub variables: Vec<Variable>,
}

/// A `{name, value}` substitution pair for patch scripts. Names are
/// replaced textually wherever they occur, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub value: String,
}

impl ModManifest {
    /// Loads the descriptor for the mod at `path`. A missing or broken
    /// `info.xml` is not an error; the mod just gets defaults.
    pub fn load(vfs: &Vfs, path: &Path) -> anyhow::Result<ModManifest> {
        let fallback_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut manifest = ModManifest {
            name: fallback_name,
            path: path.to_path_buf(),
            prefix: None,
            variables: Vec::new(),
        };

        let info_path = path.join("info.xml");
        let contents = vfs
            .read(&info_path)
            .with_not_found()
            .with_context(|| format!("could not read {}", info_path.display()))?;

        let contents = match contents {
            Some(contents) => contents,
            None => {
                log::debug!("mod {} has no info.xml, using defaults", manifest.name);
                return Ok(manifest);
            }
        };

        let (tree, problem) = dom::parse_recovering(&contents);
        if let Some(problem) = problem {
            log::warn!("{} is malformed: {}", info_path.display(), problem);
        }

        if let Some(tree) = tree {
            manifest.apply_descriptor(&tree);
        }

        Ok(manifest)
    }

    fn apply_descriptor(&mut self, tree: &DocumentTree) {
        let root = tree.root();

        for child in tree.child_elements(root) {
            match tree.tag(child) {
                Some("name") => {
                    if let Some(text) = tree.text(child) {
                        let text = text.trim();
                        if !text.is_empty() {
                            self.name = text.to_owned();
                        }
                    }
                }
                Some("modid") => {
                    let text = tree.text(child).unwrap_or("").trim();
                    match text.parse::<u32>() {
                        Ok(id) => self.prefix = Some(id),
                        Err(_) => {
                            log::warn!("mod {} has a non-numeric <modid> {:?}", self.name, text);
                        }
                    }
                }
                Some("variables") => {
                    for entry in tree.child_elements(child) {
                        let name = tree.attribute(entry, "name");
                        let value = tree.attribute(entry, "value");
                        match (name, value) {
                            (Some(name), Some(value)) => self.variables.push(Variable {
                                name: name.to_owned(),
                                value: value.to_owned(),
                            }),
                            _ => log::warn!(
                                "mod {} has a variable entry without name and value",
                                self.name
                            ),
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Substitutes every declared variable into `input`, in declaration
    /// order.
    pub fn substitute(&self, input: &str) -> String {
        let mut output = input.to_owned();
        for variable in &self.variables {
            output = output.replace(&variable.name, &variable.value);
        }
        output
    }
}

/// Mod activation order, read from a JSON file:
///
/// ```json
/// { "mods": ["mods/base-fixes", "mods/more-hulls"] }
/// ```
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOrder {
    pub mods: Vec<PathBuf>,
}

impl LoadOrder {
    pub fn load(vfs: &Vfs, path: &Path) -> anyhow::Result<LoadOrder> {
        let contents = vfs
            .read(path)
            .with_context(|| format!("could not read load order {}", path.display()))?;

        let order: LoadOrder = serde_json::from_slice(&contents)
            .with_context(|| format!("could not parse load order {}", path.display()))?;

        Ok(order)
    }
}
