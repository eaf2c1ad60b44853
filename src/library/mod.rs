//! Loading and holding the document sets the pipeline works on: the
//! baseline library that ships with the game, and the per-mod overlay sets
//! found under a mod's `library/` and `patches/` directories.

pub mod registry;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use memofs::{IoResultExt, Vfs};

use crate::dom::{self, DocumentTree};

/// Joins a slash-separated document name like `library/haven` onto a base
/// directory.
pub fn document_path(base: &Path, name: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for part in name.split('/') {
        path.push(part);
    }
    path
}

/// The game's core document set, loaded once per run and mutated in place
/// by merging and patching.
#[derive(Debug)]
pub struct Baseline {
    documents: HashMap<String, DocumentTree>,
}

impl Baseline {
    /// Reads every baseline document from `core_path`. All of them are
    /// required: a missing or completely unparseable document is fatal,
    /// while a document with a malformed tail loads partially with a
    /// warning.
    pub fn load(vfs: &Vfs, core_path: &Path) -> anyhow::Result<Baseline> {
        let mut documents = HashMap::new();

        for &name in registry::DOCUMENTS {
            let path = document_path(core_path, name);
            let contents = vfs
                .read(&path)
                .with_context(|| format!("could not read baseline document {}", name))?;

            let (tree, problem) = dom::parse_recovering(&contents);
            match tree {
                Some(tree) => {
                    if let Some(problem) = problem {
                        log::warn!("baseline document {} parsed partially: {}", name, problem);
                    }
                    documents.insert(name.to_owned(), tree);
                }
                None => {
                    let reason = problem
                        .map(|problem| problem.to_string())
                        .unwrap_or_else(|| "no root element".to_owned());
                    bail!("baseline document {} could not be parsed: {}", name, reason);
                }
            }
        }

        Ok(Baseline { documents })
    }

    /// Builds a baseline directly from trees. Tests use this to avoid
    /// serializing fixtures to bytes first.
    pub fn from_documents<I>(documents: I) -> Baseline
    where
        I: IntoIterator<Item = (String, DocumentTree)>,
    {
        Baseline {
            documents: documents.into_iter().collect(),
        }
    }

    pub fn document(&self, name: &str) -> Option<&DocumentTree> {
        self.documents.get(name)
    }

    pub fn document_mut(&mut self, name: &str) -> Option<&mut DocumentTree> {
        self.documents.get_mut(name)
    }

    /// The document, or a fatal error naming it. Most pipeline stages need
    /// the document to exist and have no recovery if it does not.
    pub fn expect_document(&self, name: &str) -> anyhow::Result<&DocumentTree> {
        self.documents
            .get(name)
            .with_context(|| format!("baseline document {} is missing", name))
    }

    pub fn expect_document_mut(&mut self, name: &str) -> anyhow::Result<&mut DocumentTree> {
        self.documents
            .get_mut(name)
            .with_context(|| format!("baseline document {} is missing", name))
    }

    /// Serializes every document back under `core_path`, replacing the
    /// originals.
    pub fn write_back(&self, vfs: &Vfs, core_path: &Path) -> anyhow::Result<()> {
        for &name in registry::DOCUMENTS {
            let tree = self.expect_document(name)?;
            let bytes = dom::serialize(tree)
                .with_context(|| format!("could not serialize document {}", name))?;

            let path = document_path(core_path, name);
            vfs.write(&path, bytes)
                .with_context(|| format!("could not write document {}", name))?;
        }

        Ok(())
    }
}

/// The parsed contents of one mod's `library/` or `patches/` directory,
/// grouped by the baseline document each file targets.
///
/// A mod may split one logical document across several physical files for
/// readability; files are matched to documents by name prefix, so
/// `haven_weapons.xml` and `haven_armor.xml` both target `library/haven`.
/// Groups keep the baseline document order and files within a group are
/// sorted by name, so a load is deterministic regardless of directory
/// enumeration order.
#[derive(Debug, Default)]
pub struct OverlaySet {
    groups: Vec<(String, Vec<DocumentTree>)>,
}

impl OverlaySet {
    /// Scans `mod_path/<location>` and parses every file that matches a
    /// baseline document name. Unparseable files are skipped with a
    /// warning; a missing location directory yields an empty set.
    pub fn load(vfs: &Vfs, mod_path: &Path, location: &str) -> anyhow::Result<OverlaySet> {
        let dir = mod_path.join(location);

        let mut names: Vec<String> = Vec::new();
        if let Some(entries) = vfs.read_dir(&dir).with_not_found().with_context(|| {
            format!("could not list mod directory {}", dir.display())
        })? {
            for entry in entries {
                let entry = entry
                    .with_context(|| format!("could not list mod directory {}", dir.display()))?;
                let path = entry.path();

                let metadata = vfs
                    .metadata(path)
                    .with_context(|| format!("could not stat {}", path.display()))?;
                if !metadata.is_file() {
                    continue;
                }

                if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();

        let mut set = OverlaySet::default();
        for &target in registry::DOCUMENTS {
            let prefix = target
                .strip_prefix("library/")
                .expect("baseline document names start with library/");

            for name in names.iter().filter(|name| name.starts_with(prefix)) {
                let path = dir.join(name);
                let contents = vfs
                    .read(&path)
                    .with_context(|| format!("could not read {}", path.display()))?;

                let (tree, problem) = dom::parse_recovering(&contents);
                if let Some(problem) = &problem {
                    log::warn!("{}/{} parsed partially: {}", location, name, problem);
                }

                match tree {
                    Some(tree) => {
                        log::debug!("{} <= {}/{}", target, location, name);
                        set.ensure_document(target).push(tree);
                    }
                    None => {
                        log::warn!("skipping unparseable file {}/{}", location, name);
                    }
                }
            }
        }

        Ok(set)
    }

    /// Whether the set defines `document` at all.
    pub fn contains(&self, document: &str) -> bool {
        self.groups.iter().any(|(name, _)| name == document)
    }

    /// The files targeting `document`, in deterministic load order.
    pub fn get(&self, document: &str) -> &[DocumentTree] {
        self.groups
            .iter()
            .find(|(name, _)| name == document)
            .map(|(_, trees)| trees.as_slice())
            .unwrap_or(&[])
    }

    pub fn get_mut(&mut self, document: &str) -> Option<&mut Vec<DocumentTree>> {
        self.groups
            .iter_mut()
            .find(|(name, _)| name == document)
            .map(|(_, trees)| trees)
    }

    /// The group for `document`, created empty if absent. The texture
    /// detector uses this to synthesize a textures document for mods that
    /// only ship animations.
    pub fn ensure_document(&mut self, document: &str) -> &mut Vec<DocumentTree> {
        let index = match self.groups.iter().position(|(name, _)| name == document) {
            Some(index) => index,
            None => {
                self.groups.push((document.to_owned(), Vec::new()));
                self.groups.len() - 1
            }
        };

        &mut self.groups[index].1
    }

    /// Iterates groups in the order they were established.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[DocumentTree])> {
        self.groups
            .iter()
            .map(|(name, trees)| (name.as_str(), trees.as_slice()))
    }
}
