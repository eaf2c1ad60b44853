//! Audio reference grooming and asset staging.
//!
//! The audio document lists every playable asset as an `<a>` element
//! carrying a numeric `id`, a display name `n`, a type `at` (`Sound` or
//! `Music`) and a relative path under an `ogg` or `mp3` attribute. The
//! game expects the list sorted by type and id, so after merging we
//! restore that order. Staging then copies each modded file named by a
//! reference into the game library's `library/<type>/<encoding>/`
//! folder, resolving duplicates by mod load order.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use memofs::{IoResultExt, Vfs};

use crate::dom::query::PathQuery;
use crate::library::{registry, Baseline};
use crate::manifest::ModManifest;

/// Encodings a reference may declare, in the order they are checked.
const ENCODINGS: &[&str] = &["ogg", "mp3"];

/// Re-sorts the audio document's references the way the game expects:
/// `Sound` entries before `Music` entries, ascending by numeric id
/// within each group. Comments and malformed entries keep their
/// relative order at the end of the list.
pub fn sort_references(baseline: &mut Baseline) -> anyhow::Result<()> {
    let document = baseline.expect_document_mut(registry::AUDIO)?;
    let root = document.root();

    let mut order = document.children(root).to_vec();
    order.sort_by_key(|&child| {
        let kind = document
            .attribute(child, "at")
            .and_then(|value| value.bytes().next())
            .unwrap_or(0);
        let id = document
            .attribute(child, "id")
            .and_then(|value| value.trim().parse::<i64>().ok())
            .unwrap_or(0);
        (Reverse(kind), id)
    });

    let count = order.len();
    document.reorder_children(root, order);
    log::debug!("sorted {} audio references", count);

    Ok(())
}

/// Copies every modded audio file named by a reference into the game
/// library, returning the relative paths of the staged files.
///
/// References that cannot be resolved are reported and skipped; the
/// game simply keeps whatever it already ships for them.
pub fn stage_assets(
    baseline: &Baseline,
    mods: &[ModManifest],
    vfs: &Vfs,
    core_path: &Path,
) -> anyhow::Result<Vec<String>> {
    let document = baseline.expect_document(registry::AUDIO)?;
    let shipped = shipped_asset_paths(vfs, core_path)?;

    let references: PathQuery = "//a[@n and @at]"
        .parse()
        .expect("the audio reference query is valid");

    let mut staged = Vec::new();
    for element in references.evaluate(document) {
        let (name, kind) = match (
            document.attribute(element, "n"),
            document.attribute(element, "at"),
        ) {
            (Some(name), Some(kind)) => (name, kind),
            _ => continue,
        };

        let folder = match kind {
            "Sound" => "sound",
            "Music" => "music",
            other => {
                log::error!(
                    "audio reference {} has type {:?}; expected Sound or Music",
                    name,
                    other
                );
                continue;
            }
        };

        let (encoding, declared) = match ENCODINGS
            .iter()
            .find_map(|&ext| document.attribute(element, ext).map(|path| (ext, path)))
        {
            Some(found) => found,
            None => {
                log::error!(
                    "audio reference {} declares neither an ogg nor an mp3 path",
                    name
                );
                continue;
            }
        };
        if !declared.to_ascii_lowercase().ends_with(encoding) {
            log::error!(
                "audio reference {} declares a {} path but points at {}",
                name,
                encoding,
                declared
            );
        }

        let filename = declared.rsplit('/').next().unwrap_or(declared);

        let mut candidates = Vec::new();
        for manifest in mods {
            let path = manifest.path.join("audio").join(filename);
            let provides = vfs
                .metadata(&path)
                .with_not_found()?
                .map(|meta| meta.is_file())
                .unwrap_or(false);
            if provides {
                candidates.push((manifest.name.as_str(), path));
            }
        }

        if candidates.is_empty() {
            if shipped.contains(declared) {
                continue;
            }
            log::error!(
                "audio reference {} points at {}, which no mod provides and the game does not ship",
                name,
                declared
            );
            continue;
        }

        if candidates.len() > 1 {
            let mut names: Vec<&str> = candidates.iter().map(|(name, _)| *name).collect();
            names.sort_unstable();
            names.dedup();
            log::error!(
                "{} is provided by more than one mod ({}); copying just the first one",
                filename,
                names.join(", ")
            );
        }

        let (_, source) = &candidates[0];
        let contents = vfs
            .read(source)
            .with_context(|| format!("could not read {}", source.display()))?;

        let destination = core_path
            .join("library")
            .join(folder)
            .join(encoding)
            .join(filename);
        log::info!("copying {} into the game library", declared);
        vfs.write(&destination, contents.as_slice())
            .with_context(|| format!("could not write {}", destination.display()))?;

        staged.push(declared.to_owned());
    }

    Ok(staged)
}

/// Collects the relative paths of every audio file the base game ships,
/// so references to stock assets are not mistaken for broken ones.
fn shipped_asset_paths(vfs: &Vfs, core_path: &Path) -> anyhow::Result<HashSet<String>> {
    let mut found = HashSet::new();
    for folder in ["sound", "music"] {
        let root = core_path.join("library").join(folder);
        collect_files(vfs, core_path, &root, &mut found)?;
    }
    Ok(found)
}

fn collect_files(
    vfs: &Vfs,
    base: &Path,
    dir: &Path,
    found: &mut HashSet<String>,
) -> anyhow::Result<()> {
    let entries = match vfs.read_dir(dir).with_not_found()? {
        Some(entries) => entries,
        None => return Ok(()),
    };

    for entry in entries {
        let entry = entry.with_context(|| format!("could not list {}", dir.display()))?;
        let path = entry.path();
        if vfs.metadata(path)?.is_dir() {
            collect_files(vfs, base, path, found)?;
        } else if let Ok(relative) = path.strip_prefix(base) {
            found.insert(slash_join(relative));
        }
    }

    Ok(())
}

/// Formats a path with forward slashes, the way the documents spell
/// their relative asset paths.
fn slash_join(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}
