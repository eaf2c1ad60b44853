//! Identity-key merging of overlay documents into the baseline.
//!
//! Every mergeable section is listed in the [`registry`](crate::library::registry)
//! with the attribute that identifies its entries. Merging an overlay
//! section into the baseline evicts every baseline entry whose identity
//! matches an incoming entry, then appends the incoming entry at the end.
//! Applied in mod order this gives last-writer-wins semantics for any
//! colliding identity, including against the baseline itself.

use anyhow::Context;
use memofs::Vfs;

use crate::dom::query::PathQuery;
use crate::dom::{DocumentTree, NodeId};
use crate::library::{registry, Baseline, OverlaySet};
use crate::manifest::ModManifest;
use crate::texture::{self, AllocationSession, AtlasCodec};

/// Merges one mod's overlay set into the baseline, running texture
/// detection at the point where animation references can still be
/// remapped: after the text and audio sections, before animations and
/// textures.
pub fn merge_overlay(
    baseline: &mut Baseline,
    overlay: &mut OverlaySet,
    session: &mut AllocationSession,
    manifest: &ModManifest,
    vfs: &Vfs,
    codec: &dyn AtlasCodec,
) -> anyhow::Result<()> {
    let mod_name = manifest.name.clone();

    merge_document(baseline, overlay, registry::HAVEN)
        .with_context(|| format!("merging mod {}", mod_name))?;
    merge_document(baseline, overlay, registry::TEXTS)
        .with_context(|| format!("merging mod {}", mod_name))?;
    merge_document(baseline, overlay, registry::AUDIO)
        .with_context(|| format!("merging mod {}", mod_name))?;

    let detected = texture::detect_overlay_textures(session, overlay, manifest, vfs, codec)
        .with_context(|| format!("detecting textures of mod {}", mod_name))?;
    session.absorb(detected);

    merge_document(baseline, overlay, registry::ANIMATIONS)
        .with_context(|| format!("merging mod {}", mod_name))?;
    merge_document(baseline, overlay, registry::TEXTURES)
        .with_context(|| format!("merging mod {}", mod_name))?;

    Ok(())
}

/// Merges every registered section of `document` from the overlay into the
/// baseline. A document the overlay does not define at all is a logged
/// no-op.
pub fn merge_document(
    baseline: &mut Baseline,
    overlay: &OverlaySet,
    document: &str,
) -> anyhow::Result<()> {
    if !overlay.contains(document) {
        log::debug!("no merges needed: {}", document);
        return Ok(());
    }

    let base = baseline.expect_document_mut(document)?;
    for section in registry::sections_for(document) {
        merge_section(base, overlay.get(document), section)?;
    }

    Ok(())
}

/// Merges one section from each overlay file that defines it, in file
/// order.
pub fn merge_section(
    base: &mut DocumentTree,
    sources: &[DocumentTree],
    section: &registry::Section,
) -> anyhow::Result<()> {
    let query: PathQuery = section
        .path
        .parse()
        .expect("registry paths are valid queries");

    let mut resolved_base_root = None;

    for source in sources {
        let source_root = match query.first(source) {
            Some(id) => id,
            None => continue,
        };

        // The baseline section is only required once an overlay actually
        // has content for it.
        let base_root = match resolved_base_root {
            Some(id) => id,
            None => {
                let id = query.first(base).with_context(|| {
                    format!(
                        "baseline document {} has nothing at {}",
                        section.document, section.path
                    )
                })?;
                resolved_base_root = Some(id);
                id
            }
        };

        let mut merged = 0usize;
        for child in source.children(source_root).to_vec() {
            if source.is_comment(child) {
                continue;
            }

            let identity = source
                .attribute(child, section.identity)
                .with_context(|| {
                    format!(
                        "an entry of {} {} is missing its {} identity attribute",
                        section.document, section.path, section.identity
                    )
                })?;

            evict_conflicts(base, base_root, section, identity);

            let template = source.snapshot(child);
            base.append_template(base_root, &template);
            merged += 1;
        }

        if merged > 0 {
            log::info!(
                "{}: merged {} elements into {}",
                section.document,
                merged,
                section.path
            );
        }
    }

    Ok(())
}

fn evict_conflicts(
    base: &mut DocumentTree,
    base_root: NodeId,
    section: &registry::Section,
    identity: &str,
) {
    let conflicts: Vec<NodeId> = base
        .child_elements(base_root)
        .filter(|&entry| base.attribute(entry, section.identity) == Some(identity))
        .collect();

    if conflicts.len() > 1 {
        log::warn!(
            "{} {} held {} entries with {}={:?}; replacing all of them",
            section.document,
            section.path,
            conflicts.len(),
            section.identity,
            identity
        );
    }

    for conflict in conflicts {
        base.detach(conflict);
    }
}
