//! The end-to-end mod application pipeline.
//!
//! A run loads the baseline library, merges every mod's overlay
//! documents in load order, re-sorts the audio references, applies every
//! mod's patch scripts (again in load order, after all merges, so
//! patches can target content any mod introduced), writes the merged
//! documents back, and finally stages audio files and composites atlas
//! pages for the textures the mods brought along.

use std::path::Path;

use anyhow::Context;
use memofs::Vfs;

use crate::audio;
use crate::library::{Baseline, OverlaySet};
use crate::manifest::ModManifest;
use crate::merge;
use crate::patch;
use crate::texture::{self, AllocationSession, AtlasCodec};

/// What a pipeline run produced beyond the rewritten library documents.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Relative paths of files created or replaced outside the merged
    /// documents: staged audio files and generated atlas pages.
    pub extra_assets: Vec<String>,

    /// Names of mods whose patch scripts failed. Their merged content is
    /// kept, but their remaining patches were abandoned.
    pub failed_mods: Vec<String>,
}

/// Applies every mod to the game library at `core_path`, in the given
/// load order.
///
/// Merge problems are fatal to the whole run. A failing patch script
/// fails only its own mod; the other mods' patches still apply and the
/// run completes, reporting the failure in the returned report.
pub fn apply_mods(
    vfs: &Vfs,
    codec: &dyn AtlasCodec,
    core_path: &Path,
    mods: &[ModManifest],
) -> anyhow::Result<ApplyReport> {
    let mut baseline = Baseline::load(vfs, core_path)?;
    let mut session = AllocationSession::from_baseline(&baseline)?;

    for manifest in mods {
        log::info!("merging {}", manifest.name);
        let mut overlay = OverlaySet::load(vfs, &manifest.path, "library")
            .with_context(|| format!("could not load {}'s overlay documents", manifest.name))?;
        merge::merge_overlay(&mut baseline, &mut overlay, &mut session, manifest, vfs, codec)
            .with_context(|| format!("could not merge {}", manifest.name))?;
    }

    audio::sort_references(&mut baseline)?;

    let mut failed_mods = Vec::new();
    for manifest in mods {
        let patches = OverlaySet::load(vfs, &manifest.path, "patches")
            .with_context(|| format!("could not load {}'s patch scripts", manifest.name))?;
        if patches.iter().next().is_none() {
            log::debug!("{} has no patches", manifest.name);
            continue;
        }

        log::info!("patching {}", manifest.name);
        if let Err(problem) = patch::apply_patches(&mut baseline, &patches, manifest) {
            log::error!("{}'s patches were abandoned: {:#}", manifest.name, problem);
            failed_mods.push(manifest.name.clone());
        }
    }

    baseline.write_back(vfs, core_path)?;

    let mut extra_assets = audio::stage_assets(&baseline, mods, vfs, core_path)?;
    extra_assets.extend(texture::composite_pages(&session, &baseline, core_path, codec)?);

    Ok(ApplyReport {
        extra_assets,
        failed_mods,
    })
}
