use std::path::PathBuf;

use anyhow::bail;
use clap::{CommandFactory, Parser};
use memofs::Vfs;

use crate::manifest::{LoadOrder, ModManifest};
use crate::pipeline;
use crate::texture::PngCodec;

use super::resolve_path;

/// Merges, patches, and repacks a set of mods into the game's data
/// directory.
#[derive(Debug, Parser)]
pub struct ApplyCommand {
    /// Path to the game's data directory (the folder containing library/).
    pub core: PathBuf,

    /// Paths of the mod directories to apply, in load order.
    pub mods: Vec<PathBuf>,

    /// JSON file holding the mod load order, as { "mods": [...] }.
    /// Alternative to listing mod directories on the command line.
    #[clap(long, conflicts_with = "mods")]
    pub load_order: Option<PathBuf>,
}

impl ApplyCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let core_path = resolve_path(&self.core);

        log::trace!("Constructing in-memory filesystem");
        let vfs = Vfs::new_default()?;
        vfs.set_watch_enabled(false);

        let mod_paths = match &self.load_order {
            Some(order) => LoadOrder::load(&vfs, &resolve_path(order))?.mods,
            None => self.mods.clone(),
        };

        if mod_paths.is_empty() {
            ApplyCommand::command()
                .error(
                    clap::ErrorKind::MissingRequiredArgument,
                    "either list mod directories or pass --load-order <FILE>",
                )
                .exit();
        }

        let mut mods = Vec::with_capacity(mod_paths.len());
        for path in &mod_paths {
            let path = resolve_path(path);
            mods.push(ModManifest::load(&vfs, &path)?);
        }

        let codec = PngCodec;
        let report = pipeline::apply_mods(&vfs, &codec, &core_path, &mods)?;

        println!("Applied {} mods to {}", mods.len(), core_path.display());
        if !report.extra_assets.is_empty() {
            println!("Staged {} new assets", report.extra_assets.len());
        }

        if !report.failed_mods.is_empty() {
            bail!("patches failed for: {}", report.failed_mods.join(", "));
        }

        Ok(())
    }
}
