//! Texture region bookkeeping and sprite sheet patching.
//!
//! Mods bring textures in two shapes. A declaration whose name has a
//! numeric stem no higher than the base game's last region id replaces
//! that region's pixels in place. Everything else is a new texture and
//! receives the next free region id, counting up from where the base game
//! stopped. Animations may skip declarations entirely and reference loose
//! files through `assetPos filename=` markers; those files are measured,
//! packed onto a generated page, and declared on the mod's behalf.
//!
//! Detection happens while a mod is merged so the rewritten region ids
//! flow into the merged documents. Pixel work is deferred: the
//! [`AllocationSession`] remembers which regions changed, and
//! [`composite_pages`] patches the affected sprite sheets once every mod
//! is in.

use std::cmp::Reverse;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use memofs::{IoResultExt, Vfs};

use crate::dom::query::PathQuery;
use crate::dom::{self, DocumentTree, ElementTemplate, NodeId, NodeTemplate};
use crate::library::{document_path, registry, Baseline, OverlaySet};
use crate::manifest::ModManifest;

mod codec;
mod packer;

pub use codec::{AtlasCodec, AtlasPage, PngCodec};
pub use packer::PagePacker;

/// Side length of the page generated for a mod's loose textures.
const GENERATED_PAGE_SIZE: u32 = 2048;

/// Page id used when a mod wants a generated page but its info.xml did
/// not declare a usable modid.
const FALLBACK_PAGE_ID: &str = "9999";

/// Region id allocation state shared by every mod in one run.
#[derive(Debug)]
pub struct AllocationSession {
    last_core_region_id: u64,
    next_region_id: u64,
    modded: HashMap<String, ModdedTexture>,
    custom_pages: HashMap<String, PageSpec>,
}

/// A texture some mod supplied, keyed in the session by the core region
/// id it ends up under.
#[derive(Debug, Clone, PartialEq)]
pub struct ModdedTexture {
    /// The name the mod declared, before any id rewriting.
    pub mapped_from: String,
    /// File name inside the mod's textures directory.
    pub filename: String,
    /// Full path to the source image.
    pub path: PathBuf,
}

/// Dimensions a mod declared for a page it invented. Kept as written so
/// bad values only surface when the page is actually composited.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSpec {
    pub width: Option<String>,
    pub height: Option<String>,
}

impl PageSpec {
    fn dims(&self) -> Option<(u32, u32)> {
        let width = self.width.as_deref()?.parse().ok()?;
        let height = self.height.as_deref()?.parse().ok()?;
        Some((width, height))
    }
}

impl AllocationSession {
    /// Reads the base game's region table and starts numbering after its
    /// highest numeric region id.
    pub fn from_baseline(baseline: &Baseline) -> anyhow::Result<AllocationSession> {
        let textures = baseline.expect_document(registry::TEXTURES)?;
        let declarations: PathQuery = "//re[@n]".parse().expect("region queries are valid");

        let mut last = 0;
        for region in declarations.evaluate(textures) {
            if let Some(id) = textures
                .attribute(region, "n")
                .and_then(|n| n.parse::<u64>().ok())
            {
                last = last.max(id);
            }
        }

        log::debug!("the base game claims texture regions up to {}", last);

        Ok(AllocationSession {
            last_core_region_id: last,
            next_region_id: last + 1,
            modded: HashMap::new(),
            custom_pages: HashMap::new(),
        })
    }

    pub fn last_core_region_id(&self) -> u64 {
        self.last_core_region_id
    }

    /// Folds one mod's detected textures into the session. A region
    /// already claimed by an earlier mod is replaced, so the last loaded
    /// mod wins.
    pub fn absorb(&mut self, detected: HashMap<String, ModdedTexture>) {
        self.modded.extend(detected);
    }

    pub fn modded_texture(&self, region: &str) -> Option<&ModdedTexture> {
        self.modded.get(region)
    }

    pub fn modded_region_count(&self) -> usize {
        self.modded.len()
    }

    pub fn custom_page(&self, page: &str) -> Option<&PageSpec> {
        self.custom_pages.get(page)
    }

    fn declare_custom_page(&mut self, page: String, spec: PageSpec) {
        self.custom_pages.insert(page, spec);
    }

    fn allocate_region_id(&mut self) -> u64 {
        let id = self.next_region_id;
        self.next_region_id += 1;
        id
    }
}

/// Tracks the regions one mod touches while its declarations are walked.
struct RegionDetector<'a> {
    vfs: &'a Vfs,
    source_dir: PathBuf,
    /// Files already handled, whichever declaration reached them first.
    seen: HashSet<String>,
    /// File name to freshly allocated region id.
    mapping: HashMap<String, String>,
    /// Core region id to the texture that now backs it.
    modded: HashMap<String, ModdedTexture>,
}

impl<'a> RegionDetector<'a> {
    fn add(&mut self, session: &mut AllocationSession, filename: &str) -> anyhow::Result<()> {
        if self.seen.contains(filename) {
            return Ok(());
        }

        let stem = match filename.rsplit_once('.') {
            Some((stem, _)) => stem,
            None => filename,
        };
        let replaces_core_region = !stem.is_empty()
            && stem.bytes().all(|byte| byte.is_ascii_digit())
            && stem
                .parse::<u64>()
                .map_or(false, |id| id <= session.last_core_region_id);

        let path = self.source_dir.join(filename);
        let has_file = self
            .vfs
            .metadata(&path)
            .with_not_found()?
            .map_or(false, |meta| meta.is_file());

        let region = if replaces_core_region {
            if !has_file {
                return Ok(());
            }
            log::debug!("{} replaces base game region {}", filename, stem);
            stem.to_owned()
        } else {
            let id = session.allocate_region_id().to_string();
            log::info!("allocated region {} for {}", id, filename);
            self.mapping.insert(filename.to_owned(), id.clone());
            id
        };

        self.seen.insert(filename.to_owned());
        self.modded.insert(
            region,
            ModdedTexture {
                mapped_from: stem.to_owned(),
                filename: filename.to_owned(),
                path,
            },
        );
        Ok(())
    }

    fn mapped(&self, filename: &str) -> Option<&str> {
        self.mapping.get(filename).map(String::as_str)
    }
}

/// Walks one mod's texture and animation declarations, allocating region
/// ids and rewriting references to them in place. Returns the textures
/// the mod contributes, keyed by core region id.
pub fn detect_overlay_textures(
    session: &mut AllocationSession,
    overlay: &mut OverlaySet,
    manifest: &ModManifest,
    vfs: &Vfs,
    codec: &dyn AtlasCodec,
) -> anyhow::Result<HashMap<String, ModdedTexture>> {
    let source_dir = manifest.path.join("textures");
    let has_sources = vfs
        .metadata(&source_dir)
        .with_not_found()?
        .map_or(false, |meta| meta.is_dir());
    if !has_sources {
        return Ok(HashMap::new());
    }

    let page_declarations: PathQuery = "//t[@i]".parse().expect("page queries are valid");
    let region_declarations: PathQuery = "//re[@n]".parse().expect("region queries are valid");
    let named_assets: PathQuery = "//assetPos[@filename]".parse().expect("asset queries are valid");
    let numbered_assets: PathQuery = "//assetPos[@a and not(@filename)]"
        .parse()
        .expect("asset queries are valid");

    let has_loose_references = overlay
        .get(registry::ANIMATIONS)
        .iter()
        .any(|chunk| named_assets.first(chunk).is_some());

    if !overlay.contains(registry::TEXTURES) {
        if !has_loose_references {
            return Ok(HashMap::new());
        }
        // The animations pull in loose files but the mod never wrote a
        // textures document; declarations are generated into a fresh one.
        overlay
            .ensure_document(registry::TEXTURES)
            .push(synthesized_textures_document());
    }

    let mut detector = RegionDetector {
        vfs,
        source_dir,
        seen: HashSet::new(),
        mapping: HashMap::new(),
        modded: HashMap::new(),
    };

    {
        let chunks = overlay.get(registry::TEXTURES);
        if chunks.len() != 1 {
            log::warn!(
                "{} ships {} library/textures files; only the first is honored",
                manifest.name,
                chunks.len(),
            );
        }
        let doc = match chunks.first() {
            Some(doc) => doc,
            None => return Ok(detector.modded),
        };

        for page in page_declarations.evaluate(doc) {
            let id = match doc.attribute(page, "i") {
                Some(id) => id.to_owned(),
                None => continue,
            };
            session.declare_custom_page(
                id,
                PageSpec {
                    width: doc.attribute(page, "w").map(str::to_owned),
                    height: doc.attribute(page, "h").map(str::to_owned),
                },
            );
        }

        for region in region_declarations.evaluate(doc) {
            if let Some(name) = doc.attribute(region, "n") {
                detector.add(session, name)?;
            }
        }
    }

    if detector.mapping.is_empty() && !has_loose_references {
        return Ok(detector.modded);
    }

    // Files referenced by animations that still need generated region
    // declarations, in the order they were first seen.
    let mut pending_pack: Vec<String> = Vec::new();

    if let Some(chunks) = overlay.get_mut(registry::ANIMATIONS) {
        for chunk in chunks.iter_mut() {
            for asset in named_assets.evaluate(chunk) {
                let filename = match chunk.attribute(asset, "filename") {
                    Some(filename) => normalize_loose_filename(filename),
                    None => continue,
                };
                if !pending_pack.contains(&filename) && !detector.seen.contains(&filename) {
                    detector.add(session, &filename)?;
                    if detector.mapped(&filename).is_some() {
                        pending_pack.push(filename.clone());
                    }
                }
                if let Some(region) = detector.mapped(&filename) {
                    let region = region.to_owned();
                    chunk.set_attribute(asset, "a", &region);
                }
            }

            for asset in numbered_assets.evaluate(chunk) {
                let reference = match chunk.attribute(asset, "a") {
                    Some(reference) => reference.to_owned(),
                    None => continue,
                };
                if reference.is_empty() || !reference.bytes().all(|byte| byte.is_ascii_digit()) {
                    bail!(
                        "an animation in {} has the non-numeric texture reference a={:?}; \
                         loose files belong in the filename attribute",
                        manifest.name,
                        reference,
                    );
                }

                let filename = format!("{}.png", reference);
                detector.add(session, &filename)?;
                if let Some(region) = detector.mapped(&filename) {
                    let region = region.to_owned();
                    chunk.set_attribute(asset, "a", &region);
                }
            }
        }
    }

    if !pending_pack.is_empty() {
        let page_id = match manifest.prefix {
            Some(prefix) if prefix != 0 => prefix.to_string(),
            _ => {
                log::error!(
                    "{} has no usable <modid> in its info.xml; its generated page falls back \
                     to the shared id {} and may collide with other mods",
                    manifest.name,
                    FALLBACK_PAGE_ID,
                );
                FALLBACK_PAGE_ID.to_owned()
            }
        };

        log::info!(
            "packing {} loose textures from {} onto page {}",
            pending_pack.len(),
            manifest.name,
            page_id,
        );

        let mut measured = Vec::with_capacity(pending_pack.len());
        for filename in &pending_pack {
            let source = detector.source_dir.join(filename);
            let (width, height) = codec
                .dimensions(&source)
                .with_context(|| format!("could not measure {}", source.display()))?;
            measured.push((filename.as_str(), width, height));
        }

        // Largest areas first; the sort is stable, so equal sizes keep
        // their declaration order.
        measured.sort_by_key(|&(_, width, height)| Reverse(u64::from(width) * u64::from(height)));

        let mut packer = PagePacker::new(GENERATED_PAGE_SIZE, GENERATED_PAGE_SIZE);
        let mut placements = Vec::with_capacity(measured.len());
        for (filename, width, height) in measured {
            let (x, y) = match packer.insert(width, height) {
                Some(position) => position,
                None => bail!(
                    "the loose textures of {} do not fit one {}x{} page; \
                     move some of them into another mod",
                    manifest.name,
                    GENERATED_PAGE_SIZE,
                    GENERATED_PAGE_SIZE,
                ),
            };
            placements.push((filename, x, y, width, height));
        }

        // Emit declarations in region id order, not packing order.
        placements.sort_by_key(|&(filename, ..)| {
            detector
                .mapped(filename)
                .and_then(|region| region.parse::<u64>().ok())
                .unwrap_or(u64::MAX)
        });

        let doc = primary_textures_doc(overlay, manifest)?;
        let pages_node = match page_parent(doc) {
            Some(node) => node,
            None => bail!(
                "the textures document of {} has no <textures> element to hold its generated page",
                manifest.name,
            ),
        };
        let declaration = NodeTemplate::from(
            ElementTemplate::new("t")
                .with_attribute("i", page_id.as_str())
                .with_attribute("w", GENERATED_PAGE_SIZE.to_string())
                .with_attribute("h", GENERATED_PAGE_SIZE.to_string()),
        );
        doc.append_template(pages_node, &declaration);
        session.declare_custom_page(
            page_id.clone(),
            PageSpec {
                width: Some(GENERATED_PAGE_SIZE.to_string()),
                height: Some(GENERATED_PAGE_SIZE.to_string()),
            },
        );

        let regions_node = match region_parent(doc) {
            Some(node) => node,
            None => bail!(
                "the textures document of {} has no <regions> element to hold its generated regions",
                manifest.name,
            ),
        };
        for (filename, x, y, width, height) in placements {
            let region = match detector.mapped(filename) {
                Some(region) => region,
                None => continue,
            };
            log::debug!("placed {} at {},{} on page {}", filename, x, y, page_id);
            let declaration = NodeTemplate::from(
                ElementTemplate::new("re")
                    .with_attribute("n", region)
                    .with_attribute("t", page_id.as_str())
                    .with_attribute("x", x.to_string())
                    .with_attribute("y", y.to_string())
                    .with_attribute("w", width.to_string())
                    .with_attribute("h", height.to_string())
                    .with_attribute("file", filename),
            );
            doc.append_template(regions_node, &declaration);
        }
    }

    // Point the mod's own region declarations at their allocated ids so
    // the merged table and the animations agree.
    if !detector.mapping.is_empty() {
        let doc = primary_textures_doc(overlay, manifest)?;
        for region in region_declarations.evaluate(doc) {
            let name = match doc.attribute(region, "n") {
                Some(name) => name.to_owned(),
                None => continue,
            };
            if let Some(mapped) = detector.mapped(&name) {
                let mapped = mapped.to_owned();
                log::info!("region declaration {} now points at {}", name, mapped);
                doc.set_attribute(region, "n", &mapped);
            }
        }
    }

    if has_loose_references {
        let doc = primary_textures_doc(overlay, manifest)?;
        let contents =
            dom::serialize(doc).context("could not serialize the generated region table")?;
        let destination = manifest.path.join("library").join("generated_textures.xml");
        vfs.write(&destination, contents)
            .with_context(|| format!("could not write {}", destination.display()))?;
    }

    Ok(detector.modded)
}

/// Patches every sprite sheet that holds a modded region and writes the
/// touched pages back under the game directory. Returns the paths of
/// pages that did not exist before this run, relative to the game
/// directory.
pub fn composite_pages(
    session: &AllocationSession,
    baseline: &Baseline,
    core_path: &Path,
    codec: &dyn AtlasCodec,
) -> anyhow::Result<Vec<String>> {
    let textures = baseline.expect_document(registry::TEXTURES)?;
    let declarations: PathQuery = "//re[@n]".parse().expect("region queries are valid");

    let mut pages: BTreeMap<String, Box<dyn AtlasPage>> = BTreeMap::new();
    let mut extra_assets = Vec::new();

    for region in declarations.evaluate(textures) {
        let name = match textures.attribute(region, "n") {
            Some(name) => name,
            None => continue,
        };
        let texture = match session.modded_texture(name) {
            Some(texture) => texture,
            None => continue,
        };

        let page = match textures.attribute(region, "t") {
            Some(page) => page,
            None => {
                log::warn!(
                    "region {} declares no page; {} stays unpatched",
                    name,
                    texture.filename,
                );
                continue;
            }
        };

        let slot = match pages.entry(page.to_owned()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let path = document_path(core_path, &format!("library/{}.cim", page));
                let loaded = if registry::is_baseline_page(page) {
                    codec
                        .open_page(&path)
                        .with_context(|| format!("could not open page {}", path.display()))?
                } else {
                    let spec = session.custom_page(page).with_context(|| {
                        format!(
                            "page {} is not part of the base game and no mod declared it",
                            page,
                        )
                    })?;
                    let (width, height) = spec.dims().with_context(|| {
                        format!("page {} was declared without usable dimensions", page)
                    })?;
                    extra_assets.push(format!("library/{}.cim", page));
                    codec.create_page(width, height)?
                };
                slot.insert(loaded)
            }
        };

        let x = numeric_region_attribute(textures, region, name, "x")?;
        let y = numeric_region_attribute(textures, region, name, "y")?;
        let width = numeric_region_attribute(textures, region, name, "w")?;
        let height = numeric_region_attribute(textures, region, name, "h")?;

        log::debug!("pasting {} onto page {}", texture.filename, page);
        slot.composite(&texture.path, x, y, width, height)
            .with_context(|| {
                format!(
                    "could not paste {} onto page {}",
                    texture.path.display(),
                    page,
                )
            })?;
    }

    for (page, pixels) in &pages {
        let path = document_path(core_path, &format!("library/{}.cim", page));
        log::info!("writing {}.cim", page);
        pixels
            .export(&path)
            .with_context(|| format!("could not write {}", path.display()))?;
    }

    Ok(extra_assets)
}

fn numeric_region_attribute(
    tree: &DocumentTree,
    id: NodeId,
    region: &str,
    attribute: &str,
) -> anyhow::Result<u32> {
    tree.attribute(id, attribute)
        .with_context(|| format!("region {} is missing its {} attribute", region, attribute))?
        .parse()
        .with_context(|| format!("region {} has a non-numeric {} attribute", region, attribute))
}

fn primary_textures_doc<'a>(
    overlay: &'a mut OverlaySet,
    manifest: &ModManifest,
) -> anyhow::Result<&'a mut DocumentTree> {
    overlay
        .get_mut(registry::TEXTURES)
        .and_then(|chunks| chunks.first_mut())
        .with_context(|| format!("{} has no textures document", manifest.name))
}

fn page_parent(doc: &DocumentTree) -> Option<NodeId> {
    doc.child_elements(doc.root())
        .find(|&child| doc.tag(child) == Some("textures"))
}

fn region_parent(doc: &DocumentTree) -> Option<NodeId> {
    doc.child_elements(doc.root())
        .find(|&child| doc.tag(child) == Some("regions"))
}

fn normalize_loose_filename(filename: &str) -> String {
    let mut filename = filename.trim_start_matches('/').to_owned();
    if !filename.contains(".png") {
        filename.push_str(".png");
    }
    filename
}

fn synthesized_textures_document() -> DocumentTree {
    DocumentTree::from_root(
        ElementTemplate::new("AllTexturesAndRegions")
            .with_child(ElementTemplate::new("textures"))
            .with_child(ElementTemplate::new("regions")),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;

    use maplit::hashmap;
    use memofs::{InMemoryFs, VfsSnapshot};

    #[derive(Default)]
    struct FakeCodec {
        sizes: HashMap<String, (u32, u32)>,
        events: Rc<RefCell<Vec<String>>>,
    }

    impl FakeCodec {
        fn with_sizes(sizes: HashMap<String, (u32, u32)>) -> FakeCodec {
            FakeCodec {
                sizes,
                events: Rc::default(),
            }
        }

        fn log(&self) -> Vec<String> {
            self.events.borrow().clone()
        }
    }

    fn leaf(path: &Path) -> String {
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_owned()
    }

    impl AtlasCodec for FakeCodec {
        fn dimensions(&self, source: &Path) -> anyhow::Result<(u32, u32)> {
            self.sizes
                .get(&leaf(source))
                .copied()
                .with_context(|| format!("no size fixture for {}", source.display()))
        }

        fn open_page(&self, path: &Path) -> anyhow::Result<Box<dyn AtlasPage>> {
            self.events.borrow_mut().push(format!("open {}", leaf(path)));
            Ok(Box::new(FakePage {
                events: Rc::clone(&self.events),
            }))
        }

        fn create_page(&self, width: u32, height: u32) -> anyhow::Result<Box<dyn AtlasPage>> {
            self.events
                .borrow_mut()
                .push(format!("create {}x{}", width, height));
            Ok(Box::new(FakePage {
                events: Rc::clone(&self.events),
            }))
        }
    }

    struct FakePage {
        events: Rc<RefCell<Vec<String>>>,
    }

    impl AtlasPage for FakePage {
        fn composite(
            &mut self,
            source: &Path,
            x: u32,
            y: u32,
            width: u32,
            height: u32,
        ) -> anyhow::Result<()> {
            self.events.borrow_mut().push(format!(
                "paste {} {},{} {}x{}",
                leaf(source),
                x,
                y,
                width,
                height
            ));
            Ok(())
        }

        fn export(&self, path: &Path) -> anyhow::Result<()> {
            self.events
                .borrow_mut()
                .push(format!("export {}", leaf(path)));
            Ok(())
        }
    }

    fn vfs_with(snapshot: VfsSnapshot) -> Vfs {
        let mut backend = InMemoryFs::new();
        backend.load_snapshot("/mod", snapshot).unwrap();
        Vfs::new(backend)
    }

    fn example_manifest(prefix: Option<u32>) -> ModManifest {
        ModManifest {
            name: "example".to_owned(),
            path: PathBuf::from("/mod"),
            prefix,
            variables: Vec::new(),
        }
    }

    fn fresh_session(last: u64) -> AllocationSession {
        AllocationSession {
            last_core_region_id: last,
            next_region_id: last + 1,
            modded: HashMap::new(),
            custom_pages: HashMap::new(),
        }
    }

    fn textures_with_regions(entries: Vec<ElementTemplate>) -> DocumentTree {
        let mut regions = ElementTemplate::new("regions");
        for entry in entries {
            regions = regions.with_child(entry);
        }
        DocumentTree::from_root(
            ElementTemplate::new("AllTexturesAndRegions")
                .with_child(ElementTemplate::new("textures"))
                .with_child(regions),
        )
    }

    fn region(n: &str) -> ElementTemplate {
        ElementTemplate::new("re").with_attribute("n", n)
    }

    fn region_names(doc: &DocumentTree) -> Vec<String> {
        let query: PathQuery = "//re[@n]".parse().unwrap();
        query
            .evaluate(doc)
            .into_iter()
            .map(|id| doc.attribute(id, "n").unwrap().to_owned())
            .collect()
    }

    #[test]
    fn session_starts_after_the_highest_numeric_region() {
        let baseline = Baseline::from_documents(vec![(
            registry::TEXTURES.to_owned(),
            textures_with_regions(vec![
                region("12"),
                region("500"),
                region("77"),
                region("oddball"),
            ]),
        )]);

        let session = AllocationSession::from_baseline(&baseline).unwrap();
        assert_eq!(session.last_core_region_id(), 500);
        assert_eq!(session.next_region_id, 501);
    }

    #[test]
    fn loose_declarations_number_up_from_the_base_game() {
        let vfs = vfs_with(VfsSnapshot::dir([(
            "textures",
            VfsSnapshot::dir([
                ("hull.png", VfsSnapshot::empty_file()),
                ("thruster.png", VfsSnapshot::empty_file()),
                ("window.png", VfsSnapshot::empty_file()),
            ]),
        )]));

        let mut session = fresh_session(500);
        let mut overlay = OverlaySet::default();
        overlay
            .ensure_document(registry::TEXTURES)
            .push(textures_with_regions(vec![
                region("hull.png"),
                region("thruster.png"),
                region("window.png"),
            ]));

        let detected = detect_overlay_textures(
            &mut session,
            &mut overlay,
            &example_manifest(Some(77)),
            &vfs,
            &FakeCodec::default(),
        )
        .unwrap();

        assert_eq!(detected["501"].filename, "hull.png");
        assert_eq!(detected["502"].filename, "thruster.png");
        assert_eq!(detected["503"].filename, "window.png");

        let doc = &overlay.get(registry::TEXTURES)[0];
        assert_eq!(region_names(doc), ["501", "502", "503"]);
    }

    #[test]
    fn numeric_stems_override_base_regions_only_when_the_file_exists() {
        let vfs = vfs_with(VfsSnapshot::dir([(
            "textures",
            VfsSnapshot::dir([("100.png", VfsSnapshot::empty_file())]),
        )]));

        let mut session = fresh_session(500);
        let mut overlay = OverlaySet::default();
        overlay
            .ensure_document(registry::TEXTURES)
            .push(textures_with_regions(vec![
                region("100.png"),
                region("200.png"),
            ]));

        let detected = detect_overlay_textures(
            &mut session,
            &mut overlay,
            &example_manifest(Some(77)),
            &vfs,
            &FakeCodec::default(),
        )
        .unwrap();

        assert_eq!(detected.len(), 1);
        assert_eq!(detected["100"].filename, "100.png");
        assert_eq!(detected["100"].path, PathBuf::from("/mod/textures/100.png"));
        // Neither declaration spent a new id.
        assert_eq!(session.next_region_id, 501);
    }

    #[test]
    fn loose_animation_files_get_regions_and_a_generated_page() {
        let vfs = vfs_with(VfsSnapshot::dir([
            (
                "library",
                VfsSnapshot::dir([("animations", VfsSnapshot::empty_file())]),
            ),
            (
                "textures",
                VfsSnapshot::dir([
                    ("laser.png", VfsSnapshot::empty_file()),
                    ("beam.png", VfsSnapshot::empty_file()),
                ]),
            ),
        ]));

        let mut session = fresh_session(500);
        let mut overlay = OverlaySet::default();
        overlay
            .ensure_document(registry::ANIMATIONS)
            .push(DocumentTree::from_root(
                ElementTemplate::new("AllAnimations").with_child(
                    ElementTemplate::new("animations")
                        .with_child(
                            ElementTemplate::new("assetPos")
                                .with_attribute("filename", "laser.png"),
                        )
                        .with_child(
                            ElementTemplate::new("assetPos").with_attribute("filename", "/beam"),
                        ),
                ),
            ));

        let codec = FakeCodec::with_sizes(hashmap! {
            "laser.png".to_owned() => (16, 16),
            "beam.png".to_owned() => (8, 4),
        });

        let detected = detect_overlay_textures(
            &mut session,
            &mut overlay,
            &example_manifest(Some(4242)),
            &vfs,
            &codec,
        )
        .unwrap();

        assert_eq!(detected["501"].filename, "laser.png");
        assert_eq!(detected["502"].filename, "beam.png");

        // Asset references now point at the allocated regions.
        let animations = &overlay.get(registry::ANIMATIONS)[0];
        let assets: PathQuery = "//assetPos".parse().unwrap();
        let references: Vec<String> = assets
            .evaluate(animations)
            .into_iter()
            .map(|id| animations.attribute(id, "a").unwrap().to_owned())
            .collect();
        assert_eq!(references, ["501", "502"]);

        // A textures document was synthesized holding the page and both
        // generated regions, bigger texture placed first.
        let doc = &overlay.get(registry::TEXTURES)[0];
        let pages: PathQuery = "//t[@i]".parse().unwrap();
        let page = pages.first(doc).unwrap();
        assert_eq!(doc.attribute(page, "i"), Some("4242"));
        assert_eq!(doc.attribute(page, "w"), Some("2048"));

        let declarations: PathQuery = "//re".parse().unwrap();
        let regions = declarations.evaluate(doc);
        assert_eq!(regions.len(), 2);
        assert_eq!(doc.attribute(regions[0], "n"), Some("501"));
        assert_eq!(doc.attribute(regions[0], "t"), Some("4242"));
        assert_eq!(doc.attribute(regions[0], "x"), Some("0"));
        assert_eq!(doc.attribute(regions[0], "y"), Some("0"));
        assert_eq!(doc.attribute(regions[0], "file"), Some("laser.png"));
        assert_eq!(doc.attribute(regions[1], "n"), Some("502"));
        assert_eq!(doc.attribute(regions[1], "x"), Some("16"));
        assert_eq!(doc.attribute(regions[1], "y"), Some("0"));
        assert_eq!(doc.attribute(regions[1], "w"), Some("8"));

        // The session learned the generated page for later compositing.
        assert_eq!(
            session.custom_pages,
            hashmap! {
                "4242".to_owned() => PageSpec {
                    width: Some("2048".to_owned()),
                    height: Some("2048".to_owned()),
                },
            }
        );

        // Authors get the allocation table written back into their mod.
        let generated = vfs.read("/mod/library/generated_textures.xml").unwrap();
        assert!(!generated.is_empty());
    }

    #[test]
    fn filename_references_reuse_explicit_declarations() {
        let vfs = vfs_with(VfsSnapshot::dir([
            ("library", VfsSnapshot::empty_dir()),
            (
                "textures",
                VfsSnapshot::dir([("art.png", VfsSnapshot::empty_file())]),
            ),
        ]));

        let mut session = fresh_session(500);
        let mut overlay = OverlaySet::default();
        overlay
            .ensure_document(registry::TEXTURES)
            .push(textures_with_regions(vec![region("art.png")]));
        overlay
            .ensure_document(registry::ANIMATIONS)
            .push(DocumentTree::from_root(
                ElementTemplate::new("AllAnimations").with_child(
                    ElementTemplate::new("assetPos").with_attribute("filename", "art.png"),
                ),
            ));

        let detected = detect_overlay_textures(
            &mut session,
            &mut overlay,
            &example_manifest(Some(7)),
            &vfs,
            &FakeCodec::default(),
        )
        .unwrap();

        assert_eq!(detected.len(), 1);
        assert_eq!(detected["501"].filename, "art.png");

        let animations = &overlay.get(registry::ANIMATIONS)[0];
        let assets: PathQuery = "//assetPos".parse().unwrap();
        let asset = assets.first(animations).unwrap();
        assert_eq!(animations.attribute(asset, "a"), Some("501"));

        // The explicit declaration stands; no second region and no
        // generated page were added for the same file.
        let doc = &overlay.get(registry::TEXTURES)[0];
        assert_eq!(region_names(doc), ["501"]);
        let pages: PathQuery = "//t[@i]".parse().unwrap();
        assert_eq!(pages.first(doc), None);
    }

    #[test]
    fn non_numeric_references_are_rejected() {
        let vfs = vfs_with(VfsSnapshot::dir([(
            "textures",
            VfsSnapshot::dir([("art.png", VfsSnapshot::empty_file())]),
        )]));

        let mut session = fresh_session(500);
        let mut overlay = OverlaySet::default();
        overlay
            .ensure_document(registry::TEXTURES)
            .push(textures_with_regions(vec![region("art.png")]));
        overlay
            .ensure_document(registry::ANIMATIONS)
            .push(DocumentTree::from_root(
                ElementTemplate::new("AllAnimations")
                    .with_child(ElementTemplate::new("assetPos").with_attribute("a", "fancy")),
            ));

        let error = detect_overlay_textures(
            &mut session,
            &mut overlay,
            &example_manifest(Some(7)),
            &vfs,
            &FakeCodec::default(),
        )
        .unwrap_err();

        assert!(format!("{:#}", error).contains("non-numeric"));
    }

    #[test]
    fn mods_without_a_textures_directory_are_skipped() {
        let vfs = vfs_with(VfsSnapshot::dir([("library", VfsSnapshot::empty_dir())]));

        let mut session = fresh_session(500);
        let mut overlay = OverlaySet::default();
        overlay
            .ensure_document(registry::ANIMATIONS)
            .push(DocumentTree::from_root(
                ElementTemplate::new("AllAnimations").with_child(
                    ElementTemplate::new("assetPos").with_attribute("filename", "ghost.png"),
                ),
            ));

        let detected = detect_overlay_textures(
            &mut session,
            &mut overlay,
            &example_manifest(Some(7)),
            &vfs,
            &FakeCodec::default(),
        )
        .unwrap();

        assert!(detected.is_empty());
        assert!(!overlay.contains(registry::TEXTURES));
        assert_eq!(session.next_region_id, 501);
    }

    #[test]
    fn compositing_opens_base_pages_and_creates_declared_ones() {
        let baseline = Baseline::from_documents(vec![(
            registry::TEXTURES.to_owned(),
            textures_with_regions(vec![
                region("5")
                    .with_attribute("t", "0")
                    .with_attribute("x", "10")
                    .with_attribute("y", "20")
                    .with_attribute("w", "30")
                    .with_attribute("h", "40"),
                region("777")
                    .with_attribute("t", "4242")
                    .with_attribute("x", "0")
                    .with_attribute("y", "0")
                    .with_attribute("w", "16")
                    .with_attribute("h", "16"),
                region("9")
                    .with_attribute("t", "0")
                    .with_attribute("x", "50")
                    .with_attribute("y", "60")
                    .with_attribute("w", "7")
                    .with_attribute("h", "7"),
            ]),
        )]);

        let mut session = fresh_session(1000);
        session.modded.insert(
            "5".to_owned(),
            ModdedTexture {
                mapped_from: "5".to_owned(),
                filename: "five.png".to_owned(),
                path: PathBuf::from("/mod/textures/five.png"),
            },
        );
        session.modded.insert(
            "777".to_owned(),
            ModdedTexture {
                mapped_from: "laser".to_owned(),
                filename: "laser.png".to_owned(),
                path: PathBuf::from("/mod/textures/laser.png"),
            },
        );
        session.custom_pages.insert(
            "4242".to_owned(),
            PageSpec {
                width: Some("512".to_owned()),
                height: Some("256".to_owned()),
            },
        );

        let codec = FakeCodec::default();
        let extra = composite_pages(&session, &baseline, Path::new("/game"), &codec).unwrap();

        assert_eq!(extra, ["library/4242.cim"]);
        assert_eq!(
            codec.log(),
            [
                "open 0.cim",
                "paste five.png 10,20 30x40",
                "create 512x256",
                "paste laser.png 0,0 16x16",
                "export 0.cim",
                "export 4242.cim",
            ]
        );
    }

    #[test]
    fn undeclared_pages_cannot_be_composited() {
        let baseline = Baseline::from_documents(vec![(
            registry::TEXTURES.to_owned(),
            textures_with_regions(vec![region("6")
                .with_attribute("t", "777")
                .with_attribute("x", "0")
                .with_attribute("y", "0")
                .with_attribute("w", "4")
                .with_attribute("h", "4")]),
        )]);

        let mut session = fresh_session(1000);
        session.modded.insert(
            "6".to_owned(),
            ModdedTexture {
                mapped_from: "six".to_owned(),
                filename: "six.png".to_owned(),
                path: PathBuf::from("/mod/textures/six.png"),
            },
        );

        let error =
            composite_pages(&session, &baseline, Path::new("/game"), &FakeCodec::default())
                .unwrap_err();

        assert!(format!("{:#}", error).contains("no mod declared"));
    }
}
