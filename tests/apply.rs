//! End-to-end runs of the apply pipeline against an in-memory game
//! directory and mod set.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use anyhow::Context;
use maplit::hashmap;
use memofs::{InMemoryFs, Vfs, VfsSnapshot};

use libmodmerge::dom::query::PathQuery;
use libmodmerge::dom::{self, DocumentTree, NodeId};
use libmodmerge::manifest::ModManifest;
use libmodmerge::pipeline::apply_mods;
use libmodmerge::texture::{AtlasCodec, AtlasPage};

const HAVEN_BASE: &str = r#"<data><Tech><t id="1" cost="10"/></Tech></data>"#;

const EMPTY_TEXTURES: &str = "<AllTexturesAndRegions><textures/><regions/></AllTexturesAndRegions>";

const TEXTURES_BASE: &str = r#"
<AllTexturesAndRegions>
  <textures>
    <t i="0" w="2048" h="2048"/>
  </textures>
  <regions>
    <re n="500" t="0" x="0" y="0" w="4" h="4"/>
  </regions>
</AllTexturesAndRegions>
"#;

const AUDIO_BASE: &str = r#"
<audio>
  <a id="2" n="boom" at="Sound" ogg="library/sound/ogg/boom.ogg"/>
  <a id="1" n="tune" at="Music" ogg="library/music/ogg/tune.ogg"/>
</audio>
"#;

const MINING_INFO: &str = r#"
<mod>
  <name>Mining Overhaul</name>
  <modid>4242</modid>
  <variables>
    <variable name="$COST" value="42"/>
  </variables>
</mod>
"#;

const MINING_HAVEN: &str = r#"
<data>
  <Tech>
    <t id="1" name="X"/>
    <t id="2" name="Y"/>
  </Tech>
</data>
"#;

const MINING_AUDIO: &str = r#"
<audio>
  <a id="50" n="klaxon" at="Sound" ogg="library/sound/ogg/klaxon.ogg"/>
</audio>
"#;

const MINING_ANIMATIONS: &str = r#"
<AllAnimations>
  <animations>
    <anim n="9">
      <assetPos filename="laser.png"/>
    </anim>
  </animations>
</AllAnimations>
"#;

const MINING_PATCH: &str = r#"
<patch>
  <Operation Class="AttributeSet">
    <xpath>/data/Tech/t[@id="2"]</xpath>
    <attribute>cost</attribute>
    <value>$COST</value>
  </Operation>
</patch>
"#;

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
    backend.load_snapshot("/", snapshot).unwrap();
    Vfs::new(backend)
}

fn library_snapshot(haven: &str, textures: &str, audio: &str) -> VfsSnapshot {
    VfsSnapshot::dir([
        ("haven", VfsSnapshot::file(haven)),
        ("texts", VfsSnapshot::file("<t/>")),
        (
            "animations",
            VfsSnapshot::file("<AllAnimations><animations/></AllAnimations>"),
        ),
        ("textures", VfsSnapshot::file(textures)),
        ("audio", VfsSnapshot::file(audio)),
    ])
}

/// A base game with just the five documents and no shipped assets.
fn tiny_base(haven: &str) -> VfsSnapshot {
    VfsSnapshot::dir([("library", library_snapshot(haven, EMPTY_TEXTURES, "<audio/>"))])
}

/// A mod that only overlays `library/haven`.
fn overlay_mod(haven: &str) -> VfsSnapshot {
    VfsSnapshot::dir([(
        "library",
        VfsSnapshot::dir([("haven", VfsSnapshot::file(haven))]),
    )])
}

fn load_mod(vfs: &Vfs, path: &str) -> ModManifest {
    ModManifest::load(vfs, Path::new(path)).unwrap()
}

fn written(vfs: &Vfs, path: &str) -> DocumentTree {
    let contents = vfs.read(path).unwrap();
    dom::parse(&contents).unwrap()
}

fn find_one(tree: &DocumentTree, expression: &str) -> NodeId {
    let query: PathQuery = expression.parse().unwrap();
    query.first(tree).unwrap()
}

fn attribute_values(tree: &DocumentTree, expression: &str, attribute: &str) -> Vec<String> {
    let query: PathQuery = expression.parse().unwrap();
    query
        .evaluate(tree)
        .into_iter()
        .filter_map(|id| tree.attribute(id, attribute))
        .map(str::to_owned)
        .collect()
}

#[test]
fn mods_apply_end_to_end() {
    let _ = env_logger::try_init();

    let base = VfsSnapshot::dir([(
        "library",
        VfsSnapshot::dir([
            ("haven", VfsSnapshot::file(HAVEN_BASE)),
            ("texts", VfsSnapshot::file("<t/>")),
            (
                "animations",
                VfsSnapshot::file("<AllAnimations><animations/></AllAnimations>"),
            ),
            ("textures", VfsSnapshot::file(TEXTURES_BASE)),
            ("audio", VfsSnapshot::file(AUDIO_BASE)),
            (
                "sound",
                VfsSnapshot::dir([(
                    "ogg",
                    VfsSnapshot::dir([("boom.ogg", VfsSnapshot::file("boom"))]),
                )]),
            ),
            (
                "music",
                VfsSnapshot::dir([(
                    "ogg",
                    VfsSnapshot::dir([("tune.ogg", VfsSnapshot::file("tune"))]),
                )]),
            ),
        ]),
    )]);

    let mining = VfsSnapshot::dir([
        ("info.xml", VfsSnapshot::file(MINING_INFO)),
        (
            "library",
            VfsSnapshot::dir([
                ("haven", VfsSnapshot::file(MINING_HAVEN)),
                ("audio", VfsSnapshot::file(MINING_AUDIO)),
                ("animations", VfsSnapshot::file(MINING_ANIMATIONS)),
            ]),
        ),
        (
            "patches",
            VfsSnapshot::dir([("haven_costs.xml", VfsSnapshot::file(MINING_PATCH))]),
        ),
        (
            "textures",
            VfsSnapshot::dir([("laser.png", VfsSnapshot::file("laser"))]),
        ),
        (
            "audio",
            VfsSnapshot::dir([("klaxon.ogg", VfsSnapshot::file("klaxon"))]),
        ),
    ]);

    let vfs = vfs_with(VfsSnapshot::dir([
        ("game", base),
        ("mods", VfsSnapshot::dir([("mine", mining)])),
    ]));
    let codec = FakeCodec::with_sizes(hashmap! {
        "laser.png".to_owned() => (16, 16),
    });

    let mods = [load_mod(&vfs, "/mods/mine")];
    let report = apply_mods(&vfs, &codec, Path::new("/game"), &mods).unwrap();

    assert!(report.failed_mods.is_empty());
    assert_eq!(
        report.extra_assets,
        ["library/sound/ogg/klaxon.ogg", "library/4242.cim"]
    );

    // The overlay replaced entry 1 wholesale and appended entry 2; the
    // patch then priced entry 2 using the mod's $COST variable.
    let haven = written(&vfs, "/game/library/haven");
    assert_eq!(attribute_values(&haven, "/data/Tech/t", "id"), ["1", "2"]);

    let replaced = find_one(&haven, r#"/data/Tech/t[@id="1"]"#);
    assert_eq!(haven.attribute(replaced, "name"), Some("X"));
    assert_eq!(haven.attribute(replaced, "cost"), None);

    let patched = find_one(&haven, r#"/data/Tech/t[@id="2"]"#);
    assert_eq!(haven.attribute(patched, "cost"), Some("42"));

    // Sounds sort before music, each by ascending id.
    let audio = written(&vfs, "/game/library/audio");
    assert_eq!(
        attribute_values(&audio, "/audio/a", "n"),
        ["boom", "klaxon", "tune"]
    );

    // The loose laser.png got region 501 on the mod's own page.
    let textures = written(&vfs, "/game/library/textures");
    assert_eq!(attribute_values(&textures, "//re", "n"), ["500", "501"]);
    assert_eq!(attribute_values(&textures, "//t[@i]", "i"), ["0", "4242"]);

    let generated = find_one(&textures, r#"//re[@n="501"]"#);
    assert_eq!(textures.attribute(generated, "t"), Some("4242"));
    assert_eq!(textures.attribute(generated, "w"), Some("16"));
    assert_eq!(textures.attribute(generated, "h"), Some("16"));
    assert_eq!(textures.attribute(generated, "file"), Some("laser.png"));

    let animations = written(&vfs, "/game/library/animations");
    let asset = find_one(&animations, "//assetPos");
    assert_eq!(animations.attribute(asset, "a"), Some("501"));

    // The new sound landed next to the shipped ones; the shipped ones
    // were not copied again.
    let staged = vfs.read("/game/library/sound/ogg/klaxon.ogg").unwrap();
    assert_eq!(staged.as_slice(), b"klaxon");

    // The declarations were also written back into the mod directory.
    let table = written(&vfs, "/mods/mine/library/generated_textures.xml");
    assert_eq!(attribute_values(&table, "//re", "n"), ["501"]);

    assert_eq!(
        codec.log(),
        [
            "create 2048x2048",
            "paste laser.png 0,0 16x16",
            "export 4242.cim",
        ]
    );
}

#[test]
fn later_mods_take_identity_conflicts() {
    let _ = env_logger::try_init();

    let vfs = vfs_with(VfsSnapshot::dir([
        (
            "game",
            tiny_base(r#"<data><Tech><t id="5" flavor="A"/></Tech></data>"#),
        ),
        (
            "mods",
            VfsSnapshot::dir([
                (
                    "first",
                    overlay_mod(r#"<data><Tech><t id="5" flavor="B"/></Tech></data>"#),
                ),
                (
                    "second",
                    overlay_mod(r#"<data><Tech><t id="5" flavor="C"/></Tech></data>"#),
                ),
            ]),
        ),
    ]));
    let codec = FakeCodec::default();

    let mods = [load_mod(&vfs, "/mods/first"), load_mod(&vfs, "/mods/second")];
    let report = apply_mods(&vfs, &codec, Path::new("/game"), &mods).unwrap();

    assert!(report.failed_mods.is_empty());
    assert!(report.extra_assets.is_empty());

    let haven = written(&vfs, "/game/library/haven");
    assert_eq!(attribute_values(&haven, "/data/Tech/t", "flavor"), ["C"]);
}

#[test]
fn a_second_run_writes_identical_documents() {
    let _ = env_logger::try_init();

    let tweak = VfsSnapshot::dir([
        (
            "library",
            VfsSnapshot::dir([(
                "haven",
                VfsSnapshot::file(
                    r#"<data><Tech><t id="5" flavor="B"/><t id="6" flavor="N"/></Tech></data>"#,
                ),
            )]),
        ),
        (
            "patches",
            VfsSnapshot::dir([(
                "haven_fix.xml",
                VfsSnapshot::file(
                    r#"
                    <patch>
                      <Operation Class="AttributeSet">
                        <xpath>/data/Tech/t[@id="6"]</xpath>
                        <attribute>cost</attribute>
                        <value>9</value>
                      </Operation>
                    </patch>
                    "#,
                ),
            )]),
        ),
    ]);

    let vfs = vfs_with(VfsSnapshot::dir([
        (
            "game",
            tiny_base(r#"<data><Tech><t id="5" flavor="A"/></Tech></data>"#),
        ),
        ("mods", VfsSnapshot::dir([("tweak", tweak)])),
    ]));
    let codec = FakeCodec::default();
    let mods = [load_mod(&vfs, "/mods/tweak")];

    apply_mods(&vfs, &codec, Path::new("/game"), &mods).unwrap();
    let first_pass = vfs.read("/game/library/haven").unwrap();

    // The second run re-reads the documents the first one wrote.
    let report = apply_mods(&vfs, &codec, Path::new("/game"), &mods).unwrap();
    let second_pass = vfs.read("/game/library/haven").unwrap();

    assert!(report.failed_mods.is_empty());
    assert_eq!(first_pass, second_pass);
}

#[test]
fn failing_patches_only_abandon_their_own_mod() {
    let _ = env_logger::try_init();

    let broken = VfsSnapshot::dir([
        (
            "info.xml",
            VfsSnapshot::file("<mod><name>Broken Toys</name></mod>"),
        ),
        (
            "library",
            VfsSnapshot::dir([(
                "haven",
                VfsSnapshot::file(r#"<data><Tech><t id="7" keep="yes"/></Tech></data>"#),
            )]),
        ),
        (
            "patches",
            VfsSnapshot::dir([(
                "haven_break.xml",
                VfsSnapshot::file(
                    r#"
                    <patch>
                      <Operation Class="AttributeRemove">
                        <xpath>/data/Tech/t[@id="1"]</xpath>
                        <attribute>ghost</attribute>
                      </Operation>
                    </patch>
                    "#,
                ),
            )]),
        ),
    ]);

    let fixer = VfsSnapshot::dir([(
        "patches",
        VfsSnapshot::dir([(
            "haven_fix.xml",
            VfsSnapshot::file(
                r#"
                <patch>
                  <Operation Class="AttributeSet">
                    <xpath>/data/Tech/t[@id="1"]</xpath>
                    <attribute>cost</attribute>
                    <value>1</value>
                  </Operation>
                </patch>
                "#,
            ),
        )]),
    )]);

    let vfs = vfs_with(VfsSnapshot::dir([
        ("game", tiny_base(HAVEN_BASE)),
        (
            "mods",
            VfsSnapshot::dir([("broken", broken), ("fixer", fixer)]),
        ),
    ]));
    let codec = FakeCodec::default();

    let mods = [load_mod(&vfs, "/mods/broken"), load_mod(&vfs, "/mods/fixer")];
    let report = apply_mods(&vfs, &codec, Path::new("/game"), &mods).unwrap();

    assert_eq!(report.failed_mods, ["Broken Toys"]);

    // The failing mod keeps its merged entries; the other mod's patches
    // still ran.
    let haven = written(&vfs, "/game/library/haven");
    assert_eq!(attribute_values(&haven, "/data/Tech/t", "id"), ["1", "7"]);

    let tech = find_one(&haven, r#"/data/Tech/t[@id="1"]"#);
    assert_eq!(haven.attribute(tech, "cost"), Some("1"));
}

#[test]
fn loose_textures_pack_in_declaration_order() {
    let _ = env_logger::try_init();

    let sprites = VfsSnapshot::dir([
        (
            "info.xml",
            VfsSnapshot::file("<mod><name>Sprites</name><modid>7</modid></mod>"),
        ),
        (
            "library",
            VfsSnapshot::dir([(
                "animations",
                VfsSnapshot::file(
                    r#"
                    <AllAnimations>
                      <animations>
                        <anim n="9">
                          <assetPos filename="laser.png"/>
                          <assetPos filename="beam.png"/>
                          <assetPos filename="spark.png"/>
                        </anim>
                      </animations>
                    </AllAnimations>
                    "#,
                ),
            )]),
        ),
        (
            "textures",
            VfsSnapshot::dir([
                ("laser.png", VfsSnapshot::file("laser")),
                ("beam.png", VfsSnapshot::file("beam")),
                ("spark.png", VfsSnapshot::file("spark")),
            ]),
        ),
    ]);

    let vfs = vfs_with(VfsSnapshot::dir([
        (
            "game",
            VfsSnapshot::dir([("library", library_snapshot("<data/>", TEXTURES_BASE, "<audio/>"))]),
        ),
        ("mods", VfsSnapshot::dir([("sprites", sprites)])),
    ]));
    let codec = FakeCodec::with_sizes(hashmap! {
        "laser.png".to_owned() => (8, 8),
        "beam.png".to_owned() => (8, 8),
        "spark.png".to_owned() => (8, 8),
    });

    let mods = [load_mod(&vfs, "/mods/sprites")];
    let report = apply_mods(&vfs, &codec, Path::new("/game"), &mods).unwrap();

    assert_eq!(report.extra_assets, ["library/7.cim"]);

    // Ids count up in the order the animations first referenced each
    // file, and equal sizes keep that order on the page.
    let animations = written(&vfs, "/game/library/animations");
    assert_eq!(
        attribute_values(&animations, "//assetPos", "a"),
        ["501", "502", "503"]
    );

    let textures = written(&vfs, "/game/library/textures");
    assert_eq!(
        attribute_values(&textures, "//re", "n"),
        ["500", "501", "502", "503"]
    );
    assert_eq!(
        attribute_values(&textures, "//re", "file"),
        ["laser.png", "beam.png", "spark.png"]
    );

    assert_eq!(
        codec.log(),
        [
            "create 2048x2048",
            "paste laser.png 0,0 8x8",
            "paste beam.png 8,0 8x8",
            "paste spark.png 16,0 8x8",
            "export 7.cim",
        ]
    );
}
