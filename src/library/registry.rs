//! The static description of what is mergeable: every document in the
//! baseline set, and every section within those documents together with the
//! attribute that identifies an entry. Merging consults this table and
//! nothing else to decide what counts as "the same entity."

/// One mergeable section: a path into a document and the attribute whose
/// value identifies an entry within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub document: &'static str,
    pub path: &'static str,
    pub identity: &'static str,
}

const fn section(
    document: &'static str,
    path: &'static str,
    identity: &'static str,
) -> Section {
    Section {
        document,
        path,
        identity,
    }
}

/// The documents that make up a baseline library, in merge and write-back
/// order.
pub const DOCUMENTS: &[&str] = &[
    "library/haven",
    "library/texts",
    "library/animations",
    "library/textures",
    "library/audio",
];

pub const HAVEN: &str = "library/haven";
pub const TEXTS: &str = "library/texts";
pub const ANIMATIONS: &str = "library/animations";
pub const TEXTURES: &str = "library/textures";
pub const AUDIO: &str = "library/audio";

/// Every mergeable section, in registry-declared order. Within one overlay
/// the merge engine walks this table top to bottom (interleaved with the
/// texture detection pass, see the merge module).
pub const SECTIONS: &[Section] = &[
    section(HAVEN, "/data/BackPack", "mid"),
    section(HAVEN, "/data/BackStory", "id"),
    section(HAVEN, "/data/CelestialObject", "id"),
    section(HAVEN, "/data/Character", "cid"),
    section(HAVEN, "/data/CharacterCondition", "id"),
    section(HAVEN, "/data/CharacterSet", "cid"),
    section(HAVEN, "/data/CharacterTrait", "id"),
    section(HAVEN, "/data/CostGroup", "id"),
    section(HAVEN, "/data/Craft", "cid"),
    section(HAVEN, "/data/DataLog", "id"),
    section(HAVEN, "/data/DataLogFragment", "id"),
    section(HAVEN, "/data/DefaultStuff", "id"),
    section(HAVEN, "/data/DialogChoice", "id"),
    section(HAVEN, "/data/DifficultySettings", "id"),
    section(HAVEN, "/data/Effect", "id"),
    section(HAVEN, "/data/Element", "mid"),
    section(HAVEN, "/data/Encounter", "id"),
    section(HAVEN, "/data/Explosion", "id"),
    section(HAVEN, "/data/Faction", "id"),
    section(HAVEN, "/data/FloorExpPackage", "id"),
    section(HAVEN, "/data/GameScenario", "id"),
    section(HAVEN, "/data/GOAPAction", "id"),
    section(HAVEN, "/data/IdleAnim", "id"),
    section(HAVEN, "/data/IsoFX", "id"),
    section(HAVEN, "/data/Item", "mid"),
    section(HAVEN, "/data/MainCat", "id"),
    section(HAVEN, "/data/Monster", "cid"),
    section(HAVEN, "/data/Notes", "id"),
    section(HAVEN, "/data/ObjectiveCollection", "nid"),
    section(HAVEN, "/data/PersonalitySettings", "id"),
    section(HAVEN, "/data/Plan", "id"),
    section(HAVEN, "/data/Product", "eid"),
    section(HAVEN, "/data/Randomizer", "id"),
    section(HAVEN, "/data/RandomShip", "id"),
    section(HAVEN, "/data/Robot", "cid"),
    section(HAVEN, "/data/RoofExpPackage", "id"),
    section(HAVEN, "/data/Room", "rid"),
    section(HAVEN, "/data/Sector", "id"),
    section(HAVEN, "/data/Ship", "rid"),
    section(HAVEN, "/data/SubCat", "id"),
    section(HAVEN, "/data/Tech", "id"),
    section(HAVEN, "/data/TechTree", "id"),
    section(HAVEN, "/data/TradingValues", "id"),
    section(TEXTS, "/t", "id"),
    section(AUDIO, "/audio", "id"),
    section(ANIMATIONS, "/AllAnimations/animations", "n"),
    section(TEXTURES, "/AllTexturesAndRegions/textures", "i"),
    section(TEXTURES, "/AllTexturesAndRegions/regions", "n"),
];

/// Sections belonging to one document, in declared order.
pub fn sections_for(document: &str) -> impl Iterator<Item = &'static Section> + use<'_> {
    SECTIONS
        .iter()
        .filter(move |section| section.document == document)
}

/// Number of atlas pages shipped with the baseline. Pages `0` through
/// `BASELINE_PAGE_COUNT - 1` are opened for compositing; any other page id
/// is mod-created and gets a fresh page.
pub const BASELINE_PAGE_COUNT: u32 = 24;

/// Whether `page` names a baseline atlas page. The comparison is textual:
/// `"05"` is not a baseline page name even though it parses to 5.
pub fn is_baseline_page(page: &str) -> bool {
    (0..BASELINE_PAGE_COUNT).any(|index| index.to_string() == page)
}
