//! Human-shareable unlocking codes.

use rand::{rngs::OsRng, Rng};

/// Number of words in a generated passcode.
pub const PASSCODE_WORDS: usize = 3;

/// Separator placed between passcode words.
pub const PASSCODE_SEPARATOR: &str = "-";

/// Generate a passcode of `PASSCODE_WORDS` words drawn uniformly from
/// `WORDLIST` with the OS random number generator.
pub fn generate_passcode() -> String {
    let words: Vec<&str> = (0..PASSCODE_WORDS)
        .map(|_| WORDLIST[OsRng.gen_range(0..WORDLIST.len())])
        .collect();
    words.join(PASSCODE_SEPARATOR)
}

pub static WORDLIST: &[&str] = &[
    "abacus", "abdomen", "ability", "absorb", "acid", "acorn", "actor", "adapt",
    "admiral", "adobe", "aerial", "agenda", "airport", "alarm", "album", "alcove",
    "algebra", "alpine", "amber", "anchor", "angle", "ankle", "antenna", "anvil",
    "apple", "apron", "arcade", "arch", "arena", "armor", "arrow", "artist",
    "aspen", "atlas", "attic", "auburn", "autumn", "avenue", "award", "axle",
    "badge", "bagel", "bakery", "balcony", "ballot", "bamboo", "banjo", "barley",
    "barrel", "basket", "beacon", "beaver", "bedrock", "beetle", "bellow", "bench",
    "berry", "bicycle", "biscuit", "blanket", "blossom", "bonfire", "border", "bottle",
    "boulder", "bracket", "breeze", "brick", "bridge", "bronze", "bucket", "buffalo",
    "bugle", "button", "cabin", "cactus", "camel", "candle", "canoe", "canyon",
    "carbon", "cargo", "carpet", "castle", "cedar", "cellar", "chalk", "cherry",
    "chimney", "cinder", "circus", "citrus", "clover", "cobalt", "comet", "compass",
    "copper", "coral", "cotton", "crater", "crayon", "cricket", "crystal", "cypress",
    "dagger", "dahlia", "dancer", "delta", "denim", "desert", "diesel", "dolphin",
    "domino", "donkey", "dragon", "drizzle", "drum", "dune", "eagle", "easel",
    "echo", "eclipse", "elbow", "ember", "emerald", "engine", "equator", "falcon",
    "fathom", "feather", "fennel", "ferry", "fiddle", "fjord", "flannel", "flint",
    "forest", "fossil", "fountain", "gadget", "galaxy", "garden", "garlic", "geyser",
    "ginger", "glacier", "goblet", "gopher", "granite", "gravel", "hammer", "harbor",
    "harvest", "hazel", "helmet", "heron", "hickory", "hollow", "honey", "horizon",
    "iceberg", "igloo", "indigo", "island", "ivory", "jacket", "jaguar", "jasmine",
    "jigsaw", "juniper", "kettle", "kiosk", "kitten", "koala", "ladder", "lagoon",
    "lantern", "lava", "lemon", "lilac", "linen", "lizard", "lobster", "locket",
    "magnet", "mango", "maple", "marble", "meadow", "melon", "meteor", "mitten",
    "monsoon", "mosaic", "muffin", "nectar", "needle", "nickel", "nutmeg", "oasis",
    "oatmeal", "ocean", "olive", "onyx", "orbit", "orchid", "otter", "paddle",
    "pamphlet", "panda", "parrot", "pebble", "pepper", "pillow", "pinecone", "planet",
    "pocket", "pollen", "pretzel", "pumpkin", "puzzle", "quartz", "quiver", "rabbit",
    "radish", "raven", "ribbon", "river", "rocket", "saddle", "saffron", "salmon",
    "sapphire", "satchel", "shovel", "signal", "silver", "spruce", "squirrel", "summit",
    "tangerine", "teapot", "thistle", "thunder", "timber", "tulip", "tundra", "velvet",
    "violet", "walnut", "whistle", "willow", "window", "yonder", "zephyr", "zipper",
];
