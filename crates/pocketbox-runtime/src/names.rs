//! Random container names of the form `adjective_noun_NNNN`.

use rand::Rng;
use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "agile", "bold", "brave", "bright", "calm", "clever", "cosmic", "crisp", "eager", "fancy",
    "gentle", "happy", "jolly", "keen", "lucid", "lucky", "merry", "nimble", "noble", "proud",
    "quick", "quiet", "rapid", "shiny", "silent", "snappy", "steady", "sunny", "swift", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "cedar", "comet", "coral", "falcon", "fern", "fox", "galaxy", "harbor",
    "heron", "lantern", "maple", "meadow", "nebula", "otter", "panda", "pebble", "pine", "quartz",
    "raven", "river", "rocket", "sparrow", "summit", "tiger", "tulip", "walrus", "willow", "zephyr",
];

/// Generates a random container name such as `swift_otter_4821`.
#[must_use]
pub fn generate_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("otter");
    let number: u16 = rng.gen_range(1000..=9999);
    format!("{adjective}_{noun}_{number}")
}
