//! Name and MAC address allocation.

use multipassd_common::{Error, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;

/// Generates candidate instance names.
pub trait NameGenerator: Send + Sync {
    fn make_name(&self) -> String;
}

const ADJECTIVES: &[&str] = &[
    "ample", "brave", "calm", "daring", "eager", "fancy", "gentle", "handy", "idle", "jolly",
    "keen", "lively", "merry", "nimble", "odd", "polite", "quick", "rapid", "sharp", "tidy",
    "upbeat", "vivid", "witty", "zesty", "bold", "clever", "deft", "earnest", "frank", "glad",
];

const ANIMALS: &[&str] = &[
    "albatross", "badger", "cricket", "dolphin", "egret", "ferret", "gecko", "heron", "ibex",
    "jackal", "koala", "lemur", "marmot", "newt", "otter", "pelican", "quail", "rook", "stoat",
    "tapir", "urchin", "vole", "wombat", "yak", "zebra", "bream", "crane", "dingo", "falcon",
    "gull",
];

/// Default adjective-animal name generator.
#[derive(Debug, Default)]
pub struct PetnameGenerator;

impl NameGenerator for PetnameGenerator {
    fn make_name(&self) -> String {
        let mut rng = rand::thread_rng();
        format!(
            "{}-{}",
            ADJECTIVES.choose(&mut rng).unwrap(),
            ANIMALS.choose(&mut rng).unwrap()
        )
    }
}

/// Pick the instance name for a create request: the client's choice, the
/// blueprint's suggestion, or a fresh generated one not colliding with
/// `currently_used_names`.
pub fn name_from(
    requested_name: &str,
    blueprint_name: &str,
    name_gen: &dyn NameGenerator,
    currently_used_names: &HashSet<String>,
) -> Result<String> {
    if !requested_name.is_empty() {
        return Ok(requested_name.to_string());
    }
    if !blueprint_name.is_empty() {
        return Ok(blueprint_name.to_string());
    }

    const NUM_RETRIES: usize = 100;
    for _ in 0..NUM_RETRIES {
        let name = name_gen.make_name();
        if !currently_used_names.contains(&name) {
            return Ok(name);
        }
    }
    Err(Error::Runtime("unable to generate a unique name".into()))
}

/// Whether `mac` has the canonical lowercase `aa:bb:cc:dd:ee:ff` shape.
pub fn valid_mac_address(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets.iter().all(|o| {
            o.len() == 2
                && o.chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        })
}

/// A random locally-administered, unicast MAC address.
pub fn generate_mac_address() -> String {
    let mut rng = rand::thread_rng();
    let mut octets = [0u8; 6];
    rng.fill(&mut octets);
    octets[0] = (octets[0] | 0x02) & 0xfe; // local bit on, multicast bit off
    octets
        .iter()
        .map(|o| format!("{:02x}", o))
        .collect::<Vec<_>>()
        .join(":")
}

/// Generate a MAC address not present in `used`, then add it. Insertion is
/// atomic with success.
pub fn generate_unused_mac_address(used: &mut HashSet<String>) -> Result<String> {
    const MAX_TRIES: usize = 5;
    for _ in 0..MAX_TRIES {
        let mac = generate_mac_address();
        if used.insert(mac.clone()) {
            return Ok(mac);
        }
    }
    Err(Error::Runtime(format!(
        "Failed to generate an unique mac address after {} attempts. \
         Number of mac addresses in use: {}",
        MAX_TRIES,
        used.len()
    )))
}

/// Merge `extra` into `set` iff the two are disjoint. Returns whether they
/// were disjoint (and hence whether the merge happened).
pub fn merge_if_disjoint(set: &mut HashSet<String>, extra: &HashSet<String>) -> bool {
    if extra.iter().any(|mac| set.contains(mac)) {
        return false;
    }
    set.extend(extra.iter().cloned());
    true
}
