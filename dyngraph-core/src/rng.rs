//! Process wide random number generator used for parameter initialization.

use crate::mutex::Mutex;
use rand::rngs::SmallRng;
use rand::SeedableRng;

const DEFAULT_SEED: u64 = 42;

static RNG: Mutex<Option<SmallRng>> = Mutex::new(None);

/// Reseeds the generator.
pub fn seed(seed: u64) {
    *RNG.lock() = Some(SmallRng::seed_from_u64(seed));
}

/// Runs `f` with the generator, seeding it with the default seed on first use.
pub fn with_rng<R>(f: impl FnOnce(&mut SmallRng) -> R) -> R {
    let mut guard = RNG.lock();
    let rng = guard.get_or_insert_with(|| SmallRng::seed_from_u64(DEFAULT_SEED));
    f(rng)
}
