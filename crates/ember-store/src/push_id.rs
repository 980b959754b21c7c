// ── Push-id generation ──
//
// Synchronous, collision-resistant key allocator: a 48-bit millisecond
// timestamp encoded as 8 characters, followed by 12 characters of random
// entropy. Ids generated in the same millisecond reuse the previous
// entropy incremented by one, so they still sort after each other.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Alphabet in ASCII order so that generated ids sort lexicographically
/// by generation time.
const ALPHABET: &[u8; 64] =
    b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

const TIMESTAMP_CHARS: usize = 8;
const ENTROPY_CHARS: usize = 12;

/// State carried between calls to keep same-millisecond ids monotonic.
#[derive(Debug, Default)]
pub(crate) struct PushIdState {
    last_millis: u64,
    last_entropy: [u8; ENTROPY_CHARS],
}

impl PushIdState {
    /// Generate the next id. No network round trip, no await.
    pub(crate) fn next_id(&mut self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);

        if millis == self.last_millis {
            increment(&mut self.last_entropy);
        } else {
            let mut rng = rand::thread_rng();
            for slot in &mut self.last_entropy {
                *slot = rng.gen_range(0..64);
            }
            self.last_millis = millis;
        }

        let mut id = String::with_capacity(TIMESTAMP_CHARS + ENTROPY_CHARS);
        let mut ts = millis;
        let mut ts_chars = [0u8; TIMESTAMP_CHARS];
        for slot in ts_chars.iter_mut().rev() {
            *slot = u8::try_from(ts % 64).unwrap_or(0);
            ts /= 64;
        }
        for idx in ts_chars {
            id.push(char::from(ALPHABET[usize::from(idx)]));
        }
        for idx in self.last_entropy {
            id.push(char::from(ALPHABET[usize::from(idx)]));
        }
        id
    }
}

/// Increment the entropy as a base-64 number, carrying left.
fn increment(entropy: &mut [u8; ENTROPY_CHARS]) {
    for slot in entropy.iter_mut().rev() {
        if *slot < 63 {
            *slot += 1;
            return;
        }
        *slot = 0;
    }
}
