//! Wraparound-safe arithmetic over 16-bit tick counters.
//!
//! Ticks wrap every 65536 steps (about 18 minutes at 60 Hz), so ordering two
//! ticks by raw subtraction breaks at the wrap. Every tick comparison in the
//! workspace goes through [`sequence_diff`], which maps the distance into the
//! signed half-range window around the older value.

/// A wrapping simulation tick.
pub type Tick = u16;

const RANGE: i32 = 1 << 16;
const HALF_RANGE: i32 = RANGE / 2;

/// Signed distance from `older` to `newer`.
///
/// Computed as `((newer - older + 1.5 * 65536) mod 65536) - 0.5 * 65536`.
/// Positive means `newer` is later than `older`. The result lies in
/// `-32768..=32767`; ticks exactly half the range apart both report `-32768`.
pub fn sequence_diff(newer: Tick, older: Tick) -> i32 {
    ((i32::from(newer) - i32::from(older) + RANGE + HALF_RANGE) % RANGE) - HALF_RANGE
}

/// Returns `true` if `a` is strictly later than `b`.
pub fn sequence_greater_than(a: Tick, b: Tick) -> bool {
    sequence_diff(a, b) > 0
}

/// Returns `true` if `a` is strictly earlier than `b`.
pub fn sequence_less_than(a: Tick, b: Tick) -> bool {
    sequence_diff(a, b) < 0
}

/// Interpolates between two ticks along the shorter wrapping path:
/// `a + floor(sequence_diff(b, a) * t) mod 65536`.
pub fn lerp_sequence(a: Tick, b: Tick, t: f32) -> Tick {
    let step = (sequence_diff(b, a) as f32 * t).floor() as i32;
    (i32::from(a) + step).rem_euclid(RANGE) as Tick
}
