//! Server-side lag compensation.
//!
//! Every compensated entity keeps a fixed-depth ring with one snapshot of
//! its lag-compensated fields per tick. While the server handles a player's
//! action, [`LagCompensation::enable`] rewinds every other compensated
//! entity to what that player was seeing, and
//! [`LagCompensation::disable`] puts the present back.

use rustc_hash::FxHashMap;
use tether_net::{PlayerId, Tick, lerp_sequence, sequence_diff};

use crate::entity::{EntityId, EntityState};
use crate::schema::ClassDescriptor;

/// What a player reported it was rendering: the two bracketing server ticks
/// and the fraction between them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagWindow {
    pub state_a: Tick,
    pub state_b: Tick,
    pub fraction: f32,
}

/// Clamps `requested` into `[now - depth, now)`.
pub fn clamp_history_tick(requested: Tick, now: Tick, depth: u16) -> Tick {
    let oldest = now.wrapping_sub(depth);
    if sequence_diff(requested, oldest) < 0 {
        oldest
    } else if sequence_diff(requested, now) >= 0 {
        now.wrapping_sub(1)
    } else {
        requested
    }
}

// ---------------------------------------------------------------------------
// LagHistory
// ---------------------------------------------------------------------------

/// Ring of per-tick snapshots of one entity's lag-compensated fields.
#[derive(Debug)]
pub struct LagHistory {
    fields: Vec<usize>,
    snapshot_size: usize,
    ticks: Vec<Option<Tick>>,
    data: Vec<u8>,
    mask: usize,
}

impl LagHistory {
    /// A ring of `depth` snapshots (rounded up to a power of two), or `None`
    /// if the class has no lag-compensated field.
    pub fn new(class: &ClassDescriptor, depth: u16) -> Option<Self> {
        let fields: Vec<usize> = class
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| f.flags.lag_compensated)
            .map(|(i, _)| i)
            .collect();
        if fields.is_empty() {
            return None;
        }
        let depth = usize::from(depth.max(1)).next_power_of_two();
        let snapshot_size = fields.iter().map(|&i| class.fields()[i].size).sum();
        Some(Self {
            fields,
            snapshot_size,
            ticks: vec![None; depth],
            data: vec![0; depth * snapshot_size],
            mask: depth - 1,
        })
    }

    pub fn depth(&self) -> usize {
        self.ticks.len()
    }

    fn slot(&self, tick: Tick) -> usize {
        usize::from(tick) & self.mask
    }

    /// Copies the compensated fields of `state` into the slot for `tick`.
    pub fn record(&mut self, tick: Tick, state: &EntityState) {
        let slot = self.slot(tick);
        let start = slot * self.snapshot_size;
        let snapshot = self.extract(state);
        self.data[start..start + self.snapshot_size].copy_from_slice(&snapshot);
        self.ticks[slot] = Some(tick);
    }

    /// The snapshot recorded for exactly `tick`, if still in the ring.
    pub fn snapshot(&self, tick: Tick) -> Option<&[u8]> {
        let slot = self.slot(tick);
        if self.ticks[slot] != Some(tick) {
            return None;
        }
        let start = slot * self.snapshot_size;
        Some(&self.data[start..start + self.snapshot_size])
    }

    /// The compensated fields of `state`, concatenated.
    fn extract(&self, state: &EntityState) -> Vec<u8> {
        let class = state.class();
        let mut out = Vec::with_capacity(self.snapshot_size);
        for &i in &self.fields {
            out.extend_from_slice(&state.data()[class.field_range(i)]);
        }
        out
    }

    /// Copies a snapshot back into `state` byte for byte.
    fn restore(&self, state: &mut EntityState, snapshot: &[u8]) {
        let class = state.class().clone();
        let mut at = 0;
        for &i in &self.fields {
            let range = class.field_range(i);
            let len = range.len();
            state.data_mut()[range].copy_from_slice(&snapshot[at..at + len]);
            at += len;
        }
    }

    /// Writes a snapshot blended between `a` and `b` into `state`.
    fn apply(&self, state: &mut EntityState, a: &[u8], b: &[u8], fraction: f32) {
        let class = state.class().clone();
        let mut at = 0;
        for &i in &self.fields {
            let field = &class.fields()[i];
            let range = class.field_range(i);
            let (from, to) = (&a[at..at + field.size], &b[at..at + field.size]);
            let out = &mut state.data_mut()[range];
            match field.interpolate {
                Some(interpolate) => interpolate(from, to, fraction, out),
                None => out.copy_from_slice(from),
            }
            at += field.size;
        }
    }
}

// ---------------------------------------------------------------------------
// LagCompensation
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Active {
    player: PlayerId,
    saved: FxHashMap<EntityId, Vec<u8>>,
}

/// Enable/disable pairing and the present-time values saved while rewound.
#[derive(Debug, Default)]
pub struct LagCompensation {
    active: Option<Active>,
}

impl LagCompensation {
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// The player the world is currently rewound for.
    pub fn active_player(&self) -> Option<PlayerId> {
        self.active.as_ref().map(|a| a.player)
    }

    /// Rewinds every compensated entity not owned by `player` to `window`.
    ///
    /// Both window ticks are clamped into the history range. Entities with
    /// no snapshot for the older tick are left alone. Returns the number of
    /// entities rewound, or `None` if compensation was already active.
    pub fn enable<'a>(
        &mut self,
        player: PlayerId,
        window: LagWindow,
        now: Tick,
        depth: u16,
        entities: impl Iterator<Item = (EntityId, PlayerId, &'a mut EntityState, &'a LagHistory)>,
    ) -> Option<usize> {
        if self.active.is_some() {
            return None;
        }
        let tick_a = clamp_history_tick(window.state_a, now, depth);
        let mut tick_b = clamp_history_tick(window.state_b, now, depth);
        if sequence_diff(tick_b, tick_a) < 0 {
            tick_b = tick_a;
        }
        let fraction = window.fraction.clamp(0.0, 1.0);
        tracing::trace!(
            player,
            tick_a,
            tick_b,
            approx = lerp_sequence(tick_a, tick_b, fraction),
            "lag compensation enabled"
        );

        let mut saved = FxHashMap::default();
        for (id, owner, state, history) in entities {
            if owner == player {
                continue;
            }
            let Some(a) = history.snapshot(tick_a) else {
                continue;
            };
            let b = history.snapshot(tick_b).unwrap_or(a);
            saved.insert(id, history.extract(state));
            history.apply(state, a, b, fraction);
        }
        let rewound = saved.len();
        self.active = Some(Active { player, saved });
        Some(rewound)
    }

    /// Restores every entity rewound by [`enable`](Self::enable). A no-op if
    /// compensation is not active.
    pub fn disable<'a>(
        &mut self,
        entities: impl Iterator<Item = (EntityId, &'a mut EntityState, &'a LagHistory)>,
    ) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        for (id, state, history) in entities {
            if let Some(saved) = active.saved.remove(&id) {
                history.restore(state, &saved);
            }
        }
        if !active.saved.is_empty() {
            tracing::debug!(
                missing = active.saved.len(),
                "rewound entities vanished before restore"
            );
        }
    }
}
