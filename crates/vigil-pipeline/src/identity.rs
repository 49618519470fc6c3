//! Descriptor-based identity matching with aging.
//!
//! Tracks long-lived identities across frames by cosine similarity between
//! appearance descriptors.  Matched identities are blended (3:1
//! old-to-new exponential moving average over both descriptor and bounding
//! rect); identities that go 300 update cycles without a hit are removed.

use vigil_core::CropRect;

/// Appearance descriptor length produced by the re-id model.
pub const DESCRIPTOR_LEN: usize = 256;

/// Minimum cosine similarity for a match to be accepted.
pub const ACCEPT_SIMILARITY: f32 = 0.4;

/// An identity is removed after this many missed update cycles.
pub const IDENTITY_EXPIRY_MISSES: u32 = 300;

/// One tracked identity.
#[derive(Clone, Debug)]
pub struct Identity {
    pub id: u64,
    /// EMA-blended appearance descriptor.
    pub descriptor: Vec<f32>,
    /// EMA-smoothed bounding rect.
    pub rect: CropRect,
    pub hit_count: u32,
    pub miss_count: u32,
    pub successive_miss_count: u32,
    /// Whether this identity has already been surfaced downstream.
    pub shown: bool,
    hit_this_cycle: bool,
}

/// Result of matching one descriptor.
#[derive(Clone, Copy, Debug)]
pub struct MatchOutcome {
    pub id: u64,
    /// Best cosine similarity found, or 1.0 for a newly created identity.
    pub similarity: f32,
    pub newly_created: bool,
}

/// Rolling set of tracked identities.
#[derive(Debug, Default)]
pub struct IdentityMatcher {
    identities: Vec<Identity>,
    next_id: u64,
}

impl IdentityMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a descriptor against the tracked set.
    ///
    /// The best-similarity identity wins when it clears
    /// [`ACCEPT_SIMILARITY`]; its descriptor and rect are blended 3:1 and
    /// its hit counters updated.  Otherwise a fresh identity is created
    /// with `hit_count = 1`.
    pub fn match_descriptor(&mut self, rect: CropRect, descriptor: &[f32]) -> MatchOutcome {
        let mut best: Option<(usize, f32)> = None;
        for (index, identity) in self.identities.iter().enumerate() {
            let similarity = cosine_similarity(descriptor, &identity.descriptor);
            if best.is_none_or(|(_, s)| similarity > s) {
                best = Some((index, similarity));
            }
        }

        if let Some((index, similarity)) = best
            && similarity > ACCEPT_SIMILARITY
        {
            let identity = &mut self.identities[index];
            identity.rect = blend_rect(identity.rect, rect);
            for (old, new) in identity.descriptor.iter_mut().zip(descriptor) {
                *old = (*old * 3.0 + new) / 4.0;
            }
            identity.hit_count += 1;
            identity.successive_miss_count = 0;
            identity.hit_this_cycle = true;
            return MatchOutcome {
                id: identity.id,
                similarity,
                newly_created: false,
            };
        }

        let id = self.next_id;
        self.next_id += 1;
        self.identities.push(Identity {
            id,
            descriptor: descriptor.to_vec(),
            rect,
            hit_count: 1,
            miss_count: 0,
            successive_miss_count: 0,
            shown: false,
            hit_this_cycle: true,
        });
        MatchOutcome {
            id,
            similarity: 1.0,
            newly_created: true,
        }
    }

    /// One aging cycle, run once per processed frame: every identity not
    /// hit this cycle accrues a miss, and identities past the expiry
    /// threshold are permanently removed.
    pub fn age_step(&mut self) {
        self.identities.retain_mut(|identity| {
            if !identity.hit_this_cycle {
                identity.miss_count += 1;
                identity.successive_miss_count += 1;
            }
            identity.hit_this_cycle = false;
            identity.miss_count <= IDENTITY_EXPIRY_MISSES
        });
    }

    pub fn get(&self, id: u64) -> Option<&Identity> {
        self.identities.iter().find(|identity| identity.id == id)
    }

    pub fn is_shown(&self, id: u64) -> bool {
        self.get(id).map(|identity| identity.shown).unwrap_or(false)
    }

    pub fn mark_shown(&mut self, id: u64) {
        if let Some(identity) = self.identities.iter_mut().find(|i| i.id == id) {
            identity.shown = true;
        }
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

fn blend_rect(old: CropRect, new: CropRect) -> CropRect {
    CropRect {
        x: (old.x * 3 + new.x) / 4,
        y: (old.y * 3 + new.y) / 4,
        width: (old.width * 3 + new.width) / 4,
        height: (old.height * 3 + new.height) / 4,
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}
