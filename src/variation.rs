//! Deterministic weighted choice among a message's text variations.
//!
//! The choice for a recipient depends only on its position in the campaign,
//! so a resumed or re-run campaign sends every recipient the same variation.

use crate::model::{VariationKind, VariationUsed};

pub const DEFAULT_ORIGINAL_WEIGHT: f64 = 0.25;

/// Map a position to a value in `[0, 1)`.
///
/// The position is folded to 32 bits, stepped through a Weyl increment and
/// then avalanched with xorshift/multiply rounds. All arithmetic wraps, so
/// the output is identical on every platform.
pub fn position_hash(global_index: u64) -> f64 {
    let mut h = (global_index ^ (global_index >> 32)) as u32;
    h = h.wrapping_mul(0x9E37_79B1).wrapping_add(0x7F4A_7C15);
    h ^= h >> 16;
    h = h.wrapping_mul(0x85EB_CA6B);
    h ^= h >> 13;
    h = h.wrapping_mul(0xC2B2_AE35);
    h ^= h >> 16;
    h as f64 / 4_294_967_296.0
}

#[derive(Debug, Clone, Copy)]
pub struct VariationSelector {
    original_weight: f64,
}

impl Default for VariationSelector {
    fn default() -> Self {
        Self::new(DEFAULT_ORIGINAL_WEIGHT)
    }
}

impl VariationSelector {
    /// `original_weight` is clamped to `[0, 1]`.
    pub fn new(original_weight: f64) -> Self {
        Self {
            original_weight: original_weight.clamp(0.0, 1.0),
        }
    }

    /// Pick an index in `0..candidates`. Index 0 (the original) gets
    /// `original_weight`; the rest share the remainder evenly.
    pub fn select_index(&self, candidates: usize, global_index: u64) -> usize {
        if candidates <= 1 {
            return 0;
        }
        let x = position_hash(global_index);
        let mut threshold = self.original_weight;
        if x < threshold {
            return 0;
        }
        let share = (1.0 - self.original_weight) / (candidates - 1) as f64;
        for index in 1..candidates {
            threshold += share;
            if x < threshold {
                return index;
            }
        }
        // Rounding can leave x just above the final threshold.
        candidates - 1
    }

    /// Select among `candidates` and describe the choice for the delivery
    /// log. Returns `None` as the audit record when there is only one text.
    pub fn select<'a>(
        &self,
        candidates: &[&'a str],
        global_index: u64,
    ) -> (&'a str, Option<VariationUsed>) {
        let index = self.select_index(candidates.len(), global_index);
        let text = candidates.get(index).copied().unwrap_or("");
        if candidates.len() <= 1 {
            return (text, None);
        }
        let kind = if index == 0 {
            VariationKind::Original
        } else {
            VariationKind::Paraphrase
        };
        (
            text,
            Some(VariationUsed {
                index,
                content: text.to_string(),
                kind,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_candidate_is_always_original() {
        let selector = VariationSelector::default();
        for i in 0..10_000 {
            assert_eq!(selector.select_index(1, i), 0);
        }
        let (text, used) = selector.select(&["only"], 7);
        assert_eq!(text, "only");
        assert!(used.is_none());
    }

    #[test]
    fn original_frequency_converges_to_weight() {
        let selector = VariationSelector::default();
        let mut counts = [0usize; 5];
        for i in 0..10_000u64 {
            counts[selector.select_index(5, i)] += 1;
        }
        let original = counts[0] as f64 / 10_000.0;
        assert!((original - 0.25).abs() <= 0.02, "original share {original}");
        for (index, count) in counts.iter().enumerate().skip(1) {
            let share = *count as f64 / 10_000.0;
            assert!((share - 0.1875).abs() <= 0.02, "index {index} share {share}");
        }
    }

    #[test]
    fn selection_is_deterministic() {
        let a = VariationSelector::new(0.4);
        let b = VariationSelector::new(0.4);
        for i in [0u64, 1, 2, 99, 12_345, u64::MAX] {
            assert_eq!(a.select_index(7, i), b.select_index(7, i));
            assert_eq!(position_hash(i), position_hash(i));
        }
    }

    #[test]
    fn hash_stays_in_unit_interval() {
        for i in (0..1_000_000u64).step_by(997) {
            let x = position_hash(i);
            assert!((0.0..1.0).contains(&x));
        }
    }

    #[test]
    fn full_weight_pins_original() {
        let selector = VariationSelector::new(1.0);
        for i in 0..1_000 {
            assert_eq!(selector.select_index(3, i), 0);
        }
    }

    #[test]
    fn audit_record_names_kind() {
        let selector = VariationSelector::new(0.0);
        let (text, used) = selector.select(&["a", "b"], 3);
        let used = used.unwrap();
        assert_eq!(used.index, 1);
        assert_eq!(used.kind, VariationKind::Paraphrase);
        assert_eq!(text, "b");
        assert_eq!(used.content, "b");
    }
}
