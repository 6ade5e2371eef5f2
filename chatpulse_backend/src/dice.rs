use rand::seq::SliceRandom;
use rand::Rng;

/// Source of randomness for scheduling and turn-taking decisions.
pub trait Dice: Send + Sync {
    /// True with the given probability (clamped to `[0, 1]`).
    fn chance(&self, probability: f64) -> bool;
    /// Uniform sample from `[low, high]`; returns `low` when the range is empty.
    fn uniform(&self, low: f64, high: f64) -> f64;
    fn shuffle(&self, items: &mut [String]);
    fn pick(&self, len: usize) -> Option<usize>;
}

pub struct ThreadDice;

impl Dice for ThreadDice {
    fn chance(&self, probability: f64) -> bool {
        if !probability.is_finite() || probability <= 0.0 {
            return false;
        }
        rand::thread_rng().gen_bool(probability.min(1.0))
    }

    fn uniform(&self, low: f64, high: f64) -> f64 {
        if !(high > low) || !low.is_finite() || !high.is_finite() {
            return low;
        }
        rand::thread_rng().gen_range(low..=high)
    }

    fn shuffle(&self, items: &mut [String]) {
        items.shuffle(&mut rand::thread_rng());
    }

    fn pick(&self, len: usize) -> Option<usize> {
        (len > 0).then(|| rand::thread_rng().gen_range(0..len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_dice_respects_degenerate_bounds() {
        let dice = ThreadDice;
        assert!(!dice.chance(0.0));
        assert!(!dice.chance(f64::NAN));
        assert!(dice.chance(1.5));
        assert_eq!(dice.uniform(4.0, 4.0), 4.0);
        assert_eq!(dice.uniform(9.0, 2.0), 9.0);
        assert_eq!(dice.uniform(1.0, f64::INFINITY), 1.0);
        assert_eq!(dice.pick(0), None);

        for _ in 0..100 {
            let sample = dice.uniform(1.0, 2.0);
            assert!((1.0..=2.0).contains(&sample));
            assert!(dice.pick(3).expect("non-empty") < 3);
        }
    }
}
