//! Action selection on top of policy scores.

use pl_core::config::{ExplorationConfig, StrategyKind};
use pl_core::argmax;
use rand::Rng;

/// Chosen action and whether it matches the argmax of the scores it was chosen from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Choice {
    pub action: u8,
    pub was_greedy: bool,
}

/// Closed set of exploration strategies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Exploration {
    /// Evaluation runs.
    Greedy,
    /// Uniform random action with probability `epsilon`, argmax otherwise.
    EpsilonGreedy { epsilon: f32 },
    /// Sample from `softmax(scores / tau)`.
    Boltzmann { tau: f32 },
}

impl Exploration {
    /// Strategy in force at `progress` simulated steps.
    pub fn from_config(cfg: &ExplorationConfig, progress: u64) -> Self {
        match cfg.strategy {
            StrategyKind::Greedy => Exploration::Greedy,
            StrategyKind::EpsilonGreedy => Exploration::EpsilonGreedy {
                epsilon: cfg.epsilon.value_at(progress).clamp(0.0, 1.0),
            },
            StrategyKind::Boltzmann => Exploration::Boltzmann {
                tau: cfg.tau.value_at(progress),
            },
        }
    }

    pub fn is_greedy(&self) -> bool {
        matches!(self, Exploration::Greedy)
    }

    pub fn choose_action<R: Rng>(&self, scores: &[f32], rng: &mut R) -> Choice {
        let n = scores.len().max(1);
        let greedy = argmax(scores);
        let action = match (*self, greedy) {
            // Nothing usable in the scores: any action is as good as another.
            (_, None) => rng.gen_range(0..n) as u8,
            (Exploration::Greedy, Some(g)) => g,
            (Exploration::EpsilonGreedy { epsilon }, Some(g)) => {
                if rng.gen::<f32>() < epsilon {
                    rng.gen_range(0..n) as u8
                } else {
                    g
                }
            }
            (Exploration::Boltzmann { tau }, Some(g)) => {
                if tau > 0.0 {
                    sample_softmax(scores, tau, rng).unwrap_or(g)
                } else {
                    g
                }
            }
        };
        Choice {
            action,
            was_greedy: greedy == Some(action),
        }
    }
}

fn sample_softmax<R: Rng>(scores: &[f32], tau: f32, rng: &mut R) -> Option<u8> {
    let max = scores
        .iter()
        .copied()
        .filter(|s| !s.is_nan())
        .fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f64> = scores
        .iter()
        .map(|&s| {
            if s.is_nan() {
                0.0
            } else {
                (((s - max) / tau) as f64).exp()
            }
        })
        .collect();
    let total: f64 = weights.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return None;
    }
    let mut u = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        if u < *w {
            return Some(i as u8);
        }
        u -= w;
    }
    weights.iter().rposition(|w| *w > 0.0).map(|i| i as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pl_core::{Schedule, A};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn scores() -> Vec<f32> {
        let mut s = vec![0.0f32; A];
        s[7] = 1.0;
        s
    }

    #[test]
    fn greedy_always_takes_argmax() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..100 {
            let c = Exploration::Greedy.choose_action(&scores(), &mut rng);
            assert_eq!(c, Choice { action: 7, was_greedy: true });
        }
    }

    #[test]
    fn epsilon_one_explores_and_flags_non_greedy() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let e = Exploration::EpsilonGreedy { epsilon: 1.0 };
        let mut non_greedy = 0;
        for _ in 0..200 {
            let c = e.choose_action(&scores(), &mut rng);
            assert!((c.action as usize) < A);
            assert_eq!(c.was_greedy, c.action == 7);
            if !c.was_greedy {
                non_greedy += 1;
            }
        }
        assert!(non_greedy > 100);
    }

    #[test]
    fn cold_boltzmann_is_greedy_and_hot_is_spread() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let cold = Exploration::Boltzmann { tau: 1e-4 };
        for _ in 0..50 {
            assert_eq!(cold.choose_action(&scores(), &mut rng).action, 7);
        }
        let hot = Exploration::Boltzmann { tau: 100.0 };
        let mut seen = [false; A];
        for _ in 0..500 {
            seen[hot.choose_action(&scores(), &mut rng).action as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn from_config_reads_schedule_at_progress() {
        let cfg = ExplorationConfig {
            strategy: StrategyKind::EpsilonGreedy,
            epsilon: Schedule::PiecewiseLinear {
                points: vec![(0, 1.0), (100, 0.0)],
            },
            ..ExplorationConfig::default()
        };
        assert_eq!(
            Exploration::from_config(&cfg, 50),
            Exploration::EpsilonGreedy { epsilon: 0.5 }
        );
    }
}
