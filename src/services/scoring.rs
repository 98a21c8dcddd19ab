use serde::{Deserialize, Serialize};

use crate::models::{Difficulty, ScoreBreakdown};

/// Scoring rule tables. Defaults match the platform rules; deployments can
/// override them through configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub base_points: [i64; 3],
    pub speed_bonus: [i64; 3],
    pub speed_window_ms: u32,
    /// Streak bonus kicks in at `streak_floor`, table indexed by
    /// `min(streak, streak_cap)`.
    pub streak_floor: u32,
    pub streak_cap: u32,
    pub streak_bonus: [i64; 4],
    pub retry_multiplier: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_points: [100, 150, 200],
            speed_bonus: [30, 40, 50],
            speed_window_ms: 5_000,
            streak_floor: 4,
            streak_cap: 7,
            streak_bonus: [15, 25, 35, 50],
            retry_multiplier: 0.5,
        }
    }
}

impl ScoringConfig {
    fn difficulty_index(difficulty: Difficulty) -> usize {
        match difficulty {
            Difficulty::Easy => 0,
            Difficulty::Medium => 1,
            Difficulty::Hard => 2,
        }
    }

    pub fn base_for(&self, difficulty: Difficulty) -> i64 {
        self.base_points[Self::difficulty_index(difficulty)]
    }

    pub fn speed_bonus_for(&self, difficulty: Difficulty) -> i64 {
        self.speed_bonus[Self::difficulty_index(difficulty)]
    }

    pub fn streak_bonus_for(&self, streak: u32) -> i64 {
        if streak < self.streak_floor {
            return 0;
        }
        let capped = streak.min(self.streak_cap);
        self.streak_bonus[(capped - self.streak_floor) as usize]
    }
}

/// Pure attempt-to-points function. No IO, no state: everything it needs
/// arrives as arguments, and the full breakdown goes back out for audit.
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn compute(
        &self,
        difficulty: Difficulty,
        is_correct: bool,
        response_time_ms: u32,
        current_streak: u32,
        attempt_index: u8,
    ) -> ScoreBreakdown {
        if !is_correct {
            return ScoreBreakdown::zero();
        }

        let base = self.config.base_for(difficulty);
        let speed_bonus = if response_time_ms <= self.config.speed_window_ms {
            self.config.speed_bonus_for(difficulty)
        } else {
            0
        };
        let streak_bonus = self.config.streak_bonus_for(current_streak);

        let multiplier = if attempt_index >= 2 {
            self.config.retry_multiplier
        } else {
            1.0
        };
        let subtotal = base + speed_bonus + streak_bonus;
        let total = ((subtotal as f64) * multiplier).floor() as i64;

        ScoreBreakdown {
            base,
            speed_bonus,
            streak_bonus,
            multiplier,
            total,
        }
    }

    /// Full-credit potential of one question: first attempt, inside the
    /// speed window, no streak. This is the per-question term of
    /// `max_points` when normalizing a quiz score.
    pub fn max_points_for(&self, difficulty: Difficulty) -> i64 {
        self.config.base_for(difficulty) + self.config.speed_bonus_for(difficulty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_medium_within_speed_window() {
        let engine = ScoringEngine::default();
        let breakdown = engine.compute(Difficulty::Medium, true, 3000, 0, 1);
        assert_eq!(breakdown.base, 150);
        assert_eq!(breakdown.speed_bonus, 40);
        assert_eq!(breakdown.streak_bonus, 0);
        assert_eq!(breakdown.total, 190);
    }

    #[test]
    fn incorrect_answer_scores_zero_everywhere() {
        let engine = ScoringEngine::default();
        let breakdown = engine.compute(Difficulty::Hard, false, 100, 6, 1);
        assert_eq!(breakdown, ScoreBreakdown::zero());
    }

    #[test]
    fn speed_window_boundary_is_inclusive() {
        let engine = ScoringEngine::default();
        assert_eq!(engine.compute(Difficulty::Easy, true, 5000, 0, 1).speed_bonus, 30);
        assert_eq!(engine.compute(Difficulty::Easy, true, 5001, 0, 1).speed_bonus, 0);
    }

    #[test]
    fn streak_bonus_table() {
        let engine = ScoringEngine::default();
        assert_eq!(engine.config().streak_bonus_for(3), 0);
        assert_eq!(engine.config().streak_bonus_for(4), 15);
        assert_eq!(engine.config().streak_bonus_for(5), 25);
        assert_eq!(engine.config().streak_bonus_for(6), 35);
        assert_eq!(engine.config().streak_bonus_for(7), 50);
        // Capped beyond 7
        assert_eq!(engine.config().streak_bonus_for(12), 50);
    }

    #[test]
    fn retry_penalty_halves_and_floors() {
        let engine = ScoringEngine::default();
        // 150 + 40 = 190 -> 95 on the retry
        let breakdown = engine.compute(Difficulty::Medium, true, 4000, 0, 2);
        assert_eq!(breakdown.multiplier, 0.5);
        assert_eq!(breakdown.total, 95);

        // Odd subtotal floors: 150 + 40 + 15 = 205 -> 102
        let with_streak = engine.compute(Difficulty::Medium, true, 4000, 4, 2);
        assert_eq!(with_streak.total, 102);
    }

    #[test]
    fn max_points_is_base_plus_speed() {
        let engine = ScoringEngine::default();
        assert_eq!(engine.max_points_for(Difficulty::Easy), 130);
        assert_eq!(engine.max_points_for(Difficulty::Medium), 190);
        assert_eq!(engine.max_points_for(Difficulty::Hard), 250);
    }
}
