use chrono::{DateTime, Duration, Utc};

use crate::models::{RecallState, ReviewTopic};

/// Tunable constants for the pass/fail SM-2 recurrence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SrsConfig {
    pub ease_floor: f64,
    /// SM-2 itself has no upper bound; we cap growth at the classic starting ease.
    pub ease_ceiling: f64,
    pub ease_bonus: f64,
    pub ease_penalty: f64,
    pub initial_ease: f64,
    pub first_interval_days: u32,
    pub second_interval_days: u32,
    pub lapse_interval_days: u32,
    /// Upper bound for any scheduled interval.
    pub max_interval_days: u32,
}

impl Default for SrsConfig {
    fn default() -> Self {
        Self {
            ease_floor: 1.3,
            ease_ceiling: 2.5,
            ease_bonus: 0.1,
            ease_penalty: 0.2,
            initial_ease: 2.5,
            first_interval_days: 1,
            second_interval_days: 6,
            lapse_interval_days: 1,
            max_interval_days: 36_500,
        }
    }
}

impl SrsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.ease_floor.is_finite() && self.ease_floor > 0.0,
            "ease floor must be a positive number, got {}",
            self.ease_floor
        );
        anyhow::ensure!(
            self.ease_ceiling.is_finite() && self.ease_ceiling >= self.ease_floor,
            "ease ceiling {} must not be below the floor {}",
            self.ease_ceiling,
            self.ease_floor
        );
        anyhow::ensure!(
            self.ease_bonus.is_finite() && self.ease_bonus >= 0.0,
            "ease bonus must be >= 0, got {}",
            self.ease_bonus
        );
        anyhow::ensure!(
            self.ease_penalty.is_finite() && self.ease_penalty >= 0.0,
            "ease penalty must be >= 0, got {}",
            self.ease_penalty
        );
        anyhow::ensure!(
            self.max_interval_days >= 1
                && self.max_interval_days >= self.first_interval_days
                && self.max_interval_days >= self.second_interval_days
                && self.max_interval_days >= self.lapse_interval_days,
            "max interval {} must be at least 1 and cover the fixed intervals",
            self.max_interval_days
        );
        Ok(())
    }

    /// Brings a stored ease back into `[floor, ceiling]`; NaN falls to the floor.
    pub fn clamp_ease(&self, ease: f64) -> f64 {
        if ease.is_nan() {
            return self.ease_floor;
        }
        ease.clamp(self.ease_floor, self.ease_ceiling)
    }
}

/// New schedule for a topic after one evaluated review.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleUpdate {
    pub interval_days: u32,
    pub ease_factor: f64,
    pub next_review_date: DateTime<Utc>,
}

/// Calculates the next review interval and ease factor from a pass/fail recall.
///
/// Pass:
/// - ease grows by `ease_bonus`, capped at `ease_ceiling`
/// - interval is 1 day, then 6 days, then `round(prior_interval * new_ease)`
/// - interval never exceeds `max_interval_days`
///
/// Fail:
/// - ease drops by `ease_penalty`, never below `ease_floor`
/// - interval resets to `lapse_interval_days`
///
/// `now` is passed in so identical inputs always give identical outputs.
pub fn calculate_next_review(
    config: &SrsConfig,
    passed: bool,
    prior_interval_days: u32,
    prior_ease: f64,
    prior_reviews_completed: u32,
    now: DateTime<Utc>,
) -> ScheduleUpdate {
    let prior_ease = config.clamp_ease(prior_ease);

    let (interval_days, ease_factor) = if passed {
        let ease = config.clamp_ease(prior_ease + config.ease_bonus);
        let interval = match prior_reviews_completed {
            0 => config.first_interval_days,
            1 => config.second_interval_days,
            _ => {
                let grown = (prior_interval_days as f64 * ease).round();
                // Never shrink on a pass, and never schedule a pass for today.
                (grown.min(u32::MAX as f64) as u32).max(prior_interval_days).max(1)
            }
        };
        (interval, ease)
    } else {
        let ease = config.clamp_ease(prior_ease - config.ease_penalty);
        (config.lapse_interval_days, ease)
    };
    let interval_days = interval_days.min(config.max_interval_days.max(1));

    ScheduleUpdate {
        interval_days,
        ease_factor,
        next_review_date: due_after(now, interval_days),
    }
}

fn due_after(now: DateTime<Utc>, interval_days: u32) -> DateTime<Utc> {
    now.checked_add_signed(Duration::days(i64::from(interval_days)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Applies one evaluated review to a topic, returning the rescheduled copy.
pub fn apply_review(config: &SrsConfig, topic: &ReviewTopic, passed: bool, now: DateTime<Utc>) -> ReviewTopic {
    let update = calculate_next_review(
        config,
        passed,
        topic.interval_days,
        topic.ease_factor,
        topic.reviews_completed,
        now,
    );

    let mut next = topic.clone();
    next.interval_days = update.interval_days;
    next.ease_factor = update.ease_factor;
    next.next_review_date = update.next_review_date;
    next.reviews_completed = topic.reviews_completed.saturating_add(1);
    next.recall_state = RecallState::from_outcome(passed);
    next
}
