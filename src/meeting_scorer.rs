use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::pattern_learner::MeetingPattern;
use crate::time_utils::{hour_key, minute_of_day, weekday_name};

const NEUTRAL_SCORE: i32 = 50;

/// Points an acceptance rate of 1.0 (or 0.0) adds to (or removes from) the score.
const ACCEPTANCE_WEIGHT: f64 = 40.0;
const SUCCESS_WEIGHT: f64 = 20.0;
const OVERRUN_WEIGHT: f64 = 10.0;
const LONG_RUNNING_PENALTY: i32 = 5;
const FOCUS_PENALTY: i32 = 10;

/// Bucket samples needed for full confidence.
const CONFIDENT_SAMPLES: f64 = 10.0;

pub const MAX_ALTERNATIVES: usize = 3;
const ALTERNATIVE_THRESHOLD: u8 = 70;
const ALTERNATIVE_SEARCH_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreFactor {
    pub name: String,
    pub description: String,
    pub impact: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeetingScore {
    pub score: u8,
    /// Percent, driven by how many decided responses the day/hour bucket holds.
    pub confidence: f64,
    pub success_rate: f64,
    pub factors: Vec<ScoreFactor>,
    pub recommendation: String,
    pub alternative_times: Vec<DateTime<Utc>>,
}

impl MeetingScore {
    /// Neutral score used when no pattern could be learned.
    pub fn without_history() -> Self {
        Self {
            score: NEUTRAL_SCORE as u8,
            confidence: 0.0,
            success_rate: 0.0,
            factors: Vec::new(),
            recommendation: "No historical data available for scoring".to_string(),
            alternative_times: Vec::new(),
        }
    }
}

/// Rates candidate times purely from a learned pattern. Never touches the calendar.
pub struct MeetingScorer<'a> {
    patterns: &'a MeetingPattern,
}

impl<'a> MeetingScorer<'a> {
    pub fn new(patterns: &'a MeetingPattern) -> Self {
        Self { patterns }
    }

    pub fn score_meeting_time(
        &self,
        time: DateTime<Utc>,
        participants: &[String],
        duration_minutes: u32,
    ) -> MeetingScore {
        let mut result = self.evaluate(time, participants, duration_minutes);
        if result.score < ALTERNATIVE_THRESHOLD {
            result.alternative_times = self.alternatives(time, participants, duration_minutes, result.score);
        }
        result
    }

    fn evaluate(&self, time: DateTime<Utc>, participants: &[String], duration_minutes: u32) -> MeetingScore {
        let factors = self.factors(time, participants, duration_minutes);
        let total = NEUTRAL_SCORE + factors.iter().map(|f| f.impact).sum::<i32>();
        let score = total.clamp(0, 100) as u8;

        MeetingScore {
            score,
            confidence: self.confidence(time),
            success_rate: self.patterns.acceptance.overall,
            recommendation: recommendation(score, &factors),
            factors,
            alternative_times: Vec::new(),
        }
    }

    fn factors(&self, time: DateTime<Utc>, participants: &[String], duration_minutes: u32) -> Vec<ScoreFactor> {
        let patterns = self.patterns;
        let local = patterns.local(time);
        let mut factors = Vec::new();

        if let Some(rate) = patterns.day_acceptance(local.weekday()) {
            factors.push(ScoreFactor {
                name: "Day Preference".to_string(),
                description: format!(
                    "{:.0}% acceptance rate on {}s",
                    rate * 100.0,
                    weekday_name(local.weekday())
                ),
                impact: ((rate - 0.5) * ACCEPTANCE_WEIGHT).round() as i32,
            });
        }

        if let Some(rate) = patterns.hour_acceptance(local.hour()) {
            factors.push(ScoreFactor {
                name: "Time Preference".to_string(),
                description: format!("{:.0}% acceptance rate at {}", rate * 100.0, hour_key(local.hour())),
                impact: ((rate - 0.5) * ACCEPTANCE_WEIGHT).round() as i32,
            });
        }

        let durations = &patterns.duration_stats;
        if durations.sample_size > 0 {
            let mut impact = -(durations.overrun_rate * OVERRUN_WEIGHT).round() as i32;
            if durations.average_actual_minutes > f64::from(duration_minutes) {
                impact -= LONG_RUNNING_PENALTY;
            }
            factors.push(ScoreFactor {
                name: "Overrun Risk".to_string(),
                description: format!(
                    "{:.0}% of meetings overrun, averaging {:.0} minutes",
                    durations.overrun_rate * 100.0,
                    durations.average_actual_minutes
                ),
                impact,
            });
        }

        let minute = minute_of_day(&local);
        if let Some(block) = patterns
            .focus_blocks()
            .into_iter()
            .find(|b| b.contains(local.weekday(), minute))
        {
            factors.push(ScoreFactor {
                name: "Focus Time".to_string(),
                description: format!("Falls inside your {} focus window", block.label()),
                impact: -FOCUS_PENALTY,
            });
        }

        let long_running: Vec<&String> = participants
            .iter()
            .filter(|email| {
                patterns
                    .duration_by_participant
                    .get(&email.to_lowercase())
                    .map_or(false, |stats| stats.average_actual_minutes > f64::from(duration_minutes))
            })
            .collect();
        if let Some(first) = long_running.first() {
            factors.push(ScoreFactor {
                name: "Participant Match".to_string(),
                description: format!("Meetings with {} usually run longer than {} minutes", first, duration_minutes),
                impact: -LONG_RUNNING_PENALTY,
            });
        }

        let acceptance = &patterns.acceptance;
        if acceptance.sample_size > 0 {
            factors.push(ScoreFactor {
                name: "Success Rate".to_string(),
                description: format!("{:.0}% of invitations accepted overall", acceptance.overall * 100.0),
                impact: ((acceptance.overall - 0.5) * SUCCESS_WEIGHT).round() as i32,
            });
        }

        factors
    }

    fn confidence(&self, time: DateTime<Utc>) -> f64 {
        let local = self.patterns.local(time);
        let samples = f64::from(self.patterns.bucket_samples(local.weekday(), local.hour()));
        ((samples / CONFIDENT_SAMPLES).min(1.0) * 100.0).round()
    }

    /// Same local time on each of the next days, keeping only slots that
    /// score higher than `baseline`.
    fn alternatives(
        &self,
        original: DateTime<Utc>,
        participants: &[String],
        duration_minutes: u32,
        baseline: u8,
    ) -> Vec<DateTime<Utc>> {
        let timezone = self.patterns.timezone;
        let local = self.patterns.local(original);
        let mut better: Vec<(u8, DateTime<Utc>)> = Vec::new();

        for offset in 1..=ALTERNATIVE_SEARCH_DAYS {
            let Some(date) = local.date_naive().checked_add_signed(Duration::days(offset)) else {
                break;
            };
            let Some(candidate) = timezone
                .from_local_datetime(&date.and_time(local.time()))
                .earliest()
                .map(|t| t.with_timezone(&Utc))
            else {
                continue;
            };
            let score = self.evaluate(candidate, participants, duration_minutes).score;
            if score > baseline {
                better.push((score, candidate));
            }
        }

        better.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        better.into_iter().take(MAX_ALTERNATIVES).map(|(_, time)| time).collect()
    }
}

fn recommendation(score: u8, factors: &[ScoreFactor]) -> String {
    match score {
        85..=100 => "Excellent time - highly recommended based on historical patterns".to_string(),
        70..=84 => "Good time - aligns well with your preferences".to_string(),
        50..=69 => "Acceptable time - consider alternatives if available".to_string(),
        _ => {
            let worst = factors
                .iter()
                .filter(|f| f.impact < 0)
                .fold(None, |worst: Option<&ScoreFactor>, f| match worst {
                    Some(w) if w.impact <= f.impact => Some(w),
                    _ => Some(f),
                });
            match worst {
                Some(factor) => format!(
                    "Not recommended - {} is suboptimal. Consider alternative times.",
                    factor.name
                ),
                None => "Not recommended - consider alternative times".to_string(),
            }
        }
    }
}
