use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::calendar_client::{fetch_events, CalendarClient, Event, Response};
use crate::error::{EngineError, EngineResult};
use crate::time_utils::{
    day_hour_key, format_hhmm, hour_key, minute_of_day, parse_hhmm, parse_weekday, to_local,
    weekday_index, weekday_name, HourRange, ALL_DAYS, WORKDAYS,
};

pub const DEFAULT_LOOKBACK_DAYS: u32 = 90;
pub const MAX_LOOKBACK_DAYS: u32 = 3650;

/// With fewer meetings than this no pattern is produced.
pub const MIN_SAMPLE_SIZE: usize = 1;

/// Productivity windows are cut into chunks of at most this many hours.
pub const PRODUCTIVITY_WINDOW_HOURS: usize = 2;

/// Hours scoring below this are too busy to be part of a productivity window.
const MIN_PRODUCTIVITY_SCORE: f64 = 50.0;

/// Share of a window's score that follows the day's acceptance rate.
pub const DAY_ACCEPTANCE_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AcceptancePatterns {
    pub by_day_of_week: BTreeMap<String, f64>,
    pub by_hour: BTreeMap<String, f64>,
    pub by_day_and_hour: BTreeMap<String, f64>,
    /// Decided (accepted or declined) responses per `"Monday-09:00"` bucket.
    pub samples_by_day_and_hour: BTreeMap<String, u32>,
    pub overall: f64,
    pub sample_size: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DurationStats {
    pub average_scheduled_minutes: f64,
    pub average_actual_minutes: f64,
    pub overrun_rate: f64,
    pub std_dev_minutes: f64,
    pub sample_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeBlock {
    pub day_of_week: String,
    pub start_time: String,
    pub end_time: String,
    pub score: f64,
}

impl TimeBlock {
    pub fn new(day: Weekday, start_minutes: u32, end_minutes: u32, score: f64) -> Self {
        Self {
            day_of_week: weekday_name(day).to_string(),
            start_time: format_hhmm(start_minutes),
            end_time: format_hhmm(end_minutes),
            score,
        }
    }

    pub fn weekday(&self) -> Option<Weekday> {
        parse_weekday(&self.day_of_week)
    }

    pub fn start_minutes(&self) -> u32 {
        parse_hhmm(&self.start_time).unwrap_or(0)
    }

    pub fn end_minutes(&self) -> u32 {
        parse_hhmm(&self.end_time).unwrap_or(0)
    }

    pub fn duration_minutes(&self) -> u32 {
        self.end_minutes().saturating_sub(self.start_minutes())
    }

    pub fn contains(&self, day: Weekday, minute: u32) -> bool {
        self.weekday() == Some(day) && minute >= self.start_minutes() && minute < self.end_minutes()
    }

    /// True when the local range `[start, end)` on `day` intersects this block.
    pub fn intersects(&self, day: Weekday, start_minutes: u32, end_minutes: u32) -> bool {
        self.weekday() == Some(day)
            && start_minutes < self.end_minutes()
            && end_minutes > self.start_minutes()
    }

    pub fn label(&self) -> String {
        format!("{} {}-{}", self.day_of_week, self.start_time, self.end_time)
    }
}

/// Start of a `days`-long history window ending at `end`.
pub fn lookback_start(end: DateTime<Utc>, days: u32) -> EngineResult<DateTime<Utc>> {
    if days > MAX_LOOKBACK_DAYS {
        return Err(EngineError::Configuration(format!(
            "lookback of {} days exceeds the {}-day limit",
            days, MAX_LOOKBACK_DAYS
        )));
    }
    end.checked_sub_signed(Duration::days(i64::from(days)))
        .ok_or_else(|| EngineError::Configuration(format!("lookback of {} days is out of range", days)))
}

/// Sorts blocks by score descending; equal scores go to the earlier start
/// time of day, then the earlier weekday.
pub fn rank_blocks(blocks: &mut [TimeBlock]) {
    blocks.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.start_minutes().cmp(&b.start_minutes()))
            .then_with(|| weekday_index(&a.day_of_week).cmp(&weekday_index(&b.day_of_week)))
    });
}

/// Behavioral model learned from one lookback window of calendar history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeetingPattern {
    pub analyzed_period: DateRange,
    pub timezone: Tz,
    pub acceptance: AcceptancePatterns,
    pub duration_stats: DurationStats,
    pub duration_by_participant: BTreeMap<String, DurationStats>,
    pub timezone_distribution: BTreeMap<String, u32>,
    /// Ranked by score, best first.
    pub productivity_blocks: Vec<TimeBlock>,
    pub meeting_density_by_day: BTreeMap<String, f64>,
    pub sample_size: usize,
}

impl MeetingPattern {
    pub fn local(&self, instant: DateTime<Utc>) -> DateTime<Tz> {
        to_local(instant, self.timezone)
    }

    pub fn day_acceptance(&self, day: Weekday) -> Option<f64> {
        self.acceptance.by_day_of_week.get(weekday_name(day)).copied()
    }

    pub fn hour_acceptance(&self, hour: u32) -> Option<f64> {
        self.acceptance.by_hour.get(&hour_key(hour)).copied()
    }

    pub fn bucket_samples(&self, day: Weekday, hour: u32) -> u32 {
        self.acceptance
            .samples_by_day_and_hour
            .get(&day_hour_key(day, hour))
            .copied()
            .unwrap_or(0)
    }

    pub fn density_for(&self, day: Weekday) -> f64 {
        self.meeting_density_by_day
            .get(weekday_name(day))
            .copied()
            .unwrap_or(0.0)
    }

    /// Best-ranked productivity window of each weekday, in Monday-first order.
    pub fn focus_blocks(&self) -> Vec<&TimeBlock> {
        let mut best: Vec<&TimeBlock> = Vec::new();
        for block in &self.productivity_blocks {
            if !best.iter().any(|b| b.day_of_week == block.day_of_week) {
                best.push(block);
            }
        }
        best.sort_by_key(|b| weekday_index(&b.day_of_week));
        best
    }

    pub fn in_productivity_block(&self, instant: DateTime<Utc>) -> bool {
        let local = self.local(instant);
        let minute = minute_of_day(&local);
        self.productivity_blocks
            .iter()
            .any(|block| block.contains(local.weekday(), minute))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    FocusTime,
    DeclinePattern,
    DurationAdjustment,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub priority: Priority,
    pub title: String,
    pub description: String,
    pub confidence: f64,
    pub action: String,
    pub impact: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeetingAnalysis {
    pub period: DateRange,
    pub total_meetings: usize,
    /// Absent when there was too little history to learn from.
    pub patterns: Option<MeetingPattern>,
    pub recommendations: Vec<Recommendation>,
    pub insights: Vec<String>,
}

impl MeetingAnalysis {
    fn empty(period: DateRange) -> Self {
        Self {
            period,
            total_meetings: 0,
            patterns: None,
            recommendations: Vec::new(),
            insights: vec!["No meetings found in the analyzed period.".to_string()],
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    accepted: u32,
    decided: u32,
}

impl Tally {
    fn record(&mut self, accepted: bool) {
        self.decided += 1;
        if accepted {
            self.accepted += 1;
        }
    }

    fn rate(&self) -> f64 {
        if self.decided == 0 {
            0.0
        } else {
            self.accepted as f64 / self.decided as f64
        }
    }
}

fn rates(tallies: &BTreeMap<String, Tally>) -> BTreeMap<String, f64> {
    tallies.iter().map(|(k, t)| (k.clone(), t.rate())).collect()
}

#[derive(Debug, Default)]
struct DurationAccumulator {
    scheduled_total: f64,
    actuals: Vec<f64>,
    overruns: u32,
}

impl DurationAccumulator {
    fn record(&mut self, scheduled: f64, actual: f64) {
        self.scheduled_total += scheduled;
        self.actuals.push(actual);
        if actual > scheduled {
            self.overruns += 1;
        }
    }

    fn finish(&self) -> DurationStats {
        let n = self.actuals.len();
        if n == 0 {
            return DurationStats::default();
        }
        let count = n as f64;
        let mean = self.actuals.iter().sum::<f64>() / count;
        let variance = self.actuals.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / count;

        DurationStats {
            average_scheduled_minutes: self.scheduled_total / count,
            average_actual_minutes: mean,
            overrun_rate: self.overruns as f64 / count,
            std_dev_minutes: variance.sqrt(),
            sample_size: n as u32,
        }
    }
}

pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Score of one working hour: 100 for an empty hour, 50 at average density,
/// falling to 0 at twice the average.
fn hour_score(density: f64, average: f64) -> f64 {
    if average <= 0.0 {
        return 100.0;
    }
    (100.0 - density / average * 50.0).clamp(0.0, 100.0)
}

/// Learns meeting behavior from calendar history.
pub struct PatternLearner {
    client: Arc<dyn CalendarClient>,
    working_hours: HourRange,
    timezone: Tz,
    user_email: Option<String>,
}

impl PatternLearner {
    pub fn new(client: Arc<dyn CalendarClient>) -> Self {
        Self {
            client,
            working_hours: HourRange::default(),
            timezone: Tz::UTC,
            user_email: None,
        }
    }

    pub fn with_working_hours(mut self, working_hours: HourRange) -> Self {
        self.working_hours = working_hours;
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_user_email(mut self, user_email: Option<String>) -> Self {
        self.user_email = user_email;
        self
    }

    pub fn client(&self) -> &Arc<dyn CalendarClient> {
        &self.client
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn working_hours(&self) -> HourRange {
        self.working_hours
    }

    /// Analyzes the last `days` days of history.
    pub async fn analyze_history(&self, grant_id: &str, days: u32) -> EngineResult<MeetingAnalysis> {
        let end = Utc::now();
        let start = lookback_start(end, days)?;
        self.analyze_period(grant_id, start, end).await
    }

    pub async fn analyze_period(
        &self,
        grant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EngineResult<MeetingAnalysis> {
        let period = DateRange { start, end };
        let events = fetch_events(self.client.as_ref(), grant_id, start, end).await?;

        if events.len() < MIN_SAMPLE_SIZE {
            log::info!("No meeting history between {} and {}", start, end);
            return Ok(MeetingAnalysis::empty(period));
        }

        log::info!("Learning patterns from {} meetings over {} days", events.len(), period.days());
        let patterns = self.learn_patterns(&events, period);
        let recommendations = generate_recommendations(&patterns);
        let insights = generate_insights(&patterns, events.len());

        Ok(MeetingAnalysis {
            period,
            total_meetings: events.len(),
            patterns: Some(patterns),
            recommendations,
            insights,
        })
    }

    pub fn learn_patterns(&self, events: &[Event], period: DateRange) -> MeetingPattern {
        let acceptance = self.learn_acceptance(events);
        let (duration_stats, duration_by_participant) = self.learn_durations(events);
        let productivity_blocks = self.learn_productivity(events, &acceptance);

        MeetingPattern {
            analyzed_period: period,
            timezone: self.timezone,
            duration_stats,
            duration_by_participant,
            timezone_distribution: learn_timezones(events),
            productivity_blocks,
            meeting_density_by_day: self.learn_density(events, period),
            sample_size: events.len(),
            acceptance,
        }
    }

    fn learn_acceptance(&self, events: &[Event]) -> AcceptancePatterns {
        let mut by_day: BTreeMap<String, Tally> = BTreeMap::new();
        let mut by_hour: BTreeMap<String, Tally> = BTreeMap::new();
        let mut by_bucket: BTreeMap<String, Tally> = BTreeMap::new();
        let mut overall = Tally::default();

        for event in events {
            let accepted = match event.response_for(self.user_email.as_deref()) {
                Response::Accepted => true,
                Response::Declined => false,
                Response::Pending => continue,
            };

            let local = to_local(event.start(), self.timezone);
            let (day, hour) = (local.weekday(), local.hour());

            by_day.entry(weekday_name(day).to_string()).or_default().record(accepted);
            by_hour.entry(hour_key(hour)).or_default().record(accepted);
            by_bucket.entry(day_hour_key(day, hour)).or_default().record(accepted);
            overall.record(accepted);
        }

        AcceptancePatterns {
            by_day_of_week: rates(&by_day),
            by_hour: rates(&by_hour),
            by_day_and_hour: rates(&by_bucket),
            samples_by_day_and_hour: by_bucket.iter().map(|(k, t)| (k.clone(), t.decided)).collect(),
            overall: overall.rate(),
            sample_size: overall.decided,
        }
    }

    fn learn_durations(&self, events: &[Event]) -> (DurationStats, BTreeMap<String, DurationStats>) {
        let mut overall = DurationAccumulator::default();
        let mut by_participant: BTreeMap<String, DurationAccumulator> = BTreeMap::new();

        for event in events.iter().filter(|e| !e.is_cancelled()) {
            let Some(actual) = event.actual_duration_minutes else {
                continue;
            };
            let scheduled = event.duration_minutes() as f64;
            let actual = f64::from(actual);
            overall.record(scheduled, actual);

            for participant in &event.participants {
                let is_self = self
                    .user_email
                    .as_deref()
                    .map_or(false, |me| participant.email.eq_ignore_ascii_case(me));
                if !is_self {
                    by_participant
                        .entry(participant.email.to_lowercase())
                        .or_default()
                        .record(scheduled, actual);
                }
            }
        }

        let per_participant = by_participant
            .iter()
            .map(|(email, acc)| (email.clone(), acc.finish()))
            .collect();
        (overall.finish(), per_participant)
    }

    fn learn_density(&self, events: &[Event], period: DateRange) -> BTreeMap<String, f64> {
        let weeks = (period.days() as f64 / 7.0).max(1.0);
        let mut counts: BTreeMap<String, u32> = BTreeMap::new();

        for event in events.iter().filter(|e| e.is_blocking()) {
            let day = to_local(event.start(), self.timezone).weekday();
            *counts.entry(weekday_name(day).to_string()).or_insert(0) += 1;
        }

        counts
            .into_iter()
            .map(|(day, count)| (day, round1(f64::from(count) / weeks)))
            .collect()
    }

    fn learn_productivity(&self, events: &[Event], acceptance: &AcceptancePatterns) -> Vec<TimeBlock> {
        let mut occupancy: HashMap<(Weekday, u32), u32> = HashMap::new();

        for event in events.iter().filter(|e| e.is_blocking()) {
            let start = to_local(event.start(), self.timezone);
            let end = to_local(event.end(), self.timezone);
            let end_minute = if end.date_naive() == start.date_naive() {
                minute_of_day(&end)
            } else {
                24 * 60
            };
            let first_hour = start.hour();
            let last_hour = ((end_minute + 59) / 60).clamp(first_hour + 1, 24);

            for hour in first_hour..last_hour {
                *occupancy.entry((start.weekday(), hour)).or_insert(0) += 1;
            }
        }

        let average = if occupancy.is_empty() {
            0.0
        } else {
            f64::from(occupancy.values().sum::<u32>()) / occupancy.len() as f64
        };

        let mut blocks = Vec::new();
        for day in WORKDAYS {
            let bonus = day_acceptance_bonus(acceptance, day);
            let mut run: Vec<(u32, f64)> = Vec::new();

            for hour in self.working_hours.hours() {
                let density = f64::from(occupancy.get(&(day, hour)).copied().unwrap_or(0));
                let score = hour_score(density, average);
                if score >= MIN_PRODUCTIVITY_SCORE {
                    run.push((hour, score));
                } else {
                    flush_run(day, &mut run, bonus, &mut blocks);
                }
            }
            flush_run(day, &mut run, bonus, &mut blocks);
        }

        rank_blocks(&mut blocks);
        blocks
    }
}

fn day_acceptance_bonus(acceptance: &AcceptancePatterns, day: Weekday) -> f64 {
    let rate = acceptance
        .by_day_of_week
        .get(weekday_name(day))
        .copied()
        .unwrap_or(1.0);
    1.0 - DAY_ACCEPTANCE_WEIGHT + DAY_ACCEPTANCE_WEIGHT * rate
}

/// Cuts a run of consecutive quiet hours into windows and appends them.
fn flush_run(day: Weekday, run: &mut Vec<(u32, f64)>, bonus: f64, blocks: &mut Vec<TimeBlock>) {
    for chunk in run.chunks(PRODUCTIVITY_WINDOW_HOURS) {
        if let (Some(first), Some(last)) = (chunk.first(), chunk.last()) {
            let mean = chunk.iter().map(|(_, score)| score).sum::<f64>() / chunk.len() as f64;
            let score = round1((mean * bonus).clamp(0.0, 100.0));
            blocks.push(TimeBlock::new(day, first.0 * 60, (last.0 + 1) * 60, score));
        }
    }
    run.clear();
}

fn learn_timezones(events: &[Event]) -> BTreeMap<String, u32> {
    let mut distribution = BTreeMap::new();
    for event in events.iter().filter(|e| !e.is_cancelled()) {
        *distribution.entry(event.timezone_label().to_string()).or_insert(0) += 1;
    }
    distribution
}

fn generate_recommendations(patterns: &MeetingPattern) -> Vec<Recommendation> {
    let mut recommendations = Vec::new();

    for block in patterns.focus_blocks() {
        if block.score < 70.0 {
            continue;
        }
        recommendations.push(Recommendation {
            kind: RecommendationKind::FocusTime,
            priority: if block.score >= 85.0 { Priority::High } else { Priority::Medium },
            title: format!("Block {} for focus work", block.label()),
            description: format!(
                "Meetings rarely land here ({:.0} productivity score)",
                block.score
            ),
            confidence: block.score,
            action: "Create a recurring focus block".to_string(),
            impact: format!("Protects {} minutes of deep work each week", block.duration_minutes()),
        });
    }

    for day in ALL_DAYS {
        let Some(rate) = patterns.day_acceptance(day) else {
            continue;
        };
        if rate < 0.5 {
            let name = weekday_name(day);
            recommendations.push(Recommendation {
                kind: RecommendationKind::DeclinePattern,
                priority: Priority::Medium,
                title: format!("Avoid scheduling meetings on {}s", name),
                description: format!("Only {:.0}% of {} meetings are accepted", rate * 100.0, name),
                confidence: round1((1.0 - rate) * 100.0),
                action: format!("Prefer other days over {}", name),
                impact: "Fewer declined invitations".to_string(),
            });
        }
    }

    for (email, stats) in &patterns.duration_by_participant {
        let overrun = stats.average_actual_minutes - stats.average_scheduled_minutes;
        if overrun > 5.0 {
            recommendations.push(Recommendation {
                kind: RecommendationKind::DurationAdjustment,
                priority: Priority::Low,
                title: format!("Schedule longer meetings with {}", email),
                description: format!("Meetings run {:.0} minutes over on average", overrun),
                confidence: 70.0,
                action: format!(
                    "Use {:.0} minutes as the default length",
                    stats.average_actual_minutes.round()
                ),
                impact: "Fewer overruns into the next meeting".to_string(),
            });
        }
    }

    recommendations
}

fn generate_insights(patterns: &MeetingPattern, total_meetings: usize) -> Vec<String> {
    let mut insights = Vec::new();

    let best_day = ALL_DAYS
        .iter()
        .filter_map(|day| patterns.day_acceptance(*day).map(|rate| (*day, rate)))
        .fold(None, |best: Option<(Weekday, f64)>, (day, rate)| match best {
            Some((_, best_rate)) if best_rate >= rate => best,
            _ => Some((day, rate)),
        });
    if let Some((day, rate)) = best_day {
        insights.push(format!(
            "{}s have the highest acceptance rate ({:.0}%)",
            weekday_name(day),
            rate * 100.0
        ));
    }

    if let Some(block) = patterns.productivity_blocks.first() {
        insights.push(format!("Your best focus window is {}", block.label()));
    }

    let common_zone = patterns
        .timezone_distribution
        .iter()
        .fold(None, |best: Option<(&String, u32)>, (zone, count)| match best {
            Some((_, best_count)) if best_count >= *count => best,
            _ => Some((zone, *count)),
        });
    if let Some((zone, count)) = common_zone {
        insights.push(format!("Most meetings are scheduled in {} ({} of {})", zone, count, total_meetings));
    }

    let durations = &patterns.duration_stats;
    if durations.sample_size > 0 && durations.overrun_rate > 0.3 {
        insights.push(format!(
            "{:.0}% of meetings run over their scheduled time",
            durations.overrun_rate * 100.0
        ));
    }

    insights.push(format!(
        "Analyzed {} meetings over {} days",
        total_meetings,
        patterns.analyzed_period.days()
    ));
    insights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar_client::{
        Calendar, CreateEventRequest, EventQuery, EventStatus, InMemoryCalendar, Participant,
        ParticipantStatus, UpdateEventRequest,
    };
    use anyhow::bail;
    use async_trait::async_trait;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn meeting(id: &str, start: &str, minutes: i64) -> Event {
        let start = utc(start);
        Event::new(id, id, start, start + Duration::minutes(minutes))
    }

    fn learner(events: Vec<Event>) -> PatternLearner {
        PatternLearner::new(Arc::new(InMemoryCalendar::with_events("work", events)))
    }

    fn january() -> DateRange {
        DateRange {
            start: utc("2025-01-01T00:00:00Z"),
            end: utc("2025-01-29T00:00:00Z"),
        }
    }

    #[tokio::test]
    async fn test_oversized_lookback_is_a_configuration_error() {
        let err = learner(Vec::new()).analyze_history("grant", u32::MAX).await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));

        let end = utc("2025-01-29T00:00:00Z");
        assert_eq!(lookback_start(end, 28).unwrap(), utc("2025-01-01T00:00:00Z"));
        assert!(lookback_start(end, MAX_LOOKBACK_DAYS).is_ok());
        assert!(lookback_start(end, MAX_LOOKBACK_DAYS + 1).is_err());
        assert!(lookback_start(DateTime::<Utc>::MIN_UTC, 1).is_err());
    }

    #[tokio::test]
    async fn test_zero_meetings_yields_no_pattern() {
        let period = january();
        let analysis = learner(Vec::new())
            .analyze_period("grant", period.start, period.end)
            .await
            .unwrap();

        assert!(analysis.patterns.is_none());
        assert_eq!(analysis.total_meetings, 0);
        assert_eq!(analysis.insights, vec!["No meetings found in the analyzed period."]);
    }

    #[tokio::test]
    async fn test_acceptance_excludes_pending_responses() {
        let me = |status| vec![Participant::new("me@example.com").with_status(status)];
        let events = vec![
            meeting("a", "2025-01-06T09:00:00Z", 30).with_participants(me(ParticipantStatus::Yes)),
            meeting("b", "2025-01-13T09:00:00Z", 30).with_participants(me(ParticipantStatus::No)),
            meeting("c", "2025-01-13T10:00:00Z", 30).with_participants(me(ParticipantStatus::Maybe)),
            meeting("d", "2025-01-07T09:00:00Z", 30).with_participants(me(ParticipantStatus::Yes)),
        ];
        let period = january();
        let analysis = learner(events)
            .with_user_email(Some("me@example.com".to_string()))
            .analyze_period("grant", period.start, period.end)
            .await
            .unwrap();

        let patterns = analysis.patterns.unwrap();
        let acceptance = &patterns.acceptance;
        assert_eq!(analysis.total_meetings, 4);
        assert_eq!(acceptance.by_day_of_week["Monday"], 0.5);
        assert_eq!(acceptance.by_day_of_week["Tuesday"], 1.0);
        assert!((acceptance.by_hour["09:00"] - 2.0 / 3.0).abs() < 1e-9);
        assert!(!acceptance.by_hour.contains_key("10:00"));
        assert_eq!(acceptance.samples_by_day_and_hour["Monday-09:00"], 2);
        assert_eq!(acceptance.sample_size, 3);

        let all_rates = acceptance
            .by_day_of_week
            .values()
            .chain(acceptance.by_hour.values())
            .chain(acceptance.by_day_and_hour.values())
            .chain(std::iter::once(&acceptance.overall));
        for rate in all_rates {
            assert!((0.0..=1.0).contains(rate));
        }
    }

    #[test]
    fn test_duration_stats_only_use_observed_meetings() {
        let events = vec![
            meeting("a", "2025-01-06T09:00:00Z", 30).with_actual_duration(45),
            meeting("b", "2025-01-07T09:00:00Z", 60).with_actual_duration(50),
            meeting("c", "2025-01-08T09:00:00Z", 60),
            meeting("d", "2025-01-09T09:00:00Z", 30)
                .with_actual_duration(90)
                .with_status(EventStatus::Cancelled),
        ];
        let patterns = learner(Vec::new()).learn_patterns(&events, january());
        let stats = &patterns.duration_stats;

        assert_eq!(stats.sample_size, 2);
        assert_eq!(stats.average_scheduled_minutes, 45.0);
        assert_eq!(stats.average_actual_minutes, 47.5);
        assert_eq!(stats.overrun_rate, 0.5);
        assert!(stats.average_actual_minutes > stats.average_scheduled_minutes);
    }

    #[test]
    fn test_duration_by_participant_skips_self() {
        let events = vec![meeting("a", "2025-01-06T09:00:00Z", 30)
            .with_actual_duration(45)
            .with_participants(vec![
                Participant::new("me@example.com"),
                Participant::new("Alex@Example.com"),
            ])];
        let patterns = learner(Vec::new())
            .with_user_email(Some("me@example.com".to_string()))
            .learn_patterns(&events, january());

        assert_eq!(patterns.duration_by_participant.len(), 1);
        assert_eq!(patterns.duration_by_participant["alex@example.com"].average_actual_minutes, 45.0);
    }

    #[test]
    fn test_timezone_distribution_defaults_to_utc() {
        let mut berlin = meeting("a", "2025-01-06T09:00:00Z", 30);
        berlin.when.start_timezone = Some("Europe/Berlin".to_string());
        let events = vec![berlin, meeting("b", "2025-01-07T09:00:00Z", 30), meeting("c", "2025-01-08T09:00:00Z", 30)];

        let patterns = learner(Vec::new()).learn_patterns(&events, january());
        assert_eq!(patterns.timezone_distribution["UTC"], 2);
        assert_eq!(patterns.timezone_distribution["Europe/Berlin"], 1);
    }

    #[test]
    fn test_density_is_meetings_per_week_day() {
        let events = vec![
            meeting("a", "2025-01-06T09:00:00Z", 30),
            meeting("b", "2025-01-06T11:00:00Z", 30),
            meeting("c", "2025-01-13T09:00:00Z", 30),
            meeting("d", "2025-01-20T09:00:00Z", 30),
            meeting("e", "2025-01-08T09:00:00Z", 30).with_busy(false),
        ];
        let patterns = learner(Vec::new()).learn_patterns(&events, january());

        assert_eq!(patterns.density_for(Weekday::Mon), 1.0);
        assert_eq!(patterns.density_for(Weekday::Wed), 0.0);
    }

    fn busy_mondays() -> Vec<Event> {
        let mut events: Vec<Event> = ["2025-01-06", "2025-01-13", "2025-01-20", "2025-01-27"]
            .iter()
            .enumerate()
            .map(|(i, date)| meeting(&format!("standup-{}", i), &format!("{}T09:00:00Z", date), 120))
            .collect();
        events.push(meeting("review", "2025-01-07T14:00:00Z", 60));
        events
    }

    #[test]
    fn test_productivity_blocks_avoid_busy_hours_and_are_ranked() {
        let patterns = learner(Vec::new()).learn_patterns(&busy_mondays(), january());
        let blocks = &patterns.productivity_blocks;

        assert_eq!(blocks[0].label(), "Tuesday 09:00-11:00");
        assert_eq!(blocks[1].label(), "Wednesday 09:00-11:00");
        assert!(!blocks
            .iter()
            .any(|b| b.day_of_week == "Monday" && b.start_minutes() < 11 * 60));
        assert!(blocks.windows(2).all(|w| w[0].score >= w[1].score));

        let tuesday_afternoon = blocks.iter().find(|b| b.label() == "Tuesday 13:00-15:00").unwrap();
        assert!((tuesday_afternoon.score - 91.7).abs() < 1e-9);
        assert_eq!(blocks.last().unwrap().label(), "Tuesday 13:00-15:00");

        for block in blocks {
            assert!(block.start_minutes() >= 9 * 60 && block.end_minutes() <= 17 * 60);
            assert!(block.duration_minutes() <= 120);
        }
    }

    #[test]
    fn test_rank_blocks_prefers_earlier_start_on_ties() {
        let block = |day: &str, start: &str, end: &str, score: f64| TimeBlock {
            day_of_week: day.to_string(),
            start_time: start.to_string(),
            end_time: end.to_string(),
            score,
        };
        let mut blocks = vec![
            block("Monday", "11:00", "13:00", 100.0),
            block("Tuesday", "13:00", "15:00", 91.7),
            block("Wednesday", "09:00", "11:00", 100.0),
            block("Tuesday", "09:00", "11:00", 100.0),
        ];
        rank_blocks(&mut blocks);

        let labels: Vec<String> = blocks.iter().map(|b| b.label()).collect();
        assert_eq!(
            labels,
            vec![
                "Tuesday 09:00-11:00",
                "Wednesday 09:00-11:00",
                "Monday 11:00-13:00",
                "Tuesday 13:00-15:00",
            ]
        );
    }

    #[test]
    fn test_productivity_blocks_follow_working_hours() {
        let patterns = learner(Vec::new())
            .with_working_hours(HourRange::new(10, 13).unwrap())
            .learn_patterns(&busy_mondays(), january());

        let wednesday: Vec<String> = patterns
            .productivity_blocks
            .iter()
            .filter(|b| b.day_of_week == "Wednesday")
            .map(|b| b.label())
            .collect();
        assert_eq!(wednesday, vec!["Wednesday 10:00-12:00", "Wednesday 12:00-13:00"]);
    }

    #[test]
    fn test_focus_blocks_pick_best_window_per_day() {
        let patterns = learner(Vec::new()).learn_patterns(&busy_mondays(), january());
        let focus: Vec<String> = patterns.focus_blocks().iter().map(|b| b.label()).collect();

        assert_eq!(focus.len(), 5);
        assert_eq!(focus[0], "Monday 11:00-13:00");
        assert_eq!(focus[1], "Tuesday 09:00-11:00");
        assert!(patterns.in_productivity_block(utc("2025-01-08T09:30:00Z")));
        assert!(!patterns.in_productivity_block(utc("2025-01-06T09:30:00Z")));
    }

    #[test]
    fn test_low_acceptance_day_yields_decline_recommendation() {
        let events = vec![
            meeting("a", "2025-01-10T09:00:00Z", 30).with_status(EventStatus::Cancelled),
            meeting("b", "2025-01-17T09:00:00Z", 30).with_status(EventStatus::Cancelled),
            meeting("c", "2025-01-24T09:00:00Z", 30),
            meeting("d", "2025-01-07T09:00:00Z", 30),
        ];
        let patterns = learner(Vec::new()).learn_patterns(&events, january());
        let recommendations = generate_recommendations(&patterns);

        let decline: Vec<&Recommendation> = recommendations
            .iter()
            .filter(|r| r.kind == RecommendationKind::DeclinePattern)
            .collect();
        assert_eq!(decline.len(), 1);
        assert_eq!(decline[0].title, "Avoid scheduling meetings on Fridays");
        assert!(recommendations.iter().any(|r| r.kind == RecommendationKind::FocusTime));
    }

    #[tokio::test]
    async fn test_analysis_insights_mention_period() {
        let period = january();
        let analysis = learner(busy_mondays())
            .analyze_period("grant", period.start, period.end)
            .await
            .unwrap();

        assert_eq!(analysis.total_meetings, 5);
        assert_eq!(analysis.insights.last().unwrap(), "Analyzed 5 meetings over 28 days");
        assert!(analysis
            .insights
            .iter()
            .any(|i| i == "Your best focus window is Tuesday 09:00-11:00"));
    }

    struct BrokenCalendars;

    #[async_trait]
    impl CalendarClient for BrokenCalendars {
        async fn get_calendars(&self, _grant_id: &str) -> anyhow::Result<Vec<Calendar>> {
            bail!("401 unauthorized")
        }
        async fn get_events(&self, _g: &str, _c: &str, _q: &EventQuery) -> anyhow::Result<Vec<Event>> {
            Ok(Vec::new())
        }
        async fn get_event(&self, _g: &str, _c: &str, _e: &str) -> anyhow::Result<Event> {
            bail!("unused")
        }
        async fn create_event(&self, _g: &str, _c: &str, _r: &CreateEventRequest) -> anyhow::Result<Event> {
            bail!("unused")
        }
        async fn update_event(&self, _g: &str, _c: &str, _e: &str, _r: &UpdateEventRequest) -> anyhow::Result<Event> {
            bail!("unused")
        }
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates() {
        let learner = PatternLearner::new(Arc::new(BrokenCalendars));
        let err = learner.analyze_history("grant", 30).await.unwrap_err();
        assert!(err.is_upstream());
    }
}
