use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::calendar_client::{
    fetch_events, Calendar, CalendarClient, CreateEventRequest, Event, EventWhen, UpdateEventRequest,
};
use crate::conflict_resolver::{OVERLOAD_FLOOR, OVERLOAD_MULTIPLIER};
use crate::error::{EngineError, EngineResult};
use crate::pattern_learner::{
    lookback_start, round1, DateRange, DurationStats, MeetingAnalysis, MeetingPattern, PatternLearner,
    TimeBlock, DEFAULT_LOOKBACK_DAYS, MAX_LOOKBACK_DAYS,
};
use crate::time_utils::{
    format_hhmm, hour_key, local_instant, minute_of_day, next_occurrence, parse_hhmm, parse_weekday,
    ranges_overlap, to_local, weekday_name, HourRange, ALL_DAYS, WORKDAYS,
};

pub const FOCUS_EVENT_TITLE: &str = "Focus Time";
pub const WEEKLY_RECURRENCE: &str = "RRULE:FREQ=WEEKLY";
const DECLINE_MESSAGE: &str = "This time is blocked for focus work. Alternative times are available.";

/// Days ahead the adaptive scheduler looks at.
pub const ADAPTIVE_WINDOW_DAYS: i64 = 14;
pub const MAX_ADAPTIVE_CHANGES: usize = 5;

/// Daily meeting limit used for overload when no pattern is available.
const DEFAULT_DAILY_MEETING_LIMIT: f64 = 6.0;
/// Meetings with at most this many participants are cheap to move.
const LOW_PRIORITY_PARTICIPANTS: usize = 2;
const DEADLINE_PROTECT_BLOCKS: usize = 3;
const LOW_ACCEPTANCE_RATE: f64 = 0.5;
const HIGH_ACCEPTANCE_RATE: f64 = 0.7;

const PROTECTION_LOOKAHEAD_DAYS: i64 = 7;
const HIGH_DENSITY_MEETINGS: f64 = 5.0;
const PEAK_BLOCK_COUNT: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

impl TimeRange {
    pub fn bounds(&self) -> EngineResult<(u32, u32)> {
        let (start, end) = (parse_hhmm(&self.start)?, parse_hhmm(&self.end)?);
        if start >= end {
            return Err(EngineError::Configuration(format!(
                "time range {}-{} ends before it starts",
                self.start, self.end
            )));
        }
        Ok((start, end))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FocusTimeSettings {
    pub enabled: bool,
    pub target_hours_per_week: f64,
    /// Minutes.
    pub min_block_duration: u32,
    /// Minutes; 0 disables the cap.
    pub max_block_duration: u32,
    /// Days never used for focus blocks.
    pub protected_days: Vec<String>,
    pub excluded_time_ranges: Vec<TimeRange>,
    pub auto_decline: bool,
    pub allow_urgent_override: bool,
    pub require_approval: bool,
    pub lookback_days: u32,
}

impl Default for FocusTimeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            target_hours_per_week: 14.0,
            min_block_duration: 60,
            max_block_duration: 180,
            protected_days: Vec::new(),
            excluded_time_ranges: Vec::new(),
            auto_decline: false,
            allow_urgent_override: true,
            require_approval: false,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }
}

impl FocusTimeSettings {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.target_hours_per_week.is_finite() || self.target_hours_per_week < 0.0 {
            return Err(EngineError::Configuration(
                "target_hours_per_week must be a non-negative number".to_string(),
            ));
        }
        if self.min_block_duration == 0 {
            return Err(EngineError::Configuration(
                "min_block_duration must be at least one minute".to_string(),
            ));
        }
        if self.max_block_duration > 0 && self.min_block_duration > self.max_block_duration {
            return Err(EngineError::Configuration(format!(
                "min_block_duration ({}) exceeds max_block_duration ({})",
                self.min_block_duration, self.max_block_duration
            )));
        }
        if self.lookback_days > MAX_LOOKBACK_DAYS {
            return Err(EngineError::Configuration(format!(
                "lookback_days must be at most {}",
                MAX_LOOKBACK_DAYS
            )));
        }
        for day in &self.protected_days {
            if parse_weekday(day).is_none() {
                return Err(EngineError::Configuration(format!("unknown day '{}'", day)));
            }
        }
        for range in &self.excluded_time_ranges {
            range.bounds()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FocusTimeBlock {
    pub day_of_week: String,
    pub start_time: String,
    pub end_time: String,
    /// Minutes.
    pub duration: u32,
    pub score: f64,
    pub reason: String,
}

impl FocusTimeBlock {
    pub fn weekday(&self) -> Option<Weekday> {
        parse_weekday(&self.day_of_week)
    }

    pub fn label(&self) -> String {
        format!("{} {}-{}", self.day_of_week, self.start_time, self.end_time)
    }

    /// Next weekly occurrence of this block after `now`.
    pub fn next_window(&self, now: DateTime<Utc>, timezone: Tz) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let day = self.weekday()?;
        let start_minutes = parse_hhmm(&self.start_time).ok()?;
        let start = next_occurrence(now, day, start_minutes, timezone)?;
        Some((start, start + Duration::minutes(i64::from(self.duration))))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeepWorkStats {
    pub average_minutes: f64,
    pub longest_minutes: u32,
    pub shortest_minutes: u32,
}

impl Default for DeepWorkStats {
    fn default() -> Self {
        Self {
            average_minutes: 120.0,
            longest_minutes: 150,
            shortest_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FocusAnalysis {
    pub analyzed_period: DateRange,
    pub generated_at: DateTime<Utc>,
    pub peak_productivity: Vec<TimeBlock>,
    pub deep_work_sessions: DeepWorkStats,
    pub most_productive_day: Option<String>,
    pub least_productive_day: Option<String>,
    pub recommended_blocks: Vec<FocusTimeBlock>,
    pub current_protection_hours: f64,
    pub target_protection_hours: f64,
    pub insights: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtectionRules {
    pub auto_decline: bool,
    pub allow_urgent_override: bool,
    pub require_approval: bool,
    pub suggest_alternatives: bool,
    pub decline_message: String,
}

impl ProtectionRules {
    fn from_settings(settings: &FocusTimeSettings) -> Self {
        Self {
            auto_decline: settings.auto_decline,
            allow_urgent_override: settings.allow_urgent_override,
            require_approval: settings.require_approval,
            suggest_alternatives: true,
            decline_message: DECLINE_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtectedFocusBlock {
    pub id: String,
    pub calendar_event_id: String,
    pub calendar_id: String,
    pub block: FocusTimeBlock,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub recurrence: String,
    pub protection_rules: ProtectionRules,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockFailure {
    pub block: FocusTimeBlock,
    pub error: String,
}

/// Result of materializing focus blocks. Blocks are created one by one, so a
/// failure leaves the blocks created before it in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProtectionOutcome {
    pub created: Vec<ProtectedFocusBlock>,
    pub failures: Vec<BlockFailure>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveTrigger {
    MeetingOverload,
    DeadlineChange,
    FocusTimeAtRisk,
    ConflictDetected,
    PatternDetected,
}

impl fmt::Display for AdaptiveTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdaptiveTrigger::MeetingOverload => "meeting overload",
            AdaptiveTrigger::DeadlineChange => "deadline change",
            AdaptiveTrigger::FocusTimeAtRisk => "focus time at risk",
            AdaptiveTrigger::ConflictDetected => "conflict detected",
            AdaptiveTrigger::PatternDetected => "pattern detected",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Reschedule,
    Protect,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Change {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<String>,
    pub action: ChangeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_end_time: Option<DateTime<Utc>>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdaptiveImpact {
    pub focus_time_gained_hours: f64,
    pub meetings_rescheduled: usize,
    pub meetings_declined: usize,
    pub conflicts_resolved: usize,
    pub participants_affected: usize,
    pub risks: Vec<String>,
    pub predicted_benefit: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// Proposed modifications to the upcoming schedule. Nothing is applied until
/// `apply_schedule_change` is called.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleChange {
    pub id: String,
    pub generated_at: DateTime<Utc>,
    pub trigger: AdaptiveTrigger,
    pub reason: String,
    pub affected_events: Vec<String>,
    pub changes: Vec<Change>,
    pub impact: AdaptiveImpact,
    pub confidence: f64,
    pub approval_status: ApprovalStatus,
    pub auto_applied: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppliedChanges {
    pub updated: Vec<Event>,
    pub created: Vec<Event>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DurationOptimization {
    pub event_id: String,
    pub current_duration: u32,
    pub recommended_duration: u32,
    pub historical_data: DurationStats,
    pub time_savings: u32,
    pub confidence: f64,
    pub reason: String,
    pub recommendation: String,
}

/// Picks focus blocks from the learned productivity windows, best first,
/// until the weekly target is reached.
pub fn recommend_blocks(patterns: &MeetingPattern, settings: &FocusTimeSettings) -> Vec<FocusTimeBlock> {
    let protected: Vec<Weekday> = settings
        .protected_days
        .iter()
        .filter_map(|d| parse_weekday(d))
        .collect();
    let excluded: Vec<(u32, u32)> = settings
        .excluded_time_ranges
        .iter()
        .filter_map(|r| r.bounds().ok())
        .collect();

    let target_minutes = (settings.target_hours_per_week * 60.0).round() as u32;
    let mut selected = Vec::new();
    let mut total = 0;

    for block in &patterns.productivity_blocks {
        if total >= target_minutes {
            break;
        }
        let Some(day) = block.weekday() else {
            continue;
        };
        if protected.contains(&day) {
            continue;
        }
        let (start, end) = (block.start_minutes(), block.end_minutes());
        if excluded.iter().any(|&(s, e)| ranges_overlap(start, end, s, e)) {
            continue;
        }

        let mut duration = block.duration_minutes();
        if duration < settings.min_block_duration {
            continue;
        }
        if settings.max_block_duration > 0 && duration > settings.max_block_duration {
            duration = settings.max_block_duration;
        }

        total += duration;
        selected.push(FocusTimeBlock {
            day_of_week: block.day_of_week.clone(),
            start_time: block.start_time.clone(),
            end_time: format_hhmm(start + duration),
            duration,
            score: block.score,
            reason: format!("Peak productivity time ({:.0}% score)", block.score),
        });
    }
    selected
}

/// Duration advice from observed meeting lengths.
pub fn recommend_duration(event_id: &str, current: u32, stats: &DurationStats) -> DurationOptimization {
    let average = stats.average_actual_minutes;
    let recommended = if current == 60 && average < 50.0 {
        45
    } else if current == 30 && average < 25.0 {
        25
    } else {
        average.round().max(1.0) as u32
    };
    let savings = current.saturating_sub(recommended);

    let recommendation = if savings > 0 {
        format!(
            "Reduce from {} to {} minutes to save {} minutes",
            current, recommended, savings
        )
    } else if recommended > current {
        format!("Extend from {} to {} minutes to avoid overruns", current, recommended)
    } else {
        format!("Keep the current {}-minute duration", current)
    };

    let confidence = match stats.std_dev_minutes {
        d if d < 10.0 => 90.0,
        d if d < 20.0 => 75.0,
        d if d < 30.0 => 60.0,
        _ => 45.0,
    };

    DurationOptimization {
        event_id: event_id.to_string(),
        current_duration: current,
        recommended_duration: recommended,
        historical_data: stats.clone(),
        time_savings: savings,
        confidence,
        reason: format!("Historical data shows meetings average {:.0} minutes", average),
        recommendation,
    }
}

fn deep_work_stats(patterns: &MeetingPattern) -> DeepWorkStats {
    let durations: Vec<u32> = patterns
        .focus_blocks()
        .iter()
        .map(|b| b.duration_minutes())
        .filter(|d| *d > 0)
        .collect();

    match (durations.iter().max(), durations.iter().min()) {
        (Some(&longest), Some(&shortest)) => DeepWorkStats {
            average_minutes: round1(f64::from(durations.iter().sum::<u32>()) / durations.len() as f64),
            longest_minutes: longest,
            shortest_minutes: shortest,
        },
        _ => DeepWorkStats::default(),
    }
}

/// Workdays with the lowest and highest meeting density.
fn productive_days(patterns: &MeetingPattern) -> (Option<String>, Option<String>) {
    if patterns.meeting_density_by_day.is_empty() {
        return (None, None);
    }
    let mut most = WORKDAYS[0];
    let mut least = WORKDAYS[0];
    for day in WORKDAYS {
        if patterns.density_for(day) < patterns.density_for(most) {
            most = day;
        }
        if patterns.density_for(day) > patterns.density_for(least) {
            least = day;
        }
    }
    (
        Some(weekday_name(most).to_string()),
        Some(weekday_name(least).to_string()),
    )
}

fn focus_confidence(patterns: &MeetingPattern) -> f64 {
    let mut confidence: f64 = 50.0;
    if !patterns.productivity_blocks.is_empty() {
        confidence += 20.0;
    }
    if !patterns.meeting_density_by_day.is_empty() {
        confidence += 15.0;
    }
    if patterns.sample_size > 10 {
        confidence += 15.0;
    }
    confidence.min(100.0)
}

fn focus_insights(
    patterns: &MeetingPattern,
    blocks: &[FocusTimeBlock],
    settings: &FocusTimeSettings,
    current_hours: f64,
) -> Vec<String> {
    let mut insights = Vec::new();

    if let Some(top) = patterns.productivity_blocks.first() {
        insights.push(format!(
            "Your peak productivity is {} ({:.0} focus score)",
            top.label(),
            top.score
        ));
    }

    let busy_days: Vec<&str> = ALL_DAYS
        .iter()
        .filter(|day| patterns.density_for(**day) > HIGH_DENSITY_MEETINGS)
        .map(|day| weekday_name(*day))
        .collect();
    if !busy_days.is_empty() {
        insights.push(format!(
            "High meeting density on {} - consider protecting more focus time on these days",
            busy_days.join(", ")
        ));
    }

    let total_hours = f64::from(blocks.iter().map(|b| b.duration).sum::<u32>()) / 60.0;
    if total_hours > 0.0 {
        insights.push(format!(
            "Recommended {:.1} hours/week of protected focus time across {} blocks",
            total_hours,
            blocks.len()
        ));
    }
    if total_hours < settings.target_hours_per_week {
        insights.push(format!(
            "Need {:.1} more hours/week to reach your target of {:.1} hours",
            settings.target_hours_per_week - total_hours,
            settings.target_hours_per_week
        ));
    }
    if current_hours > 0.0 {
        insights.push(format!(
            "{:.1} hours of focus time already protected in the next 7 days",
            current_hours
        ));
    }
    insights
}

fn is_focus_event(event: &Event) -> bool {
    event.title.eq_ignore_ascii_case(FOCUS_EVENT_TITLE)
}

fn is_movable(event: &Event) -> bool {
    !event.read_only && !is_focus_event(event)
}

fn focus_event_request(
    description: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    timezone: Tz,
    recurrence: Vec<String>,
) -> CreateEventRequest {
    let mut when = EventWhen::between(start, end);
    when.start_timezone = Some(timezone.name().to_string());
    when.end_timezone = Some(timezone.name().to_string());

    CreateEventRequest {
        title: FOCUS_EVENT_TITLE.to_string(),
        description: Some(description.to_string()),
        when,
        busy: true,
        participants: Vec::new(),
        recurrence,
    }
}

/// Focus-time analysis, block protection and trigger-driven schedule adaptation.
pub struct FocusOptimizer {
    learner: PatternLearner,
    lookback_days: u32,
}

impl FocusOptimizer {
    pub fn new(learner: PatternLearner) -> Self {
        Self {
            learner,
            lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }

    /// History window used by adaptation and duration optimization.
    pub fn with_lookback_days(mut self, days: u32) -> Self {
        self.lookback_days = days;
        self
    }

    fn client(&self) -> &dyn CalendarClient {
        self.learner.client().as_ref()
    }

    async fn learn(&self, grant_id: &str, days: u32, now: DateTime<Utc>) -> EngineResult<MeetingAnalysis> {
        self.learner
            .analyze_period(grant_id, lookback_start(now, days)?, now)
            .await
    }

    pub async fn analyze_focus_time_patterns(
        &self,
        grant_id: &str,
        settings: &FocusTimeSettings,
    ) -> EngineResult<FocusAnalysis> {
        self.analyze_focus_time_patterns_at(grant_id, settings, Utc::now()).await
    }

    pub async fn analyze_focus_time_patterns_at(
        &self,
        grant_id: &str,
        settings: &FocusTimeSettings,
        now: DateTime<Utc>,
    ) -> EngineResult<FocusAnalysis> {
        settings.validate()?;
        let analysis = self.learn(grant_id, settings.lookback_days, now).await?;

        let Some(patterns) = analysis.patterns.as_ref() else {
            return Ok(FocusAnalysis {
                analyzed_period: analysis.period,
                generated_at: now,
                peak_productivity: Vec::new(),
                deep_work_sessions: DeepWorkStats::default(),
                most_productive_day: None,
                least_productive_day: None,
                recommended_blocks: Vec::new(),
                current_protection_hours: 0.0,
                target_protection_hours: settings.target_hours_per_week,
                insights: vec!["Not enough calendar history to analyze patterns".to_string()],
                confidence: 0.0,
            });
        };

        let recommended_blocks = recommend_blocks(patterns, settings);
        let current_protection_hours = self.current_protection_hours(grant_id, now).await?;
        let (most_productive_day, least_productive_day) = productive_days(patterns);
        log::info!(
            "Recommending {} focus blocks from {} productivity windows",
            recommended_blocks.len(),
            patterns.productivity_blocks.len()
        );

        Ok(FocusAnalysis {
            analyzed_period: analysis.period,
            generated_at: now,
            peak_productivity: patterns
                .productivity_blocks
                .iter()
                .take(PEAK_BLOCK_COUNT)
                .cloned()
                .collect(),
            deep_work_sessions: deep_work_stats(patterns),
            most_productive_day,
            least_productive_day,
            insights: focus_insights(patterns, &recommended_blocks, settings, current_protection_hours),
            recommended_blocks,
            current_protection_hours,
            target_protection_hours: settings.target_hours_per_week,
            confidence: focus_confidence(patterns),
        })
    }

    /// Hours of "Focus Time" events already on the calendar for the coming week.
    async fn current_protection_hours(&self, grant_id: &str, now: DateTime<Utc>) -> EngineResult<f64> {
        let end = now + Duration::days(PROTECTION_LOOKAHEAD_DAYS);
        let minutes: i64 = fetch_events(self.client(), grant_id, now, end)
            .await?
            .iter()
            .filter(|e| e.is_blocking() && is_focus_event(e))
            .map(Event::duration_minutes)
            .sum();
        Ok(round1(minutes as f64 / 60.0))
    }

    async fn target_calendar(&self, grant_id: &str) -> EngineResult<Calendar> {
        let calendars = self
            .client()
            .get_calendars(grant_id)
            .await
            .map_err(|e| EngineError::fetch(format!("calendars for grant '{}'", grant_id), e))?;

        calendars
            .iter()
            .find(|c| c.is_primary)
            .or_else(|| calendars.first())
            .cloned()
            .ok_or_else(|| EngineError::NoCalendars(grant_id.to_string()))
    }

    pub async fn create_protected_blocks(
        &self,
        grant_id: &str,
        blocks: &[FocusTimeBlock],
        settings: &FocusTimeSettings,
    ) -> EngineResult<ProtectionOutcome> {
        self.create_protected_blocks_at(grant_id, blocks, settings, Utc::now()).await
    }

    pub async fn create_protected_blocks_at(
        &self,
        grant_id: &str,
        blocks: &[FocusTimeBlock],
        settings: &FocusTimeSettings,
        now: DateTime<Utc>,
    ) -> EngineResult<ProtectionOutcome> {
        let calendar = self.target_calendar(grant_id).await?;
        let timezone = self.learner.timezone();
        let mut outcome = ProtectionOutcome::default();

        for block in blocks {
            let Some((start, end)) = block.next_window(now, timezone) else {
                log::warn!("Skipping focus block '{}': no valid occurrence", block.label());
                outcome.failures.push(BlockFailure {
                    block: block.clone(),
                    error: "block has no valid day or start time".to_string(),
                });
                continue;
            };

            let request = focus_event_request(
                &block.reason,
                start,
                end,
                timezone,
                vec![WEEKLY_RECURRENCE.to_string()],
            );
            match self.client().create_event(grant_id, &calendar.id, &request).await {
                Ok(event) => outcome.created.push(ProtectedFocusBlock {
                    id: Uuid::new_v4().to_string(),
                    calendar_event_id: event.id,
                    calendar_id: calendar.id.clone(),
                    block: block.clone(),
                    start_time: start,
                    end_time: end,
                    recurrence: WEEKLY_RECURRENCE.to_string(),
                    protection_rules: ProtectionRules::from_settings(settings),
                    created_at: now,
                }),
                Err(e) => {
                    log::warn!("Failed to create focus block '{}': {:#}", block.label(), e);
                    outcome.failures.push(BlockFailure {
                        block: block.clone(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        log::info!(
            "Protected {} focus blocks on '{}' ({} failed)",
            outcome.created.len(),
            calendar.id,
            outcome.failures.len()
        );
        Ok(outcome)
    }

    pub async fn adapt_schedule(&self, grant_id: &str, trigger: AdaptiveTrigger) -> EngineResult<ScheduleChange> {
        self.adapt_schedule_at(grant_id, trigger, Utc::now()).await
    }

    pub async fn adapt_schedule_at(
        &self,
        grant_id: &str,
        trigger: AdaptiveTrigger,
        now: DateTime<Utc>,
    ) -> EngineResult<ScheduleChange> {
        let analysis = self.learn(grant_id, self.lookback_days, now).await?;
        let patterns = analysis.patterns.as_ref();

        let horizon = now + Duration::days(ADAPTIVE_WINDOW_DAYS);
        let upcoming: Vec<Event> = fetch_events(self.client(), grant_id, now, horizon)
            .await?
            .into_iter()
            .filter(|e| e.is_blocking() && e.start() >= now)
            .collect();

        let mut planner = SlotPlanner::new(
            &upcoming,
            now,
            horizon,
            self.learner.timezone(),
            self.learner.working_hours(),
        );
        let mut plan = Plan::default();

        match (trigger, patterns) {
            (AdaptiveTrigger::MeetingOverload, _) => relieve_overload(&mut planner, &upcoming, patterns, &mut plan),
            (AdaptiveTrigger::ConflictDetected, _) => resolve_overlaps(&mut planner, &upcoming, &mut plan),
            (AdaptiveTrigger::FocusTimeAtRisk, Some(p)) => protect_focus_time(&mut planner, &upcoming, p, &mut plan),
            (AdaptiveTrigger::DeadlineChange, Some(p)) => protect_deadline_time(&mut planner, p, &mut plan),
            (AdaptiveTrigger::PatternDetected, Some(p)) => follow_acceptance(&mut planner, &upcoming, p, &mut plan),
            (_, None) => log::info!("No meeting history, nothing to adapt for {}", trigger),
        }

        let impact = adaptive_impact(trigger, &plan, &upcoming);
        log::info!(
            "Adaptive pass for {} proposes {} changes over {} upcoming meetings",
            trigger,
            plan.changes.len(),
            upcoming.len()
        );

        Ok(ScheduleChange {
            id: Uuid::new_v4().to_string(),
            generated_at: now,
            trigger,
            reason: adaptive_reason(trigger, &impact),
            affected_events: plan.changes.iter().filter_map(|c| c.event_id.clone()).collect(),
            confidence: adaptive_confidence(plan.changes.len()),
            changes: plan.changes,
            impact,
            approval_status: ApprovalStatus::Pending,
            auto_applied: false,
        })
    }

    /// Applies every change independently; failures are collected, not fatal.
    pub async fn apply_schedule_change(
        &self,
        grant_id: &str,
        schedule: &mut ScheduleChange,
        notify_participants: bool,
    ) -> EngineResult<AppliedChanges> {
        let timezone = self.learner.timezone();
        let mut applied = AppliedChanges::default();
        let mut focus_calendar: Option<String> = None;

        for change in &schedule.changes {
            match change.action {
                ChangeAction::Reschedule => {
                    let (Some(event_id), Some(calendar_id), Some(start), Some(end)) = (
                        &change.event_id,
                        &change.calendar_id,
                        change.new_start_time,
                        change.new_end_time,
                    ) else {
                        applied.failures.push(format!("{}: incomplete change", change.description));
                        continue;
                    };
                    let request = UpdateEventRequest {
                        when: Some(EventWhen::between(start, end)),
                        notify_participants,
                        ..Default::default()
                    };
                    match self.client().update_event(grant_id, calendar_id, event_id, &request).await {
                        Ok(event) => applied.updated.push(event),
                        Err(e) => {
                            log::warn!("Failed to move event '{}': {:#}", event_id, e);
                            applied.failures.push(format!("{}: {:#}", change.description, e));
                        }
                    }
                }
                ChangeAction::Protect => {
                    let (Some(start), Some(end)) = (change.new_start_time, change.new_end_time) else {
                        applied.failures.push(format!("{}: incomplete change", change.description));
                        continue;
                    };
                    let calendar_id = match &focus_calendar {
                        Some(id) => id.clone(),
                        None => {
                            let id = self.target_calendar(grant_id).await?.id;
                            focus_calendar = Some(id.clone());
                            id
                        }
                    };
                    // Deadline blocks are one-off events.
                    let request = focus_event_request(&change.description, start, end, timezone, Vec::new());
                    match self.client().create_event(grant_id, &calendar_id, &request).await {
                        Ok(event) => applied.created.push(event),
                        Err(e) => {
                            log::warn!("Failed to create focus block: {:#}", e);
                            applied.failures.push(format!("{}: {:#}", change.description, e));
                        }
                    }
                }
            }
        }

        if applied.updated.is_empty() && applied.created.is_empty() {
            log::warn!("No changes from schedule {} could be applied", schedule.id);
        } else {
            schedule.approval_status = ApprovalStatus::Approved;
            schedule.auto_applied = true;
        }
        Ok(applied)
    }

    pub async fn optimize_meeting_duration(
        &self,
        grant_id: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> EngineResult<DurationOptimization> {
        self.optimize_meeting_duration_at(grant_id, calendar_id, event_id, Utc::now())
            .await
    }

    pub async fn optimize_meeting_duration_at(
        &self,
        grant_id: &str,
        calendar_id: &str,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<DurationOptimization> {
        let event = self
            .client()
            .get_event(grant_id, calendar_id, event_id)
            .await
            .map_err(|e| EngineError::fetch(format!("event '{}'", event_id), e))?;
        if !event.is_timed() {
            return Err(EngineError::InvalidEvent(format!(
                "'{}' must end after it starts",
                event.title
            )));
        }

        let analysis = self.learn(grant_id, self.lookback_days, now).await?;
        let stats = analysis
            .patterns
            .map(|p| p.duration_stats)
            .filter(|s| s.sample_size > 0)
            .ok_or_else(|| {
                EngineError::InsufficientHistory(
                    "no meetings with observed durations in the lookback window".to_string(),
                )
            })?;

        let current = u32::try_from(event.duration_minutes()).unwrap_or(0);
        Ok(recommend_duration(&event.id, current, &stats))
    }
}

/// Tracks busy intervals while changes are planned so that two proposals
/// never claim the same time.
struct SlotPlanner {
    busy: Vec<(String, DateTime<Utc>, DateTime<Utc>)>,
    now: DateTime<Utc>,
    horizon: DateTime<Utc>,
    timezone: Tz,
    working_hours: HourRange,
}

impl SlotPlanner {
    fn new(
        events: &[Event],
        now: DateTime<Utc>,
        horizon: DateTime<Utc>,
        timezone: Tz,
        working_hours: HourRange,
    ) -> Self {
        Self {
            busy: events
                .iter()
                .filter(|e| e.is_blocking())
                .map(|e| (e.id.clone(), e.start(), e.end()))
                .collect(),
            now,
            horizon,
            timezone,
            working_hours,
        }
    }

    fn working_hours(&self) -> Vec<u32> {
        self.working_hours.hours().collect()
    }

    fn is_free(&self, start: DateTime<Utc>, end: DateTime<Utc>, ignore_id: &str) -> bool {
        !self
            .busy
            .iter()
            .any(|(id, s, e)| (ignore_id.is_empty() || id != ignore_id) && ranges_overlap(start, end, *s, *e))
    }

    fn reserve(&mut self, id: &str, start: DateTime<Utc>, end: DateTime<Utc>) {
        match self.busy.iter_mut().find(|slot| !id.is_empty() && slot.0 == id) {
            Some(slot) => {
                slot.1 = start;
                slot.2 = end;
            }
            None => self.busy.push((id.to_string(), start, end)),
        }
    }

    /// First free workday slot for `event` on or after `from`, trying `hours`
    /// in order on each date.
    fn find_slot<F>(&self, event: &Event, from: NaiveDate, hours: &[u32], accept: F) -> Option<(DateTime<Utc>, DateTime<Utc>)>
    where
        F: Fn(DateTime<Tz>, DateTime<Tz>) -> bool,
    {
        let duration = event.end() - event.start();
        let mut date = from;

        loop {
            if local_instant(date, 0, self.timezone)? >= self.horizon {
                return None;
            }
            if WORKDAYS.contains(&date.weekday()) {
                let day_end = local_instant(date, self.working_hours.end * 60, self.timezone);
                for &hour in hours {
                    let Some(start) = local_instant(date, hour * 60, self.timezone) else {
                        continue;
                    };
                    let end = start + duration;
                    if start <= self.now || end > self.horizon || day_end.map_or(true, |limit| end > limit) {
                        continue;
                    }
                    if self.is_free(start, end, &event.id)
                        && accept(to_local(start, self.timezone), to_local(end, self.timezone))
                    {
                        return Some((start, end));
                    }
                }
            }
            date = date.succ_opt()?;
        }
    }
}

#[derive(Default)]
struct Plan {
    changes: Vec<Change>,
    focus_minutes: i64,
    conflicts_resolved: usize,
}

impl Plan {
    fn is_full(&self) -> bool {
        self.changes.len() >= MAX_ADAPTIVE_CHANGES
    }

    fn reschedule(&mut self, event: &Event, start: DateTime<Utc>, end: DateTime<Utc>, description: String) {
        self.changes.push(Change {
            event_id: Some(event.id.clone()),
            calendar_id: Some(event.calendar_id.clone()),
            action: ChangeAction::Reschedule,
            old_start_time: Some(event.start()),
            new_start_time: Some(start),
            new_end_time: Some(end),
            description,
        });
    }
}

fn relieve_overload(planner: &mut SlotPlanner, events: &[Event], patterns: Option<&MeetingPattern>, plan: &mut Plan) {
    let timezone = planner.timezone;
    let hours = planner.working_hours();
    let limit = |day: Weekday| match patterns {
        Some(p) => (p.density_for(day) * OVERLOAD_MULTIPLIER).max(OVERLOAD_FLOOR),
        None => DEFAULT_DAILY_MEETING_LIMIT,
    };

    let mut by_date: BTreeMap<NaiveDate, Vec<&Event>> = BTreeMap::new();
    for event in events {
        by_date
            .entry(to_local(event.start(), timezone).date_naive())
            .or_default()
            .push(event);
    }
    let mut counts: BTreeMap<NaiveDate, usize> = by_date.iter().map(|(d, v)| (*d, v.len())).collect();

    for (date, day_events) in &by_date {
        let day_limit = limit(date.weekday());
        if day_events.len() as f64 <= day_limit {
            continue;
        }
        let excess = day_events.len() - day_limit.floor() as usize;

        let mut movable: Vec<&Event> = day_events
            .iter()
            .copied()
            .filter(|e| is_movable(e) && e.participants.len() <= LOW_PRIORITY_PARTICIPANTS)
            .collect();
        movable.sort_by_key(|e| (e.participants.len(), e.when.start_time));

        for event in movable.into_iter().take(excess) {
            if plan.is_full() {
                return;
            }
            let Some(from) = date.succ_opt() else {
                continue;
            };
            let slot = planner.find_slot(event, from, &hours, |start, _| {
                let day = start.date_naive();
                (counts.get(&day).copied().unwrap_or(0) + 1) as f64 <= limit(day.weekday())
            });
            let Some((start, end)) = slot else {
                log::debug!("No lighter day found for '{}'", event.title);
                continue;
            };

            planner.reserve(&event.id, start, end);
            if let Some(count) = counts.get_mut(date) {
                *count = count.saturating_sub(1);
            }
            *counts.entry(to_local(start, timezone).date_naive()).or_insert(0) += 1;
            plan.reschedule(
                event,
                start,
                end,
                format!("Move '{}' to a lighter day to reduce meeting overload", event.title),
            );
        }
    }
}

fn focus_overlap<'p>(blocks: &[&'p TimeBlock], start: DateTime<Tz>, end: DateTime<Tz>) -> Option<&'p TimeBlock> {
    let start_minute = minute_of_day(&start);
    let end_minute = if end.date_naive() == start.date_naive() {
        minute_of_day(&end)
    } else {
        24 * 60
    };
    blocks
        .iter()
        .copied()
        .find(|b| b.intersects(start.weekday(), start_minute, end_minute))
}

fn protect_focus_time(planner: &mut SlotPlanner, events: &[Event], patterns: &MeetingPattern, plan: &mut Plan) {
    let timezone = planner.timezone;
    let hours = planner.working_hours();
    let blocks = patterns.focus_blocks();

    for event in events.iter().filter(|e| is_movable(e)) {
        if plan.is_full() {
            break;
        }
        let (start, end) = (to_local(event.start(), timezone), to_local(event.end(), timezone));
        let Some(block) = focus_overlap(&blocks, start, end) else {
            continue;
        };

        let slot = planner.find_slot(event, start.date_naive(), &hours, |s, e| {
            focus_overlap(&blocks, s, e).is_none()
        });
        let Some((new_start, new_end)) = slot else {
            log::debug!("No slot outside focus time for '{}'", event.title);
            continue;
        };

        planner.reserve(&event.id, new_start, new_end);
        plan.focus_minutes += event.duration_minutes();
        plan.reschedule(
            event,
            new_start,
            new_end,
            format!("Move '{}' out of focus time ({})", event.title, block.label()),
        );
    }
}

fn protect_deadline_time(planner: &mut SlotPlanner, patterns: &MeetingPattern, plan: &mut Plan) {
    let mut ranked = patterns.focus_blocks();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut protected = 0;

    for block in ranked {
        if plan.is_full() || protected >= DEADLINE_PROTECT_BLOCKS {
            break;
        }
        let Some(day) = block.weekday() else {
            continue;
        };
        let Some(start) = next_occurrence(planner.now, day, block.start_minutes(), planner.timezone) else {
            continue;
        };
        let minutes = i64::from(block.duration_minutes());
        let end = start + Duration::minutes(minutes);
        if !planner.is_free(start, end, "") {
            continue;
        }

        planner.reserve("", start, end);
        plan.focus_minutes += minutes;
        plan.changes.push(Change {
            event_id: None,
            calendar_id: None,
            action: ChangeAction::Protect,
            old_start_time: None,
            new_start_time: Some(start),
            new_end_time: Some(end),
            description: format!("Protect {} for deadline work", block.label()),
        });
        protected += 1;
    }
}

fn pick_mover<'e>(first: &'e Event, second: &'e Event) -> Option<&'e Event> {
    match (is_movable(first), is_movable(second)) {
        (true, true) if first.participants.len() < second.participants.len() => Some(first),
        (_, true) => Some(second),
        (true, false) => Some(first),
        (false, false) => None,
    }
}

fn resolve_overlaps(planner: &mut SlotPlanner, events: &[Event], plan: &mut Plan) {
    let timezone = planner.timezone;
    let hours = planner.working_hours();
    let mut moved: BTreeSet<&str> = BTreeSet::new();

    for (i, first) in events.iter().enumerate() {
        for second in &events[i + 1..] {
            if plan.is_full() {
                return;
            }
            if moved.contains(first.id.as_str()) || moved.contains(second.id.as_str()) {
                continue;
            }
            if !ranges_overlap(first.start(), first.end(), second.start(), second.end()) {
                continue;
            }
            let Some(mover) = pick_mover(first, second) else {
                continue;
            };
            let other = if mover.id == first.id { second } else { first };

            let from = to_local(mover.start(), timezone).date_naive();
            let Some((start, end)) = planner.find_slot(mover, from, &hours, |_, _| true) else {
                log::debug!("No free slot to resolve overlap of '{}'", mover.title);
                continue;
            };

            planner.reserve(&mover.id, start, end);
            moved.insert(mover.id.as_str());
            plan.conflicts_resolved += 1;
            plan.reschedule(
                mover,
                start,
                end,
                format!("Move '{}' to resolve its overlap with '{}'", mover.title, other.title),
            );
        }
    }
}

fn follow_acceptance(planner: &mut SlotPlanner, events: &[Event], patterns: &MeetingPattern, plan: &mut Plan) {
    let timezone = planner.timezone;
    let mut good: Vec<(u32, f64)> = planner
        .working_hours()
        .into_iter()
        .filter_map(|h| patterns.hour_acceptance(h).map(|rate| (h, rate)))
        .filter(|(_, rate)| *rate >= HIGH_ACCEPTANCE_RATE)
        .collect();
    good.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    let hours: Vec<u32> = good.iter().map(|(h, _)| *h).collect();
    if hours.is_empty() {
        return;
    }

    for event in events.iter().filter(|e| is_movable(e)) {
        if plan.is_full() {
            break;
        }
        let local = to_local(event.start(), timezone);
        let Some(rate) = patterns.hour_acceptance(local.hour()) else {
            continue;
        };
        if rate >= LOW_ACCEPTANCE_RATE {
            continue;
        }
        let Some((start, end)) = planner.find_slot(event, local.date_naive(), &hours, |_, _| true) else {
            continue;
        };

        planner.reserve(&event.id, start, end);
        plan.reschedule(
            event,
            start,
            end,
            format!(
                "Move '{}' from {} ({:.0}% acceptance) to {}",
                event.title,
                hour_key(local.hour()),
                rate * 100.0,
                hour_key(to_local(start, timezone).hour())
            ),
        );
    }
}

fn adaptive_impact(trigger: AdaptiveTrigger, plan: &Plan, events: &[Event]) -> AdaptiveImpact {
    let rescheduled: Vec<&Change> = plan
        .changes
        .iter()
        .filter(|c| c.action == ChangeAction::Reschedule)
        .collect();

    let mut participants: BTreeSet<String> = BTreeSet::new();
    for change in &rescheduled {
        if let Some(event) = events.iter().find(|e| change.event_id.as_deref() == Some(e.id.as_str())) {
            participants.extend(event.participants.iter().map(|p| p.email.to_lowercase()));
        }
    }

    let mut risks = Vec::new();
    if !rescheduled.is_empty() {
        risks.push(format!(
            "{} meeting(s) need participants to accept a new time",
            rescheduled.len()
        ));
    }
    if plan.changes.iter().any(|c| c.action == ChangeAction::Protect) {
        risks.push("New focus blocks may push out ad-hoc meetings".to_string());
    }

    let predicted_benefit = if plan.changes.is_empty() {
        "No changes needed"
    } else {
        match trigger {
            AdaptiveTrigger::MeetingOverload => "Lighter days with fewer back-to-back meetings",
            AdaptiveTrigger::FocusTimeAtRisk => "Improved focus time availability",
            AdaptiveTrigger::DeadlineChange => "More uninterrupted time before the deadline",
            AdaptiveTrigger::ConflictDetected => "No double-booked meetings in the next two weeks",
            AdaptiveTrigger::PatternDetected => "Higher acceptance for moved meetings",
        }
    };

    AdaptiveImpact {
        focus_time_gained_hours: round1(plan.focus_minutes as f64 / 60.0),
        meetings_rescheduled: rescheduled.len(),
        meetings_declined: 0,
        conflicts_resolved: plan.conflicts_resolved,
        participants_affected: participants.len(),
        risks,
        predicted_benefit: predicted_benefit.to_string(),
    }
}

fn adaptive_reason(trigger: AdaptiveTrigger, impact: &AdaptiveImpact) -> String {
    match trigger {
        AdaptiveTrigger::MeetingOverload => format!(
            "Meeting load increased: reducing by rescheduling {} meetings",
            impact.meetings_rescheduled
        ),
        AdaptiveTrigger::FocusTimeAtRisk => format!(
            "Focus time at risk: protecting {:.1} additional hours",
            impact.focus_time_gained_hours
        ),
        AdaptiveTrigger::DeadlineChange => "Urgent deadline detected: increasing focus time priority".to_string(),
        AdaptiveTrigger::ConflictDetected => format!(
            "Conflicts detected: resolving {} overlapping meetings",
            impact.conflicts_resolved
        ),
        AdaptiveTrigger::PatternDetected => format!(
            "Moving {} meetings to hours with higher acceptance",
            impact.meetings_rescheduled
        ),
    }
}

fn adaptive_confidence(changes: usize) -> f64 {
    if changes == 0 {
        return 50.0;
    }
    (60.0 + 3.0 * changes.min(10) as f64).min(95.0)
}
