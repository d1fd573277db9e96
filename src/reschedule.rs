use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::calendar_client::{CalendarClient, Event, EventWhen, Participant, UpdateEventRequest};
use crate::conflict_resolver::{Conflict, ConflictAnalysis, ConflictResolver};
use crate::error::{EngineError, EngineResult};
use crate::pattern_learner::MeetingPattern;
use crate::time_utils::{parse_weekday, to_local, weekday_name};

/// Accepted candidates across both passes; the search stops generating at this count.
pub const MAX_CANDIDATES: usize = 10;
pub const MAX_SUGGESTIONS: usize = 5;
pub const DEFAULT_MAX_DELAY_DAYS: u32 = 14;
pub const MAX_DELAY_DAYS_LIMIT: u32 = 365;

pub const SOFT_CONFLICT_PENALTY: i32 = 10;

// Day and hour bonuses are independent and are not capped jointly.
pub const DAY_ACCEPTANCE_BONUS: f64 = 15.0;
pub const HOUR_ACCEPTANCE_BONUS: f64 = 15.0;

/// Acceptance rates above this earn a "pro" on the option.
pub const HIGH_ACCEPTANCE_RATE: f64 = 0.8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RescheduleRequest {
    pub event_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub preferred_times: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub must_include: Vec<String>,
    #[serde(default)]
    pub avoid_days: Vec<String>,
    pub max_delay_days: u32,
    #[serde(default)]
    pub notify_participants: bool,
}

impl RescheduleRequest {
    pub fn new(event_id: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            reason: None,
            preferred_times: Vec::new(),
            must_include: Vec::new(),
            avoid_days: Vec::new(),
            max_delay_days: DEFAULT_MAX_DELAY_DAYS,
            notify_participants: false,
        }
    }

    /// Request used for the short alternative search of a conflict check.
    pub fn alternatives(max_delay_days: u32) -> Self {
        Self {
            max_delay_days,
            ..Self::new("")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RescheduleOption {
    pub proposed_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub score: u8,
    /// Soft conflicts remaining at this time.
    pub conflicts: Vec<Conflict>,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
    pub participant_match: f64,
    pub insight: String,
}

/// Reschedule score: starts at 100, loses a fixed penalty per soft conflict
/// and gains day and hour acceptance bonuses when patterns exist.
pub fn calculate_reschedule_score(
    analysis: &ConflictAnalysis,
    patterns: Option<&MeetingPattern>,
    proposed: DateTime<Utc>,
) -> u8 {
    let mut score = 100 - SOFT_CONFLICT_PENALTY * analysis.soft_conflicts.len() as i32;

    if let Some(patterns) = patterns {
        let local = patterns.local(proposed);
        if let Some(rate) = patterns.day_acceptance(local.weekday()) {
            score += (DAY_ACCEPTANCE_BONUS * rate).round() as i32;
        }
        if let Some(rate) = patterns.hour_acceptance(local.hour()) {
            score += (HOUR_ACCEPTANCE_BONUS * rate).round() as i32;
        }
    }

    score.clamp(0, 100) as u8
}

pub fn build_pros(patterns: Option<&MeetingPattern>, proposed: DateTime<Utc>) -> Vec<String> {
    let Some(patterns) = patterns else {
        return Vec::new();
    };
    let local = patterns.local(proposed);
    let mut pros = Vec::new();

    if let Some(rate) = patterns.day_acceptance(local.weekday()) {
        if rate > HIGH_ACCEPTANCE_RATE {
            pros.push(format!(
                "High acceptance on {} ({:.0}%)",
                weekday_name(local.weekday()),
                rate * 100.0
            ));
        }
    }
    if patterns
        .hour_acceptance(local.hour())
        .map_or(false, |rate| rate > HIGH_ACCEPTANCE_RATE)
    {
        pros.push("Preferred time slot".to_string());
    }
    if patterns.in_productivity_block(proposed) {
        pros.push("During typical focus time".to_string());
    }
    pros
}

fn option_insight(score: u8) -> &'static str {
    match score {
        90..=100 => "Excellent choice",
        75..=89 => "Good option",
        60..=74 => "Acceptable",
        _ => "Consider other options",
    }
}

/// Sorts options by score, best first; equal scores keep the earliest time first.
pub fn rank_options(options: &mut [RescheduleOption]) {
    options.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.proposed_time.cmp(&b.proposed_time))
    });
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SearchStats {
    pub evaluated: usize,
    pub accepted: usize,
    pub blocked: usize,
    pub skipped: usize,
}

/// Bounded search for alternative times for one meeting.
pub struct RescheduleSearch<'a> {
    resolver: &'a ConflictResolver,
}

impl<'a> RescheduleSearch<'a> {
    pub fn new(resolver: &'a ConflictResolver) -> Self {
        Self { resolver }
    }

    /// Loads the event to move and searches alternatives for it.
    pub async fn suggest_for_event(
        &self,
        grant_id: &str,
        calendar_id: &str,
        request: &RescheduleRequest,
        patterns: Option<&MeetingPattern>,
    ) -> EngineResult<(Event, Vec<RescheduleOption>)> {
        let event = self
            .resolver
            .client()
            .get_event(grant_id, calendar_id, &request.event_id)
            .await
            .map_err(|e| EngineError::fetch(format!("event '{}'", request.event_id), e))?;

        let options = self.find_suggestions(grant_id, &event, request, patterns).await?;
        Ok((event, options))
    }

    pub async fn find_suggestions(
        &self,
        grant_id: &str,
        event: &Event,
        request: &RescheduleRequest,
        patterns: Option<&MeetingPattern>,
    ) -> EngineResult<Vec<RescheduleOption>> {
        let (options, stats) = self.search(grant_id, event, request, patterns).await?;
        log::info!(
            "Reschedule search for '{}': {} evaluated, {} accepted, {} blocked, {} skipped",
            event.title,
            stats.evaluated,
            stats.accepted,
            stats.blocked,
            stats.skipped
        );
        Ok(options)
    }

    /// Runs the preferred-time pass then the day-offset pass, returning the
    /// top options and counters for every candidate evaluated.
    pub async fn search(
        &self,
        grant_id: &str,
        event: &Event,
        request: &RescheduleRequest,
        patterns: Option<&MeetingPattern>,
    ) -> EngineResult<(Vec<RescheduleOption>, SearchStats)> {
        if !event.is_timed() {
            return Err(EngineError::InvalidEvent(format!(
                "'{}' must end after it starts",
                event.title
            )));
        }

        if request.max_delay_days > MAX_DELAY_DAYS_LIMIT {
            return Err(EngineError::Configuration(format!(
                "max_delay_days of {} exceeds the {}-day limit",
                request.max_delay_days, MAX_DELAY_DAYS_LIMIT
            )));
        }
        let offsets = self.day_offset_candidates(event, request.max_delay_days)?;

        let template = with_required_participants(event, &request.must_include);
        let duration = event.end() - event.start();
        let mut stats = SearchStats::default();
        let mut options: Vec<RescheduleOption> = Vec::new();

        for &start in &request.preferred_times {
            if options.len() >= MAX_CANDIDATES {
                break;
            }
            if let Some(mut option) = self
                .evaluate(grant_id, &template, start, duration, patterns, &mut stats)
                .await
            {
                option.pros = vec!["Preferred time".to_string()];
                options.push(option);
            }
        }

        let avoid = avoided_days(&request.avoid_days);
        for start in offsets {
            if options.len() >= MAX_CANDIDATES {
                break;
            }
            let local = to_local(start, self.resolver.timezone());
            if avoid.contains(&local.weekday()) {
                log::debug!("Skipping {} (avoided day)", start);
                continue;
            }
            if let Some(option) = self
                .evaluate(grant_id, &template, start, duration, patterns, &mut stats)
                .await
            {
                options.push(option);
            }
        }

        stats.accepted = options.len();
        rank_options(&mut options);
        options.truncate(MAX_SUGGESTIONS);
        Ok((options, stats))
    }

    /// Same local time of day on each of the following `max_delay_days` days.
    fn day_offset_candidates(&self, event: &Event, max_delay_days: u32) -> EngineResult<Vec<DateTime<Utc>>> {
        let timezone = self.resolver.timezone();
        let original = to_local(event.start(), timezone);
        let latest = event
            .start()
            .checked_add_signed(Duration::days(i64::from(max_delay_days)))
            .ok_or_else(|| {
                EngineError::Configuration(format!(
                    "'{}' cannot be delayed by {} days",
                    event.title, max_delay_days
                ))
            })?;
        let mut candidates = Vec::new();

        for offset in 1..=i64::from(max_delay_days) {
            let Some(date) = original.date_naive().checked_add_signed(Duration::days(offset)) else {
                break;
            };
            // Wall-clock times skipped by a DST change have no candidate.
            let Some(local) = timezone
                .from_local_datetime(&date.and_time(original.time()))
                .earliest()
            else {
                continue;
            };
            let candidate = local.with_timezone(&Utc);
            if candidate > latest {
                break;
            }
            candidates.push(candidate);
        }
        Ok(candidates)
    }

    async fn evaluate(
        &self,
        grant_id: &str,
        template: &Event,
        start: DateTime<Utc>,
        duration: Duration,
        patterns: Option<&MeetingPattern>,
        stats: &mut SearchStats,
    ) -> Option<RescheduleOption> {
        let end = start + duration;
        let candidate = template.moved_to(start, end);
        stats.evaluated += 1;

        let analysis = match self.resolver.check_conflicts(grant_id, &candidate, patterns).await {
            Ok(analysis) => analysis,
            Err(e) => {
                stats.skipped += 1;
                log::warn!("Skipping candidate {}: {}", start, e);
                return None;
            }
        };

        if !analysis.can_proceed {
            stats.blocked += 1;
            return None;
        }

        let score = calculate_reschedule_score(&analysis, patterns, start);
        Some(RescheduleOption {
            proposed_time: start,
            end_time: end,
            score,
            cons: analysis.soft_conflicts.iter().map(|c| c.impact.clone()).collect(),
            conflicts: analysis.soft_conflicts,
            pros: build_pros(patterns, start),
            participant_match: 100.0,
            insight: option_insight(score).to_string(),
        })
    }
}

fn avoided_days(names: &[String]) -> Vec<Weekday> {
    names
        .iter()
        .filter_map(|name| {
            let day = parse_weekday(name);
            if day.is_none() {
                log::warn!("Ignoring unknown day '{}' in avoid list", name);
            }
            day
        })
        .collect()
}

fn with_required_participants(event: &Event, must_include: &[String]) -> Event {
    let mut template = event.clone();
    for email in must_include {
        if !template
            .participants
            .iter()
            .any(|p| p.email.eq_ignore_ascii_case(email))
        {
            template.participants.push(Participant::new(email));
        }
    }
    template
}

/// Moves `event` to the chosen option through the calendar backend.
pub async fn apply_reschedule(
    client: &dyn CalendarClient,
    grant_id: &str,
    event: &Event,
    option: &RescheduleOption,
    notify_participants: bool,
) -> EngineResult<Event> {
    let mut when = EventWhen::between(option.proposed_time, option.end_time);
    when.start_timezone = event.when.start_timezone.clone();
    when.end_timezone = event.when.end_timezone.clone();

    let request = UpdateEventRequest {
        when: Some(when),
        notify_participants,
        ..Default::default()
    };

    client
        .update_event(grant_id, &event.calendar_id, &event.id, &request)
        .await
        .map_err(|e| EngineError::fetch(format!("update of event '{}'", event.id), e))
}
