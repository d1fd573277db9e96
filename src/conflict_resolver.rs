use chrono::{Datelike, Duration};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::calendar_client::{fetch_events, CalendarClient, Event, EventStatus};
use crate::error::{EngineError, EngineResult};
use crate::pattern_learner::MeetingPattern;
use crate::reschedule::{RescheduleOption, RescheduleRequest, RescheduleSearch};
use crate::time_utils::{local_day_bounds, minute_of_day, ranges_overlap, weekday_name};

/// Existing events are fetched this far around the proposed range.
pub const SEARCH_MARGIN_HOURS: i64 = 2;

/// Gaps shorter than this between meetings count as back-to-back.
pub const BUFFER_MINUTES: i64 = 15;

/// A day is overloaded when its meeting count exceeds the learned daily
/// density by this factor.
pub const OVERLOAD_MULTIPLIER: f64 = 1.5;

/// Overload is never reported at or below this many meetings in a day.
pub const OVERLOAD_FLOOR: f64 = 3.0;

pub const ALTERNATIVE_LIMIT: usize = 3;
pub const ALTERNATIVE_SEARCH_DAYS: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Hard,
    BackToBack,
    FocusTime,
    Overload,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conflict {
    pub id: String,
    pub kind: ConflictKind,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicting_event: Option<Event>,
    pub description: String,
    pub impact: String,
    pub suggestion: String,
    pub can_auto_resolve: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictAnalysis {
    pub proposed_event: Event,
    pub hard_conflicts: Vec<Conflict>,
    pub soft_conflicts: Vec<Conflict>,
    pub total_conflicts: usize,
    pub can_proceed: bool,
    pub recommendations: Vec<String>,
    pub alternative_times: Vec<RescheduleOption>,
    /// Advisory phrasing only.
    pub ai_recommendation: Option<String>,
}

impl ConflictAnalysis {
    fn new(proposed_event: Event, hard_conflicts: Vec<Conflict>, soft_conflicts: Vec<Conflict>) -> Self {
        let recommendations = recommendations_for(&hard_conflicts, &soft_conflicts);
        Self {
            proposed_event,
            total_conflicts: hard_conflicts.len() + soft_conflicts.len(),
            can_proceed: hard_conflicts.is_empty(),
            hard_conflicts,
            soft_conflicts,
            recommendations,
            alternative_times: Vec::new(),
            ai_recommendation: None,
        }
    }

    fn wants_alternatives(&self) -> bool {
        !self.hard_conflicts.is_empty() || self.soft_conflicts.len() > 2
    }
}

/// Classifies a proposed meeting against live calendar data and learned patterns.
pub struct ConflictResolver {
    client: Arc<dyn CalendarClient>,
    timezone: Tz,
}

impl ConflictResolver {
    pub fn new(client: Arc<dyn CalendarClient>, timezone: Tz) -> Self {
        Self { client, timezone }
    }

    pub fn client(&self) -> &dyn CalendarClient {
        self.client.as_ref()
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Full conflict check, including a short alternative search when the
    /// proposed time is blocked or heavily conflicted.
    pub async fn detect_conflicts(
        &self,
        grant_id: &str,
        proposed: &Event,
        patterns: Option<&MeetingPattern>,
    ) -> EngineResult<ConflictAnalysis> {
        let mut analysis = self.check_conflicts(grant_id, proposed, patterns).await?;

        if analysis.wants_alternatives() {
            let request = RescheduleRequest::alternatives(ALTERNATIVE_SEARCH_DAYS);
            let mut options = RescheduleSearch::new(self)
                .find_suggestions(grant_id, proposed, &request, patterns)
                .await?;
            options.truncate(ALTERNATIVE_LIMIT);
            analysis.alternative_times = options;
        }

        analysis.ai_recommendation = Some(advisory(&analysis));
        Ok(analysis)
    }

    /// Conflict check without alternatives. Used for every reschedule candidate.
    pub async fn check_conflicts(
        &self,
        grant_id: &str,
        proposed: &Event,
        patterns: Option<&MeetingPattern>,
    ) -> EngineResult<ConflictAnalysis> {
        if !proposed.is_timed() {
            return Err(EngineError::InvalidEvent(format!(
                "'{}' must end after it starts",
                proposed.title
            )));
        }

        let margin = Duration::hours(SEARCH_MARGIN_HOURS);
        let (mut window_start, mut window_end) = (proposed.start() - margin, proposed.end() + margin);
        if let Some((day_start, day_end)) = local_day_bounds(proposed.start(), self.timezone) {
            window_start = window_start.min(day_start);
            window_end = window_end.max(day_end);
        }

        let existing: Vec<Event> = fetch_events(self.client.as_ref(), grant_id, window_start, window_end)
            .await?
            .into_iter()
            .filter(|e| proposed.id.is_empty() || e.id != proposed.id)
            .collect();

        Ok(self.classify(proposed, &existing, patterns))
    }

    /// Classifies `proposed` against an already fetched set of events.
    pub fn classify(&self, proposed: &Event, existing: &[Event], patterns: Option<&MeetingPattern>) -> ConflictAnalysis {
        let mut hard = Vec::new();
        let mut soft = Vec::new();

        for event in existing.iter().filter(|e| e.is_blocking()) {
            if ranges_overlap(proposed.start(), proposed.end(), event.start(), event.end()) {
                hard.push(hard_conflict(event));
            } else if let Some(conflict) = back_to_back_conflict(proposed, event) {
                soft.push(conflict);
            }
        }

        if let Some(patterns) = patterns {
            soft.extend(focus_conflicts(proposed, patterns));
            if let Some(conflict) = overload_conflict(proposed, existing, patterns) {
                soft.push(conflict);
            }
        }

        let mut analysis = ConflictAnalysis::new(proposed.clone(), hard, soft);
        analysis.ai_recommendation = Some(advisory(&analysis));
        analysis
    }
}

fn hard_conflict(event: &Event) -> Conflict {
    let severity = if event.status == EventStatus::Tentative {
        Severity::High
    } else {
        Severity::Critical
    };

    Conflict {
        id: format!("hard-{}", event.id),
        kind: ConflictKind::Hard,
        severity,
        conflicting_event: Some(event.clone()),
        description: format!("Overlaps with '{}'", event.title),
        impact: "Cannot attend both meetings simultaneously".to_string(),
        suggestion: format!("Reschedule '{}' or the new meeting", event.title),
        can_auto_resolve: false,
    }
}

fn back_to_back_conflict(proposed: &Event, event: &Event) -> Option<Conflict> {
    let (gap, position) = if event.end() <= proposed.start() {
        (proposed.start() - event.end(), "after")
    } else if event.start() >= proposed.end() {
        (event.start() - proposed.end(), "before")
    } else {
        return None;
    };

    if gap >= Duration::minutes(BUFFER_MINUTES) {
        return None;
    }

    let (severity, description, impact) = if gap == Duration::zero() {
        (
            Severity::Medium,
            format!("Back-to-back with '{}'", event.title),
            "No buffer time for breaks or overruns",
        )
    } else {
        (
            Severity::Low,
            format!("Only {} min gap {} '{}'", gap.num_minutes(), position, event.title),
            "Minimal buffer time between meetings",
        )
    };

    Some(Conflict {
        id: format!("back-to-back-{}", event.id),
        kind: ConflictKind::BackToBack,
        severity,
        conflicting_event: Some(event.clone()),
        description,
        impact: impact.to_string(),
        suggestion: format!("Add a {}-minute buffer between meetings", BUFFER_MINUTES),
        can_auto_resolve: true,
    })
}

fn focus_conflicts(proposed: &Event, patterns: &MeetingPattern) -> Vec<Conflict> {
    let start = patterns.local(proposed.start());
    let end = patterns.local(proposed.end());
    let start_minute = minute_of_day(&start);
    let end_minute = if end.date_naive() == start.date_naive() {
        minute_of_day(&end)
    } else {
        24 * 60
    };

    patterns
        .focus_blocks()
        .into_iter()
        .filter(|block| block.intersects(start.weekday(), start_minute, end_minute))
        .map(|block| Conflict {
            id: format!("focus-{}-{}", block.day_of_week.to_lowercase(), block.start_time),
            kind: ConflictKind::FocusTime,
            severity: Severity::High,
            conflicting_event: None,
            description: format!("Interrupts focus time ({})", block.label()),
            impact: "Reduces productivity during peak focus hours".to_string(),
            suggestion: format!("Move the meeting outside {}-{}", block.start_time, block.end_time),
            can_auto_resolve: false,
        })
        .collect()
}

fn overload_conflict(proposed: &Event, existing: &[Event], patterns: &MeetingPattern) -> Option<Conflict> {
    let day = patterns.local(proposed.start());
    let same_day = existing
        .iter()
        .filter(|e| e.is_blocking())
        .filter(|e| patterns.local(e.start()).date_naive() == day.date_naive())
        .count();
    let total = same_day + 1;

    let density = patterns.density_for(day.weekday());
    let threshold = (density * OVERLOAD_MULTIPLIER).max(OVERLOAD_FLOOR);
    if (total as f64) <= threshold {
        return None;
    }

    Some(Conflict {
        id: format!("overload-{}", day.date_naive()),
        kind: ConflictKind::Overload,
        severity: Severity::Medium,
        conflicting_event: None,
        description: format!(
            "{} meetings on this {} (usually {:.1})",
            total,
            weekday_name(day.weekday()),
            density
        ),
        impact: "Meeting fatigue and reduced productivity".to_string(),
        suggestion: "Move this meeting to a lighter day".to_string(),
        can_auto_resolve: true,
    })
}

fn recommendations_for(hard: &[Conflict], soft: &[Conflict]) -> Vec<String> {
    let mut recommendations = Vec::new();

    if !hard.is_empty() {
        recommendations.push("Hard conflicts detected - must reschedule".to_string());
        for conflict in hard {
            if !recommendations.contains(&conflict.suggestion) {
                recommendations.push(conflict.suggestion.clone());
            }
        }
        return recommendations;
    }

    if soft.is_empty() {
        recommendations.push("No conflicts detected - good time for this meeting".to_string());
        return recommendations;
    }

    for kind in [ConflictKind::BackToBack, ConflictKind::FocusTime, ConflictKind::Overload] {
        if !soft.iter().any(|c| c.kind == kind) {
            continue;
        }
        let phrase = match kind {
            ConflictKind::BackToBack => "Add buffer time between meetings",
            ConflictKind::FocusTime => "Consider protecting your focus time",
            ConflictKind::Overload => "Consider moving this meeting to a lighter day",
            ConflictKind::Hard => continue,
        };
        recommendations.push(phrase.to_string());
    }
    recommendations
}

fn advisory(analysis: &ConflictAnalysis) -> String {
    let hard = analysis.hard_conflicts.len();
    let soft = analysis.soft_conflicts.len();
    let best = analysis.alternative_times.first();

    match (hard, soft, best) {
        (h, _, Some(option)) if h > 0 => format!(
            "Cannot proceed: {} hard conflict(s). Best alternative is {} (score {}/100)",
            h,
            option.proposed_time.format("%a %b %-d %H:%M UTC"),
            option.score
        ),
        (h, _, None) if h > 0 => format!("Cannot proceed: {} hard conflict(s). Manual rescheduling required", h),
        (_, s, Some(option)) if s > 2 => format!(
            "Proceeding is possible but not recommended with {} soft conflicts. Consider {} (score {}/100)",
            s,
            option.proposed_time.format("%a %b %-d %H:%M UTC"),
            option.score
        ),
        (_, s, None) if s > 2 => format!("Proceeding is possible but not ideal ({} soft conflicts)", s),
        (_, s, _) if s > 0 => format!("Can proceed with {} minor soft conflict(s)", s),
        _ => "Good time - no conflicts detected".to_string(),
    }
}
