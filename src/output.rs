use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::fmt::Write;

use crate::cli::OutputFormat;
use crate::conflict_resolver::{Conflict, ConflictAnalysis};
use crate::focus_optimizer::{
    AppliedChanges, ChangeAction, DurationOptimization, FocusAnalysis, ProtectionOutcome, ScheduleChange,
};
use crate::meeting_scorer::MeetingScore;
use crate::pattern_learner::MeetingAnalysis;
use crate::reschedule::RescheduleOption;
use crate::time_utils::to_local;

/// Prints `value` as JSON or YAML, or through `text` for the human format.
pub fn emit<T, F>(format: OutputFormat, value: &T, text: F) -> Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value).context("Failed to serialize output as JSON")?,
        OutputFormat::Yaml => serde_yaml::to_string(value).context("Failed to serialize output as YAML")?,
        OutputFormat::Text => text(value),
    };
    println!("{}", rendered.trim_end());
    Ok(())
}

fn local_time(instant: DateTime<Utc>, timezone: Tz) -> String {
    to_local(instant, timezone).format("%a %Y-%m-%d %H:%M").to_string()
}

fn conflict_line(out: &mut String, conflict: &Conflict) {
    let _ = writeln!(out, "  [{:?}] {}", conflict.severity, conflict.description);
    let _ = writeln!(out, "      -> {}", conflict.suggestion);
}

pub fn render_analysis(analysis: &MeetingAnalysis) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "📊 Analyzed {} meetings ({} to {})",
        analysis.total_meetings,
        analysis.period.start.format("%Y-%m-%d"),
        analysis.period.end.format("%Y-%m-%d")
    );

    if let Some(patterns) = &analysis.patterns {
        let _ = writeln!(
            out,
            "Overall acceptance: {:.0}% ({} responses)",
            patterns.acceptance.overall * 100.0,
            patterns.acceptance.sample_size
        );
        if !patterns.productivity_blocks.is_empty() {
            let _ = writeln!(out, "\nProductivity windows:");
            for block in patterns.productivity_blocks.iter().take(5) {
                let _ = writeln!(out, "  • {} (score {:.0})", block.label(), block.score);
            }
        }
    }

    if !analysis.recommendations.is_empty() {
        let _ = writeln!(out, "\nRecommendations:");
        for rec in &analysis.recommendations {
            let _ = writeln!(out, "  • [{:?}] {} - {}", rec.priority, rec.title, rec.description);
        }
    }

    if !analysis.insights.is_empty() {
        let _ = writeln!(out, "\nInsights:");
        for insight in &analysis.insights {
            let _ = writeln!(out, "  • {}", insight);
        }
    }
    out
}

pub fn render_conflicts(analysis: &ConflictAnalysis, timezone: Tz) -> String {
    let mut out = String::new();
    let status = if analysis.can_proceed { "✅" } else { "❌" };
    let _ = writeln!(
        out,
        "{} '{}' at {}: {} hard, {} soft conflicts",
        status,
        analysis.proposed_event.title,
        local_time(analysis.proposed_event.start(), timezone),
        analysis.hard_conflicts.len(),
        analysis.soft_conflicts.len()
    );

    for conflict in analysis.hard_conflicts.iter().chain(&analysis.soft_conflicts) {
        conflict_line(&mut out, conflict);
    }

    if let Some(advice) = &analysis.ai_recommendation {
        let _ = writeln!(out, "\n{}", advice);
    }

    if !analysis.alternative_times.is_empty() {
        let _ = writeln!(out, "\nAlternatives:");
        out.push_str(&render_options(&analysis.alternative_times, timezone));
    }
    out
}

pub fn render_score(score: &MeetingScore, timezone: Tz) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Score {}/100 (confidence {:.0}%, success rate {:.0}%)",
        score.score,
        score.confidence,
        score.success_rate * 100.0
    );
    let _ = writeln!(out, "{}", score.recommendation);

    for factor in &score.factors {
        let _ = writeln!(out, "  {:+4}  {}: {}", factor.impact, factor.name, factor.description);
    }

    if !score.alternative_times.is_empty() {
        let _ = writeln!(out, "\nBetter times:");
        for time in &score.alternative_times {
            let _ = writeln!(out, "  • {}", local_time(*time, timezone));
        }
    }
    out
}

pub fn render_options(options: &[RescheduleOption], timezone: Tz) -> String {
    if options.is_empty() {
        return "No suitable times found.\n".to_string();
    }

    let mut out = String::new();
    for (index, option) in options.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}. {} - {}  score {}  {}",
            index + 1,
            local_time(option.proposed_time, timezone),
            to_local(option.end_time, timezone).format("%H:%M"),
            option.score,
            option.insight
        );
        for pro in &option.pros {
            let _ = writeln!(out, "     + {}", pro);
        }
        for con in &option.cons {
            let _ = writeln!(out, "     - {}", con);
        }
    }
    out
}

pub fn render_focus_analysis(analysis: &FocusAnalysis) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "🎯 Focus time: {:.1}h protected, target {:.1}h/week (confidence {:.0}%)",
        analysis.current_protection_hours, analysis.target_protection_hours, analysis.confidence
    );

    if let (Some(most), Some(least)) = (&analysis.most_productive_day, &analysis.least_productive_day) {
        let _ = writeln!(out, "Most productive day: {}, least productive: {}", most, least);
    }

    if !analysis.recommended_blocks.is_empty() {
        let _ = writeln!(out, "\nRecommended blocks:");
        for block in &analysis.recommended_blocks {
            let _ = writeln!(out, "  • {} ({} min) - {}", block.label(), block.duration, block.reason);
        }
    }

    for insight in &analysis.insights {
        let _ = writeln!(out, "  💡 {}", insight);
    }
    out
}

pub fn render_protection(outcome: &ProtectionOutcome, timezone: Tz) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "🛡️  Created {} focus blocks", outcome.created.len());
    for protected in &outcome.created {
        let _ = writeln!(
            out,
            "  ✓ {} starting {} on '{}'",
            protected.block.label(),
            local_time(protected.start_time, timezone),
            protected.calendar_id
        );
    }
    for failure in &outcome.failures {
        let _ = writeln!(out, "  ✗ {}: {}", failure.block.label(), failure.error);
    }
    out
}

pub fn render_schedule_change(change: &ScheduleChange, timezone: Tz) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} (confidence {:.0}%)", change.reason, change.confidence);

    if change.changes.is_empty() {
        let _ = writeln!(out, "No changes proposed.");
        return out;
    }

    for item in &change.changes {
        let when = item
            .new_start_time
            .map(|t| local_time(t, timezone))
            .unwrap_or_default();
        let marker = match item.action {
            ChangeAction::Reschedule => "↻",
            ChangeAction::Protect => "🛡️ ",
        };
        let _ = writeln!(out, "  {} {} -> {}", marker, item.description, when);
    }

    let impact = &change.impact;
    let _ = writeln!(
        out,
        "\nImpact: {} rescheduled, {} conflicts resolved, {:.1}h focus gained, {} participants affected",
        impact.meetings_rescheduled,
        impact.conflicts_resolved,
        impact.focus_time_gained_hours,
        impact.participants_affected
    );
    for risk in &impact.risks {
        let _ = writeln!(out, "  ⚠️  {}", risk);
    }
    if !change.auto_applied {
        let _ = writeln!(out, "\nRun again with --auto-apply to make these changes.");
    }
    out
}

pub fn render_applied(applied: &AppliedChanges) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Applied: {} events moved, {} focus blocks created",
        applied.updated.len(),
        applied.created.len()
    );
    for failure in &applied.failures {
        let _ = writeln!(out, "  ✗ {}", failure);
    }
    out
}

pub fn render_duration(optimization: &DurationOptimization) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "⏱️  {}", optimization.recommendation);
    let _ = writeln!(
        out,
        "{} ({} meetings observed, confidence {:.0}%)",
        optimization.reason, optimization.historical_data.sample_size, optimization.confidence
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar_client::Event;
    use crate::focus_optimizer::recommend_duration;
    use crate::meeting_scorer::ScoreFactor;
    use crate::pattern_learner::DurationStats;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_render_options_numbers_from_one() {
        let option = RescheduleOption {
            proposed_time: utc("2025-01-15T14:00:00Z"),
            end_time: utc("2025-01-15T14:30:00Z"),
            score: 90,
            conflicts: Vec::new(),
            pros: vec!["No conflicts".to_string()],
            cons: Vec::new(),
            participant_match: 100.0,
            insight: "Excellent choice".to_string(),
        };

        let text = render_options(&[option], chrono_tz::Europe::Berlin);
        assert!(text.starts_with("1. Wed 2025-01-15 15:00 - 15:30  score 90  Excellent choice"));
        assert!(text.contains("+ No conflicts"));
        assert_eq!(render_options(&[], Tz::UTC), "No suitable times found.\n");
    }

    #[test]
    fn test_render_score_lists_factors() {
        let score = MeetingScore {
            score: 65,
            confidence: 40.0,
            success_rate: 0.8,
            factors: vec![ScoreFactor {
                name: "Day Preference".to_string(),
                description: "Wednesday meetings are usually accepted".to_string(),
                impact: 15,
            }],
            recommendation: "Acceptable time".to_string(),
            alternative_times: vec![utc("2025-01-16T14:00:00Z")],
        };

        let text = render_score(&score, Tz::UTC);
        assert!(text.starts_with("Score 65/100 (confidence 40%, success rate 80%)"));
        assert!(text.contains(" +15  Day Preference"));
        assert!(text.contains("• Thu 2025-01-16 14:00"));
    }

    #[test]
    fn test_render_duration() {
        let stats = DurationStats {
            average_actual_minutes: 42.0,
            sample_size: 3,
            ..Default::default()
        };
        let text = render_duration(&recommend_duration("evt", 60, &stats));
        assert!(text.contains("Reduce from 60 to 45 minutes to save 15 minutes"));
        assert!(text.contains("(3 meetings observed, confidence 90%)"));
    }

    #[test]
    fn test_emit_serializes_structured_formats() {
        let event = Event::new("evt", "Sync", utc("2025-01-15T14:00:00Z"), utc("2025-01-15T14:30:00Z"));
        assert!(emit(OutputFormat::Json, &event, |_| unreachable!()).is_ok());
        assert!(emit(OutputFormat::Yaml, &event, |_| unreachable!()).is_ok());
        assert!(emit(OutputFormat::Text, &event, |e| e.title.clone()).is_ok());
    }
}
