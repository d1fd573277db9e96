use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::calendar_client::{CalendarClient, Event, InMemoryCalendar, NylasCalendarClient, Participant};
use crate::cli::{ConfigAction, ConflictArgs, FocusAction, OutputFormat, RescheduleArgs, ScoreArgs};
use crate::config::Config;
use crate::conflict_resolver::ConflictResolver;
use crate::error::{EngineError, EngineResult};
use crate::focus_optimizer::{AppliedChanges, FocusOptimizer, FocusTimeSettings, ScheduleChange};
use crate::meeting_scorer::{MeetingScore, MeetingScorer};
use crate::output;
use crate::pattern_learner::{MeetingPattern, PatternLearner};
use crate::reschedule::{apply_reschedule, RescheduleOption, RescheduleRequest, RescheduleSearch};
use crate::time_utils::to_local;

/// Grant used with a local events file when none is configured.
const LOCAL_GRANT: &str = "local";

/// Runs an engine call under a deadline; an elapsed deadline is an upstream failure.
pub async fn with_timeout<T, F>(limit: StdDuration, what: &str, future: F) -> Result<T>
where
    F: Future<Output = EngineResult<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(EngineError::timed_out(what, limit.as_secs()).into()),
    }
}

/// Everything a command needs to talk to the calendar and the engine.
pub struct Engine {
    client: Arc<dyn CalendarClient>,
    grant_id: String,
    timezone: Tz,
    config: Config,
    format: OutputFormat,
}

impl Engine {
    pub fn new(client: Arc<dyn CalendarClient>, grant_id: &str, config: Config, format: OutputFormat) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client,
            grant_id: grant_id.to_string(),
            timezone: config.timezone()?,
            config,
            format,
        })
    }

    /// Builds the calendar client from configuration and command-line overrides.
    pub fn connect(
        mut config: Config,
        grant: Option<String>,
        events_file: Option<PathBuf>,
        format: OutputFormat,
    ) -> Result<Self> {
        if let Some(path) = events_file {
            config.calendar.provider = "file".to_string();
            config.calendar.events_file = Some(path);
        }
        config.validate()?;
        let grant = grant.or_else(|| config.calendar.grant_id.clone());

        let (client, grant_id): (Arc<dyn CalendarClient>, String) = match config.calendar.provider.as_str() {
            "file" => {
                let path = config
                    .calendar
                    .events_file
                    .clone()
                    .context("No events file configured")?;
                let calendar = InMemoryCalendar::from_json_file(&path)?;
                (Arc::new(calendar), grant.unwrap_or_else(|| LOCAL_GRANT.to_string()))
            }
            _ => {
                let grant = grant.context("No grant configured. Pass --grant or set NYLAS_GRANT_ID")?;
                let client = NylasCalendarClient::new(config.nylas_config()?)?;
                (Arc::new(client), grant)
            }
        };

        Self::new(client, &grant_id, config, format)
    }

    fn learner(&self) -> Result<PatternLearner> {
        Ok(PatternLearner::new(self.client.clone())
            .with_timezone(self.timezone)
            .with_working_hours(self.config.scheduling.working_hours.hour_range()?)
            .with_user_email(self.config.calendar.user_email.clone()))
    }

    fn resolver(&self) -> ConflictResolver {
        ConflictResolver::new(self.client.clone(), self.timezone)
    }

    fn focus_optimizer(&self) -> Result<FocusOptimizer> {
        Ok(FocusOptimizer::new(self.learner()?).with_lookback_days(self.config.scheduling.lookback_days))
    }

    async fn learn(&self, days: u32) -> Result<Option<MeetingPattern>> {
        let learner = self.learner()?;
        let analysis = with_timeout(
            self.config.general.analysis_timeout(),
            "meeting history",
            learner.analyze_history(&self.grant_id, days),
        )
        .await?;
        Ok(analysis.patterns)
    }
}

pub async fn handle_analyze_command(engine: &Engine, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or(engine.config.scheduling.lookback_days);
    let learner = engine.learner()?;
    let analysis = with_timeout(
        engine.config.general.analysis_timeout(),
        "meeting history",
        learner.analyze_history(&engine.grant_id, days),
    )
    .await?;

    output::emit(engine.format, &analysis, output::render_analysis)
}

fn proposed_event(title: &str, start: DateTime<Utc>, minutes: u32, emails: &[String]) -> Event {
    let end = start + Duration::minutes(i64::from(minutes));
    Event::new("", title, start, end)
        .with_participants(emails.iter().map(|e| Participant::new(e)).collect())
}

pub async fn handle_conflicts_command(engine: &Engine, args: ConflictArgs) -> Result<()> {
    let patterns = engine.learn(engine.config.scheduling.lookback_days).await?;
    let proposed = proposed_event(&args.title, args.start, args.duration, &args.participants);

    let resolver = engine.resolver();
    let analysis = with_timeout(
        engine.config.general.request_timeout(),
        "conflict check",
        resolver.detect_conflicts(&engine.grant_id, &proposed, patterns.as_ref()),
    )
    .await?;

    output::emit(engine.format, &analysis, |a| output::render_conflicts(a, engine.timezone))
}

pub async fn handle_score_command(engine: &Engine, args: ScoreArgs) -> Result<()> {
    let patterns = engine.learn(engine.config.scheduling.lookback_days).await?;
    let score = match &patterns {
        Some(patterns) => MeetingScorer::new(patterns).score_meeting_time(args.start, &args.participants, args.duration),
        None => {
            log::info!("No meeting history, returning a neutral score");
            MeetingScore::without_history()
        }
    };

    output::emit(engine.format, &score, |s| output::render_score(s, engine.timezone))
}

#[derive(Debug, Serialize)]
struct RescheduleReport {
    event: Event,
    options: Vec<RescheduleOption>,
    #[serde(skip_serializing_if = "Option::is_none")]
    applied: Option<Event>,
}

pub async fn handle_reschedule_command(engine: &Engine, args: RescheduleArgs) -> Result<()> {
    let patterns = engine.learn(engine.config.scheduling.lookback_days).await?;

    let mut avoid_days = engine.config.scheduling.avoid_days.clone();
    avoid_days.extend(args.avoid_days.iter().cloned());
    let request = RescheduleRequest {
        reason: args.reason.clone(),
        preferred_times: args.preferred.clone(),
        must_include: args.must_include.clone(),
        avoid_days,
        max_delay_days: args.max_delay_days.unwrap_or(engine.config.scheduling.max_delay_days),
        notify_participants: args.notify,
        ..RescheduleRequest::new(&args.event_id)
    };

    let resolver = engine.resolver();
    let search = RescheduleSearch::new(&resolver);
    let (event, options) = with_timeout(
        engine.config.general.analysis_timeout(),
        "reschedule search",
        search.suggest_for_event(&engine.grant_id, &args.calendar, &request, patterns.as_ref()),
    )
    .await?;

    let applied = match args.apply {
        Some(position) => {
            let Some(option) = position.checked_sub(1).and_then(|i| options.get(i)) else {
                bail!(
                    "No suggestion #{} to apply ({} available)",
                    position,
                    options.len()
                );
            };
            let moved = with_timeout(
                engine.config.general.request_timeout(),
                "event update",
                apply_reschedule(engine.client.as_ref(), &engine.grant_id, &event, option, request.notify_participants),
            )
            .await?;
            Some(moved)
        }
        None => None,
    };

    let report = RescheduleReport { event, options, applied };
    output::emit(engine.format, &report, |r| {
        let mut text = format!("Suggestions for '{}':\n", r.event.title);
        text.push_str(&output::render_options(&r.options, engine.timezone));
        if let Some(moved) = &r.applied {
            text.push_str(&format!(
                "\n✓ Moved '{}' to {}\n",
                moved.title,
                to_local(moved.start(), engine.timezone).format("%a %Y-%m-%d %H:%M")
            ));
        }
        text
    })
}

fn focus_settings(engine: &Engine, target_hours: Option<f64>, auto_decline: bool) -> Result<FocusTimeSettings> {
    let mut settings = engine.config.focus.clone();
    if let Some(hours) = target_hours {
        settings.target_hours_per_week = hours;
    }
    settings.auto_decline |= auto_decline;
    settings.validate()?;
    Ok(settings)
}

#[derive(Debug, Serialize)]
struct AdaptReport {
    schedule: ScheduleChange,
    #[serde(skip_serializing_if = "Option::is_none")]
    applied: Option<AppliedChanges>,
}

pub async fn handle_focus_command(engine: &Engine, action: FocusAction) -> Result<()> {
    let optimizer = engine.focus_optimizer()?;
    let analysis_timeout = engine.config.general.analysis_timeout();
    let request_timeout = engine.config.general.request_timeout();

    match action {
        FocusAction::Analyze { target_hours } => {
            let settings = focus_settings(engine, target_hours, false)?;
            let analysis = with_timeout(
                analysis_timeout,
                "focus analysis",
                optimizer.analyze_focus_time_patterns(&engine.grant_id, &settings),
            )
            .await?;
            output::emit(engine.format, &analysis, output::render_focus_analysis)
        }
        FocusAction::Protect { auto_decline, target_hours } => {
            let settings = focus_settings(engine, target_hours, auto_decline)?;
            if !settings.enabled {
                bail!("Focus time is disabled. Enable it with: cadence config set focus.enabled true");
            }

            let analysis = with_timeout(
                analysis_timeout,
                "focus analysis",
                optimizer.analyze_focus_time_patterns(&engine.grant_id, &settings),
            )
            .await?;
            if analysis.recommended_blocks.is_empty() {
                println!("No focus blocks to protect yet: {}", analysis.insights.join(" "));
                return Ok(());
            }

            let outcome = with_timeout(
                request_timeout,
                "focus block creation",
                optimizer.create_protected_blocks(&engine.grant_id, &analysis.recommended_blocks, &settings),
            )
            .await?;
            output::emit(engine.format, &outcome, |o| output::render_protection(o, engine.timezone))
        }
        FocusAction::Adapt { trigger, auto_apply, notify } => {
            let mut schedule = with_timeout(
                analysis_timeout,
                "schedule adaptation",
                optimizer.adapt_schedule(&engine.grant_id, trigger),
            )
            .await?;

            let applied = if auto_apply && !schedule.changes.is_empty() {
                Some(
                    with_timeout(
                        request_timeout,
                        "schedule changes",
                        optimizer.apply_schedule_change(&engine.grant_id, &mut schedule, notify),
                    )
                    .await?,
                )
            } else {
                None
            };

            let report = AdaptReport { schedule, applied };
            output::emit(engine.format, &report, |r| {
                let mut text = output::render_schedule_change(&r.schedule, engine.timezone);
                if let Some(applied) = &r.applied {
                    text.push('\n');
                    text.push_str(&output::render_applied(applied));
                }
                text
            })
        }
    }
}

pub async fn handle_optimize_duration_command(engine: &Engine, event_id: &str, calendar_id: &str) -> Result<()> {
    let optimizer = engine.focus_optimizer()?;
    let optimization = with_timeout(
        engine.config.general.analysis_timeout(),
        "duration optimization",
        optimizer.optimize_meeting_duration(&engine.grant_id, calendar_id, event_id),
    )
    .await?;
    output::emit(engine.format, &optimization, output::render_duration)
}

pub fn handle_config_command(action: &ConfigAction, config: &Config, format: OutputFormat) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let mut shown = config.clone();
            if shown.calendar.api_key.is_some() {
                shown.calendar.api_key = Some("********".to_string());
            }
            match format {
                OutputFormat::Text => {
                    println!("# {}", Config::get_config_path().display());
                    println!("{}", toml::to_string_pretty(&shown).context("Failed to render configuration")?);
                    Ok(())
                }
                _ => output::emit(format, &shown, |_| String::new()),
            }
        }
        ConfigAction::Init => Config::create_sample_config(),
        ConfigAction::Set { key, value } => {
            let path = Config::get_config_path();
            let mut stored = Config::load_from_path(&path)?.unwrap_or_default();
            stored.set_value(key, value)?;
            stored.validate()?;
            stored.save_to_path(&path)?;
            println!("Set {} = {}", key, value);
            Ok(())
        }
        ConfigAction::Keys => {
            for key in Config::get_available_keys() {
                println!("{}", key);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar_client::{Calendar, CalendarSnapshot, CreateEventRequest, EventQuery, UpdateEventRequest};
    use async_trait::async_trait;

    struct SlowCalendar;

    #[async_trait]
    impl CalendarClient for SlowCalendar {
        async fn get_calendars(&self, _grant_id: &str) -> anyhow::Result<Vec<Calendar>> {
            tokio::time::sleep(StdDuration::from_secs(5)).await;
            Ok(Vec::new())
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
    async fn test_timeout_maps_to_upstream_error() {
        let learner = PatternLearner::new(Arc::new(SlowCalendar));
        let err = with_timeout(
            StdDuration::from_millis(20),
            "meeting history",
            learner.analyze_history("grant", 30),
        )
        .await
        .unwrap_err();

        let engine_err = err.downcast_ref::<EngineError>().unwrap();
        assert!(engine_err.is_upstream());
        assert!(err.to_string().contains("meeting history"));
    }

    #[tokio::test]
    async fn test_engine_uses_configured_timezone() {
        let mut config = Config::default();
        config.scheduling.timezone = "Europe/Berlin".to_string();
        let engine = Engine::new(
            Arc::new(InMemoryCalendar::new(CalendarSnapshot::default())),
            "grant",
            config,
            OutputFormat::Json,
        )
        .unwrap();

        assert_eq!(engine.timezone, chrono_tz::Europe::Berlin);
        assert!(engine.learn(30).await.unwrap().is_none());
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let mut config = Config::default();
        config.scheduling.working_hours.end = "08:00".to_string();
        let result = Engine::new(Arc::new(InMemoryCalendar::default()), "grant", config, OutputFormat::Text);
        assert!(result.is_err());
    }

    #[test]
    fn test_focus_settings_overrides() {
        let engine = Engine::new(Arc::new(InMemoryCalendar::default()), "grant", Config::default(), OutputFormat::Text)
            .unwrap();
        let settings = focus_settings(&engine, Some(6.0), true).unwrap();
        assert_eq!(settings.target_hours_per_week, 6.0);
        assert!(settings.auto_decline);
        assert!(focus_settings(&engine, Some(-1.0), false).is_err());
    }

    #[test]
    fn test_proposed_event_carries_participants() {
        let start = DateTime::parse_from_rfc3339("2025-01-15T14:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = proposed_event("Sync", start, 45, &["a@example.com".to_string()]);
        assert!(event.id.is_empty());
        assert_eq!(event.duration_minutes(), 45);
        assert_eq!(event.participant_emails(), vec!["a@example.com"]);
    }
}
