use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Calendar {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Yes,
    No,
    Maybe,
    #[default]
    Noreply,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub status: ParticipantStatus,
}

impl Participant {
    pub fn new(email: &str) -> Self {
        Self {
            email: email.to_string(),
            name: None,
            status: ParticipantStatus::Noreply,
        }
    }

    pub fn with_status(mut self, status: ParticipantStatus) -> Self {
        self.status = status;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[default]
    Confirmed,
    Tentative,
    Cancelled,
    #[serde(other)]
    Unknown,
}

/// Timespan of an event in unix seconds. All-day events carry no start/end
/// seconds and are ignored by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EventWhen {
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub end_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timezone: Option<String>,
}

impl EventWhen {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start_time: start.timestamp(),
            end_time: end.timestamp(),
            start_timezone: None,
            end_timezone: None,
        }
    }
}

fn default_busy() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub calendar_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub when: EventWhen,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<Participant>,
    #[serde(default)]
    pub status: EventStatus,
    #[serde(default = "default_busy")]
    pub busy: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recurrence: Vec<String>,
    /// Observed length of the meeting when a recorder or notetaker reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_duration_minutes: Option<u32>,
}

/// The user's own answer to an invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Accepted,
    Declined,
    Pending,
}

impl Event {
    pub fn new(id: &str, title: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            calendar_id: String::new(),
            title: title.to_string(),
            description: None,
            location: None,
            when: EventWhen::between(start, end),
            participants: Vec::new(),
            organizer: None,
            status: EventStatus::Confirmed,
            busy: true,
            read_only: false,
            recurrence: Vec::new(),
            actual_duration_minutes: None,
        }
    }

    pub fn with_calendar(mut self, calendar_id: &str) -> Self {
        self.calendar_id = calendar_id.to_string();
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_busy(mut self, busy: bool) -> Self {
        self.busy = busy;
        self
    }

    pub fn with_participants(mut self, participants: Vec<Participant>) -> Self {
        self.participants = participants;
        self
    }

    pub fn with_actual_duration(mut self, minutes: u32) -> Self {
        self.actual_duration_minutes = Some(minutes);
        self
    }

    /// Copy of this event moved to a new time range.
    pub fn moved_to(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let mut moved = self.clone();
        moved.when.start_time = start.timestamp();
        moved.when.end_time = end.timestamp();
        moved
    }

    pub fn start(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.when.start_time, 0)
            .single()
            .unwrap_or_default()
    }

    pub fn end(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.when.end_time, 0)
            .single()
            .unwrap_or_default()
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.when.end_time - self.when.start_time) / 60
    }

    /// True for events with a concrete start and end instant.
    pub fn is_timed(&self) -> bool {
        self.when.start_time > 0 && self.when.end_time > self.when.start_time
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == EventStatus::Cancelled
    }

    /// Events that actually occupy time: not cancelled and not marked free.
    pub fn is_blocking(&self) -> bool {
        !self.is_cancelled() && self.busy
    }

    pub fn participant_emails(&self) -> Vec<String> {
        self.participants.iter().map(|p| p.email.clone()).collect()
    }

    /// The user's response, read from their participant entry when `user_email`
    /// matches one; otherwise the event status stands in.
    pub fn response_for(&self, user_email: Option<&str>) -> Response {
        let own = user_email.and_then(|email| {
            self.participants
                .iter()
                .find(|p| p.email.eq_ignore_ascii_case(email))
        });

        match own {
            Some(participant) => match participant.status {
                ParticipantStatus::Yes => Response::Accepted,
                ParticipantStatus::No => Response::Declined,
                _ => Response::Pending,
            },
            None => match self.status {
                EventStatus::Confirmed => Response::Accepted,
                EventStatus::Cancelled => Response::Declined,
                _ => Response::Pending,
            },
        }
    }

    /// Zone the event was scheduled in; events without one count as UTC.
    pub fn timezone_label(&self) -> &str {
        self.when
            .start_timezone
            .as_deref()
            .filter(|tz| !tz.is_empty())
            .unwrap_or("UTC")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventQuery {
    pub start: i64,
    pub end: i64,
    pub show_cancelled: bool,
}

impl EventQuery {
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: start.timestamp(),
            end: end.timestamp(),
            show_cancelled: true,
        }
    }

    fn matches(&self, event: &Event) -> bool {
        if !self.show_cancelled && event.is_cancelled() {
            return false;
        }
        event.when.start_time < self.end && event.when.end_time > self.start
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateEventRequest {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub when: EventWhen,
    pub busy: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recurrence: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UpdateEventRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<EventWhen>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<Participant>>,
    /// Sent as a query parameter, not in the body.
    #[serde(skip)]
    pub notify_participants: bool,
}

/// The calendar backend the engine reads from and writes to.
#[async_trait]
pub trait CalendarClient: Send + Sync {
    async fn get_calendars(&self, grant_id: &str) -> Result<Vec<Calendar>>;

    async fn get_events(&self, grant_id: &str, calendar_id: &str, query: &EventQuery) -> Result<Vec<Event>>;

    async fn get_event(&self, grant_id: &str, calendar_id: &str, event_id: &str) -> Result<Event>;

    async fn create_event(&self, grant_id: &str, calendar_id: &str, request: &CreateEventRequest) -> Result<Event>;

    async fn update_event(
        &self,
        grant_id: &str,
        calendar_id: &str,
        event_id: &str,
        request: &UpdateEventRequest,
    ) -> Result<Event>;
}

/// Fetches every timed event in `[start, end)` across all calendars of a grant,
/// sorted by start time. Any failing calendar aborts the whole fetch.
pub async fn fetch_events(
    client: &dyn CalendarClient,
    grant_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> EngineResult<Vec<Event>> {
    let calendars = client
        .get_calendars(grant_id)
        .await
        .map_err(|e| EngineError::fetch(format!("calendars for grant '{}'", grant_id), e))?;

    let query = EventQuery::between(start, end);
    let mut events = Vec::new();

    for calendar in &calendars {
        let fetched = client
            .get_events(grant_id, &calendar.id, &query)
            .await
            .map_err(|e| EngineError::fetch(format!("events for calendar '{}'", calendar.id), e))?;
        log::debug!("Fetched {} events from calendar '{}'", fetched.len(), calendar.id);

        events.extend(fetched.into_iter().filter(Event::is_timed).map(|mut event| {
            if event.calendar_id.is_empty() {
                event.calendar_id = calendar.id.clone();
            }
            event
        }));
    }

    events.sort_by_key(|e| (e.when.start_time, e.when.end_time));
    Ok(events)
}

/// Nylas v3 connection settings
#[derive(Debug, Clone)]
pub struct NylasConfig {
    pub api_key: String,
    pub api_url: String,
    pub timeout: StdDuration,
}

impl Default for NylasConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("NYLAS_API_KEY").unwrap_or_default(),
            api_url: "https://api.us.nylas.com".to_string(),
            timeout: StdDuration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct NylasEnvelope<T> {
    data: T,
    #[serde(default)]
    next_cursor: Option<String>,
}

const PAGE_LIMIT: u32 = 200;

/// Calendar client for the Nylas v3 REST API
#[derive(Debug, Clone)]
pub struct NylasCalendarClient {
    config: NylasConfig,
    client: Client,
}

impl NylasCalendarClient {
    pub fn new(config: NylasConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            bail!("Nylas API key is required");
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { config, client })
    }

    fn grant_url(&self, grant_id: &str, path: &str) -> String {
        format!(
            "{}/v3/grants/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            urlencoding::encode(grant_id),
            path
        )
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<NylasEnvelope<T>> {
        let response = request
            .bearer_auth(&self.config.api_key)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to reach Nylas API")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Nylas API error ({}): {}", status, body);
        }

        response
            .json::<NylasEnvelope<T>>()
            .await
            .context("Failed to decode Nylas API response")
    }
}

#[async_trait]
impl CalendarClient for NylasCalendarClient {
    async fn get_calendars(&self, grant_id: &str) -> Result<Vec<Calendar>> {
        let request = self.client.get(self.grant_url(grant_id, "calendars"));
        Ok(self.send::<Vec<Calendar>>(request).await?.data)
    }

    async fn get_events(&self, grant_id: &str, calendar_id: &str, query: &EventQuery) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut params = vec![
                ("calendar_id", calendar_id.to_string()),
                ("start", query.start.to_string()),
                ("end", query.end.to_string()),
                ("show_cancelled", query.show_cancelled.to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ];
            if let Some(token) = &cursor {
                params.push(("page_token", token.clone()));
            }

            let request = self.client.get(self.grant_url(grant_id, "events")).query(&params);
            let page = self.send::<Vec<Event>>(request).await?;
            events.extend(page.data);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(events)
    }

    async fn get_event(&self, grant_id: &str, calendar_id: &str, event_id: &str) -> Result<Event> {
        let path = format!("events/{}", urlencoding::encode(event_id));
        let request = self
            .client
            .get(self.grant_url(grant_id, &path))
            .query(&[("calendar_id", calendar_id)]);
        Ok(self.send::<Event>(request).await?.data)
    }

    async fn create_event(&self, grant_id: &str, calendar_id: &str, request: &CreateEventRequest) -> Result<Event> {
        let http = self
            .client
            .post(self.grant_url(grant_id, "events"))
            .query(&[("calendar_id", calendar_id)])
            .json(request);
        Ok(self.send::<Event>(http).await?.data)
    }

    async fn update_event(
        &self,
        grant_id: &str,
        calendar_id: &str,
        event_id: &str,
        request: &UpdateEventRequest,
    ) -> Result<Event> {
        let path = format!("events/{}", urlencoding::encode(event_id));
        let notify = request.notify_participants.to_string();
        let http = self
            .client
            .put(self.grant_url(grant_id, &path))
            .query(&[("calendar_id", calendar_id), ("notify_participants", notify.as_str())])
            .json(request);
        Ok(self.send::<Event>(http).await?.data)
    }
}

/// On-disk layout of an offline calendar export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalendarSnapshot {
    #[serde(default)]
    pub calendars: Vec<Calendar>,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Calendar held in memory, optionally backed by a JSON snapshot file that is
/// rewritten after every mutation.
#[derive(Debug, Default)]
pub struct InMemoryCalendar {
    snapshot: RwLock<CalendarSnapshot>,
    path: Option<PathBuf>,
}

impl InMemoryCalendar {
    pub fn new(snapshot: CalendarSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
            path: None,
        }
    }

    /// Single calendar named `calendar_id` holding `events`.
    pub fn with_events(calendar_id: &str, events: Vec<Event>) -> Self {
        let events = events
            .into_iter()
            .map(|event| event.with_calendar(calendar_id))
            .collect();
        Self::new(CalendarSnapshot {
            calendars: vec![Calendar {
                id: calendar_id.to_string(),
                name: calendar_id.to_string(),
                is_primary: true,
                read_only: false,
                timezone: None,
            }],
            events,
        })
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read calendar snapshot '{}'", path.display()))?;
        let snapshot: CalendarSnapshot = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse calendar snapshot '{}'", path.display()))?;

        Ok(Self {
            snapshot: RwLock::new(snapshot),
            path: Some(path.to_path_buf()),
        })
    }

    pub async fn events(&self) -> Vec<Event> {
        self.snapshot.read().await.events.clone()
    }

    async fn persist(&self, snapshot: &CalendarSnapshot) -> Result<()> {
        if let Some(path) = &self.path {
            let contents = serde_json::to_string_pretty(snapshot)?;
            tokio::fs::write(path, contents)
                .await
                .with_context(|| format!("Failed to write calendar snapshot '{}'", path.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl CalendarClient for InMemoryCalendar {
    async fn get_calendars(&self, _grant_id: &str) -> Result<Vec<Calendar>> {
        Ok(self.snapshot.read().await.calendars.clone())
    }

    async fn get_events(&self, _grant_id: &str, calendar_id: &str, query: &EventQuery) -> Result<Vec<Event>> {
        let snapshot = self.snapshot.read().await;
        Ok(snapshot
            .events
            .iter()
            .filter(|e| e.calendar_id == calendar_id && query.matches(e))
            .cloned()
            .collect())
    }

    async fn get_event(&self, _grant_id: &str, calendar_id: &str, event_id: &str) -> Result<Event> {
        let snapshot = self.snapshot.read().await;
        snapshot
            .events
            .iter()
            .find(|e| e.id == event_id && (calendar_id.is_empty() || e.calendar_id == calendar_id))
            .cloned()
            .with_context(|| format!("Event '{}' not found", event_id))
    }

    async fn create_event(&self, _grant_id: &str, calendar_id: &str, request: &CreateEventRequest) -> Result<Event> {
        let mut snapshot = self.snapshot.write().await;
        if !snapshot.calendars.iter().any(|c| c.id == calendar_id) {
            bail!("Calendar '{}' not found", calendar_id);
        }

        let mut event = Event::new(
            &Uuid::new_v4().to_string(),
            &request.title,
            Utc.timestamp_opt(request.when.start_time, 0).single().unwrap_or_default(),
            Utc.timestamp_opt(request.when.end_time, 0).single().unwrap_or_default(),
        )
        .with_calendar(calendar_id)
        .with_busy(request.busy)
        .with_participants(request.participants.clone());
        event.when = request.when.clone();
        event.description = request.description.clone();
        event.recurrence = request.recurrence.clone();

        snapshot.events.push(event.clone());
        self.persist(&snapshot).await?;
        Ok(event)
    }

    async fn update_event(
        &self,
        _grant_id: &str,
        calendar_id: &str,
        event_id: &str,
        request: &UpdateEventRequest,
    ) -> Result<Event> {
        let mut snapshot = self.snapshot.write().await;
        let event = snapshot
            .events
            .iter_mut()
            .find(|e| e.id == event_id && e.calendar_id == calendar_id)
            .with_context(|| format!("Event '{}' not found in calendar '{}'", event_id, calendar_id))?;

        if event.read_only {
            bail!("Event '{}' is read-only", event_id);
        }
        if let Some(title) = &request.title {
            event.title = title.clone();
        }
        if let Some(when) = &request.when {
            event.when = when.clone();
        }
        if let Some(participants) = &request.participants {
            event.participants = participants.clone();
        }

        let updated = event.clone();
        self.persist(&snapshot).await?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn meeting(id: &str, start: &str, minutes: i64) -> Event {
        let start = utc(start);
        Event::new(id, id, start, start + chrono::Duration::minutes(minutes))
    }

    #[test]
    fn test_event_deserializes_nylas_payload() {
        let json = r#"{
            "id": "evt_1",
            "calendar_id": "primary",
            "title": "Planning",
            "when": {"start_time": 1736949600, "end_time": 1736953200, "start_timezone": "Europe/Berlin", "object": "timespan"},
            "participants": [{"email": "me@example.com", "status": "yes"}, {"email": "x@example.com", "status": "weird"}],
            "status": "confirmed",
            "busy": true,
            "conferencing": {"provider": "Zoom"}
        }"#;

        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.start(), utc("2025-01-15T14:00:00Z"));
        assert_eq!(event.duration_minutes(), 60);
        assert_eq!(event.participants[0].status, ParticipantStatus::Yes);
        assert_eq!(event.participants[1].status, ParticipantStatus::Unknown);
        assert_eq!(event.timezone_label(), "Europe/Berlin");
        assert!(event.is_blocking());
    }

    #[test]
    fn test_busy_defaults_to_true_and_all_day_events_are_untimed() {
        let json = r#"{"id": "holiday", "when": {"date": "2025-01-01", "object": "date"}}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert!(event.busy);
        assert!(!event.is_timed());
        assert_eq!(event.timezone_label(), "UTC");
    }

    #[test]
    fn test_response_for_prefers_own_participant_entry() {
        let event = meeting("a", "2025-01-15T14:00:00Z", 30).with_participants(vec![
            Participant::new("Me@Example.com").with_status(ParticipantStatus::No),
            Participant::new("other@example.com").with_status(ParticipantStatus::Yes),
        ]);
        assert_eq!(event.response_for(Some("me@example.com")), Response::Declined);

        let maybe = meeting("b", "2025-01-15T14:00:00Z", 30).with_participants(vec![
            Participant::new("me@example.com").with_status(ParticipantStatus::Maybe),
        ]);
        assert_eq!(maybe.response_for(Some("me@example.com")), Response::Pending);
    }

    #[test]
    fn test_response_for_falls_back_to_event_status() {
        let confirmed = meeting("a", "2025-01-15T14:00:00Z", 30);
        assert_eq!(confirmed.response_for(None), Response::Accepted);

        let cancelled = confirmed.clone().with_status(EventStatus::Cancelled);
        assert_eq!(cancelled.response_for(Some("nobody@example.com")), Response::Declined);

        let tentative = confirmed.with_status(EventStatus::Tentative);
        assert_eq!(tentative.response_for(None), Response::Pending);
    }

    #[test]
    fn test_blocking_excludes_cancelled_and_free() {
        let base = meeting("a", "2025-01-15T14:00:00Z", 30);
        assert!(base.is_blocking());
        assert!(!base.clone().with_busy(false).is_blocking());
        assert!(!base.with_status(EventStatus::Cancelled).is_blocking());
    }

    #[test]
    fn test_moved_to_keeps_identity() {
        let event = meeting("a", "2025-01-15T14:00:00Z", 45);
        let moved = event.moved_to(utc("2025-01-16T10:00:00Z"), utc("2025-01-16T10:45:00Z"));
        assert_eq!(moved.id, "a");
        assert_eq!(moved.start(), utc("2025-01-16T10:00:00Z"));
        assert_eq!(moved.duration_minutes(), 45);
    }

    #[tokio::test]
    async fn test_fetch_events_filters_range_and_sorts() {
        let client = InMemoryCalendar::with_events(
            "work",
            vec![
                meeting("late", "2025-01-15T16:00:00Z", 30),
                meeting("early", "2025-01-15T09:00:00Z", 30),
                meeting("outside", "2025-01-17T09:00:00Z", 30),
                meeting("cancelled", "2025-01-15T11:00:00Z", 30).with_status(EventStatus::Cancelled),
            ],
        );

        let events = fetch_events(
            &client,
            "grant",
            utc("2025-01-15T00:00:00Z"),
            utc("2025-01-16T00:00:00Z"),
        )
        .await
        .unwrap();

        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "cancelled", "late"]);
        assert!(events.iter().all(|e| e.calendar_id == "work"));
    }

    struct FailingClient;

    #[async_trait]
    impl CalendarClient for FailingClient {
        async fn get_calendars(&self, _grant_id: &str) -> Result<Vec<Calendar>> {
            Ok(vec![Calendar {
                id: "work".to_string(),
                name: "Work".to_string(),
                is_primary: true,
                read_only: false,
                timezone: None,
            }])
        }

        async fn get_events(&self, _g: &str, _c: &str, _q: &EventQuery) -> Result<Vec<Event>> {
            bail!("connection reset")
        }

        async fn get_event(&self, _g: &str, _c: &str, _e: &str) -> Result<Event> {
            bail!("connection reset")
        }

        async fn create_event(&self, _g: &str, _c: &str, _r: &CreateEventRequest) -> Result<Event> {
            bail!("connection reset")
        }

        async fn update_event(&self, _g: &str, _c: &str, _e: &str, _r: &UpdateEventRequest) -> Result<Event> {
            bail!("connection reset")
        }
    }

    #[tokio::test]
    async fn test_fetch_events_propagates_calendar_failure() {
        let err = fetch_events(
            &FailingClient,
            "grant",
            utc("2025-01-15T00:00:00Z"),
            utc("2025-01-16T00:00:00Z"),
        )
        .await
        .unwrap_err();

        assert!(err.is_upstream());
        assert!(err.to_string().contains("events for calendar 'work'"));
    }

    #[tokio::test]
    async fn test_in_memory_create_and_update() {
        let client = InMemoryCalendar::with_events("work", vec![meeting("a", "2025-01-15T14:00:00Z", 30)]);

        let created = client
            .create_event(
                "grant",
                "work",
                &CreateEventRequest {
                    title: "Focus Time".to_string(),
                    description: None,
                    when: EventWhen::between(utc("2025-01-16T09:00:00Z"), utc("2025-01-16T11:00:00Z")),
                    busy: true,
                    participants: Vec::new(),
                    recurrence: vec!["RRULE:FREQ=WEEKLY".to_string()],
                },
            )
            .await
            .unwrap();
        assert_eq!(created.calendar_id, "work");
        assert_eq!(created.duration_minutes(), 120);

        let updated = client
            .update_event(
                "grant",
                "work",
                "a",
                &UpdateEventRequest {
                    when: Some(EventWhen::between(utc("2025-01-17T14:00:00Z"), utc("2025-01-17T14:30:00Z"))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.start(), utc("2025-01-17T14:00:00Z"));
        assert_eq!(client.events().await.len(), 2);

        assert!(client
            .create_event(
                "grant",
                "missing",
                &CreateEventRequest {
                    title: "x".to_string(),
                    description: None,
                    when: EventWhen::default(),
                    busy: true,
                    participants: Vec::new(),
                    recurrence: Vec::new(),
                },
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_snapshot_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calendar.json");
        let snapshot = CalendarSnapshot {
            calendars: vec![Calendar {
                id: "work".to_string(),
                name: "Work".to_string(),
                is_primary: true,
                read_only: false,
                timezone: None,
            }],
            events: vec![meeting("a", "2025-01-15T14:00:00Z", 30).with_calendar("work")],
        };
        std::fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        let client = InMemoryCalendar::from_json_file(&path).unwrap();
        client
            .update_event(
                "grant",
                "work",
                "a",
                &UpdateEventRequest {
                    title: Some("Renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let reloaded = InMemoryCalendar::from_json_file(&path).unwrap();
        assert_eq!(reloaded.events().await[0].title, "Renamed");
    }

    #[test]
    fn test_nylas_client_requires_api_key() {
        let config = NylasConfig {
            api_key: String::new(),
            ..NylasConfig::default()
        };
        assert!(NylasCalendarClient::new(config).is_err());

        let client = NylasCalendarClient::new(NylasConfig {
            api_key: "key".to_string(),
            api_url: "https://api.us.nylas.com/".to_string(),
            timeout: StdDuration::from_secs(5),
        })
        .unwrap();
        assert_eq!(
            client.grant_url("grant/1", "events"),
            "https://api.us.nylas.com/v3/grants/grant%2F1/events"
        );
    }
}
