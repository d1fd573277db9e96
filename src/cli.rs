use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::focus_optimizer::AdaptiveTrigger;
use crate::pattern_learner::MAX_LOOKBACK_DAYS;
use crate::reschedule::MAX_DELAY_DAYS_LIMIT;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
pub struct Cli {
    /// Output format
    #[clap(long, value_enum, global = true, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Calendar grant to operate on (defaults to calendar.grant_id)
    #[clap(long, global = true)]
    pub grant: Option<String>,

    /// Use a JSON calendar snapshot instead of the Nylas API
    #[clap(long, global = true)]
    pub events_file: Option<PathBuf>,

    /// Log engine progress to stderr
    #[clap(short, long, global = true)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Learn meeting patterns from calendar history
    Analyze {
        /// Days of history to analyze
        #[clap(short, long, value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_LOOKBACK_DAYS)))]
        days: Option<u32>,
    },
    /// Check a proposed meeting for conflicts
    Conflicts(ConflictArgs),
    /// Score a proposed meeting time
    Score(ScoreArgs),
    /// Suggest new times for an existing meeting
    Reschedule(RescheduleArgs),
    /// Analyze and protect focus time
    Focus(FocusArgs),
    /// Recommend a better length for a recurring meeting
    OptimizeDuration {
        event_id: String,
        #[clap(short, long)]
        calendar: String,
    },
    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ConflictArgs {
    #[clap(short, long)]
    pub title: String,
    /// Start time (RFC 3339)
    #[clap(short, long)]
    pub start: DateTime<Utc>,
    /// Length in minutes
    #[clap(short, long, default_value_t = 30)]
    pub duration: u32,
    #[clap(short, long = "participant")]
    pub participants: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ScoreArgs {
    /// Start time (RFC 3339)
    #[clap(short, long)]
    pub start: DateTime<Utc>,
    /// Length in minutes
    #[clap(short, long, default_value_t = 30)]
    pub duration: u32,
    #[clap(short, long = "participant")]
    pub participants: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct RescheduleArgs {
    pub event_id: String,
    #[clap(short, long)]
    pub calendar: String,
    /// Reason passed along with the request
    #[clap(short, long)]
    pub reason: Option<String>,
    /// Preferred start times (RFC 3339), tried first
    #[clap(long = "preferred")]
    pub preferred: Vec<DateTime<Utc>>,
    /// Participants that must attend the new slot
    #[clap(long = "must-include")]
    pub must_include: Vec<String>,
    /// Days to skip, e.g. Friday
    #[clap(long = "avoid-day")]
    pub avoid_days: Vec<String>,
    #[clap(long, value_parser = clap::value_parser!(u32).range(0..=i64::from(MAX_DELAY_DAYS_LIMIT)))]
    pub max_delay_days: Option<u32>,
    /// Notify participants when applying
    #[clap(long)]
    pub notify: bool,
    /// Apply the suggestion at this 1-based position
    #[clap(long)]
    pub apply: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct FocusArgs {
    #[clap(subcommand)]
    pub action: FocusAction,
}

#[derive(Subcommand, Debug, Clone)]
pub enum FocusAction {
    /// Recommend focus blocks from meeting history
    Analyze {
        #[clap(long)]
        target_hours: Option<f64>,
    },
    /// Create recurring focus blocks on the calendar
    Protect {
        #[clap(long)]
        auto_decline: bool,
        #[clap(long)]
        target_hours: Option<f64>,
    },
    /// Propose schedule changes for a trigger
    Adapt {
        #[clap(value_enum)]
        trigger: AdaptiveTrigger,
        /// Apply the proposed changes immediately
        #[clap(long)]
        auto_apply: bool,
        /// Notify participants of moved meetings
        #[clap(long)]
        notify: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Write a sample configuration file
    Init,
    /// Set a configuration value
    Set { key: String, value: String },
    /// List the settable keys
    Keys,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reschedule_command() {
        let cli = Cli::parse_from([
            "cadence",
            "--format",
            "json",
            "reschedule",
            "evt-1",
            "--calendar",
            "work",
            "--preferred",
            "2025-01-15T14:00:00Z",
            "--avoid-day",
            "Friday",
            "--avoid-day",
            "Saturday",
            "--apply",
            "1",
        ]);

        assert_eq!(cli.format, OutputFormat::Json);
        let Commands::Reschedule(args) = cli.command else {
            panic!("expected reschedule command");
        };
        assert_eq!(args.event_id, "evt-1");
        assert_eq!(args.calendar, "work");
        assert_eq!(args.preferred.len(), 1);
        assert_eq!(args.avoid_days, vec!["Friday", "Saturday"]);
        assert_eq!(args.apply, Some(1));
        assert!(!args.notify);
    }

    #[test]
    fn test_parse_focus_adapt_trigger() {
        let cli = Cli::parse_from(["cadence", "focus", "adapt", "meeting-overload", "--auto-apply"]);
        let Commands::Focus(FocusArgs {
            action: FocusAction::Adapt { trigger, auto_apply, .. },
        }) = cli.command
        else {
            panic!("expected focus adapt command");
        };
        assert_eq!(trigger, AdaptiveTrigger::MeetingOverload);
        assert!(auto_apply);
    }

    #[test]
    fn test_conflict_defaults() {
        let cli = Cli::parse_from([
            "cadence",
            "conflicts",
            "--title",
            "Sync",
            "--start",
            "2025-01-15T14:00:00Z",
            "--participant",
            "a@example.com",
        ]);
        let Commands::Conflicts(args) = cli.command else {
            panic!("expected conflicts command");
        };
        assert_eq!(args.duration, 30);
        assert_eq!(args.participants, vec!["a@example.com"]);
        assert_eq!(cli.format, OutputFormat::Text);
    }

    #[test]
    fn test_day_counts_are_bounded() {
        let cli = Cli::parse_from(["cadence", "analyze", "--days", "30"]);
        assert!(matches!(cli.command, Commands::Analyze { days: Some(30) }));

        assert!(Cli::try_parse_from(["cadence", "analyze", "--days", "4294967295"]).is_err());
        assert!(Cli::try_parse_from(["cadence", "analyze", "--days", "0"]).is_err());
        assert!(Cli::try_parse_from([
            "cadence",
            "reschedule",
            "evt-1",
            "--calendar",
            "work",
            "--max-delay-days",
            "100000",
        ])
        .is_err());
    }

    #[test]
    fn test_rejects_bad_timestamp() {
        let result = Cli::try_parse_from(["cadence", "score", "--start", "tomorrow"]);
        assert!(result.is_err());
    }
}
