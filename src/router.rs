use anyhow::Result;

use crate::cli::{Cli, Commands};
use crate::commands::{
    handle_analyze_command, handle_config_command, handle_conflicts_command, handle_focus_command,
    handle_optimize_duration_command, handle_reschedule_command, handle_score_command, Engine,
};
use crate::config::Config;

pub async fn route_command(cli: Cli, config: Config) -> Result<()> {
    let Cli {
        format,
        grant,
        events_file,
        command,
        ..
    } = cli;
    let connect = move |config| Engine::connect(config, grant, events_file, format);

    match command {
        Commands::Config(args) => handle_config_command(&args.action, &config, format),
        Commands::Analyze { days } => handle_analyze_command(&connect(config)?, days).await,
        Commands::Conflicts(args) => handle_conflicts_command(&connect(config)?, args).await,
        Commands::Score(args) => handle_score_command(&connect(config)?, args).await,
        Commands::Reschedule(args) => handle_reschedule_command(&connect(config)?, args).await,
        Commands::Focus(args) => handle_focus_command(&connect(config)?, args.action).await,
        Commands::OptimizeDuration { event_id, calendar } => {
            handle_optimize_duration_command(&connect(config)?, &event_id, &calendar).await
        }
    }
}
