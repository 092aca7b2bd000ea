//! Binary entry point for the tagmirror CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;
use tracing::info;

use tagmirror::{
    ConfigError, GitIdentity, GitTracker, GithubClient, LoggingError, MirrorConfig, MirrorError,
    MirrorOrchestrator, PcsArchive, ProcessingMode, init_logging,
};

mod cli;

use cli::{Cli, ModeArg, SyncCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),
    #[error("sync aborted: {0}")]
    Sync(#[from] MirrorError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Sync(command) => run_sync(command).await,
    }
}

async fn run_sync(command: SyncCommand) -> Result<(), CliError> {
    init_logging(command.verbose)?;

    let config = MirrorConfig::load_without_cli_args()?;
    let mut settings = config.settings()?;
    if let Some(mode) = command.mode {
        settings.mode = processing_mode(mode);
    }
    if settings.sources.is_empty() {
        info!("no upstream sources configured; nothing to do");
        return Ok(());
    }

    let host = GithubClient::from_config(&config)?;
    let archive = PcsArchive::with_process_runner(config.archive_bin.as_str());
    let tracker = GitTracker::with_process_runner(
        config.tracker_dir.as_str(),
        settings.tracker_layout,
        GitIdentity {
            git_bin: config.git_bin.clone(),
            name: config.git_author_name.clone(),
            email: config.git_author_email.clone(),
        },
    );

    info!(
        destination = %settings.destination,
        sources = settings.sources.len(),
        mode = %settings.mode,
        "starting sync"
    );
    let orchestrator = MirrorOrchestrator::new(host, archive, tracker, &settings);
    let report = orchestrator.run_batch(&settings.sources).await?;
    info!(
        synced = report.synced(),
        failed = report.failed(),
        "sync complete"
    );
    Ok(())
}

const fn processing_mode(arg: ModeArg) -> ProcessingMode {
    match arg {
        ModeArg::Stream => ProcessingMode::Stream,
        ModeArg::Batch => ProcessingMode::Batch,
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&["tagmirror", "sync"], None, false)]
    #[case(&["tagmirror", "sync", "--mode", "batch", "-v"], Some(ModeArg::Batch), true)]
    #[case(&["tagmirror", "sync", "--verbose", "--mode", "stream"], Some(ModeArg::Stream), true)]
    fn sync_arguments_parse(
        #[case] args: &[&str],
        #[case] mode: Option<ModeArg>,
        #[case] verbose: bool,
    ) {
        let cli = Cli::try_parse_from(args).unwrap_or_else(|err| panic!("parse: {err}"));
        let Cli::Sync(command) = cli;
        assert_eq!(command.mode, mode);
        assert_eq!(command.verbose, verbose);
    }

    #[rstest]
    fn unknown_mode_is_rejected_by_parser() {
        let err = Cli::try_parse_from(["tagmirror", "sync", "--mode", "parallel"])
            .expect_err("unknown mode should fail");
        assert!(err.to_string().contains("parallel"));
    }

    #[rstest]
    #[case(ModeArg::Stream, ProcessingMode::Stream)]
    #[case(ModeArg::Batch, ProcessingMode::Batch)]
    fn mode_arguments_map_to_processing_modes(
        #[case] arg: ModeArg,
        #[case] expected: ProcessingMode,
    ) {
        assert_eq!(processing_mode(arg), expected);
    }

    #[rstest]
    fn errors_are_written_on_one_line() {
        let mut buffer = Vec::new();
        write_error(
            &mut buffer,
            &CliError::Config(ConfigError::MissingField(String::from(
                "missing destination repository",
            ))),
        );
        assert_eq!(
            String::from_utf8_lossy(&buffer),
            "configuration error: missing destination repository\n"
        );
    }
}
