use feedsync_core::executor::ExecutionResult;
use feedsync_core::{Progress, RunOptions, Snapshot, Stage, SyncSummary};

pub fn print_banner(options: &RunOptions) {
    println!("{}", format_banner(options));
}

pub fn print_success(snapshot: &Snapshot) {
    println!(
        "SUCCESS: new prepopulated container image created: {} (dump: {})",
        snapshot.image, snapshot.artifact
    );
}

fn format_banner(options: &RunOptions) -> String {
    format!(
        "Starting feed sync\n\tTimeout: {} minutes\n\tSync Interval: {:?}\n\tSlim Build: {}",
        options.timeout_minutes(),
        options.interval.as_secs_f64(),
        options.slim
    )
}

fn format_sync_status(timestamp: &str, summary: &SyncSummary) -> String {
    format!("{timestamp} - {summary}\n")
}

/// Renders workflow progress on stdout.
#[derive(Debug, Default)]
pub struct ConsoleProgress;

impl Progress for ConsoleProgress {
    fn stage(&mut self, stage: Stage) {
        println!("==> {stage}");
    }

    fn stage_done(&mut self, _stage: Stage, message: &str) {
        println!("{message}");
    }

    fn line(&mut self, line: &str) {
        println!("{line}");
    }

    fn sync_status(&mut self, summary: &SyncSummary) {
        let timestamp = chrono::Local::now().format("%x_%X").to_string();
        println!("{}", format_sync_status(&timestamp, summary));
    }

    fn diagnostic(&mut self, message: &str) {
        println!("{message}");
    }

    fn command(&mut self, result: &ExecutionResult) {
        println!("CMD: {}", result.command);
        println!("OUTPUT: {}", result.output());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_lists_settings() {
        let banner = format_banner(&RunOptions::from_args("45", "2", true));
        assert_eq!(
            banner,
            "Starting feed sync\n\tTimeout: 45 minutes\n\tSync Interval: 2.0\n\tSlim Build: true"
        );
    }

    #[test]
    fn sync_status_line() {
        let summary = SyncSummary {
            synced: vec!["nvd".into()],
            unsynced: vec![],
            synced_count: 1,
            total_count: 1,
        };
        assert_eq!(
            format_sync_status("01/01/24_00:00:00", &summary),
            "01/01/24_00:00:00 - 1 / 1 groups completed\n\tsynced: [\"nvd\"]\n\tunsynced: []\n"
        );
    }
}
