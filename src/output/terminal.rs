// Rich terminal output for Porter

use std::collections::HashMap;
use std::time::Duration;

use colored::*;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::events::{progress_bar, ExecutionEvent, TaskProgress, TaskStatus, WorkflowProgress};
use crate::executor::{OutputLine, Stats, StreamKind};
use crate::orchestrator::{CommandOutput, ExecutionRecord, ExecutionStatus};
use crate::transfer::UploadReport;

/// Terminal output manager
pub struct TerminalOutput {
    multi_progress: MultiProgress,
    spinners: Mutex<HashMap<String, ProgressBar>>,
    verbose: bool,
    quiet: bool,
    is_tty: bool,
}

impl TerminalOutput {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        let is_tty = atty::is(atty::Stream::Stdout);

        // Respect NO_COLOR environment variable (https://no-color.org/)
        // Also disable colors if not a TTY
        if std::env::var("NO_COLOR").is_ok() || !is_tty {
            colored::control::set_override(false);
        }

        TerminalOutput {
            multi_progress: MultiProgress::new(),
            spinners: Mutex::new(HashMap::new()),
            verbose,
            quiet,
            is_tty,
        }
    }

    /// Print a header for an execution
    pub fn print_header(&self, kind: &str, subject: &str, hosts_count: usize) {
        if self.quiet {
            return;
        }

        println!();
        println!(
            "{} {} ({} hosts)",
            kind.to_uppercase().green().bold(),
            subject.cyan(),
            hosts_count
        );
        println!("{}", "─".repeat(60).dimmed());
    }

    fn spinner(&self, host: &str) -> ProgressBar {
        let mut spinners = self.spinners.lock();
        if let Some(pb) = spinners.get(host) {
            return pb.clone();
        }

        let pb = if self.is_tty && !self.quiet {
            let pb = self.multi_progress.add(ProgressBar::new_spinner());
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.cyan} {prefix:.bold} {msg}")
                    .unwrap()
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
            );
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        } else {
            ProgressBar::hidden()
        };
        pb.set_prefix(host.to_string());
        spinners.insert(host.to_string(), pb.clone());
        pb
    }

    /// Print above the spinners so they are not torn
    fn line(&self, text: String) {
        if self.is_tty {
            let _ = self.multi_progress.println(text);
        } else {
            println!("{}", text);
        }
    }

    pub fn handle_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::Task(progress) => self.on_task(progress),
            ExecutionEvent::Workflow(progress) => self.on_workflow(progress),
            ExecutionEvent::Output { host, line } => self.on_output(host, line),
        }
    }

    fn on_task(&self, progress: &TaskProgress) {
        let pb = self.spinner(&progress.host);
        match progress.status {
            TaskStatus::Running | TaskStatus::Pending => {
                pb.set_message(format!(
                    "[{}/{}] {}",
                    progress.index + 1,
                    progress.total,
                    progress.name
                ));
            }
            TaskStatus::Retrying => {
                pb.set_message(format!(
                    "[{}/{}] {} (retry {}/{})",
                    progress.index + 1,
                    progress.total,
                    progress.name,
                    progress.attempt,
                    progress.max_attempts
                ));
            }
            _ => {
                let failed = progress.status == TaskStatus::Failed;
                if self.quiet && !failed {
                    return;
                }
                self.line(format_task_line(progress));
                if let (true, Some(err)) = (failed, &progress.error) {
                    for l in err.lines() {
                        self.line(format!("      {}", l.red()));
                    }
                }
            }
        }
    }

    fn on_workflow(&self, progress: &WorkflowProgress) {
        if progress.completed >= progress.total {
            return;
        }
        self.spinner(&progress.host).set_message(format!(
            "{} {:>3.0}% {}",
            progress_bar(progress.percent, 20),
            progress.percent,
            progress.current_task
        ));
    }

    fn on_output(&self, host: &str, line: &OutputLine) {
        if self.quiet || !self.verbose {
            return;
        }
        match line.kind {
            StreamKind::Exit => {}
            StreamKind::Stderr => self.line(format!("{} {}", format!("[{}]", host).dimmed(), line.text.red())),
            StreamKind::Stdout => self.line(format!("{} {}", format!("[{}]", host).dimmed(), line.text)),
        }
    }

    /// Consume events until every emitter is dropped
    pub async fn drain(&self, mut rx: mpsc::UnboundedReceiver<ExecutionEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(&event);
        }
        self.finish();
    }

    /// Clear all spinners
    pub fn finish(&self) {
        for (_, pb) in self.spinners.lock().drain() {
            pb.finish_and_clear();
        }
    }

    /// Print one host's task counters
    pub fn print_stats(&self, host: &str, stats: &Stats) {
        if self.quiet {
            return;
        }
        println!("{}", format_stats(host, stats));
    }

    /// Print the per-machine recap of an execution
    pub fn print_record(&self, record: &ExecutionRecord) {
        println!();
        println!(
            "{} {} {}",
            "EXECUTION".green().bold(),
            record.id.cyan(),
            status_colored(record.status)
        );
        println!("{}", "─".repeat(60).dimmed());

        for result in &record.results {
            let status = if result.success {
                "OK".green()
            } else {
                "FAILED".red().bold()
            };
            let took = (result.finished_at - result.started_at)
                .to_std()
                .unwrap_or_default();
            println!(
                "{:<30} : {} ({:.1}s)",
                result.machine_name.white().bold(),
                status,
                took.as_secs_f64()
            );
            if let Some(err) = &result.error {
                println!("      {}", err.red());
            }
            if (self.verbose || !result.success) && !result.output.is_empty() {
                for line in result.output.lines() {
                    println!("      {}", line.dimmed());
                }
            }
        }

        println!();
        println!(
            "{} of {} machines failed",
            record.failed_count(),
            record.results.len()
        );
    }

    pub fn print_command_output(&self, out: &CommandOutput) {
        for line in out.output.lines() {
            println!("{}", line);
        }
        for line in out.stderr.lines() {
            eprintln!("{}", line.red());
        }
        if !self.quiet {
            let code = format!("exit {}", out.exit_code);
            let code = if out.exit_code == 0 {
                code.green()
            } else {
                code.red().bold()
            };
            eprintln!("{} {}", format!("[{}]", out.machine_name).dimmed(), code);
        }
    }

    pub fn print_upload(&self, report: &UploadReport) {
        if self.quiet {
            return;
        }
        let verified = match report.verified {
            Some(true) => " verified".green(),
            Some(false) => " checksum mismatch".red().bold(),
            None => "".normal(),
        };
        println!(
            "{} {} ({} bytes via {:?}){}",
            "UPLOADED".green().bold(),
            report.remote_path,
            report.bytes,
            report.strategy,
            verified
        );
        if self.verbose {
            println!("      sha256 {}", report.sha256.dimmed());
        }
    }

    /// Get the multi-progress bar for concurrent operations
    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi_progress
    }
}

fn status_colored(status: ExecutionStatus) -> ColoredString {
    match status {
        ExecutionStatus::Running => status.as_str().cyan(),
        ExecutionStatus::Completed => status.as_str().green(),
        ExecutionStatus::Failed => status.as_str().red().bold(),
        ExecutionStatus::Cancelled => status.as_str().yellow(),
    }
}

/// `  CHANGED => host  Task name (0.3s)`
pub fn format_task_line(progress: &TaskProgress) -> String {
    let status = match progress.status {
        TaskStatus::Failed => "FAILED".red().bold(),
        TaskStatus::Changed => "CHANGED".yellow(),
        TaskStatus::Skipped => "SKIPPED".cyan(),
        TaskStatus::Ok => "OK".green(),
        other => other.as_str().to_uppercase().normal(),
    };
    let took = progress
        .duration
        .map(|d| format!(" ({:.1}s)", d.as_secs_f64()))
        .unwrap_or_default();

    format!(
        "  {} {} {}  {}{}",
        status,
        "=>".dimmed(),
        progress.host.white().bold(),
        progress.name,
        took.dimmed()
    )
}

/// `host : ok=1 changed=1 failed=0 skipped=0`
pub fn format_stats(host: &str, stats: &Stats) -> String {
    let ok = format!("ok={}", stats.ok).green();
    let changed = if stats.changed > 0 {
        format!("changed={}", stats.changed).yellow()
    } else {
        format!("changed={}", stats.changed).normal()
    };
    let failed = if stats.failed > 0 {
        format!("failed={}", stats.failed).red().bold()
    } else {
        format!("failed={}", stats.failed).normal()
    };
    let skipped = format!("skipped={}", stats.skipped).cyan();

    format!(
        "{:<30} : {}    {}    {}    {}",
        host.white().bold(),
        ok,
        changed,
        failed,
        skipped
    )
}

/// Helper for checking if stdout is a TTY
mod atty {
    use std::io::IsTerminal;

    pub enum Stream {
        Stdout,
    }

    pub fn is(stream: Stream) -> bool {
        match stream {
            Stream::Stdout => std::io::stdout().is_terminal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn progress(status: TaskStatus) -> TaskProgress {
        TaskProgress {
            host: "builder".to_string(),
            index: 0,
            total: 2,
            name: "Install deps".to_string(),
            action: "run".to_string(),
            status,
            attempt: 1,
            max_attempts: 1,
            error: None,
            started_at: Utc::now(),
            duration: Some(Duration::from_millis(1500)),
        }
    }

    #[test]
    fn test_format_task_line() {
        let line = format_task_line(&progress(TaskStatus::Changed));
        let plain = console::strip_ansi_codes(&line);
        assert_eq!(plain, "  CHANGED => builder  Install deps (1.5s)");

        let line = format_task_line(&progress(TaskStatus::Skipped));
        assert!(console::strip_ansi_codes(&line).starts_with("  SKIPPED"));
    }

    #[test]
    fn test_format_stats() {
        let stats = Stats {
            total: 3,
            ok: 2,
            changed: 1,
            skipped: 1,
            failed: 0,
        };
        let plain = console::strip_ansi_codes(&format_stats("builder", &stats)).to_string();
        assert!(plain.starts_with("builder"));
        assert!(plain.contains("ok=2"));
        assert!(plain.contains("changed=1"));
        assert!(plain.contains("failed=0"));
        assert!(plain.contains("skipped=1"));
    }

    #[test]
    fn test_events_without_tty_do_not_panic() {
        let out = TerminalOutput::new(true, false);
        out.handle_event(&ExecutionEvent::Task(progress(TaskStatus::Running)));
        out.handle_event(&ExecutionEvent::Task(progress(TaskStatus::Failed)));
        out.handle_event(&ExecutionEvent::Output {
            host: "builder".to_string(),
            line: OutputLine::stdout("hello"),
        });
        out.finish();
        assert!(out.spinners.lock().is_empty());
    }
}
