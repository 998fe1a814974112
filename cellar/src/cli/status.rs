// cellar/src/cli/status.rs
use std::collections::HashMap;
use std::io::{self, IsTerminal, Write};
use std::time::Instant;

use cellar_common::config::Config;
use cellar_common::error::InstallStage;
use cellar_common::pipeline::PipelineEvent;
use colored::*;
use tokio::sync::broadcast;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Waiting,
    Stage(InstallStage),
    Success,
    Failed,
    Skipped,
}

impl JobStatus {
    fn display_state(&self) -> String {
        match self {
            JobStatus::Waiting => "waiting".to_string(),
            JobStatus::Stage(stage) => stage.to_string(),
            JobStatus::Success => "success".to_string(),
            JobStatus::Failed => "failed".to_string(),
            JobStatus::Skipped => "skipped".to_string(),
        }
    }

    fn slot_indicator(&self) -> String {
        match self {
            JobStatus::Waiting => " ·".dimmed().to_string(),
            JobStatus::Stage(InstallStage::Fetching) => " ↓".yellow().to_string(),
            JobStatus::Stage(InstallStage::Verifying) => " ?".cyan().to_string(),
            JobStatus::Stage(_) => " ⚙".blue().to_string(),
            JobStatus::Success => " ✓".green().bold().to_string(),
            JobStatus::Failed => " ✗".red().bold().to_string(),
            JobStatus::Skipped => " -".dimmed().to_string(),
        }
    }

    fn colored_state(&self) -> ColoredString {
        let state = format!("{:<12}", self.display_state());
        match self {
            JobStatus::Waiting | JobStatus::Skipped => state.dimmed(),
            JobStatus::Stage(InstallStage::Fetching) => state.yellow(),
            JobStatus::Stage(InstallStage::Installing) => state.magenta(),
            JobStatus::Stage(InstallStage::Verifying) => state.cyan(),
            JobStatus::Stage(_) => state.blue(),
            JobStatus::Success => state.green().bold(),
            JobStatus::Failed => state.red().bold(),
        }
    }

    fn is_done(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::Skipped)
    }
}

struct JobInfo {
    name: String,
    status: JobStatus,
    step: Option<String>,
    fetched_bytes: u64,
    pool_id: usize,
}

impl JobInfo {
    fn size_str(&self) -> String {
        if self.fetched_bytes == 0 {
            "–".to_string()
        } else {
            format_bytes(self.fetched_bytes)
        }
    }
}

struct StatusDisplay {
    jobs: HashMap<String, JobInfo>,
    job_order: Vec<String>,
    total_jobs: usize,
    next_pool_id: usize,
    start_time: Instant,
    interactive: bool,
    header_printed: bool,
    last_line_count: usize,
}

impl StatusDisplay {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            job_order: Vec::new(),
            total_jobs: 0,
            next_pool_id: 1,
            start_time: Instant::now(),
            interactive: io::stdout().is_terminal(),
            header_printed: false,
            last_line_count: 0,
        }
    }

    fn job_mut(&mut self, target_id: &str) -> &mut JobInfo {
        let Self {
            jobs,
            job_order,
            next_pool_id,
            ..
        } = self;
        jobs.entry(target_id.to_string()).or_insert_with(|| {
            job_order.push(target_id.to_string());
            *next_pool_id += 1;
            JobInfo {
                name: target_id.to_string(),
                status: JobStatus::Waiting,
                step: None,
                fetched_bytes: 0,
                pool_id: *next_pool_id - 1,
            }
        })
    }

    fn update_job_status(&mut self, target_id: &str, status: JobStatus) {
        let job = self.job_mut(target_id);
        if job.status.is_done() {
            return;
        }
        job.status = status;
        if status.is_done() || matches!(status, JobStatus::Stage(_)) {
            job.step = None;
        }
    }

    fn render(&mut self) {
        if !self.interactive {
            return;
        }
        if self.header_printed {
            self.clear_previous_output();
        }
        self.print_header();
        let job_output = self.build_job_rows();
        print!("{job_output}");
        self.header_printed = true;
        // header + jobs + separator + summary
        self.last_line_count = 1 + job_output.lines().count() + 1 + 1;

        println!("{}", "─".repeat(60).dimmed());
        let done = self.jobs.values().filter(|j| j.status.is_done()).count();
        let fetched: u64 = self.jobs.values().map(|j| j.fetched_bytes).sum();
        println!(
            "{} fetched {}",
            self.generate_progress_bar(done),
            format_bytes(fetched).blue()
        );
        let _ = io::stdout().flush();
    }

    fn print_header(&self) {
        println!(
            "{:<6} {:<12} {:<15} {:<18} {:>8} {}",
            "IID".bold().dimmed(),
            "STATE".bold().dimmed(),
            "PKG".bold().dimmed(),
            "STEP".bold().dimmed(),
            "FETCHED".bold().dimmed(),
            "SLOT".bold().dimmed()
        );
    }

    fn build_job_rows(&self) -> String {
        let mut output = String::new();
        for target_id in &self.job_order {
            if let Some(job) = self.jobs.get(target_id) {
                output.push_str(&format!(
                    "{:<6} {} {:<15} {:<18} {:>8} {}\n",
                    format!("#{:02}", job.pool_id).cyan(),
                    job.status.colored_state(),
                    job.name.cyan(),
                    job.step.as_deref().unwrap_or("–"),
                    job.size_str(),
                    job.status.slot_indicator()
                ));
            }
        }
        output
    }

    fn clear_previous_output(&self) {
        for _ in 0..self.last_line_count {
            print!("\x1b[1A\x1b[2K");
        }
        let _ = io::stdout().flush();
    }

    fn generate_progress_bar(&self, done: usize) -> String {
        if self.total_jobs == 0 {
            return "".to_string();
        }
        let progress_width = 8;
        let filled = (done.min(self.total_jobs) * progress_width) / self.total_jobs;
        let remaining = progress_width - filled;
        format!(
            "{}{}",
            "▍".repeat(filled).green(),
            "·".repeat(remaining).dimmed()
        )
    }
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "kB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit_idx = 0;

    while value >= 1000.0 && unit_idx < UNITS.len() - 1 {
        value /= 1000.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{bytes}B")
    } else {
        format!("{:.1}{}", value, UNITS[unit_idx])
    }
}

/// Renders pipeline events until `PipelineFinished` or the channel closes.
pub async fn handle_events(_config: Config, mut event_rx: broadcast::Receiver<PipelineEvent>) {
    let mut display = StatusDisplay::new();
    let mut logs_buffer = Vec::new();
    let mut pipeline_active = false;

    loop {
        match event_rx.recv().await {
            Ok(event) => match event {
                PipelineEvent::PlanningStarted => {
                    println!("{}", "Resolving dependencies...".cyan());
                }
                PipelineEvent::PlanningFinished { job_count } => {
                    println!("{} {}", "Planning finished. Jobs:".bold(), job_count);
                    println!();
                }
                PipelineEvent::PipelineStarted { total_jobs } => {
                    pipeline_active = true;
                    display.total_jobs = total_jobs;
                }
                PipelineEvent::JobDispatched { target_id } => {
                    display.update_job_status(&target_id, JobStatus::Waiting);
                    if pipeline_active {
                        display.render();
                    }
                }
                PipelineEvent::StageStarted { target_id, stage } => {
                    let status = match stage {
                        InstallStage::Installed => JobStatus::Success,
                        other => JobStatus::Stage(other),
                    };
                    display.update_job_status(&target_id, status);
                    if pipeline_active {
                        display.render();
                    }
                }
                PipelineEvent::StepStarted { target_id, step } => {
                    display.job_mut(&target_id).step = Some(step);
                    if pipeline_active {
                        display.render();
                    }
                }
                PipelineEvent::DownloadStarted { target_id, url } => {
                    let job = display.job_mut(&target_id);
                    job.step = url.rsplit('/').next().map(str::to_string);
                    if pipeline_active {
                        display.render();
                    }
                }
                PipelineEvent::DownloadFinished {
                    target_id,
                    size_bytes,
                    ..
                } => {
                    let job = display.job_mut(&target_id);
                    job.fetched_bytes += size_bytes;
                    job.step = None;
                    if pipeline_active {
                        display.render();
                    }
                }
                PipelineEvent::JobSuccess {
                    target_id,
                    version,
                    verified,
                } => {
                    display.update_job_status(&target_id, JobStatus::Success);
                    let note = if verified {
                        "verified".green().to_string()
                    } else {
                        "not verified".yellow().to_string()
                    };
                    logs_buffer.push(format!(
                        "{}: {} {} ({})",
                        "Installed".green(),
                        target_id.cyan(),
                        version,
                        note
                    ));
                    if pipeline_active {
                        display.render();
                    }
                }
                PipelineEvent::JobFailed {
                    target_id,
                    stage,
                    error,
                } => {
                    display.update_job_status(&target_id, JobStatus::Failed);
                    let stage = stage.map(|s| format!(" while {s}")).unwrap_or_default();
                    logs_buffer.push(format!(
                        "{} {}{}: {}",
                        "✗".red().bold(),
                        target_id.cyan(),
                        stage,
                        error.red()
                    ));
                    if pipeline_active {
                        display.render();
                    }
                }
                PipelineEvent::JobSkipped {
                    target_id,
                    failed_dependency,
                } => {
                    display.update_job_status(&target_id, JobStatus::Skipped);
                    logs_buffer.push(format!(
                        "{} {} skipped ({})",
                        "-".dimmed(),
                        target_id.cyan(),
                        failed_dependency
                    ));
                    if pipeline_active {
                        display.render();
                    }
                }
                PipelineEvent::LogInfo { message } => {
                    logs_buffer.push(message);
                }
                PipelineEvent::LogWarn { message } => {
                    logs_buffer.push(message.yellow().to_string());
                }
                PipelineEvent::LogError { message } => {
                    logs_buffer.push(message.red().to_string());
                }
                PipelineEvent::PipelineFinished {
                    duration_secs,
                    success_count,
                    fail_count,
                } => {
                    if display.header_printed {
                        display.render();
                    }
                    println!();
                    println!(
                        "{} in {:.2}s ({} succeeded, {} failed)",
                        "Pipeline finished".bold(),
                        duration_secs,
                        success_count,
                        fail_count
                    );
                    if !logs_buffer.is_empty() {
                        println!();
                        for log in &logs_buffer {
                            println!("{log}");
                        }
                    }
                    println!(
                        "\n{}: {}  {}: {}  {}: {}  {}: {:.2}s",
                        "Total jobs".bold(),
                        display.total_jobs,
                        "Completed".green().bold(),
                        success_count,
                        "Failed".red().bold(),
                        fail_count,
                        "Elapsed".bold(),
                        display.start_time.elapsed().as_secs_f64()
                    );
                    break;
                }
            },
            Err(broadcast::error::RecvError::Closed) => {
                break;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Status display skipped {} pipeline events", n);
            }
        }
    }
}
