//! Interactive operator console.
//!
//! Reads commands line by line from an async reader so running jobs keep
//! making progress while the console waits for input.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::broadcast::error::RecvError;

use crate::worker::{Job, JobManager};
use crate::workflow::WorkflowSource;

/// How often `watch` re-checks whether the job has finished.
const WATCH_POLL: Duration = Duration::from_millis(200);

const PROMPT: &str = "\n(cli) > ";

const HELP: &str = "\
Commands:
  start <workflow_name>  -> Run a workflow in background
  list                   -> List available workflows
  jobs                   -> Show status of background jobs
  logs <job_id>          -> View logs for a specific job
  watch <job_id>         -> Follow a job's log until it finishes (Enter stops)
  status <job_id>        -> Show a job as JSON
  kill <job_id>          -> Stop a running job
  create                 -> Create a new workflow
  help                   -> Show this help
  exit                   -> Stop all jobs and quit";

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start(String),
    List,
    Jobs,
    Logs(String),
    Watch(String),
    Status(String),
    Kill(String),
    Create,
    Help,
    Exit,
    Empty,
    /// Known command missing its argument.
    Usage(&'static str),
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Self::Empty;
        };
        let arg = parts.next().map(str::to_string);

        match (cmd.to_ascii_lowercase().as_str(), arg) {
            ("start", Some(name)) => Self::Start(name),
            ("start", None) => Self::Usage("start <workflow_name>"),
            ("logs", Some(id)) => Self::Logs(id),
            ("logs", None) => Self::Usage("logs <job_id>"),
            ("watch", Some(id)) => Self::Watch(id),
            ("watch", None) => Self::Usage("watch <job_id>"),
            ("status", Some(id)) => Self::Status(id),
            ("status", None) => Self::Usage("status <job_id>"),
            ("kill", Some(id)) => Self::Kill(id),
            ("kill", None) => Self::Usage("kill <job_id>"),
            ("list", _) => Self::List,
            ("jobs", _) => Self::Jobs,
            ("create", _) => Self::Create,
            ("help", _) => Self::Help,
            ("exit" | "quit", _) => Self::Exit,
            (other, _) => Self::Unknown(other.to_string()),
        }
    }
}

/// The console loop. Generic over its input and output so it can be driven
/// from stdin/stdout or from tests.
pub struct Console<R, W> {
    manager: Arc<JobManager>,
    workflows: Arc<dyn WorkflowSource>,
    lines: Lines<R>,
    out: W,
}

impl<R, W> Console<R, W>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    pub fn new(
        manager: Arc<JobManager>,
        workflows: Arc<dyn WorkflowSource>,
        input: R,
        out: W,
    ) -> Self {
        Self {
            manager,
            workflows,
            lines: input.lines(),
            out,
        }
    }

    /// Run until `exit` or end of input, then shut the manager down.
    /// Returns the output sink.
    pub async fn run(mut self) -> std::io::Result<W> {
        writeln!(self.out, "==============================================")?;
        writeln!(self.out, " Multi-Agent Background Job System CLI")?;
        writeln!(self.out, "==============================================")?;
        writeln!(self.out, "{HELP}")?;

        loop {
            let Some(line) = self.prompt(PROMPT).await? else {
                break;
            };

            match Command::parse(&line) {
                Command::Exit => break,
                Command::Empty => {}
                command => {
                    if let Err(e) = self.dispatch(command).await {
                        tracing::warn!("Console command failed: {}", e);
                        writeln!(self.out, "CLI Error: {e}")?;
                    }
                }
            }
        }

        writeln!(self.out, "Stopping all jobs and exiting...")?;
        self.out.flush()?;
        self.manager.shutdown().await;
        Ok(self.out)
    }

    async fn dispatch(&mut self, command: Command) -> std::io::Result<()> {
        match command {
            Command::Start(name) => self.start(&name).await,
            Command::List => self.list_workflows(),
            Command::Jobs => self.list_jobs().await,
            Command::Logs(id) => self.logs(&id).await,
            Command::Watch(id) => self.watch(&id).await,
            Command::Status(id) => self.status(&id).await,
            Command::Kill(id) => self.kill(&id).await,
            Command::Create => self.create().await,
            Command::Help => writeln!(self.out, "{HELP}"),
            Command::Usage(usage) => writeln!(self.out, "Usage: {usage}"),
            Command::Unknown(cmd) => writeln!(
                self.out,
                "Unknown command '{cmd}'. Type 'help' to list available commands."
            ),
            Command::Exit | Command::Empty => Ok(()),
        }
    }

    async fn start(&mut self, name: &str) -> std::io::Result<()> {
        let steps = self.workflows.get_steps(name);
        if steps.is_empty() {
            return writeln!(self.out, "Workflow '{name}' not found.");
        }

        let job_id = self.manager.create_job(name, steps).await;
        writeln!(
            self.out,
            "Job started! ID: {} (Type 'jobs' to view status)",
            job_id.short()
        )
    }

    fn list_workflows(&mut self) -> std::io::Result<()> {
        let names = self.workflows.list_names();
        if names.is_empty() {
            return writeln!(self.out, "No workflows defined.");
        }
        writeln!(self.out, "\nAvailable Workflows:")?;
        for name in names {
            let steps = self.workflows.get_steps(&name).len();
            writeln!(self.out, " - {name} ({steps} steps)")?;
        }
        Ok(())
    }

    async fn list_jobs(&mut self) -> std::io::Result<()> {
        let jobs = self.manager.list_jobs().await;
        if jobs.is_empty() {
            return writeln!(self.out, "No jobs found.");
        }

        writeln!(
            self.out,
            "\n{:<10} {:<20} {:<12} {:<10}",
            "ID", "NAME", "STATUS", "STARTED"
        )?;
        writeln!(self.out, "{}", "-".repeat(55))?;
        for job in jobs {
            let name: String = job.name().chars().take(18).collect();
            let created = job.created_at().with_timezone(&Local).format("%H:%M:%S");
            writeln!(
                self.out,
                "{:<10} {:<20} {:<12} {:<10}",
                job.id().short(),
                name,
                job.status().to_string(),
                created.to_string()
            )?;
        }
        Ok(())
    }

    async fn logs(&mut self, input: &str) -> std::io::Result<()> {
        let Some(job) = self.find(input).await else {
            return writeln!(self.out, "Job not found.");
        };

        writeln!(
            self.out,
            "\n--- Logs for Job {} ({}) [{}] ---",
            job.id().short(),
            job.name(),
            job.status()
        )?;
        for entry in job.log().snapshot() {
            writeln!(self.out, "{entry}")?;
        }
        writeln!(self.out, "------------------------------------------")
    }

    async fn watch(&mut self, input: &str) -> std::io::Result<()> {
        let Some(job) = self.find(input).await else {
            return writeln!(self.out, "Job not found.");
        };

        let (history, mut rx) = job.log().follow();
        writeln!(self.out, "\n--- Following Job {} ({}) ---", job.id().short(), job.name())?;
        for entry in history {
            writeln!(self.out, "{entry}")?;
        }
        self.out.flush()?;

        loop {
            if job.status().is_terminal() && rx.is_empty() {
                break;
            }

            tokio::select! {
                received = tokio::time::timeout(WATCH_POLL, rx.recv()) => match received {
                    Ok(Ok(entry)) => {
                        writeln!(self.out, "{entry}")?;
                        self.out.flush()?;
                    }
                    Ok(Err(RecvError::Lagged(skipped))) => {
                        writeln!(self.out, "... {skipped} entries skipped ...")?;
                    }
                    Ok(Err(RecvError::Closed)) => break,
                    Err(_) => {}
                },
                // Any input line (or end of input) stops following.
                _ = self.lines.next_line() => {
                    writeln!(self.out, "(stopped following)")?;
                    return Ok(());
                }
            }
        }

        writeln!(self.out, "--- Job {} finished: {} ---", job.id().short(), job.status())
    }

    async fn status(&mut self, input: &str) -> std::io::Result<()> {
        let Some(job) = self.find(input).await else {
            return writeln!(self.out, "Job not found.");
        };

        let json = serde_json::to_string_pretty(&job.snapshot())
            .map_err(std::io::Error::other)?;
        writeln!(self.out, "{json}")
    }

    async fn kill(&mut self, input: &str) -> std::io::Result<()> {
        let cancelled = match self.manager.resolve(input).await {
            Some(id) => self.manager.cancel_job(id).await,
            None => false,
        };

        if cancelled {
            writeln!(self.out, "Job {input} cancelled.")
        } else {
            writeln!(
                self.out,
                "Could not cancel job (maybe already finished or invalid ID)."
            )
        }
    }

    async fn create(&mut self) -> std::io::Result<()> {
        let Some(name) = self.prompt("Enter workflow name: ").await? else {
            return Ok(());
        };
        let name = name.trim().to_string();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return writeln!(self.out, "Workflow name must be a single non-empty word.");
        }

        writeln!(self.out, "Enter steps (type 'done' to finish):")?;
        let mut steps = Vec::new();
        loop {
            let label = format!("Step {}: ", steps.len() + 1);
            let Some(step) = self.prompt(&label).await? else {
                break;
            };
            if step.trim().eq_ignore_ascii_case("done") {
                break;
            }
            if !step.trim().is_empty() {
                steps.push(step.trim().to_string());
            }
        }

        if steps.is_empty() {
            return writeln!(self.out, "No steps entered; workflow not created.");
        }
        let count = steps.len();
        self.workflows.add_workflow(&name, steps);
        writeln!(self.out, "Workflow '{name}' created with {count} steps.")
    }

    async fn find(&self, input: &str) -> Option<Arc<Job>> {
        let id = self.manager.resolve(input).await?;
        self.manager.get_job(id).await
    }

    /// Print a prompt and read one line. `None` at end of input.
    async fn prompt(&mut self, label: &str) -> std::io::Result<Option<String>> {
        write!(self.out, "{label}")?;
        self.out.flush()?;
        self.lines.next_line().await
    }
}
