//! Drives the operator console with scripted input.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use agent_jobs::cli::Console;
use agent_jobs::executor::DryRunFactory;
use agent_jobs::worker::{JobManager, JobState};
use agent_jobs::workflow::{InMemoryWorkflows, WorkflowSource};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn run_console(
    manager: Arc<JobManager>,
    workflows: Arc<InMemoryWorkflows>,
    input: &str,
) -> String {
    let reader = Cursor::new(input.as_bytes().to_vec());
    let console = Console::new(manager, workflows, reader, Vec::new());
    let out = timeout(TEST_TIMEOUT, console.run())
        .await
        .expect("console hung")
        .expect("console I/O failed");
    String::from_utf8(out).unwrap()
}

#[tokio::test]
async fn start_list_and_exit() {
    let manager = Arc::new(JobManager::new(Arc::new(DryRunFactory)));
    let workflows = Arc::new(InMemoryWorkflows::with_defaults());

    let out = run_console(
        Arc::clone(&manager),
        workflows,
        "list\nstart google_check\njobs\nexit\n",
    )
    .await;

    assert!(out.contains("Available Workflows:"));
    assert!(out.contains(" - google_check (3 steps)"));
    assert!(out.contains("Job started! ID: "));
    assert!(out.contains("google_check"));
    assert!(out.contains("Stopping all jobs and exiting..."));

    let jobs = manager.list_jobs().await;
    assert_eq!(jobs.len(), 1);
    // Shutdown waited for the runner.
    assert!(jobs[0].status().is_terminal());
}

#[tokio::test]
async fn errors_do_not_stop_the_loop() {
    let manager = Arc::new(JobManager::new(Arc::new(DryRunFactory)));
    let workflows = Arc::new(InMemoryWorkflows::new());

    let out = run_console(
        manager,
        workflows,
        "start missing\nstart\nkill nope\nlogs nope\nfrobnicate\njobs\nquit\n",
    )
    .await;

    assert!(out.contains("Workflow 'missing' not found."));
    assert!(out.contains("Usage: start <workflow_name>"));
    assert!(out.contains("Could not cancel job"));
    assert!(out.contains("Job not found."));
    assert!(out.contains("Unknown command 'frobnicate'"));
    assert!(out.contains("No jobs found."));
}

#[tokio::test]
async fn create_adds_a_workflow() {
    let manager = Arc::new(JobManager::new(Arc::new(DryRunFactory)));
    let workflows = Arc::new(InMemoryWorkflows::new());

    let out = run_console(
        manager,
        Arc::clone(&workflows),
        "create\nmy_flow\nopen page\n\nclick button\ndone\nexit\n",
    )
    .await;

    assert!(out.contains("Workflow 'my_flow' created with 2 steps."));
    assert_eq!(
        workflows.get_steps("my_flow"),
        vec!["open page", "click button"]
    );
}

#[tokio::test]
async fn logs_watch_and_status_of_finished_job() {
    let manager = Arc::new(JobManager::new(Arc::new(DryRunFactory)));
    let workflows = Arc::new(InMemoryWorkflows::new());

    let id = manager
        .create_job("demo", vec!["open page".to_string(), "click button".to_string()])
        .await;
    assert_eq!(manager.wait(id).await, Some(JobState::Completed));

    let input = format!(
        "logs {short}\nwatch {short}\nstatus {short}\nkill {short}\nexit\n",
        short = id.short()
    );
    let out = run_console(manager, workflows, &input).await;

    assert!(out.contains(&format!("--- Logs for Job {} (demo) [COMPLETED] ---", id.short())));
    assert!(out.contains("] Step 1: open page"));
    assert!(out.contains("] Result: dry run: click button"));
    assert!(out.contains(&format!("--- Job {} finished: COMPLETED ---", id.short())));
    assert!(out.contains("\"status\": \"COMPLETED\""));
    assert!(out.contains("Could not cancel job"));
}
