//! Prompts for the controlling agent and for step agents.

use std::fmt::Write;

use crate::models::{EventRecord, Workflow, WorkflowStep};

/// What the controlling agent is told when it (re)starts.
#[derive(Clone, Copy)]
pub enum OrchestratorBriefing<'a> {
    /// First start of the workflow.
    Initial,
    /// Resumed session: only what happened since the last wakeup.
    Events(&'a [EventRecord]),
    /// Fresh session after the previous one was lost: everything so far.
    FullLog(&'a [EventRecord]),
}

const ACTIONS: &str = r#"Each action is one JSON object:
- {"action":"get_status"}
- {"action":"execute_task","task_id":"..","instructions":".."}
- {"action":"add_task","task_id":"..","depends_on":[".."]}
- {"action":"skip_step","task_id":"..","reason":".."}
- {"action":"cancel_execution","execution_id":".."}
- {"action":"inspect_execution","execution_id":".."}
- {"action":"get_execution_diff","execution_id":".."}
- {"action":"request_merge","task_id":".."}
- {"action":"escalate","message":".."}
- {"action":"notify","message":".."}
- {"action":"await_events","event_types":[".."],"timeout_secs":600}
- {"action":"complete_workflow","success":true,"summary":".."}
"#;

pub fn orchestrator_prompt(
    workflow: &Workflow,
    briefing: OrchestratorBriefing<'_>,
    control_command: &str,
) -> String {
    let mut out = String::new();
    match briefing {
        OrchestratorBriefing::Events(events) => {
            let _ = writeln!(out, "## NEW EVENTS");
            write_events(&mut out, events);
            let _ = writeln!(out);
            write_steps(&mut out, workflow);
            out.push_str("\nDecide what to do next.\n");
            return out;
        }
        OrchestratorBriefing::Initial | OrchestratorBriefing::FullLog(_) => {}
    }

    let _ = write!(
        out,
        r#"You are coordinating workflow "{}" ({}).
Work is done by step agents, each in its own git worktree. You do not edit
code yourself; you start steps, react to their results and finish the
workflow.

## SOURCE
{}
Integration branch: {}

"#,
        workflow.title,
        workflow.id,
        workflow.source.describe(),
        workflow.integration_branch().unwrap_or("(repository HEAD)"),
    );
    write_steps(&mut out, workflow);
    out.push('\n');
    let _ = writeln!(out, "## CONTROL ACTIONS");
    let _ = writeln!(
        out,
        "Act on this workflow by running: {} '<action json>'\n\
         It prints the result as JSON. A rejected action exits non-zero with the\n\
         reason on stderr.",
        control_command
    );
    out.push_str(ACTIONS);

    if let OrchestratorBriefing::FullLog(events) = briefing {
        out.push_str("\n## EVENT LOG\nYour previous session was lost. Everything that happened so far:\n");
        write_events(&mut out, events);
    }

    out.push_str(
        "\n## RULES\n1. Only start steps whose dependencies are completed or skipped\n\
         2. Wait for events instead of polling\n\
         3. Complete the workflow once every step is completed or skipped\n",
    );
    out
}

pub fn step_prompt(workflow: &Workflow, step: &WorkflowStep, instructions: Option<&str>, retry: bool) -> String {
    let mut out = format!(
        r#"You are working on task {} "{}" as part of workflow "{}".
Your working directory is an isolated git worktree. Commit or leave your
changes in place; they are recorded when you finish.
"#,
        step.task_id, step.title, workflow.title
    );
    if retry {
        let _ = writeln!(
            out,
            "\nThis is a retry. A previous attempt failed: {}",
            step.error.as_deref().unwrap_or("no error recorded")
        );
    }
    if let Some(instructions) = instructions.filter(|i| !i.trim().is_empty()) {
        let _ = write!(out, "\n## INSTRUCTIONS\n{}\n", instructions.trim());
    }
    out
}

fn write_steps(out: &mut String, workflow: &Workflow) {
    if workflow.steps.is_empty() {
        out.push_str("## STEPS\n(none yet; add tasks as needed)\n");
        return;
    }
    out.push_str("## STEPS\n");
    for step in &workflow.steps {
        let deps: Vec<&str> = step
            .depends_on
            .iter()
            .filter_map(|d| workflow.step(d).map(|s| s.task_id.as_str()))
            .collect();
        let _ = write!(out, "- [{}] {} {}", step.status, step.task_id, step.title);
        if !deps.is_empty() {
            let _ = write!(out, " (after {})", deps.join(", "));
        }
        out.push('\n');
    }
}

fn write_events(out: &mut String, events: &[EventRecord]) {
    if events.is_empty() {
        out.push_str("(no events)\n");
    }
    for record in events {
        let _ = writeln!(
            out,
            "- {} {}",
            record.created_at.format("%H:%M:%S"),
            record.event.summary()
        );
    }
}
