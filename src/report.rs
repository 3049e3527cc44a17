// Report Generation
// Read-only projections of pipeline state for humans: a markdown run
// summary and a Graphviz diagram of the stage graph. Neither touches
// execution state.

use crate::pipeline::models::{Pipeline, Status};

use std::fmt::Write;

fn status_symbol(status: Status) -> &'static str {
    match status {
        Status::Pending => "…",
        Status::Running => "▶",
        Status::Success => "✓",
        Status::Failure => "✗",
        Status::Cancelled => "⊘",
        Status::Skipped => "→",
    }
}

fn status_color(status: Status) -> &'static str {
    match status {
        Status::Pending => "lightgray",
        Status::Running => "lightblue",
        Status::Success => "palegreen",
        Status::Failure => "lightcoral",
        Status::Cancelled => "orange",
        Status::Skipped => "khaki",
    }
}

/// Render a markdown summary of a pipeline run.
pub fn markdown_summary(pipeline: &Pipeline) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Pipeline: {}", pipeline.name);
    if let Some(description) = &pipeline.description {
        let _ = writeln!(out, "\n{}", description);
    }
    let _ = writeln!(
        out,
        "\n**Status:** {} {}",
        status_symbol(pipeline.status),
        pipeline.status
    );

    if let Some(duration) = pipeline.duration {
        let _ = writeln!(out, "**Duration:** {:.2}s", duration.as_secs_f64());
    }
    if let Some(started) = pipeline.started_at {
        let _ = writeln!(out, "**Started:** {}", started.to_rfc3339());
    }
    if let Some(error) = &pipeline.error {
        let _ = writeln!(out, "\n> {}", error);
    }

    let _ = writeln!(out, "\n## Stages\n");
    let _ = writeln!(out, "| Stage | Status | Jobs |");
    let _ = writeln!(out, "|-------|--------|------|");
    for stage in &pipeline.stages {
        let _ = writeln!(
            out,
            "| {} | {} {} | {} |",
            stage.name,
            status_symbol(stage.status),
            stage.status,
            stage.jobs.len()
        );
    }

    for stage in &pipeline.stages {
        let _ = writeln!(out, "\n### {}\n", stage.name);
        for job in &stage.jobs {
            let _ = writeln!(
                out,
                "- {} **{}**: {}",
                status_symbol(job.status),
                job.name,
                job.status
            );
            if job.status == Status::Failure && !job.error.is_empty() {
                for line in job.error.lines() {
                    let _ = writeln!(out, "  > {}", line);
                }
            }
        }
    }

    out
}

/// Render the stage dependency graph in Graphviz DOT format, one node per
/// stage colored by status, one edge per declared dependency.
pub fn dependency_diagram(pipeline: &Pipeline) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "digraph \"{}\" {{", escape(&pipeline.name));
    let _ = writeln!(out, "    rankdir=LR;");
    let _ = writeln!(out, "    node [shape=box, style=filled];");

    for stage in &pipeline.stages {
        let _ = writeln!(
            out,
            "    \"{}\" [label=\"{}\\n{}\", fillcolor={}];",
            escape(&stage.name),
            escape(&stage.name),
            stage.status,
            status_color(stage.status)
        );
    }

    for stage in &pipeline.stages {
        for dep in &stage.dependencies {
            let _ = writeln!(out, "    \"{}\" -> \"{}\";", escape(dep), escape(&stage.name));
        }
    }

    let _ = writeln!(out, "}}");
    out
}

fn escape(name: &str) -> String {
    name.replace('\\', "\\\\").replace('"', "\\\"")
}
