//! Text rendering for command output.
//!
//! Pure functions returning strings, so printing stays in the command
//! bodies and rendering can be tested directly.

use colored::{ColoredString, Colorize};

use sandman::execution::{CodeExecutionResult, InstallationResult, SandboxEnvironment};
use sandman::operation::{LogLevel, Operation, OperationStatus};
use sandman::sandbox::catalog::SandboxType;
use sandman::sandbox::{ExecutionResult, SandboxInstance, SandboxStats, SandboxStatus};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

fn rule() -> String {
    "━".repeat(50).dimmed().to_string()
}

fn status_cell(status: SandboxStatus, width: usize) -> ColoredString {
    let text = format!("{:<width$}", status.to_string());
    match status {
        SandboxStatus::Running => text.green(),
        SandboxStatus::Stopped => text.yellow(),
        SandboxStatus::Unknown => text.dimmed(),
    }
}

fn operation_status(status: OperationStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        OperationStatus::Pending => text.dimmed(),
        OperationStatus::Started => text.cyan(),
        OperationStatus::Completed => text.green().bold(),
        OperationStatus::Failed => text.red().bold(),
    }
}

fn or_none(ports: &[u16]) -> String {
    if ports.is_empty() {
        "-".to_string()
    } else {
        ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",")
    }
}

/// One line per sandbox under a header.
pub fn format_sandbox_table(sandboxes: &[SandboxInstance]) -> String {
    if sandboxes.is_empty() {
        return format!("{} No sandboxes found.\n", "ℹ".blue());
    }

    let id_width = sandboxes.iter().map(|s| s.id.len()).max().unwrap_or(0).max(2);
    let type_width = sandboxes
        .iter()
        .map(|s| s.sandbox_type.len())
        .max()
        .unwrap_or(0)
        .max(4);

    let mut lines = vec![format!(
        "{:<id_width$}  {:<8}  {:<type_width$}  {}",
        "ID", "STATUS", "TYPE", "PORTS"
    )
    .bold()
    .to_string()];
    for sandbox in sandboxes {
        lines.push(format!(
            "{:<id_width$}  {}  {:<type_width$}  {}",
            sandbox.id,
            status_cell(sandbox.status, 8),
            sandbox.sandbox_type,
            or_none(&sandbox.metadata.ports)
        ));
    }
    lines.join("\n") + "\n"
}

/// Details of one sandbox.
pub fn format_sandbox(sandbox: &SandboxInstance) -> String {
    let mut lines = vec![
        format!("  ID:         {}", sandbox.id.cyan().bold()),
        format!("  Container:  {}", sandbox.metadata.container_name.cyan()),
        format!("  Status:     {}", status_cell(sandbox.status, 0)),
        format!("  Type:       {}", sandbox.sandbox_type.cyan()),
        format!("  Image:      {}", sandbox.image.cyan()),
        format!("  Ports:      {}", or_none(&sandbox.metadata.ports).cyan()),
    ];
    if let Some(created) = sandbox.created_at {
        lines.push(format!(
            "  Created:    {}",
            created.format(TIME_FORMAT).to_string().cyan()
        ));
    }
    lines.join("\n") + "\n"
}

pub fn format_stats(stats: &SandboxStats) -> String {
    format!(
        "  Total:      {}\n  Running:    {}\n  Stopped:    {}\n",
        stats.total.to_string().cyan(),
        stats.running.to_string().green(),
        stats.stopped.to_string().yellow()
    )
}

pub fn format_types(types: &[SandboxType]) -> String {
    if types.is_empty() {
        return format!("{} No sandbox types found.\n", "ℹ".blue());
    }

    let width = types.iter().map(|t| t.name.len()).max().unwrap_or(0);
    types
        .iter()
        .map(|t| {
            let name = format!("{:<width$}", t.name);
            match &t.description {
                Some(description) => format!("  {}  {}\n", name.cyan(), description),
                None => format!("  {}\n", name.cyan()),
            }
        })
        .collect()
}

/// Output of a shell command: stdout, then stderr, then a status line when
/// the command did not succeed.
pub fn format_execution(result: &ExecutionResult) -> String {
    let mut out = String::new();
    for stream in [&result.output, &result.error] {
        if !stream.is_empty() {
            out.push_str(stream);
            if !stream.ends_with('\n') {
                out.push('\n');
            }
        }
    }

    if result.timed_out {
        out.push_str(&format!("{} Timed out after {:.1}s\n", "✗".red(), result.execution_time));
    } else if !result.success() {
        out.push_str(&format!("{} Exited with code {}\n", "✗".red(), result.exit_code));
    }
    out
}

pub fn format_code_result(result: &CodeExecutionResult) -> String {
    let mut out = format_execution(&result.result);
    for (path, content) in &result.files {
        out.push_str(&format!("{}\n{content}", format!("── {path} ──").dimmed()));
        if !content.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// A single operation with its full log.
pub fn format_operation(operation: &Operation) -> String {
    let mut lines = vec![
        rule(),
        format!("   Operation {}", operation.operation_id.yellow().bold()),
        rule(),
        format!("  Type:       {}", operation.operation_type.to_string().cyan()),
        format!("  Status:     {}", operation_status(operation.status)),
        format!(
            "  Sandbox:    {}",
            operation.sandbox_id.as_deref().unwrap_or("none").cyan()
        ),
        format!("  Message:    {}", operation.message),
        format!(
            "  Created:    {}",
            operation.created_at.format(TIME_FORMAT).to_string().cyan()
        ),
        format!(
            "  Updated:    {}",
            operation.updated_at.format(TIME_FORMAT).to_string().cyan()
        ),
    ];

    for (key, value) in &operation.metadata {
        lines.push(format!("  {:<11} {}", format!("{key}:"), value.cyan()));
    }

    if !operation.log.is_empty() {
        lines.push(String::new());
        for entry in &operation.log {
            let marker = match entry.level {
                LogLevel::Info => "•".blue(),
                LogLevel::Warning => "!".yellow(),
                LogLevel::Error => "✗".red(),
            };
            lines.push(format!(
                "  {} {} {}",
                entry.timestamp.format("%H:%M:%S").to_string().dimmed(),
                marker,
                entry.message
            ));
        }
    }
    lines.push(rule());
    lines.join("\n") + "\n"
}

/// One line per operation.
pub fn format_operation_list(operations: &[Operation]) -> String {
    if operations.is_empty() {
        return format!("{} No operations recorded.\n", "ℹ".blue());
    }

    operations
        .iter()
        .map(|op| {
            format!(
                "  {}  {:<8} {:<10} {}\n",
                op.operation_id.cyan(),
                op.operation_type.to_string(),
                operation_status(op.status),
                op.message
            )
        })
        .collect()
}

pub fn format_installation(result: &InstallationResult) -> String {
    let mut out = String::new();
    for package in &result.installed_packages {
        out.push_str(&format!("  {} {package}\n", "✓".green()));
    }
    for package in &result.failed_packages {
        out.push_str(&format!("  {} {package}\n", "✗".red()));
    }
    if !result.error.is_empty() {
        out.push_str(&result.error);
        if !result.error.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

pub fn format_environment(env: &SandboxEnvironment) -> String {
    let mut lines = vec![format!(
        "  OS:         {}",
        env.os.as_deref().unwrap_or("unknown").cyan()
    )];

    lines.push("  Languages:".bold().to_string());
    if env.languages.is_empty() {
        lines.push("    none".dimmed().to_string());
    }
    for (language, version) in &env.languages {
        lines.push(format!("    {language:<12} {version}"));
    }

    lines.push("  Package managers:".bold().to_string());
    if env.package_managers.is_empty() {
        lines.push("    none".dimmed().to_string());
    }
    for (manager, version) in &env.package_managers {
        lines.push(format!("    {manager:<12} {version}"));
    }
    lines.join("\n") + "\n"
}
