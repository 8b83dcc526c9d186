//! State-changing sandbox commands, each tracked as an operation.
//!
//! `--operation-id` adopts a pending record another process registered, or
//! names a new one so the caller can poll it with `ops show`.

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use std::sync::Arc;

use sandman::notifications::Notifier;
use sandman::operation::{Operation, OperationError, OperationStore, OperationTracker, OperationType};

use super::format::format_sandbox;
use super::Context;

#[derive(Serialize)]
struct Report<'a, T> {
    operation: &'a Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn open_tracker(
    ctx: &Context,
    operation_type: OperationType,
    sandbox_id: Option<&str>,
    operation_id: Option<String>,
) -> Result<OperationTracker> {
    let store: Arc<dyn OperationStore> = ctx.store();
    let manager = ctx.manager();
    let sandbox_id = sandbox_id.map(str::to_string);

    let tracker = match operation_id {
        Some(id) if store.find(&id)?.is_some() => OperationTracker::load(store, manager, &id)?,
        Some(id) => OperationTracker::begin(store, manager, Operation::with_id(id, operation_type, sandbox_id))?,
        None => OperationTracker::begin(store, manager, Operation::new(operation_type, sandbox_id))?,
    };

    Ok(tracker
        .with_notifier(Notifier::new(ctx.config.notifications.clone()))
        .with_cleanup_stop_timeout(ctx.config.operations.cleanup_stop_timeout_secs))
}

/// Prints the outcome and the operation it ran under. Returns the exit code.
fn report<T: Serialize>(
    ctx: &Context,
    tracker: OperationTracker,
    outcome: Result<T, OperationError>,
    text: impl FnOnce(&T) -> String,
) -> Result<i32> {
    let operation = tracker.into_operation();
    match outcome {
        Ok(value) => {
            let report = Report {
                operation: &operation,
                result: Some(&value),
                error: None,
            };
            ctx.emit(&report, || {
                format!(
                    "{}{} {} {}\n",
                    text(&value),
                    "✓".green(),
                    operation.message,
                    format!("({})", operation.operation_id).dimmed()
                )
            })?;
            Ok(0)
        }
        Err(e) => {
            let report: Report<'_, T> = Report {
                operation: &operation,
                result: None,
                error: Some(e.to_string()),
            };
            if ctx.json {
                ctx.emit(&report, String::new)?;
            } else {
                eprintln!("{} {e}", "✗".red());
                eprintln!("  Operation: {}", operation.operation_id.cyan());
            }
            Ok(1)
        }
    }
}

pub async fn create(
    ctx: &Context,
    sandbox_type: Option<&str>,
    name: Option<&str>,
    ports: &[u16],
    operation_id: Option<String>,
) -> Result<i32> {
    let mut tracker = open_tracker(ctx, OperationType::Create, name, operation_id)?;
    let outcome = tracker.create_sandbox(sandbox_type, name, ports).await;
    report(ctx, tracker, outcome, format_sandbox)
}

pub async fn start(ctx: &Context, id: &str, operation_id: Option<String>) -> Result<i32> {
    let mut tracker = open_tracker(ctx, OperationType::Start, Some(id), operation_id)?;
    let outcome = tracker.start_sandbox(id).await;
    report(ctx, tracker, outcome, format_sandbox)
}

pub async fn stop(ctx: &Context, id: &str, timeout: Option<u64>, operation_id: Option<String>) -> Result<i32> {
    let mut tracker = open_tracker(ctx, OperationType::Stop, Some(id), operation_id)?;
    let outcome = tracker.stop_sandbox(id, timeout).await;
    report(ctx, tracker, outcome, |_| String::new())
}

pub async fn reset(
    ctx: &Context,
    id: &str,
    sandbox_type: Option<&str>,
    operation_id: Option<String>,
) -> Result<i32> {
    let mut tracker = open_tracker(ctx, OperationType::Reset, Some(id), operation_id)?;
    let outcome = tracker.reset_sandbox(id, sandbox_type).await;
    report(ctx, tracker, outcome, format_sandbox)
}

pub async fn destroy(ctx: &Context, id: &str, operation_id: Option<String>) -> Result<i32> {
    let mut tracker = open_tracker(ctx, OperationType::Destroy, Some(id), operation_id)?;
    let outcome = tracker.destroy_sandbox(id).await;
    report(ctx, tracker, outcome, |()| String::new())
}

pub async fn cleanup(ctx: &Context, operation_id: Option<String>) -> Result<i32> {
    let mut tracker = open_tracker(ctx, OperationType::Cleanup, None, operation_id)?;
    let outcome = tracker.cleanup_all_sandboxes().await;
    report(ctx, tracker, outcome, |_| String::new())
}
