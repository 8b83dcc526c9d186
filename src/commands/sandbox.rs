//! Read-only sandbox commands and direct command execution.

use anyhow::{bail, Result};
use std::path::PathBuf;

use sandman::sandbox::catalog::load_catalog;
use sandman::sandbox::ExecutionResult;

use super::format::{format_execution, format_sandbox, format_sandbox_table, format_stats, format_types};
use super::Context;

pub async fn list(ctx: &Context, all: bool) -> Result<()> {
    let sandboxes = ctx.manager().list_all(all).await?;
    ctx.emit(&sandboxes, || format_sandbox_table(&sandboxes))
}

pub async fn show(ctx: &Context, id: &str) -> Result<()> {
    let Some(sandbox) = ctx.manager().get_sandbox(id).await? else {
        bail!("Sandbox not found: {id}");
    };
    ctx.emit(&sandbox, || format_sandbox(&sandbox))
}

pub async fn stats(ctx: &Context) -> Result<()> {
    let stats = ctx.manager().stats(None).await?;
    ctx.emit(&stats, || format_stats(&stats))
}

pub fn types(ctx: &Context, dir: Option<PathBuf>) -> Result<()> {
    let dir = dir.unwrap_or_else(|| ctx.config.sandbox.templates_dir.clone());
    let types = load_catalog(&dir)?;
    ctx.emit(&types, || format_types(&types))
}

/// Runs `command` and returns its exit code. Timeouts and failing commands
/// are reported, not raised.
pub async fn exec(
    ctx: &Context,
    id: &str,
    command: &str,
    user: Option<&str>,
    timeout: Option<u64>,
) -> Result<i32> {
    let started = std::time::Instant::now();
    let result = match ctx.manager().execute(id, command, user, timeout).await {
        Ok(result) => result,
        Err(e) => match ExecutionResult::from_error(&e, started.elapsed().as_secs_f64()) {
            Some(result) => result,
            None => return Err(e.into()),
        },
    };
    ctx.emit(&result, || format_execution(&result))?;
    Ok(result.exit_code)
}
