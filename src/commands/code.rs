//! Code execution, package and file commands.

use anyhow::{bail, Context as _, Result};
use colored::Colorize;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sandman::execution::{ExecutionOptions, PersistentOptions};

use super::format::{format_code_result, format_environment, format_installation, format_sandbox};
use super::Context;

/// Arguments of `sandman run`.
pub struct RunRequest {
    pub language: String,
    pub code: Option<String>,
    pub file: Option<PathBuf>,
    pub sandbox: Option<String>,
    pub sandbox_type: Option<String>,
    pub timeout: Option<u64>,
    pub working_dir: Option<String>,
    pub output_files: Vec<String>,
    pub keep: bool,
}

/// Code from `--code`, `--file`, or stdin when neither is given.
fn read_code(code: Option<String>, file: Option<&Path>) -> Result<String> {
    if let Some(code) = code {
        return Ok(code);
    }
    if let Some(path) = file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read code file: {}", path.display()));
    }

    let mut code = String::new();
    std::io::stdin()
        .read_to_string(&mut code)
        .context("Failed to read code from stdin")?;
    if code.trim().is_empty() {
        bail!("No code given: pass --code, --file, or pipe code on stdin");
    }
    Ok(code)
}

/// Runs code and returns its exit code.
pub async fn run(ctx: &Context, request: RunRequest) -> Result<i32> {
    let code = read_code(request.code, request.file.as_deref())?;
    let options = ExecutionOptions {
        sandbox_type: request.sandbox_type,
        timeout_secs: request.timeout,
        working_dir: request.working_dir,
        user: None,
        output_files: request.output_files,
        auto_cleanup: request.keep.then_some(false),
    };

    let service = ctx.execution();
    let result = match &request.sandbox {
        Some(id) => service.execute_in_sandbox(id, &code, &request.language, &options).await?,
        None => service.execute_ephemeral(&code, &request.language, &options).await?,
    };

    ctx.emit(&result, || format_code_result(&result))?;
    Ok(result.result.exit_code)
}

pub async fn persist(
    ctx: &Context,
    language: &str,
    packages: &[String],
    name: Option<String>,
    sandbox_type: Option<String>,
    working_dir: Option<String>,
) -> Result<i32> {
    let options = PersistentOptions {
        name,
        sandbox_type,
        working_dir,
    };
    let persistent = ctx
        .execution()
        .create_persistent_sandbox(language, packages, &options)
        .await?;

    ctx.emit(&persistent, || {
        let mut out = format_sandbox(&persistent.sandbox);
        out.push_str(&format!("  Workdir:    {}\n", persistent.working_dir.cyan()));
        if let Some(installation) = &persistent.installation {
            out.push_str(&format_installation(installation));
        }
        out
    })?;

    let failed = persistent
        .installation
        .as_ref()
        .is_some_and(|installation| !installation.success);
    Ok(i32::from(failed))
}

pub async fn install(ctx: &Context, id: &str, language: &str, packages: &[String]) -> Result<i32> {
    let result = ctx.execution().install_packages(id, language, packages).await?;
    ctx.emit(&result, || format_installation(&result))?;
    Ok(i32::from(!result.success))
}

pub async fn env(ctx: &Context, id: &str) -> Result<()> {
    let env = ctx.execution().sandbox_environment(id).await?;
    ctx.emit(&env, || format_environment(&env))
}

pub async fn upload(ctx: &Context, id: &str, local: &Path, remote: &str) -> Result<()> {
    let content = std::fs::read(local).with_context(|| format!("Failed to read {}", local.display()))?;
    ctx.execution().upload_file(id, remote, &content).await?;
    if !ctx.json {
        println!("{} Uploaded {} bytes to {id}:{remote}", "✓".green(), content.len());
    }
    Ok(())
}

pub async fn download(ctx: &Context, id: &str, remote: &str, output: Option<&Path>) -> Result<()> {
    let content = ctx.execution().download_file(id, remote).await?;
    match output {
        Some(path) => {
            std::fs::write(path, &content).with_context(|| format!("Failed to write {}", path.display()))?;
            if !ctx.json {
                println!("{} Downloaded {} bytes to {}", "✓".green(), content.len(), path.display());
            }
        }
        None => std::io::stdout()
            .write_all(&content)
            .context("Failed to write to stdout")?,
    }
    Ok(())
}
