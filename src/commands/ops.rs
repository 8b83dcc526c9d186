use anyhow::{bail, Result};

use sandman::operation::OperationStore;

use super::format::{format_operation, format_operation_list};
use super::Context;

pub fn show(ctx: &Context, operation_id: &str) -> Result<()> {
    let Some(operation) = ctx.store().find(operation_id)? else {
        bail!("Operation not found: {operation_id}");
    };
    ctx.emit(&operation, || format_operation(&operation))
}

pub fn list(ctx: &Context) -> Result<()> {
    let operations = ctx.store().list()?;
    ctx.emit(&operations, || format_operation_list(&operations))
}
