//! Moving file contents in and out of a sandbox.
//!
//! Content always travels base64-encoded. The encoded alphabet is safe on a
//! shell command line, and paths are shell-quoted, so user data is never
//! interpolated raw.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use super::CodeExecutionService;
use crate::sandbox::SandboxError;

/// `echo <b64> | base64 -d > <path>`
pub(crate) fn write_command(path: &str, content: &[u8]) -> String {
    format!(
        "echo {} | base64 -d > {}",
        STANDARD.encode(content),
        shell_words::quote(path)
    )
}

/// `base64 <path>`
pub(crate) fn read_command(path: &str) -> String {
    format!("base64 {}", shell_words::quote(path))
}

/// `mkdir -p <dir>`
pub(crate) fn mkdir_command(dir: &str) -> String {
    format!("mkdir -p {}", shell_words::quote(dir))
}

/// Decodes `base64` output, ignoring line wrapping.
pub(crate) fn decode_output(stdout: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = stdout.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact)
}

fn parent_dir(path: &str) -> Option<&str> {
    let (parent, _) = path.rsplit_once('/')?;
    (!parent.is_empty()).then_some(parent)
}

impl CodeExecutionService {
    /// Writes `content` to `path` inside the sandbox, creating parent
    /// directories.
    pub async fn upload_file(&self, sandbox_id: &str, path: &str, content: &[u8]) -> Result<(), SandboxError> {
        let write = write_command(path, content);
        let command = match parent_dir(path) {
            Some(dir) => format!("{} && {write}", mkdir_command(dir)),
            None => write,
        };

        debug!(sandbox_id, path, bytes = content.len(), "Uploading file");
        self.manager
            .execute(sandbox_id, &command, Some(&self.default_user), Some(self.file_timeout_secs))
            .await?;
        Ok(())
    }

    /// Reads `path` from inside the sandbox.
    pub async fn download_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
        debug!(sandbox_id, path, "Downloading file");
        let result = self
            .manager
            .execute(
                sandbox_id,
                &read_command(path),
                Some(&self.default_user),
                Some(self.file_timeout_secs),
            )
            .await?;

        decode_output(&result.output)
            .map_err(|e| SandboxError::malformed_output(format!("{path} is not valid base64: {e}")))
    }
}
