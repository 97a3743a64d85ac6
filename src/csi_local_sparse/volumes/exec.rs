/*
 * Copyright (C) 2025 The csi-local-sparse Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::env;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use crate::csi_local_sparse::logger::log_debug;
use crate::csi_local_sparse::util::error::{new_error, with_context, DynError};

const COMPONENT: &str = "host-exec";

/// Captured result of a host tool invocation. Spawn failures are reported
/// as errors; a non-zero exit is returned here so callers can interpret
/// tool-specific exit codes (blkid, findmnt).
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl ToolOutput {
    /// Stdout and stderr joined, for error messages.
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.trim().to_string();
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(stderr);
        }
        combined
    }
}

/// Resolves `tool` on `PATH`. A missing tool yields an error naming it.
pub fn lookup_tool(tool: &str) -> Result<PathBuf, DynError> {
    let path = env::var_os("PATH")
        .ok_or_else(|| new_error(format!("\"{tool}\" executable not found: PATH is not set")))?;

    for dir in env::split_paths(&path) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(tool);
        if let Ok(metadata) = candidate.metadata() {
            if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                return Ok(candidate);
            }
        }
    }

    Err(new_error(format!(
        "\"{tool}\" executable not found in $PATH"
    )))
}

/// Runs a host tool to completion and captures its output. The child is
/// killed when the returned future is dropped, so an RPC deadline firing
/// mid-call terminates the in-flight process.
pub async fn run_tool(tool: &str, args: &[&str]) -> Result<ToolOutput, DynError> {
    let executable = lookup_tool(tool)?;

    log_debug(
        COMPONENT,
        "Exec command",
        &[("cmd", tool), ("args", &args.join(" "))],
    );

    let output = Command::new(&executable)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| with_context(e, format!("error exec command ({tool})")))?;

    Ok(ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
        success: output.status.success(),
    })
}

/// Like [`run_tool`] but treats any non-zero exit as a failure, embedding
/// the tool output in the error. Returns trimmed stdout.
pub async fn run_tool_checked(tool: &str, args: &[&str]) -> Result<String, DynError> {
    let output = run_tool(tool, args).await?;
    if !output.success {
        return Err(new_error(format!(
            "error exec command ({tool}): exit code {:?}: {}",
            output.exit_code,
            output.combined()
        )));
    }
    Ok(output.stdout.trim().to_string())
}
