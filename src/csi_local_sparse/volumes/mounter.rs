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

use std::error::Error;
use std::fmt;
use std::os::unix::fs::DirBuilderExt;

use serde::Deserialize;

use super::exec::{run_tool, run_tool_checked};
use super::Mounter;
use crate::csi_local_sparse::logger::log_debug;
use crate::csi_local_sparse::util::error::{new_error, with_context, DynError};

const COMPONENT: &str = "mounter";

/// Raised when a mount table entry reports a propagation mode other than
/// `shared`. The driver depends on bidirectional propagation into the
/// orchestrator's mount namespace; any other mode means the host view has
/// drifted and must surface immediately.
#[derive(Debug)]
pub struct MountPropagationError {
    pub target: String,
    pub propagation: String,
}

impl fmt::Display for MountPropagationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bad mount propagation ({}) for target {}",
            self.propagation, self.target
        )
    }
}

impl Error for MountPropagationError {}

#[derive(Deserialize)]
struct FindmntResponse {
    #[serde(default)]
    filesystems: Vec<FindmntEntry>,
}

// findmnt is asked for TARGET,PROPAGATION,FSTYPE,OPTIONS; only the first
// two participate in the decision.
#[derive(Deserialize)]
struct FindmntEntry {
    #[serde(default)]
    target: String,
    #[serde(default)]
    propagation: String,
}

/// Interprets `findmnt -J` output for `target`. Every returned entry must
/// report `shared` propagation; a match is reported only when the entry's
/// target equals the queried path.
fn evaluate_mount_table(raw: &str, target: &str) -> Result<bool, DynError> {
    let response: FindmntResponse =
        serde_json::from_str(raw).map_err(|e| with_context(e, "error parse findmnt output"))?;

    let mut is_mounted = false;
    for entry in response.filesystems {
        if entry.propagation != "shared" {
            return Err(Box::new(MountPropagationError {
                target: target.to_string(),
                propagation: entry.propagation,
            }));
        }
        if entry.target == target {
            is_mounted = true;
        }
    }
    Ok(is_mounted)
}

/// Mounter implementation for Linux hosts, driving the `mount`, `umount`
/// and `findmnt` host tools.
pub struct LinuxMounter;

impl LinuxMounter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxMounter {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl Mounter for LinuxMounter {
    async fn mount(&self, source: &str, target: &str, options: &[String]) -> Result<(), DynError> {
        log_debug(
            COMPONENT,
            "Mount called",
            &[
                ("source", source),
                ("target", target),
                ("options", &options.join(",")),
            ],
        );

        if source.is_empty() {
            return Err(new_error("mount source can't be empty"));
        }
        if target.is_empty() {
            return Err(new_error("mount target can't be empty"));
        }

        let is_mounted = self
            .is_mounted(target)
            .await
            .map_err(|e| with_context(e, "error check if target mounted"))?;
        if is_mounted {
            log_debug(
                COMPONENT,
                "Target already mounted",
                &[("source", source), ("target", target)],
            );
            return Ok(());
        }

        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true).mode(0o750);
        builder
            .create(target)
            .map_err(|e| with_context(e, "error create directory"))?;

        let joined;
        let mut args: Vec<&str> = Vec::new();
        if !options.is_empty() {
            joined = options.join(",");
            args.push("-o");
            args.push(&joined);
        }
        args.push(source);
        args.push(target);

        run_tool_checked("mount", &args).await?;

        log_debug(
            COMPONENT,
            "Mounted source to target successfully",
            &[("source", source), ("target", target)],
        );
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), DynError> {
        log_debug(COMPONENT, "Unmount called", &[("target", target)]);

        if target.is_empty() {
            return Err(new_error("unmount target can't be empty"));
        }

        let is_mounted = self
            .is_mounted(target)
            .await
            .map_err(|e| with_context(e, "error check if target mounted"))?;
        if !is_mounted {
            log_debug(COMPONENT, "Target already unmounted", &[("target", target)]);
            return Ok(());
        }

        run_tool_checked("umount", &[target]).await?;

        log_debug(
            COMPONENT,
            "Target was unmounted successfully",
            &[("target", target)],
        );
        Ok(())
    }

    async fn is_mounted(&self, target: &str) -> Result<bool, DynError> {
        log_debug(COMPONENT, "IsMounted called", &[("target", target)]);

        if target.is_empty() {
            return Err(new_error("isMounted target can't be empty"));
        }

        let output = run_tool(
            "findmnt",
            &["-o", "TARGET,PROPAGATION,FSTYPE,OPTIONS", "-J", "-M", target],
        )
        .await?;

        // findmnt reports "nothing found" through a non-zero exit with no
        // output; that is a regular negative answer.
        if output.combined().is_empty() {
            log_debug(
                COMPONENT,
                "Findmnt reported no mount for target",
                &[("target", target)],
            );
            return Ok(false);
        }
        if !output.success {
            return Err(new_error(format!(
                "error exec command (findmnt): exit code {:?}: {}",
                output.exit_code,
                output.combined()
            )));
        }

        let is_mounted = evaluate_mount_table(&output.stdout, target)?;

        log_debug(
            COMPONENT,
            "Result of mount search",
            &[("target", target), ("is_mounted", &is_mounted.to_string())],
        );
        Ok(is_mounted)
    }
}
