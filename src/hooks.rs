//! User actions run at named pipeline stages.
//!
//! Each action is written to a script under the sandbox's `/tmp` and handed to
//! the interpreter named by its shebang, with the sandbox environment and the
//! sandbox root as working directory. Actions without a shebang are run by
//! `/bin/sh`.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use tracing::info;

use crate::chroot::ChrootSession;
use crate::definition::{Definition, HookStage, ImageTarget};

const DEFAULT_SHEBANG: &str = "#!/bin/sh\n";

fn script_body(action: &str) -> String {
    if action.starts_with("#!") {
        action.to_string()
    } else {
        format!("{DEFAULT_SHEBANG}{action}")
    }
}

/// Interpreter and optional single argument from the script's `#!` line.
fn interpreter(body: &str) -> (String, Option<String>) {
    let line = body.lines().next().unwrap_or_default();
    let line = line.trim_start_matches("#!").trim();
    match line.split_once(char::is_whitespace) {
        Some((program, arg)) => (program.to_string(), Some(arg.trim().to_string())),
        None => (line.to_string(), None),
    }
}

/// Run every action for `stage` that applies under `scope`, in order.
///
/// Stops at the first failure, wrapped with the stage name; later actions of
/// the stage do not run.
pub fn run_hooks(
    definition: &Definition,
    stage: HookStage,
    scope: ImageTarget,
    session: &ChrootSession<'_>,
) -> Result<usize> {
    let actions = definition.runnable_actions(stage, scope);
    if actions.is_empty() {
        return Ok(0);
    }
    info!("running {} {} actions", actions.len(), stage);

    for (index, action) in actions.iter().enumerate() {
        let number = index + 1;
        let in_image = format!("/tmp/rootfs-builder-{stage}-{number}.sh");
        let script = session.path(&in_image)?;
        if let Some(parent) = script.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = script_body(&action.action);
        fs::write(&script, &body).with_context(|| format!("writing '{}'", script.display()))?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;

        let (program, arg) = interpreter(&body);
        let result = session
            .command(&program)
            .args(arg)
            .arg_path(&script)
            .error_msg(format!("action #{number} ({stage}) failed"))
            .run();
        let _ = fs::remove_file(&script);
        result.with_context(|| format!("failed to run {stage}"))?;
    }
    Ok(actions.len())
}
