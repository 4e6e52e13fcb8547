//! File capability restoration.
//!
//! Package tooling running in the sandbox can drop extended attributes on
//! binaries it rewrites. After the last package operation the configured
//! capabilities are reapplied with `setcap` inside the chroot. Failures only
//! produce warnings.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ChrootSession;

/// One binary and the capability set it should carry, in `setcap` syntax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilityEntry {
    pub path: String,
    pub caps: String,
}

/// Entries applied when the builder configuration names none.
pub fn default_capabilities() -> Vec<CapabilityEntry> {
    ["/usr/bin/ping", "/bin/ping"]
        .into_iter()
        .map(|path| CapabilityEntry {
            path: path.to_string(),
            caps: "cap_net_raw+ep".to_string(),
        })
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    pub missing: usize,
    pub failed: usize,
}

/// Reapply `entries` inside an active session.
pub fn restore(session: &ChrootSession<'_>, entries: &[CapabilityEntry]) -> RestoreSummary {
    let mut summary = RestoreSummary::default();
    for entry in entries {
        let path = match session.path(&entry.path) {
            Ok(path) => path,
            Err(err) => {
                warn!("skipping capability entry '{}': {err:#}", entry.path);
                summary.failed += 1;
                continue;
            }
        };
        if !path.exists() {
            debug!(path = %entry.path, "not present, skipping capabilities");
            summary.missing += 1;
            continue;
        }

        let result = session
            .command("setcap")
            .arg(&entry.caps)
            .arg_path(&path)
            .error_msg(format!("setting capabilities on {}", entry.path))
            .run();
        match result {
            Ok(_) => summary.restored += 1,
            Err(err) => {
                warn!("{err:#}");
                summary.failed += 1;
            }
        }
    }
    if summary.restored > 0 {
        info!("restored file capabilities on {} binaries", summary.restored);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chroot::Sandbox;
    use crate::testutil::RecordingMounts;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn default_table_covers_ping() {
        let defaults = default_capabilities();
        assert_eq!(defaults.len(), 2);
        assert!(defaults.iter().all(|e| e.caps == "cap_net_raw+ep"));
    }

    #[test]
    fn missing_binaries_are_skipped_and_failures_are_not_fatal() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("usr/bin")).unwrap();
        fs::write(temp.path().join("usr/bin/tool"), "").unwrap();

        let ops = RecordingMounts::new();
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/nonexistent".to_string());
        let sandbox = Sandbox::new(&ops, env, &[]).without_resolv_conf();
        let session = sandbox.enter(temp.path()).unwrap();

        let summary = restore(
            &session,
            &[
                CapabilityEntry {
                    path: "/usr/bin/ping".into(),
                    caps: "cap_net_raw+ep".into(),
                },
                CapabilityEntry {
                    path: "/usr/bin/tool".into(),
                    caps: "cap_net_raw+ep".into(),
                },
            ],
        );
        session.exit().unwrap();

        assert_eq!(
            summary,
            RestoreSummary {
                restored: 0,
                missing: 1,
                failed: 1
            }
        );
    }
}
