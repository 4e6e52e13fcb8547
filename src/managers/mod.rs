//! Package manager abstraction.
//!
//! A build has exactly one [`Manager`], selected from the definition before
//! anything touches the working tree: a built-in by name, or a custom manager
//! assembled from command templates. Both run the same way inside the chroot:
//!
//! 1. repositories are added/removed ([`manage_repositories`])
//! 2. package lists are refreshed, then removals, installs, the optional
//!    upgrade and the optional cleanup run ([`manage_packages`])

pub mod builtin;
pub mod custom;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::chroot::ChrootSession;
use crate::definition::{
    CommandTemplate, Definition, ImageTarget, PackageAction, Packages, Repository,
};
use crate::error::DefinitionError;

/// Command lines for each package operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commands {
    pub install: CommandTemplate,
    pub remove: CommandTemplate,
    pub update: CommandTemplate,
    pub refresh: CommandTemplate,
    pub clean: Option<CommandTemplate>,
    /// Appended to every command after the operation's own flags.
    pub global: Vec<String>,
}

/// How repository definitions reach the rootfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoHandler {
    Apk,
    Apt,
    Yum,
    Zypper,
    /// Custom manager commands, run as `<cmd> <flags> <name> <url>`.
    Commands {
        add: CommandTemplate,
        remove: Option<CommandTemplate>,
    },
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manager {
    pub name: String,
    pub commands: Commands,
    pub repos: RepoHandler,
}

impl Manager {
    /// Select the manager for `packages`.
    pub fn select(packages: &Packages) -> Result<Manager, DefinitionError> {
        let needs_repositories = !packages.repositories.is_empty();
        let manager = match (&packages.manager, &packages.custom_manager) {
            (Some(_), Some(_)) => {
                return Err(DefinitionError::Invalid(
                    "packages.manager and packages.custom_manager are mutually exclusive".into(),
                ))
            }
            (Some(name), None) => builtin::lookup(name)
                .ok_or_else(|| DefinitionError::UnknownManager(name.clone()))?,
            (None, Some(def)) => custom::from_definition(def, needs_repositories)?,
            (None, None) => return Err(DefinitionError::MissingManager),
        };

        if needs_repositories && manager.repos == RepoHandler::Unsupported {
            return Err(DefinitionError::RepositoriesUnsupported(manager.name));
        }
        Ok(manager)
    }

    fn run(
        &self,
        session: &ChrootSession<'_>,
        op: &str,
        template: &CommandTemplate,
        args: &[String],
    ) -> Result<()> {
        session
            .command(&template.cmd)
            .args(&template.flags)
            .args(&self.commands.global)
            .args(args)
            .error_msg(format!("package {op} with {} failed", self.name))
            .run_interactive()
    }

    fn apply_repository(&self, session: &ChrootSession<'_>, repo: &Repository) -> Result<()> {
        match &self.repos {
            RepoHandler::Apk => builtin::apk_repository(session, repo),
            RepoHandler::Apt => builtin::apt_repository(session, repo),
            RepoHandler::Yum => builtin::yum_repository(session, repo),
            RepoHandler::Zypper => builtin::zypper_repository(session, repo),
            RepoHandler::Commands { add, remove } => {
                let template = if repo.remove {
                    match remove {
                        Some(remove) => remove,
                        None => {
                            debug!("no repo_remove command, leaving '{}' in place", repo.name);
                            return Ok(());
                        }
                    }
                } else {
                    add
                };
                let op = if repo.remove { "repository remove" } else { "repository add" };
                self.run(session, op, template, &[repo.name.clone(), repo.url.clone()])
            }
            RepoHandler::Unsupported => {
                Err(DefinitionError::RepositoriesUnsupported(self.name.clone()).into())
            }
        }
    }
}

/// Effective package sets for one scope, in definition order, deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackagePlan {
    pub install: Vec<String>,
    pub remove: Vec<String>,
}

impl PackagePlan {
    pub fn compute(definition: &Definition, scope: ImageTarget) -> Self {
        let ctx = definition.filter_context(scope);
        let mut plan = PackagePlan::default();
        for set in definition
            .packages
            .sets
            .iter()
            .filter(|set| set.filter.applies(&ctx))
        {
            let list = match set.action {
                PackageAction::Install => &mut plan.install,
                PackageAction::Remove => &mut plan.remove,
            };
            for package in &set.packages {
                if !list.contains(package) {
                    list.push(package.clone());
                }
            }
        }
        plan
    }
}

/// Add or remove the definition's repositories that apply under `scope`.
pub fn manage_repositories(
    manager: &Manager,
    definition: &Definition,
    scope: ImageTarget,
    session: &ChrootSession<'_>,
) -> Result<()> {
    let ctx = definition.filter_context(scope);
    for repo in definition
        .packages
        .repositories
        .iter()
        .filter(|repo| repo.filter.applies(&ctx))
    {
        let verb = if repo.remove { "removing" } else { "adding" };
        info!("{} repository {}", verb, repo.name);
        manager
            .apply_repository(session, repo)
            .with_context(|| format!("{} repository '{}'", verb, repo.name))?;
    }
    Ok(())
}

/// Refresh, remove, install, then optionally upgrade and clean.
pub fn manage_packages(
    manager: &Manager,
    definition: &Definition,
    scope: ImageTarget,
    session: &ChrootSession<'_>,
) -> Result<()> {
    let plan = PackagePlan::compute(definition, scope);
    let commands = &manager.commands;

    manager.run(session, "refresh", &commands.refresh, &[])?;
    if !plan.remove.is_empty() {
        info!("removing {} packages", plan.remove.len());
        manager.run(session, "remove", &commands.remove, &plan.remove)?;
    }
    if !plan.install.is_empty() {
        info!("installing {} packages", plan.install.len());
        manager.run(session, "install", &commands.install, &plan.install)?;
    }
    if definition.packages.update {
        info!("upgrading packages");
        manager.run(session, "update", &commands.update, &[])?;
    }
    if definition.packages.cleanup {
        match &commands.clean {
            Some(clean) => manager.run(session, "clean", clean, &[])?,
            None => debug!("{} has no clean command", manager.name),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chroot::Sandbox;
    use crate::testutil::RecordingMounts;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    /// A custom manager whose every command appends its arguments to `log`.
    const LOGGING_MANAGER: &str = r#"
image: { name: test, release: "1", architecture: x86_64 }
packages:
  custom_manager:
    install: { cmd: /bin/sh, flags: [-c, 'echo install $* >> log', sh] }
    remove: { cmd: /bin/sh, flags: [-c, 'echo remove $* >> log', sh] }
    update: { cmd: /bin/sh, flags: [-c, 'echo update $* >> log', sh] }
    refresh: { cmd: /bin/sh, flags: [-c, 'echo refresh $* >> log', sh] }
    clean: { cmd: /bin/sh, flags: [-c, 'echo clean $* >> log', sh] }
    repo_add: { cmd: /bin/sh, flags: [-c, 'echo repo-add $* >> log', sh] }
  update: true
  cleanup: true
  sets:
    - { packages: [vim, curl], action: install }
    - { packages: [qemu-guest-agent], action: install, types: [vm] }
    - { packages: [nano], action: remove }
    - { packages: [curl, openssh], action: install, types: [container] }
  repositories:
    - { name: extra, url: "https://repo.example.org/extra" }
    - { name: vmonly, url: "https://repo.example.org/vm", types: [vm] }
"#;

    #[test]
    fn select_builtin_custom_and_errors() {
        let mut packages = Packages {
            manager: Some("apt".into()),
            ..Default::default()
        };
        assert_eq!(Manager::select(&packages).unwrap().name, "apt");

        packages.manager = Some("emerge".into());
        let err = Manager::select(&packages).unwrap_err();
        assert_eq!(err, DefinitionError::UnknownManager("emerge".into()));
        assert_eq!(err.to_string(), "couldn't get manager 'emerge'");

        packages.manager = None;
        assert_eq!(Manager::select(&packages).unwrap_err(), DefinitionError::MissingManager);

        let def = Definition::from_yaml(LOGGING_MANAGER).unwrap();
        assert_eq!(Manager::select(&def.packages).unwrap().name, "custom");
    }

    #[test]
    fn pacman_rejects_repositories() {
        let mut def = Definition::from_yaml(LOGGING_MANAGER).unwrap();
        def.packages.custom_manager = None;
        def.packages.manager = Some("pacman".into());
        assert_eq!(
            Manager::select(&def.packages).unwrap_err(),
            DefinitionError::RepositoriesUnsupported("pacman".into())
        );
    }

    #[test]
    fn plan_follows_scope() {
        let def = Definition::from_yaml(LOGGING_MANAGER).unwrap();
        let plan = PackagePlan::compute(&def, def.scope());
        assert_eq!(plan.install, vec!["vim", "curl", "openssh"]);
        assert_eq!(plan.remove, vec!["nano"]);

        let vm = ImageTarget::for_build(crate::definition::TargetKind::Vm);
        let plan = PackagePlan::compute(&def, vm);
        assert_eq!(plan.install, vec!["vim", "curl", "qemu-guest-agent"]);
    }

    #[test]
    fn operations_run_in_order_inside_the_sandbox() {
        let temp = TempDir::new().unwrap();
        let def = Definition::from_yaml(LOGGING_MANAGER).unwrap();
        let manager = Manager::select(&def.packages).unwrap();
        let ops = RecordingMounts::new();
        let sandbox = Sandbox::new(&ops, BTreeMap::new(), &[]).without_resolv_conf();
        let session = sandbox.enter(temp.path()).unwrap();

        manage_repositories(&manager, &def, def.scope(), &session).unwrap();
        manage_packages(&manager, &def, def.scope(), &session).unwrap();
        session.exit().unwrap();

        let log = fs::read_to_string(temp.path().join("log")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(
            lines,
            vec![
                "repo-add extra https://repo.example.org/extra",
                "refresh",
                "remove nano",
                "install vim curl openssh",
                "update",
                "clean",
            ]
        );
    }

    #[test]
    fn failing_operation_is_named() {
        let temp = TempDir::new().unwrap();
        let mut def = Definition::from_yaml(LOGGING_MANAGER).unwrap();
        if let Some(custom) = def.packages.custom_manager.as_mut() {
            custom.install = Some(CommandTemplate {
                cmd: "/bin/sh".into(),
                flags: vec!["-c".into(), "exit 100".into(), "sh".into()],
            });
        }
        let manager = Manager::select(&def.packages).unwrap();
        let ops = RecordingMounts::new();
        let sandbox = Sandbox::new(&ops, BTreeMap::new(), &[]).without_resolv_conf();
        let session = sandbox.enter(temp.path()).unwrap();

        let err = manage_packages(&manager, &def, def.scope(), &session).unwrap_err();
        drop(session);

        assert!(err.to_string().contains("package install with custom failed"));
        let log = fs::read_to_string(temp.path().join("log")).unwrap();
        assert!(!log.contains("update"));
        assert!(ops.active().is_empty());
    }
}
