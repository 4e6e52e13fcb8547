//! Package managers assembled from user-supplied command templates.

use super::{Commands, Manager, RepoHandler};
use crate::definition::{CommandTemplate, CustomManagerDef};
use crate::error::DefinitionError;

pub const NAME: &str = "custom";

fn required(
    template: &Option<CommandTemplate>,
    what: &'static str,
) -> Result<CommandTemplate, DefinitionError> {
    template
        .clone()
        .filter(|t| !t.cmd.trim().is_empty())
        .ok_or(DefinitionError::IncompleteCustomManager(what))
}

/// Build a manager from `def`.
///
/// `install`, `remove`, `update` and `refresh` are always required;
/// `repo_add` only when the definition declares repositories.
pub fn from_definition(
    def: &CustomManagerDef,
    needs_repositories: bool,
) -> Result<Manager, DefinitionError> {
    let commands = Commands {
        install: required(&def.install, "install")?,
        remove: required(&def.remove, "remove")?,
        update: required(&def.update, "update")?,
        refresh: required(&def.refresh, "refresh")?,
        clean: def.clean.clone(),
        global: def.flags.clone(),
    };

    let repos = match (&def.repo_add, needs_repositories) {
        (Some(_), _) => RepoHandler::Commands {
            add: required(&def.repo_add, "repo_add")?,
            remove: def.repo_remove.clone(),
        },
        (None, true) => return Err(DefinitionError::IncompleteCustomManager("repo_add")),
        (None, false) => RepoHandler::Unsupported,
    };

    Ok(Manager {
        name: NAME.to_string(),
        commands,
        repos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(cmd: &str, flags: &[&str]) -> Option<CommandTemplate> {
        Some(CommandTemplate {
            cmd: cmd.into(),
            flags: flags.iter().map(|f| f.to_string()).collect(),
        })
    }

    fn complete() -> CustomManagerDef {
        CustomManagerDef {
            install: template("xbps-install", &["-y"]),
            remove: template("xbps-remove", &["-y"]),
            update: template("xbps-install", &["-Suy"]),
            refresh: template("xbps-install", &["-S"]),
            clean: template("xbps-remove", &["-O"]),
            repo_add: None,
            repo_remove: None,
            flags: vec!["--yes".into()],
        }
    }

    #[test]
    fn complete_definition_builds() {
        let manager = from_definition(&complete(), false).unwrap();
        assert_eq!(manager.name, NAME);
        assert_eq!(manager.commands.global, vec!["--yes".to_string()]);
        assert_eq!(manager.repos, RepoHandler::Unsupported);
    }

    #[test]
    fn missing_operation_is_named() {
        let mut def = complete();
        def.refresh = None;
        assert_eq!(
            from_definition(&def, false).unwrap_err(),
            DefinitionError::IncompleteCustomManager("refresh")
        );

        let mut def = complete();
        def.install = template("  ", &[]);
        assert_eq!(
            from_definition(&def, false).unwrap_err(),
            DefinitionError::IncompleteCustomManager("install")
        );
    }

    #[test]
    fn repositories_require_repo_add() {
        assert_eq!(
            from_definition(&complete(), true).unwrap_err(),
            DefinitionError::IncompleteCustomManager("repo_add")
        );

        let mut def = complete();
        def.repo_add = template("xbps-repo", &["add"]);
        let manager = from_definition(&def, true).unwrap();
        assert!(matches!(manager.repos, RepoHandler::Commands { .. }));
    }
}
