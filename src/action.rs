//! The external deployment action.
//!
//! The dispatcher doesn't know what deploying means. An `Action` only turns a host and a mode into
//! a process invocation; the job executor owns the spawned process from there on.

use std::path::PathBuf;

use handlebars::Handlebars;
use serde_json::json;
use tokio::process::Command;

use crate::config::Mode;
use crate::error::FleetError;
use crate::host::Host;

/// Builds the process that deploys to one host.
pub trait Action: Send + Sync {
    fn command(&self, host: &Host, mode: Mode) -> Result<Command, FleetError>;
}

/// Runs a deploy program as `PROGRAM -u USER -p PORT [-k KEY] [--dry-run] HOST`.
#[derive(Debug, Clone)]
pub struct ScriptAction {
    program: PathBuf,
}

impl ScriptAction {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Action for ScriptAction {
    fn command(&self, host: &Host, mode: Mode) -> Result<Command, FleetError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-u").arg(&host.user);
        cmd.arg("-p").arg(host.port.to_string());
        if let Some(key) = &host.key {
            cmd.arg("-k").arg(key);
        }
        if mode == Mode::Simulate {
            cmd.arg("--dry-run");
        }
        cmd.arg(&host.address);
        Ok(cmd)
    }
}

/// Renders a handlebars template per host and runs the result with `sh -c`.
///
/// Available variables are `host`, `user`, `port`, `key` and `dry_run`.
pub struct TemplateAction {
    registry: Handlebars<'static>,
}

impl TemplateAction {
    const TEMPLATE_NAME: &'static str = "command";

    pub fn new(template: &str) -> Result<Self, FleetError> {
        let mut registry = Handlebars::new();
        handlebars_misc_helpers::register(&mut registry);
        // The output is a shell command, not HTML.
        registry.register_escape_fn(handlebars::no_escape);
        registry.set_strict_mode(true);
        registry
            .register_template_string(Self::TEMPLATE_NAME, template)
            .map_err(|e| FleetError::Template(e.to_string()))?;
        Ok(Self { registry })
    }

    pub fn render(&self, host: &Host, mode: Mode) -> Result<String, FleetError> {
        let params = json!({
            "host": host.address,
            "user": host.user,
            "port": host.port,
            "key": host.key.as_ref().map(|k| k.display().to_string()).unwrap_or_default(),
            "dry_run": mode == Mode::Simulate,
        });
        self.registry
            .render(Self::TEMPLATE_NAME, &params)
            .map_err(|e| FleetError::Template(e.to_string()))
    }
}

impl Action for TemplateAction {
    fn command(&self, host: &Host, mode: Mode) -> Result<Command, FleetError> {
        let rendered = self.render(host, mode)?;
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(rendered);
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_script_action_live() {
        let host = Host::new("10.0.0.5").with_user("admin").with_port(2222);
        let cmd = ScriptAction::new("/opt/deploy.sh")
            .command(&host, Mode::Live)
            .unwrap();
        assert_eq!(cmd.as_std().get_program(), "/opt/deploy.sh");
        assert_eq!(args_of(&cmd), vec!["-u", "admin", "-p", "2222", "10.0.0.5"]);
    }

    #[test]
    fn test_script_action_key_and_dry_run() {
        let host = Host::new("h").with_key("/keys/k");
        let cmd = ScriptAction::new("deploy")
            .command(&host, Mode::Simulate)
            .unwrap();
        assert_eq!(
            args_of(&cmd),
            vec!["-u", "root", "-p", "22", "-k", "/keys/k", "--dry-run", "h"]
        );
    }

    #[test]
    fn test_template_action_renders_params() {
        let action =
            TemplateAction::new("ssh -p {{port}} {{user}}@{{host}} install{{#if dry_run}} --check{{/if}}")
                .unwrap();
        let host = Host::new("web-1").with_user("ops").with_port(2200);
        assert_eq!(
            action.render(&host, Mode::Live).unwrap(),
            "ssh -p 2200 ops@web-1 install"
        );
        assert_eq!(
            action.render(&host, Mode::Simulate).unwrap(),
            "ssh -p 2200 ops@web-1 install --check"
        );
    }

    #[test]
    fn test_template_action_does_not_html_escape() {
        let action = TemplateAction::new("deploy -i {{key}} {{host}}").unwrap();
        let host = Host::new("h").with_key("/home/me/.ssh/id=rsa");
        assert_eq!(
            action.render(&host, Mode::Live).unwrap(),
            "deploy -i /home/me/.ssh/id=rsa h"
        );
    }

    #[test]
    fn test_template_action_wraps_in_shell() {
        let action = TemplateAction::new("echo {{host}}").unwrap();
        let cmd = action.command(&Host::new("a"), Mode::Live).unwrap();
        assert_eq!(cmd.as_std().get_program(), "sh");
        assert_eq!(args_of(&cmd), vec!["-c", "echo a"]);
    }

    #[test]
    fn test_template_action_rejects_bad_template() {
        assert!(matches!(
            TemplateAction::new("echo {{#if host}}"),
            Err(FleetError::Template(_))
        ));
    }

    #[test]
    fn test_template_action_unknown_variable_is_error() {
        let action = TemplateAction::new("echo {{nope}}").unwrap();
        assert!(matches!(
            action.render(&Host::new("a"), Mode::Live),
            Err(FleetError::Template(_))
        ));
    }
}
