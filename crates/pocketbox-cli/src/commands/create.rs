//! `pbx create`: Create a container from a local image.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use pocketbox_common::records::{Bind, ContainerOverrides};
use pocketbox_runtime::{Container, Engine};

use crate::commands::find_image;
use crate::output::{BOLD, DIM, GREEN, RESET, short_id};

/// Arguments shared by `create` and `run`.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Image ID or reference.
    pub image: String,

    /// Container name. Generated when omitted.
    #[arg(long)]
    pub name: Option<String>,

    /// Environment variable as `KEY=VALUE`. Repeatable.
    #[arg(short, long = "env", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Bind a host path as `host:container[:ro]`. Repeatable.
    #[arg(short = 'v', long = "bind", value_parser = parse_bind)]
    pub binds: Vec<Bind>,

    /// Working directory inside the container.
    #[arg(short, long)]
    pub workdir: Option<String>,

    /// Hostname reported to processes.
    #[arg(long)]
    pub hostname: Option<String>,

    /// User reported to processes.
    #[arg(short, long)]
    pub user: Option<String>,

    /// Override the image entrypoint (whitespace-separated).
    #[arg(long)]
    pub entrypoint: Option<String>,

    /// Command to run instead of the image default.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl CreateArgs {
    /// Collects the options the user actually passed.
    fn overrides(&self) -> ContainerOverrides {
        ContainerOverrides {
            cmd: (!self.command.is_empty()).then(|| self.command.clone()),
            entrypoint: self
                .entrypoint
                .as_ref()
                .map(|e| e.split_whitespace().map(str::to_string).collect()),
            env: self.env.iter().cloned().collect(),
            working_dir: self.workdir.clone(),
            hostname: self.hostname.clone(),
            user: self.user.clone(),
            binds: self.binds.clone(),
        }
    }

    /// Creates the container described by these arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if the image is unknown or creation fails.
    pub async fn create(&self, engine: &Engine) -> anyhow::Result<Container> {
        let image = find_image(engine, &self.image)?;
        let container = engine
            .create_container(&image.id, self.name.as_deref(), self.overrides())
            .await
            .with_context(|| format!("failed to create container from {}", image.display_name()))?;
        eprintln!(
            "  {GREEN}Created{RESET} {BOLD}{}{RESET} {DIM}[{}]{RESET}",
            container.name(),
            short_id(container.id().as_str())
        );
        Ok(container)
    }
}

/// Executes the `create` command.
///
/// # Errors
///
/// Returns an error if the image is unknown or creation fails.
pub async fn execute(engine: &Engine, args: CreateArgs) -> anyhow::Result<()> {
    let container = args.create(engine).await?;
    println!("{}", container.id());
    Ok(())
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

fn parse_bind(s: &str) -> Result<Bind, String> {
    let (spec, read_only) = s
        .strip_suffix(":ro")
        .map_or((s, false), |spec| (spec, true));
    match spec.split_once(':') {
        Some((host, container)) if !host.is_empty() && container.starts_with('/') => Ok(Bind {
            host_path: PathBuf::from(host),
            container_path: container.to_string(),
            read_only,
        }),
        _ => Err(format!("expected host:/container[:ro], got '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_splits_on_first_equals() {
        assert_eq!(
            parse_env("URL=a=b").unwrap(),
            ("URL".to_string(), "a=b".to_string())
        );
        assert!(parse_env("=x").is_err());
        assert!(parse_env("novalue").is_err());
    }

    #[test]
    fn parse_bind_reads_read_only_suffix() {
        let bind = parse_bind("/data:/srv/data:ro").unwrap();
        assert_eq!(bind.host_path, PathBuf::from("/data"));
        assert_eq!(bind.container_path, "/srv/data");
        assert!(bind.read_only);

        let bind = parse_bind("/tmp:/tmp").unwrap();
        assert!(!bind.read_only);
        assert!(parse_bind("/tmp").is_err());
        assert!(parse_bind("/tmp:relative").is_err());
    }

    fn args(command: &[&str]) -> CreateArgs {
        CreateArgs {
            image: "alpine".into(),
            name: None,
            env: vec![("A".into(), "1".into())],
            binds: Vec::new(),
            workdir: None,
            hostname: Some("box".into()),
            user: None,
            entrypoint: None,
            command: command.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn unset_options_are_left_to_the_image() {
        let overrides = args(&[]).overrides();
        assert_eq!(overrides.cmd, None);
        assert_eq!(overrides.working_dir, None);
        assert_eq!(overrides.user, None);
        assert_eq!(overrides.hostname.as_deref(), Some("box"));
        assert_eq!(overrides.env.get("A").map(String::as_str), Some("1"));
    }

    #[test]
    fn explicit_shell_command_is_kept() {
        let overrides = args(&["/bin/sh"]).overrides();
        assert_eq!(overrides.cmd, Some(vec!["/bin/sh".to_string()]));
    }
}
