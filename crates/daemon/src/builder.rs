//! Container image builds, loaded straight into the kind cluster.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::config::ImageConfig;
use crate::process::{describe, run_checked, CommandError};

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Builds `image` and makes it available to the cluster.
    async fn build(&self, image: &ImageConfig) -> Result<(), CommandError>;
}

/// Drives `podman`/`docker` and `kind load`.
#[derive(Debug, Clone)]
pub struct CliImageBuilder {
    builder: String,
    cluster: String,
}

impl CliImageBuilder {
    pub fn new(builder: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            builder: builder.into(),
            cluster: cluster.into(),
        }
    }

    fn build_command(&self, image: &ImageConfig) -> Command {
        let mut cmd = Command::new(&self.builder);
        cmd.arg("build").arg("-t").arg(&image.tag);
        if let Some(cf) = &image.containerfile {
            cmd.arg("-f").arg(cf);
        }
        cmd.arg(&image.context).kill_on_drop(true);
        cmd
    }

    /// `<builder> save <tag> | kind load image-archive /dev/stdin`.
    async fn load(&self, tag: &str) -> Result<(), CommandError> {
        let mut save = Command::new(&self.builder);
        save.args(["save", tag])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let save_desc = describe(&save);
        let mut saver = save.spawn().map_err(|source| CommandError::Spawn {
            command: save_desc.clone(),
            source,
        })?;
        let archive: Stdio = saver
            .stdout
            .take()
            .ok_or_else(|| CommandError::Failed {
                command: save_desc.clone(),
                status: "no stdout".into(),
                stderr: String::new(),
            })?
            .try_into()
            .map_err(|source| CommandError::Spawn {
                command: save_desc.clone(),
                source,
            })?;

        let mut load = Command::new("kind");
        load.args(["load", "image-archive", "/dev/stdin", "--name", &self.cluster])
            .stdin(archive)
            .kill_on_drop(true);
        let loaded = run_loader(load).await;

        let status = saver.wait().await.map_err(|source| CommandError::Spawn {
            command: save_desc.clone(),
            source,
        })?;
        loaded?;
        if !status.success() {
            return Err(CommandError::Failed {
                command: save_desc,
                status: status.to_string(),
                stderr: String::new(),
            });
        }
        Ok(())
    }
}

async fn run_loader(mut cmd: Command) -> Result<(), CommandError> {
    let command = describe(&cmd);
    let out = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            command: command.clone(),
            source,
        })?;
    if !out.status.success() {
        return Err(CommandError::Failed {
            command,
            status: out.status.to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl ImageBuilder for CliImageBuilder {
    async fn build(&self, image: &ImageConfig) -> Result<(), CommandError> {
        info!(tag = %image.tag, context = %image.context.display(), "building image");
        run_checked(self.build_command(image)).await?;
        self.load(&image.tag).await?;
        info!(tag = %image.tag, cluster = %self.cluster, "image loaded");
        Ok(())
    }
}
