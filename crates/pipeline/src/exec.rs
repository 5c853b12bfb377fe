use std::path::{
    Component,
    Path,
    PathBuf,
};

use async_trait::async_trait;
use cas::{
    CasDatabase as _,
    DataId,
    MissingObject,
};
use engine::{
    Context,
    EngineError,
};

use crate::{
    action::{
        ActionExecutionKey,
        EnvVar,
    },
    artifact::ContentType,
};

/// What an execution produced: output ids in the request's declared order,
/// the exit code, and the id of the captured stdout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionExecutionResponse {
    pub outputs: Vec<DataId>,
    pub exit_code: i32,
    pub stdout: DataId,
}

/// Runs fully resolved actions. How inputs are materialized is the
/// executor's business; the pipeline only promises resolved input ids and
/// declared output paths.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        request: &ActionExecutionKey,
        ctx: &Context,
    ) -> anyhow::Result<ActionExecutionResponse>;
}

/// Fails every request; for pipelines that must never reach execution.
pub struct NullExecutor;

#[async_trait]
impl Executor for NullExecutor {
    async fn execute(
        &self,
        _request: &ActionExecutionKey,
        _ctx: &Context,
    ) -> anyhow::Result<ActionExecutionResponse> {
        Err(EngineError::Unsupported.into())
    }
}

/// Runs actions as local subprocesses in a throwaway sandbox directory:
/// inputs are materialized from the CAS, the command runs with its
/// environment applied on top of the ambient one, and declared outputs are
/// read back and stored. Only file artifacts are supported.
pub struct LocalExecutor;

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(
        &self,
        request: &ActionExecutionKey,
        ctx: &Context,
    ) -> anyhow::Result<ActionExecutionResponse> {
        anyhow::ensure!(!request.arguments.is_empty(), "action has no arguments");
        let sandbox = tempfile::tempdir()?;

        for input in &request.inputs {
            if input.content_type != ContentType::File {
                return Err(EngineError::Unsupported.into());
            }
            let object = ctx
                .db()
                .get(&input.id)
                .await?
                .ok_or_else(|| MissingObject(input.id.clone()))?;
            let path = sandbox_path(sandbox.path(), &input.path)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &object.data).await?;
        }
        for output in &request.outputs {
            if output.content_type != ContentType::File {
                return Err(EngineError::Unsupported.into());
            }
            let path = sandbox_path(sandbox.path(), &output.path)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let workdir = match &request.working_directory {
            Some(dir) => {
                let dir = sandbox_path(sandbox.path(), dir)?;
                tokio::fs::create_dir_all(&dir).await?;
                dir
            },
            None => sandbox.path().to_path_buf(),
        };

        let mut background = Vec::new();
        for pre_action in &request.pre_actions {
            anyhow::ensure!(
                !pre_action.arguments.is_empty(),
                "pre-action has no arguments",
            );
            let mut command = build_command(
                &pre_action.arguments,
                &pre_action.environment,
                &workdir,
            );
            if pre_action.background {
                command.kill_on_drop(true);
                background.push(command.spawn()?);
            } else {
                let status = command.status().await?;
                anyhow::ensure!(
                    status.success(),
                    "pre-action {:?} exited with {status}",
                    pre_action.arguments[0],
                );
            }
        }

        tracing::debug!(command = %request.arguments.join(" "), "running action");
        let output = build_command(&request.arguments, &request.environment, &workdir)
            .output()
            .await?;
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = ctx.db().put(Vec::new(), output.stdout.into()).await?;
        drop(background);

        if exit_code != 0 {
            return Ok(ActionExecutionResponse {
                outputs: Vec::new(),
                exit_code,
                stdout,
            });
        }

        let mut outputs = Vec::with_capacity(request.outputs.len());
        for output in &request.outputs {
            let path = sandbox_path(sandbox.path(), &output.path)?;
            let data = tokio::fs::read(&path).await.map_err(|e| {
                anyhow::anyhow!("action did not produce declared output {:?}: {e}", output.path)
            })?;
            outputs.push(ctx.db().put(Vec::new(), data.into()).await?);
        }
        Ok(ActionExecutionResponse {
            outputs,
            exit_code,
            stdout,
        })
    }
}

fn build_command(arguments: &[String], environment: &[EnvVar], workdir: &Path) -> tokio::process::Command {
    let mut command = tokio::process::Command::new(&arguments[0]);
    command
        .args(&arguments[1..])
        .envs(environment.iter().map(|e| (&e.name, &e.value)))
        .current_dir(workdir)
        .stdin(std::process::Stdio::null());
    command
}

/// Joins a declared path onto the sandbox root, rejecting anything that
/// could escape it.
fn sandbox_path(root: &Path, declared: &str) -> anyhow::Result<PathBuf> {
    let declared_path = Path::new(declared);
    let escapes = declared.is_empty()
        || declared_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    anyhow::ensure!(!escapes, "path {declared:?} escapes the sandbox");
    Ok(root.join(declared_path))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::sandbox_path;

    #[test]
    fn test_sandbox_path_rejects_escapes() {
        let root = Path::new("/sandbox");
        assert!(sandbox_path(root, "ok/nested/file.txt").is_ok());
        assert!(sandbox_path(root, "").is_err());
        assert!(sandbox_path(root, "/absolute").is_err());
        assert!(sandbox_path(root, "../outside").is_err());
        assert!(sandbox_path(root, "ok/../../outside").is_err());
    }
}
