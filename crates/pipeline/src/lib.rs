//! The two-phase build pipeline on top of the evaluation engine:
//! *evaluation* lowers `(workspace root, label, configuration)` to a
//! configured target and then to providers plus a graph of deferred
//! actions; *execution* materializes artifacts by running those actions
//! through an executor.

use std::future::Future;

use engine::Context;

mod action;
mod artifact;
mod config;
mod exec;
mod label;
mod provider;
mod rule;
mod system;
mod target;

pub use action::{
    ActionExecutionKey,
    ActionExecutionValue,
    ActionList,
    ActionSpec,
    EnvVar,
    OutputSpec,
    PreAction,
    ResolvedInput,
};
pub use artifact::{
    Artifact,
    ArtifactKey,
    ArtifactOrigin,
    ArtifactValue,
    ContentType,
};
pub use config::{
    ConfigurationKey,
    ConfigurationValue,
};
pub use exec::{
    ActionExecutionResponse,
    Executor,
    LocalExecutor,
    NullExecutor,
};
pub use label::{
    Label,
    LabelError,
};
pub use provider::ProviderMap;
pub use rule::{
    EvaluatedTargetKey,
    EvaluatedTargetValue,
    OutputCoordinates,
    Rule,
    RuleContext,
    RuleLookupDelegate,
};
pub use system::{
    BuildSystem,
    PipelineDelegates,
};
pub use target::{
    ConfiguredTarget,
    ConfiguredTargetDelegate,
    ConfiguredTargetKey,
    ConfiguredTargetValue,
    DependencyProviders,
    TargetDependency,
};

/// Awaits a family of parallel subrequests. The first error (in request
/// order) propagates; later errors are reported through the tracer only.
pub(crate) async fn join_subrequests<T>(
    ctx: &Context,
    requests: impl IntoIterator<Item = impl Future<Output = anyhow::Result<T>>>,
) -> anyhow::Result<Vec<T>> {
    let results = futures::future::join_all(requests).await;
    let mut values = Vec::with_capacity(results.len());
    let mut first_error = None;
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                } else if let Some(tracer) = ctx.tracer() {
                    tracer.error(&format!("{e:#}"));
                }
            },
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(values),
    }
}
