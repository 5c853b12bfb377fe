use std::sync::Arc;

use cas::DataId;
use engine::{
    register_key,
    register_value,
    Context,
    Engine,
    Function,
    FunctionLookupDelegate,
};

use crate::{
    action::{
        ActionExecutionFunction,
        ActionExecutionKey,
        ActionList,
    },
    artifact::{
        Artifact,
        ArtifactFunction,
        ArtifactKey,
        ArtifactValue,
    },
    config::{
        ConfigurationFunction,
        ConfigurationKey,
    },
    exec::Executor,
    label::Label,
    rule::{
        EvaluatedTargetFunction,
        EvaluatedTargetKey,
        EvaluatedTargetValue,
        RuleLookupDelegate,
    },
    target::{
        ConfiguredTargetDelegate,
        ConfiguredTargetFunction,
        ConfiguredTargetKey,
    },
};

/// The user-supplied collaborators the pipeline functions reach through
/// the context: how targets are configured, which rule serves a target
/// type, and what executes actions.
#[derive(Clone)]
pub struct PipelineDelegates {
    pub configured_target: Arc<dyn ConfiguredTargetDelegate>,
    pub rules: Arc<dyn RuleLookupDelegate>,
    pub executor: Arc<dyn Executor>,
}

/// Built-in functions first; anything else falls through to the user's
/// delegate (configuration fragments, application keys).
struct PipelineFunctions {
    base: Option<Arc<dyn FunctionLookupDelegate>>,
}

impl FunctionLookupDelegate for PipelineFunctions {
    fn function(&self, key_identifier: &str) -> Option<Arc<dyn Function>> {
        use engine::Payload as _;
        match key_identifier {
            id if id == ConfigurationKey::IDENTIFIER => Some(Arc::new(ConfigurationFunction)),
            id if id == ConfiguredTargetKey::IDENTIFIER => Some(Arc::new(ConfiguredTargetFunction)),
            id if id == EvaluatedTargetKey::IDENTIFIER => Some(Arc::new(EvaluatedTargetFunction)),
            id if id == ArtifactKey::IDENTIFIER => Some(Arc::new(ArtifactFunction)),
            id if id == ActionExecutionKey::IDENTIFIER => Some(Arc::new(ActionExecutionFunction)),
            _ => self.base.as_ref().and_then(|base| base.function(key_identifier)),
        }
    }
}

fn register_builtin_types() {
    register_key::<ConfigurationKey>();
    register_key::<ConfiguredTargetKey>();
    register_key::<EvaluatedTargetKey>();
    register_key::<ArtifactKey>();
    register_key::<ActionExecutionKey>();
    register_value::<ActionList>();
}

/// An engine wired with the build pipeline. Delegates travel in the
/// context (see [`PipelineDelegates`]), so one system can serve many
/// workspaces.
pub struct BuildSystem {
    engine: Engine,
}

impl BuildSystem {
    pub fn new(base_functions: Option<Arc<dyn FunctionLookupDelegate>>) -> Self {
        register_builtin_types();
        Self {
            engine: Engine::new(Arc::new(PipelineFunctions {
                base: base_functions,
            })),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Installs the pipeline delegates into a context.
    pub fn prepare(&self, ctx: &Context, delegates: PipelineDelegates) -> Context {
        ctx.with_value(delegates)
    }

    /// Evaluates a target: providers plus the registered action graph.
    pub async fn evaluate(
        &self,
        root_id: DataId,
        label: Label,
        configuration: ConfigurationKey,
        ctx: &Context,
    ) -> anyhow::Result<EvaluatedTargetValue> {
        let key = EvaluatedTargetKey::new(ConfiguredTargetKey {
            root_id,
            label,
            configuration,
        });
        self.engine.build_typed(&key, ctx).await
    }

    /// Materializes an artifact by executing the action that produces it
    /// (and, recursively, everything that action needs).
    pub async fn build_artifact(
        &self,
        artifact: Artifact,
        ctx: &Context,
    ) -> anyhow::Result<ArtifactValue> {
        self.engine.build_typed(&ArtifactKey::new(artifact), ctx).await
    }
}
