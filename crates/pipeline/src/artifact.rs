use async_trait::async_trait;
use cas::{
    CasDatabase as _,
    DataId,
    MissingObject,
};
use engine::{
    AnyValue,
    Context,
    EngineKey,
    Function,
    FunctionInterface,
    Payload,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    action::{
        ActionExecutionKey,
        ActionList,
        ResolvedInput,
    },
    join_subrequests,
    rule::EvaluatedTargetKey,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    File,
    Directory,
}

/// Where an artifact's bytes come from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactOrigin {
    /// A workspace input already present in the CAS.
    Source { id: DataId },
    /// Produced by an action registered by the owning target's rule.
    Derived { owner: EvaluatedTargetKey },
}

/// A declared future file-or-directory output of an action, or a source
/// input. `root` is the configuration-and-label-scoped namespace; `path`
/// is relative to it. Until the producing action runs, a derived artifact
/// is a placeholder.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Artifact {
    pub root: String,
    pub path: String,
    pub content_type: ContentType,
    pub origin: ArtifactOrigin,
}

impl Artifact {
    pub fn source(path: &str, content_type: ContentType, id: DataId) -> Self {
        Self {
            root: String::new(),
            path: path.to_string(),
            content_type,
            origin: ArtifactOrigin::Source { id },
        }
    }

    /// The namespaced path, unique across targets and configurations.
    pub fn full_path(&self) -> String {
        if self.root.is_empty() {
            self.path.clone()
        } else {
            format!("{}/{}", self.root, self.path)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub artifact: Artifact,
}

impl ArtifactKey {
    pub fn new(artifact: Artifact) -> Self {
        Self { artifact }
    }
}

impl Payload for ArtifactKey {
    const IDENTIFIER: &'static str = "artifact";
}

impl EngineKey for ArtifactKey {
    type Value = ArtifactValue;
}

/// A materialized artifact: the CAS id of its content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactValue {
    pub id: DataId,
}

impl Payload for ArtifactValue {
    const IDENTIFIER: &'static str = "artifact.value";
}

pub(crate) struct ArtifactFunction;

#[async_trait]
impl Function for ArtifactFunction {
    async fn compute(
        &self,
        key: AnyValue,
        fi: &FunctionInterface,
        ctx: &Context,
    ) -> anyhow::Result<AnyValue> {
        let ArtifactKey { artifact } = key.unpack::<ArtifactKey>()?;
        let owner = match &artifact.origin {
            ArtifactOrigin::Source { id } => {
                return AnyValue::wrap(&ArtifactValue { id: id.clone() });
            },
            ArtifactOrigin::Derived { owner } => owner.clone(),
        };

        // Find the registered action that produces this artifact.
        let evaluated = fi.request_typed(&owner, ctx).await?;
        let coordinates = evaluated.outputs.get(&artifact.path).ok_or_else(|| {
            anyhow::anyhow!(
                "artifact {} is not produced by any action of {}",
                artifact.path,
                owner.configured_target.label,
            )
        })?;
        let actions_object = ctx
            .db()
            .get(&evaluated.actions_id)
            .await?
            .ok_or_else(|| MissingObject(evaluated.actions_id.clone()))?;
        let actions: ActionList = AnyValue::decode_from(&actions_object.data)?.unpack()?;
        let action = actions
            .actions
            .into_iter()
            .nth(coordinates.action_index as usize)
            .ok_or_else(|| anyhow::anyhow!("action index out of range"))?;

        // Resolve every input artifact, then hand the fully specified
        // action to the execution layer.
        let input_values = join_subrequests(
            ctx,
            action.inputs.iter().map(|input| {
                let key = ArtifactKey::new(input.clone());
                async move { fi.request_typed(&key, ctx).await }
            }),
        )
        .await?;
        let inputs = action
            .inputs
            .iter()
            .zip(input_values)
            .map(|(input, value)| ResolvedInput {
                path: input.full_path(),
                id: value.id,
                content_type: input.content_type,
            })
            .collect();

        let execution = ActionExecutionKey::from_action(&action, inputs, &artifact.root);
        let executed = fi.request_typed(&execution, ctx).await?;
        let id = executed
            .outputs
            .into_iter()
            .nth(coordinates.output_index as usize)
            .ok_or_else(|| anyhow::anyhow!("output index out of range"))?;
        AnyValue::wrap(&ArtifactValue { id })
    }
}
