use std::{
    collections::BTreeMap,
    sync::Arc,
};

use async_trait::async_trait;
use cas::{
    CasDatabase as _,
    DataId,
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
        ActionList,
        ActionSpec,
    },
    artifact::{
        Artifact,
        ArtifactOrigin,
        ContentType,
    },
    config::ConfigurationValue,
    label::Label,
    provider::ProviderMap,
    system::PipelineDelegates,
    target::{
        ConfiguredTargetKey,
        ConfiguredTargetValue,
        DependencyProviders,
    },
};

/// Requests the rule evaluation of a configured target.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvaluatedTargetKey {
    pub configured_target: ConfiguredTargetKey,
}

impl EvaluatedTargetKey {
    pub fn new(configured_target: ConfiguredTargetKey) -> Self {
        Self { configured_target }
    }
}

impl Payload for EvaluatedTargetKey {
    const IDENTIFIER: &'static str = "evaluated-target";
}

impl EngineKey for EvaluatedTargetKey {
    type Value = EvaluatedTargetValue;
}

/// Where one declared output lives in the target's action list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCoordinates {
    pub action_index: u32,
    pub output_index: u32,
}

/// The rule's published providers, plus the CAS id of the serialized
/// action list and the coordinates of every declared output in it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedTargetValue {
    pub providers: ProviderMap,
    pub actions_id: DataId,
    pub outputs: BTreeMap<String, OutputCoordinates>,
}

impl Payload for EvaluatedTargetValue {
    const IDENTIFIER: &'static str = "evaluated-target.value";
}

/// Turns a configured target and its upstream providers into its own
/// providers, registering the actions that will later produce its declared
/// artifacts. At most one rule invocation happens per configured target.
#[async_trait]
pub trait Rule: Send + Sync {
    async fn evaluate(
        &self,
        target: AnyValue,
        rule_ctx: &mut RuleContext,
    ) -> anyhow::Result<Vec<AnyValue>>;
}

/// Resolves the rule for a configured target's type identifier.
pub trait RuleLookupDelegate: Send + Sync {
    fn rule(&self, target_type: &str) -> Option<Arc<dyn Rule>>;
}

/// Handed to a rule while it runs: upstream providers by dependency name,
/// the active configuration fragments, and the artifact-declaration and
/// action-registration API.
pub struct RuleContext {
    key: EvaluatedTargetKey,
    root: String,
    configuration: ConfigurationValue,
    dependencies: BTreeMap<String, DependencyProviders>,
    declared: Vec<String>,
    actions: Vec<ActionSpec>,
}

impl RuleContext {
    fn new(
        key: EvaluatedTargetKey,
        configuration: ConfigurationValue,
        dependencies: BTreeMap<String, DependencyProviders>,
    ) -> anyhow::Result<Self> {
        let label = &key.configured_target.label;
        let root = format!(
            "{}/{}/{}",
            key.configured_target.configuration.short_hash()?,
            label.path_string(),
            label.name(),
        );
        Ok(Self {
            key,
            root,
            configuration,
            dependencies,
            declared: Vec::new(),
            actions: Vec::new(),
        })
    }

    pub fn label(&self) -> &Label {
        &self.key.configured_target.label
    }

    pub fn configuration(&self) -> &ConfigurationValue {
        &self.configuration
    }

    pub fn fragment<T: Payload>(&self) -> anyhow::Result<T> {
        self.configuration.fragment::<T>()
    }

    pub fn dependency(&self, name: &str) -> anyhow::Result<&DependencyProviders> {
        self.dependencies
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("no dependency group named {name:?}"))
    }

    /// Declares a future output of this target. The artifact's namespace is
    /// scoped by configuration hash and label, so equal relative paths in
    /// other targets or configurations never collide.
    pub fn declare_artifact(
        &mut self,
        path: &str,
        content_type: ContentType,
    ) -> anyhow::Result<Artifact> {
        anyhow::ensure!(
            !self.declared.iter().any(|p| p == path),
            "artifact {path:?} is already declared",
        );
        self.declared.push(path.to_string());
        Ok(Artifact {
            root: self.root.clone(),
            path: path.to_string(),
            content_type,
            origin: ArtifactOrigin::Derived {
                owner: self.key.clone(),
            },
        })
    }

    /// Registers the action producing one or more declared artifacts. Every
    /// output must have been declared through [`RuleContext::declare_artifact`].
    pub fn register_action(&mut self, action: ActionSpec) -> anyhow::Result<()> {
        anyhow::ensure!(
            !action.outputs.is_empty(),
            "an action must declare at least one output",
        );
        for output in &action.outputs {
            anyhow::ensure!(
                self.declared.iter().any(|p| p == &output.path),
                "action output {:?} was never declared",
                output.path,
            );
            let already_produced = self
                .actions
                .iter()
                .any(|a| a.outputs.iter().any(|o| o.path == output.path));
            anyhow::ensure!(
                !already_produced,
                "artifact {:?} is produced by more than one action",
                output.path,
            );
        }
        self.actions.push(action);
        Ok(())
    }

    /// Consumes the context, yielding the action list and the coordinates
    /// of every declared artifact. Undeclared-but-registered outputs were
    /// rejected eagerly; declared-but-unproduced artifacts are rejected
    /// here.
    fn finish(self) -> anyhow::Result<(ActionList, BTreeMap<String, OutputCoordinates>)> {
        let mut outputs = BTreeMap::new();
        for (action_index, action) in self.actions.iter().enumerate() {
            for (output_index, output) in action.outputs.iter().enumerate() {
                outputs.insert(
                    output.path.clone(),
                    OutputCoordinates {
                        action_index: action_index as u32,
                        output_index: output_index as u32,
                    },
                );
            }
        }
        for path in &self.declared {
            anyhow::ensure!(
                outputs.contains_key(path),
                "declared artifact {path:?} is not produced by any action",
            );
        }
        Ok((
            ActionList {
                actions: self.actions,
            },
            outputs,
        ))
    }
}

pub(crate) struct EvaluatedTargetFunction;

#[async_trait]
impl Function for EvaluatedTargetFunction {
    async fn compute(
        &self,
        key: AnyValue,
        fi: &FunctionInterface,
        ctx: &Context,
    ) -> anyhow::Result<AnyValue> {
        let key = key.unpack::<EvaluatedTargetKey>()?;
        let delegates = ctx.require::<PipelineDelegates>()?;

        let configured: ConfiguredTargetValue =
            fi.request_typed(&key.configured_target, ctx).await?;
        let configuration: ConfigurationValue = fi
            .request_typed(&key.configured_target.configuration, ctx)
            .await?;

        let rule = delegates
            .rules
            .rule(&configured.target.type_identifier)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no rule registered for target type {}",
                    configured.target.type_identifier,
                )
            })?;

        let mut rule_ctx = RuleContext::new(key, configuration, configured.dependencies)?;
        let providers = rule.evaluate(configured.target, &mut rule_ctx).await?;
        let providers = ProviderMap::new(providers)?;

        let (actions, outputs) = rule_ctx.finish()?;
        let actions_envelope = AnyValue::wrap(&actions)?;
        let actions_id = ctx
            .db()
            .put(Vec::new(), actions_envelope.encode_to_bytes())
            .await?;

        AnyValue::wrap(&EvaluatedTargetValue {
            providers,
            actions_id,
            outputs,
        })
    }
}
