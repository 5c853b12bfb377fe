use async_trait::async_trait;
use cas::DataId;
use engine::{
    AnyValue,
    Context,
    EngineError,
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
    artifact::{
        Artifact,
        ContentType,
    },
    system::PipelineDelegates,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// A command run before the main action. Background pre-actions are kept
/// alive while the main command runs and reaped afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreAction {
    pub arguments: Vec<String>,
    pub environment: Vec<EnvVar>,
    pub background: bool,
}

/// A declared output of an action: a path relative to the owning target's
/// namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputSpec {
    pub path: String,
    pub content_type: ContentType,
}

/// A closed specification of work. Two actions with an identical spec and
/// identical input ids yield the same cached result; the environment is
/// kept sorted by name so equality is structural.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionSpec {
    pub arguments: Vec<String>,
    pub environment: Vec<EnvVar>,
    pub working_directory: Option<String>,
    pub pre_actions: Vec<PreAction>,
    pub inputs: Vec<Artifact>,
    pub outputs: Vec<OutputSpec>,
    pub mnemonic: String,
    pub description: String,
}

impl ActionSpec {
    pub fn command(arguments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            arguments: arguments.into_iter().map(Into::into).collect(),
            environment: Vec::new(),
            working_directory: None,
            pre_actions: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            mnemonic: String::new(),
            description: String::new(),
        }
    }

    pub fn with_env(mut self, name: &str, value: &str) -> Self {
        self.environment.push(EnvVar {
            name: name.to_string(),
            value: value.to_string(),
        });
        self.environment.sort_by(|a, b| a.name.cmp(&b.name));
        self
    }

    pub fn with_working_directory(mut self, dir: &str) -> Self {
        self.working_directory = Some(dir.to_string());
        self
    }

    pub fn with_pre_action(mut self, pre_action: PreAction) -> Self {
        self.pre_actions.push(pre_action);
        self
    }

    pub fn with_input(mut self, input: Artifact) -> Self {
        self.inputs.push(input);
        self
    }

    /// Declares `artifact` (previously obtained from
    /// `RuleContext::declare_artifact`) as the next output of this action.
    pub fn with_output(mut self, artifact: &Artifact) -> Self {
        self.outputs.push(OutputSpec {
            path: artifact.path.clone(),
            content_type: artifact.content_type,
        });
        self
    }

    pub fn with_mnemonic(mut self, mnemonic: &str) -> Self {
        self.mnemonic = mnemonic.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// Every action a rule registered for one target, serialized as a single
/// CAS object and referenced by `EvaluatedTargetValue::actions_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionList {
    pub actions: Vec<ActionSpec>,
}

impl Payload for ActionList {
    const IDENTIFIER: &'static str = "action-list";
}

/// An input with its placeholder resolved: the namespaced path the
/// executor materializes it at, and the id of its content.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedInput {
    pub path: String,
    pub id: DataId,
    pub content_type: ContentType,
}

/// A fully resolved action, ready to execute. Memoization of this key is
/// what guarantees at most one execution per `(spec, input ids)` tuple.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionExecutionKey {
    pub arguments: Vec<String>,
    pub environment: Vec<EnvVar>,
    pub working_directory: Option<String>,
    pub pre_actions: Vec<PreAction>,
    pub inputs: Vec<ResolvedInput>,
    pub outputs: Vec<OutputSpec>,
    pub mnemonic: String,
    pub description: String,
}

impl ActionExecutionKey {
    /// Closes over an action spec: inputs become `(path, id, type)`
    /// triples and output paths are namespaced under the owning target's
    /// root.
    pub(crate) fn from_action(
        action: &ActionSpec,
        inputs: Vec<ResolvedInput>,
        root: &str,
    ) -> Self {
        Self {
            arguments: action.arguments.clone(),
            environment: action.environment.clone(),
            working_directory: action.working_directory.clone(),
            pre_actions: action.pre_actions.clone(),
            inputs,
            outputs: action
                .outputs
                .iter()
                .map(|output| OutputSpec {
                    path: format!("{root}/{}", output.path),
                    content_type: output.content_type,
                })
                .collect(),
            mnemonic: action.mnemonic.clone(),
            description: action.description.clone(),
        }
    }
}

impl Payload for ActionExecutionKey {
    const IDENTIFIER: &'static str = "action-execution";
}

impl EngineKey for ActionExecutionKey {
    type Value = ActionExecutionValue;
}

/// Output ids in declared order, plus the exit code and captured stdout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionExecutionValue {
    pub outputs: Vec<DataId>,
    pub exit_code: i32,
    pub stdout: DataId,
}

impl Payload for ActionExecutionValue {
    const IDENTIFIER: &'static str = "action-execution.value";
}

pub(crate) struct ActionExecutionFunction;

#[async_trait]
impl Function for ActionExecutionFunction {
    async fn compute(
        &self,
        key: AnyValue,
        _fi: &FunctionInterface,
        ctx: &Context,
    ) -> anyhow::Result<AnyValue> {
        let key = key.unpack::<ActionExecutionKey>()?;
        let delegates = ctx.require::<PipelineDelegates>()?;

        if let Some(tracer) = ctx.tracer() {
            tracer.span_begin("execute", &describe(&key));
        }
        let result = delegates.executor.execute(&key, ctx).await;
        if let Some(tracer) = ctx.tracer() {
            if let Err(e) = &result {
                tracer.error(&format!("{}: {e:#}", describe(&key)));
            }
            tracer.span_end("execute");
        }
        let response = result?;

        if response.exit_code != 0 {
            return Err(anyhow::Error::from(EngineError::ExecutionFailed {
                exit_code: response.exit_code,
            })
            .context(format!("action {:?} failed", describe(&key))));
        }
        anyhow::ensure!(
            response.outputs.len() == key.outputs.len(),
            "executor returned {} outputs for {} declared",
            response.outputs.len(),
            key.outputs.len(),
        );
        AnyValue::wrap(&ActionExecutionValue {
            outputs: response.outputs,
            exit_code: response.exit_code,
            stdout: response.stdout,
        })
    }
}

fn describe(key: &ActionExecutionKey) -> String {
    if !key.description.is_empty() {
        key.description.clone()
    } else if !key.mnemonic.is_empty() {
        key.mnemonic.clone()
    } else {
        key.arguments.join(" ")
    }
}
