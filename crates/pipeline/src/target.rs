use std::collections::BTreeMap;

use async_trait::async_trait;
use cas::DataId;
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
    config::ConfigurationKey,
    join_subrequests,
    label::Label,
    provider::ProviderMap,
    rule::EvaluatedTargetKey,
    system::PipelineDelegates,
};

/// Identifies a target in a workspace under a configuration. `root_id` is
/// the CAS id of the workspace the delegate reads target definitions from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfiguredTargetKey {
    pub root_id: DataId,
    pub label: Label,
    pub configuration: ConfigurationKey,
}

impl Payload for ConfiguredTargetKey {
    const IDENTIFIER: &'static str = "configured-target";
}

impl EngineKey for ConfiguredTargetKey {
    type Value = ConfiguredTargetValue;
}

/// A named dependency group: a single label or a list of labels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetDependency {
    Single(Label),
    List(Vec<Label>),
}

/// What the configured-target delegate returns: the rule's polymorphic
/// input plus the dependency labels, grouped under string names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredTarget {
    pub target: AnyValue,
    pub dependencies: BTreeMap<String, TargetDependency>,
}

impl ConfiguredTarget {
    pub fn new(target: AnyValue) -> Self {
        Self {
            target,
            dependencies: BTreeMap::new(),
        }
    }

    pub fn with_dependency(mut self, name: &str, dependency: TargetDependency) -> Self {
        self.dependencies.insert(name.to_string(), dependency);
        self
    }
}

/// Applies a configuration to a label. Supplied by the build system user;
/// typically reads the target definition out of the workspace tree at
/// `root_id`.
#[async_trait]
pub trait ConfiguredTargetDelegate: Send + Sync {
    async fn configured_target(
        &self,
        key: &ConfiguredTargetKey,
        ctx: &Context,
    ) -> anyhow::Result<ConfiguredTarget>;
}

/// The provider maps of one dependency group, mirroring the group's shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DependencyProviders {
    Single(ProviderMap),
    List(Vec<ProviderMap>),
}

impl DependencyProviders {
    pub fn single(&self) -> anyhow::Result<&ProviderMap> {
        match self {
            Self::Single(map) => Ok(map),
            Self::List(_) => Err(anyhow::anyhow!("dependency group is a list, not a single")),
        }
    }

    pub fn list(&self) -> anyhow::Result<&[ProviderMap]> {
        match self {
            Self::List(maps) => Ok(maps),
            Self::Single(_) => Err(anyhow::anyhow!("dependency group is a single, not a list")),
        }
    }
}

/// A target after configuration: the polymorphic configured target next to
/// the evaluated provider maps of every declared dependency.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredTargetValue {
    pub target: AnyValue,
    pub dependencies: BTreeMap<String, DependencyProviders>,
}

impl Payload for ConfiguredTargetValue {
    const IDENTIFIER: &'static str = "configured-target.value";
}

pub(crate) struct ConfiguredTargetFunction;

#[async_trait]
impl Function for ConfiguredTargetFunction {
    async fn compute(
        &self,
        key: AnyValue,
        fi: &FunctionInterface,
        ctx: &Context,
    ) -> anyhow::Result<AnyValue> {
        let key = key.unpack::<ConfiguredTargetKey>()?;
        let delegates = ctx.require::<PipelineDelegates>()?;
        let configured = delegates
            .configured_target
            .configured_target(&key, ctx)
            .await?;

        // Dependencies evaluate under the same root and configuration, all
        // in parallel.
        let evaluate = |label: &Label| {
            let dep_key = EvaluatedTargetKey::new(ConfiguredTargetKey {
                root_id: key.root_id.clone(),
                label: label.clone(),
                configuration: key.configuration.clone(),
            });
            async move { fi.request_typed(&dep_key, ctx).await }
        };

        let mut dependencies = BTreeMap::new();
        for (name, group) in &configured.dependencies {
            let providers = match group {
                TargetDependency::Single(label) => {
                    DependencyProviders::Single(evaluate(label).await?.providers)
                },
                TargetDependency::List(labels) => {
                    let evaluated =
                        join_subrequests(ctx, labels.iter().map(evaluate)).await?;
                    DependencyProviders::List(
                        evaluated.into_iter().map(|value| value.providers).collect(),
                    )
                },
            };
            dependencies.insert(name.clone(), providers);
        }

        AnyValue::wrap(&ConfiguredTargetValue {
            target: configured.target,
            dependencies,
        })
    }
}
