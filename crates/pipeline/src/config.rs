use async_trait::async_trait;
use engine::{
    AnyValue,
    Context,
    EngineKey,
    Fingerprint,
    Function,
    FunctionInterface,
    Payload,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::join_subrequests;

/// Requests the configuration's fragments. The fragment keys are
/// polymorphic: each fragment key type registers its own function, so the
/// set of fragments a build understands is open-ended.
///
/// Fragment keys are kept sorted by type identifier so structurally equal
/// configurations fingerprint identically regardless of declaration order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigurationKey {
    fragment_keys: Vec<AnyValue>,
}

impl ConfigurationKey {
    pub fn new(mut fragment_keys: Vec<AnyValue>) -> anyhow::Result<Self> {
        fragment_keys.sort_by(|a, b| a.type_identifier.cmp(&b.type_identifier));
        for pair in fragment_keys.windows(2) {
            anyhow::ensure!(
                pair[0].type_identifier != pair[1].type_identifier,
                "duplicate configuration fragment of type {}",
                pair[0].type_identifier,
            );
        }
        Ok(Self { fragment_keys })
    }

    pub fn empty() -> Self {
        Self {
            fragment_keys: Vec::new(),
        }
    }

    pub fn fragment_keys(&self) -> &[AnyValue] {
        &self.fragment_keys
    }

    /// Eight hex characters identifying this configuration; artifact roots
    /// are namespaced under it so equal paths in different configurations
    /// never collide.
    pub fn short_hash(&self) -> anyhow::Result<String> {
        let envelope = AnyValue::wrap(self)?;
        Ok(Fingerprint::of(&envelope, Self::VERSION).short())
    }
}

impl Payload for ConfigurationKey {
    const IDENTIFIER: &'static str = "configuration";
}

impl EngineKey for ConfigurationKey {
    type Value = ConfigurationValue;
}

/// The composed fragments, in the key's fragment order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationValue {
    fragments: Vec<AnyValue>,
}

impl ConfigurationValue {
    pub fn fragment<T: Payload>(&self) -> anyhow::Result<T> {
        self.try_fragment::<T>()?
            .ok_or_else(|| anyhow::anyhow!("no configuration fragment of type {}", T::IDENTIFIER))
    }

    pub fn try_fragment<T: Payload>(&self) -> anyhow::Result<Option<T>> {
        self.fragments
            .iter()
            .find(|f| f.type_identifier == T::IDENTIFIER)
            .map(|f| f.unpack::<T>())
            .transpose()
    }
}

impl Payload for ConfigurationValue {
    const IDENTIFIER: &'static str = "configuration.value";
}

pub(crate) struct ConfigurationFunction;

#[async_trait]
impl Function for ConfigurationFunction {
    async fn compute(
        &self,
        key: AnyValue,
        fi: &FunctionInterface,
        ctx: &Context,
    ) -> anyhow::Result<AnyValue> {
        let key = key.unpack::<ConfigurationKey>()?;
        let fragments = join_subrequests(
            ctx,
            key.fragment_keys
                .iter()
                .map(|fragment_key| fi.request(fragment_key.clone(), ctx)),
        )
        .await?
        .into_iter()
        .map(|built| built.value)
        .collect();
        AnyValue::wrap(&ConfigurationValue { fragments })
    }
}
