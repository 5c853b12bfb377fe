use std::collections::BTreeMap;

use engine::{
    AnyValue,
    Payload,
};
use serde::{
    Deserialize,
    Serialize,
};

/// The public interface of an evaluated target: an immutable set of typed
/// records, at most one per type. Dependents read their upstreams by
/// provider type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMap {
    providers: BTreeMap<String, AnyValue>,
}

impl ProviderMap {
    pub fn new(providers: Vec<AnyValue>) -> anyhow::Result<Self> {
        let mut map = BTreeMap::new();
        for provider in providers {
            let identifier = provider.type_identifier.clone();
            anyhow::ensure!(
                map.insert(identifier.clone(), provider).is_none(),
                "duplicate provider of type {identifier}",
            );
        }
        Ok(Self { providers: map })
    }

    pub fn get<P: Payload>(&self) -> anyhow::Result<P> {
        self.try_get::<P>()?
            .ok_or_else(|| anyhow::anyhow!("no provider of type {}", P::IDENTIFIER))
    }

    pub fn try_get<P: Payload>(&self) -> anyhow::Result<Option<P>> {
        self.providers
            .get(P::IDENTIFIER)
            .map(|envelope| envelope.unpack::<P>())
            .transpose()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }
}

#[cfg(test)]
mod tests {
    use engine::{
        AnyValue,
        Payload,
    };
    use serde::{
        Deserialize,
        Serialize,
    };

    use super::ProviderMap;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct RunInfo {
        command: String,
    }

    impl Payload for RunInfo {
        const IDENTIFIER: &'static str = "test.provider.run-info";
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct DocsInfo {
        index: String,
    }

    impl Payload for DocsInfo {
        const IDENTIFIER: &'static str = "test.provider.docs-info";
    }

    #[test]
    fn test_lookup_by_type() -> anyhow::Result<()> {
        let map = ProviderMap::new(vec![
            AnyValue::wrap(&RunInfo {
                command: "run".to_string(),
            })?,
            AnyValue::wrap(&DocsInfo {
                index: "index.html".to_string(),
            })?,
        ])?;
        assert_eq!(map.len(), 2);
        assert_eq!(map.get::<RunInfo>()?.command, "run");
        assert_eq!(map.get::<DocsInfo>()?.index, "index.html");
        Ok(())
    }

    #[test]
    fn test_missing_provider() -> anyhow::Result<()> {
        let map = ProviderMap::new(vec![])?;
        assert!(map.is_empty());
        assert_eq!(map.try_get::<RunInfo>()?, None);
        assert!(map.get::<RunInfo>().is_err());
        Ok(())
    }

    #[test]
    fn test_duplicate_provider_types_are_rejected() -> anyhow::Result<()> {
        let a = AnyValue::wrap(&RunInfo {
            command: "a".to_string(),
        })?;
        let b = AnyValue::wrap(&RunInfo {
            command: "b".to_string(),
        })?;
        assert!(ProviderMap::new(vec![a, b]).is_err());
        Ok(())
    }
}
