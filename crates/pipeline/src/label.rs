use std::{
    fmt,
    str::FromStr,
};

use serde::{
    de::Error as _,
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LabelError {
    #[error("label {0:?} contains invalid characters")]
    InvalidCharacters(String),

    #[error("label {0:?} must start with //")]
    UnexpectedPrefix(String),

    #[error("label {0:?} has a colon before the last path component")]
    UnexpectedCharacter(String),

    #[error("label {0:?} has more than one target name")]
    UnexpectedSuffix(String),

    #[error("invalid label {0:?}")]
    InvalidLabel(String),
}

/// A canonical target reference of the form `//a/b/c:target`. When the
/// target name is omitted, the last path component is reused as the name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    path: Vec<String>,
    name: String,
}

impl Label {
    pub fn parse(s: &str) -> Result<Self, LabelError> {
        let valid = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':');
        if !s.chars().all(valid) {
            return Err(LabelError::InvalidCharacters(s.to_string()));
        }
        let rest = s
            .strip_prefix("//")
            .ok_or_else(|| LabelError::UnexpectedPrefix(s.to_string()))?;
        if rest.is_empty() {
            return Err(LabelError::InvalidLabel(s.to_string()));
        }

        let mut components: Vec<&str> = rest.split('/').collect();
        let last = components.pop().expect("split yields at least one part");
        if components.iter().any(|c| c.contains(':')) {
            return Err(LabelError::UnexpectedCharacter(s.to_string()));
        }

        let mut last_parts = last.split(':');
        let last_component = last_parts.next().expect("split yields at least one part");
        let name = match (last_parts.next(), last_parts.next()) {
            (_, Some(_)) => return Err(LabelError::UnexpectedSuffix(s.to_string())),
            (Some(name), None) => name.to_string(),
            // Shorthand: the last path component doubles as the name.
            (None, None) => last_component.to_string(),
        };
        if name.is_empty() {
            return Err(LabelError::InvalidLabel(s.to_string()));
        }

        let path = components
            .into_iter()
            .chain([last_component])
            .map(str::to_string)
            .collect();
        Ok(Self { path, name })
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The path joined by `/`, used for artifact namespacing.
    pub fn path_string(&self) -> String {
        self.path.join("/")
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "//{}", self.path.join("/"))?;
        if self.path.last().map(String::as_str) != Some(self.name.as_str()) {
            write!(f, ":{}", self.name)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Label({self})")
    }
}

impl FromStr for Label {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        Label,
        LabelError,
    };

    #[test]
    fn test_parse_with_explicit_name() {
        let label = Label::parse("//foo/bar:baz").unwrap();
        assert_eq!(label.path(), ["foo", "bar"]);
        assert_eq!(label.name(), "baz");
        assert_eq!(label.to_string(), "//foo/bar:baz");
    }

    #[test]
    fn test_parse_shorthand_reuses_last_component() {
        let label = Label::parse("//foo/bar").unwrap();
        assert_eq!(label.path(), ["foo", "bar"]);
        assert_eq!(label.name(), "bar");
        assert_eq!(label.to_string(), "//foo/bar");
    }

    #[test]
    fn test_parse_empty_path_component() {
        let label = Label::parse("//foo/:bar").unwrap();
        assert_eq!(label.path(), ["foo", ""]);
        assert_eq!(label.name(), "bar");
        assert_eq!(label.to_string(), "//foo/:bar");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Label::parse("/foo:bar"),
            Err(LabelError::UnexpectedPrefix("/foo:bar".to_string())),
        );
        assert_eq!(
            Label::parse("foo:bar"),
            Err(LabelError::UnexpectedPrefix("foo:bar".to_string())),
        );
        assert_eq!(
            Label::parse("//foo!bar:baz"),
            Err(LabelError::InvalidCharacters("//foo!bar:baz".to_string())),
        );
        assert_eq!(
            Label::parse("//foo bar"),
            Err(LabelError::InvalidCharacters("//foo bar".to_string())),
        );
        assert_eq!(
            Label::parse("//foo:bar/baz"),
            Err(LabelError::UnexpectedCharacter("//foo:bar/baz".to_string())),
        );
        assert_eq!(
            Label::parse("//foo:bar:baz"),
            Err(LabelError::UnexpectedSuffix("//foo:bar:baz".to_string())),
        );
        assert_eq!(
            Label::parse("//foo:"),
            Err(LabelError::InvalidLabel("//foo:".to_string())),
        );
        assert_eq!(
            Label::parse("//"),
            Err(LabelError::InvalidLabel("//".to_string())),
        );
    }

    #[test]
    fn test_single_component() {
        let label = Label::parse("//app").unwrap();
        assert_eq!(label.path(), ["app"]);
        assert_eq!(label.name(), "app");
    }

    #[test]
    fn test_json_round_trip() -> anyhow::Result<()> {
        let label = Label::parse("//foo/bar:baz").unwrap();
        let encoded = serde_json::to_string(&label)?;
        assert_eq!(encoded, "\"//foo/bar:baz\"");
        let decoded: Label = serde_json::from_str(&encoded)?;
        assert_eq!(decoded, label);
        Ok(())
    }

    fn component() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_.-]{1,8}"
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn proptest_canonical_form_round_trips(
            path in prop::collection::vec(component(), 1..4),
            name in component(),
        ) {
            let label = Label::parse(&format!("//{}:{}", path.join("/"), name)).unwrap();
            let reparsed = Label::parse(&label.to_string()).unwrap();
            prop_assert_eq!(reparsed, label);
        }
    }
}
