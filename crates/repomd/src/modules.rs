//! Parser for `modules.yaml`, a multi-document modulemd stream.

use std::collections::HashMap;

use serde::Deserialize;

use crate::DecodeError;

/// ModuleBuild identifies the modulemd build that produced an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleBuild {
    pub name: String,
    pub stream: String,
    pub version: String,
    pub context: String,
}

#[derive(Debug, Deserialize)]
struct Document {
    #[serde(default)]
    document: Option<String>,
    #[serde(default)]
    data: Option<Data>,
}

#[derive(Debug, Deserialize)]
struct Data {
    #[serde(default)]
    name: Option<String>,
    /// Streams like `1.4` parse as YAML numbers, so scalars are kept
    /// loose and stringified below.
    #[serde(default)]
    stream: Option<serde_yaml::Value>,
    #[serde(default)]
    version: Option<serde_yaml::Value>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    artifacts: Option<Artifacts>,
}

#[derive(Debug, Deserialize)]
struct Artifacts {
    #[serde(default)]
    rpms: Vec<String>,
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Map every artifact NEVRA of every `modulemd` document to its module
/// build. Non-modulemd documents (defaults, obsoletes) are skipped, as
/// are modulemd documents without artifacts.
pub(crate) fn parse_modules(yaml: &str) -> Result<HashMap<String, ModuleBuild>, DecodeError> {
    let mut artifacts = HashMap::new();

    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document)?;
        if !value.is_mapping() {
            continue;
        }
        let document: Document = serde_yaml::from_value(value)?;
        if document.document.as_deref() != Some("modulemd") {
            continue;
        }
        let Some(data) = document.data else {
            continue;
        };
        let (Some(name), Some(stream), Some(version), Some(context)) = (
            data.name,
            data.stream.as_ref().and_then(scalar_to_string),
            data.version.as_ref().and_then(scalar_to_string),
            data.context,
        ) else {
            continue;
        };
        let Some(rpms) = data.artifacts.map(|a| a.rpms) else {
            continue;
        };

        for nevra in rpms {
            artifacts.insert(
                nevra,
                ModuleBuild {
                    name: name.clone(),
                    stream: stream.clone(),
                    version: version.clone(),
                    context: context.clone(),
                },
            );
        }
    }

    Ok(artifacts)
}
