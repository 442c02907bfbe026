//! Encoding of structured node settings into single kubemark flags.
//!
//! Mappings render as `<flag>=k1=v1,k2=v2` in key order; taints render as
//! `<flag>=key=value:Effect,key:Effect` in list order. Empty collections
//! render as the empty string, meaning "omit the flag".

use crate::error::ControllerError;
use crds::{KubemarkExtendedResourceList, KubemarkTaint, TaintEffect};
use std::collections::BTreeMap;

/// Flag carrying the node's extended resources
pub const EXTENDED_RESOURCES_FLAG: &str = "--extended-resources";
/// Flag carrying the node's labels
pub const NODE_LABELS_FLAG: &str = "--node-labels";
/// Flag carrying the node's taints
pub const REGISTER_WITH_TAINTS_FLAG: &str = "--register-with-taints";

const PAIR_SEPARATOR: char = ',';
const KEY_VALUE_SEPARATOR: char = '=';
const EFFECT_SEPARATOR: char = ':';

/// Encode extended resources; quantities keep their canonical textual form
pub fn encode_resources(resources: &KubemarkExtendedResourceList) -> String {
    encode_pairs(
        EXTENDED_RESOURCES_FLAG,
        resources.iter().map(|(name, quantity)| (name.as_str(), quantity.0.as_str())),
    )
}

/// Encode node labels
pub fn encode_labels(labels: &BTreeMap<String, String>) -> String {
    encode_pairs(
        NODE_LABELS_FLAG,
        labels.iter().map(|(key, value)| (key.as_str(), value.as_str())),
    )
}

/// Encode taints, preserving their order
pub fn encode_taints(taints: &[KubemarkTaint]) -> String {
    if taints.is_empty() {
        return String::new();
    }
    let segments: Vec<String> = taints
        .iter()
        .map(|taint| match &taint.value {
            Some(value) => format!("{}={}:{}", taint.key, value, taint.effect),
            None => format!("{}:{}", taint.key, taint.effect),
        })
        .collect();
    format!("{}={}", REGISTER_WITH_TAINTS_FLAG, segments.join(","))
}

fn encode_pairs<'a>(flag: &str, pairs: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    let segments: Vec<String> = pairs.map(|(key, value)| format!("{}={}", key, value)).collect();
    if segments.is_empty() {
        return String::new();
    }
    format!("{}={}", flag, segments.join(","))
}

/// Strip `<flag>=` from `encoded`, returning `None` for the empty string
fn flag_body<'a>(flag: &str, encoded: &'a str) -> Result<Option<&'a str>, ControllerError> {
    if encoded.is_empty() {
        return Ok(None);
    }
    encoded
        .strip_prefix(flag)
        .and_then(|rest| rest.strip_prefix(KEY_VALUE_SEPARATOR))
        .map(Some)
        .ok_or_else(|| {
            ControllerError::MalformedFlag(format!("`{}` does not start with `{}=`", encoded, flag))
        })
}

/// Decode a `<flag>=k1=v1,k2=v2` string back into its key/value pairs
///
/// The empty string decodes to an empty map. Every segment must split into
/// exactly two `=`-delimited parts.
pub fn decode(flag: &str, encoded: &str) -> Result<BTreeMap<String, String>, ControllerError> {
    let Some(body) = flag_body(flag, encoded)? else {
        return Ok(BTreeMap::new());
    };

    let mut pairs = BTreeMap::new();
    for segment in body.split(PAIR_SEPARATOR) {
        let parts: Vec<&str> = segment.split(KEY_VALUE_SEPARATOR).collect();
        let [key, value] = parts.as_slice() else {
            return Err(ControllerError::MalformedFlag(format!(
                "segment `{}` of {} is not a key=value pair",
                segment, flag
            )));
        };
        pairs.insert(key.to_string(), value.to_string());
    }
    Ok(pairs)
}

/// Decode a `--register-with-taints` string back into taints, in order
pub fn decode_taints(encoded: &str) -> Result<Vec<KubemarkTaint>, ControllerError> {
    let Some(body) = flag_body(REGISTER_WITH_TAINTS_FLAG, encoded)? else {
        return Ok(Vec::new());
    };

    body.split(PAIR_SEPARATOR).map(decode_taint).collect()
}

fn decode_taint(segment: &str) -> Result<KubemarkTaint, ControllerError> {
    let malformed = |reason: &str| {
        ControllerError::MalformedFlag(format!("taint `{}` {}", segment, reason))
    };

    let (key_value, effect) = segment
        .rsplit_once(EFFECT_SEPARATOR)
        .ok_or_else(|| malformed("has no effect"))?;
    let effect: TaintEffect = effect.parse().map_err(|e: String| malformed(&e))?;

    let (key, value) = match key_value.split_once(KEY_VALUE_SEPARATOR) {
        Some((key, value)) if value.contains(KEY_VALUE_SEPARATOR) => {
            return Err(malformed(&format!("has more than one `=` after key `{}`", key)));
        }
        Some((key, value)) => (key, Some(value.to_string())),
        None => (key_value, None),
    };
    if key.is_empty() {
        return Err(malformed("has an empty key"));
    }

    Ok(KubemarkTaint {
        key: key.to_string(),
        value,
        effect,
    })
}
