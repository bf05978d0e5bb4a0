use serde_json::{Map, Value};

/// Entry type tag that marks a mapping-form value as carrying the
/// payload's device identity.
pub const SYSTEM_MONITOR_TYPE: &str = "SystemMonitor";

/// Key on mapping-form payloads holding a command acknowledgement
/// token. Never treated as a telemetry entry.
pub const ACK_KEY: &str = "_ack";

/// One wire entry reduced to a shape-independent candidate, ready for
/// config-key resolution. Both wire forms funnel through this so the
/// resolver only ever sees one shape.
#[derive(Debug, Clone)]
pub(crate) struct CandidateEntry {
    /// Config keys to try against the device's field-spec table, in
    /// order. First hit wins.
    pub candidates: Vec<String>,
    /// The entry's own type tag, used as the storage type when present.
    pub type_tag: Option<String>,
    pub subtype: Option<String>,
    pub name: String,
    pub fields: Map<String, Value>,
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Device identity, resolved by wire shape:
///
/// - sequence form: first entry carrying a non-empty `deviceId`;
/// - mapping form: first `SystemMonitor`-typed value with a
///   `deviceId`, falling back to the top-level `deviceId`.
///
/// Anything else has no identity and the payload is rejected upstream.
pub fn extract_device_id(payload: &Value) -> Option<String> {
    match payload {
        Value::Array(entries) => entries
            .iter()
            .find_map(|entry| non_empty_str(entry.get("deviceId")))
            .map(str::to_owned),
        Value::Object(map) => map
            .values()
            .find_map(|value| {
                let tagged = non_empty_str(value.get("type"))? == SYSTEM_MONITOR_TYPE;
                tagged.then(|| non_empty_str(value.get("deviceId"))).flatten()
            })
            .or_else(|| non_empty_str(map.get("deviceId")))
            .map(str::to_owned),
        _ => None,
    }
}

/// Acknowledgement token riding on a mapping-form payload, stringified
/// the way it arrived (a JSON string is taken verbatim, anything else
/// is rendered).
pub fn ack_token(payload: &Value) -> Option<String> {
    let ack = payload.as_object()?.get(ACK_KEY)?;
    Some(match ack.as_str() {
        Some(s) => s.to_owned(),
        None => ack.to_string(),
    })
}

/// Flattens either wire form into candidates. Entries that cannot name
/// themselves are skipped, never an error.
pub(crate) fn candidate_entries(payload: &Value) -> Vec<CandidateEntry> {
    match payload {
        Value::Array(entries) => entries.iter().filter_map(sequence_candidate).collect(),
        Value::Object(map) => map
            .iter()
            .filter(|(key, _)| key.as_str() != ACK_KEY)
            .filter_map(|(key, value)| mapping_candidate(key, value))
            .collect(),
        _ => Vec::new(),
    }
}

/// Sequence form: the entry tags itself with `type`, `subtype` and
/// `name`, and its config key is exactly `"{type}.{subtype}"`.
fn sequence_candidate(entry: &Value) -> Option<CandidateEntry> {
    let fields = entry.as_object()?;
    let type_tag = non_empty_str(fields.get("type"))?;
    let subtype = non_empty_str(fields.get("subtype"))?;
    let name = non_empty_str(fields.get("name"))?;
    Some(CandidateEntry {
        candidates: vec![format!("{type_tag}.{subtype}")],
        type_tag: Some(type_tag.to_owned()),
        subtype: Some(subtype.to_owned()),
        name: name.to_owned(),
        fields: fields.clone(),
    })
}

/// Mapping form: the key doubles as the entry name, and the config key
/// is resolved by trying the key itself, then the value's `subType`,
/// then its `type`.
fn mapping_candidate(key: &str, value: &Value) -> Option<CandidateEntry> {
    let fields = value.as_object()?;
    let mut candidates = vec![key.to_owned()];
    candidates.extend(non_empty_str(fields.get("subType")).map(str::to_owned));
    candidates.extend(non_empty_str(fields.get("type")).map(str::to_owned));
    Some(CandidateEntry {
        candidates,
        type_tag: non_empty_str(fields.get("type")).map(str::to_owned),
        subtype: None,
        name: key.to_owned(),
        fields: fields.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequence_device_id_comes_from_first_nonempty_entry() {
        let payload = json!([
            {"type": "EnergyMeter", "deviceId": ""},
            {"type": "EnergyMeter", "deviceId": "camper"},
            {"type": "EnergyMeter", "deviceId": "other"}
        ]);
        assert_eq!(extract_device_id(&payload), Some("camper".into()));
    }

    #[test]
    fn mapping_device_id_prefers_system_monitor_entry() {
        let payload = json!({
            "deviceId": "top-level",
            "system": {"type": "SystemMonitor", "deviceId": "greenhouse-7", "uptime": 12}
        });
        assert_eq!(extract_device_id(&payload), Some("greenhouse-7".into()));
    }

    #[test]
    fn mapping_device_id_falls_back_to_top_level() {
        let payload = json!({"deviceId": "camper", "meter": {"voltage": 12.6}});
        assert_eq!(extract_device_id(&payload), Some("camper".into()));
    }

    #[test]
    fn identity_is_absent_for_scalars_and_empty_ids() {
        assert_eq!(extract_device_id(&json!("just a string")), None);
        assert_eq!(extract_device_id(&json!({"deviceId": ""})), None);
        assert_eq!(extract_device_id(&json!([{"value": 1}])), None);
    }

    #[test]
    fn ack_token_is_stringified_as_it_arrived() {
        assert_eq!(
            ack_token(&json!({"_ack": "a,b", "deviceId": "d"})),
            Some("a,b".into())
        );
        assert_eq!(ack_token(&json!({"_ack": 42})), Some("42".into()));
        assert_eq!(ack_token(&json!({"deviceId": "d"})), None);
        assert_eq!(ack_token(&json!([1, 2])), None);
    }

    #[test]
    fn sequence_entries_missing_tags_are_skipped() {
        let payload = json!([
            {"type": "EnergyMeter", "subtype": "main", "name": "shore", "voltage": 230},
            {"type": "EnergyMeter", "name": "untyped", "voltage": 12},
            {"subtype": "main", "name": "untyped2"},
            "not an object"
        ]);
        let entries = candidate_entries(&payload);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].candidates, vec!["EnergyMeter.main"]);
        assert_eq!(entries[0].subtype.as_deref(), Some("main"));
        assert_eq!(entries[0].name, "shore");
    }

    #[test]
    fn mapping_entries_try_key_then_subtype_then_type() {
        let payload = json!({
            "living": {"type": "Stove", "subType": "wood", "tempC": 180},
            "deviceId": "d"
        });
        let entries = candidate_entries(&payload);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].candidates, vec!["living", "wood", "Stove"]);
        assert_eq!(entries[0].name, "living");
        assert!(entries[0].subtype.is_none());
    }
}
