use serde_json::{Map, Value};

use crate::config::{DeviceConfig, FieldSpec};
use crate::payload::candidate_entries;

/// One wire entry after config-key resolution and field extraction.
/// Carries enough addressing for plugin dispatch and tree placement.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInstance {
    /// The field-spec key that matched, e.g. `"EnergyMeter.main"`.
    pub config_key: String,
    /// First tree level. The entry's own type tag when it has one,
    /// otherwise the config key itself.
    pub storage_type: String,
    /// Second tree level; only sequence-form entries carry one.
    pub subtype: Option<String>,
    /// Leaf level: the instance name.
    pub name: String,
    pub fields: Map<String, Value>,
}

impl ResolvedInstance {
    /// Placement address inside a record's `data` tree.
    pub fn tree_path(&self) -> Vec<&str> {
        match &self.subtype {
            Some(subtype) => vec![&self.storage_type, subtype, &self.name],
            None => vec![&self.storage_type, &self.name],
        }
    }
}

/// Pure normalization step: matches every candidate entry against the
/// device's field specs and extracts its savable fields. Entries with
/// no matching spec, or whose extraction comes up empty, are dropped.
pub fn resolve_entries(config: &DeviceConfig, payload: &Value) -> Vec<ResolvedInstance> {
    let mut instances = Vec::new();
    for entry in candidate_entries(payload) {
        let Some(config_key) = entry
            .candidates
            .iter()
            .find(|key| config.field_spec(key).is_some())
        else {
            continue;
        };
        let Some(spec) = config.field_spec(config_key) else {
            continue;
        };
        let fields = extract_fields(spec, &entry.fields);
        if fields.is_empty() {
            continue;
        }
        instances.push(ResolvedInstance {
            config_key: config_key.clone(),
            storage_type: entry.type_tag.clone().unwrap_or_else(|| config_key.clone()),
            subtype: entry.subtype,
            name: entry.name,
            fields,
        });
    }
    instances
}

/// Copies the savable subset of `fields`. The `FieldSpec` drives the
/// iteration, so unlisted wire fields never leak through.
fn extract_fields(spec: &FieldSpec, fields: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    match spec {
        FieldSpec::List(names) => {
            for name in names {
                if let Some(value) = fields.get(name) {
                    out.insert(name.clone(), value.clone());
                }
            }
        }
        FieldSpec::Map(rules) => {
            for (name, rule) in rules {
                if !rule.is_savable() {
                    continue;
                }
                if let Some(value) = fields.get(name) {
                    out.insert(name.clone(), value.clone());
                }
            }
        }
    }
    out
}

/// Assembles the nested `data` tree, instances placed at
/// `data[type][subtype][name]` (sequence form) or `data[type][name]`
/// (mapping form).
pub fn build_tree(instances: &[ResolvedInstance]) -> Map<String, Value> {
    let mut data = Map::new();
    for instance in instances {
        place(
            &mut data,
            &instance.tree_path(),
            Value::Object(instance.fields.clone()),
        );
    }
    data
}

fn place(map: &mut Map<String, Value>, path: &[&str], leaf: Value) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        map.insert((*head).to_owned(), leaf);
        return;
    }
    let slot = map
        .entry((*head).to_owned())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    if let Value::Object(child) = slot {
        place(child, rest, leaf);
    }
}
