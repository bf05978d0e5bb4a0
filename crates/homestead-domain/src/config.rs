use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{DomainError, DomainResult};
use crate::protocol::Protocol;

/// Per-field persistence rule inside a map-form field spec.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SaveRule {
    /// Shorthand: `"temp": true`.
    Flag(bool),
    /// Long form: `"state": {"save": true, "type": "stove_state"}`.
    Rule {
        #[serde(default)]
        save: bool,
        #[serde(rename = "type")]
        plugin: Option<String>,
    },
}

impl SaveRule {
    pub fn is_savable(&self) -> bool {
        match self {
            SaveRule::Flag(save) => *save,
            SaveRule::Rule { save, .. } => *save,
        }
    }

    pub fn plugin(&self) -> Option<&str> {
        match self {
            SaveRule::Flag(_) => None,
            SaveRule::Rule { plugin, .. } => plugin.as_deref(),
        }
    }
}

/// A device's field spec for one config key.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FieldSpec {
    /// Every listed field is savable: `["voltage", "current"]`.
    List(Vec<String>),
    /// Per-field rules; only entries marked savable are kept.
    Map(BTreeMap<String, SaveRule>),
}

/// Plugin attachment for an entry, keyed in config by
/// `"type.subtype"` or `"type.subtype.name"`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginBinding {
    #[serde(rename = "type")]
    pub plugin_type: String,
    #[serde(default)]
    pub options: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NetworkSection {
    protocol: Option<OneOrMany>,
}

/// Raw on-disk shape of one device, before normalization.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawDeviceConfig {
    #[serde(default)]
    data: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    network: Option<NetworkSection>,
    #[serde(default)]
    plugins: BTreeMap<String, PluginBinding>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    devices: BTreeMap<String, RawDeviceConfig>,
}

/// Normalized configuration for a single device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    field_specs: BTreeMap<String, FieldSpec>,
    /// `None` means the device never declared a protocol list and
    /// accepts ingestion over anything.
    allowed_protocols: Option<Vec<String>>,
    plugins: BTreeMap<String, PluginBinding>,
}

impl DeviceConfig {
    pub fn field_spec(&self, config_key: &str) -> Option<&FieldSpec> {
        self.field_specs.get(config_key)
    }

    /// Protocol gate. An absent allow-list admits everything, and an
    /// unidentified transport is never rejected.
    pub fn allows(&self, protocol: Protocol) -> bool {
        if protocol == Protocol::Unknown {
            return true;
        }
        match &self.allowed_protocols {
            None => true,
            Some(list) => list.iter().any(|p| p == protocol.as_str()),
        }
    }

    /// Whether the device explicitly lists MQTT, which drives broker
    /// subscriptions and immediate command push.
    pub fn accepts_mqtt_explicitly(&self) -> bool {
        self.allowed_protocols
            .as_ref()
            .is_some_and(|list| list.iter().any(|p| p == Protocol::Mqtt.as_str()))
    }

    /// Plugin binding for an entry: the fully qualified
    /// `"{config_key}.{name}"` wins over the generic `"{config_key}"`.
    pub fn plugin_binding(&self, config_key: &str, name: &str) -> Option<&PluginBinding> {
        self.plugins
            .get(&format!("{config_key}.{name}"))
            .or_else(|| self.plugins.get(config_key))
    }

    /// Field names under `config_key` whose rule delegates to the given
    /// plugin type. List-form specs never delegate.
    pub fn claimed_fields(&self, config_key: &str, plugin_type: &str) -> Vec<String> {
        match self.field_specs.get(config_key) {
            Some(FieldSpec::Map(rules)) => rules
                .iter()
                .filter(|(_, rule)| rule.plugin() == Some(plugin_type))
                .map(|(name, _)| name.clone())
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl From<RawDeviceConfig> for DeviceConfig {
    fn from(raw: RawDeviceConfig) -> Self {
        let allowed_protocols = raw.network.and_then(|n| n.protocol).map(|p| {
            let list = match p {
                OneOrMany::One(tag) => vec![tag],
                OneOrMany::Many(tags) => tags,
            };
            list.into_iter().map(|tag| tag.to_ascii_lowercase()).collect()
        });
        DeviceConfig {
            field_specs: raw.data,
            allowed_protocols,
            plugins: raw.plugins,
        }
    }
}

/// All known devices, loaded once at startup from a JSON file.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, DeviceConfig>,
}

impl DeviceRegistry {
    pub fn from_file(path: impl AsRef<Path>) -> DomainResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DomainError::Config(format!("cannot read device registry {}: {e}", path.display()))
        })?;
        Self::from_json(&raw).map_err(|e| {
            DomainError::Config(format!("invalid device registry {}: {e}", path.display()))
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let file: RegistryFile = serde_json::from_str(raw)?;
        Ok(Self {
            devices: file
                .devices
                .into_iter()
                .map(|(id, cfg)| (id, cfg.into()))
                .collect(),
        })
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.devices.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices whose allow-list names MQTT; these get broker data
    /// subscriptions and immediate command push.
    pub fn mqtt_device_ids(&self) -> Vec<&str> {
        self.devices
            .iter()
            .filter(|(_, cfg)| cfg.accepts_mqtt_explicitly())
            .map(|(id, _)| id.as_str())
            .collect()
    }
}
