use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{DomainError, DomainResult};
use crate::store::RecordStore;

/// Everything a plugin may see besides the extracted fields: the
/// entry's address, its configured options, which fields delegated to
/// it, and a handle to the device's history.
pub struct PluginContext<'a> {
    pub device_id: &'a str,
    pub config_key: &'a str,
    pub entry_name: &'a str,
    pub options: &'a Value,
    /// Field names whose save rule names this plugin's type.
    pub claimed_fields: &'a [String],
    pub records: &'a Arc<dyn RecordStore>,
}

/// Derives or rewrites fields for one resolved entry before
/// persistence. Returned fields are merged over the extracted ones; a
/// failure is logged and the entry keeps its pre-plugin fields.
#[async_trait]
pub trait TelemetryPlugin: Send + Sync {
    /// Tag that config save rules and bindings refer to.
    fn type_tag(&self) -> &'static str;

    async fn run(
        &self,
        fields: Map<String, Value>,
        ctx: PluginContext<'_>,
    ) -> DomainResult<Map<String, Value>>;
}

/// Immutable tag-to-plugin table, assembled once at startup.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<&'static str, Arc<dyn TelemetryPlugin>>,
}

impl PluginRegistry {
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder::default()
    }

    pub fn get(&self, type_tag: &str) -> Option<&Arc<dyn TelemetryPlugin>> {
        self.plugins.get(type_tag)
    }
}

#[derive(Default)]
pub struct PluginRegistryBuilder {
    plugins: HashMap<&'static str, Arc<dyn TelemetryPlugin>>,
}

impl PluginRegistryBuilder {
    pub fn register(mut self, plugin: Arc<dyn TelemetryPlugin>) -> Self {
        self.plugins.insert(plugin.type_tag(), plugin);
        self
    }

    pub fn build(self) -> PluginRegistry {
        PluginRegistry {
            plugins: self.plugins,
        }
    }
}

/// Classifies a stove's operating state from its temperature reading.
///
/// Thresholds come from the binding options (`idle_c`, `operating_c`),
/// in degrees of the same unit the device reports.
#[derive(Debug, Clone)]
pub struct StoveStatePlugin {
    idle_c: f64,
    operating_c: f64,
}

impl Default for StoveStatePlugin {
    fn default() -> Self {
        Self {
            idle_c: 50.0,
            operating_c: 150.0,
        }
    }
}

impl StoveStatePlugin {
    const TEMP_FIELD: &'static str = "tempC";

    fn classify(&self, temp: f64, options: &Value) -> &'static str {
        let idle = options
            .get("idle_c")
            .and_then(Value::as_f64)
            .unwrap_or(self.idle_c);
        let operating = options
            .get("operating_c")
            .and_then(Value::as_f64)
            .unwrap_or(self.operating_c);
        if temp < idle {
            "off"
        } else if temp < operating {
            "warming"
        } else {
            "operating"
        }
    }
}

#[async_trait]
impl TelemetryPlugin for StoveStatePlugin {
    fn type_tag(&self) -> &'static str {
        "stove_state"
    }

    async fn run(
        &self,
        mut fields: Map<String, Value>,
        ctx: PluginContext<'_>,
    ) -> DomainResult<Map<String, Value>> {
        let Some(temp) = fields.get(Self::TEMP_FIELD).and_then(Value::as_f64) else {
            // No reading this cycle; nothing to derive.
            return Ok(fields);
        };
        if ctx.claimed_fields.is_empty() {
            return Err(DomainError::Plugin {
                plugin: self.type_tag().to_owned(),
                message: format!("no field delegates to this plugin for {}", ctx.config_key),
            });
        }
        let state = self.classify(temp, ctx.options);
        for field in ctx.claimed_fields {
            fields.insert(field.clone(), Value::String(state.to_owned()));
        }
        Ok(fields)
    }
}
