pub mod broadcast;
pub mod command;
pub mod compactor;
pub mod config;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod payload;
pub mod plugin;
pub mod protocol;
pub mod record;
pub mod resolver;
pub mod snapshot;
pub mod store;
pub mod value;

pub use broadcast::{BroadcastEvent, EVENT_LATEST, EVENT_RAW, EVENT_STATS};
pub use command::{
    merge_command_trees, parse_ack_token, CommandEntry, CommandQueue, CommandStatus,
};
pub use compactor::{CompactionReport, Compactor};
pub use config::{DeviceConfig, DeviceRegistry, FieldSpec, PluginBinding, SaveRule};
pub use error::{DomainError, DomainResult};
pub use gateway::{IngestOutcome, IngestService};
pub use memory::{InMemoryCommandStore, InMemoryRecordStore};
pub use payload::{ack_token, extract_device_id, ACK_KEY, SYSTEM_MONITOR_TYPE};
pub use plugin::{PluginContext, PluginRegistry, StoveStatePlugin, TelemetryPlugin};
pub use protocol::Protocol;
pub use record::{
    collection_name, DeviceStats, RecordId, StoredRecord, TelemetryRecord, UnsetOp,
};
pub use resolver::{build_tree, resolve_entries, ResolvedInstance};
pub use snapshot::{RawSnapshot, SnapshotCache};
pub use store::{BroadcastSink, CommandPusher, CommandStore, RecordStore};
pub use value::{is_redundant, leaf_paths, remove_at, value_at};
