mod settings;

pub use settings::{
    runtime_dir, BusSettings, CcInfoSettings, CircuitSettings, CleanupSettings, CliOverrides,
    CodeTrackingSettings, DaemonSettings, HeartbeatSettings,
};
