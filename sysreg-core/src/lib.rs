pub mod config;
pub mod error;
pub mod machine;
pub mod processor;
pub mod types;

// Test helpers are exposed for integration tests
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::{ConsoleConfig, EsxCredentials, RunConfiguration, StageConfig};
pub use error::{SysregError, SysregResult};
pub use machine::{Machine, MachineFactory, MachineRegistry};
pub use processor::{DebugDataProcessor, HookRunner, ObservationRequest};
pub use types::{BackendKind, ConsoleHandle, Verdict};
