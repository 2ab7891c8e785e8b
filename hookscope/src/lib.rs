pub mod config;
pub mod detector;
pub mod logging;
pub mod manager;
pub mod registry;
pub mod rescan;
pub mod resolver;
pub mod semver;
pub mod status;
pub mod symaddrs;
pub mod templates;

pub use config::AgentConfig;
pub use detector::{detect, AppKind, AppKinds, Detection, ElfSummary};
pub use manager::UProbeManager;
pub use registry::SourceRegistry;
pub use rescan::{PassOutcome, RescanScheduler};
pub use resolver::{BinaryIdentity, BinaryResolver, HostResolver, PlannedProbe, ResolutionRecord};
pub use semver::SemVer;
pub use status::{StatusCode, StatusReporter, StatusStream};

/// Name under which this subsystem reports in the status streams.
pub const SOURCE_CONNECTOR: &str = "tls_tracer";
