use crate::status::{StatusCode, StatusReporter};
use tracing::{error, info};

type InitFn = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// Registry of subsystems whose initialization outcome must be visible
/// in the source-status stream. One row per subsystem: OK on success,
/// INTERNAL with the error message on failure. A failed subsystem does
/// not stop the others.
#[derive(Default)]
pub struct SourceRegistry {
    sources: Vec<(String, InitFn)>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.sources.len())
            .finish()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, init: F)
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.sources.push((name.to_string(), Box::new(init)));
    }

    /// Initialize every registered subsystem; returns how many came up.
    pub fn init_all(&mut self, reporter: &StatusReporter) -> usize {
        let mut ok = 0;
        for (name, init) in &mut self.sources {
            match init() {
                Ok(()) => {
                    info!("source connector {name} initialized");
                    reporter.source_status(name, StatusCode::Ok, "", "init");
                    ok += 1;
                }
                Err(e) => {
                    error!("source connector {name} failed to initialize: {e}");
                    reporter.source_status(name, StatusCode::Internal, &e.to_string(), "init");
                }
            }
        }
        ok
    }
}
