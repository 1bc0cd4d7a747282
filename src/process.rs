use std::process::Command;

/// Boolean oracle for "is the source process running", polled on demand.
///
/// Injected into the service so tests can substitute a fixed answer.
pub trait ProcessProbe: Send + Sync {
    fn is_running(&self, name: &str) -> bool;
}

/// Probe backed by the host process table via `pgrep`.
pub struct PgrepProbe;

impl ProcessProbe for PgrepProbe {
    fn is_running(&self, name: &str) -> bool {
        match Command::new("pgrep").arg(name).output() {
            Ok(output) => output.status.success(),
            Err(e) => {
                log::error!("Failed to run pgrep for '{}': {}", name, e);
                false
            }
        }
    }
}

/// Probe with a fixed answer, for tests and for wiring the decoder up on
/// hosts without pgrep.
pub struct FixedProbe(pub bool);

impl ProcessProbe for FixedProbe {
    fn is_running(&self, _name: &str) -> bool {
        self.0
    }
}
