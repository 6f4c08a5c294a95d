//! ---
//! upkeep_section: "07-orchestration"
//! upkeep_subsection: "module"
//! upkeep_type: "source"
//! upkeep_scope: "code"
//! upkeep_description: "Locked, bounded-concurrency instance orchestration."
//! upkeep_version: "v0.0.0-prealpha"
//! upkeep_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use upkeep_common::ActiveProcessorLookup;
use upkeep_host::ProcessTable;

/// Counts live processes whose command line names the instance and one of
/// the orchestration patterns.
pub struct HostProcessorLookup {
    processes: Arc<dyn ProcessTable>,
    patterns: Vec<String>,
}

impl HostProcessorLookup {
    /// Lookup over `processes` restricted to command lines matching `patterns`.
    pub fn new(processes: Arc<dyn ProcessTable>, patterns: Vec<String>) -> Self {
        Self {
            processes,
            patterns,
        }
    }
}

impl ActiveProcessorLookup for HostProcessorLookup {
    fn active_processors(&self, instance: &str) -> Result<usize> {
        let matching = self
            .processes
            .find_matching(&self.patterns)
            .context("unable to list host processes")?;
        Ok(matching
            .iter()
            .filter(|process| {
                process
                    .cmdline
                    .split_whitespace()
                    .any(|word| word == instance)
            })
            .count())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use upkeep_host::InMemoryProcessTable;

    use super::*;

    #[test]
    fn counts_other_processes_naming_the_instance() {
        let table = Arc::new(InMemoryProcessTable::new(1));
        table.spawn(1, "upkeepd run --instance alpha", Duration::ZERO);
        table.spawn(2, "upkeepd run --instance alpha", Duration::ZERO);
        table.spawn(3, "upkeepd run --instance alphabet", Duration::ZERO);
        table.spawn(4, "vim alpha", Duration::ZERO);
        let lookup = HostProcessorLookup::new(table, vec!["upkeepd run".to_owned()]);

        assert_eq!(lookup.active_processors("alpha").unwrap(), 1);
        assert_eq!(lookup.active_processors("beta").unwrap(), 0);
    }
}
