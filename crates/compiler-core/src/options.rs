//! Driver configuration.

use std::path::PathBuf;

/// Configuration consulted by the global compilation driver.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Options {
    /// Number of worker threads draining the ready queue (minimum 1).
    pub num_threads: usize,
    /// Emit per-function CFG/SSA GraphViz dumps at each pipeline stage.
    pub graphviz: bool,
    /// Directory the GraphViz dumps are written into.
    pub graphs_dir: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_threads: 1,
            graphviz: false,
            graphs_dir: PathBuf::from("graphs"),
        }
    }
}

impl Options {
    /// The worker count, clamped to at least one thread.
    #[must_use]
    pub fn worker_threads(&self) -> usize {
        self.num_threads.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::Options;

    #[test]
    fn defaults_are_single_threaded_without_dumps() {
        let options = Options::default();
        assert_eq!(options.num_threads, 1);
        assert!(!options.graphviz);
        assert_eq!(options.graphs_dir.to_str(), Some("graphs"));
    }

    #[test]
    fn zero_threads_clamps_to_one_worker() {
        let options = Options {
            num_threads: 0,
            ..Options::default()
        };
        assert_eq!(options.worker_threads(), 1);
    }
}
