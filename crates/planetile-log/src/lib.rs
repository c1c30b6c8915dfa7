//! Structured logging for the planetile pipeline.
//!
//! Console output with uptime timestamps and module paths, a JSON debug log in
//! debug builds, and optional per-category JSON file sinks. Categories group
//! crate and module targets, so a sink for `Terrain` receives events from the
//! producers and quad tree but not from the tile cache.

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use planetile_config::{Config, FileSinkConfig};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info,wgpu=warn,naga=warn";

/// Subsystem a log event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Tile storages and caches.
    Core,
    /// GPU dispatch and the graphics stack.
    Graphics,
    /// Configuration and logging setup.
    Data,
    /// Producers and the terrain quad tree.
    Terrain,
    /// The driver binary.
    Other,
}

impl LogCategory {
    pub const ALL: [LogCategory; 5] = [
        LogCategory::Core,
        LogCategory::Graphics,
        LogCategory::Data,
        LogCategory::Terrain,
        LogCategory::Other,
    ];

    /// Target prefixes routed to this category.
    #[must_use]
    pub fn targets(self) -> &'static [&'static str] {
        match self {
            Self::Core => &["planetile_tile"],
            Self::Graphics => &["planetile_elevation::dispatch", "wgpu", "naga"],
            Self::Data => &["planetile_config", "planetile_log"],
            Self::Terrain => &[
                "planetile_elevation::producer",
                "planetile_elevation::residual",
                "planetile_elevation::quadtree",
                "planetile_elevation::terrain",
            ],
            Self::Other => &["planetile_demo"],
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Core => "Core",
            Self::Graphics => "Graphics",
            Self::Data => "Data",
            Self::Terrain => "Terrain",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A category name that matches no [`LogCategory`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log category '{0}'")]
pub struct UnknownCategory(pub String);

impl FromStr for LogCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// A JSON log file receiving the events of some categories.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSink {
    /// The file is `<prefix>.log` inside the log directory.
    pub prefix: String,
    /// Categories written to the file. Empty means all of them.
    pub categories: Vec<LogCategory>,
}

impl FileSink {
    /// Resolve a configured sink. Unknown category names are returned alongside.
    pub fn from_config(config: &FileSinkConfig) -> (Self, Vec<UnknownCategory>) {
        let mut categories = Vec::new();
        let mut unknown = Vec::new();
        for name in &config.categories {
            match name.parse() {
                Ok(category) => categories.push(category),
                Err(err) => unknown.push(err),
            }
        }
        let sink = Self {
            prefix: config.prefix.clone(),
            categories,
        };
        (sink, unknown)
    }

    /// Target filter admitting only this sink's categories.
    #[must_use]
    pub fn targets(&self) -> Targets {
        let categories: &[LogCategory] = if self.categories.is_empty() {
            &LogCategory::ALL
        } else {
            &self.categories
        };
        categories
            .iter()
            .flat_map(|c| c.targets())
            .fold(Targets::new(), |targets, prefix| {
                targets.with_target(*prefix, LevelFilter::TRACE)
            })
    }

    /// JSON layer writing to `<log_dir>/<prefix>.log`.
    pub fn layer(&self, log_dir: &Path) -> std::io::Result<Box<dyn Layer<Registry> + Send + Sync>> {
        std::fs::create_dir_all(log_dir)?;
        let file = File::create(log_dir.join(format!("{}.log", self.prefix)))?;
        Ok(tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_target(true)
            .json()
            .with_filter(self.targets())
            .boxed())
    }
}

/// Initialize the global tracing subscriber.
///
/// - console output with timestamps, module paths, and severity levels
/// - `planetile.log` as JSON in debug builds, when `log_dir` is given
/// - one JSON file per `config.debug.file_sinks` entry, when `log_dir` is given
/// - filtering from `RUST_LOG`, else `config.debug.log_level`
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let filter_str = config
        .map(|c| c.debug.log_level.as_str())
        .filter(|level| !level.is_empty())
        .unwrap_or(DEFAULT_FILTER);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_str));

    let mut file_layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut problems = Vec::new();

    if let Some(log_dir) = log_dir {
        if debug_build {
            let debug_sink = FileSink {
                prefix: "planetile".to_string(),
                categories: Vec::new(),
            };
            match debug_sink.layer(log_dir) {
                Ok(layer) => file_layers.push(layer),
                Err(err) => problems.push(format!("debug log file: {err}")),
            }
        }
        for sink_config in config.map(|c| c.debug.file_sinks.as_slice()).unwrap_or_default() {
            let (sink, unknown) = FileSink::from_config(sink_config);
            problems.extend(unknown.iter().map(|u| format!("sink '{}': {u}", sink.prefix)));
            match sink.layer(log_dir) {
                Ok(layer) => file_layers.push(layer),
                Err(err) => problems.push(format!("sink '{}': {err}", sink.prefix)),
            }
        }
    }

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(tracing_subscriber::fmt::time::uptime());

    tracing_subscriber::registry()
        .with(file_layers)
        .with(env_filter)
        .with(console_layer)
        .init();

    for problem in problems {
        tracing::warn!("log setup: {problem}");
    }
}

/// Create an `EnvFilter` with the default filter string.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn test_default_log_level() {
        let filter_str = default_env_filter().to_string();
        assert!(filter_str.contains("wgpu=warn"));
        assert!(filter_str.contains("naga=warn"));
        assert!(filter_str.contains("info"));
    }

    #[test]
    fn test_category_names_parse() {
        for category in LogCategory::ALL {
            assert_eq!(category.name().parse::<LogCategory>(), Ok(category));
        }
        assert_eq!("terrain".parse::<LogCategory>(), Ok(LogCategory::Terrain));
        assert!("Audio".parse::<LogCategory>().is_err());
    }

    #[test]
    fn test_sink_targets_follow_categories() {
        let sink = FileSink {
            prefix: "terrain".into(),
            categories: vec![LogCategory::Terrain],
        };
        let targets = sink.targets();
        assert!(targets.would_enable("planetile_elevation::producer", &Level::DEBUG));
        assert!(targets.would_enable("planetile_elevation::quadtree", &Level::TRACE));
        assert!(!targets.would_enable("planetile_elevation::dispatch", &Level::INFO));
        assert!(!targets.would_enable("planetile_tile::cache", &Level::INFO));
    }

    #[test]
    fn test_empty_sink_takes_everything() {
        let sink = FileSink {
            prefix: "all".into(),
            categories: Vec::new(),
        };
        let targets = sink.targets();
        assert!(targets.would_enable("planetile_tile::cache", &Level::TRACE));
        assert!(targets.would_enable("wgpu_core::device", &Level::WARN));
        assert!(!targets.would_enable("some_other_crate", &Level::ERROR));
    }

    #[test]
    fn test_sink_from_config_reports_unknown_names() {
        let config = FileSinkConfig {
            prefix: "mixed".into(),
            categories: vec!["Core".into(), "Physics".into(), "graphics".into()],
        };
        let (sink, unknown) = FileSink::from_config(&config);
        assert_eq!(sink.categories, vec![LogCategory::Core, LogCategory::Graphics]);
        assert_eq!(unknown, vec![UnknownCategory("Physics".into())]);
        assert_eq!(unknown[0].to_string(), "unknown log category 'Physics'");
    }

    #[test]
    fn test_sink_writes_only_its_categories() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink {
            prefix: "core".into(),
            categories: vec![LogCategory::Core],
        };
        let layer = sink.layer(dir.path()).unwrap();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "planetile_tile::cache", tile = 3, "cache event");
            tracing::info!(target: "planetile_elevation::dispatch", "graphics event");
        });

        let contents = std::fs::read_to_string(dir.path().join("core.log")).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let event: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(event["target"], "planetile_tile::cache");
        assert_eq!(event["fields"]["message"], "cache event");
        assert_eq!(event["fields"]["tile"], 3);
    }
}
