use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

use portable_pty::PtySize;

use crate::bridge::{SpawnConfig, TerminalSettings};
use crate::framer::FramerSettings;
use crate::paths;
use crate::session::{Endpoint, SessionConfig};

const CONFIG_FILENAME: &str = "config.toml";

pub const ENV_SERVER_URL: &str = "JELLYFIN_URL";
pub const ENV_API_KEY: &str = "JELLYFIN_API_KEY";

/// The benchmark executable and how to launch it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BenchmarkConfig {
    #[serde(default = "default_benchmark_program")]
    pub program: String,
    #[serde(default = "default_benchmark_args")]
    pub args: Vec<String>,
    /// Relative paths are resolved against the project root.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

/// Media server used by the pre-flight connectivity check.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, serialize_with = "mask_secret")]
    pub api_key: Option<String>,
    #[serde(default = "default_server_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TerminalConfig {
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_grace_period_millis")]
    pub grace_period_millis: u64,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

/// Prompt detection for partial lines.
///
/// ```toml
/// [framer]
/// prompt_delimiters = [":", "?"]
/// # or, replacing the delimiters:
/// prompt_pattern = '\(y/n\)\s*$'
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FramerConfig {
    #[serde(default = "default_prompt_delimiters")]
    pub prompt_delimiters: Vec<char>,
    #[serde(default)]
    pub prompt_pattern: Option<String>,
    #[serde(default = "default_flush_on_exit")]
    pub flush_on_exit: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Defaults to `.autotune/logs` under the project root.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
}

fn default_benchmark_program() -> String {
    "jellybench".to_string()
}

fn default_benchmark_args() -> Vec<String> {
    vec![
        "--ffmpeg".to_string(),
        "/app/jellybench_data/ffmpeg".to_string(),
    ]
}

fn default_server_timeout_secs() -> u64 {
    10
}

fn default_poll_interval_millis() -> u64 {
    100
}

fn default_chunk_size() -> usize {
    1024
}

fn default_grace_period_millis() -> u64 {
    3000
}

fn default_rows() -> u16 {
    24
}

fn default_cols() -> u16 {
    80
}

fn default_prompt_delimiters() -> Vec<char> {
    vec![':']
}

fn default_flush_on_exit() -> bool {
    true
}

fn default_max_lines() -> usize {
    50_000
}

fn mask_secret<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(_) => serializer.serialize_some("********"),
        None => serializer.serialize_none(),
    }
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            program: default_benchmark_program(),
            args: default_benchmark_args(),
            work_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            timeout_secs: default_server_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.url.as_ref().map(|url| Endpoint {
            url: url.clone(),
            credential: self.api_key.clone().unwrap_or_default(),
        })
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            poll_interval_millis: default_poll_interval_millis(),
            chunk_size: default_chunk_size(),
            grace_period_millis: default_grace_period_millis(),
            rows: default_rows(),
            cols: default_cols(),
        }
    }
}

impl TerminalConfig {
    pub fn settings(&self) -> TerminalSettings {
        TerminalSettings {
            poll_interval: Duration::from_millis(self.poll_interval_millis),
            chunk_size: self.chunk_size,
            grace_period: Duration::from_millis(self.grace_period_millis),
            size: PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            },
        }
    }
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            prompt_delimiters: default_prompt_delimiters(),
            prompt_pattern: None,
            flush_on_exit: default_flush_on_exit(),
        }
    }
}

impl FramerConfig {
    pub fn settings(&self) -> FramerSettings {
        FramerSettings {
            prompt_delimiters: self.prompt_delimiters.clone(),
            prompt_pattern: self.prompt_pattern.clone(),
            flush_on_exit: self.flush_on_exit,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_lines: default_max_lines(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub framer: FramerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.autotune/config.toml` file and load
    /// it. Returns the default config if no file is found.
    ///
    /// Environment overrides are not applied here; see
    /// [`ProjectConfig::apply_env`].
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = paths::data_dir(&dir).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Apply `JELLYFIN_URL` / `JELLYFIN_API_KEY` from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply server overrides from `lookup`. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = value(ENV_SERVER_URL) {
            self.server.url = Some(url);
        }
        if let Some(key) = value(ENV_API_KEY) {
            self.server.api_key = Some(key);
        }
    }

    /// Reject settings that would make a run misbehave rather than fail.
    pub fn validate(&self) -> Result<()> {
        if self.benchmark.program.trim().is_empty() {
            bail!("benchmark.program must not be empty");
        }
        if self.terminal.poll_interval_millis == 0 {
            bail!("terminal.poll_interval_millis must be greater than zero");
        }
        if self.terminal.chunk_size == 0 {
            bail!("terminal.chunk_size must be greater than zero");
        }
        if self.terminal.rows == 0 || self.terminal.cols == 0 {
            bail!("terminal.rows and terminal.cols must be greater than zero");
        }
        if self.log.max_lines == 0 {
            bail!("log.max_lines must be greater than zero");
        }
        if let Some(pattern) = &self.framer.prompt_pattern {
            regex::Regex::new(pattern)
                .with_context(|| format!("invalid framer.prompt_pattern: {pattern}"))?;
        }
        Ok(())
    }

    /// Directory run logs are written to.
    pub fn log_dir(&self, project_root: &Path) -> PathBuf {
        paths::resolve_log_dir(project_root, self.log.dir.as_deref())
    }

    /// Build the controller configuration, resolving relative paths against
    /// `project_root`.
    pub fn session_config(&self, project_root: &Path) -> Result<SessionConfig> {
        self.validate()?;
        Ok(SessionConfig {
            spawn: SpawnConfig {
                program: self.benchmark.program.clone(),
                args: self.benchmark.args.clone(),
                work_dir: self
                    .benchmark
                    .work_dir
                    .as_ref()
                    .map(|dir| project_root.join(dir)),
                env: vec![],
            },
            terminal: self.terminal.settings(),
            framer: self.framer.settings(),
            log_dir: self.log_dir(project_root),
            max_log_lines: self.log.max_lines,
            endpoint: self.server.endpoint(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn default_config_values() {
        let config = ProjectConfig::default();
        assert_eq!(config.benchmark.program, "jellybench");
        assert_eq!(
            config.benchmark.args,
            vec!["--ffmpeg", "/app/jellybench_data/ffmpeg"]
        );
        assert!(config.benchmark.work_dir.is_none());
        assert!(config.server.url.is_none());
        assert_eq!(config.server.timeout_secs, 10);
        assert_eq!(config.terminal.poll_interval_millis, 100);
        assert_eq!(config.terminal.chunk_size, 1024);
        assert_eq!(config.terminal.grace_period_millis, 3000);
        assert_eq!(config.framer.prompt_delimiters, vec![':']);
        assert!(config.framer.prompt_pattern.is_none());
        assert!(config.framer.flush_on_exit);
        assert_eq!(config.log.max_lines, 50_000);
        config.validate().unwrap();
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[benchmark]
program = "/usr/local/bin/jellybench"
args = ["--ffmpeg", "/opt/ffmpeg/bin/ffmpeg"]
work_dir = "bench"

[server]
url = "http://media:8096"
api_key = "abc123"
timeout_secs = 5

[terminal]
poll_interval_millis = 50
chunk_size = 4096
grace_period_millis = 1000
rows = 50
cols = 200

[framer]
prompt_delimiters = [":", "?"]
flush_on_exit = false

[log]
dir = "/var/log/autotune"
max_lines = 1000
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.benchmark.program, "/usr/local/bin/jellybench");
        assert_eq!(config.benchmark.work_dir, Some(PathBuf::from("bench")));
        assert_eq!(config.server.url.as_deref(), Some("http://media:8096"));
        assert_eq!(config.server.timeout(), Duration::from_secs(5));
        assert_eq!(config.terminal.chunk_size, 4096);
        assert_eq!(config.terminal.rows, 50);
        assert_eq!(config.framer.prompt_delimiters, vec![':', '?']);
        assert!(!config.framer.flush_on_exit);
        assert_eq!(config.log.max_lines, 1000);
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[server]
url = "http://media:8096"
"#;
        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.url.as_deref(), Some("http://media:8096"));
        assert_eq!(config.server.timeout_secs, 10);
        assert_eq!(config.benchmark.program, "jellybench");
        assert_eq!(config.terminal.poll_interval_millis, 100);
    }

    #[test]
    fn load_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join(".autotune");
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(
            data_dir.join("config.toml"),
            r#"
[benchmark]
program = "fakebench"
args = []
"#,
        )
        .unwrap();

        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_some());
        assert_eq!(config.benchmark.program, "fakebench");
        assert!(config.benchmark.args.is_empty());
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = ProjectConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.benchmark.program, "jellybench");
    }

    #[test]
    fn load_walks_up_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join(".autotune");
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(
            data_dir.join("config.toml"),
            r#"
[terminal]
poll_interval_millis = 25
"#,
        )
        .unwrap();

        let nested = tmp.path().join("results").join("2024");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = ProjectConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.terminal.poll_interval_millis, 25);
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join(".autotune");
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(data_dir.join("config.toml"), "[terminal]\nrows = \"tall\"\n").unwrap();

        let err = ProjectConfig::load(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn environment_overrides_server_settings() {
        let mut config: ProjectConfig = toml::from_str(
            r#"
[server]
url = "http://old:8096"
api_key = "old"
"#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            (ENV_SERVER_URL, "http://new:8096"),
            (ENV_API_KEY, "  "),
        ]
        .into_iter()
        .collect();

        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.server.url.as_deref(), Some("http://new:8096"));
        // Blank values do not clobber the file.
        assert_eq!(config.server.api_key.as_deref(), Some("old"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = ProjectConfig::default();
        config.framer.prompt_pattern = Some("(unclosed".to_string());
        let err = config.validate().unwrap_err();
        assert!(format!("{err:#}").contains("prompt_pattern"));

        let mut config = ProjectConfig::default();
        config.terminal.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = ProjectConfig::default();
        config.benchmark.program = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn session_config_resolves_paths_and_endpoint() {
        let root = Path::new("/srv/bench");
        let mut config = ProjectConfig::default();
        config.benchmark.work_dir = Some(PathBuf::from("data"));
        config.server.url = Some("http://media:8096".to_string());

        let session = config.session_config(root).unwrap();
        assert_eq!(session.spawn.program, "jellybench");
        assert_eq!(session.spawn.work_dir, Some(root.join("data")));
        assert_eq!(session.log_dir, root.join(".autotune").join("logs"));
        assert_eq!(session.terminal.poll_interval, Duration::from_millis(100));
        assert_eq!(
            session.endpoint,
            Some(Endpoint {
                url: "http://media:8096".to_string(),
                credential: String::new(),
            })
        );
    }

    #[test]
    fn api_key_is_masked_when_rendered() {
        let mut config = ProjectConfig::default();
        config.server.api_key = Some("very-secret".to_string());
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("very-secret"));
        assert!(json.contains("********"));
    }
}
