use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    /// The applications that workers can be spawned for.
    #[serde(default, rename = "app")]
    pub apps: Vec<AppConfig>,

    /// The directory relative to which paths in the configuration
    /// get resolved. Set to the directory containing the config file.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Config {
    /// Reads the configuration from a file and resolves every
    /// application's paths relative to the file's directory.
    pub fn load(path: &Path) -> Result<Config> {
        let path = path
            .canonicalize()
            .with_context(|| format!("Could not find configuration file {:?}", path))?;
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_path()))
            .build()
            .with_context(|| format!("Could not read configuration file {:?}", &path))?;
        let mut config: Config = settings
            .try_deserialize()
            .with_context(|| format!("Could not parse configuration file {:?}", &path))?;
        config.base_dir = path
            .parent()
            .map(|p| p.to_owned())
            .unwrap_or(std::env::current_dir()?);
        config.resolve_paths();
        config.validate()?;
        Ok(config)
    }

    pub fn canonical_path(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    pub fn app(&self, name: &str) -> Option<&AppConfig> {
        self.apps.iter().find(|app| app.name == name)
    }

    fn resolve_paths(&mut self) {
        let base_dir = self.base_dir.clone();
        for app in self.apps.iter_mut() {
            app.root_path = base_dir.join(&app.root_path);
            app.socket_dir = base_dir.join(&app.socket_dir);
        }
    }

    fn validate(&self) -> Result<()> {
        for (i, app) in self.apps.iter().enumerate() {
            if self.apps[..i].iter().any(|other| other.name == app.name) {
                bail!("Application {:?} is configured more than once", app.name);
            }
            app.validate()?;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    /// Whether logfmt lines start with the level and message.
    #[serde(default)]
    pub print_prefix: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> slog::Level {
        match level {
            LogLevel::Trace => slog::Level::Trace,
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Warning => slog::Level::Warning,
            LogLevel::Error => slog::Level::Error,
            LogLevel::Critical => slog::Level::Critical,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,

    /// `key=value` pairs, one record per line.
    Logfmt,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Logfmt
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogOutput {
    Stderr,
    Stdout,
}

impl Default for LogOutput {
    fn default() -> Self {
        LogOutput::Stderr
    }
}

/// How workers of an application get created.
#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PreloadStrategy {
    /// Every worker starts from scratch and loads the application itself.
    Direct,

    /// A preloader loads the application once, and workers get
    /// duplicated off it.
    Smart,
}

impl Default for PreloadStrategy {
    fn default() -> Self {
        PreloadStrategy::Direct
    }
}

/// What the application's runtime can safely do. Determined when the
/// application is configured, never per request.
#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct RuntimeCapabilities {
    /// The runtime keeps working after its process gets duplicated
    /// with `fork(2)`.
    #[serde(default)]
    pub duplication: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AppConfig {
    /// Identifies the application. Spawners are cached by this name.
    pub name: String,

    /// The directory the application runs in.
    #[serde(default = "default_root_path")]
    pub root_path: PathBuf,

    /// The commandline that starts the application's loader, as an
    /// array of arguments. No shell expansion takes place. A relative
    /// program path is resolved against `root_path`.
    pub cmdline: Vec<String>,

    /// Environment variables in `NAME=value` form that get set before
    /// the application starts.
    #[serde(default)]
    pub env: Vec<String>,

    #[serde(default)]
    pub runtime_capabilities: RuntimeCapabilities,

    /// Seconds a preloader may sit idle before it gets shut down. 0 or
    /// absent means it is kept around forever.
    #[serde(default)]
    pub idle_timeout_seconds: Option<u64>,

    #[serde(default)]
    pub preload_strategy: PreloadStrategy,

    /// How long a spawn may take before it is given up. Default: 30s
    #[serde(default = "default_spawn_timeout", with = "humantime_serde")]
    pub spawn_timeout: Duration,

    /// How often an idle preloader gets checked for expiry. Default: 1s
    #[serde(default = "default_reaper_interval", with = "humantime_serde")]
    pub reaper_interval: Duration,

    /// Where worker endpoint sockets are created.
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
}

fn default_root_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_spawn_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_reaper_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_socket_dir() -> PathBuf {
    std::env::temp_dir().join("zwilling")
}

impl AppConfig {
    /// An application started by `cmdline` in `root_path`, with all
    /// other settings at their defaults.
    pub fn new(name: &str, root_path: impl Into<PathBuf>, cmdline: &[&str]) -> AppConfig {
        AppConfig {
            name: name.to_string(),
            root_path: root_path.into(),
            cmdline: cmdline.iter().map(|arg| arg.to_string()).collect(),
            env: vec![],
            runtime_capabilities: Default::default(),
            idle_timeout_seconds: None,
            preload_strategy: Default::default(),
            spawn_timeout: default_spawn_timeout(),
            reaper_interval: default_reaper_interval(),
            socket_dir: default_socket_dir(),
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_seconds {
            None | Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        }
    }

    /// The path of the executable that starts the application.
    pub fn program(&self) -> Option<PathBuf> {
        let program = Path::new(self.cmdline.first()?);
        if program.is_relative() && program.components().count() > 1 {
            Some(self.root_path.join(program))
        } else {
            Some(program.to_path_buf())
        }
    }

    /// The endpoint a worker with the given ID binds to.
    pub fn socket_path(&self, worker_id: &str) -> PathBuf {
        self.socket_dir
            .join(format!("{}-{}.sock", self.name, worker_id))
    }

    /// The configured environment as name/value pairs.
    pub fn env_vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|var| {
            let mut parts = var.splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some(name), Some(value)) if !name.is_empty() => Some((name, value)),
                _ => None,
            }
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.cmdline.is_empty() {
            bail!("Application {:?} has an empty cmdline", self.name);
        }
        if let Some(bad) = self
            .env
            .iter()
            .find(|var| var.splitn(2, '=').nth(1).is_none() || var.starts_with('='))
        {
            bail!(
                "Application {:?} has a malformed env entry {:?}; expected NAME=value",
                self.name,
                bad
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Config {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .expect("valid toml");
        settings.try_deserialize().expect("valid config")
    }

    #[test]
    fn defaults() {
        let config = parse(
            r#"
            [[app]]
            name = "shop"
            cmdline = ["./bin/shop"]
            "#,
        );
        assert_eq!(config.log, LogConfig::default());
        let app = config.app("shop").expect("app is configured");
        assert_eq!(app.preload_strategy, PreloadStrategy::Direct);
        assert!(!app.runtime_capabilities.duplication);
        assert_eq!(app.idle_timeout(), None);
        assert_eq!(app.spawn_timeout, Duration::from_secs(30));
        assert_eq!(app.reaper_interval, Duration::from_secs(1));
        assert_eq!(app.root_path, PathBuf::from("."));
    }

    #[test]
    fn smart_application() {
        let config = parse(
            r#"
            [log]
            level = "debug"
            format = "json"

            [[app]]
            name = "shop"
            root_path = "apps/shop"
            cmdline = ["./bin/shop", "--preload"]
            env = ["SHOP_ENV=production"]
            preload_strategy = "smart"
            idle_timeout_seconds = 300
            spawn_timeout = "5s"
            reaper_interval = "250ms"
            runtime_capabilities = { duplication = true }
            "#,
        );
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.log.format, LogFormat::Json);
        let app = &config.apps[0];
        assert_eq!(app.preload_strategy, PreloadStrategy::Smart);
        assert!(app.runtime_capabilities.duplication);
        assert_eq!(app.idle_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(app.spawn_timeout, Duration::from_secs(5));
        assert_eq!(app.reaper_interval, Duration::from_millis(250));
        assert_eq!(
            app.env_vars().collect::<Vec<_>>(),
            vec![("SHOP_ENV", "production")]
        );
        assert_eq!(
            app.program(),
            Some(PathBuf::from("apps/shop/bin/shop"))
        );
    }

    #[test]
    fn zero_idle_timeout_disables_reaping() {
        let mut app = AppConfig::new("a", "/", &["/bin/true"]);
        app.idle_timeout_seconds = Some(0);
        assert_eq!(app.idle_timeout(), None);
    }

    #[test]
    fn programs_on_the_path_stay_untouched() {
        let app = AppConfig::new("a", "/srv/a", &["ruby", "app.rb"]);
        assert_eq!(app.program(), Some(PathBuf::from("ruby")));
    }

    #[test]
    fn rejects_bad_apps() {
        let app = AppConfig::new("a", "/", &[]);
        assert!(app.validate().is_err());

        let mut app = AppConfig::new("a", "/", &["/bin/true"]);
        app.env = vec!["NO_VALUE".to_string()];
        assert!(app.validate().is_err());
    }

    #[test]
    fn resolves_paths_against_base_dir() {
        let mut config = parse(
            r#"
            [[app]]
            name = "shop"
            root_path = "apps/shop"
            socket_dir = "run"
            cmdline = ["./bin/shop"]
            "#,
        );
        config.base_dir = PathBuf::from("/etc/zwilling");
        config.resolve_paths();
        let app = &config.apps[0];
        assert_eq!(app.root_path, PathBuf::from("/etc/zwilling/apps/shop"));
        assert_eq!(app.socket_dir, PathBuf::from("/etc/zwilling/run"));
        assert_eq!(
            config.canonical_path(Path::new("x")),
            PathBuf::from("/etc/zwilling/x")
        );
    }
}
