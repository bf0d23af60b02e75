use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand};
use std::{
    env, fs,
    io::{self, Write as _},
    num::NonZeroU32,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::args::BaseArgs;
use crate::ui::{print_command_status, CommandStatus};

mod get;
mod list;
mod set;

pub const LOCAL_DIR_NAME: &str = ".perfrun";

pub const DEFAULT_MAX_BATCH_SIZE: u32 = 50;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_TRACE_PROCESSOR_PATH: &str = "/usr/local/bin/trace_processor_shell";
pub const DEFAULT_OUTPUT_DIR: &str = "./output";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_pool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<NonZeroU32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_spec_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_processor_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub const KNOWN_KEYS: &[&str] = &[
    "api_url",
    "project",
    "device_pool",
    "max_batch_size",
    "max_retries",
    "poll_interval_secs",
    "test_spec_template",
    "trace_processor_path",
    "output_dir",
];

fn parse_number<T: std::str::FromStr>(key: &str, value: &str, expected: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid value for {key}: {value:?} (expected {expected})"))
}

impl Config {
    pub fn get_field(&self, key: &str) -> Option<String> {
        match key {
            "api_url" => self.api_url.clone(),
            "project" => self.project.clone(),
            "device_pool" => self.device_pool.clone(),
            "max_batch_size" => self.max_batch_size.map(|v| v.to_string()),
            "max_retries" => self.max_retries.map(|v| v.to_string()),
            "poll_interval_secs" => self.poll_interval_secs.map(|v| v.to_string()),
            "test_spec_template" => self.test_spec_template.clone(),
            "trace_processor_path" => self.trace_processor_path.clone(),
            "output_dir" => self.output_dir.clone(),
            _ => None,
        }
    }

    /// Set `key` from its string form. Numeric keys are validated.
    pub fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "api_url" => self.api_url = Some(value.to_string()),
            "project" => self.project = Some(value.to_string()),
            "device_pool" => self.device_pool = Some(value.to_string()),
            "max_batch_size" => {
                self.max_batch_size = Some(parse_number(key, value, "a positive integer")?)
            }
            "max_retries" => {
                self.max_retries = Some(parse_number(key, value, "a non-negative integer")?)
            }
            "poll_interval_secs" => {
                self.poll_interval_secs = Some(parse_number(key, value, "a number of seconds")?)
            }
            "test_spec_template" => self.test_spec_template = Some(value.to_string()),
            "trace_processor_path" => self.trace_processor_path = Some(value.to_string()),
            "output_dir" => self.output_dir = Some(value.to_string()),
            _ => bail!("Unknown config key: {key}"),
        }
        Ok(())
    }

    pub fn unset_field(&mut self, key: &str) -> bool {
        match key {
            "api_url" => self.api_url = None,
            "project" => self.project = None,
            "device_pool" => self.device_pool = None,
            "max_batch_size" => self.max_batch_size = None,
            "max_retries" => self.max_retries = None,
            "poll_interval_secs" => self.poll_interval_secs = None,
            "test_spec_template" => self.test_spec_template = None,
            "trace_processor_path" => self.trace_processor_path = None,
            "output_dir" => self.output_dir = None,
            _ => return false,
        }
        true
    }

    fn merge(&self, other: &Config) -> Config {
        let mut extra = self.extra.clone();
        extra.extend(other.extra.clone());
        Config {
            api_url: other.api_url.clone().or_else(|| self.api_url.clone()),
            project: other.project.clone().or_else(|| self.project.clone()),
            device_pool: other.device_pool.clone().or_else(|| self.device_pool.clone()),
            max_batch_size: other.max_batch_size.or(self.max_batch_size),
            max_retries: other.max_retries.or(self.max_retries),
            poll_interval_secs: other.poll_interval_secs.or(self.poll_interval_secs),
            test_spec_template: other
                .test_spec_template
                .clone()
                .or_else(|| self.test_spec_template.clone()),
            trace_processor_path: other
                .trace_processor_path
                .clone()
                .or_else(|| self.trace_processor_path.clone()),
            output_dir: other.output_dir.clone().or_else(|| self.output_dir.clone()),
            extra,
        }
    }
}

/// Effective settings: CLI flags over local config over global config over defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_url: Option<String>,
    pub project: Option<String>,
    pub device_pool: Option<String>,
    pub max_batch_size: NonZeroU32,
    pub max_retries: u32,
    pub poll_interval: Duration,
    pub test_spec_template: Option<PathBuf>,
    pub trace_processor_path: PathBuf,
    pub output_dir: PathBuf,
}

impl Settings {
    pub fn resolve(config: &Config, base: &BaseArgs) -> Self {
        let default_batch = NonZeroU32::new(DEFAULT_MAX_BATCH_SIZE).unwrap_or(NonZeroU32::MIN);
        Self {
            api_url: base.api_url.clone().or_else(|| config.api_url.clone()),
            project: base.project.clone().or_else(|| config.project.clone()),
            device_pool: base
                .device_pool
                .clone()
                .or_else(|| config.device_pool.clone()),
            max_batch_size: config.max_batch_size.unwrap_or(default_batch),
            max_retries: config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            poll_interval: Duration::from_secs(
                config
                    .poll_interval_secs
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            ),
            test_spec_template: config.test_spec_template.as_ref().map(PathBuf::from),
            trace_processor_path: PathBuf::from(
                config
                    .trace_processor_path
                    .as_deref()
                    .unwrap_or(DEFAULT_TRACE_PROCESSOR_PATH),
            ),
            output_dir: PathBuf::from(config.output_dir.as_deref().unwrap_or(DEFAULT_OUTPUT_DIR)),
        }
    }

    pub fn load(base: &BaseArgs) -> Result<Self> {
        Ok(Self::resolve(&load()?, base))
    }
}

pub fn global_config_dir() -> Result<PathBuf> {
    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join("perfrun"));
    }
    dirs::home_dir()
        .map(|path| path.join(".config").join("perfrun"))
        .ok_or_else(|| anyhow!("$HOME not configured."))
}

pub fn global_path() -> Result<PathBuf> {
    Ok(global_config_dir()?.join("config.json"))
}

pub fn load_file(path: &Path) -> Config {
    let file_contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Config::default(),
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("Warning: could not read {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    let config: Config = match serde_json::from_str(&file_contents) {
        Ok(c) => c,
        Err(e) => {
            print_command_status(
                CommandStatus::Warning,
                &format!("Warning: could not read {}: {e}", path.display()),
            );
            return Config::default();
        }
    };

    for key in config.extra.keys() {
        print_command_status(
            CommandStatus::Warning,
            &format!("Warning: unknown config key {} in {}", key, path.display()),
        );
    }

    config
}

pub fn load() -> Result<Config> {
    let global = global_path()
        .map(|path| load_file(&path))
        .unwrap_or_default();
    let local = match local_path() {
        Some(p) => load_file(&p),
        None => Config::default(),
    };
    Ok(global.merge(&local))
}

pub fn save_file(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(config)?;
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    file.write_all(json.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    fs::rename(&temp_path, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;

    Ok(())
}

pub fn find_local_config_dir() -> Option<PathBuf> {
    let home = dirs::home_dir();
    let mut current_dir = std::env::current_dir().ok()?;

    loop {
        if current_dir.join(LOCAL_DIR_NAME).is_dir() {
            return Some(current_dir.join(LOCAL_DIR_NAME));
        }
        if current_dir.join(".git").exists() {
            return None;
        }
        if Some(&current_dir) == home.as_ref() {
            return None;
        }
        if !current_dir.pop() {
            return None;
        }
    }
}

pub fn local_path() -> Option<PathBuf> {
    find_local_config_dir().map(|dir| dir.join("config.json"))
}

/// Resolve which config file to write based on --global/--local flags.
///
/// `--local` creates `.perfrun/` in the working directory when no local
/// config exists yet.
pub fn resolve_write_path(global: bool, local: bool) -> Result<PathBuf> {
    if global {
        return global_path();
    }
    if let Some(path) = local_path() {
        return Ok(path);
    }
    if local {
        let cwd = std::env::current_dir().context("failed to read current directory")?;
        return Ok(cwd.join(LOCAL_DIR_NAME).join("config.json"));
    }
    global_path()
}

/// Where an effective value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Local,
    Global,
    Default,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Local => "local",
            Source::Global => "global",
            Source::Default => "default",
        }
    }
}

/// Keys holding filesystem paths; stored absolute so they work from any directory.
pub const PATH_KEYS: &[&str] = &["test_spec_template", "trace_processor_path", "output_dir"];

pub fn default_value(key: &str) -> Option<String> {
    match key {
        "max_batch_size" => Some(DEFAULT_MAX_BATCH_SIZE.to_string()),
        "max_retries" => Some(DEFAULT_MAX_RETRIES.to_string()),
        "poll_interval_secs" => Some(DEFAULT_POLL_INTERVAL_SECS.to_string()),
        "trace_processor_path" => Some(DEFAULT_TRACE_PROCESSOR_PATH.to_string()),
        "output_dir" => Some(DEFAULT_OUTPUT_DIR.to_string()),
        _ => None,
    }
}

/// The config files visible from the working directory, narrowed by `--global`/`--local`.
/// Defaults only take part when neither scope flag is given.
#[derive(Debug, Default)]
pub struct Layers {
    pub global: Option<(PathBuf, Config)>,
    pub local: Option<(PathBuf, Config)>,
    pub defaults: bool,
}

impl Layers {
    pub fn load(global: bool, local: bool) -> Self {
        let global_layer = if local {
            None
        } else {
            global_path().ok().map(|path| {
                let config = load_file(&path);
                (path, config)
            })
        };
        let local_layer = if global {
            None
        } else {
            local_path().map(|path| {
                let config = load_file(&path);
                (path, config)
            })
        };
        Self {
            global: global_layer,
            local: local_layer,
            defaults: !global && !local,
        }
    }

    pub fn lookup(&self, key: &str) -> Option<(String, Source)> {
        let field = |layer: &Option<(PathBuf, Config)>| {
            layer.as_ref().and_then(|(_, config)| config.get_field(key))
        };
        field(&self.local)
            .map(|value| (value, Source::Local))
            .or_else(|| field(&self.global).map(|value| (value, Source::Global)))
            .or_else(|| {
                self.defaults
                    .then(|| default_value(key))
                    .flatten()
                    .map(|value| (value, Source::Default))
            })
    }

    pub fn path(&self, source: Source) -> Option<&Path> {
        match source {
            Source::Local => self.local.as_ref().map(|(path, _)| path.as_path()),
            Source::Global => self.global.as_ref().map(|(path, _)| path.as_path()),
            Source::Default => None,
        }
    }
}

// --- CLI commands ---

#[derive(Debug, Clone, Args)]
pub struct ScopeArgs {
    /// Apply to global config (~/.config/perfrun/config.json)
    #[arg(long, short = 'g', conflicts_with = "local")]
    global: bool,

    /// Apply to local config (.perfrun/config.json)
    #[arg(long, short = 'l')]
    local: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommands>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommands {
    /// List config values
    List {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Show config values grouped by source file
        #[arg(long)]
        by_source: bool,
    },
    /// Get a config value
    Get {
        /// Config key (see `perfrun config list`)
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Set a config value
    Set {
        /// Config key (api_url, project, device_pool, max_batch_size, ...)
        key: String,
        /// Value to set
        value: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Remove a config value
    Unset {
        /// Config key
        key: String,
        #[command(flatten)]
        scope: ScopeArgs,
    },
}

fn validate_key(key: &str) -> Result<()> {
    if !KNOWN_KEYS.contains(&key) {
        bail!(
            "Unknown config key: {key}\nValid keys: {}",
            KNOWN_KEYS.join(", ")
        );
    }
    Ok(())
}

pub fn run(base: BaseArgs, args: ConfigArgs) -> Result<()> {
    match args.command {
        None => list::run(&base, &Layers::load(false, false), false),
        Some(ConfigCommands::List { scope, by_source }) => {
            list::run(&base, &Layers::load(scope.global, scope.local), by_source)
        }
        Some(ConfigCommands::Get { key, scope }) => {
            validate_key(&key)?;
            get::run(&base, &key, &Layers::load(scope.global, scope.local))
        }
        Some(ConfigCommands::Set { key, value, scope }) => {
            validate_key(&key)?;
            set::run(&key, &value, scope.global, scope.local)
        }
        Some(ConfigCommands::Unset { key, scope }) => {
            validate_key(&key)?;
            set::unset(&key, scope.global, scope.local)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base_args() -> BaseArgs {
        BaseArgs {
            json: false,
            verbose: false,
            api_url: None,
            project: None,
            device_pool: None,
            env_file: None,
        }
    }

    #[test]
    fn merge_other_takes_precedence() {
        let base = Config {
            project: Some("base-proj".into()),
            max_retries: Some(1),
            ..Default::default()
        };
        let other = Config {
            project: Some("other-proj".into()),
            max_retries: Some(5),
            ..Default::default()
        };
        let merged = base.merge(&other);
        assert_eq!(merged.project, Some("other-proj".into()));
        assert_eq!(merged.max_retries, Some(5));
    }

    #[test]
    fn merge_partial_fill() {
        let base = Config {
            api_url: Some("https://farm.example.com".into()),
            project: None,
            ..Default::default()
        };
        let other = Config {
            api_url: None,
            project: Some("other-proj".into()),
            ..Default::default()
        };
        let merged = base.merge(&other);
        assert_eq!(merged.api_url, Some("https://farm.example.com".into()));
        assert_eq!(merged.project, Some("other-proj".into()));
    }

    #[test]
    fn numeric_keys_are_validated() {
        let mut config = Config::default();
        config.set_field("max_batch_size", "25").unwrap();
        assert_eq!(config.max_batch_size.map(NonZeroU32::get), Some(25));

        let err = config.set_field("max_batch_size", "0").unwrap_err();
        assert!(err.to_string().contains("positive integer"));
        assert!(config.set_field("max_retries", "-1").is_err());
        assert!(config.set_field("poll_interval_secs", "soon").is_err());
        config.set_field("max_retries", "0").unwrap();
        assert_eq!(config.get_field("max_retries").as_deref(), Some("0"));
    }

    #[test]
    fn settings_fall_back_to_defaults() {
        let settings = Settings::resolve(&Config::default(), &base_args());
        assert_eq!(settings.max_batch_size.get(), 50);
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.poll_interval, Duration::from_secs(10));
        assert_eq!(
            settings.trace_processor_path,
            PathBuf::from("/usr/local/bin/trace_processor_shell")
        );
        assert_eq!(settings.output_dir, PathBuf::from("./output"));
    }

    #[test]
    fn flags_override_config() {
        let config = Config {
            project: Some("from-config".into()),
            device_pool: Some("pool-a".into()),
            ..Default::default()
        };
        let args = BaseArgs {
            project: Some("from-flag".into()),
            ..base_args()
        };
        let settings = Settings::resolve(&config, &args);
        assert_eq!(settings.project.as_deref(), Some("from-flag"));
        assert_eq!(settings.device_pool.as_deref(), Some("pool-a"));
    }

    #[test]
    fn load_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_file(&tmp.path().join("nonexistent.json"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_invalid_json_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("invalid.json");
        fs::write(&path, "not valid json {{{").unwrap();
        assert_eq!(load_file(&path).project, None);
    }

    #[test]
    fn save_load_roundtrip_keeps_numbers_numeric() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.json");

        let mut original = Config::default();
        original.set_field("project", "checkout").unwrap();
        original.set_field("max_batch_size", "20").unwrap();
        original.set_field("poll_interval_secs", "30").unwrap();

        save_file(&path, &original).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["max_batch_size"], 20);
        assert!(raw.get("api_url").is_none());
        assert_eq!(load_file(&path), original);
    }

    #[test]
    fn unknown_keys_roundtrip_through_save() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, r#"{"project": "p", "unknown_field": "value"}"#).unwrap();

        let config = load_file(&path);
        save_file(&path, &config).unwrap();
        let reloaded = load_file(&path);

        assert_eq!(reloaded.project, Some("p".into()));
        assert!(reloaded.extra.contains_key("unknown_field"));
    }

    fn layers(global: Config, local: Config, defaults: bool) -> Layers {
        Layers {
            global: Some((PathBuf::from("/home/u/.config/perfrun/config.json"), global)),
            local: Some((PathBuf::from("/work/.perfrun/config.json"), local)),
            defaults,
        }
    }

    #[test]
    fn lookup_prefers_local_then_global_then_default() {
        let global = Config {
            project: Some("global-proj".into()),
            device_pool: Some("pool".into()),
            ..Default::default()
        };
        let local = Config {
            project: Some("local-proj".into()),
            ..Default::default()
        };
        let layers = layers(global, local, true);

        assert_eq!(
            layers.lookup("project"),
            Some(("local-proj".to_string(), Source::Local))
        );
        assert_eq!(
            layers.lookup("device_pool"),
            Some(("pool".to_string(), Source::Global))
        );
        assert_eq!(
            layers.lookup("max_retries"),
            Some(("3".to_string(), Source::Default))
        );
        assert_eq!(layers.lookup("api_url"), None);
        assert_eq!(
            layers.path(Source::Local),
            Some(Path::new("/work/.perfrun/config.json"))
        );
    }

    #[test]
    fn scoped_lookup_skips_defaults() {
        let layers = layers(Config::default(), Config::default(), false);
        assert_eq!(layers.lookup("max_retries"), None);
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(validate_key("org").is_err());
        assert!(validate_key("max_retries").is_ok());
    }
}
