use clap::Parser;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use warden_core::{LaunchSpec, StartError};

use crate::{
    hub::{HubConfig, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_SUBSCRIBER_BACKLOG},
    supervisor::{ShutdownPolicy, SupervisorConfig, DEFAULT_STOP_GRACE},
};

pub const DEFAULT_ADDR: &str = "127.0.0.1:8787";
pub const DEFAULT_GAME_ID: &str = "survival";
pub const DEFAULT_SCRIPT_VARIANT: &str = "default";
pub const DEFAULT_LOG_DIR: &str = ".warden/logs";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const SERVER_OUTPUT_FILE_NAME: &str = "server-output.log";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read game catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse game catalog {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("game catalog defines no games")]
    NoGames,
    #[error("game '{0}' is defined more than once")]
    DuplicateGame(String),
    #[error("default game '{0}' is not defined")]
    UnknownDefault(String),
    #[error("invalid value for {flag}: {message}")]
    Invalid { flag: &'static str, message: String },
}

#[derive(Parser, Debug)]
#[command(name = "warden-supervisor")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value = "")]
    pub games_file: String,
    #[arg(long, default_value = "")]
    pub game_id: String,
    #[arg(long, default_value = "")]
    pub script: String,
    #[arg(long, default_value = "")]
    pub working_dir: String,
    #[arg(long, default_value_t = warden_core::ring::DEFAULT_RING_CAPACITY)]
    pub buffer_capacity: usize,
    #[arg(long, default_value_t = DEFAULT_SUBSCRIBER_BACKLOG)]
    pub subscriber_backlog: usize,
    #[arg(long, default_value_t = DEFAULT_KEEPALIVE_INTERVAL.as_secs())]
    pub keepalive_interval: u64,
    #[arg(long, default_value_t = DEFAULT_STOP_GRACE.as_secs())]
    pub stop_grace: u64,
    #[arg(long, default_value = "")]
    pub on_shutdown: String,
    #[arg(long, default_value_t = false)]
    pub ready_on_spawn: bool,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    /// Fallback filter directive when `RUST_LOG` is unset.
    pub log_level: String,
    pub log_dir: String,
    pub hub: HubConfig,
    pub supervisor: SupervisorConfig,
    pub shutdown: ShutdownPolicy,
    pub catalog: GameCatalog,
}

impl Config {
    pub fn launch_spec(
        &self,
        game_id: Option<&str>,
        script: Option<&str>,
    ) -> Result<LaunchSpec, StartError> {
        self.catalog.resolve(game_id, script)
    }
}

/// Platform-specific launch targets for one script variant.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ScriptTarget {
    #[serde(default)]
    pub unix: Option<PathBuf>,
    #[serde(default)]
    pub windows: Option<PathBuf>,
}

impl ScriptTarget {
    pub fn for_platform(&self) -> Option<&Path> {
        if cfg!(windows) {
            self.windows.as_deref()
        } else {
            self.unix.as_deref()
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct GameConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub stop_command: Option<String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, ScriptTarget>,
}

impl GameConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct GameCatalog {
    #[serde(default)]
    pub default_game: Option<String>,
    #[serde(default)]
    pub games: Vec<GameConfig>,
}

impl GameCatalog {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, path)
    }

    pub fn parse(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let catalog: GameCatalog = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Catalog holding one game built from command-line flags.
    pub fn single(game_id: &str, script: Option<PathBuf>, working_dir: Option<PathBuf>) -> Self {
        let mut scripts = BTreeMap::new();
        let target = match script {
            Some(path) => ScriptTarget {
                unix: Some(path.clone()),
                windows: Some(path),
            },
            None => ScriptTarget {
                unix: Some(PathBuf::from("start_server.sh")),
                windows: Some(PathBuf::from("start_server.bat")),
            },
        };
        scripts.insert(DEFAULT_SCRIPT_VARIANT.to_string(), target);
        Self {
            default_game: Some(game_id.to_string()),
            games: vec![GameConfig {
                id: game_id.to_string(),
                name: None,
                working_dir,
                args: Vec::new(),
                stop_command: None,
                scripts,
            }],
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.games.is_empty() {
            return Err(ConfigError::NoGames);
        }
        let mut seen = HashSet::new();
        for game in &self.games {
            if !seen.insert(game.id.as_str()) {
                return Err(ConfigError::DuplicateGame(game.id.clone()));
            }
        }
        if let Some(default) = &self.default_game {
            if !seen.contains(default.as_str()) {
                return Err(ConfigError::UnknownDefault(default.clone()));
            }
        }
        Ok(())
    }

    pub fn default_game(&self) -> Option<&GameConfig> {
        match &self.default_game {
            Some(id) => self.game(id),
            None => self.games.first(),
        }
    }

    pub fn game(&self, id: &str) -> Option<&GameConfig> {
        self.games.iter().find(|game| game.id == id)
    }

    /// Turn a game id and script variant into a launch spec. Both default when omitted.
    /// Existence of the target is left to the supervisor.
    pub fn resolve(
        &self,
        game_id: Option<&str>,
        script: Option<&str>,
    ) -> Result<LaunchSpec, StartError> {
        let game = match game_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => self
                .game(id)
                .ok_or_else(|| StartError::UnknownGame(id.to_string()))?,
            None => self
                .default_game()
                .ok_or_else(|| StartError::UnknownGame(String::new()))?,
        };
        let variant = script
            .map(str::trim)
            .filter(|variant| !variant.is_empty())
            .unwrap_or(DEFAULT_SCRIPT_VARIANT);
        let target = game
            .scripts
            .get(variant)
            .or_else(|| {
                // A single unnamed variant serves as the default.
                if variant == DEFAULT_SCRIPT_VARIANT && game.scripts.len() == 1 {
                    game.scripts.values().next()
                } else {
                    None
                }
            })
            .and_then(ScriptTarget::for_platform)
            .ok_or_else(|| StartError::UnknownScript(variant.to_string()))?;

        let program = match &game.working_dir {
            Some(dir) if target.is_relative() => dir.join(target),
            _ => target.to_path_buf(),
        };
        let mut spec = LaunchSpec::new(game.id.clone(), program);
        spec.args = game.args.clone();
        spec.working_dir = game.working_dir.clone();
        spec.stop_command = game.stop_command.clone();
        Ok(spec)
    }
}

pub fn load_config() -> Result<Config, ConfigError> {
    let args = Args::parse();
    build_config(args)
}

pub fn build_config(args: Args) -> Result<Config, ConfigError> {
    let addr = resolve_addr(&args.addr);
    let log_level = resolve_log_level(args.debug);
    let log_dir = resolve_log_dir(&args.log_dir);
    let shutdown = resolve_shutdown(&args.on_shutdown)?;
    let output_log = match shutdown {
        ShutdownPolicy::Detach => Some(server_output_path(&log_dir)),
        ShutdownPolicy::Stop => None,
    };
    let catalog = match resolve_games_file(&args.games_file) {
        Some(path) => GameCatalog::load(&path)?,
        None => {
            let game_id = if args.game_id.trim().is_empty() {
                DEFAULT_GAME_ID
            } else {
                args.game_id.trim()
            };
            GameCatalog::single(
                game_id,
                non_empty_path(&args.script),
                non_empty_path(&args.working_dir),
            )
        }
    };
    if args.buffer_capacity == 0 {
        return Err(ConfigError::Invalid {
            flag: "--buffer-capacity",
            message: "must be at least 1".to_string(),
        });
    }
    if args.subscriber_backlog == 0 {
        return Err(ConfigError::Invalid {
            flag: "--subscriber-backlog",
            message: "must be at least 1".to_string(),
        });
    }
    Ok(Config {
        addr,
        log_level,
        log_dir,
        hub: HubConfig {
            buffer_capacity: args.buffer_capacity,
            subscriber_backlog: args.subscriber_backlog,
            keepalive_interval: Duration::from_secs(args.keepalive_interval.max(1)),
        },
        supervisor: SupervisorConfig {
            stop_grace: Duration::from_secs(args.stop_grace),
            ready_on_spawn: args.ready_on_spawn,
            output_log,
        },
        shutdown,
        catalog,
    })
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_flag(key: &str) -> bool {
    env_value(key).is_some_and(|value| {
        ["1", "true", "yes", "on"]
            .iter()
            .any(|truthy| value.trim().eq_ignore_ascii_case(truthy))
    })
}

/// `--debug`/`WARDEN_DEBUG` win over `WARDEN_LOG_LEVEL`.
fn resolve_log_level(debug_flag: bool) -> String {
    if debug_flag || env_flag("WARDEN_DEBUG") {
        return "debug".to_string();
    }
    env_value("WARDEN_LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
}

/// Where a detachable server writes its console. Falls back to the temp dir when file
/// logging is disabled, since the server has to write somewhere once this service is gone.
fn server_output_path(log_dir: &str) -> PathBuf {
    if log_dir.trim().is_empty() {
        std::env::temp_dir().join(format!("warden-{SERVER_OUTPUT_FILE_NAME}"))
    } else {
        Path::new(log_dir).join(SERVER_OUTPUT_FILE_NAME)
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    env_value("WARDEN_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string())
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_value("WARDEN_LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())
}

fn resolve_games_file(flag: &str) -> Option<PathBuf> {
    non_empty_path(flag).or_else(|| env_value("WARDEN_GAMES_FILE").map(PathBuf::from))
}

fn resolve_shutdown(flag: &str) -> Result<ShutdownPolicy, ConfigError> {
    let raw = if flag.trim().is_empty() {
        match env_value("WARDEN_ON_SHUTDOWN") {
            Some(value) => value,
            None => return Ok(ShutdownPolicy::default()),
        }
    } else {
        flag.to_string()
    };
    raw.parse().map_err(|message| ConfigError::Invalid {
        flag: "--on-shutdown",
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
default_game = "survival"

[[games]]
id = "survival"
name = "Survival Dedicated Server"
working_dir = "/srv/survival"
args = ["-log"]
stop_command = "shutdown"

[games.scripts.default]
unix = "start_server.sh"
windows = "start_server.bat"

[games.scripts.nosteam]
unix = "start_server_nosteam.sh"
windows = "start_server_nosteam.bat"

[[games]]
id = "creative"

[games.scripts.main]
unix = "/opt/creative/run.sh"
windows = "C:\\creative\\run.bat"
"#;

    fn catalog() -> GameCatalog {
        GameCatalog::parse(CATALOG, Path::new("games.toml")).expect("catalog")
    }

    fn platform_script(unix: &str, windows: &str) -> PathBuf {
        PathBuf::from(if cfg!(windows) { windows } else { unix })
    }

    #[test]
    fn resolves_default_game_and_variant_against_working_dir() {
        let spec = catalog().resolve(None, None).expect("resolve");
        assert_eq!(spec.game_id, "survival");
        assert_eq!(
            spec.program,
            Path::new("/srv/survival").join(platform_script("start_server.sh", "start_server.bat"))
        );
        assert_eq!(spec.working_dir.as_deref(), Some(Path::new("/srv/survival")));
        assert_eq!(spec.args, vec!["-log".to_string()]);
        assert_eq!(spec.stop_command.as_deref(), Some("shutdown"));
    }

    #[test]
    fn resolves_named_variant() {
        let spec = catalog()
            .resolve(Some("survival"), Some("nosteam"))
            .expect("resolve");
        assert!(spec
            .program
            .to_string_lossy()
            .contains("start_server_nosteam"));
    }

    #[test]
    fn lone_variant_serves_as_default() {
        let spec = catalog().resolve(Some("creative"), None).expect("resolve");
        assert_eq!(
            spec.program,
            platform_script("/opt/creative/run.sh", "C:\\creative\\run.bat")
        );
        assert_eq!(spec.working_dir, None);
    }

    #[test]
    fn unknown_game_and_script_are_rejected() {
        let catalog = catalog();
        assert_eq!(
            catalog.resolve(Some("arena"), None),
            Err(StartError::UnknownGame("arena".to_string()))
        );
        assert_eq!(
            catalog.resolve(Some("survival"), Some("beta")),
            Err(StartError::UnknownScript("beta".to_string()))
        );
    }

    #[test]
    fn catalog_validation() {
        let empty = GameCatalog::parse("games = []", Path::new("g.toml"));
        assert!(matches!(empty, Err(ConfigError::NoGames)));

        let duplicate = GameCatalog::parse(
            "[[games]]\nid = \"a\"\n[[games]]\nid = \"a\"\n",
            Path::new("g.toml"),
        );
        assert!(matches!(duplicate, Err(ConfigError::DuplicateGame(id)) if id == "a"));

        let bad_default = GameCatalog::parse(
            "default_game = \"b\"\n[[games]]\nid = \"a\"\n",
            Path::new("g.toml"),
        );
        assert!(matches!(bad_default, Err(ConfigError::UnknownDefault(id)) if id == "b"));

        let malformed = GameCatalog::parse("[[games]\n", Path::new("g.toml"));
        assert!(matches!(malformed, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let result = GameCatalog::load(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn single_game_shortcut() {
        let catalog = GameCatalog::single(
            "survival",
            Some(PathBuf::from("/srv/run.sh")),
            Some(PathBuf::from("/srv")),
        );
        let spec = catalog.resolve(None, None).expect("resolve");
        assert_eq!(spec.program, PathBuf::from("/srv/run.sh"));
        assert_eq!(spec.working_dir, Some(PathBuf::from("/srv")));
        assert_eq!(catalog.default_game().map(GameConfig::display_name), Some("survival"));
    }

    #[test]
    fn builds_config_from_flags() {
        let args = Args::parse_from([
            "warden-supervisor",
            "--addr",
            "0.0.0.0:9000",
            "--game-id",
            "arena",
            "--script",
            "/srv/arena.sh",
            "--buffer-capacity",
            "50",
            "--subscriber-backlog",
            "8",
            "--stop-grace",
            "3",
            "--on-shutdown",
            "detach",
            "--ready-on-spawn",
            "--debug",
            "--log-dir",
            "/tmp/warden-logs",
        ]);
        let config = build_config(args).expect("config");
        assert_eq!(config.addr, "0.0.0.0:9000");
        assert_eq!(config.log_dir, "/tmp/warden-logs");
        assert_eq!(config.hub.buffer_capacity, 50);
        assert_eq!(config.hub.subscriber_backlog, 8);
        assert_eq!(config.supervisor.stop_grace, Duration::from_secs(3));
        assert!(config.supervisor.ready_on_spawn);
        assert_eq!(config.shutdown, ShutdownPolicy::Detach);
        assert_eq!(
            config.supervisor.output_log,
            Some(PathBuf::from("/tmp/warden-logs/server-output.log"))
        );
        assert_eq!(config.log_level, "debug");
        let spec = config.launch_spec(None, None).expect("launch spec");
        assert_eq!(spec.game_id, "arena");
        assert_eq!(spec.program, PathBuf::from("/srv/arena.sh"));
    }

    #[test]
    fn stop_policy_keeps_output_piped() {
        let args = Args::parse_from(["warden-supervisor", "--on-shutdown", "stop"]);
        let config = build_config(args).expect("config");
        assert_eq!(config.supervisor.output_log, None);
    }

    #[test]
    fn detached_output_without_log_dir_lands_in_temp_dir() {
        let path = server_output_path(" ");
        assert!(path.starts_with(std::env::temp_dir()));
        assert_eq!(
            path.file_name().and_then(|name| name.to_str()),
            Some("warden-server-output.log")
        );
    }

    #[test]
    fn rejects_zero_backlog_and_bad_policy() {
        let args = Args::parse_from([
            "warden-supervisor",
            "--addr",
            "127.0.0.1:1",
            "--subscriber-backlog",
            "0",
        ]);
        assert!(matches!(
            build_config(args),
            Err(ConfigError::Invalid { flag: "--subscriber-backlog", .. })
        ));

        let args = Args::parse_from(["warden-supervisor", "--on-shutdown", "orphan"]);
        assert!(matches!(
            build_config(args),
            Err(ConfigError::Invalid { flag: "--on-shutdown", .. })
        ));
    }
}
