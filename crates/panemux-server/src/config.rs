//! Server configuration: TOML file + CLI overrides.

use panemux_core::session::DEFAULT_MAX_BUFFER_SIZE;
use panemux_core::{BufferPolicy, MuxError, MuxResult, RegistryConfig, ShellCommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sessions: SessionsSection,
}

impl ConfigFile {
    pub fn parse(content: &str) -> MuxResult<Self> {
        toml::from_str(content).map_err(|e| MuxError::Config(format!("config parse error: {e}")))
    }
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// WebSocket relay port; 0 disables the relay.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local socket path; empty disables it.
    #[serde(default = "default_socket")]
    pub socket: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            socket: default_socket(),
        }
    }
}

/// `[sessions]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    #[serde(default)]
    pub buffer_policy: BufferPolicy,
    #[serde(default)]
    pub replay_delay_ms: u64,
    /// Seconds; 0 disables the idle sweep.
    #[serde(default)]
    pub idle_timeout: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub shell_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            max_buffer_size: default_max_buffer_size(),
            buffer_policy: BufferPolicy::default(),
            replay_delay_ms: 0,
            idle_timeout: 0,
            sweep_interval: default_sweep_interval(),
            shell: None,
            shell_args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7681
}
fn default_socket() -> String {
    "~/.panemux/panemux.sock".to_string()
}
fn default_max_buffer_size() -> usize {
    DEFAULT_MAX_BUFFER_SIZE
}
fn default_sweep_interval() -> u64 {
    60
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub socket: Option<String>,
    pub idle_timeout: Option<u64>,
    pub buffer_policy: Option<BufferPolicy>,
    pub shell: Option<String>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `None` when the WebSocket relay is disabled.
    pub ws_addr: Option<SocketAddr>,
    /// `None` when the local socket is disabled.
    pub socket_path: Option<PathBuf>,
    pub idle_timeout: Option<Duration>,
    pub sweep_interval: Duration,
    pub registry: RegistryConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> MuxResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    ConfigFile::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, cli)
    }

    pub fn resolve(file: ConfigFile, cli: CliOverrides) -> MuxResult<Self> {
        let ConfigFile { server, sessions } = file;

        let bind = cli.bind.unwrap_or(server.bind);
        let port = cli.port.unwrap_or(server.port);
        let ws_addr = if port == 0 {
            None
        } else {
            let ip: IpAddr = bind
                .parse()
                .map_err(|e| MuxError::Config(format!("invalid bind address {bind:?}: {e}")))?;
            Some(SocketAddr::new(ip, port))
        };

        let socket = cli.socket.unwrap_or(server.socket);
        let socket_path = (!socket.is_empty()).then(|| expand_tilde_str(&socket));

        if ws_addr.is_none() && socket_path.is_none() {
            return Err(MuxError::Config(
                "both the WebSocket relay and the local socket are disabled".into(),
            ));
        }

        let idle_timeout = cli.idle_timeout.unwrap_or(sessions.idle_timeout);
        let shell = cli
            .shell
            .or(sessions.shell)
            .filter(|s| !s.is_empty())
            .map(|program| ShellCommand::new(program, sessions.shell_args));

        Ok(Self {
            ws_addr,
            socket_path,
            idle_timeout: (idle_timeout > 0).then(|| Duration::from_secs(idle_timeout)),
            sweep_interval: Duration::from_secs(sessions.sweep_interval.max(1)),
            registry: RegistryConfig {
                max_buffer_size: sessions.max_buffer_size,
                buffer_policy: cli.buffer_policy.unwrap_or(sessions.buffer_policy),
                replay_delay: Duration::from_millis(sessions.replay_delay_ms),
                shell,
                env: sessions.env,
            },
        })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = ServerConfig::resolve(ConfigFile::default(), CliOverrides::default()).unwrap();
        assert_eq!(config.ws_addr, Some("127.0.0.1:7681".parse().unwrap()));
        assert!(config.socket_path.is_some());
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.registry.max_buffer_size, 100_000);
        assert_eq!(config.registry.buffer_policy, BufferPolicy::Always);
        assert!(config.registry.shell.is_none());
    }

    #[test]
    fn parses_full_file() {
        let file = ConfigFile::parse(
            r#"
            [server]
            bind = "0.0.0.0"
            port = 9000
            socket = ""

            [sessions]
            max_buffer_size = 2048
            buffer_policy = "while_attached"
            replay_delay_ms = 50
            idle_timeout = 600
            sweep_interval = 30
            shell = "/bin/zsh"
            shell_args = ["-l"]

            [sessions.env]
            EDITOR = "vim"
            "#,
        )
        .unwrap();
        let config = ServerConfig::resolve(file, CliOverrides::default()).unwrap();

        assert_eq!(config.ws_addr, Some("0.0.0.0:9000".parse().unwrap()));
        assert_eq!(config.socket_path, None);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.registry.max_buffer_size, 2048);
        assert_eq!(config.registry.buffer_policy, BufferPolicy::WhileAttached);
        assert_eq!(config.registry.replay_delay, Duration::from_millis(50));
        assert_eq!(
            config.registry.shell,
            Some(ShellCommand::new("/bin/zsh", vec!["-l".into()]))
        );
        assert_eq!(config.registry.env.get("EDITOR").map(String::as_str), Some("vim"));
    }

    #[test]
    fn cli_overrides_win() {
        let file = ConfigFile::parse("[server]\nport = 9000\n").unwrap();
        let cli = CliOverrides {
            port: Some(0),
            socket: Some("/tmp/pm.sock".into()),
            idle_timeout: Some(5),
            ..CliOverrides::default()
        };
        let config = ServerConfig::resolve(file, cli).unwrap();
        assert_eq!(config.ws_addr, None);
        assert_eq!(config.socket_path, Some(PathBuf::from("/tmp/pm.sock")));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            ConfigFile::parse("[sessions]\nbuffer_policy = \"sometimes\""),
            Err(MuxError::Config(_))
        ));

        let both_off = CliOverrides {
            port: Some(0),
            socket: Some(String::new()),
            ..CliOverrides::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), both_off).is_err());

        let bad_bind = CliOverrides {
            bind: Some("not an ip".into()),
            ..CliOverrides::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), bad_bind).is_err());
    }

    #[test]
    fn tilde_expansion() {
        let expanded = expand_tilde(Path::new("~/.panemux/config.toml"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join(".panemux/config.toml"));
        }
        assert_eq!(expand_tilde(Path::new("/etc/x")), PathBuf::from("/etc/x"));
    }
}
