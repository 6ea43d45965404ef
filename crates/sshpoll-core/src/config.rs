//! Runtime configuration.
//!
//! Built once by the binary from flags and `SSHPOLL_*` environment variables,
//! then passed down by value. Nothing here is process-global.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TEMPLATE_DIR: &str = "templates";
pub const DEFAULT_INDEX_FILE: &str = "index";

pub const DEFAULT_INFLUX_HOST: &str = "127.0.0.1";
pub const DEFAULT_INFLUX_PORT: u16 = 8086;
pub const DEFAULT_INFLUX_DATABASE: &str = "db_name";
pub const DEFAULT_INFLUX_USER: &str = "root";
pub const DEFAULT_INFLUX_PASSWORD: &str = "root";

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the pool needs besides the task list.
#[derive(Debug, Clone, Default)]
pub struct PollerConfig {
    pub templates: TemplateConfig,
    pub influx: InfluxConfig,
    pub session: SessionConfig,
}

/// Where templates live. `index_file` is resolved against `template_dir`
/// unless absolute.
#[derive(Debug, Clone)]
pub struct TemplateConfig {
    pub template_dir: PathBuf,
    pub index_file: PathBuf,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            template_dir: PathBuf::from(DEFAULT_TEMPLATE_DIR),
            index_file: PathBuf::from(DEFAULT_INDEX_FILE),
        }
    }
}

impl TemplateConfig {
    pub fn index_path(&self) -> PathBuf {
        self.template_dir.join(&self.index_file)
    }
}

/// InfluxDB connection settings.
#[derive(Clone)]
pub struct InfluxConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_INFLUX_HOST.to_string(),
            port: DEFAULT_INFLUX_PORT,
            database: DEFAULT_INFLUX_DATABASE.to_string(),
            username: DEFAULT_INFLUX_USER.to_string(),
            password: DEFAULT_INFLUX_PASSWORD.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl InfluxConfig {
    /// Write endpoint with second precision.
    pub fn write_url(&self) -> String {
        format!(
            "http://{}:{}/write?db={}&precision=s",
            self.host, self.port, self.database
        )
    }
}

impl std::fmt::Debug for InfluxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Transport settings for [`OpenSshConnector`](crate::session::OpenSshConnector).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ssh_binary: String,
    pub sshpass_binary: String,
    /// Upper bound on waiting for one command's response.
    pub command_timeout: Duration,
    pub connect_timeout: Duration,
    /// Output silence after which a prompt-looking line is adopted as the
    /// new prompt while priming.
    pub prompt_settle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            sshpass_binary: "sshpass".to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            prompt_settle: Duration::from_millis(500),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PollerConfig::default();
        assert_eq!(config.templates.index_path(), PathBuf::from("templates/index"));
        assert_eq!(
            config.influx.write_url(),
            "http://127.0.0.1:8086/write?db=db_name&precision=s"
        );
        assert_eq!(config.session.command_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_absolute_index_file() {
        let templates = TemplateConfig {
            template_dir: PathBuf::from("templates"),
            index_file: PathBuf::from("/etc/sshpoll/index"),
        };
        assert_eq!(templates.index_path(), PathBuf::from("/etc/sshpoll/index"));
    }

    #[test]
    fn test_influx_debug_hides_password() {
        let influx = InfluxConfig {
            password: "s3cret".into(),
            ..InfluxConfig::default()
        };
        assert!(!format!("{:?}", influx).contains("s3cret"));
    }
}
