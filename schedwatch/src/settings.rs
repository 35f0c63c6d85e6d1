use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

pub const DEFAULT_SERVER_ADDRESS: &str = "0.0.0.0:8080";
pub const DEFAULT_PPROF_ADDRESS: &str = "0.0.0.0:6060";
pub const DEFAULT_EVENT_LOG_PATH: &str = "./log/sched_events.log";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BpfSettings {
    /// Compiled scheduler object to load.
    #[serde(default)]
    pub object: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BtfSettings {
    /// Kernel BTF file. Empty means the running kernel's `/sys/kernel/btf/vmlinux`.
    #[serde(default)]
    pub kernel: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_server_address")]
    pub address: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: default_server_address(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PprofSettings {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_pprof_address")]
    pub address: String,
}

impl Default for PprofSettings {
    fn default() -> Self {
        Self {
            enable: false,
            address: default_pprof_address(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    File,
    #[default]
    Stdout,
    Kafka,
    Clickhouse,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileSettings {
    #[serde(default = "default_event_log_path")]
    pub path: PathBuf,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            path: default_event_log_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KafkaSettings {
    #[serde(default)]
    pub brokers: Vec<String>,
    #[serde(default)]
    pub topic: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClickHouseSettings {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub create_table: bool,
}

impl ClickHouseSettings {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct OutputSettings {
    #[serde(default, rename = "type")]
    pub output_type: OutputType,
    #[serde(default)]
    pub file: FileSettings,
    #[serde(default)]
    pub kafka: KafkaSettings,
    #[serde(default)]
    pub clickhouse: ClickHouseSettings,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub bpf: BpfSettings,
    #[serde(default)]
    pub btf: BtfSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub pprof: PprofSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

fn default_server_address() -> String {
    DEFAULT_SERVER_ADDRESS.to_string()
}

fn default_pprof_address() -> String {
    DEFAULT_PPROF_ADDRESS.to_string()
}

fn default_event_log_path() -> PathBuf {
    PathBuf::from(DEFAULT_EVENT_LOG_PATH)
}

impl Settings {
    /// Load settings from an optional YAML file, then `SCHEDWATCH_*`
    /// environment variables (`__` separates nesting levels).
    pub fn new(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        let s = builder
            .add_source(
                Environment::with_prefix("SCHEDWATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("output.kafka.brokers")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bpf.object.as_os_str().is_empty() {
            return Err(ConfigError::Message("bpf.object must be set".into()));
        }

        match self.output.output_type {
            OutputType::Kafka => {
                let kafka = &self.output.kafka;
                if kafka.brokers.iter().all(|b| b.trim().is_empty()) {
                    return Err(ConfigError::Message(
                        "output.kafka.brokers needs at least one broker".into(),
                    ));
                }
                if kafka.topic.trim().is_empty() {
                    return Err(ConfigError::Message("output.kafka.topic must be set".into()));
                }
            }
            OutputType::Clickhouse => {
                let clickhouse = &self.output.clickhouse;
                if clickhouse.host.trim().is_empty() || clickhouse.port.trim().is_empty() {
                    return Err(ConfigError::Message(
                        "output.clickhouse.host and output.clickhouse.port must be set".into(),
                    ));
                }
            }
            OutputType::File | OutputType::Stdout => {}
        }
        Ok(())
    }

    /// Kernel BTF source, `None` for the running kernel's.
    pub fn kernel_btf(&self) -> Option<&str> {
        let kernel = self.btf.kernel.trim();
        (!kernel.is_empty()).then_some(kernel)
    }
}
