//! Layered daemon configuration
//!
//! Sources, lowest priority first:
//! 1. built-in `config/default.toml`
//! 2. optional TOML file (`--config` / `FRESHET_CONFIG`)
//! 3. `FRESHET__SECTION__KEY` environment variables

use anyhow::{anyhow, bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use freshet_core::application::{SchedulerConfig, Ttl, TtlTable};
use freshet_core::domain::DataDomain;
use freshet_core::port::MaintenanceConfig;
use freshet_infra_system::CommandSpec;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

const ENV_PREFIX: &str = "FRESHET";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub entities: Vec<String>,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub ttl: HashMap<String, String>,
    pub maintenance: MaintenanceSettings,
    pub diagnostics: DiagnosticsSettings,
    pub fetchers: FetcherSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    pub format: LogFormat,
    pub filter: String,
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_concurrent: usize,
    pub heavy_job_limit: usize,
    pub startup_delay_secs: u64,
    pub startup_chunk_size: usize,
    pub startup_chunk_pause_secs: u64,
    pub batch_size: usize,
    pub tick_deadline_secs: u64,
    pub drain_timeout_secs: u64,
    pub template_version: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceSettings {
    pub interval_hours: u64,
    pub retention_days: i64,
    pub max_db_size_mb: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosticsSettings {
    pub interval_secs: u64,
    pub history_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetcherSettings {
    #[serde(default)]
    pub env_allowlist: Vec<String>,
    #[serde(default)]
    pub commands: HashMap<String, CommandSpec>,
    pub documents: Option<DocumentPipelineSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentPipelineSettings {
    pub list: CommandSpec,
    pub load: CommandSpec,
    pub summarize: CommandSpec,
}

impl Settings {
    /// Load and validate settings from every source
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));

        if let Some(path) = config_file {
            if !path.exists() {
                bail!("Configuration file not found: {}", path.display());
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        self.scheduler_config()?;
        self.ttl_table()?;
        for domain in self.fetchers.commands.keys() {
            parse_domain(domain)?;
        }
        if self.diagnostics.history_limit == 0 {
            bail!("diagnostics.history_limit must be > 0");
        }
        Ok(())
    }

    /// sqlx connection URL with `~` and `$VARS` expanded
    pub fn database_url(&self) -> Result<String> {
        if self.database.path == ":memory:" {
            return Ok("sqlite::memory:".to_string());
        }
        Ok(format!("sqlite://{}", self.database_path()?.display()))
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        expand_path(&self.database.path)
    }

    pub fn log_dir(&self) -> Result<Option<PathBuf>> {
        self.logging.dir.as_deref().map(expand_path).transpose()
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        let s = &self.scheduler;
        let config = SchedulerConfig {
            interval: Duration::from_secs(s.interval_secs),
            enabled: s.enabled,
            max_concurrent: s.max_concurrent,
            heavy_job_limit: s.heavy_job_limit,
            startup_delay: Duration::from_secs(s.startup_delay_secs),
            startup_chunk_size: s.startup_chunk_size,
            startup_chunk_pause: Duration::from_secs(s.startup_chunk_pause_secs),
            batch_size: s.batch_size,
            tick_deadline: Duration::from_secs(s.tick_deadline_secs),
            drain_timeout: Duration::from_secs(s.drain_timeout_secs),
            template_version: s.template_version,
        };
        config.validate().context("Invalid [scheduler] settings")?;
        Ok(config)
    }

    /// Domains set to "off" are left out and never scheduled
    pub fn ttl_table(&self) -> Result<TtlTable> {
        let mut table = TtlTable::new([]);
        for (name, value) in &self.ttl {
            let domain = parse_domain(name)?;
            if let Some(ttl) =
                parse_ttl(value).with_context(|| format!("Invalid ttl for {}", name))?
            {
                table.set(domain, ttl);
            }
        }
        Ok(table)
    }

    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            retention_days: self.maintenance.retention_days,
            max_db_size_mb: self.maintenance.max_db_size_mb,
        }
    }
}

pub fn parse_domain(name: &str) -> Result<DataDomain> {
    name.parse()
        .map_err(|e| anyhow!("{} (known: price, fundamentals, documents, document_summaries, ai_timeline, signals)", e))
}

/// `"15m"` -> every 15 minutes, `"permanent"`, `"off"` -> not scheduled
pub fn parse_ttl(value: &str) -> Result<Option<Ttl>> {
    let value = value.trim().to_lowercase();
    match value.as_str() {
        "off" => return Ok(None),
        "permanent" => return Ok(Some(Ttl::Permanent)),
        _ => {}
    }

    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow!("missing unit in '{}' (use s, m, h or d)", value))?;
    let (number, unit) = value.split_at(split);
    let n: u64 = number
        .parse()
        .with_context(|| format!("invalid number in '{}'", value))?;
    if n == 0 {
        bail!("ttl must be > 0 (use \"off\" to disable a domain)");
    }

    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86_400,
        other => bail!("unknown ttl unit '{}'", other),
    };
    Ok(Some(Ttl::Every(Duration::from_secs(secs))))
}

fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(path).with_context(|| format!("Cannot expand path {}", path))?;
    Ok(PathBuf::from(expanded.into_owned()))
}
