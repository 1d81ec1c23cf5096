use crate::constants::worker::DEFAULT_COMMAND;
use crate::errors::ConfigError;
use crate::model::{ClusterLimits, ExplicitPlan, ResourceRequest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub runner: RunnerSettings,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub slurm: SlurmSettings,
    #[serde(default)]
    pub limits: ClusterLimits,
    #[serde(default)]
    pub local: LocalSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RunnerSettings {
    pub working_dir: PathBuf,
    #[serde(default)]
    pub job_working_dir: Option<PathBuf>,
    pub shutdown_file: PathBuf,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_query_every")]
    pub query_every: u32,
    #[serde(default = "default_output_retry_delay_ms")]
    pub output_retry_delay_ms: u64,
    #[serde(default)]
    pub keep_files: bool,
    #[serde(default = "default_worker_command")]
    pub worker_command: String,
    #[serde(default = "default_unseen_query_limit")]
    pub unseen_query_limit: u32,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_query_every() -> u32 {
    5
}

fn default_output_retry_delay_ms() -> u64 {
    1000
}

fn default_worker_command() -> String {
    DEFAULT_COMMAND.to_string()
}

fn default_unseen_query_limit() -> u32 {
    3
}

impl RunnerSettings {
    pub fn new(working_dir: impl Into<PathBuf>, shutdown_file: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            job_working_dir: None,
            shutdown_file: shutdown_file.into(),
            poll_interval_ms: default_poll_interval_ms(),
            query_every: default_query_every(),
            output_retry_delay_ms: default_output_retry_delay_ms(),
            keep_files: false,
            worker_command: default_worker_command(),
            unseen_query_limit: default_unseen_query_limit(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn output_retry_delay(&self) -> Duration {
        Duration::from_millis(self.output_retry_delay_ms)
    }

    pub fn job_working_dir(&self) -> &Path {
        self.job_working_dir.as_deref().unwrap_or(&self.working_dir)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TargetConfig {
    #[default]
    Local,
    Sudo {
        user: String,
    },
    Ssh {
        address: String,
    },
}

impl TargetConfig {
    pub fn name(&self) -> &'static str {
        match self {
            TargetConfig::Local => "local",
            TargetConfig::Sudo { .. } => "sudo",
            TargetConfig::Ssh { .. } => "ssh",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SlurmSettings {
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub qos: Option<String>,
    #[serde(default)]
    pub constraint: Option<String>,
    #[serde(default)]
    pub gres: Option<String>,
    #[serde(default = "default_job_name_prefix")]
    pub job_name_prefix: String,
    #[serde(default = "default_shebang")]
    pub shebang: String,
    #[serde(default)]
    pub extra_lines: Vec<String>,
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
    #[serde(default)]
    pub pre_submission_commands: Vec<String>,
    #[serde(default = "default_true")]
    pub use_srun: bool,
    #[serde(default = "default_cpus_per_item")]
    pub cpus_per_item: u32,
    #[serde(default = "default_mem_per_item_mb")]
    pub mem_per_item_mb: u64,
    #[serde(default)]
    pub items_per_job: Option<usize>,
    #[serde(default)]
    pub parallel_items_per_job: Option<usize>,
}

fn default_job_name_prefix() -> String {
    "fractal".to_string()
}

fn default_shebang() -> String {
    "#!/bin/bash".to_string()
}

fn default_true() -> bool {
    true
}

fn default_cpus_per_item() -> u32 {
    ResourceRequest::default().cpus_per_item
}

fn default_mem_per_item_mb() -> u64 {
    ResourceRequest::default().mem_per_item_mb
}

impl Default for SlurmSettings {
    fn default() -> Self {
        Self {
            partition: None,
            time: None,
            account: None,
            qos: None,
            constraint: None,
            gres: None,
            job_name_prefix: default_job_name_prefix(),
            shebang: default_shebang(),
            extra_lines: Vec::new(),
            exports: BTreeMap::new(),
            pre_submission_commands: Vec::new(),
            use_srun: true,
            cpus_per_item: default_cpus_per_item(),
            mem_per_item_mb: default_mem_per_item_mb(),
            items_per_job: None,
            parallel_items_per_job: None,
        }
    }
}

impl SlurmSettings {
    pub fn resource_request(&self) -> ResourceRequest {
        ResourceRequest {
            cpus_per_item: self.cpus_per_item,
            mem_per_item_mb: self.mem_per_item_mb,
        }
    }

    pub fn explicit_plan(&self) -> ExplicitPlan {
        ExplicitPlan {
            items_per_job: self.items_per_job,
            parallel_items_per_job: self.parallel_items_per_job,
        }
    }
}

/// Returns the offending line if `extra_lines` tries to set the account.
pub fn find_account_directive(extra_lines: &[String]) -> Option<&str> {
    extra_lines.iter().map(String::as_str).find(|line| {
        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix(crate::constants::slurm::DIRECTIVE) else {
            return false;
        };
        let rest = rest.trim_start();
        rest.starts_with("--account") || rest.starts_with("-A")
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LocalSettings {
    #[serde(default = "default_parallel_items")]
    pub parallel_items: usize,
}

fn default_parallel_items() -> usize {
    num_cpus::get()
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            parallel_items: default_parallel_items(),
        }
    }
}

fn expand_path(path: &Path) -> Result<PathBuf, ConfigError> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw).map_err(|e| ConfigError::PathExpansion {
        path: raw.to_string(),
        reason: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.as_ref()))
}

impl Config {
    pub fn new(runner: RunnerSettings) -> Self {
        Self {
            runner,
            target: TargetConfig::default(),
            slurm: SlurmSettings::default(),
            limits: ClusterLimits::default(),
            local: LocalSettings::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs_err::read_to_string(path).map_err(|e| ConfigError::PathIo {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.runner.working_dir = expand_path(&config.runner.working_dir)?;
        config.runner.shutdown_file = expand_path(&config.runner.shutdown_file)?;
        if let Some(dir) = &config.runner.job_working_dir {
            config.runner.job_working_dir = Some(expand_path(dir)?);
        }
        config.validate()?;
        tracing::debug!("Loaded runner configuration: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate().map_err(ConfigError::General)?;

        if self.runner.poll_interval_ms == 0 {
            return Err(ConfigError::General(
                "runner.poll-interval-ms must be positive".to_string(),
            ));
        }
        if self.runner.query_every == 0 {
            return Err(ConfigError::General(
                "runner.query-every must be positive".to_string(),
            ));
        }
        if self.runner.worker_command.trim().is_empty() {
            return Err(ConfigError::General(
                "runner.worker-command must not be empty".to_string(),
            ));
        }
        if self.slurm.cpus_per_item == 0 || self.slurm.mem_per_item_mb == 0 {
            return Err(ConfigError::General(
                "slurm.cpus-per-item and slurm.mem-per-item-mb must be positive".to_string(),
            ));
        }
        if let Some(line) = find_account_directive(&self.slurm.extra_lines) {
            return Err(ConfigError::General(format!(
                "slurm.extra-lines must not set the account ('{}'); use slurm.account instead",
                line
            )));
        }
        if self.local.parallel_items == 0 {
            return Err(ConfigError::General(
                "local.parallel-items must be positive".to_string(),
            ));
        }
        match &self.target {
            TargetConfig::Sudo { user } if user.trim().is_empty() => Err(ConfigError::General(
                "target.user must be set for mode 'sudo'".to_string(),
            )),
            TargetConfig::Ssh { address } if address.trim().is_empty() => Err(
                ConfigError::General("target.address must be set for mode 'ssh'".to_string()),
            ),
            _ => Ok(()),
        }
    }
}
