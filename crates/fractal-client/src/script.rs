//! Renders the batch script submitted for one job.

use crate::error::{ClientError, Result};
use crate::files::JobFiles;
use crate::targets::common::shell_quote;
use fractal_core::config::{find_account_directive, SlurmSettings};
use fractal_core::constants::{
    slurm::{DIRECTIVE, SRUN},
    worker::{INPUT_FLAG, OUTPUT_FLAG},
};
use fractal_core::errors::ConfigError;
use fractal_core::model::ResourceRequest;
use std::fmt::Write as _;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SbatchDirectives {
    pub job_name: String,
    pub partition: Option<String>,
    pub ntasks: usize,
    pub cpus_per_task: u32,
    pub mem_mb: u64,
    pub time: Option<String>,
    pub account: Option<String>,
    pub qos: Option<String>,
    pub constraint: Option<String>,
    pub gres: Option<String>,
    pub output: String,
    pub error: String,
    pub extra_lines: Vec<String>,
}

impl SbatchDirectives {
    /// Sized so that `parallel` items can run side by side.
    pub fn for_job(
        settings: &SlurmSettings,
        resources: &ResourceRequest,
        parallel: usize,
        files: &JobFiles,
    ) -> Self {
        Self {
            job_name: format!("{}-{}", settings.job_name_prefix, files.prefix),
            partition: settings.partition.clone(),
            ntasks: parallel,
            cpus_per_task: resources.cpus_per_item,
            mem_mb: resources.mem_per_item_mb * parallel as u64,
            time: settings.time.clone(),
            account: settings.account.clone(),
            qos: settings.qos.clone(),
            constraint: settings.constraint.clone(),
            gres: settings.gres.clone(),
            output: files.stdout_remote.to_string_lossy().to_string(),
            error: files.stderr_remote.to_string_lossy().to_string(),
            extra_lines: settings.extra_lines.clone(),
        }
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut opts = vec![format!("--job-name={}", self.job_name)];
        if let Some(p) = &self.partition {
            opts.push(format!("--partition={}", p));
        }
        opts.push(format!("--ntasks={}", self.ntasks));
        opts.push(format!("--cpus-per-task={}", self.cpus_per_task));
        opts.push(format!("--mem={}M", self.mem_mb));
        if let Some(t) = &self.time {
            opts.push(format!("--time={}", t));
        }
        if let Some(a) = &self.account {
            opts.push(format!("--account={}", a));
        }
        if let Some(q) = &self.qos {
            opts.push(format!("--qos={}", q));
        }
        if let Some(c) = &self.constraint {
            opts.push(format!("--constraint={}", c));
        }
        if let Some(g) = &self.gres {
            opts.push(format!("--gres={}", g));
        }
        opts.push(format!("--output={}", self.output));
        opts.push(format!("--error={}", self.error));
        opts
    }

    pub fn to_lines(&self) -> Result<Vec<String>> {
        if let Some(line) = find_account_directive(&self.extra_lines) {
            return Err(ClientError::Config(ConfigError::General(format!(
                "Refusing to set the account through extra lines ('{}')",
                line
            ))));
        }
        let mut lines: Vec<String> = self
            .to_args()
            .into_iter()
            .map(|arg| format!("{} {}", DIRECTIVE, arg))
            .collect();
        lines.extend(self.extra_lines.iter().map(|l| l.trim().to_string()));
        Ok(lines)
    }
}

/// Everything needed to render one job script.
pub struct JobScript<'a> {
    pub settings: &'a SlurmSettings,
    pub directives: SbatchDirectives,
    pub worker_command: &'a str,
    pub resources: ResourceRequest,
    pub parallel: usize,
    pub files: &'a JobFiles,
}

impl JobScript<'_> {
    fn worker_line(&self, input: &str, output: &str) -> String {
        let mut line = String::new();
        if self.settings.use_srun {
            let _ = write!(
                line,
                "{} --ntasks=1 --cpus-per-task={} --mem={}M --exact ",
                SRUN, self.resources.cpus_per_item, self.resources.mem_per_item_mb
            );
        }
        let _ = write!(
            line,
            "{} {} {} {} {} &",
            self.worker_command,
            INPUT_FLAG,
            shell_quote(input),
            OUTPUT_FLAG,
            shell_quote(output)
        );
        line
    }

    /// Items appear in batch order. Every worker is backgrounded behind a
    /// throttle that keeps at most `parallel` of them running, and the
    /// script waits for all of them before exiting.
    pub fn render(&self) -> Result<String> {
        let mut script = String::new();
        let _ = writeln!(script, "{}", self.settings.shebang);
        for line in self.directives.to_lines()? {
            let _ = writeln!(script, "{}", line);
        }
        let _ = writeln!(script);

        if !self.settings.exports.is_empty() {
            for (name, value) in &self.settings.exports {
                let _ = writeln!(script, "export {}={}", name, shell_quote(value));
            }
            let _ = writeln!(script);
        }

        // `wait -n` needs bash 4.3; its status is that of the finished
        // worker, which says nothing about the throttle.
        let _ = writeln!(script, "case \"${{BASH_VERSION:-}}\" in");
        let _ = writeln!(
            script,
            "    [5-9].*|4.[3-9]*) fractal_wait_one() {{ wait -n 2>/dev/null; true; }} ;;"
        );
        let _ = writeln!(script, "    *) fractal_wait_one() {{ sleep 1; }} ;;");
        let _ = writeln!(script, "esac");
        let _ = writeln!(script, "fractal_throttle() {{");
        let _ = writeln!(
            script,
            "    while [ \"$(jobs -rp | wc -l)\" -ge {} ]; do",
            self.parallel.max(1)
        );
        let _ = writeln!(script, "        fractal_wait_one");
        let _ = writeln!(script, "    done");
        let _ = writeln!(script, "}}");
        let _ = writeln!(script);

        for item in &self.files.items {
            let _ = writeln!(script, "fractal_throttle");
            let _ = writeln!(
                script,
                "{}",
                self.worker_line(
                    &item.request_remote.to_string_lossy(),
                    &item.response_remote.to_string_lossy(),
                )
            );
        }
        let _ = writeln!(script, "wait");
        Ok(script)
    }
}
