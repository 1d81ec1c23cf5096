pub const ITEM_KEY_FIELD: &str = "zarr_url";

pub const SHUTDOWN_MESSAGE: &str = "Job cancelled due to executor shutdown.";

pub mod suffixes {
    pub const REQUEST: &str = "req.json";
    pub const RESPONSE: &str = "res.json";
    pub const LOG: &str = "log";
    pub const ARGS: &str = "args.json";
    pub const OUTPUT: &str = "out.json";
    pub const SCRIPT: &str = "sbatch";
    pub const STDOUT: &str = "out";
    pub const STDERR: &str = "err";
    pub const TMP: &str = "tmp";
}

pub mod prefixes {
    pub const NON_PARALLEL: &str = "non_par";
    pub const PARALLEL: &str = "par";
}

pub mod slurm {
    /// Placeholder that `sbatch` replaces with the job id in output paths.
    pub const JOB_ID_PLACEHOLDER: &str = "%j";
    pub const SBATCH: &str = "sbatch";
    pub const SQUEUE: &str = "squeue";
    pub const SCANCEL: &str = "scancel";
    pub const SRUN: &str = "srun";
    pub const DIRECTIVE: &str = "#SBATCH";
}

pub mod worker {
    pub const DEFAULT_COMMAND: &str = "fractal-worker";
    pub const INPUT_FLAG: &str = "--input-file";
    pub const OUTPUT_FLAG: &str = "--output-file";
    pub const LOG_TAIL_LINES: usize = 20;
}

pub mod env {
    pub const LOG_LEVEL: &str = "FRACTAL_LOG_LEVEL";
}
