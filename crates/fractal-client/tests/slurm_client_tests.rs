use fractal_client::targets::{CommandRunner, FileOps, TargetInfo};
use fractal_client::{ClientError, JobState, Result, SlurmClient};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Answers scheduler commands from a fixed table and records every call.
#[derive(Default)]
struct ScriptedTarget {
    known: Vec<(&'static str, &'static str)>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTarget {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl TargetInfo for ScriptedTarget {
    fn name(&self) -> &str {
        "scripted"
    }
}

impl CommandRunner for ScriptedTarget {
    fn run_command(&self, command: &str, args: &[&str]) -> Result<String> {
        let line = format!("{} {}", command, args.join(" "));
        self.calls.lock().unwrap().push(line.clone());
        let fail = |stderr: &str| ClientError::TargetCommandFailed {
            target: "scripted".into(),
            command: line.clone(),
            code: "1".into(),
            stderr: stderr.into(),
        };
        match command {
            "sbatch" => Ok("555;cluster\n".into()),
            "scancel" => Ok(String::new()),
            "sh" => Ok("556\n".into()),
            "squeue" => {
                let jobs = args
                    .iter()
                    .find_map(|a| a.strip_prefix("--jobs="))
                    .unwrap_or_default();
                let ids: Vec<&str> = jobs.split(',').collect();
                let mut out = String::new();
                for id in &ids {
                    match self.known.iter().find(|(k, _)| k == id) {
                        Some((k, state)) => out.push_str(&format!("{} {}\n", k, state)),
                        None => return Err(fail("slurm_load_jobs error: Invalid job id specified")),
                    }
                }
                Ok(out)
            }
            _ => Err(fail("unknown command")),
        }
    }
}

impl FileOps for ScriptedTarget {
    fn write_remote_file(&self, _path: &Path, _content: &str) -> Result<()> {
        Ok(())
    }

    fn read_remote_file(&self, _path: &Path) -> Result<Option<String>> {
        Ok(None)
    }

    fn remove_remote_files(&self, _paths: &[PathBuf]) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_submit_parses_cluster_suffixed_id() {
    let target = Arc::new(ScriptedTarget::default());
    let client = SlurmClient::new(target.clone(), Vec::new());
    let id = client.submit(Path::new("/wd/0_t/par-1.sbatch")).unwrap();
    assert_eq!(id, "555");
    assert_eq!(target.calls(), vec!["sbatch --parsable /wd/0_t/par-1.sbatch"]);
}

#[test]
fn test_pre_submission_commands_chain_before_sbatch() {
    let target = Arc::new(ScriptedTarget::default());
    let client = SlurmClient::new(
        target.clone(),
        vec!["module load python".into(), "source /env/activate".into()],
    );
    let id = client.submit(Path::new("/wd/job.sbatch")).unwrap();
    assert_eq!(id, "556");

    let calls = target.calls();
    assert_eq!(calls.len(), 1);
    let call = &calls[0];
    assert!(call.starts_with("sh -c "));
    let load = call.find("module load python").unwrap();
    let source = call.find("source /env/activate").unwrap();
    let sbatch = call.find("sbatch").unwrap();
    assert!(load < source && source < sbatch);
}

#[test]
fn test_query_falls_back_to_single_job_queries() {
    let target = Arc::new(ScriptedTarget {
        known: vec![("1", "RUNNING"), ("3", "COMPLETED")],
        ..ScriptedTarget::default()
    });
    let client = SlurmClient::new(target.clone(), Vec::new());

    let ids = vec!["1".to_string(), "2".to_string(), "3".to_string()];
    let states = client.query(&ids).unwrap();

    assert_eq!(states.len(), 2);
    assert_eq!(states["1"], JobState::Running);
    assert_eq!(states["3"], JobState::Completed);
    assert!(!states.contains_key("2"));
    // One batched attempt, then one call per job.
    assert_eq!(target.calls().len(), 4);
}

#[test]
fn test_cancel_is_a_single_call() {
    let target = Arc::new(ScriptedTarget::default());
    let client = SlurmClient::new(target.clone(), Vec::new());
    client
        .cancel(&["10".to_string(), "11".to_string(), "12".to_string()])
        .unwrap();
    assert_eq!(target.calls(), vec!["scancel 10 11 12"]);

    client.cancel(&[]).unwrap();
    assert_eq!(target.calls().len(), 1);
}
