use serde::Serialize;
use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use tracing::{error, info};

use super::layout::timestamp;
use crate::config::OverrideSet;
use crate::error::{ExpError, Result};

/// One resolved override combination submitted to the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub index: usize,
    pub overrides: OverrideSet,
}

impl Job {
    /// Sorted, space-joined overrides. Identical override sets share an
    /// identity no matter which index or worker they land on.
    pub fn id(&self) -> String {
        let mut parts: Vec<String> = self.overrides.iter().map(ToString::to_string).collect();
        parts.sort();
        parts.join(" ")
    }
}

#[derive(Serialize)]
struct JobRecord {
    index: usize,
    id: String,
    overrides: Vec<String>,
}

/// Runs one task per job, sequentially or on a fixed-size worker pool.
///
/// Results always come back in job index order. A failing or panicking job
/// yields an `Err` in its own slot and does not stop its siblings.
#[derive(Debug, Clone)]
pub struct Launcher {
    ncpu: usize,
    dispatch_root: PathBuf,
}

impl Launcher {
    pub fn new(ncpu: usize, dispatch_root: impl Into<PathBuf>) -> Self {
        Self {
            ncpu,
            dispatch_root: dispatch_root.into(),
        }
    }

    pub fn ncpu(&self) -> usize {
        self.ncpu
    }

    pub fn launch<T, F>(&self, job_overrides: Vec<OverrideSet>, task: F) -> Result<Vec<Result<T>>>
    where
        T: Send,
        F: Fn(&Job) -> Result<T> + Sync,
    {
        let sweep_dir = self.dispatch_root.join(timestamp());
        fs::create_dir_all(&sweep_dir)?;
        info!("Launching {} jobs locally", job_overrides.len());

        let jobs: Vec<Job> = job_overrides
            .into_iter()
            .enumerate()
            .map(|(index, overrides)| Job { index, overrides })
            .collect();
        for job in &jobs {
            record_job(&sweep_dir, job)?;
        }

        if self.ncpu <= 1 || jobs.len() <= 1 {
            return Ok(jobs.iter().map(|job| run_task(&task, job)).collect());
        }
        Ok(self.launch_pool(&jobs, &task))
    }

    fn launch_pool<T, F>(&self, jobs: &[Job], task: &F) -> Vec<Result<T>>
    where
        T: Send,
        F: Fn(&Job) -> Result<T> + Sync,
    {
        let workers = self.ncpu.min(jobs.len());
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                scope.spawn(move || loop {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    let Some(job) = jobs.get(i) else { break };
                    if tx.send((job.index, run_task(task, job))).is_err() {
                        break;
                    }
                });
            }
        });
        drop(tx);

        let mut runs: Vec<(usize, Result<T>)> = rx.into_iter().collect();
        runs.sort_by_key(|(index, _)| *index);
        runs.into_iter().map(|(_, ret)| ret).collect()
    }
}

fn record_job(sweep_dir: &Path, job: &Job) -> Result<()> {
    let record = JobRecord {
        index: job.index,
        id: job.id(),
        overrides: job.overrides.iter().map(ToString::to_string).collect(),
    };
    fs::write(
        sweep_dir.join(format!("job_{}.yaml", job.index)),
        serde_yaml::to_string(&record)?,
    )?;
    Ok(())
}

fn run_task<T, F>(task: &F, job: &Job) -> Result<T>
where
    F: Fn(&Job) -> Result<T>,
{
    info!("\t#{} : {}", job.index, job.id());
    let ret = panic::catch_unwind(AssertUnwindSafe(|| task(job))).unwrap_or_else(|payload| {
        Err(ExpError::JobPanicked {
            index: job.index,
            message: panic_message(payload.as_ref()),
        })
    });
    if let Err(e) = &ret {
        error!("Job #{} failed: {e}", job.index);
    }
    ret
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Override;
    use std::time::Duration;
    use tempfile::TempDir;

    fn sets(n: usize) -> Vec<OverrideSet> {
        (0..n)
            .map(|i| vec![Override::new("b", "x"), Override::new("a", i.to_string())])
            .collect()
    }

    fn slow_square(job: &Job) -> Result<usize> {
        // later jobs finish first so pool scheduling would scramble the order
        thread::sleep(Duration::from_millis(((8 - job.index.min(8)) * 3) as u64));
        Ok(job.index * job.index)
    }

    #[test]
    fn job_id_is_sorted_and_space_joined() {
        let job = Job {
            index: 3,
            overrides: vec![Override::new("z", "1"), Override::new("a", "2")],
        };
        assert_eq!(job.id(), "a=2 z=1");
    }

    #[test]
    fn pool_preserves_index_order() {
        let tmp = TempDir::new().unwrap();
        let sequential = Launcher::new(1, tmp.path())
            .launch(sets(8), slow_square)
            .unwrap();
        let pooled = Launcher::new(4, tmp.path())
            .launch(sets(8), slow_square)
            .unwrap();
        let seq: Vec<usize> = sequential.into_iter().map(|r| r.unwrap()).collect();
        let par: Vec<usize> = pooled.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(seq, vec![0, 1, 4, 9, 16, 25, 36, 49]);
        assert_eq!(seq, par);
    }

    #[test]
    fn failing_job_does_not_abort_siblings() {
        let tmp = TempDir::new().unwrap();
        let results = Launcher::new(3, tmp.path())
            .launch(sets(4), |job| {
                if job.index == 1 {
                    panic!("boom");
                }
                if job.index == 2 {
                    return Err(ExpError::configuration("bad job"));
                }
                Ok(job.index)
            })
            .unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(*results[0].as_ref().unwrap(), 0);
        assert!(matches!(
            results[1],
            Err(ExpError::JobPanicked { index: 1, ref message }) if message == "boom"
        ));
        assert!(results[2].is_err());
        assert_eq!(*results[3].as_ref().unwrap(), 3);
    }

    #[test]
    fn sweep_directory_records_jobs() {
        let tmp = TempDir::new().unwrap();
        Launcher::new(1, tmp.path())
            .launch(sets(2), |job| Ok(job.index))
            .unwrap();
        let sweeps: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(sweeps.len(), 1);
        let sweep = sweeps.into_iter().next().unwrap().unwrap().path();
        let record = fs::read_to_string(sweep.join("job_1.yaml")).unwrap();
        assert!(record.contains("a=1 b=x"));
    }
}
