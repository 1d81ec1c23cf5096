//! Decides how many items go into one SLURM job and how many of them run
//! at the same time.

use fractal_core::errors::InvalidBatchingRequest;
use fractal_core::model::{BatchingPlan, ClusterLimits, ExplicitPlan, ResourceRequest};

fn ceil_div(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}

/// How many items fit side by side under the given per-job caps. Never 0.
fn parallel_items(resources: &ResourceRequest, cpus_limit: u32, mem_limit_mb: u64) -> usize {
    let by_cpu = (cpus_limit / resources.cpus_per_item) as usize;
    let by_mem = (mem_limit_mb / resources.mem_per_item_mb) as usize;
    by_cpu.min(by_mem).max(1)
}

fn check_inputs(
    total_items: usize,
    resources: &ResourceRequest,
    limits: &ClusterLimits,
) -> Result<(), InvalidBatchingRequest> {
    if total_items == 0 {
        return Err(InvalidBatchingRequest(
            "cannot plan batches for zero items".to_string(),
        ));
    }
    if resources.cpus_per_item == 0 || resources.mem_per_item_mb == 0 {
        return Err(InvalidBatchingRequest(format!(
            "per-item resources must be positive (cpus={}, mem={}MB)",
            resources.cpus_per_item, resources.mem_per_item_mb
        )));
    }
    if limits.target_cpus_per_job == 0
        || limits.max_cpus_per_job == 0
        || limits.target_mem_per_job_mb == 0
        || limits.max_mem_per_job_mb == 0
        || limits.target_num_jobs == 0
        || limits.max_num_jobs == 0
    {
        return Err(InvalidBatchingRequest(format!(
            "cluster limits must be positive: {:?}",
            limits
        )));
    }
    Ok(())
}

fn validate_explicit(
    total_items: usize,
    items_per_job: usize,
    parallel_items_per_job: usize,
    resources: &ResourceRequest,
    limits: &ClusterLimits,
) -> Result<BatchingPlan, InvalidBatchingRequest> {
    if items_per_job == 0 || parallel_items_per_job == 0 {
        return Err(InvalidBatchingRequest(format!(
            "items_per_job ({}) and parallel_items_per_job ({}) must be positive",
            items_per_job, parallel_items_per_job
        )));
    }

    let mut parallel = parallel_items_per_job;
    if parallel > items_per_job {
        tracing::info!(
            "parallel_items_per_job ({}) exceeds items_per_job ({}); clamping to {}",
            parallel,
            items_per_job,
            items_per_job
        );
        parallel = items_per_job;
    }

    let cpus_per_job = parallel as u64 * resources.cpus_per_item as u64;
    let mem_per_job_mb = parallel as u64 * resources.mem_per_item_mb;
    if cpus_per_job > limits.max_cpus_per_job as u64 {
        return Err(InvalidBatchingRequest(format!(
            "{} parallel items x {} cpus = {} cpus per job exceeds max-cpus-per-job ({})",
            parallel, resources.cpus_per_item, cpus_per_job, limits.max_cpus_per_job
        )));
    }
    if cpus_per_job > limits.target_cpus_per_job as u64 {
        tracing::warn!(
            "{} cpus per job exceeds target-cpus-per-job ({})",
            cpus_per_job,
            limits.target_cpus_per_job
        );
    }
    if mem_per_job_mb > limits.max_mem_per_job_mb {
        return Err(InvalidBatchingRequest(format!(
            "{} parallel items x {}MB = {}MB per job exceeds max-mem-per-job-mb ({})",
            parallel, resources.mem_per_item_mb, mem_per_job_mb, limits.max_mem_per_job_mb
        )));
    }
    if mem_per_job_mb > limits.target_mem_per_job_mb {
        tracing::warn!(
            "{}MB per job exceeds target-mem-per-job-mb ({})",
            mem_per_job_mb,
            limits.target_mem_per_job_mb
        );
    }

    let num_jobs = ceil_div(total_items, items_per_job);
    if num_jobs > limits.max_num_jobs {
        return Err(InvalidBatchingRequest(format!(
            "{} items at {} per job needs {} jobs, more than max-num-jobs ({})",
            total_items, items_per_job, num_jobs, limits.max_num_jobs
        )));
    }
    if num_jobs > limits.target_num_jobs {
        tracing::warn!(
            "{} jobs exceeds target-num-jobs ({})",
            num_jobs,
            limits.target_num_jobs
        );
    }

    Ok(BatchingPlan {
        items_per_job,
        parallel_items_per_job: parallel,
    })
}

/// Computes the batching plan for `total_items` items.
///
/// An explicit plan is validated and returned (with parallelism clamped to
/// the batch size). Otherwise the first of these that fits wins: target
/// limits without in-job queuing, max limits without queuing, and finally
/// max limits with as many items per job as needed to stay within
/// `max_num_jobs`.
pub fn plan(
    total_items: usize,
    resources: &ResourceRequest,
    limits: &ClusterLimits,
    explicit: &ExplicitPlan,
) -> Result<BatchingPlan, InvalidBatchingRequest> {
    check_inputs(total_items, resources, limits)?;

    match (explicit.items_per_job, explicit.parallel_items_per_job) {
        (Some(items_per_job), Some(parallel)) => {
            return validate_explicit(total_items, items_per_job, parallel, resources, limits);
        }
        (None, None) => {}
        (items_per_job, parallel) => {
            return Err(InvalidBatchingRequest(format!(
                "items_per_job ({:?}) and parallel_items_per_job ({:?}) must be given together",
                items_per_job, parallel
            )));
        }
    }

    if resources.cpus_per_item > limits.max_cpus_per_job
        || resources.mem_per_item_mb > limits.max_mem_per_job_mb
    {
        tracing::warn!(
            "A single item ({} cpus, {}MB) exceeds the per-job maximum ({} cpus, {}MB); running one item at a time",
            resources.cpus_per_item,
            resources.mem_per_item_mb,
            limits.max_cpus_per_job,
            limits.max_mem_per_job_mb
        );
    }

    // Targets never loosen the hard limits.
    let target_parallel = parallel_items(
        resources,
        limits.target_cpus_per_job.min(limits.max_cpus_per_job),
        limits.target_mem_per_job_mb.min(limits.max_mem_per_job_mb),
    )
    .min(total_items);
    let target_jobs = limits.target_num_jobs.min(limits.max_num_jobs);
    if ceil_div(total_items, target_parallel) <= target_jobs {
        return Ok(BatchingPlan {
            items_per_job: target_parallel,
            parallel_items_per_job: target_parallel,
        });
    }

    let max_parallel = parallel_items(
        resources,
        limits.max_cpus_per_job,
        limits.max_mem_per_job_mb,
    )
    .min(total_items);
    if ceil_div(total_items, max_parallel) <= limits.max_num_jobs {
        return Ok(BatchingPlan {
            items_per_job: max_parallel,
            parallel_items_per_job: max_parallel,
        });
    }

    let items_per_job = ceil_div(total_items, limits.max_num_jobs);
    tracing::info!(
        "Queuing {} items per job ({} in parallel) to stay within {} jobs",
        items_per_job,
        max_parallel.min(items_per_job),
        limits.max_num_jobs
    );
    Ok(BatchingPlan {
        items_per_job,
        parallel_items_per_job: max_parallel.min(items_per_job),
    })
}

/// Order-preserving split into consecutive batches of at most
/// `items_per_job` elements.
pub fn split_into_batches<T: Clone>(items: &[T], items_per_job: usize) -> Vec<Vec<T>> {
    items
        .chunks(items_per_job.max(1))
        .map(<[T]>::to_vec)
        .collect()
}
