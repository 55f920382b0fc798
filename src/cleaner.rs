use std::collections::{BTreeMap, HashSet};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::client::DevpiOps;
use crate::package::Package;
use crate::version::release_order;

const INDEX_QUEUE_METRIC: &str = "devpi_web_whoosh_index_queue_size";

/// List the packages proposed for removal, keyed by index.
///
/// `index_spec` is either `user/index` or a bare `user`, the latter meaning
/// every index owned by that user. Each index appears in the result even
/// when nothing on it matched. The per-index sets are already trimmed by
/// the retention policy: with `keep_latest > 0` the newest `keep_latest`
/// releases stay out of the removal set.
pub fn list_packages_by_index<C: DevpiOps>(
    client: &mut C,
    index_spec: &str,
    package_spec: &str,
    only_dev: bool,
    version_filter: Option<&Regex>,
    keep_latest: usize,
) -> Result<BTreeMap<String, HashSet<Package>>> {
    let mut packages_by_index = BTreeMap::new();
    for index in target_indices(client, index_spec)? {
        let packages =
            list_packages_on_index(client, &index, package_spec, only_dev, version_filter)
                .with_context(|| format!("failed to list packages on `{index}`"))?;
        packages_by_index.insert(index, trim_latest(packages, keep_latest));
    }
    Ok(packages_by_index)
}

fn target_indices<C: DevpiOps>(client: &mut C, index_spec: &str) -> Result<Vec<String>> {
    if index_spec.contains('/') {
        Ok(vec![index_spec.to_string()])
    } else {
        Ok(client.list_indices(index_spec)?)
    }
}

fn list_packages_on_index<C: DevpiOps>(
    client: &mut C,
    index: &str,
    package_spec: &str,
    only_dev: bool,
    version_filter: Option<&Regex>,
) -> Result<HashSet<Package>> {
    client.use_index(index)?;

    let mut packages = HashSet::new();
    for line in client.list_artifacts(index, package_spec)? {
        if !(line.starts_with("http://") || line.starts_with("https://")) {
            // Informational output such as redirect notices, not an artifact.
            continue;
        }
        packages.insert(Package::from_url(&line)?);
    }

    Ok(packages
        .into_iter()
        .filter(|package| {
            package.index == index
                && (!only_dev || package.is_dev_release())
                && version_filter.is_none_or(|pattern| pattern.is_match(&package.version))
        })
        .collect())
}

/// Drop the `keep_latest` newest releases from the removal candidates.
fn trim_latest(packages: HashSet<Package>, keep_latest: usize) -> HashSet<Package> {
    if keep_latest == 0 {
        return packages;
    }
    let mut ordered: Vec<Package> = packages.into_iter().collect();
    ordered.sort_by(|a, b| release_order(&b.version, &a.version).then_with(|| a.cmp(b)));
    ordered.into_iter().skip(keep_latest).collect()
}

/// Tunables of the wait-for-sync poll. The defaults match what a production
/// devpi deployment tolerates; tests shrink the durations.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    /// Maximum age of the last replica sync report that still counts as
    /// healthy.
    pub replica_lag: Duration,
    /// Indexer queue depths at or above this many items count as backlogged.
    pub queue_limit: u64,
    pub poll_interval: Duration,
    /// Total time to wait before proceeding anyway.
    pub max_wait: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy {
            replica_lag: Duration::from_secs(60),
            queue_limit: 100,
            poll_interval: Duration::from_secs(10),
            max_wait: Duration::from_secs(1800),
        }
    }
}

/// Block until the server reports a recently synced replica and a mostly
/// drained indexer queue, or until `policy.max_wait` has elapsed.
///
/// Giving up is not an error: at some point we have to continue and accept
/// the extra load on a lagging deployment. Status-read faults do propagate.
pub fn wait_for_sync<C: DevpiOps>(client: &mut C, policy: &SyncPolicy) -> Result<()> {
    let start = Instant::now();
    loop {
        let status = client.get_json("/+status")?;
        let now = unix_now();
        let last_in_sync = status
            .pointer("/result/replica-in-sync-at")
            .and_then(as_epoch_seconds)
            .unwrap_or(now);
        let queue = match status.pointer("/result/metrics").and_then(Value::as_array) {
            Some(metrics) => index_queue_size(metrics),
            None => 0,
        };

        if last_in_sync > now - policy.replica_lag.as_secs_f64() && queue < policy.queue_limit {
            // Neither a lagging replica nor a backlogged indexer.
            return Ok(());
        }
        if start.elapsed() >= policy.max_wait {
            warn!(
                "server still catching up after {:?}, proceeding anyway",
                policy.max_wait
            );
            return Ok(());
        }
        debug!(last_in_sync, queue, "waiting for the server to catch up");
        thread::sleep(policy.poll_interval);
    }
}

/// Depth of the devpi-web indexer queue from a `/+status` metrics table.
/// Rows are `[name, type, value]`; a missing or unparsable value counts
/// as an empty queue.
fn index_queue_size(metrics: &[Value]) -> u64 {
    for row in metrics {
        let Some(fields) = row.as_array() else {
            continue;
        };
        if fields.first().and_then(Value::as_str) == Some(INDEX_QUEUE_METRIC) {
            return fields
                .get(2)
                .and_then(|value| {
                    value
                        .as_u64()
                        .or_else(|| value.as_str().and_then(|raw| raw.parse().ok()))
                })
                .unwrap_or(0);
        }
    }
    0
}

fn as_epoch_seconds(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|raw| raw.parse().ok()))
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

/// Remove `packages` from `index`, one at a time, each removal preceded by
/// its own sync wait.
///
/// With `force` the index is made volatile for the duration and restored
/// afterward, on success and on error alike. A restore failure after a
/// successful batch propagates; after a failed batch the original error
/// wins and the restore failure is only logged.
pub fn remove_packages<'a, C, I>(client: &mut C, index: &str, packages: I, force: bool) -> Result<()>
where
    C: DevpiOps,
    I: IntoIterator<Item = &'a Package>,
{
    let restore = if force {
        let settings = client.index_settings(index)?;
        if settings.volatile {
            false
        } else {
            client.set_volatile(index, true)?;
            true
        }
    } else {
        false
    };

    let result = remove_batch(client, index, packages);

    if restore {
        match client.set_volatile(index, false) {
            Ok(()) => {}
            Err(err) if result.is_ok() => return Err(err.into()),
            Err(err) => warn!("failed to restore `{index}` to non-volatile: {err}"),
        }
    }
    result
}

fn remove_batch<'a, C, I>(client: &mut C, index: &str, packages: I) -> Result<()>
where
    C: DevpiOps,
    I: IntoIterator<Item = &'a Package>,
{
    for package in packages {
        assert_eq!(
            package.index, index,
            "attempted to remove {package} while processing {index}"
        );
        wait_for_sync(client, &SyncPolicy::default())?;
        client
            .remove(index, &format!("{}=={}", package.name, package.version))
            .with_context(|| format!("failed to remove {package}"))?;
    }
    Ok(())
}
