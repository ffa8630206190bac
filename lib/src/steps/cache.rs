//! Cache-related steps: opening the store, reporting its content and
//! enforcing the retention policy.

use anyhow::{Context, Result};
use comfy_table::Table;
use imager_utils::format_size;

use crate::cache::manager::CacheManager;
use crate::cache::policy::MainPolicy;
use crate::cache::store;
use crate::context::RunContext;
use crate::output::{self, TaskLine};

/// Open the cache directory, verify user-xattr support, load (or default)
/// the policy and walk the store.
pub(crate) fn check_cache(ctx: &mut RunContext) -> Result<i32> {
    let Some(cache_dir) = ctx.options.cache_dir.clone() else {
        output::task_note("Not using cache");
        ctx.cache = Some(CacheManager::disabled());
        return Ok(0);
    };

    if let Err(e) = std::fs::create_dir_all(&cache_dir) {
        eprintln!("error: cannot create {cache_dir}: {e}");
        return Ok(1);
    }

    let line = TaskLine::start(format!("Checking user_xattr support at {cache_dir}"));
    match store::supports_xattr(&cache_dir) {
        Ok(true) => line.done(),
        Ok(false) => {
            line.fail("cache must be on a filesystem with `user_xattr`");
            return Ok(1);
        }
        Err(e) => {
            line.fail(format!("{e:#}"));
            return Ok(1);
        }
    }

    let policy_path = cache_dir.join(store::POLICY_FILENAME);
    let line = TaskLine::start(format!("Reading cache policy at {policy_path}"));
    let policy = if !policy_path.exists() {
        line.fail("not present ; using defaults");
        MainPolicy::defaults()
    } else {
        let text = std::fs::read_to_string(&policy_path)
            .with_context(|| format!("Reading {policy_path}"))?;
        match MainPolicy::read_from(&text) {
            Ok(policy) => {
                line.done();
                policy
            }
            Err(e) => {
                line.fail(format!("failed to parse cache policy: {e:#}"));
                return Ok(1);
            }
        }
    };

    let line = TaskLine::start(format!("Preparing cache at {cache_dir}"));
    let mut manager = match CacheManager::new(&cache_dir, policy) {
        Ok(manager) => manager,
        Err(e) => {
            line.fail(format!("{e:#}"));
            return Ok(1);
        }
    };
    if let Err(e) = manager.walk() {
        line.fail(format!("{e:#}"));
        return Ok(1);
    }
    line.done();
    ctx.cache = Some(manager);
    Ok(0)
}

/// Print a summary table and per-entry rows; entries the policy would
/// evict are flagged.
pub(crate) fn print_cache(manager: &mut CacheManager, with_evictions: bool) -> Result<()> {
    println!();
    if manager.len()? == 0 {
        println!("Cache is empty.");
        println!();
        return Ok(());
    }

    let (oldest, newest) = {
        let mut added: Vec<_> = manager.entries().map(|e| e.added_on).collect();
        added.sort_unstable();
        (added[0], *added.last().context("no entries")?)
    };
    let mut summary = Table::new();
    summary.set_header(["Size", "Entries", "Oldest", "Newest"]);
    summary.add_row([
        format_size(manager.size()?),
        manager.len()?.to_string(),
        oldest.format("%Y-%m-%d %H:%M").to_string(),
        newest.format("%Y-%m-%d %H:%M").to_string(),
    ]);
    println!("{summary}");
    println!();

    let evictions = if with_evictions {
        manager.dry_apply()?
    } else {
        Vec::new()
    };

    let mut table = Table::new();
    table.set_header(["Size", "Added On", "Nb. Used", "Last Used", "Source", "Path", "Evict?"]);
    let mut entries: Vec<_> = manager.entries().collect();
    entries.sort_by_key(|e| e.added_on);
    for entry in entries {
        let eviction = evictions
            .iter()
            .find(|ev| ev.key == entry.fpath)
            .map(|ev| ev.reason.clone())
            .unwrap_or_default();
        table.add_row([
            format_size(entry.size),
            entry.added_on.format("%Y-%m-%d %H:%M").to_string(),
            entry.nb_used.to_string(),
            entry.last_used_on.format("%Y-%m-%d %H:%M").to_string(),
            entry.source.clone(),
            entry.fpath.to_string(),
            eviction,
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}

/// Reporting only; removed from the pipeline unless requested.
pub(crate) fn printing_cache(ctx: &mut RunContext) -> Result<i32> {
    let cache = ctx.cache_mut()?;
    if !cache.enabled() {
        output::task_note("Not using cache");
        return Ok(0);
    }
    print_cache(cache, true)?;
    Ok(0)
}

/// Apply the retention policy to the discovered entries, then drop the
/// ones whose remote source changed.
pub(crate) fn apply_cache_policy(ctx: &mut RunContext) -> Result<i32> {
    let cache = ctx.cache_mut()?;
    let mut applied = cache.apply()?;
    applied.extend(cache.evict_outdated()?);

    if applied.is_empty() {
        output::task_note("No entry to evict");
        return Ok(0);
    }
    for (eviction, success) in applied {
        let line = TaskLine::start(format!("Evicting {}", eviction.key));
        if success {
            line.succeed(format!("({})", eviction.reason));
        } else {
            line.fail(format!("failed to evict ({})", eviction.reason));
        }
    }
    Ok(0)
}
