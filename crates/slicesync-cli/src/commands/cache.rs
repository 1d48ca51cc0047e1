//! Cache command handlers

use anyhow::{bail, Context, Result};

use slicesync_core::{Config, Identity, LocalCache, SliceKey};

use crate::output::Output;

/// List cached entries for the stored session, or every raw entry
pub fn list(config: &Config, all: bool, output: &Output) -> Result<()> {
    let cache = LocalCache::open(config).context("Failed to open local cache")?;

    let entries = if all {
        cache.entries("")?
    } else {
        let session = Identity::with_config(config).current()?;
        let prefix = LocalCache::namespace_prefix(session.as_ref());
        cache
            .entries(&prefix)?
            .into_iter()
            .map(|(key, raw)| (key[prefix.len()..].to_string(), raw))
            .collect()
    };

    output.print_entries(&entries, "No cached slices.");
    Ok(())
}

/// Print the cached JSON for one slice of the stored session
pub fn get(config: &Config, slice: String, output: &Output) -> Result<()> {
    let slice = SliceKey::new(slice).context("Invalid slice key")?;
    let session = Identity::with_config(config).current()?;
    let cache = LocalCache::open(config).context("Failed to open local cache")?;

    let Some(raw) = cache.raw(session.as_ref(), &slice)? else {
        bail!("No cached value for '{}'", slice);
    };
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("Cached value for '{}' is not valid JSON", slice))?;

    output.print_value(slice.as_str(), "cached", &value);
    Ok(())
}

/// Clear the stored session's namespace, or the whole cache
pub fn clear(config: &Config, all: bool, output: &Output) -> Result<()> {
    let cache = LocalCache::open(config).context("Failed to open local cache")?;

    if all {
        cache.clear_all();
        output.success("Cleared the whole cache");
    } else {
        let session = Identity::with_config(config).current()?;
        cache.clear(session.as_ref());
        output.success(&format!(
            "Cleared cache for {}",
            session
                .as_ref()
                .map(|s| s.as_str())
                .unwrap_or("guest")
        ));
    }

    Ok(())
}
