//! Child environment sanitization.
//!
//! The agent CLI is a JavaScript program. Module search paths inherited from
//! a host that runs inside another Node or Bun project make it resolve the
//! wrong dependencies, so [`clean`] strips them before launch.

use std::collections::BTreeMap;
use std::env;

/// Variables removed outright.
pub const STRIPPED_VARS: [&str; 3] = ["NODE_PATH", "BUN_VERSIONS", "BUN_INSTALL"];

/// `PATH` entries containing any of these fragments are dropped.
pub const STRIPPED_PATH_FRAGMENTS: [&str; 2] = ["node_modules", ".bun"];

/// Sanitized child environment.
pub type Env = BTreeMap<String, String>;

/// Sanitize `base`.
#[must_use]
pub fn clean<I, K, V>(base: I) -> Env
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    let mut env: Env = base
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .filter(|(k, _)| !STRIPPED_VARS.contains(&k.as_str()))
        .collect();

    if let Some(path) = env.get_mut("PATH") {
        *path = clean_path(path);
    }
    env
}

/// Sanitized copy of this process's environment.
#[must_use]
pub fn from_process() -> Env {
    clean(env::vars())
}

/// Overlay `overrides` on `base`; overrides win on key collisions.
#[must_use]
pub fn merge<K, V>(mut base: Env, overrides: impl IntoIterator<Item = (K, V)>) -> Env
where
    K: Into<String>,
    V: Into<String>,
{
    base.extend(overrides.into_iter().map(|(k, v)| (k.into(), v.into())));
    base
}

fn clean_path(value: &str) -> String {
    let kept = env::split_paths(value).filter(|entry| {
        let entry = entry.to_string_lossy();
        !STRIPPED_PATH_FRAGMENTS
            .iter()
            .any(|fragment| entry.contains(fragment))
    });
    match env::join_paths(kept) {
        Ok(joined) => joined.to_string_lossy().into_owned(),
        Err(_) => value.to_owned(),
    }
}
