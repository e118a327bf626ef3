//! Binary and environment resolution for agent backends.
//!
//! Resolution may shell out or walk `PATH`, so results are cached for the
//! lifetime of the resolver instance. The cache is an owned field rather
//! than a module-level static so tests can construct isolated resolvers and
//! the embedding process controls the lifecycle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bridge_protocol::{BridgeError, BridgeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarySource {
    /// Explicit `BRIDGE_<PROVIDER>_BIN` override.
    EnvOverride,
    /// Found by scanning the `PATH` of the merged environment.
    PathLookup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBinary {
    pub path: PathBuf,
    pub source: BinarySource,
}

pub trait BinaryResolver: Send + Sync {
    /// Resolve the executable for a provider name (e.g. `opencode`).
    /// "Not found" is a typed, recoverable error, never a panic.
    fn resolve(&self, provider: &str) -> BridgeResult<ResolvedBinary>;

    /// Merged process environment for spawning the provider: parent env,
    /// then caller overrides, caller wins.
    fn build_env(&self, provider: &str, overrides: &[(String, String)]) -> HashMap<String, String>;
}

#[derive(Default)]
struct ResolverCache {
    binaries: HashMap<String, ResolvedBinary>,
}

pub struct DefaultResolver {
    cache: Mutex<ResolverCache>,
    /// Extra `PATH`-style directories searched after the environment's own
    /// `PATH` (login-shell additions the desktop process may not inherit).
    extra_path_dirs: Vec<PathBuf>,
}

impl Default for DefaultResolver {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl DefaultResolver {
    pub fn new(extra_path_dirs: Vec<PathBuf>) -> Self {
        Self {
            cache: Mutex::new(ResolverCache::default()),
            extra_path_dirs,
        }
    }

    /// Drop all cached lookups. Mainly for tests and for settings changes
    /// that invalidate prior discovery.
    pub fn reset(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.binaries.clear();
        }
    }

    fn env_override_name(provider: &str) -> String {
        format!(
            "BRIDGE_{}_BIN",
            provider.trim().replace(['-', '.'], "_").to_ascii_uppercase()
        )
    }

    fn resolve_uncached(&self, provider: &str) -> BridgeResult<ResolvedBinary> {
        if let Some(path) = std::env::var_os(Self::env_override_name(provider)) {
            let path = PathBuf::from(path);
            if !is_executable_file(&path) {
                return Err(BridgeError::ExecutableNotFound(format!(
                    "{provider}: override path '{}' is not an executable file",
                    path.display()
                )));
            }
            return Ok(ResolvedBinary {
                path,
                source: BinarySource::EnvOverride,
            });
        }

        let mut search_dirs: Vec<PathBuf> = std::env::var_os("PATH")
            .map(|path| std::env::split_paths(&path).collect())
            .unwrap_or_default();
        search_dirs.extend(self.extra_path_dirs.iter().cloned());

        for dir in search_dirs {
            let candidate = dir.join(provider);
            if is_executable_file(&candidate) {
                return Ok(ResolvedBinary {
                    path: candidate,
                    source: BinarySource::PathLookup,
                });
            }
        }

        Err(BridgeError::ExecutableNotFound(provider.to_owned()))
    }
}

impl BinaryResolver for DefaultResolver {
    fn resolve(&self, provider: &str) -> BridgeResult<ResolvedBinary> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(resolved) = cache.binaries.get(provider) {
                return Ok(resolved.clone());
            }
        }

        let resolved = self.resolve_uncached(provider)?;
        tracing::debug!(
            provider,
            path = %resolved.path.display(),
            source = ?resolved.source,
            "resolved agent binary"
        );
        if let Ok(mut cache) = self.cache.lock() {
            cache
                .binaries
                .insert(provider.to_owned(), resolved.clone());
        }
        Ok(resolved)
    }

    fn build_env(&self, _provider: &str, overrides: &[(String, String)]) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        for (name, value) in overrides {
            env.insert(name.clone(), value.clone());
        }
        env
    }
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn make_executable(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").expect("write stub binary");
        let mut permissions = path.metadata().expect("stub metadata").permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).expect("chmod stub binary");
        path
    }

    #[test]
    fn missing_binary_is_a_typed_recoverable_error() {
        let resolver = DefaultResolver::default();
        let error = resolver
            .resolve("definitely-not-an-agent-binary")
            .expect_err("unknown binary must not resolve");
        assert!(matches!(error, BridgeError::ExecutableNotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn extra_path_dirs_are_searched_and_results_cached() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stub = make_executable(dir.path(), "stub-agent");
        let resolver = DefaultResolver::new(vec![dir.path().to_path_buf()]);

        let first = resolver.resolve("stub-agent").expect("resolve stub");
        assert_eq!(first.path, stub);
        assert_eq!(first.source, BinarySource::PathLookup);

        // Cached entries survive the directory going away until reset.
        drop(dir);
        let cached = resolver.resolve("stub-agent").expect("cached stub");
        assert_eq!(cached.path, stub);

        resolver.reset();
        assert!(resolver.resolve("stub-agent").is_err());
    }

    #[test]
    fn build_env_applies_overrides_last() {
        let resolver = DefaultResolver::default();
        let env = resolver.build_env(
            "stub-agent",
            &[("BRIDGE_TEST_MARKER".to_owned(), "1".to_owned())],
        );
        assert_eq!(env.get("BRIDGE_TEST_MARKER").map(String::as_str), Some("1"));
    }

    #[test]
    fn env_override_names_are_normalized() {
        assert_eq!(
            DefaultResolver::env_override_name("opencode"),
            "BRIDGE_OPENCODE_BIN"
        );
        assert_eq!(
            DefaultResolver::env_override_name("my-agent.cli"),
            "BRIDGE_MY_AGENT_CLI_BIN"
        );
    }
}
