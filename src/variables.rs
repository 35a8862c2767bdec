//! The substitution map applied to operation arguments.
//!
//! Keys are written `@Name@` inside argument strings. Well-known keys such
//! as `TargetDir` and `ApplicationName` are seeded by the run context; user
//! answers and repository metadata add more. `@env.NAME@` falls back to
//! the process environment, and `@registry.PATH\NAME@` reads the named
//! value under HKEY_CURRENT_USER on systems with a registry. A key that
//! resolves through none of these is left untouched so that literal `@`
//! signs in paths survive.

use std::collections::BTreeMap;
use std::env;
use std::path::Path;

pub const TARGET_DIR: &str = "TargetDir";
pub const APPLICATION_NAME: &str = "ProductName";
pub const APPLICATION_VERSION: &str = "ProductVersion";
pub const MAINTENANCE_TOOL: &str = "MaintenanceTool";

/// The process-wide variable map. Only the driver thread mutates it; worker
/// threads operate on a [`Variables::snapshot`] taken at operation start.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Variables {
    values: BTreeMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn set_path(&mut self, key: impl Into<String>, value: &Path) {
        self.set(key, value.display().to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn target_dir(&self) -> Option<&str> {
        self.get(TARGET_DIR)
    }

    /// An immutable copy for a worker thread. Cheap enough at the sizes a
    /// run produces, and it pins the values an operation sees for its whole
    /// perform/undo lifetime.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Expand every `@Key@` occurrence in `input`. Lookup order: the map,
    /// then the prefixed sources (environment, registry), then leave the
    /// token as-is.
    pub fn expand(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(open) = rest.find('@') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('@') {
                Some(close) => {
                    let key = &after[..close];
                    match self.lookup(key) {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push('@');
                            out.push_str(key);
                            out.push('@');
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    return out;
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn lookup(&self, key: &str) -> Option<String> {
        if key.is_empty() {
            return None;
        }
        if let Some(value) = self.values.get(key) {
            return Some(value.clone());
        }
        if let Some(name) = key.strip_prefix("env.") {
            return env::var(name).ok();
        }
        if let Some(spec) = key.strip_prefix("registry.") {
            return registry_lookup(spec);
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// `PATH\NAME` under HKEY_CURRENT_USER.
#[cfg(windows)]
fn registry_lookup(spec: &str) -> Option<String> {
    let (path, name) = spec.rsplit_once('\\')?;
    windows_registry::CURRENT_USER
        .open(path)
        .ok()?
        .get_string(name)
        .ok()
}

#[cfg(not(windows))]
fn registry_lookup(_spec: &str) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::Variables;

    #[test]
    fn expands_known_keys() {
        let mut vars = Variables::new();
        vars.set("TargetDir", "/opt/product");
        assert_eq!(
            vars.expand("@TargetDir@/bin/tool"),
            "/opt/product/bin/tool"
        );
    }

    #[test]
    fn unknown_keys_survive_verbatim() {
        let vars = Variables::new();
        assert_eq!(vars.expand("user@host@"), "user@host@");
        assert_eq!(vars.expand("50% @off"), "50% @off");
    }

    #[test]
    fn environment_fallback_uses_env_prefix() {
        let mut vars = Variables::new();
        vars.set("A", "1");
        std::env::set_var("INSTILL_TEST_VAR", "from-env");
        assert_eq!(
            vars.expand("@A@-@env.INSTILL_TEST_VAR@"),
            "1-from-env"
        );
    }

    #[cfg(not(windows))]
    #[test]
    fn registry_tokens_stay_verbatim_without_a_registry() {
        let vars = Variables::new();
        assert_eq!(
            vars.expand(r"@registry.Software\Vendor\InstallDir@"),
            r"@registry.Software\Vendor\InstallDir@"
        );
    }
}
