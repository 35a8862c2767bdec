//! The runtime component forest.
//!
//! Components join a remote package record with the matching installed
//! record, a parent derived from the dotted name, and the user's selection
//! state. They live in an arena and refer to each other by handle, never by
//! pointer; the arena is owned by the run and handed around explicitly.

pub mod resolver;

use std::collections::HashMap;

use tracing::debug;

use crate::catalog::local::LocalCatalog;
use crate::catalog::PackageRecord;
use crate::context::{RunMode, RunOptions};

/// Stable index of a component within its [`ComponentStore`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentHandle(usize);

/// Selection state. Leaves are two-state; parents are tri-state and their
/// state is always derived from their children.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckState {
    Unchecked,
    PartiallyChecked,
    Checked,
}

#[derive(Debug)]
pub struct Component {
    pub package: PackageRecord,
    /// Version present on disk, either from the local catalog or inherited
    /// from a package this one replaces.
    pub installed_version: Option<String>,
    pub last_update_date: Option<chrono::NaiveDate>,
    pub parent: Option<ComponentHandle>,
    pub children: Vec<ComponentHandle>,
    pub check_state: CheckState,
}

impl Component {
    pub fn name(&self) -> &str {
        &self.package.name
    }

    pub fn is_installed(&self) -> bool {
        self.installed_version.is_some()
    }

    pub fn is_virtual(&self) -> bool {
        self.package.flags.virtual_component
    }

    pub fn is_tristate(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn is_checked(&self) -> bool {
        self.check_state == CheckState::Checked
    }
}

#[derive(Debug, Default)]
pub struct ComponentStore {
    components: Vec<Component>,
    by_name: HashMap<String, ComponentHandle>,
    /// Maps a replaced package name to the component that replaces it.
    replacements: HashMap<String, ComponentHandle>,
}

impl ComponentStore {
    /// Build the forest from the merged catalogs and the local state.
    pub fn build(packages: Vec<PackageRecord>, local: &LocalCatalog, mode: RunMode) -> Self {
        let mut store = Self::default();

        for package in packages {
            let handle = ComponentHandle(store.components.len());
            let installed = local.find(&package.name);
            store.by_name.insert(package.name.clone(), handle);
            store.components.push(Component {
                installed_version: installed.map(|r| r.version.clone()),
                last_update_date: installed.and_then(|r| r.last_update_date),
                package,
                parent: None,
                children: Vec::new(),
                check_state: CheckState::Unchecked,
            });
        }

        // Parent assignment: the longest proper dotted prefix that names
        // another component.
        for index in 0..store.components.len() {
            let handle = ComponentHandle(index);
            let name = store.components[index].package.name.clone();
            let mut prefix = name.as_str();
            while let Some(cut) = prefix.rfind('.') {
                prefix = &prefix[..cut];
                if let Some(&parent) = store.by_name.get(prefix) {
                    store.components[index].parent = Some(parent);
                    store.components[parent.0].children.push(handle);
                    break;
                }
            }
        }

        // Replacement map; a replaced installed package makes its
        // replacement count as installed at the replacement's version.
        for index in 0..store.components.len() {
            let handle = ComponentHandle(index);
            for replaced in store.components[index].package.replaces.clone() {
                store.replacements.insert(replaced.clone(), handle);
                if mode != RunMode::Uninstaller {
                    if let Some(record) = local.find(&replaced) {
                        let version = store.components[index].package.version.clone();
                        debug!(
                            "'{}' inherits installation from replaced '{}'",
                            store.components[index].name(),
                            replaced
                        );
                        let component = &mut store.components[index];
                        component.installed_version = Some(version);
                        component.last_update_date = record.last_update_date;
                    }
                }
            }
        }

        // Default selection: installed or default-selected leaves start
        // checked; parents derive from their children.
        for index in 0..store.components.len() {
            let component = &mut store.components[index];
            if component.children.is_empty()
                && (component.is_installed() || component.package.flags.default_selected)
            {
                component.check_state = CheckState::Checked;
            }
        }
        store.refresh_parent_states();
        store
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = ComponentHandle> {
        (0..self.components.len()).map(ComponentHandle)
    }

    pub fn get(&self, handle: ComponentHandle) -> &Component {
        &self.components[handle.0]
    }

    pub fn get_mut(&mut self, handle: ComponentHandle) -> &mut Component {
        &mut self.components[handle.0]
    }

    pub fn by_name(&self, name: &str) -> Option<ComponentHandle> {
        self.by_name.get(name).copied()
    }

    /// The component that replaces `name`, if any.
    pub fn replacement_of(&self, name: &str) -> Option<ComponentHandle> {
        self.replacements.get(name).copied()
    }

    /// The names whose journal entries belong to `handle`: its own name
    /// plus everything it replaces.
    pub fn owned_names(&self, handle: ComponentHandle) -> Vec<String> {
        let component = self.get(handle);
        let mut names = component.package.replaces.clone();
        names.push(component.package.name.clone());
        names
    }

    /// Set a component's selection, spreading down to leaves and re-deriving
    /// every tri-state ancestor.
    pub fn set_checked(&mut self, handle: ComponentHandle, checked: bool) {
        let state = if checked {
            CheckState::Checked
        } else {
            CheckState::Unchecked
        };
        let mut stack = vec![handle];
        while let Some(h) = stack.pop() {
            self.components[h.0].check_state = state;
            stack.extend(self.components[h.0].children.iter().copied());
        }
        self.refresh_parent_states();
    }

    fn refresh_parent_states(&mut self) {
        // Children always carry a larger index than their parent is not
        // guaranteed; walk until a fixed point instead.
        loop {
            let mut changed = false;
            for index in 0..self.components.len() {
                if self.components[index].children.is_empty() {
                    continue;
                }
                let derived = self.derived_state(ComponentHandle(index));
                if self.components[index].check_state != derived {
                    self.components[index].check_state = derived;
                    changed = true;
                }
            }
            if !changed {
                return;
            }
        }
    }

    fn derived_state(&self, handle: ComponentHandle) -> CheckState {
        let children = &self.get(handle).children;
        let checked = children
            .iter()
            .filter(|&&c| self.get(c).check_state == CheckState::Checked)
            .count();
        let unchecked = children
            .iter()
            .filter(|&&c| self.get(c).check_state == CheckState::Unchecked)
            .count();
        if checked == children.len() {
            CheckState::Checked
        } else if unchecked == children.len() {
            CheckState::Unchecked
        } else {
            CheckState::PartiallyChecked
        }
    }

    /// Whether this run wants to install `handle`.
    pub fn installation_requested(
        &self,
        handle: ComponentHandle,
        options: &RunOptions,
        mode: RunMode,
    ) -> bool {
        let component = self.get(handle);
        if component.is_tristate() {
            // Parents carry no payload of their own selection; their
            // children are the install units.
            return false;
        }
        let selected = component.is_checked()
            || (component.package.flags.force_install && options.force_installation);
        match mode {
            RunMode::Uninstaller => false,
            // An update reinstalls something already on disk, or brings in
            // a package the catalog flags as new since the installation.
            RunMode::Updater => {
                selected && (component.is_installed() || component.package.flags.new_component)
            }
            RunMode::Installer | RunMode::PackageManager => {
                selected && !component.is_installed()
            }
        }
    }

    /// Whether this run wants to remove `handle`.
    pub fn uninstallation_requested(&self, handle: ComponentHandle, mode: RunMode) -> bool {
        let component = self.get(handle);
        match mode {
            RunMode::Uninstaller => component.is_installed(),
            RunMode::PackageManager => {
                !component.is_tristate() && component.is_installed() && !component.is_checked()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{CheckState, ComponentStore};
    use crate::catalog::local::{InstalledRecord, LocalCatalog};
    use crate::catalog::PackageRecord;
    use crate::context::RunMode;

    pub(crate) fn package(name: &str, version: &str) -> PackageRecord {
        PackageRecord {
            name: name.to_owned(),
            version: version.to_owned(),
            release_date: None,
            dependencies: Vec::new(),
            replaces: Vec::new(),
            archives: Vec::new(),
            uncompressed_size: 0,
            compressed_size: 0,
            flags: Default::default(),
            script: None,
            attrs: Default::default(),
            operations: Vec::new(),
        }
    }

    pub(crate) fn empty_local() -> LocalCatalog {
        LocalCatalog::in_memory()
    }

    pub(crate) fn local_with(records: &[(&str, &str)]) -> LocalCatalog {
        let mut local = empty_local();
        for (name, version) in records {
            local.insert(InstalledRecord::new(*name, *version));
        }
        local
    }

    #[test]
    fn parent_is_longest_existing_prefix() {
        let packages = vec![
            package("org", "1"),
            package("org.sdk.tools.cli", "1"),
            package("org.sdk", "1"),
        ];
        let store = ComponentStore::build(packages, &empty_local(), RunMode::Installer);
        // org.sdk.tools does not exist, so the cli component attaches to
        // org.sdk.
        let cli = store.by_name("org.sdk.tools.cli").unwrap();
        let sdk = store.by_name("org.sdk").unwrap();
        let org = store.by_name("org").unwrap();
        assert_eq!(store.get(cli).parent, Some(sdk));
        assert_eq!(store.get(sdk).parent, Some(org));
        assert_eq!(store.get(org).parent, None);
    }

    #[test]
    fn replaced_installed_package_marks_replacement_installed() {
        let mut modern = package("modern", "2.0");
        modern.replaces = vec!["legacy".to_owned()];
        let local = local_with(&[("legacy", "1.0")]);
        let store = ComponentStore::build(vec![modern], &local, RunMode::Installer);
        let handle = store.by_name("modern").unwrap();
        assert_eq!(
            store.get(handle).installed_version.as_deref(),
            Some("2.0")
        );
        assert_eq!(store.replacement_of("legacy"), Some(handle));
    }

    #[test]
    fn tristate_parent_state_follows_children() {
        let packages = vec![
            package("a", "1"),
            package("a.x", "1"),
            package("a.y", "1"),
        ];
        let mut store = ComponentStore::build(packages, &empty_local(), RunMode::Installer);
        let a = store.by_name("a").unwrap();
        let x = store.by_name("a.x").unwrap();
        assert_eq!(store.get(a).check_state, CheckState::Unchecked);

        store.set_checked(x, true);
        assert_eq!(store.get(a).check_state, CheckState::PartiallyChecked);

        store.set_checked(a, true);
        assert_eq!(store.get(a).check_state, CheckState::Checked);
        assert!(store.get(store.by_name("a.y").unwrap()).is_checked());
    }

    #[test]
    fn default_selection_covers_installed_and_flagged() {
        let mut selected = package("b", "1");
        selected.flags.default_selected = true;
        let packages = vec![package("a", "1"), selected];
        let local = local_with(&[("a", "1")]);
        let store = ComponentStore::build(packages, &local, RunMode::Installer);
        assert!(store.get(store.by_name("a").unwrap()).is_checked());
        assert!(store.get(store.by_name("b").unwrap()).is_checked());
    }
}
