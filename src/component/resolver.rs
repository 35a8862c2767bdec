//! Install-set resolution.
//!
//! Turns the user's selection into the ordered list the executor walks:
//! requested components sorted by install priority, each preceded by its
//! transitively missing dependencies. The output is dependency-closed by
//! construction -- every component appears after everything it still
//! needs.

use std::collections::HashSet;

use itertools::Itertools;
use tracing::debug;

use super::{ComponentHandle, ComponentStore};
use crate::context::{RunMode, RunOptions};
use crate::version::{compare_version, Dependency};

/// Resolve a dependency to the component that provides it: the named
/// component, or whatever replaces it.
pub fn provider_of(store: &ComponentStore, name: &str) -> Option<ComponentHandle> {
    store.by_name(name).or_else(|| store.replacement_of(name))
}

fn is_satisfied(store: &ComponentStore, dependency: &Dependency) -> bool {
    let Some(handle) = provider_of(store, &dependency.name) else {
        return false;
    };
    match &store.get(handle).installed_version {
        Some(version) => dependency.satisfied_by(version),
        None => false,
    }
}

/// The dependencies of `handle` that are not installed at a satisfying
/// version, as component handles. A dependency no catalog provides is
/// silently unmet here; the executor will fail the component when its
/// archives are missing, and front ends surface it earlier.
pub fn missing_dependencies(
    store: &ComponentStore,
    handle: ComponentHandle,
) -> Vec<ComponentHandle> {
    store
        .get(handle)
        .package
        .dependencies
        .iter()
        .filter(|dependency| !is_satisfied(store, dependency))
        .filter_map(|dependency| provider_of(store, &dependency.name))
        .unique()
        .collect()
}

/// The inverse relation: every component whose dependency list names
/// `handle`.
pub fn dependees(store: &ComponentStore, handle: ComponentHandle) -> Vec<ComponentHandle> {
    let target = store.get(handle).name().to_owned();
    let mut replaced_names: HashSet<&str> =
        store.get(handle).package.replaces.iter().map(String::as_str).collect();
    replaced_names.insert(&target);
    store
        .handles()
        .filter(|&other| other != handle)
        .filter(|&other| {
            store
                .get(other)
                .package
                .dependencies
                .iter()
                .any(|d| replaced_names.contains(d.name.as_str()))
        })
        .collect()
}

fn append_with_missing_dependencies(
    store: &ComponentStore,
    list: &mut Vec<ComponentHandle>,
    seen: &mut HashSet<ComponentHandle>,
    visiting: &mut HashSet<ComponentHandle>,
    handle: ComponentHandle,
) {
    if seen.contains(&handle) || !visiting.insert(handle) {
        return;
    }
    for dependency in missing_dependencies(store, handle) {
        append_with_missing_dependencies(store, list, seen, visiting, dependency);
    }
    visiting.remove(&handle);
    if seen.insert(handle) {
        list.push(handle);
    }
}

/// The ordered set of components this run installs.
pub fn install_list(
    store: &ComponentStore,
    options: &RunOptions,
    mode: RunMode,
) -> Vec<ComponentHandle> {
    let requested = store
        .handles()
        .filter(|&h| store.installation_requested(h, options, mode))
        .sorted_by_key(|&h| store.get(h).package.install_priority())
        .collect::<Vec<_>>();

    let mut list = Vec::new();
    let mut seen = HashSet::new();
    let mut visiting = HashSet::new();
    for handle in requested {
        append_with_missing_dependencies(store, &mut list, &mut seen, &mut visiting, handle);
    }
    debug!(
        "resolved install order: {:?}",
        list.iter().map(|&h| store.get(h).name()).collect::<Vec<_>>()
    );
    list
}

/// The components this run removes.
pub fn uninstall_list(store: &ComponentStore, mode: RunMode) -> Vec<ComponentHandle> {
    store
        .handles()
        .filter(|&h| store.uninstallation_requested(h, mode))
        .collect()
}

/// Updater mode: which components have a real update pending.
///
/// An update of an installed component is dropped when the local
/// installation is newer than the remote release date, or when the remote
/// version does not sort above the installed one. A component that is not
/// installed at all is offered only when the catalog flags it
/// `new-component`. When any surviving update is flagged important and the
/// run filters for important updates, the unimportant rest is dropped too.
pub fn update_candidates(
    store: &ComponentStore,
    options: &RunOptions,
) -> Vec<ComponentHandle> {
    let candidates = store
        .handles()
        .filter(|&h| {
            let component = store.get(h);
            if component.is_tristate() {
                return false;
            }
            let Some(installed) = component.installed_version.as_deref() else {
                return component.package.flags.new_component;
            };
            if compare_version(&component.package.version, installed) != std::cmp::Ordering::Greater
            {
                return false;
            }
            match (component.last_update_date, component.package.release_date) {
                (Some(local), Some(remote)) if local > remote => false,
                _ => true,
            }
        })
        .collect::<Vec<_>>();

    let has_important = candidates
        .iter()
        .any(|&h| store.get(h).package.flags.important);
    if has_important && options.important_updates_only {
        candidates
            .into_iter()
            .filter(|&h| store.get(h).package.flags.important)
            .collect()
    } else {
        candidates
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::super::tests::{empty_local, local_with, package};
    use super::{dependees, install_list, missing_dependencies, update_candidates};
    use crate::component::ComponentStore;
    use crate::context::{RunMode, RunOptions};

    fn names(store: &ComponentStore, handles: &[crate::component::ComponentHandle]) -> Vec<String> {
        handles.iter().map(|&h| store.get(h).name().to_owned()).collect()
    }

    #[test]
    fn fresh_install_pulls_dependencies_first() {
        // Repo: A 1.0, B 1.0 depending on A; user selects B.
        let mut b = package("B", "1.0");
        b.dependencies = vec!["A".parse().unwrap()];
        let mut store =
            ComponentStore::build(vec![package("A", "1.0"), b], &empty_local(), RunMode::Installer);
        let bh = store.by_name("B").unwrap();
        store.set_checked(bh, true);

        let list = install_list(&store, &RunOptions::default(), RunMode::Installer);
        assert_eq!(names(&store, &list), ["A", "B"]);
    }

    #[test]
    fn installed_dependency_at_wrong_version_is_missing() {
        // B needs A-2.0, local has A 1.0.
        let mut b = package("B", "1.0");
        b.dependencies = vec!["A-2.0".parse().unwrap()];
        let local = local_with(&[("A", "1.0")]);
        let mut store = ComponentStore::build(
            vec![package("A", "2.0"), b],
            &local,
            RunMode::PackageManager,
        );
        let bh = store.by_name("B").unwrap();

        let missing = missing_dependencies(&store, bh);
        assert_eq!(names(&store, &missing), ["A"]);

        store.set_checked(bh, true);
        let list = install_list(&store, &RunOptions::default(), RunMode::PackageManager);
        assert_eq!(names(&store, &list), ["A", "B"]);
    }

    #[test]
    fn satisfied_dependencies_are_not_reinstalled() {
        let mut b = package("B", "1.0");
        b.dependencies = vec!["A->=1.0".parse().unwrap()];
        let local = local_with(&[("A", "1.5")]);
        let mut store = ComponentStore::build(
            vec![package("A", "1.5"), b],
            &local,
            RunMode::PackageManager,
        );
        let bh = store.by_name("B").unwrap();
        store.set_checked(bh, true);
        let list = install_list(&store, &RunOptions::default(), RunMode::PackageManager);
        assert_eq!(names(&store, &list), ["B"]);
    }

    #[test]
    fn install_priority_orders_requested_components() {
        let mut early = package("early", "1");
        early
            .attrs
            .insert("install-priority".into(), "-10".into());
        let mut late = package("late", "1");
        late.attrs.insert("install-priority".into(), "10".into());
        let mut store = ComponentStore::build(
            vec![late, package("middle", "1"), early],
            &empty_local(),
            RunMode::Installer,
        );
        for h in store.handles().collect::<Vec<_>>() {
            store.set_checked(h, true);
        }
        let list = install_list(&store, &RunOptions::default(), RunMode::Installer);
        assert_eq!(names(&store, &list), ["early", "middle", "late"]);
    }

    #[test]
    fn closure_property_holds_for_chains() {
        // C -> B -> A, only C selected.
        let mut b = package("B", "1.0");
        b.dependencies = vec!["A".parse().unwrap()];
        let mut c = package("C", "1.0");
        c.dependencies = vec!["B".parse().unwrap()];
        let mut store = ComponentStore::build(
            vec![c, b, package("A", "1.0")],
            &empty_local(),
            RunMode::Installer,
        );
        let ch = store.by_name("C").unwrap();
        store.set_checked(store.by_name("A").unwrap(), false);
        store.set_checked(store.by_name("B").unwrap(), false);
        store.set_checked(ch, true);

        let list = install_list(&store, &RunOptions::default(), RunMode::Installer);
        let listed = names(&store, &list);
        assert_eq!(listed, ["A", "B", "C"]);
        // Every component's missing deps appear earlier in the list.
        for (i, &handle) in list.iter().enumerate() {
            for dep in missing_dependencies(&store, handle) {
                assert!(list[..i].contains(&dep));
            }
        }
    }

    #[test]
    fn dependees_is_the_inverse_relation() {
        let mut b = package("B", "1.0");
        b.dependencies = vec!["A".parse().unwrap()];
        let store = ComponentStore::build(
            vec![package("A", "1.0"), b, package("C", "1.0")],
            &empty_local(),
            RunMode::Installer,
        );
        let ah = store.by_name("A").unwrap();
        assert_eq!(names(&store, &dependees(&store, ah)), ["B"]);
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn updates_older_or_already_applied_are_dropped() {
        let mut stale = package("stale", "2.0");
        stale.release_date = Some(date("2024-01-01"));
        let mut fresh = package("fresh", "2.0");
        fresh.release_date = Some(date("2024-06-01"));

        let mut local = empty_local();
        let mut stale_rec = crate::catalog::local::InstalledRecord::new("stale", "1.0");
        stale_rec.last_update_date = Some(date("2024-03-01"));
        local.insert(stale_rec);
        let mut fresh_rec = crate::catalog::local::InstalledRecord::new("fresh", "1.0");
        fresh_rec.last_update_date = Some(date("2024-03-01"));
        local.insert(fresh_rec);

        let store = ComponentStore::build(vec![stale, fresh], &local, RunMode::Updater);
        let candidates = update_candidates(&store, &RunOptions::default());
        assert_eq!(names(&store, &candidates), ["fresh"]);
    }

    #[test]
    fn new_components_are_offered_during_updates() {
        // "fresh" is not installed; only the new-component flag makes it
        // an update candidate.
        let mut flagged = package("flagged", "1.0");
        flagged.flags.new_component = true;
        let unflagged = package("unflagged", "1.0");

        let local = local_with(&[("base", "1.0")]);
        let store = ComponentStore::build(
            vec![flagged, unflagged, package("base", "1.0")],
            &local,
            RunMode::Updater,
        );
        let candidates = update_candidates(&store, &RunOptions::default());
        assert_eq!(names(&store, &candidates), ["flagged"]);

        // And the selection counts as an installation request in updater
        // mode despite the component not being installed yet.
        let mut store = store;
        let handle = store.by_name("flagged").unwrap();
        store.set_checked(handle, true);
        assert!(store.installation_requested(handle, &RunOptions::default(), RunMode::Updater));
    }

    #[test]
    fn important_updates_shadow_the_rest() {
        let mut minor = package("minor", "1.1");
        let mut critical = package("critical", "2.0");
        critical.flags.important = true;
        minor.release_date = None;
        critical.release_date = None;

        let local = local_with(&[("minor", "1.0"), ("critical", "1.0")]);
        let store = ComponentStore::build(vec![minor, critical], &local, RunMode::Updater);

        let filtered = update_candidates(&store, &RunOptions::default());
        assert_eq!(names(&store, &filtered), ["critical"]);

        let unfiltered = update_candidates(
            &store,
            &RunOptions {
                important_updates_only: false,
                ..RunOptions::default()
            },
        );
        assert_eq!(unfiltered.len(), 2);
    }
}
