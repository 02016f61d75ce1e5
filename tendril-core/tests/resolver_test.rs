use std::sync::Arc;
use tendril_core::{resolve, DependencyGraph, PluginManifest, TendrilError};

fn plugin(id: &str, version: &str, deps: &[&str]) -> Arc<PluginManifest> {
    let mut doc = format!("id = \"{id}\"\nversion = \"{version}\"\nentry_point = \"{id}\"\n");
    for dep in deps {
        // "id@range" or "id?" for a soft dependency
        let (dep, soft) = match dep.strip_suffix('?') {
            Some(dep) => (dep, true),
            None => (*dep, false),
        };
        let (dep, range) = dep.split_once('@').unwrap_or((dep, "*"));
        doc.push_str(&format!(
            "\n[[dependencies]]\nid = \"{dep}\"\nversion_range = \"{range}\"\nkind = \"{}\"\n",
            if soft { "soft" } else { "hard" }
        ));
    }
    Arc::new(PluginManifest::parse(&doc).unwrap())
}

mod ordering_tests {
    use super::*;

    #[test]
    fn test_dependencies_come_first() {
        let resolution = resolve([
            plugin("c", "1.0.0", &["b"]),
            plugin("b", "1.0.0", &["a"]),
            plugin("a", "1.0.0", &[]),
        ]);

        assert!(resolution.failures.is_empty());
        assert_eq!(resolution.order, vec!["a", "b", "c"]);
        assert_eq!(resolution.shutdown_order(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_order_is_independent_of_input_order() {
        let manifests = vec![
            plugin("web", "1.0.0", &["auth", "db"]),
            plugin("auth", "1.0.0", &["db"]),
            plugin("db", "1.0.0", &[]),
            plugin("cache", "1.0.0", &[]),
            plugin("metrics", "1.0.0", &["web?"]),
        ];
        let expected = resolve(manifests.clone()).order;
        assert_eq!(expected, vec!["cache", "db", "auth", "web", "metrics"]);

        let mut rotated = manifests.clone();
        for _ in 0..manifests.len() {
            rotated.rotate_left(1);
            assert_eq!(resolve(rotated.clone()).order, expected);
        }
        let mut reversed = manifests;
        reversed.reverse();
        assert_eq!(resolve(reversed).order, expected);
    }

    #[test]
    fn test_independent_plugins_sorted_by_id() {
        let resolution = resolve([
            plugin("zeta", "1.0.0", &[]),
            plugin("alpha", "1.0.0", &[]),
            plugin("mu", "1.0.0", &[]),
        ]);
        assert_eq!(resolution.order, vec!["alpha", "mu", "zeta"]);
    }

    #[test]
    fn test_soft_dependency_orders_when_present() {
        let resolution = resolve([plugin("app", "1.0.0", &["theme?"]), plugin("theme", "1.0.0", &[])]);
        assert!(resolution.position("theme") < resolution.position("app"));

        let alone = resolve([plugin("app", "1.0.0", &["theme?"])]);
        assert!(alone.is_resolved("app"));
    }
}

mod failure_tests {
    use super::*;

    #[test]
    fn test_cycle_is_reported_with_its_path() {
        let graph = DependencyGraph::new([
            plugin("a", "1.0.0", &["b"]),
            plugin("b", "1.0.0", &["c"]),
            plugin("c", "1.0.0", &["a"]),
            plugin("d", "1.0.0", &[]),
        ]);

        assert_eq!(graph.find_cycle(), Some(vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "a".to_string(),
        ]));

        let resolution = graph.resolve();
        assert_eq!(resolution.order, vec!["d"]);
        for id in ["a", "b", "c"] {
            assert!(matches!(
                resolution.failure(id),
                Some(TendrilError::CyclicDependency { cycle }) if cycle.len() == 4
            ));
        }
    }

    #[test]
    fn test_soft_edges_participate_in_cycles() {
        let graph = DependencyGraph::new([
            plugin("a", "1.0.0", &["b?"]),
            plugin("b", "1.0.0", &["a"]),
        ]);
        assert!(graph.find_cycle().is_some());
        assert!(graph.resolve().order.is_empty());
    }

    #[test]
    fn test_missing_dependency_fails_dependents() {
        let resolution = resolve([
            plugin("base", "1.0.0", &["ghost"]),
            plugin("top", "1.0.0", &["base"]),
            plugin("free", "1.0.0", &[]),
        ]);

        assert_eq!(resolution.order, vec!["free"]);
        assert!(matches!(
            resolution.failure("base"),
            Some(TendrilError::MissingDependency { dependency, .. }) if dependency == "ghost"
        ));
        assert!(matches!(
            resolution.failure("top"),
            Some(TendrilError::DependencyFailed { dependency, .. }) if dependency == "base"
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let resolution = resolve([
            plugin("db", "2.1.0", &[]),
            plugin("legacy", "1.0.0", &["db@^1.0"]),
            plugin("modern", "1.0.0", &["db@>=2.0, <3"]),
        ]);

        assert_eq!(resolution.order, vec!["db", "modern"]);
        match resolution.failure("legacy") {
            Some(TendrilError::VersionMismatch {
                dependency,
                requirement,
                found,
                ..
            }) => {
                assert_eq!(dependency, "db");
                assert_eq!(requirement, "^1.0");
                assert_eq!(found, "2.1.0");
            }
            other => panic!("expected a version mismatch, got {other:?}"),
        }
    }
}

mod graph_tests {
    use super::*;

    fn graph() -> DependencyGraph {
        DependencyGraph::new([
            plugin("db", "1.0.0", &[]),
            plugin("auth", "1.0.0", &["db"]),
            plugin("web", "1.0.0", &["auth"]),
            plugin("admin", "1.0.0", &["web", "auth"]),
            plugin("ui", "1.0.0", &["web?"]),
        ])
    }

    #[test]
    fn test_dependents_in_resolution_order() {
        let graph = graph();
        assert_eq!(graph.len(), 5);
        assert_eq!(graph.dependents_of("db"), vec!["auth", "web", "admin"]);
        assert_eq!(graph.soft_dependents_of("web"), vec!["ui"]);
        assert!(graph.dependents_of("admin").is_empty());
    }

    #[test]
    fn test_dependencies_in_resolution_order() {
        let graph = graph();
        assert_eq!(graph.dependencies_of("admin"), vec!["db", "auth", "web"]);
        assert!(graph.dependencies_of("ui").is_empty());
    }

    #[test]
    fn test_queries_follow_resolved_order_around_failures() {
        let graph = DependencyGraph::new([
            plugin("c1", "1.0.0", &["c2"]),
            plugin("c2", "1.0.0", &["c1"]),
            plugin("alpha", "1.0.0", &["zeta", "c1?"]),
            plugin("zeta", "1.0.0", &[]),
            plugin("top", "1.0.0", &["alpha"]),
        ]);

        let resolution = graph.resolve();
        assert_eq!(resolution.order, vec!["zeta", "alpha", "top"]);
        assert!(resolution.failure("c1").is_some());
        assert!(resolution.failure("c2").is_some());

        assert_eq!(graph.dependencies_of("top"), vec!["zeta", "alpha"]);
        assert_eq!(graph.dependents_of("zeta"), vec!["alpha", "top"]);
        assert_eq!(graph.resolve().order, resolution.order);
    }
}
