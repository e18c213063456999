mod common;

use anvil::error::GraphError;
use anvil::graph::GraphBuilder;
use anvil::loader::{FileModuleLoader, RuleLoader, StaticModuleLoader};
use anvil::rule::Rule;
use anvil::rules::RuleTypeRegistry;
use common::*;
use std::sync::Arc;

fn targets(refs: &[&str]) -> Vec<String> {
    refs.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_cycle_is_reported_in_order() {
    let loader = root_module(vec![
        rule("a", "file_set").with_deps([":b"]),
        rule("b", "file_set").with_srcs([":c"]),
        rule("c", "file_set").with_deps([":a"]),
    ]);
    let err = GraphBuilder::new(&loader)
        .build(&targets(&[":a"]), Some("/"))
        .unwrap_err();
    let cycle = err.cycle().unwrap().to_vec();
    assert_eq!(cycle.len(), 4);
    assert_eq!(cycle.first(), cycle.last());
    for identity in ["/:a", "/:b", "/:c"] {
        assert!(cycle.contains(&identity.to_string()));
    }
}

#[test]
fn test_self_dependency_is_a_cycle() {
    let loader = root_module(vec![rule("a", "file_set").with_deps([":a"])]);
    let err = GraphBuilder::new(&loader)
        .build(&targets(&[":a"]), Some("/"))
        .unwrap_err();
    assert_eq!(err.cycle().unwrap().to_vec(), vec!["/:a".to_string(), "/:a".to_string()]);
}

#[test]
fn test_graph_across_modules() {
    let loader = StaticModuleLoader::new()
        .with_module(
            "/",
            vec![rule("app", "concat_files").with_srcs(["/ui:ui", "lib:core", "main.txt"])],
        )
        .unwrap()
        .with_module("/ui", vec![Rule::new("", "ui", "copy_files").with_deps(["/lib:core"])])
        .unwrap()
        .with_module("/lib", vec![Rule::new("", "core", "file_set")])
        .unwrap();

    let graph = GraphBuilder::new(&loader)
        .build(&targets(&[":app"]), Some("/"))
        .unwrap();
    assert_eq!(graph.len(), 3);
    assert!(graph.contains("/ui:ui"));
    assert!(graph.has_dependency("/:app", "/lib:core"));
    assert!(graph.has_dependency("/ui:ui", "/lib:core"));
    assert!(!graph.has_dependency("/lib:core", "/:app"));

    let order: Vec<String> = graph
        .topological_order()
        .into_iter()
        .map(|id| graph.rule(id).identity())
        .collect();
    let position = |name: &str| order.iter().position(|n| n == name).unwrap();
    assert!(position("/lib:core") < position("/ui:ui"));
    assert!(position("/ui:ui") < position("/:app"));

    let payload = graph.to_payload();
    assert_eq!(payload.nodes.len(), 3);
    assert!(payload
        .edges
        .contains(&("/lib:core".to_string(), "/ui:ui".to_string())));
}

#[test]
fn test_shared_dependency_is_one_node() {
    let loader = root_module(vec![
        rule("left", "file_set").with_deps([":base"]),
        rule("right", "file_set").with_deps([":base"]),
        rule("base", "file_set"),
    ]);
    let graph = GraphBuilder::new(&loader)
        .build(&targets(&[":left", ":right", ":left"]), Some("/"))
        .unwrap();
    assert_eq!(graph.len(), 3);
    assert_eq!(graph.targets().len(), 2);
    let base = graph.id_of("/:base").unwrap();
    assert_eq!(graph.dependents(base).len(), 2);
}

#[test]
fn test_resolution_errors() {
    let loader = root_module(vec![rule("a", "file_set").with_srcs(["/missing:x"])]);
    let build = |refs: &[&str], module: Option<&str>| {
        GraphBuilder::new(&loader).build(&targets(refs), module).unwrap_err()
    };

    assert!(matches!(build(&[":a"], Some("/")), GraphError::UnresolvedTarget { .. }));
    assert!(matches!(build(&[":nope"], Some("/")), GraphError::AmbiguousReference { .. }));
    assert!(matches!(build(&[":a"], None), GraphError::AmbiguousReference { .. }));
}

#[test]
fn test_unknown_rule_type_rejected_with_registry() {
    let loader = root_module(vec![rule("a", "not_a_type")]);
    let registry = RuleTypeRegistry::with_builtins();
    let err = GraphBuilder::new(&loader)
        .with_registry(&registry)
        .build(&targets(&[":a"]), Some("/"))
        .unwrap_err();
    assert!(matches!(err, GraphError::UnknownRuleType { .. }));
}

#[test]
fn test_file_loader_reads_build_files() {
    let project = Project::new();
    project.write(
        "BUILD",
        r#"{ "rules": [ { "name": "site", "type": "concat_files", "srcs": ["pages:pages"], "out": "site.html" } ] }"#,
    );
    project.write(
        "pages/BUILD",
        r#"{ "rules": [ { "name": "pages", "type": "file_set", "srcs": ["*.html"] } ] }"#,
    );
    let loader = FileModuleLoader::new(&project.root, Arc::new(RuleTypeRegistry::with_builtins()));

    let site = loader.resolve(":site", Some("/")).unwrap();
    assert_eq!(site.param_str("out"), Some("site.html"));
    assert_eq!(loader.resolve("/pages", None).unwrap().identity(), "/pages:pages");

    let graph = GraphBuilder::new(&loader)
        .build(&targets(&["/:site"]), None)
        .unwrap();
    assert!(graph.has_dependency("/:site", "/pages:pages"));
}

#[test]
fn test_file_loader_rejects_bad_modules() {
    let project = Project::new();
    project.write("BUILD", r#"{ "rules": [ { "name": "x", "type": "mystery" } ] }"#);
    project.write("broken/BUILD", "{ not json");
    let loader = FileModuleLoader::new(&project.root, Arc::new(RuleTypeRegistry::with_builtins()));

    assert!(matches!(
        loader.resolve(":x", Some("/")).unwrap_err(),
        GraphError::UnknownRuleType { .. }
    ));
    assert!(matches!(
        loader.resolve("/broken:y", None).unwrap_err(),
        GraphError::ModuleLoad { .. }
    ));
}
