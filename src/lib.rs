//! Dependency concretization on top of the [`resolvo`] solver.
//!
//! This crate turns abstract package requests (`hdf5@1.14: +mpi ^zlib@1.3`)
//! into fully concrete dependency graphs: one version, variant set, compiler
//! and target per package, one provider per virtual package, and a content
//! hash per node. Recipes are plain data read through a [`RecipeIndex`];
//! installed nodes are tracked in a lock-guarded [`Database`] and can be
//! favored by later solves.

mod build_system;
mod concretize;
mod config;
mod dag;
mod database;
mod error;
mod hash;
mod layout;
mod matcher;
mod parser;
mod pool;
mod provider;
mod recipe;
mod spec;
mod translate;
mod unsat_core;
mod validate;
mod variant;
mod version;

pub use build_system::{BuildContext, BuildError, BuildSystem, Builder, ProcessContext, RecordedCommand, RecordingContext};
pub use concretize::Concretizer;
pub use config::{ArchitectureConfig, CompilerEntry, ConcretizerConfig, Config, ConfigError, PackageConfig};
pub use dag::{AssignedNode, Assignment, CompilerId, ConcreteDag, ConcreteNode, DependencyEdge, ProviderChoice};
pub use database::{Database, DatabaseError, DependencyRef, InstalledRecord, JsonFileStore, MemoryStore, RecordStore};
pub use error::{
    ConcretizeError, ConflictError, InvalidVariantError, InvalidVariantReason, ParseError, Result, UnsatisfiableError,
};
pub use hash::{node_hash, HashedDependency, HASH_LENGTH};
pub use layout::{BuildRequest, Layout, LayoutError, DEFAULT_PROJECTION};
pub use matcher::{installed_set, InstallPlan, Matcher, PlanAction};
pub use parser::{parse_spec, parse_specs};
pub use pool::{Constraint, InstalledPolicy, InstalledSet, NodeName, SolvableRecord, SolverPool, VersionSet};
pub use provider::{CancelReason, SpackleProvider};
pub use recipe::{
    ConflictDecl, DependencyDecl, InMemoryRecipeIndex, ProvidesDecl, Recipe, RecipeError, RecipeIndex, RequirePolicy,
    RequiresDecl, VersionDecl,
};
pub use spec::{ArchSpec, CompilerSpec, DepTypes, Spec, SpecLabel};
pub use translate::{Origin, Translation, Translator};
pub use unsat_core::CoreConstraint;
pub use validate::{check as validate_dag, Violation};
pub use variant::{VariantDef, VariantDomain, VariantValue};
pub use version::{Version, VersionItem, VersionList, VersionRange};

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::build_system::{BuildSystem, RecordingContext};
    use crate::concretize::Concretizer;
    use crate::config::{CompilerEntry, Config};
    use crate::database::Database;
    use crate::error::ConcretizeError;
    use crate::layout::Layout;
    use crate::matcher::{installed_set, Matcher, PlanAction};
    use crate::pool::InstalledSet;
    use crate::recipe::{InMemoryRecipeIndex, Recipe, RecipeIndex, RequirePolicy, RequiresDecl, VersionDecl};
    use crate::spec::{DepTypes, Spec};
    use crate::translate::Origin;
    use crate::variant::{VariantDef, VariantValue};
    use crate::version::Version;

    fn s(text: &str) -> Spec {
        Spec::parse(text).unwrap()
    }

    fn v(text: &str) -> Version {
        Version::parse(text).unwrap()
    }

    /// Helper: a recipe with the given versions.
    fn recipe(name: &str, versions: &[&str]) -> Recipe {
        versions
            .iter()
            .fold(Recipe::new(name), |r, version| r.with_version(v(version)))
    }

    /// Helper: a host with one gcc and two targets, x86_64 preferred.
    fn config() -> Config {
        let mut config = Config::default();
        config.compilers.push(CompilerEntry {
            name: "gcc".into(),
            version: v("12.2.0"),
        });
        config.compilers.push(CompilerEntry {
            name: "clang".into(),
            version: v("16.0.0"),
        });
        config.architecture.platform = Some("linux".into());
        config.architecture.os = Some("ubuntu22.04".into());
        config.architecture.targets = vec!["x86_64".into(), "zen2".into()];
        config
    }

    fn index(recipes: impl IntoIterator<Item = Recipe>) -> InMemoryRecipeIndex {
        recipes.into_iter().collect()
    }

    fn names(dag: &crate::dag::ConcreteDag) -> Vec<&str> {
        dag.nodes().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn highest_version_within_range() {
        let index = index([
            recipe("a", &["1.0"]).with_dependency(s("b@1.0:2.0"), DepTypes::default(), None),
            recipe("b", &["1.0", "1.5", "2.0", "2.1"]),
        ]);
        let config = config();
        let dag = Concretizer::new(&index, &config).concretize_str("a").unwrap();

        // 2.1 lies outside `1.0:2.0`; 2.0 is the newest inside.
        assert_eq!(dag.node("b").unwrap().version, v("2.0"));
    }

    #[test]
    fn conditional_dependency_follows_variant() {
        let index = index([
            recipe("a", &["1.0"])
                .with_variant(VariantDef::boolean("feature", false))
                .with_dependency(s("c"), DepTypes::default(), Some(s("+feature"))),
            recipe("c", &["1.0"]),
        ]);
        let config = config();
        let concretizer = Concretizer::new(&index, &config);

        let with = concretizer.concretize_str("a+feature").unwrap();
        assert_eq!(names(&with), ["a", "c"]);
        assert_eq!(with.root("a").unwrap().variants["feature"], VariantValue::Bool(true));

        let without = concretizer.concretize_str("a~feature").unwrap();
        assert_eq!(names(&without), ["a"]);

        // The default is off.
        let default = concretizer.concretize_str("a").unwrap();
        assert_eq!(names(&default), ["a"]);
    }

    #[test]
    fn siblings_share_one_node_in_the_intersection() {
        let index = index([
            recipe("a", &["1.0"])
                .with_dependency(s("b"), DepTypes::default(), None)
                .with_dependency(s("c"), DepTypes::default(), None),
            recipe("b", &["1.0"]).with_dependency(s("d@1.0:1.5"), DepTypes::default(), None),
            recipe("c", &["1.0"]).with_dependency(s("d@1.2:2.0"), DepTypes::default(), None),
            recipe("d", &["1.0", "1.2", "1.4", "1.5", "1.8", "2.0"]),
        ]);
        let config = config();
        let dag = Concretizer::new(&index, &config).concretize_str("a").unwrap();

        assert_eq!(dag.len(), 4);
        let d = dag.node("d").unwrap();
        assert_eq!(d.version, v("1.5"));
        let parents: Vec<_> = dag.dependents("d").iter().map(|n| n.name.as_str()).collect();
        assert_eq!(parents, ["b", "c"]);
    }

    fn mpi_index() -> InMemoryRecipeIndex {
        index([
            recipe("app", &["1.0"]).with_dependency(s("mpi@3:"), DepTypes::default(), None),
            recipe("solver", &["1.0"]).with_dependency(s("mpi"), DepTypes::default(), None),
            recipe("suite", &["1.0"])
                .with_dependency(s("app"), DepTypes::default(), None)
                .with_dependency(s("solver"), DepTypes::default(), None),
            recipe("openmpi", &["4.1.5", "5.0.0"]).with_provides(s("mpi@3"), None),
            recipe("mpich", &["3.4.3", "4.1"]).with_provides(s("mpi@3"), None),
        ])
    }

    #[test]
    fn virtual_follows_provider_preference() {
        let index = mpi_index();
        let mut config = config();
        config
            .packages
            .entry("all".into())
            .or_default()
            .providers
            .insert("mpi".into(), vec!["mpich".into()]);
        let dag = Concretizer::new(&index, &config).concretize_str("app").unwrap();

        assert_eq!(dag.provider_of("mpi").unwrap().name, "mpich");
        assert!(dag.node("openmpi").is_none());
        let (child, edge) = dag.dependencies("app")[0];
        assert_eq!(child.name, "mpich");
        assert!(edge.virtuals.contains("mpi"));
    }

    #[test]
    fn one_provider_per_virtual() {
        let index = mpi_index();
        let config = config();
        let dag = Concretizer::new(&index, &config).concretize_str("suite").unwrap();

        let providers: Vec<_> = ["openmpi", "mpich"]
            .into_iter()
            .filter(|p| dag.node(p).is_some())
            .collect();
        assert_eq!(providers.len(), 1);
        let app_dep = dag.dependencies("app")[0].0.name.clone();
        let solver_dep = dag.dependencies("solver")[0].0.name.clone();
        assert_eq!(app_dep, solver_dep);

        // Asking for the other provider explicitly replaces it everywhere.
        let dag = Concretizer::new(&index, &config)
            .concretize_str("suite ^mpich")
            .unwrap();
        assert_eq!(dag.provider_of("mpi").unwrap().name, "mpich");
        assert!(dag.node("openmpi").is_none());
    }

    #[test]
    fn virtual_root_maps_to_provider() {
        let index = mpi_index();
        let config = config();
        let dag = Concretizer::new(&index, &config).concretize_str("mpi").unwrap();
        let root = dag.root("mpi").unwrap();
        assert!(root.name == "openmpi" || root.name == "mpich");
        assert_eq!(dag.len(), 1);
    }

    #[test]
    fn pin_against_range_names_both() {
        let index = index([
            recipe("a", &["1.0"]).with_dependency(s("d@2.0:"), DepTypes::default(), None),
            recipe("d", &["1.0", "2.0", "2.1"]),
        ]);
        let config = config();
        let err = Concretizer::new(&index, &config)
            .concretize_str("a ^d@1.0")
            .unwrap_err();
        let ConcretizeError::Unsatisfiable(unsat) = err else {
            panic!("expected an unsatisfiable request, got {err}");
        };
        let origins: Vec<&Origin> = unsat.core.iter().map(|c| &c.origin).collect();
        assert!(origins.contains(&&Origin::RootDependency {
            index: 0,
            package: "d".into()
        }));
        assert!(origins.contains(&&Origin::Dependency {
            package: "a".into(),
            index: 0
        }));
        let report = unsat.to_string();
        assert!(report.contains("`^d@1.0` was requested with `a`"), "{report}");
        assert!(report.contains("`a` depends on `d@2.0:`"), "{report}");
    }

    #[test]
    fn installed_identical_spec_is_reused() {
        let index = index([
            recipe("a", &["1.0"]).with_dependency(s("b"), DepTypes::default(), None),
            recipe("b", &["1.0", "1.1"]),
        ]);
        let config = config();
        let root = tempfile::tempdir().unwrap();
        let layout = Layout::new(root.path());
        let db = Database::open(root.path()).unwrap();

        let first = Concretizer::new(&index, &config).concretize_str("a").unwrap();
        db.add_dag(&first, &layout, true).unwrap();

        let installed = installed_set(&db).unwrap();
        let second = Concretizer::new(&index, &config)
            .with_installed(installed)
            .concretize_str("a")
            .unwrap();
        assert_eq!(first.root("a").unwrap().hash, second.root("a").unwrap().hash);

        let plan = Matcher::new(&db, &layout).plan(&second).unwrap();
        assert!(plan.is_noop());
        assert!(plan.steps.iter().all(|step| matches!(step, PlanAction::Reuse(_))));
    }

    #[test]
    fn reuse_beats_newer_versions() {
        let index = index([recipe("b", &["1.0", "1.1"])]);
        let config = config();
        let old = Concretizer::new(&index, &config).concretize_str("b@1.0").unwrap();
        let mut installed = InstalledSet::new();
        installed.add_favored(old.root("b").unwrap().clone());

        let reused = Concretizer::new(&index, &config)
            .with_installed(installed.clone())
            .concretize_str("b")
            .unwrap();
        assert_eq!(reused.root("b").unwrap().hash, old.root("b").unwrap().hash);

        // Reuse is disabled by configuration.
        let mut fresh_config = config.clone();
        fresh_config.concretizer.reuse = false;
        let fresh = Concretizer::new(&index, &fresh_config)
            .with_installed(installed)
            .concretize_str("b")
            .unwrap();
        assert_eq!(fresh.root("b").unwrap().version, v("1.1"));
    }

    #[test]
    fn locked_install_is_honored_or_blamed() {
        let index = index([recipe("b", &["1.0", "1.1"])]);
        let config = config();
        let old = Concretizer::new(&index, &config).concretize_str("b@1.0").unwrap();
        let mut installed = InstalledSet::new();
        installed.add_locked(old.root("b").unwrap().clone());

        let dag = Concretizer::new(&index, &config)
            .with_installed(installed.clone())
            .concretize_str("b")
            .unwrap();
        assert_eq!(dag.root("b").unwrap().version, v("1.0"));

        let err = Concretizer::new(&index, &config)
            .with_installed(installed)
            .concretize_str("b@1.1")
            .unwrap_err();
        assert!(matches!(err, ConcretizeError::Unsatisfiable(_)));
    }

    #[test]
    fn results_are_deterministic() {
        let forward = index([
            recipe("a", &["1.0"])
                .with_variant(VariantDef::boolean("shared", true))
                .with_variant(VariantDef::single("api", "v2", &["v1", "v2"]))
                .with_dependency(s("b"), DepTypes::default(), None)
                .with_dependency(s("c"), DepTypes::BUILD, None),
            recipe("b", &["1.0", "2.0"]),
            recipe("c", &["3.0"]),
        ]);
        let backward = index([
            recipe("c", &["3.0"]),
            recipe("b", &["2.0", "1.0"]),
            recipe("a", &["1.0"])
                .with_dependency(s("c"), DepTypes::BUILD, None)
                .with_dependency(s("b"), DepTypes::default(), None)
                .with_variant(VariantDef::single("api", "v2", &["v1", "v2"]))
                .with_variant(VariantDef::boolean("shared", true)),
        ]);
        let config = config();
        let hashes = |index: &InMemoryRecipeIndex| -> Vec<String> {
            Concretizer::new(index, &config)
                .concretize_str("a")
                .unwrap()
                .nodes()
                .map(|n| n.hash.clone())
                .collect()
        };
        let first = hashes(&forward);
        assert_eq!(first, hashes(&forward));
        assert_eq!(first, hashes(&backward));
    }

    #[test]
    fn unified_roots_share_nodes() {
        let index = index([
            recipe("x", &["1.0"]).with_dependency(s("zlib@1.2:"), DepTypes::default(), None),
            recipe("y", &["1.0"]).with_dependency(s("zlib@:1.2"), DepTypes::default(), None),
            recipe("zlib", &["1.1", "1.2.13", "1.3"]),
        ]);
        let config = config();
        let roots = crate::parser::parse_specs("x y").unwrap();
        let dag = Concretizer::new(&index, &config).concretize(&roots).unwrap();

        let zlibs: BTreeSet<_> = dag.nodes().filter(|n| n.name == "zlib").map(|n| n.hash.clone()).collect();
        assert_eq!(zlibs.len(), 1);
        assert_eq!(dag.node("zlib").unwrap().version, v("1.2.13"));
        assert_eq!(dag.roots().count(), 2);
    }

    #[test]
    fn compilers_and_targets_follow_configuration() {
        let index = index([
            recipe("a", &["1.0"]).with_dependency(s("b"), DepTypes::default(), None),
            recipe("b", &["1.0"]),
        ]);
        let mut config = config();
        let dag = Concretizer::new(&index, &config).concretize_str("a").unwrap();
        for node in dag.nodes() {
            assert_eq!(node.compiler.name, "gcc");
            assert_eq!(node.arch.target.as_deref(), Some("x86_64"));
        }

        let dag = Concretizer::new(&index, &config)
            .concretize_str("a %clang target=zen2")
            .unwrap();
        assert_eq!(dag.root("a").unwrap().compiler.name, "clang");
        assert_eq!(dag.root("a").unwrap().arch.target.as_deref(), Some("zen2"));

        config.packages.entry("b".into()).or_default().compiler = vec!["clang".into()];
        let dag = Concretizer::new(&index, &config).concretize_str("a").unwrap();
        assert_eq!(dag.node("b").unwrap().compiler.name, "clang");
        assert_eq!(dag.root("a").unwrap().compiler.name, "gcc");
    }

    #[test]
    fn recipe_and_config_version_preferences() {
        let index = index([Recipe::new("p")
            .with_version_decl(VersionDecl {
                version: v("1.0"),
                preferred: true,
                deprecated: false,
                checksum: None,
            })
            .with_version(v("2.0"))
            .with_version_decl(VersionDecl {
                version: v("3.0"),
                preferred: false,
                deprecated: true,
                checksum: None,
            })]);
        let mut config = config();
        let pick = |config: &Config| {
            Concretizer::new(&index, config)
                .concretize_str("p")
                .unwrap()
                .root("p")
                .unwrap()
                .version
                .clone()
        };
        assert_eq!(pick(&config), v("1.0"));

        config.packages.entry("p".into()).or_default().version = vec![v("2.0")];
        assert_eq!(pick(&config), v("2.0"));

        // Deprecated versions are only taken on request.
        let dag = Concretizer::new(&index, &config).concretize_str("p@3:").unwrap();
        assert_eq!(dag.root("p").unwrap().version, v("3.0"));
    }

    #[test]
    fn conflicts_steer_the_solution() {
        let index = index([
            recipe("a", &["1.0", "2.0"])
                .with_variant(VariantDef::boolean("cuda", false))
                .with_conflict(s("+cuda"), Some(s("@2.0")), Some("cuda support was dropped".into()))
                .with_conflict(s("%clang"), None, None),
        ]);
        let config = config();
        let dag = Concretizer::new(&index, &config).concretize_str("a+cuda").unwrap();
        assert_eq!(dag.root("a").unwrap().version, v("1.0"));

        let err = Concretizer::new(&index, &config)
            .concretize_str("a@2.0+cuda")
            .unwrap_err();
        let report = err.to_string();
        assert!(report.contains("cuda support was dropped"), "{report}");

        assert!(Concretizer::new(&index, &config).concretize_str("a%clang").is_err());
    }

    #[test]
    fn requires_one_of_picks_a_single_alternative() {
        let index = index([recipe("a", &["1.0"])
            .with_variant(VariantDef::single("backend", "none", &["none", "cuda", "rocm"]))
            .with_requires(RequiresDecl {
                alternatives: vec![s("backend=cuda"), s("backend=rocm")],
                policy: RequirePolicy::OneOf,
                when: None,
                msg: Some("a GPU backend is mandatory".into()),
            })]);
        let config = config();
        let dag = Concretizer::new(&index, &config).concretize_str("a").unwrap();
        let backend = dag.root("a").unwrap().variants["backend"].clone();
        assert!(backend == VariantValue::Single("cuda".into()) || backend == VariantValue::Single("rocm".into()));

        let err = Concretizer::new(&index, &config)
            .concretize_str("a backend=none")
            .unwrap_err();
        assert!(err.to_string().contains("a GPU backend is mandatory"), "{err}");
    }

    #[test]
    fn conditional_and_sticky_variants() {
        let index = index([recipe("h", &["1.8", "1.10", "1.12"])
            .with_variant(VariantDef::boolean("szip", false).with_when(s("@1.10:")))
            .with_variant(VariantDef::boolean("debug", false).with_sticky(true))]);
        let config = config();
        let concretizer = Concretizer::new(&index, &config);

        let old = concretizer.concretize_str("h@1.8").unwrap();
        assert!(!old.root("h").unwrap().variants.contains_key("szip"));
        let new = concretizer.concretize_str("h").unwrap();
        assert_eq!(new.root("h").unwrap().variants["szip"], VariantValue::Bool(false));

        // `+szip` only exists from 1.10 on, so it steers the version.
        let dag = concretizer.concretize_str("h+szip").unwrap();
        assert_eq!(dag.root("h").unwrap().version, v("1.12"));
        assert!(matches!(
            concretizer.concretize_str("h@1.8+szip"),
            Err(ConcretizeError::InvalidVariant(_))
        ));

        let dag = concretizer.concretize_str("h+debug").unwrap();
        assert_eq!(dag.root("h").unwrap().variants["debug"], VariantValue::Bool(true));
    }

    #[test]
    fn config_requirements_bind_every_node() {
        let index = index([
            recipe("a", &["1.0"]).with_dependency(s("zlib"), DepTypes::default(), None),
            recipe("zlib", &["1.2", "1.3"]).with_variant(VariantDef::boolean("shared", true)),
        ]);
        let mut config = config();
        config.packages.entry("zlib".into()).or_default().require = Some(s("@1.2 ~shared"));
        let dag = Concretizer::new(&index, &config).concretize_str("a").unwrap();
        let zlib = dag.node("zlib").unwrap();
        assert_eq!(zlib.version, v("1.2"));
        assert_eq!(zlib.variants["shared"], VariantValue::Bool(false));

        let err = Concretizer::new(&index, &config)
            .concretize_str("a ^zlib@1.3")
            .unwrap_err();
        let ConcretizeError::Unsatisfiable(unsat) = err else {
            panic!("expected an unsatisfiable request");
        };
        assert!(unsat.core.iter().any(|c| c.origin
            == Origin::Requirement {
                package: "zlib".into()
            }));
    }

    #[test]
    fn test_dependencies_need_opt_in() {
        let index = index([
            recipe("a", &["1.0"]).with_dependency(s("pytest"), DepTypes::TEST, None),
            recipe("pytest", &["8.0"]),
        ]);
        let config = config();
        let plain = Concretizer::new(&index, &config).concretize_str("a").unwrap();
        assert_eq!(names(&plain), ["a"]);
        let tested = Concretizer::new(&index, &config)
            .with_tests(true)
            .concretize_str("a")
            .unwrap();
        assert_eq!(names(&tested), ["a", "pytest"]);
    }

    #[test]
    fn unknown_names_fail_before_solving() {
        let index = index([recipe("a", &["1.0"]).with_dependency(s("ghost"), DepTypes::default(), None)]);
        let config = config();
        let err = Concretizer::new(&index, &config).concretize_str("a").unwrap_err();
        assert!(matches!(
            err,
            ConcretizeError::UnknownPackage { ref name, ref needed_by } if name == "ghost" && needed_by == "a"
        ));
    }

    #[test]
    fn plan_drives_build_systems() {
        let index = index([
            recipe("app", &["1.0"])
                .with_build_system(BuildSystem::CMake)
                .with_dependency(s("zlib"), DepTypes::LINK, None),
            recipe("zlib", &["1.3"])
                .with_build_system(BuildSystem::Autotools)
                .with_variant(VariantDef::boolean("shared", true)),
        ]);
        let config = config();
        let dag = Concretizer::new(&index, &config).concretize_str("app").unwrap();
        let db = Database::in_memory();
        let layout = Layout::new("/opt/spackle");
        let plan = Matcher::new(&db, &layout).plan(&dag).unwrap();

        let mut ctx = RecordingContext::with_programs(&["cmake", "make"]);
        for request in plan.builds() {
            let system = index.recipe(&request.node.name).unwrap().build_system;
            system.run(request, &mut ctx).unwrap();
        }
        // zlib first (configure, make, make install), then app's three cmake steps.
        assert_eq!(ctx.commands.len(), 6);
        assert!(ctx.commands[0].program.ends_with("configure"));
        assert!(ctx.commands[0].args.contains(&"--enable-shared".to_string()));
        let zlib_prefix = layout.prefix_for(dag.node("zlib").unwrap());
        let prefix_path = format!("-DCMAKE_PREFIX_PATH={}", zlib_prefix.display());
        assert!(ctx.commands[3].args.contains(&prefix_path));
    }
}
