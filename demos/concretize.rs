//! Example: concretize a small scientific stack and plan its installation.
//!
//! Models hdf5 with an optional MPI dependency, two MPI providers, zlib and a
//! build-only cmake. The request is concretized twice, with and without
//! `+mpi`, and the second run reuses everything the first one installed.
//!
//! Pass configuration files as arguments to layer them over the built-in
//! host description (later files win):
//!
//! ```text
//! RUST_LOG=spackle=debug cargo run --example concretize -- site.toml user.toml
//! ```

use std::path::PathBuf;

use spackle::{
    installed_set, CompilerEntry, Concretizer, Config, Database, DepTypes, InMemoryRecipeIndex, Layout, Matcher,
    PlanAction, Recipe, Spec, VariantDef, Version,
};

fn v(text: &str) -> Version {
    Version::parse(text).unwrap()
}

fn s(text: &str) -> Spec {
    Spec::parse(text).unwrap()
}

fn build_index() -> InMemoryRecipeIndex {
    let mut index = InMemoryRecipeIndex::new();

    // -- zlib: shared by everything --
    index.add(
        Recipe::new("zlib")
            .with_version(v("1.2.13"))
            .with_version(v("1.3.1"))
            .with_variant(VariantDef::boolean("shared", true)),
    );

    // -- cmake: build tool only --
    index.add(Recipe::new("cmake").with_version(v("3.27.9")).with_version(v("3.30.5")));

    // -- two MPI implementations --
    index.add(
        Recipe::new("openmpi")
            .with_version(v("4.1.6"))
            .with_version(v("5.0.5"))
            .with_provides(s("mpi@3"), None)
            .with_dependency(s("zlib"), DepTypes::LINK, None),
    );
    index.add(
        Recipe::new("mpich")
            .with_version(v("4.2.3"))
            .with_provides(s("mpi@3"), None),
    );

    // -- hdf5: mpi only when +mpi --
    index.add(
        Recipe::new("hdf5")
            .with_version(v("1.12.3"))
            .with_version(v("1.14.5"))
            .with_variant(VariantDef::boolean("mpi", false))
            .with_variant(VariantDef::single("api", "default", &["default", "v110", "v112", "v114"]))
            .with_dependency(s("zlib@1.2.13:"), DepTypes::LINK, None)
            .with_dependency(s("cmake@3.27:"), DepTypes::BUILD, None)
            .with_dependency(s("mpi"), DepTypes::default(), Some(s("+mpi"))),
    );

    index
}

fn build_config(paths: &[PathBuf]) -> spackle::Result<Config> {
    let mut config = Config::load_scopes(paths)?;
    if config.compilers.is_empty() {
        config.compilers.push(CompilerEntry {
            name: "gcc".into(),
            version: v("13.2.0"),
        });
    }
    if config.architecture.targets.is_empty() {
        config.architecture.platform = Some("linux".into());
        config.architecture.os = Some("ubuntu24.04".into());
        config.architecture.targets = vec!["x86_64_v3".into(), "x86_64".into()];
    }
    Ok(config)
}

fn main() -> spackle::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    let config = build_config(&paths)?;
    let index = build_index();

    let root = tempfile::tempdir().unwrap();
    let layout = Layout::new(root.path());
    let db = Database::open(root.path()).unwrap();

    for request in ["hdf5 ^zlib~shared", "hdf5+mpi ^zlib~shared"] {
        println!("=== {request} ===");
        let installed = installed_set(&db).unwrap();
        let dag = Concretizer::new(&index, &config)
            .with_installed(installed)
            .concretize_str(request)?;
        println!("{dag}");

        let plan = Matcher::new(&db, &layout).plan(&dag).unwrap();
        for step in &plan.steps {
            match step {
                PlanAction::Reuse(record) => println!("  [reuse] {} {}", record.node, record.prefix.display()),
                PlanAction::Build(request) => println!("  [build] {} {}", request.node, request.prefix.display()),
            }
        }
        db.add_dag(&dag, &layout, true).unwrap();
        println!();
    }

    Ok(())
}
