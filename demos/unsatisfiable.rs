//! Example: explain why a request cannot be concretized.
//!
//! `app` needs `zlib@1.3:` but the request pins `^zlib@1.2`, and `app`
//! conflicts with `%clang`. Each request is reported with the minimal set of
//! constraints that cannot hold together.

use spackle::{CompilerEntry, ConcretizeError, Concretizer, Config, DepTypes, InMemoryRecipeIndex, Recipe, Spec, Version};

fn v(text: &str) -> Version {
    Version::parse(text).unwrap()
}

fn s(text: &str) -> Spec {
    Spec::parse(text).unwrap()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let index: InMemoryRecipeIndex = [
        Recipe::new("zlib").with_version(v("1.2.13")).with_version(v("1.3.1")),
        Recipe::new("app")
            .with_version(v("2.0"))
            .with_dependency(s("zlib@1.3:"), DepTypes::LINK, None)
            .with_conflict(s("%clang"), None, Some("app miscompiles with clang".into())),
    ]
    .into_iter()
    .collect();

    let mut config = Config::default();
    for (name, version) in [("gcc", "13.2.0"), ("clang", "18.1.8")] {
        config.compilers.push(CompilerEntry {
            name: name.into(),
            version: v(version),
        });
    }
    config.architecture.targets = vec!["x86_64".into()];

    let concretizer = Concretizer::new(&index, &config);
    for request in ["app", "app ^zlib@1.2", "app %clang", "ghost"] {
        println!("=== {request} ===");
        match concretizer.concretize_str(request) {
            Ok(dag) => println!("{dag}"),
            Err(ConcretizeError::Unsatisfiable(unsat)) => {
                println!("unsatisfiable, because:");
                for constraint in &unsat.core {
                    println!("  - {}", constraint.description);
                }
            }
            Err(other) => println!("error: {other}"),
        }
        println!();
    }
}
