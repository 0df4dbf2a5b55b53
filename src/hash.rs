//! Content hashes of concrete nodes.
//!
//! A node's hash covers its name, version, variants, compiler and
//! architecture plus the name, hash and edge types of every direct
//! dependency. The input is canonical JSON (struct fields in fixed order,
//! maps and sets sorted), digested with SHA-256 and printed as lowercase
//! base32, truncated to [`HASH_LENGTH`] characters.

use std::collections::BTreeMap;

use data_encoding::BASE32_NOPAD;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::dag::{CompilerId, ConcreteNode};
use crate::spec::{ArchSpec, DepTypes};
use crate::variant::VariantValue;
use crate::version::Version;

pub const HASH_LENGTH: usize = 32;

#[derive(Serialize)]
struct CanonicalNode<'a> {
    name: &'a str,
    version: &'a Version,
    variants: &'a BTreeMap<String, VariantValue>,
    compiler: &'a CompilerId,
    arch: &'a ArchSpec,
    dependencies: Vec<CanonicalEdge<'a>>,
}

#[derive(Serialize)]
struct CanonicalEdge<'a> {
    name: &'a str,
    hash: &'a str,
    types: DepTypes,
}

/// A direct dependency as seen by the hash of its parent.
#[derive(Debug, Clone, Copy)]
pub struct HashedDependency<'a> {
    pub name: &'a str,
    pub hash: &'a str,
    pub types: DepTypes,
}

/// Hash `node` given its direct dependencies, in any order.
pub fn node_hash(node: &ConcreteNode, dependencies: &[HashedDependency<'_>]) -> Result<String, serde_json::Error> {
    let mut edges: Vec<CanonicalEdge<'_>> = dependencies
        .iter()
        .map(|d| CanonicalEdge {
            name: d.name,
            hash: d.hash,
            types: d.types,
        })
        .collect();
    edges.sort_by(|a, b| a.name.cmp(b.name));
    let canonical = CanonicalNode {
        name: &node.name,
        version: &node.version,
        variants: &node.variants,
        compiler: &node.compiler,
        arch: &node.arch,
        dependencies: edges,
    };
    let bytes = serde_json::to_vec(&canonical)?;
    let mut encoded = base32(&Sha256::digest(&bytes));
    encoded.truncate(HASH_LENGTH);
    Ok(encoded)
}

/// RFC 4648 base32 in lowercase, without padding.
fn base32(bytes: &[u8]) -> String {
    BASE32_NOPAD.encode(bytes).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(variants: &[(&str, VariantValue)]) -> ConcreteNode {
        ConcreteNode {
            name: "zlib".into(),
            version: Version::parse("1.3").unwrap(),
            variants: variants.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            compiler: CompilerId {
                name: "gcc".into(),
                version: Version::parse("12.2.0").unwrap(),
            },
            arch: ArchSpec::new("linux", "ubuntu22.04", "x86_64"),
            hash: String::new(),
        }
    }

    #[test]
    fn base32_known_vectors() {
        assert_eq!(base32(b""), "");
        assert_eq!(base32(b"f"), "my");
        assert_eq!(base32(b"foobar"), "mzxw6ytboi");
    }

    #[test]
    fn hash_shape_and_stability() {
        let n = node(&[("shared", VariantValue::Bool(true))]);
        let h = node_hash(&n, &[]).unwrap();
        assert_eq!(h.len(), HASH_LENGTH);
        assert!(h.bytes().all(|b| b.is_ascii_lowercase() || (b'2'..=b'7').contains(&b)));
        assert_eq!(h, node_hash(&n, &[]).unwrap());
    }

    #[test]
    fn dependency_order_irrelevant() {
        let n = node(&[]);
        let a = HashedDependency {
            name: "a",
            hash: "aaaa",
            types: DepTypes::LINK,
        };
        let b = HashedDependency {
            name: "b",
            hash: "bbbb",
            types: DepTypes::BUILD,
        };
        assert_eq!(node_hash(&n, &[a, b]).unwrap(), node_hash(&n, &[b, a]).unwrap());
    }

    #[test]
    fn every_field_changes_the_hash() {
        let base = node(&[("shared", VariantValue::Bool(true))]);
        let h = node_hash(&base, &[]).unwrap();

        let mut other = base.clone();
        other.version = Version::parse("1.3.1").unwrap();
        assert_ne!(h, node_hash(&other, &[]).unwrap());

        let other = node(&[("shared", VariantValue::Bool(false))]);
        assert_ne!(h, node_hash(&other, &[]).unwrap());

        let mut other = base.clone();
        other.compiler.name = "clang".into();
        assert_ne!(h, node_hash(&other, &[]).unwrap());

        let mut other = base.clone();
        other.arch.target = Some("zen2".into());
        assert_ne!(h, node_hash(&other, &[]).unwrap());

        let dep = HashedDependency {
            name: "dep",
            hash: "x",
            types: DepTypes::LINK,
        };
        assert_ne!(h, node_hash(&base, &[dep]).unwrap());
        let relinked = HashedDependency {
            types: DepTypes::BUILD,
            ..dep
        };
        assert_ne!(node_hash(&base, &[dep]).unwrap(), node_hash(&base, &[relinked]).unwrap());
    }
}
