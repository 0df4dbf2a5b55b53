//! Install prefixes for concrete nodes.
//!
//! A [`Layout`] maps each node to a directory under an installation root
//! through a projection template such as
//! `{architecture}/{compiler.name}-{compiler.version}/{name}-{version}-{hash}`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;

use crate::dag::{ConcreteDag, ConcreteNode};

pub const DEFAULT_PROJECTION: &str = "{architecture}/{compiler.name}-{compiler.version}/{name}-{version}-{hash}";

const STAGE_DIR: &str = ".spackle-stage";

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("unknown projection token `{{{0}}}`")]
    UnknownToken(String),
    #[error("unbalanced braces in projection `{0}`")]
    Unbalanced(String),
    #[error("invalid hash length in `{{{0}}}`")]
    HashLength(String),
    #[error("projection `{0}` must produce a relative path")]
    Absolute(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Name,
    Version,
    Hash(Option<usize>),
    CompilerName,
    CompilerVersion,
    Architecture,
    Platform,
    Os,
    Target,
}

impl Token {
    fn parse(token: &str) -> Result<Token, LayoutError> {
        Ok(match token {
            "name" => Token::Name,
            "version" => Token::Version,
            "hash" => Token::Hash(None),
            "compiler.name" => Token::CompilerName,
            "compiler.version" => Token::CompilerVersion,
            "architecture" => Token::Architecture,
            "platform" => Token::Platform,
            "os" => Token::Os,
            "target" => Token::Target,
            _ => match token.strip_prefix("hash:") {
                Some(n) => match n.parse::<usize>() {
                    Ok(n) if n > 0 => Token::Hash(Some(n)),
                    _ => return Err(LayoutError::HashLength(token.to_string())),
                },
                None => return Err(LayoutError::UnknownToken(token.to_string())),
            },
        })
    }

    fn render(&self, node: &ConcreteNode, out: &mut String) {
        let part = |p: &Option<String>| p.clone().unwrap_or_else(|| "unknown".to_string());
        match self {
            Token::Literal(text) => out.push_str(text),
            Token::Name => out.push_str(&node.name),
            Token::Version => out.push_str(node.version.as_str()),
            Token::Hash(None) => out.push_str(&node.hash),
            Token::Hash(Some(n)) => out.push_str(node.hash.get(..*n).unwrap_or(&node.hash)),
            Token::CompilerName => out.push_str(&node.compiler.name),
            Token::CompilerVersion => out.push_str(node.compiler.version.as_str()),
            Token::Architecture => {
                let arch = &node.arch;
                out.push_str(&format!("{}-{}-{}", part(&arch.platform), part(&arch.os), part(&arch.target)));
            }
            Token::Platform => out.push_str(&part(&node.arch.platform)),
            Token::Os => out.push_str(&part(&node.arch.os)),
            Token::Target => out.push_str(&part(&node.arch.target)),
        }
    }
}

/// What a builder needs to install one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub node: ConcreteNode,
    pub prefix: PathBuf,
    /// Where the node's sources are staged.
    pub source_dir: PathBuf,
    /// Install prefixes of the direct dependencies, by package name.
    pub dependencies: BTreeMap<String, PathBuf>,
}

/// Directory scheme of one installation root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    projection: String,
    tokens: Vec<Token>,
}

impl Layout {
    /// `root` with the default projection.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let tokens = parse_projection(DEFAULT_PROJECTION).unwrap_or_default();
        Self {
            root: root.into(),
            projection: DEFAULT_PROJECTION.to_string(),
            tokens,
        }
    }

    pub fn with_projection(root: impl Into<PathBuf>, projection: &str) -> Result<Self, LayoutError> {
        if projection.starts_with('/') {
            return Err(LayoutError::Absolute(projection.to_string()));
        }
        Ok(Self {
            root: root.into(),
            projection: projection.to_string(),
            tokens: parse_projection(projection)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn projection(&self) -> &str {
        &self.projection
    }

    /// The node's prefix relative to the root.
    pub fn relative_path(&self, node: &ConcreteNode) -> PathBuf {
        let mut out = String::new();
        for token in &self.tokens {
            token.render(node, &mut out);
        }
        PathBuf::from(out)
    }

    pub fn prefix_for(&self, node: &ConcreteNode) -> PathBuf {
        self.root.join(self.relative_path(node))
    }

    pub fn stage_dir(&self, node: &ConcreteNode) -> PathBuf {
        self.root
            .join(STAGE_DIR)
            .join(format!("{}-{}", node.name, node.short_hash()))
    }

    /// One request per node of `dag`, dependencies first.
    pub fn build_requests(&self, dag: &ConcreteDag) -> Vec<BuildRequest> {
        dag.install_order()
            .into_iter()
            .map(|node| BuildRequest {
                node: node.clone(),
                prefix: self.prefix_for(node),
                source_dir: self.stage_dir(node),
                dependencies: dag
                    .dependencies(&node.name)
                    .into_iter()
                    .map(|(child, _)| (child.name.clone(), self.prefix_for(child)))
                    .collect(),
            })
            .collect()
    }
}

fn parse_projection(projection: &str) -> Result<Vec<Token>, LayoutError> {
    let pattern = Regex::new(r"\{([^{}]*)\}").map_err(|_| LayoutError::Unbalanced(projection.to_string()))?;
    let mut tokens = Vec::new();
    let mut last = 0;
    for caps in pattern.captures_iter(projection) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let literal = &projection[last..whole.start()];
        if literal.contains(['{', '}']) {
            return Err(LayoutError::Unbalanced(projection.to_string()));
        }
        if !literal.is_empty() {
            tokens.push(Token::Literal(literal.to_string()));
        }
        tokens.push(Token::parse(inner.as_str())?);
        last = whole.end();
    }
    let rest = &projection[last..];
    if rest.contains(['{', '}']) {
        return Err(LayoutError::Unbalanced(projection.to_string()));
    }
    if !rest.is_empty() {
        tokens.push(Token::Literal(rest.to_string()));
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::CompilerId;
    use crate::spec::ArchSpec;
    use crate::version::Version;

    fn node() -> ConcreteNode {
        ConcreteNode {
            name: "zlib".into(),
            version: Version::parse("1.3").unwrap(),
            variants: BTreeMap::new(),
            compiler: CompilerId {
                name: "gcc".into(),
                version: Version::parse("12.2.0").unwrap(),
            },
            arch: ArchSpec::new("linux", "ubuntu22.04", "x86_64"),
            hash: "abcdefghijklmnopqrstuvwxyz234567".into(),
        }
    }

    #[test]
    fn default_projection() {
        let layout = Layout::new("/opt/spackle");
        assert_eq!(
            layout.prefix_for(&node()),
            PathBuf::from("/opt/spackle/linux-ubuntu22.04-x86_64/gcc-12.2.0/zlib-1.3-abcdefghijklmnopqrstuvwxyz234567")
        );
    }

    #[test]
    fn short_hash_and_parts() {
        let layout = Layout::with_projection("/x", "{target}/{name}/{hash:7}").unwrap();
        assert_eq!(layout.relative_path(&node()), PathBuf::from("x86_64/zlib/abcdefg"));
    }

    #[test]
    fn bad_projections() {
        assert!(matches!(
            Layout::with_projection("/x", "{name}/{flavor}"),
            Err(LayoutError::UnknownToken(t)) if t == "flavor"
        ));
        assert!(matches!(
            Layout::with_projection("/x", "{name"),
            Err(LayoutError::Unbalanced(_))
        ));
        assert!(matches!(
            Layout::with_projection("/x", "{hash:0}"),
            Err(LayoutError::HashLength(_))
        ));
        assert!(matches!(
            Layout::with_projection("/x", "/abs/{name}"),
            Err(LayoutError::Absolute(_))
        ));
    }

    #[test]
    fn stage_dir_is_under_root() {
        let layout = Layout::new("/opt/spackle");
        assert_eq!(
            layout.stage_dir(&node()),
            PathBuf::from("/opt/spackle/.spackle-stage/zlib-abcdefg")
        );
    }
}
