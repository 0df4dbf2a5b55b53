//! Spec string parser.
//!
//! Grammar, informally:
//!
//! ```text
//! specs     := spec*
//! spec      := [name] attribute* ('^' name attribute*)*
//! attribute := '@' versions
//!            | '%' name ['@' versions]
//!            | ('+' | '++') name | ('~' | '~~' | '-') name
//!            | key ('=' | '==') value
//! ```
//!
//! `arch=platform-os-target`, `platform=`, `os=` and `target=` set the
//! architecture; any other `key=value` is a variant. A `-name` toggle is
//! only recognized at the start of a token, since names may contain dashes.

use crate::error::ParseError;
use crate::spec::{ArchSpec, CompilerSpec, Spec};
use crate::variant::VariantValue;
use crate::version::VersionList;

/// Parse one spec, possibly anonymous, with any number of `^` dependencies.
pub fn parse_spec(input: &str) -> Result<Spec, ParseError> {
    let mut specs = parse_specs(input)?;
    match specs.len() {
        0 => Ok(Spec::default()),
        1 => Ok(specs.remove(0)),
        _ => Err(ParseError::new(input, 0, "expected a single spec")),
    }
}

/// Parse a whitespace-separated list of root specs.
pub fn parse_specs(input: &str) -> Result<Vec<Spec>, ParseError> {
    Parser {
        input,
        bytes: input.as_bytes(),
        pos: 0,
        specs: Vec::new(),
        root: None,
        dep: None,
    }
    .run()
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_name_char(b: u8) -> bool {
    is_name_start(b) || b == b'-' || b == b'.'
}

fn is_version_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-' | b':' | b'=' | b',')
}

fn is_value_char(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'_' | b'-' | b'+' | b'*' | b'.' | b',' | b':' | b'=' | b'~' | b'/' | b'\\'
        )
}

struct Parser<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
    specs: Vec<Spec>,
    root: Option<Spec>,
    dep: Option<Spec>,
}

impl Parser<'_> {
    fn error(&self, at: usize, message: impl Into<String>) -> ParseError {
        ParseError::new(self.input, at, message)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &str {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn name(&mut self) -> Result<String, ParseError> {
        let at = self.pos;
        if !self.peek().is_some_and(is_name_start) {
            return Err(self.error(at, "expected a name"));
        }
        Ok(self.take_while(is_name_char).to_string())
    }

    /// The spec that attributes currently apply to.
    fn target(&mut self) -> &mut Spec {
        if let Some(dep) = self.dep.as_mut() {
            return dep;
        }
        self.root.get_or_insert_with(Spec::default)
    }

    fn finish_dep(&mut self) -> Result<(), ParseError> {
        if let Some(dep) = self.dep.take() {
            let root = self.root.get_or_insert_with(Spec::default);
            if root.dependencies.iter().any(|d| d.name == dep.name) {
                return Err(self.error(
                    self.pos,
                    format!("dependency `{}` given twice", dep.name_str()),
                ));
            }
            root.dependencies.push(dep);
        }
        Ok(())
    }

    fn finish_root(&mut self) -> Result<(), ParseError> {
        self.finish_dep()?;
        if let Some(root) = self.root.take() {
            self.specs.push(root);
        }
        Ok(())
    }

    fn run(mut self) -> Result<Vec<Spec>, ParseError> {
        let mut token_start = true;
        loop {
            if self.skip_ws() {
                token_start = true;
            }
            let Some(b) = self.peek() else { break };
            let at = self.pos;
            match b {
                b'^' => {
                    self.pos += 1;
                    self.finish_dep()?;
                    self.skip_ws();
                    let name = self.name()?;
                    self.root.get_or_insert_with(Spec::default);
                    self.dep = Some(Spec::named(&name));
                }
                b'@' => {
                    self.pos += 1;
                    let text = self.take_while(is_version_char).to_string();
                    let versions = VersionList::parse(&text).map_err(|e| self.error(at + 1 + e.offset, e.message))?;
                    let target = self.target();
                    if !target.versions.is_any() {
                        return Err(self.error(at, "version given twice"));
                    }
                    target.versions = versions;
                }
                b'%' => {
                    self.pos += 1;
                    self.skip_ws();
                    let name = self.name()?;
                    let mut versions = VersionList::any();
                    if self.peek() == Some(b'@') {
                        self.pos += 1;
                        let vat = self.pos;
                        let text = self.take_while(is_version_char).to_string();
                        versions = VersionList::parse(&text).map_err(|e| self.error(vat + e.offset, e.message))?;
                    }
                    let target = self.target();
                    if target.compiler.is_some() {
                        return Err(self.error(at, "compiler given twice"));
                    }
                    target.compiler = Some(CompilerSpec { name, versions });
                }
                b'+' | b'~' => {
                    self.pos += 1;
                    if self.peek() == Some(b) {
                        self.pos += 1;
                    }
                    let name = self.name()?;
                    self.set_variant(at, name, VariantValue::Bool(b == b'+'))?;
                }
                b'-' if token_start => {
                    self.pos += 1;
                    let name = self.name()?;
                    self.set_variant(at, name, VariantValue::Bool(false))?;
                }
                _ if is_name_start(b) => {
                    let name = self.name()?;
                    if self.peek() == Some(b'=') {
                        self.pos += 1;
                        if self.peek() == Some(b'=') {
                            self.pos += 1;
                        }
                        let value = self.value()?;
                        self.key_value(at, name, value)?;
                    } else if self.dep.is_none() && self.root.as_ref().is_some_and(|r| r.name.is_none() && r.is_unconstrained()) {
                        if let Some(root) = self.root.as_mut() {
                            root.name = Some(name);
                        }
                    } else {
                        self.finish_root()?;
                        self.root = Some(Spec::named(&name));
                    }
                }
                _ => {
                    let c = self.input.get(at..).and_then(|rest| rest.chars().next()).unwrap_or(b as char);
                    return Err(self.error(at, format!("unexpected character `{c}`")));
                }
            }
            token_start = false;
        }
        self.finish_root()?;
        Ok(self.specs)
    }

    fn value(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(q @ (b'"' | b'\'')) => {
                let open = self.pos;
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|b| b != q) {
                    self.pos += 1;
                }
                if self.peek() != Some(q) {
                    return Err(self.error(open, "unterminated quoted value"));
                }
                let value = self.input[start..self.pos].to_string();
                self.pos += 1;
                Ok(value)
            }
            _ => {
                let at = self.pos;
                let value = self.take_while(is_value_char).to_string();
                if value.is_empty() {
                    return Err(self.error(at, "expected a value"));
                }
                Ok(value)
            }
        }
    }

    fn key_value(&mut self, at: usize, key: String, value: String) -> Result<(), ParseError> {
        match key.as_str() {
            "arch" | "architecture" => {
                let (platform, rest) = value
                    .split_once('-')
                    .ok_or_else(|| self.error(at, "expected arch=platform-os-target"))?;
                let (os, target) = rest
                    .rsplit_once('-')
                    .ok_or_else(|| self.error(at, "expected arch=platform-os-target"))?;
                let arch = ArchSpec::new(platform, os, target);
                let target_spec = self.target();
                if !target_spec.arch.is_empty() {
                    return Err(self.error(at, "architecture given twice"));
                }
                target_spec.arch = arch;
            }
            "platform" | "os" | "target" => {
                let arch = &mut self.target().arch;
                let slot = match key.as_str() {
                    "platform" => &mut arch.platform,
                    "os" => &mut arch.os,
                    _ => &mut arch.target,
                };
                if slot.is_some() {
                    return Err(self.error(at, format!("{key} given twice")));
                }
                *slot = Some(value);
            }
            _ => self.set_variant(at, key, VariantValue::from_token(&value))?,
        }
        Ok(())
    }

    fn set_variant(&mut self, at: usize, name: String, value: VariantValue) -> Result<(), ParseError> {
        let target = self.target();
        if target.variants.contains_key(&name) {
            return Err(self.error(at, format!("variant `{name}` given twice")));
        }
        target.variants.insert(name, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    #[test]
    fn name_only() {
        let spec = parse_spec("py-numpy").unwrap();
        assert_eq!(spec.name.as_deref(), Some("py-numpy"));
        assert!(spec.is_unconstrained());
    }

    #[test]
    fn full_node() {
        let spec = parse_spec("hdf5@1.10:1.14 %gcc@12: +mpi ~shared -fortran api=v114 arch=linux-rhel8-zen2").unwrap();
        assert_eq!(spec.versions.to_string(), "1.10:1.14");
        let compiler = spec.compiler.as_ref().unwrap();
        assert_eq!(compiler.name, "gcc");
        assert!(compiler.versions.contains(&Version::parse("13.1").unwrap()));
        assert_eq!(spec.variants["mpi"], VariantValue::Bool(true));
        assert_eq!(spec.variants["shared"], VariantValue::Bool(false));
        assert_eq!(spec.variants["fortran"], VariantValue::Bool(false));
        assert_eq!(spec.variants["api"], VariantValue::Single("v114".into()));
        assert_eq!(spec.arch, ArchSpec::new("linux", "rhel8", "zen2"));
    }

    #[test]
    fn compact_form() {
        let spec = parse_spec("zlib@1.3%clang@15+pic~shared").unwrap();
        assert_eq!(spec.compiler.unwrap().name, "clang");
        assert_eq!(spec.variants.len(), 2);
    }

    #[test]
    fn dash_inside_name_is_not_a_toggle() {
        let spec = parse_spec("zlib-ng -opt").unwrap();
        assert_eq!(spec.name.as_deref(), Some("zlib-ng"));
        assert_eq!(spec.variants["opt"], VariantValue::Bool(false));
    }

    #[test]
    fn dependencies() {
        let spec = parse_spec("a ^b@1.0 +x ^c").unwrap();
        assert_eq!(spec.dependencies.len(), 2);
        let b = spec.dependency("b").unwrap();
        assert_eq!(b.versions.to_string(), "1.0");
        assert_eq!(b.variants["x"], VariantValue::Bool(true));
        assert!(spec.variants.is_empty());
    }

    #[test]
    fn anonymous_specs() {
        let spec = parse_spec("+feature").unwrap();
        assert!(spec.name.is_none());
        let spec = parse_spec("@2: %gcc").unwrap();
        assert!(spec.name.is_none());
        assert!(spec.compiler.is_some());
        let spec = parse_spec("^mpi@3:").unwrap();
        assert!(spec.name.is_none());
        assert!(spec.dependency("mpi").is_some());
    }

    #[test]
    fn multi_valued_and_quoted() {
        let spec = parse_spec("gcc languages=c,cxx,fortran cflags=\"-O2 -g\"").unwrap();
        assert_eq!(spec.variants["languages"].tokens().len(), 3);
        assert_eq!(spec.variants["cflags"], VariantValue::Single("-O2 -g".into()));
    }

    #[test]
    fn propagation_markers_parse() {
        let spec = parse_spec("a ++debug ~~shared build_type==Release").unwrap();
        assert_eq!(spec.variants["debug"], VariantValue::Bool(true));
        assert_eq!(spec.variants["shared"], VariantValue::Bool(false));
        assert_eq!(spec.variants["build_type"], VariantValue::Single("Release".into()));
    }

    #[test]
    fn several_roots() {
        let specs = parse_specs("a@1 ^b  c+x").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].dependencies.len(), 1);
        assert_eq!(specs[1].name.as_deref(), Some("c"));
        assert!(parse_spec("a c").is_err());
    }

    #[test]
    fn anonymous_attributes_then_name_start_a_new_spec() {
        let specs = parse_specs("+x a").unwrap();
        assert_eq!(specs.len(), 2);
        assert!(specs[0].name.is_none());
    }

    #[test]
    fn duplicates_rejected() {
        assert!(parse_spec("a@1@2").is_err());
        assert!(parse_spec("a%gcc%clang").is_err());
        assert!(parse_spec("a+x~x").is_err());
        assert!(parse_spec("a ^b ^b").is_err());
        assert!(parse_spec("a target=x target=y").is_err());
    }

    #[test]
    fn malformed_input() {
        let err = parse_spec("a@").unwrap_err();
        assert_eq!(err.input, "a@");
        assert!(parse_spec("a $b").is_err());
        assert!(parse_spec("a arch=linux").is_err());
        assert!(parse_spec("a x=\"open").is_err());
        assert!(parse_spec("a ^").is_err());
    }

    #[test]
    fn non_ascii_input_named_in_error() {
        let err = parse_specs("é").unwrap_err();
        assert_eq!(err.offset, 0);
        assert!(err.message.contains("`é`"), "{}", err.message);
        let err = parse_spec("zlib ü").unwrap_err();
        assert_eq!(err.offset, 5);
        assert!(err.message.contains("`ü`"), "{}", err.message);
    }

    #[test]
    fn empty_version_components_rejected() {
        assert!(parse_spec("a@1..2").is_err());
        assert!(parse_spec("a@1.2.:2").is_err());
        assert!(parse_spec("a@.1").is_err());
        assert!(parse_spec("a@1.2_-3").is_err());
        // Propagation markers are accepted and read as plain assignments.
        assert_eq!(parse_spec("a foo==bar").unwrap(), parse_spec("a foo=bar").unwrap());
    }
}
