//! Line-oriented manifest parser.

use super::{CachedForm, GlobalDecl, InstanceDecl, Manifest, ManifestError};
use crate::core::registry::ValueHandle;
use crate::driver::{ApiFlag, Revisions, SpecializationId, TypeTag, WorldRange};
use hashbrown::HashSet;

/// Name hint for globals declared without one.
pub const DEFAULT_GLOBAL_HINT: &str = "jl_global#";

pub fn parse_manifest(text: &str) -> Result<Manifest, ManifestError> {
    Parser::default().parse(text)
}

#[derive(Default)]
struct Parser {
    finalized: Option<u64>,
    in_progress: Option<u64>,
    globals: Vec<GlobalDecl>,
    instances: Vec<InstanceDecl>,
    roots: Vec<SpecializationId>,
    ids: HashSet<SpecializationId>,
    line: usize,
}

impl Parser {
    fn parse(mut self, text: &str) -> Result<Manifest, ManifestError> {
        for (idx, raw) in text.lines().enumerate() {
            self.line = idx + 1;
            // Skip comment
            let line = raw.split(';').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let Some(directive) = tokens.next() else {
                continue;
            };
            let rest: Vec<&str> = tokens.collect();
            match directive {
                "revision" => self.finalized = Some(self.single_number(&rest)?),
                "inference-revision" => self.in_progress = Some(self.single_number(&rest)?),
                "global" => self.parse_global(&rest)?,
                "instance" => self.parse_instance(&rest)?,
                "root" => {
                    for token in &rest {
                        let id = SpecializationId(self.number(token)?);
                        self.roots.push(id);
                    }
                }
                other => return Err(self.error(format!("unknown directive `{other}`"))),
            }
        }

        let mut revisions = Revisions::new(self.finalized.unwrap_or(1));
        if let Some(rev) = self.in_progress {
            revisions = revisions.with_in_progress(rev);
        }
        Ok(Manifest {
            revisions,
            globals: self.globals,
            instances: self.instances,
            roots: self.roots,
        })
    }

    fn error(&self, message: impl Into<String>) -> ManifestError {
        ManifestError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn number(&self, token: &str) -> Result<u64, ManifestError> {
        let parsed = match token.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => token.parse(),
        };
        parsed.map_err(|_| self.error(format!("expected a number, found `{token}`")))
    }

    fn single_number(&self, rest: &[&str]) -> Result<u64, ManifestError> {
        match rest {
            [token] => self.number(token),
            _ => Err(self.error("expected exactly one number")),
        }
    }

    fn parse_global(&mut self, rest: &[&str]) -> Result<(), ManifestError> {
        let (handle, hint) = match rest {
            [handle] => (handle, DEFAULT_GLOBAL_HINT),
            [handle, hint] => (handle, *hint),
            _ => return Err(self.error("expected `global <handle> [name-hint]`")),
        };
        let handle = ValueHandle(self.number(handle)?);
        self.globals.push(GlobalDecl {
            handle,
            name_hint: hint.to_string(),
        });
        Ok(())
    }

    fn parse_range(&self, value: &str) -> Result<WorldRange, ManifestError> {
        let Some((min, max)) = value.split_once("..") else {
            return Err(self.error(format!("expected MIN..MAX, found `{value}`")));
        };
        let min = self.number(min)?;
        let range = if max == "*" {
            WorldRange::open(min)
        } else {
            WorldRange::new(min, self.number(max)?)
        };
        if range.is_empty() {
            return Err(self.error(format!("empty validity range `{value}`")));
        }
        Ok(range)
    }

    fn parse_instance(&mut self, rest: &[&str]) -> Result<(), ManifestError> {
        let [id, name, attrs @ ..] = rest else {
            return Err(self.error("expected `instance <id> <name> [key=value]...`"));
        };
        let id = SpecializationId(self.number(id)?);
        if !self.ids.insert(id) {
            return Err(ManifestError::DuplicateInstance { line: self.line, id });
        }

        let mut decl = InstanceDecl {
            id,
            name: name.to_string(),
            validity: WorldRange::open(0),
            return_type: TypeTag::new("Any"),
            api: ApiFlag::default(),
            specialized: None,
            calls: Vec::new(),
            uses: Vec::new(),
            cached: CachedForm::None,
            infer_fails: false,
            codegen_fails: false,
        };

        for attr in attrs {
            let Some((key, value)) = attr.split_once('=') else {
                return Err(self.error(format!("expected key=value, found `{attr}`")));
            };
            match key {
                "valid" => decl.validity = self.parse_range(value)?,
                "ret" => decl.return_type = TypeTag::new(value),
                "spec" => decl.specialized = Some(TypeTag::new(value)),
                "api" => {
                    let flag = u8::try_from(self.number(value)?)
                        .map_err(|_| self.error(format!("api flag `{value}` out of range")))?;
                    decl.api = ApiFlag(flag);
                }
                "calls" => {
                    for callee in value.split(',').filter(|s| !s.is_empty()) {
                        decl.calls.push(SpecializationId(self.number(callee)?));
                    }
                }
                "uses" => {
                    for handle in value.split(',').filter(|s| !s.is_empty()) {
                        decl.uses.push(ValueHandle(self.number(handle)?));
                    }
                }
                "cached" => {
                    decl.cached = match value {
                        "none" => CachedForm::None,
                        "code" => CachedForm::Code,
                        "compressed" => CachedForm::Compressed,
                        "nothing" => CachedForm::Nothing,
                        "broken" => CachedForm::Broken,
                        other => return Err(self.error(format!("unknown cache form `{other}`"))),
                    }
                }
                "infer" if value == "fail" => decl.infer_fails = true,
                "codegen" if value == "fail" => decl.codegen_fails = true,
                other => return Err(self.error(format!("unknown instance attribute `{other}`"))),
            }
        }
        self.instances.push(decl);
        Ok(())
    }
}
