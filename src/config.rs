//! Project file loading
//!
//! A project is a single `stackplan.toml` declaring resource kinds and stacks.
//! Configuration strings of the exact form `${...}` become references; any
//! other string is a literal.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use stackgraph::{
    Literal, MapSource, OpenRegistry, ResourceSchema, SchemaRegistry, Stack, StaticRegistry, Value,
    VarType, Variable,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Default project file name
pub const PROJECT_FILE: &str = "stackplan.toml";

/// Default prefix of environment variables bound to stack variables
pub const DEFAULT_ENV_PREFIX: &str = "TF_VAR_";

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^\$\{(?:",
        r"var\.(?P<var>[A-Za-z_][\w-]*)",
        r"|remote\.(?P<source>[\w-]+)\.(?P<key>[\w-]+)(?P<list>\[\*\])?",
        r"|(?P<node>[\w-]+)\.(?P<attr>[\w-]+)",
        r")\}$",
    ))
    .expect("reference pattern is valid")
});

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{location}: malformed reference '{text}'")]
    MalformedReference { location: String, text: String },

    #[error("{location}: '${{...}}' must be the whole string, interpolation is not supported")]
    Interpolation { location: String },

    #[error("{location}: datetime values are not supported")]
    Datetime { location: String },

    #[error("variable '{name}' of stack '{stack}': default does not match type {expected}")]
    DefaultType {
        stack: String,
        name: String,
        expected: &'static str,
    },
}

// ============================================================================
// File Format
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProjectFile {
    #[serde(default)]
    state_dir: Option<String>,
    #[serde(default)]
    env_prefix: Option<String>,
    #[serde(default)]
    kinds: BTreeMap<String, ResourceSchema>,
    #[serde(default)]
    stacks: Vec<StackFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StackFile {
    name: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    variables: Vec<VariableFile>,
    #[serde(default)]
    remote_state: Vec<RemoteStateFile>,
    #[serde(default)]
    resources: Vec<ResourceFile>,
    #[serde(default)]
    outputs: Vec<OutputFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VariableFile {
    name: String,
    #[serde(default, rename = "type")]
    var_type: Option<VarType>,
    #[serde(default)]
    sensitive: bool,
    #[serde(default)]
    default: Option<toml::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RemoteStateFile {
    id: String,
    stack: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceFile {
    id: String,
    kind: String,
    #[serde(default)]
    config: toml::Table,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OutputFile {
    name: String,
    value: toml::Value,
    #[serde(default)]
    sensitive: bool,
}

// ============================================================================
// Project
// ============================================================================

/// A loaded project
#[derive(Debug)]
pub struct Project {
    pub path: PathBuf,
    pub state_dir: PathBuf,
    pub env_prefix: String,
    pub kinds: BTreeMap<String, ResourceSchema>,
    pub stacks: Vec<Stack>,
}

impl Project {
    /// Load and convert a project file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read project file {}", path.display()))?;
        let file: ProjectFile = toml::from_str(&content)
            .with_context(|| format!("Invalid project file {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let state_dir = match &file.state_dir {
            Some(dir) => resolve_path(base, dir),
            None => default_state_dir()?,
        };

        let stacks = file
            .stacks
            .iter()
            .map(convert_stack)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Invalid stack declaration in {}", path.display()))?;

        log::debug!(
            "loaded project {} ({} stacks, {} kinds)",
            path.display(),
            stacks.len(),
            file.kinds.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            state_dir,
            env_prefix: file
                .env_prefix
                .unwrap_or_else(|| DEFAULT_ENV_PREFIX.to_string()),
            kinds: file.kinds,
            stacks,
        })
    }

    /// Schema registry for this project; without declared kinds, every kind is accepted
    pub fn registry(&self) -> Box<dyn SchemaRegistry> {
        if self.kinds.is_empty() {
            Box::new(OpenRegistry)
        } else {
            Box::new(StaticRegistry::from_kinds(self.kinds.clone()))
        }
    }

    pub fn stack_names(&self) -> Vec<&str> {
        self.stacks.iter().map(|s| s.name.as_str()).collect()
    }
}

/// `~/.local/state/stackplan` (or the platform state directory)
pub fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = dirs::state_dir() {
        return Ok(dir.join("stackplan"));
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".local").join("state").join("stackplan"))
}

/// Expand `~` and environment variables; relative paths are taken from `base`
pub fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let expanded = shellexpand::full(raw)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| shellexpand::tilde(raw).into_owned());
    let path = PathBuf::from(expanded);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

// ============================================================================
// Variable Sources
// ============================================================================

/// Variables from repeated `--var NAME=VALUE` flags (`stack.NAME=VALUE` targets one stack)
pub fn var_flags(flags: &[String]) -> Result<MapSource> {
    let mut source = MapSource::new("--var");
    for flag in flags {
        let (name, value) = flag
            .split_once('=')
            .with_context(|| format!("Invalid --var '{flag}': expected NAME=VALUE"))?;
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("Invalid --var '{flag}': empty name");
        }
        source.insert(name, value);
    }
    Ok(source)
}

/// Variables from a TOML file; top-level keys apply to every stack, tables to one stack
pub fn var_file(path: &Path) -> Result<MapSource> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read variable file {}", path.display()))?;
    let table: toml::Table = toml::from_str(&content)
        .with_context(|| format!("Invalid variable file {}", path.display()))?;

    let mut source = MapSource::new(path.display().to_string());
    for (key, value) in &table {
        match value {
            toml::Value::Table(stack) => {
                for (name, value) in stack {
                    source.insert(format!("{key}.{name}"), scalar(path, name, value)?);
                }
            }
            other => source.insert(key.clone(), scalar(path, key, other)?),
        }
    }
    Ok(source)
}

fn scalar(path: &Path, name: &str, value: &toml::Value) -> Result<String> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(n) => Ok(n.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        _ => anyhow::bail!(
            "Variable '{}' in {} must be a string, number or bool",
            name,
            path.display()
        ),
    }
}

// ============================================================================
// Conversion
// ============================================================================

fn convert_stack(file: &StackFile) -> Result<Stack> {
    let mut stack = Stack::new(&file.name);

    for variable in &file.variables {
        stack = stack.variable(convert_variable(&file.name, variable)?);
    }
    for source in &file.remote_state {
        stack = stack.remote_state(&source.id, &source.stack);
    }
    for resource in &file.resources {
        let location = format!("{}.{}", file.name, resource.id);
        let config = convert_table(&location, &resource.config)?;
        stack = stack.resource(&resource.id, &resource.kind, config);
    }
    for output in &file.outputs {
        let location = format!("{}.output.{}", file.name, output.name);
        let value = convert_value(&location, &output.value)?;
        stack = if output.sensitive {
            stack.sensitive_output(&output.name, value)
        } else {
            stack.output(&output.name, value)
        };
    }
    for dependency in &file.depends_on {
        stack = stack.depends_on(dependency);
    }

    Ok(stack)
}

fn convert_variable(stack: &str, file: &VariableFile) -> Result<Variable> {
    let var_type = file.var_type.unwrap_or(VarType::String);
    let mut variable = Variable::string(&file.name).with_type(var_type);
    if file.sensitive {
        variable = variable.sensitive();
    }
    if let Some(default) = &file.default {
        let literal = match (var_type, default) {
            (VarType::String, toml::Value::String(s)) => Literal::String(s.clone()),
            (VarType::Bool, toml::Value::Boolean(b)) => Literal::Bool(*b),
            (VarType::Number, toml::Value::Integer(n)) => Literal::Number((*n).into()),
            (VarType::Number, toml::Value::Float(f)) => match serde_json::Number::from_f64(*f) {
                Some(n) => Literal::Number(n),
                None => return Err(default_type(stack, &file.name, var_type)),
            },
            _ => return Err(default_type(stack, &file.name, var_type)),
        };
        variable = variable.with_default(literal);
    }
    Ok(variable)
}

fn default_type(stack: &str, name: &str, var_type: VarType) -> anyhow::Error {
    ConfigError::DefaultType {
        stack: stack.to_string(),
        name: name.to_string(),
        expected: var_type.name(),
    }
    .into()
}

fn convert_table(location: &str, table: &toml::Table) -> Result<Value> {
    let entries = table
        .iter()
        .map(|(key, value)| Ok((key.clone(), convert_value(&format!("{location}.{key}"), value)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::map(entries))
}

/// Convert a TOML value into a configuration tree
pub fn convert_value(location: &str, value: &toml::Value) -> Result<Value> {
    Ok(match value {
        toml::Value::String(s) => parse_string(location, s)?,
        toml::Value::Integer(n) => Value::int(*n),
        toml::Value::Float(f) => match serde_json::Number::from_f64(*f) {
            Some(n) => Value::Literal(Literal::Number(n)),
            None => Value::Literal(Literal::Null),
        },
        toml::Value::Boolean(b) => Value::bool(*b),
        toml::Value::Datetime(_) => {
            return Err(ConfigError::Datetime {
                location: location.to_string(),
            }
            .into());
        }
        toml::Value::Array(items) => Value::List(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| convert_value(&format!("{location}[{i}]"), item))
                .collect::<Result<_>>()?,
        ),
        toml::Value::Table(table) => convert_table(location, table)?,
    })
}

fn parse_string(location: &str, s: &str) -> Result<Value> {
    if let Some(caps) = REFERENCE.captures(s) {
        if let Some(name) = caps.name("var") {
            return Ok(Value::var(name.as_str()));
        }
        if let (Some(source), Some(key)) = (caps.name("source"), caps.name("key")) {
            return Ok(if caps.name("list").is_some() {
                Value::remote_list(source.as_str(), key.as_str())
            } else {
                Value::remote(source.as_str(), key.as_str())
            });
        }
        if let (Some(node), Some(attr)) = (caps.name("node"), caps.name("attr")) {
            return Ok(Value::attr(node.as_str(), attr.as_str()));
        }
    }

    if s.starts_with("${") && s.ends_with('}') && !s[2..].contains("${") {
        return Err(ConfigError::MalformedReference {
            location: location.to_string(),
            text: s.to_string(),
        }
        .into());
    }
    if s.contains("${") {
        return Err(ConfigError::Interpolation {
            location: location.to_string(),
        }
        .into());
    }
    Ok(Value::string(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackgraph::Reference;
    use tempfile::TempDir;

    const PROJECT: &str = r#"
state_dir = "state"

[kinds.aws_vpc]
attributes = ["id"]
[kinds.aws_vpc.fields]
cidr_block = { type = "string", required = true }

[[stacks]]
name = "network"

[[stacks.resources]]
id = "vpc"
kind = "aws_vpc"
config = { cidr_block = "10.0.0.0/16" }

[[stacks.outputs]]
name = "vpc_id"
value = "${vpc.id}"

[[stacks]]
name = "cluster"
depends_on = ["network"]

[[stacks.variables]]
name = "AWS_SECRET_ACCESS_KEY"
sensitive = true

[[stacks.variables]]
name = "node_count"
type = "number"
default = 2

[[stacks.remote_state]]
id = "vpc-state"
stack = "network"

[[stacks.resources]]
id = "eks"
kind = "aws_eks_cluster"

[stacks.resources.config]
vpc_id = "${remote.vpc-state.vpc_id}"
subnet_ids = "${remote.vpc-state.subnet_ids[*]}"
secret = "${var.AWS_SECRET_ACCESS_KEY}"
"#;

    fn load(content: &str) -> Result<Project> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PROJECT_FILE);
        fs::write(&path, content).unwrap();
        Project::load(&path)
    }

    #[test]
    fn test_state_dir_relative_to_project() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PROJECT_FILE);
        fs::write(&path, PROJECT).unwrap();
        let project = Project::load(&path).unwrap();
        assert_eq!(project.state_dir, dir.path().join("state"));
    }

    #[test]
    fn test_load_project() {
        let project = load(PROJECT).unwrap();
        assert_eq!(project.stack_names(), vec!["network", "cluster"]);
        assert_eq!(project.env_prefix, DEFAULT_ENV_PREFIX);
        assert!(project.kinds.contains_key("aws_vpc"));

        let cluster = &project.stacks[1];
        assert_eq!(cluster.depends_on, vec!["network"]);
        assert!(cluster.variable_decl("AWS_SECRET_ACCESS_KEY").unwrap().sensitive);
        assert_eq!(
            cluster.variable_decl("node_count").unwrap().default,
            Some(Literal::Number(2_i64.into()))
        );
        assert_eq!(cluster.remote_source("vpc-state").unwrap().stack, "network");

        let eks = cluster.node("eks").unwrap();
        let refs = eks.config.references();
        assert!(refs.contains(&&Reference::remote("vpc-state", "vpc_id")));
        assert!(refs.contains(&&Reference::remote_list("vpc-state", "subnet_ids")));
        assert!(refs.contains(&&Reference::variable("AWS_SECRET_ACCESS_KEY")));
    }

    #[test]
    fn test_parse_references() {
        assert_eq!(parse_string("x", "${vpc.id}").unwrap(), Value::attr("vpc", "id"));
        assert_eq!(parse_string("x", "${var.REGION}").unwrap(), Value::var("REGION"));
        assert_eq!(
            parse_string("x", "${remote.net.ids[*]}").unwrap(),
            Value::remote_list("net", "ids")
        );
        assert_eq!(parse_string("x", "plain").unwrap(), Value::string("plain"));
    }

    #[test]
    fn test_interpolation_rejected() {
        let err = parse_string("app.web.name", "web-${var.env}").unwrap_err();
        assert!(err.to_string().contains("app.web.name"));
        assert!(err.to_string().contains("interpolation"));

        let err = parse_string("app.web.name", "${just-one-part}").unwrap_err();
        assert!(err.to_string().contains("malformed reference"));
    }

    #[test]
    fn test_default_type_mismatch() {
        let content = r#"
[[stacks]]
name = "app"
[[stacks.variables]]
name = "replicas"
type = "number"
default = "three"
"#;
        let err = load(content).unwrap_err();
        assert!(format!("{err:#}").contains("replicas"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let content = r#"
[[stacks]]
name = "app"
dependson = ["x"]
"#;
        assert!(load(content).is_err());
    }

    #[test]
    fn test_open_registry_without_kinds() {
        let content = r#"
[[stacks]]
name = "app"
"#;
        let project = load(content).unwrap_or_else(|e| panic!("{e:#}"));
        assert!(!project.registry().is_strict());
        assert!(load(PROJECT).unwrap().registry().is_strict());
    }

    #[test]
    fn test_var_flags() {
        use stackgraph::VariableSource;

        let source = var_flags(&["REGION=us-east-1".into(), "cluster.TOKEN=a=b".into()]).unwrap();
        assert_eq!(source.lookup("network", "REGION").as_deref(), Some("us-east-1"));
        assert_eq!(source.lookup("cluster", "TOKEN").as_deref(), Some("a=b"));
        assert_eq!(source.lookup("network", "TOKEN"), None);

        assert!(var_flags(&["NOVALUE".into()]).is_err());
        assert!(var_flags(&["=x".into()]).is_err());
    }

    #[test]
    fn test_var_file() {
        use stackgraph::VariableSource;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prod.vars.toml");
        fs::write(
            &path,
            "REGION = \"us-east-1\"\nnode_count = 3\n\n[cluster]\nenabled = true\n",
        )
        .unwrap();

        let source = var_file(&path).unwrap();
        assert_eq!(source.lookup("cluster", "REGION").as_deref(), Some("us-east-1"));
        assert_eq!(source.lookup("cluster", "node_count").as_deref(), Some("3"));
        assert_eq!(source.lookup("cluster", "enabled").as_deref(), Some("true"));
        assert_eq!(source.lookup("network", "enabled"), None);
    }

    #[test]
    fn test_resolve_path() {
        let base = Path::new("/projects/eks");
        assert_eq!(resolve_path(base, "state"), PathBuf::from("/projects/eks/state"));
        assert_eq!(resolve_path(base, "/var/lib/x"), PathBuf::from("/var/lib/x"));
    }
}
