//! Round-trips schema and dataset JSON fixtures through `oamap-core`.
//!
//! Usage: `dev-test-runner [--only REGEX] [PATTERN...]`. Patterns are file
//! paths or globs; the default is every fixture next to this crate. A
//! fixture holds a `schema` or a `dataset`, and optionally `buffers` plus the
//! `expect`ed JSON rendering of the root value.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use indexmap::IndexMap;
use oamap_core::{Buffer, DType, Dataset, Datum, MemorySource, Scalar, Schema};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PATTERN: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/*.json");

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Fixture {
    #[serde(default)]
    schema: Option<Value>,
    #[serde(default)]
    dataset: Option<Value>,
    #[serde(default)]
    buffers: IndexMap<String, BufferJson>,
    #[serde(default)]
    expect: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct BufferJson {
    dtype: String,
    values: Vec<Value>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_target(false)
        .init();

    let mut only: Option<Regex> = None;
    let mut patterns = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--only" {
            let raw = args.next().context("--only needs a regex")?;
            only = Some(Regex::new(&raw)?);
        } else {
            patterns.push(arg);
        }
    }
    if patterns.is_empty() {
        patterns.push(DEFAULT_PATTERN.to_string());
    }

    let mut failed = 0usize;
    let mut passed = 0usize;
    for path in resolve_file_path_patterns(&patterns)? {
        let shown = path.display().to_string();
        if only.as_ref().is_some_and(|re| !re.is_match(&shown)) {
            continue;
        }
        match run_fixture(&path) {
            Ok(()) => {
                info!("ok   {shown}");
                passed += 1;
            }
            Err(e) => {
                warn!("FAIL {shown}: {e:#}");
                failed += 1;
            }
        }
    }
    info!("{passed} passed, {failed} failed");
    if failed > 0 {
        bail!("{failed} fixture(s) failed");
    }
    Ok(())
}

// ————————————————————————————————————————————————————————————————————————————
// FIXTURES
// ————————————————————————————————————————————————————————————————————————————

fn run_fixture(path: &PathBuf) -> anyhow::Result<()> {
    let src = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let de = &mut serde_json::Deserializer::from_str(&src);
    let fixture: Fixture = serde_path_to_error::deserialize(de).context("parsing fixture")?;

    let dataset = match (&fixture.schema, &fixture.dataset) {
        (Some(schema), None) => {
            let schema = Schema::from_json(schema)?;
            for explicit in [false, true] {
                let again = Schema::from_json(&schema.to_json(explicit)?)?;
                if again != schema {
                    bail!("schema changed in a round trip (explicit = {explicit}):\n{again}\n!=\n{schema}");
                }
            }
            Dataset::new(schema)
        }
        (None, Some(dataset)) => {
            let dataset = Dataset::from_json(dataset)?;
            for explicit in [false, true] {
                let again = Dataset::from_json(&dataset.to_json(explicit)?)?;
                if again != dataset {
                    bail!("dataset changed in a round trip (explicit = {explicit})");
                }
            }
            dataset
        }
        _ => bail!("a fixture holds exactly one of \"schema\" and \"dataset\""),
    };

    let Some(expect) = fixture.expect else {
        return Ok(());
    };
    let source = fixture
        .buffers
        .into_iter()
        .map(|(name, b)| Ok((name, to_buffer(b)?)))
        .collect::<anyhow::Result<MemorySource>>()?;
    let data = dataset.data(Arc::new(source))?;
    let found = data.read(|root| to_json(&root))?;
    debug!("read {}", found);
    if found != expect {
        bail!("read {found}, expected {expect}");
    }
    Ok(())
}

fn to_buffer(json: BufferJson) -> anyhow::Result<Buffer> {
    let dtype: DType = json.dtype.parse()?;
    let mut out = Buffer::with_capacity(dtype, json.values.len());
    for v in json.values {
        let scalar = match v {
            Value::Bool(b) => Scalar::from(b),
            Value::Number(n) if n.is_i64() => Scalar::from(n.as_i64().unwrap_or_default()),
            Value::Number(n) if n.is_u64() => Scalar::from(n.as_u64().unwrap_or_default()),
            Value::Number(n) => Scalar::from(n.as_f64().unwrap_or(f64::NAN)),
            other => bail!("buffer values must be numbers or booleans, found {other}"),
        };
        out.push(scalar);
    }
    Ok(out)
}

/// Renders a value the way fixtures spell it.
fn to_json(datum: &Datum<'_>) -> oamap_core::Result<Value> {
    Ok(match datum {
        Datum::Null => Value::Null,
        Datum::Scalar(s) => scalar_json(*s),
        Datum::Block { values, .. } => Value::Array(values.iter().copied().map(scalar_json).collect()),
        Datum::Str(s) => Value::String(s.clone()),
        Datum::Bytes(b) => json!(b),
        Datum::List(list) => Value::Array(list.iter().map(|x| to_json(&x?)).collect::<oamap_core::Result<_>>()?),
        Datum::Record(record) => {
            let mut out = Map::new();
            for name in record.fields() {
                out.insert(name.to_string(), to_json(&record.field(name)?)?);
            }
            Value::Object(out)
        }
        Datum::Tuple(tuple) => {
            Value::Array((0..tuple.len()).map(|i| to_json(&tuple.get(i)?)).collect::<oamap_core::Result<_>>()?)
        }
    })
}

fn scalar_json(s: Scalar) -> Value {
    match s {
        Scalar::Bool(b) => json!(b),
        Scalar::Int(i) => json!(i),
        Scalar::UInt(u) => json!(u),
        Scalar::Float(x) => json!(x.0),
    }
}

fn resolve_file_path_patterns<I>(patterns: I) -> anyhow::Result<Vec<PathBuf>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    fn has_glob_chars(s: &str) -> bool {
        s.bytes().any(|b| matches!(b, b'*' | b'?' | b'['))
    }

    let mut out = Vec::<PathBuf>::new();
    for raw in patterns {
        let pattern = raw.as_ref();
        if has_glob_chars(pattern) {
            let before = out.len();
            for entry in glob::glob(pattern)? {
                out.push(entry?);
            }
            if out.len() == before {
                bail!("glob pattern matched no files: {pattern}");
            }
        } else {
            out.push(PathBuf::from(pattern));
        }
    }
    out.sort();
    Ok(out)
}
