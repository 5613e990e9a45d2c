//! Sandbox runtime - evaluates an executable unit in its own V8 isolate and
//! serves extraction calls against it.
//!
//! Provides only the minimal APIs a scraping script needs:
//! - console.log/info/debug/warn/error (captured, forwarded to `tracing`)
//! - atob, btoa
//! - `require` for the host modules of the imports table
//! - the extraction call argument: url, doc, absoluteURL, scrape, follow
//! - No fs, net, env, timers or module loading

use crate::error::{Error, Result};
use crate::ops::{scrape_runtime, CallState, ConsoleOutput, DocumentStore, HostRegistry};
use crate::query::QueryDocument;
use deno_core::error::JsError;
use deno_core::{serde_v8, v8, JsRuntime, RuntimeOptions};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{mpsc, Arc};
use url::Url;

/// Fetches the HTML of an absolute URL for `scrape(url, callback)`.
pub type FetchFn = Arc<dyn Fn(&str) -> anyhow::Result<String> + Send + Sync>;

/// Receives every absolute URL a script passes to `follow(url)`.
pub type FollowFn = Arc<dyn Fn(&str) + Send + Sync>;

/// A host function callable from script code with JSON arguments.
pub type HostFn = Arc<dyn Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync>;

/// One identifier exported by a host module.
#[derive(Clone)]
pub enum HostValue {
    Data(Value),
    Function(HostFn),
}

impl HostValue {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::Function(Arc::new(f))
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(value) => f.debug_tuple("Data").field(value).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Identifiers of one host module.
pub type HostModule = BTreeMap<String, HostValue>;

/// Host modules by name, injected before the script runs.
pub type Imports = BTreeMap<String, HostModule>;

/// Configuration for the scrape sandbox
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_heap_size: Some(64 * 1024 * 1024),
        }
    }
}

/// Inputs of one extraction call.
#[derive(Clone)]
pub struct ScrapeParams {
    pub html: String,
    pub url: String,
    pub fetch: FetchFn,
    pub follow: FollowFn,
}

impl ScrapeParams {
    /// Params with fetching disabled and follow signals discarded.
    pub fn new(html: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            url: url.into(),
            fetch: Arc::new(|url: &str| -> anyhow::Result<String> {
                Err(anyhow::anyhow!("fetching is not available for {}", url))
            }),
            follow: Arc::new(|_: &str| {}),
        }
    }

    pub fn with_fetch<F>(mut self, fetch: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.fetch = Arc::new(fetch);
        self
    }

    pub fn with_follow<F>(mut self, follow: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.follow = Arc::new(follow);
        self
    }
}

impl fmt::Debug for ScrapeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrapeParams")
            .field("url", &self.url)
            .field("html", &format_args!("{} bytes", self.html.len()))
            .finish_non_exhaustive()
    }
}

struct Job {
    params: ScrapeParams,
    reply: mpsc::Sender<Result<Value>>,
}

struct Instance {
    keys: Vec<String>,
    config: Vec<u8>,
    config_value: Option<Value>,
    /// The single-call lock. Held for a whole logical invocation, including
    /// every sub-scrape it triggers.
    worker: Mutex<Option<mpsc::Sender<Job>>>,
}

/// What running an executable unit produced. Clones share one sandbox
/// instance and therefore one lock.
#[derive(Clone)]
pub struct Exports {
    inner: Arc<Instance>,
}

impl Exports {
    /// The `config` export as JSON bytes; empty when the script has none.
    pub fn config(&self) -> &[u8] {
        &self.inner.config
    }

    pub fn config_value(&self) -> Option<&Value> {
        self.inner.config_value.as_ref()
    }

    /// Names the script exported.
    pub fn keys(&self) -> &[String] {
        &self.inner.keys
    }

    /// True when the script assigned nothing to `module.exports`.
    pub fn is_empty(&self) -> bool {
        self.inner.keys.is_empty()
    }

    /// Run the extraction function against one page.
    ///
    /// Calls on the same instance never overlap: the lock is taken here and
    /// released only after the result is serialized.
    pub fn invoke(&self, params: ScrapeParams) -> Result<Value> {
        let worker = self.inner.worker.lock();
        let Some(jobs) = worker.as_ref() else {
            return Err(Error::MissingDefaultExport);
        };

        let (reply, result) = mpsc::channel();
        jobs.send(Job { params, reply })
            .map_err(|_| Error::Runtime("sandbox thread is gone".to_string()))?;
        result
            .recv()
            .map_err(|_| Error::Runtime("sandbox thread exited during invocation".to_string()))?
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exports")
            .field("keys", &self.inner.keys)
            .field("config", &self.inner.config_value)
            .finish()
    }
}

/// Evaluate an executable unit in a fresh isolate.
///
/// The isolate is bound to the thread that creates it, so each instance
/// gets a dedicated thread; [`Exports::invoke`] hands calls to it.
pub fn instantiate(unit: String, imports: &Imports, config: &SandboxConfig) -> Result<Exports> {
    let manifest = imports_manifest(imports)?;
    let registry = host_registry(imports);
    let max_heap_size = config.max_heap_size;

    let (ready_tx, ready_rx) = mpsc::channel();
    let (jobs_tx, jobs_rx) = mpsc::channel::<Job>();

    std::thread::Builder::new()
        .name("scrape-sandbox".to_string())
        .spawn(move || {
            let mut sandbox = Sandbox::new(max_heap_size, registry);
            let loaded = sandbox.evaluate(&unit, &manifest);
            let serving = matches!(loaded, Ok(Some(_)));
            if ready_tx.send(loaded).is_err() || !serving {
                return;
            }
            for job in jobs_rx {
                let result = sandbox.invoke(job.params);
                let _ = job.reply.send(result);
            }
            tracing::debug!("sandbox instance shut down");
        })?;

    let loaded = ready_rx
        .recv()
        .map_err(|_| Error::Runtime("sandbox thread exited during startup".to_string()))??;

    let instance = match loaded {
        None => Instance {
            keys: Vec::new(),
            config: Vec::new(),
            config_value: None,
            worker: Mutex::new(None),
        },
        Some(loaded) => {
            let config_value = loaded
                .config
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| Error::Evaluation(format!("reading config: {}", e)))?;
            Instance {
                keys: loaded.keys,
                config: loaded.config.map(String::into_bytes).unwrap_or_default(),
                config_value,
                worker: Mutex::new(Some(jobs_tx)),
            }
        }
    };

    tracing::debug!(keys = ?instance.keys, "script instantiated");
    Ok(Exports {
        inner: Arc::new(instance),
    })
}

/// Describes the imports table to the isolate: data values inline,
/// functions as stubs that call back through `op_host_call`.
fn imports_manifest(imports: &Imports) -> Result<Value> {
    let mut table = Map::new();
    for (name, module) in imports {
        if name.is_empty() || crate::loader::SandboxedLoader::is_local(name) {
            return Err(Error::Runtime(format!(
                "host module name '{}' must be a bare specifier",
                name
            )));
        }
        let mut entries = Map::new();
        for (ident, value) in module {
            let entry = match value {
                HostValue::Data(data) => json!({ "kind": "data", "value": data }),
                HostValue::Function(_) => json!({ "kind": "function" }),
            };
            entries.insert(ident.clone(), entry);
        }
        table.insert(name.clone(), Value::Object(entries));
    }
    Ok(Value::Object(table))
}

fn host_registry(imports: &Imports) -> HostRegistry {
    let mut registry = HostRegistry::default();
    for (name, module) in imports {
        for (ident, value) in module {
            if let HostValue::Function(function) = value {
                registry.insert(name, ident, Arc::clone(function));
            }
        }
    }
    registry
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ExportsMeta {
    defined: bool,
    keys: Vec<String>,
    has_default: bool,
    config: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InvokeOutcome {
    json: Option<String>,
    serialize_error: Option<String>,
}

struct Loaded {
    keys: Vec<String>,
    config: Option<String>,
}

/// Message of a script exception, falling back to the error chain.
fn js_message(err: &anyhow::Error) -> String {
    match err.downcast_ref::<JsError>() {
        Some(js) => js.exception_message.clone(),
        None => format!("{:#}", err),
    }
}

/// The thread-bound half of an instance.
struct Sandbox {
    runtime: JsRuntime,
}

impl Sandbox {
    fn new(max_heap_size: Option<usize>, registry: HostRegistry) -> Self {
        // Configure V8 heap limits if specified
        let create_params =
            max_heap_size.map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

        let mut runtime = JsRuntime::new(RuntimeOptions {
            extensions: vec![scrape_runtime::init_ops_and_esm()],
            create_params,
            ..Default::default()
        });

        if max_heap_size.is_some() {
            runtime.add_near_heap_limit_callback(|current, initial| {
                // Keep the limit so V8 terminates instead of growing
                tracing::warn!(
                    current_mb = current / (1024 * 1024),
                    initial_mb = initial / (1024 * 1024),
                    "script near heap limit"
                );
                current
            });
        }

        {
            let state = runtime.op_state();
            let mut state = state.borrow_mut();
            state.put(ConsoleOutput::default());
            state.put(DocumentStore::default());
            state.put(registry);
        }

        Self { runtime }
    }

    /// Run a snippet and decode what it evaluates to.
    fn call<T: DeserializeOwned>(&mut self, name: &'static str, code: String) -> anyhow::Result<T> {
        let result = self.runtime.execute_script(name, code)?;
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, result);
        Ok(serde_v8::from_v8(scope, local)?)
    }

    /// Register host modules, run the unit once and read its exports.
    /// `None` means the unit never assigned `module.exports`.
    fn evaluate(&mut self, unit: &str, manifest: &Value) -> Result<Option<Loaded>> {
        let setup = format!(
            "globalThis.__sandbox_register__({}); globalThis.module = {{}};",
            manifest
        );
        self.runtime
            .execute_script("<imports>", setup)
            .map_err(|e| Error::Runtime(js_message(&e)))?;

        let ran = self.runtime.execute_script("<script>", unit.to_string());
        self.drain_console();
        ran.map_err(|e| Error::Evaluation(js_message(&e)))?;

        let meta: ExportsMeta = self
            .call("<exports>", "globalThis.__sandbox_exports__()".to_string())
            .map_err(|e| Error::Evaluation(format!("reading config: {}", js_message(&e))))?;

        if !meta.defined {
            return Ok(None);
        }
        if !meta.has_default {
            return Err(Error::MissingDefaultExport);
        }
        Ok(Some(Loaded {
            keys: meta.keys,
            config: meta.config,
        }))
    }

    /// One logical extraction call, sub-scrapes included.
    fn invoke(&mut self, params: ScrapeParams) -> Result<Value> {
        Url::parse(&params.url).map_err(|source| Error::BaseUrl {
            url: params.url.clone(),
            source,
        })?;

        let document = QueryDocument::parse(&params.html);
        let handle = {
            let state = self.runtime.op_state();
            let mut state = state.borrow_mut();
            state.put(CallState {
                fetch: params.fetch,
                follow: params.follow,
            });
            state.borrow_mut::<DocumentStore>().insert(document)
        };

        let url = Value::String(params.url).to_string();
        let code = format!("globalThis.__sandbox_invoke__({}, {})", url, handle);
        let outcome = self.call::<InvokeOutcome>("<invoke>", code);

        {
            let state = self.runtime.op_state();
            let mut state = state.borrow_mut();
            state.try_take::<CallState>();
            state.borrow_mut::<DocumentStore>().clear();
        }
        self.drain_console();

        let outcome = outcome.map_err(|e| Error::Execution(js_message(&e)))?;
        if let Some(message) = outcome.serialize_error {
            return Err(Error::Serialization(message));
        }
        match outcome.json {
            Some(json) => {
                serde_json::from_str(&json).map_err(|e| Error::Serialization(e.to_string()))
            }
            None => Ok(Value::Null),
        }
    }

    /// Forward captured console output to `tracing`.
    fn drain_console(&mut self) {
        let output = std::mem::take(
            self.runtime
                .op_state()
                .borrow_mut()
                .borrow_mut::<ConsoleOutput>(),
        );
        for line in output.logs {
            tracing::info!(target: "scrape_sandbox::script", "{}", line);
        }
        for line in output.warns {
            tracing::warn!(target: "scrape_sandbox::script", "{}", line);
        }
        for line in output.errors {
            tracing::error!(target: "scrape_sandbox::script", "{}", line);
        }
    }
}
