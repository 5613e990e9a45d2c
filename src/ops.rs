//! Custom ops and the `scrape_runtime` extension.
//!
//! Ops are the only way script code reaches the host: console capture,
//! base64, host module calls, query documents and the scrape/follow
//! collaborators of the current extraction call.

use crate::query::{Axis, QueryDocument};
use crate::runtime::{FetchFn, FollowFn, HostFn};
use anyhow::{anyhow, Error};
use deno_core::{op2, OpState};
use serde_json::Value;
use std::collections::HashMap;
use url::Url;

// ============================================================================
// Console Output Capture
// ============================================================================

/// Captured console output from the sandboxed runtime
#[derive(Debug, Default, Clone)]
pub struct ConsoleOutput {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.logs.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.warns.push(msg.to_string());
    }
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        output.errors.push(msg.to_string());
    }
}

// ============================================================================
// Encoding Ops
// ============================================================================

#[op2]
#[string]
pub fn op_btoa(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    // btoa expects Latin-1, but we'll be lenient and accept UTF-8
    Ok(base64::engine::general_purpose::STANDARD.encode(data.as_bytes()))
}

#[op2]
#[string]
pub fn op_atob(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| anyhow!("Invalid base64: {}", e))?;
    String::from_utf8(bytes).map_err(|e| anyhow!("Invalid UTF-8 in decoded data: {}", e))
}

// ============================================================================
// Host Modules
// ============================================================================

/// Host functions of the imports table, keyed by module and identifier.
#[derive(Clone, Default)]
pub struct HostRegistry {
    functions: HashMap<(String, String), HostFn>,
}

impl HostRegistry {
    pub fn insert(&mut self, module: &str, ident: &str, function: HostFn) {
        self.functions
            .insert((module.to_string(), ident.to_string()), function);
    }

    fn get(&self, module: &str, ident: &str) -> Option<HostFn> {
        self.functions
            .get(&(module.to_string(), ident.to_string()))
            .cloned()
    }
}

#[op2]
#[serde]
pub fn op_host_call(
    state: &mut OpState,
    #[string] module: String,
    #[string] ident: String,
    #[serde] args: Vec<serde_json::Value>,
) -> Result<serde_json::Value, Error> {
    let function = state
        .try_borrow::<HostRegistry>()
        .and_then(|registry| registry.get(&module, &ident))
        .ok_or_else(|| anyhow!("'{}' is not a function of module '{}'", ident, module))?;
    function(args)
}

// ============================================================================
// Extraction Call Collaborators
// ============================================================================

/// Collaborators of the extraction call currently running. Present only
/// while an invocation is in progress.
pub struct CallState {
    pub fetch: FetchFn,
    pub follow: FollowFn,
}

/// Query documents handed to script code, addressed by handle. Cleared at
/// the end of every invocation; handles are never reused, so stale or
/// unknown handles read as empty documents.
#[derive(Default)]
pub struct DocumentStore {
    documents: Vec<QueryDocument>,
    base: u32,
}

impl DocumentStore {
    pub fn insert(&mut self, document: QueryDocument) -> u32 {
        self.documents.push(document);
        self.base.wrapping_add(self.documents.len() as u32 - 1)
    }

    pub fn get(&self, handle: u32) -> Option<&QueryDocument> {
        let index = handle.wrapping_sub(self.base);
        self.documents.get(index as usize)
    }

    pub fn clear(&mut self) {
        self.base = self.base.wrapping_add(self.documents.len() as u32);
        self.documents.clear();
    }

    fn read<R: Default>(&self, handle: u32, f: impl FnOnce(&QueryDocument) -> R) -> R {
        self.get(handle).map(f).unwrap_or_default()
    }

    fn derive(&mut self, handle: u32, f: impl FnOnce(&QueryDocument) -> QueryDocument) -> u32 {
        let derived = self.get(handle).map(f).unwrap_or_else(QueryDocument::empty);
        self.insert(derived)
    }
}

/// Join `reference` onto `base`; a reference that cannot be joined is
/// returned unchanged.
pub fn resolve_reference(base: &str, reference: &str) -> String {
    Url::parse(base)
        .and_then(|base| base.join(reference))
        .map(|url| url.to_string())
        .unwrap_or_else(|_| reference.to_string())
}

#[op2]
#[string]
pub fn op_resolve_url(#[string] base: &str, #[string] reference: &str) -> String {
    resolve_reference(base, reference)
}

#[op2(fast)]
pub fn op_fetch_document(state: &mut OpState, #[string] url: &str) -> Result<u32, Error> {
    let fetch = state
        .try_borrow::<CallState>()
        .map(|call| call.fetch.clone())
        .ok_or_else(|| anyhow!("scrape() is only available during extraction"))?;

    tracing::debug!(url, "sub-scrape fetch");
    let html = fetch(url)?;
    let document = QueryDocument::parse(&html);
    Ok(state.borrow_mut::<DocumentStore>().insert(document))
}

#[op2(fast)]
pub fn op_follow(state: &mut OpState, #[string] url: &str) -> Result<(), Error> {
    let follow = state
        .try_borrow::<CallState>()
        .map(|call| call.follow.clone())
        .ok_or_else(|| anyhow!("follow() is only available during extraction"))?;
    follow(url);
    Ok(())
}

// ============================================================================
// Query Document Ops
// ============================================================================

#[op2]
#[string]
pub fn op_query_text(state: &mut OpState, handle: u32) -> String {
    state.borrow::<DocumentStore>().read(handle, QueryDocument::text)
}

#[op2]
#[string]
pub fn op_query_html(state: &mut OpState, handle: u32) -> String {
    state.borrow::<DocumentStore>().read(handle, QueryDocument::html)
}

#[op2]
#[string]
pub fn op_query_name(state: &mut OpState, handle: u32) -> String {
    state.borrow::<DocumentStore>().read(handle, QueryDocument::name)
}

#[op2]
#[string]
pub fn op_query_attr(state: &mut OpState, handle: u32, #[string] name: &str) -> String {
    state
        .borrow::<DocumentStore>()
        .read(handle, |doc| doc.attr(name))
}

#[op2(fast)]
pub fn op_query_has_attr(state: &mut OpState, handle: u32, #[string] name: &str) -> bool {
    state
        .borrow::<DocumentStore>()
        .read(handle, |doc| doc.has_attr(name))
}

#[op2(fast)]
pub fn op_query_has_class(state: &mut OpState, handle: u32, #[string] name: &str) -> bool {
    state
        .borrow::<DocumentStore>()
        .read(handle, |doc| doc.has_class(name))
}

#[op2(fast)]
pub fn op_query_length(state: &mut OpState, handle: u32) -> u32 {
    state
        .borrow::<DocumentStore>()
        .read(handle, |doc| doc.len() as u32)
}

#[op2(fast)]
pub fn op_query_first(state: &mut OpState, handle: u32) -> u32 {
    state.borrow_mut::<DocumentStore>().derive(handle, QueryDocument::first)
}

#[op2(fast)]
pub fn op_query_last(state: &mut OpState, handle: u32) -> u32 {
    state.borrow_mut::<DocumentStore>().derive(handle, QueryDocument::last)
}

#[op2(fast)]
pub fn op_query_get(state: &mut OpState, handle: u32, index: i32) -> u32 {
    state
        .borrow_mut::<DocumentStore>()
        .derive(handle, |doc| doc.get(i64::from(index)))
}

#[op2(fast)]
pub fn op_query_find(state: &mut OpState, handle: u32, #[string] selector: &str) -> u32 {
    state
        .borrow_mut::<DocumentStore>()
        .derive(handle, |doc| doc.find(selector))
}

#[op2(fast)]
pub fn op_query_traverse(
    state: &mut OpState,
    handle: u32,
    #[string] axis: &str,
) -> Result<u32, Error> {
    let axis: Axis = axis.parse()?;
    Ok(state
        .borrow_mut::<DocumentStore>()
        .derive(handle, |doc| doc.traverse(axis, None)))
}

#[op2(fast)]
pub fn op_query_until(
    state: &mut OpState,
    handle: u32,
    #[string] axis: &str,
    #[string] selector: &str,
) -> Result<u32, Error> {
    let axis: Axis = axis.parse()?;
    Ok(state
        .borrow_mut::<DocumentStore>()
        .derive(handle, |doc| doc.traverse(axis, Some(selector))))
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    scrape_runtime,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_btoa,
        op_atob,
        op_host_call,
        op_resolve_url,
        op_fetch_document,
        op_follow,
        op_query_text,
        op_query_html,
        op_query_name,
        op_query_attr,
        op_query_has_attr,
        op_query_has_class,
        op_query_length,
        op_query_first,
        op_query_last,
        op_query_get,
        op_query_find,
        op_query_traverse,
        op_query_until,
    ],
    esm_entry_point = "ext:scrape_runtime/bootstrap.js",
    esm = ["ext:scrape_runtime/bootstrap.js" = "src/bootstrap.js"],
);
