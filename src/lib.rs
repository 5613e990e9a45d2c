//! # Scrape Sandbox
//!
//! Runs user-written scraping scripts against HTML pages inside a V8
//! isolate, using deno_core.
//!
//! ## Security Guarantees
//!
//! - **No filesystem access**: local imports are bundled at compile time from
//!   inside the resolve directory; the script itself cannot read files
//! - **No network access**: pages are only reachable through the host's
//!   fetch collaborator, via `scrape(url, callback)`
//! - **No environment access**: `process.env`, `Deno.env` don't exist
//! - **No concurrent entry**: calls on one instance are serialized
//!
//! ## Usage
//!
//! ```rust,ignore
//! use scrape_sandbox::{compile, Imports, ScrapeParams};
//!
//! let exports = compile(
//!     r#"export default function ({ doc, follow }) {
//!         doc.find("a.next").map((a) => follow(a.attr("href")));
//!         return { title: doc.find("title").text() };
//!     }"#,
//!     &Imports::new(),
//! )?;
//!
//! let params = ScrapeParams::new(html, "https://example.com/")
//!     .with_follow(|url| println!("discovered {url}"));
//! let result = exports.invoke(params)?;
//! ```

mod error;
mod fetch;
mod loader;
mod ops;
mod query;
mod runtime;
mod transform;


pub use error::{Diagnostic, Error, Result};
pub use fetch::{FetchConfig, HttpFetcher};
pub use loader::SandboxedLoader;
pub use query::{Axis, QueryDocument};
pub use runtime::{
    instantiate, Exports, FetchFn, FollowFn, HostFn, HostModule, HostValue, Imports,
    SandboxConfig, ScrapeParams,
};
pub use transform::{transform, TransformOptions, FRAMEWORK_MODULE};

/// Starter script for new scrapers.
pub const SCRIPT_TEMPLATE: &str = include_str!("template.js");

/// Transform `source` and evaluate it with default options.
pub fn compile(source: &str, imports: &Imports) -> Result<Exports> {
    compile_with(
        source,
        imports,
        &TransformOptions::default(),
        &SandboxConfig::default(),
    )
}

/// Transform `source` and evaluate it. Every name in `imports` is left to
/// the host when bundling.
pub fn compile_with(
    source: &str,
    imports: &Imports,
    options: &TransformOptions,
    config: &SandboxConfig,
) -> Result<Exports> {
    let mut options = options.clone();
    options.external.extend(imports.keys().cloned());

    let unit = transform(source, &options)?;
    tracing::debug!(bytes = unit.len(), "script transformed");
    instantiate(unit, imports, config)
}
