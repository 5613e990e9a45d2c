//! Source transformer: bundles a script and the local modules it imports
//! into one classic script that assigns `module.exports`.
//!
//! ES module syntax is lowered by rewriting the source at the spans the
//! parser reports, so everything that is not an import or export passes
//! through byte for byte.

use crate::error::{Diagnostic, Error, Result};
use crate::loader::{AssetKind, LoadedModule, SandboxedLoader};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use swc_core::common::{
    sync::Lrc, BytePos, FileName, Globals, Mark, SourceFile, SourceMap, Span, Spanned, GLOBALS,
};
use swc_core::ecma::ast::{
    Callee, Decl, DefaultDecl, EsVersion, ExportSpecifier, Expr, Id, ImportDecl, ImportSpecifier,
    Module, ModuleDecl, ModuleExportName, ModuleItem, ObjectPatProp, Pat, Prop,
};
use swc_core::ecma::parser::{lexer::Lexer, Parser, StringInput, Syntax};
use swc_core::ecma::transforms::base::resolver;
use swc_core::ecma::visit::{Visit, VisitMutWith, VisitWith};

/// The framework's own module namespace, always left to the host.
pub const FRAMEWORK_MODULE: &str = "scrape-sandbox";

#[derive(Debug, Clone)]
pub struct TransformOptions {
    /// Directory the entry source is resolved against; local imports may
    /// not leave it.
    pub resolve_dir: PathBuf,
    /// Extra host module names to leave unresolved.
    pub external: Vec<String>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            resolve_dir: PathBuf::from("."),
            external: Vec::new(),
        }
    }
}

impl TransformOptions {
    fn is_external(&self, specifier: &str) -> bool {
        let matches = |name: &str| {
            specifier == name
                || specifier
                    .strip_prefix(name)
                    .is_some_and(|rest| rest.starts_with('/'))
        };
        matches(FRAMEWORK_MODULE) || self.external.iter().any(|name| matches(name))
    }
}

/// Bundle `source` into an executable unit, or report every diagnostic found
/// across the module graph.
pub fn transform(source: &str, options: &TransformOptions) -> Result<String> {
    let mut bundler = Bundler::new(options);
    bundler.run(source);
    bundler.finish()
}

const PRELUDE: &str = r#"(function () {
function __importDefault(m) { return m && m.__esModule ? m.default : m; }
function __export(to, name, get) { Object.defineProperty(to, name, { enumerable: true, get: get }); }
function __exportStar(from, to) {
  for (var key in from) {
    if (key !== "default" && !Object.prototype.hasOwnProperty.call(to, key)) {
      Object.defineProperty(to, key, { enumerable: true, get: function (k) { return from[k]; }.bind(null, key) });
    }
  }
}
var __defs = [
"#;

const EPILOGUE: &str = r#"];
var __cache = [];
function __load(id) {
  var cached = __cache[id];
  if (cached) return cached.exports;
  var module = { exports: {} };
  __cache[id] = module;
  __run(id, module);
  return module.exports;
}
function __run(id, module) {
  var deps = __defs[id][1];
  __defs[id][0].call(module.exports, module, module.exports, function (spec) {
    return Object.prototype.hasOwnProperty.call(deps, spec) ? __load(deps[spec]) : globalThis.require(spec);
  });
}
var __main = { exports: {} };
var __blank = __main.exports;
__cache[0] = __main;
__run(0, __main);
if (__main.exports !== __blank || Object.keys(__blank).some(function (key) { return key !== "__esModule"; })) {
  module.exports = __main.exports;
}
})();
"#;

/// One module of the bundle: its CommonJS body and where its local
/// specifiers point.
#[derive(Default)]
struct BundledModule {
    code: String,
    deps: BTreeMap<String, usize>,
}

struct Pending {
    index: usize,
    file: Option<String>,
    dir: PathBuf,
    kind: AssetKind,
    source: String,
}

struct Bundler<'a> {
    options: &'a TransformOptions,
    loader: std::result::Result<SandboxedLoader, String>,
    modules: Vec<BundledModule>,
    by_path: HashMap<PathBuf, usize>,
    queue: VecDeque<Pending>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Bundler<'a> {
    fn new(options: &'a TransformOptions) -> Self {
        Self {
            options,
            loader: SandboxedLoader::new(&options.resolve_dir).map_err(|e| e.to_string()),
            modules: Vec::new(),
            by_path: HashMap::new(),
            queue: VecDeque::new(),
            diagnostics: Vec::new(),
        }
    }

    fn run(&mut self, entry: &str) {
        let dir = match &self.loader {
            Ok(loader) => loader.allowed_dir().to_path_buf(),
            Err(_) => self.options.resolve_dir.clone(),
        };
        self.modules.push(BundledModule::default());
        self.queue.push_back(Pending {
            index: 0,
            file: None,
            dir,
            kind: AssetKind::Script,
            source: entry.to_string(),
        });

        while let Some(pending) = self.queue.pop_front() {
            let module = match pending.kind {
                AssetKind::Script => self.script(&pending),
                AssetKind::Json => self.json(&pending),
                AssetKind::Text => Some(text_module(&pending.source)),
            };
            if let Some(module) = module {
                self.modules[pending.index] = module;
            }
        }
    }

    fn finish(self) -> Result<String> {
        if !self.diagnostics.is_empty() {
            return Err(Error::Transform(self.diagnostics));
        }

        let mut out = String::from(PRELUDE);
        for module in &self.modules {
            let deps = serde_json::json!(&module.deps).to_string();
            out.push_str("[function (module, exports, require) {");
            out.push_str(&module.code);
            out.push_str("\n}, ");
            out.push_str(&deps);
            out.push_str("],\n");
        }
        out.push_str(EPILOGUE);
        Ok(out)
    }

    fn report(&mut self, file: &Option<String>, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic.in_file(file.clone()));
    }

    /// Point `specifier` at a bundled module, queueing it on first sight.
    /// Host specifiers are left for the runtime `require`.
    fn link(
        &mut self,
        pending: &Pending,
        specifier: &str,
        at: (usize, usize),
        deps: &mut BTreeMap<String, usize>,
    ) {
        if self.options.is_external(specifier) || deps.contains_key(specifier) {
            return;
        }

        let resolved = match &self.loader {
            Ok(loader) => loader
                .resolve(specifier, &pending.dir)
                .and_then(|path| loader.load(&path))
                .map(|loaded| {
                    let display = loader.display_name(&loaded.path);
                    (loaded, display)
                }),
            Err(e) => Err(anyhow::anyhow!("{}", e)),
        };

        match resolved {
            Ok((loaded, display)) => {
                let index = self.enqueue(loaded, display);
                deps.insert(specifier.to_string(), index);
            }
            Err(e) => {
                let (line, column) = at;
                self.report(&pending.file, Diagnostic::new(line, column, e.to_string()));
            }
        }
    }

    fn enqueue(&mut self, loaded: LoadedModule, display: String) -> usize {
        if let Some(index) = self.by_path.get(&loaded.path) {
            return *index;
        }
        let index = self.modules.len();
        self.modules.push(BundledModule::default());
        self.by_path.insert(loaded.path.clone(), index);
        self.queue.push_back(Pending {
            index,
            file: Some(display),
            dir: loaded
                .path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_default(),
            kind: loaded.kind,
            source: loaded.source,
        });
        index
    }

    fn json(&mut self, pending: &Pending) -> Option<BundledModule> {
        match serde_json::from_str::<serde_json::Value>(&pending.source) {
            Ok(_) => Some(BundledModule {
                code: format!("\nmodule.exports = {};", pending.source.trim()),
                deps: BTreeMap::new(),
            }),
            Err(e) => {
                let diagnostic = Diagnostic::new(e.line(), e.column().saturating_sub(1), e.to_string());
                self.report(&pending.file, diagnostic);
                None
            }
        }
    }

    fn script(&mut self, pending: &Pending) -> Option<BundledModule> {
        let cm: Lrc<SourceMap> = Default::default();
        let name = pending.file.clone().unwrap_or_else(|| "<stdin>".to_string());
        let fm = cm.new_source_file(FileName::Custom(name).into(), pending.source.clone());

        let lexer = Lexer::new(
            Syntax::Es(Default::default()),
            EsVersion::EsNext,
            StringInput::from(&*fm),
            None,
        );
        let mut parser = Parser::new_from(lexer);
        let parsed = parser.parse_module();

        let mut errors = parser.take_errors();
        let module = match parsed {
            Ok(module) => Some(module),
            Err(fatal) => {
                errors.push(fatal);
                None
            }
        };
        errors.sort_by_key(|e| e.span().lo);
        let failed = !errors.is_empty();
        for error in errors {
            let (line, column) = position(&cm, &fm, error.span().lo);
            self.report(&pending.file, Diagnostic::new(line, column, error.kind().msg()));
        }

        let mut module = module?;
        let rewritten = GLOBALS.set(&Globals::new(), || {
            // Marks top-level bindings so references to imports can be told
            // apart from shadowing locals.
            module.visit_mut_with(&mut resolver(Mark::new(), Mark::new(), false));
            Rewriter::new(&cm, &fm, &pending.source).rewrite(&module)
        });

        let mut deps = BTreeMap::new();
        for (specifier, at) in &rewritten.specifiers {
            self.link(pending, specifier, *at, &mut deps);
        }

        if failed {
            return None;
        }
        Some(BundledModule {
            code: rewritten.code,
            deps,
        })
    }
}

fn text_module(source: &str) -> BundledModule {
    let literal = serde_json::Value::String(source.to_string()).to_string();
    BundledModule {
        code: format!("\nmodule.exports = {};", literal),
        deps: BTreeMap::new(),
    }
}

/// 1-based line, 0-based column of `pos`.
fn position(cm: &SourceMap, fm: &SourceFile, pos: BytePos) -> (usize, usize) {
    if pos < fm.start_pos || pos > fm.end_pos {
        return (1, 0);
    }
    let loc = cm.lookup_char_pos(pos);
    (loc.line, loc.col.0)
}

fn quoted(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

struct Edit {
    start: usize,
    end: usize,
    text: String,
}

struct Rewritten {
    code: String,
    specifiers: Vec<(String, (usize, usize))>,
}

struct Rewriter<'a> {
    cm: &'a SourceMap,
    fm: &'a SourceFile,
    source: &'a str,
    edits: Vec<Edit>,
    /// Export getters, defined before anything is required so a cycle
    /// back into this module sees every name.
    exports: Vec<String>,
    /// Hoisted `require` calls and star re-exports, in source order.
    requires: Vec<String>,
    /// Namespace variable per required specifier.
    namespaces: HashMap<String, String>,
    /// What each imported binding reads from.
    imports: HashMap<Id, String>,
    specifiers: Vec<(String, (usize, usize))>,
}

impl<'a> Rewriter<'a> {
    fn new(cm: &'a SourceMap, fm: &'a SourceFile, source: &'a str) -> Self {
        Self {
            cm,
            fm,
            source,
            edits: Vec::new(),
            exports: Vec::new(),
            requires: Vec::new(),
            namespaces: HashMap::new(),
            imports: HashMap::new(),
            specifiers: Vec::new(),
        }
    }

    fn offset(&self, pos: BytePos) -> usize {
        (pos.0.saturating_sub(self.fm.start_pos.0) as usize).min(self.source.len())
    }

    fn replace(&mut self, from: BytePos, to: BytePos, text: impl Into<String>) {
        self.edits.push(Edit {
            start: self.offset(from),
            end: self.offset(to),
            text: text.into(),
        });
    }

    fn remove(&mut self, span: Span) {
        self.replace(span.lo, span.hi, "");
    }

    /// Source text of a string literal, without its quotes.
    fn literal(&self, span: Span) -> String {
        let raw = &self.source[self.offset(span.lo)..self.offset(span.hi)];
        let inner = raw.get(1..raw.len().saturating_sub(1)).unwrap_or_default();
        inner.to_string()
    }

    fn export_name(&self, name: &ModuleExportName) -> String {
        match name {
            ModuleExportName::Ident(ident) => ident.sym.to_string(),
            ModuleExportName::Str(s) => self.literal(s.span),
        }
    }

    /// End of the `default` keyword in an `export default ...` item.
    fn default_keyword_end(&self, span: Span) -> BytePos {
        let start = self.offset(span.lo);
        let found = self.source[start..]
            .find("default")
            .map(|at| start + at + "default".len())
            .unwrap_or(start);
        BytePos(self.fm.start_pos.0 + found as u32)
    }

    /// The namespace variable holding `require(<specifier>)`; the first
    /// sight of a specifier records it and hoists the call.
    fn namespace(&mut self, span: Span) -> String {
        let specifier = self.literal(span);
        if let Some(name) = self.namespaces.get(&specifier) {
            return name.clone();
        }
        let at = position(self.cm, self.fm, span.lo);
        self.specifiers.push((specifier.clone(), at));

        let name = format!("__imp{}", self.namespaces.len());
        self.requires
            .push(format!("var {} = require({});", name, quoted(&specifier)));
        self.namespaces.insert(specifier, name.clone());
        name
    }

    fn export(&mut self, exported: &str, value: &str) {
        self.exports.push(format!(
            "__export(exports, {}, function () {{ return {}; }});",
            quoted(exported),
            value
        ));
    }

    fn rewrite(mut self, module: &Module) -> Rewritten {
        for item in &module.body {
            if let ModuleItem::ModuleDecl(ModuleDecl::Import(import)) = item {
                self.import(import);
            }
        }

        let mut is_esm = false;
        for item in &module.body {
            let ModuleItem::ModuleDecl(decl) = item else {
                continue;
            };
            is_esm = true;
            self.module_decl(decl);
        }

        let found = {
            let mut references = References {
                imports: &self.imports,
                found: Vec::new(),
            };
            module.visit_with(&mut references);
            references.found
        };
        for (span, text) in found {
            self.replace(span.lo, span.hi, text);
        }

        let mut code = String::new();
        if is_esm {
            code.push_str("\"use strict\";exports.__esModule = true;");
        }
        for line in self.exports.iter().chain(&self.requires) {
            code.push_str(line);
        }
        code.push('\n');
        code.push_str(&apply_edits(self.source, self.edits));

        Rewritten {
            code,
            specifiers: self.specifiers,
        }
    }

    fn import(&mut self, import: &ImportDecl) {
        let ns = self.namespace(import.src.span);
        for specifier in &import.specifiers {
            let (local, target) = match specifier {
                ImportSpecifier::Default(default) => {
                    (&default.local, format!("__importDefault({})", ns))
                }
                ImportSpecifier::Namespace(namespace) => (&namespace.local, ns.clone()),
                ImportSpecifier::Named(named) => {
                    let imported = named
                        .imported
                        .as_ref()
                        .map(|name| self.export_name(name))
                        .unwrap_or_else(|| named.local.sym.to_string());
                    let target = if imported == "default" {
                        format!("__importDefault({})", ns)
                    } else {
                        format!("{}[{}]", ns, quoted(&imported))
                    };
                    (&named.local, target)
                }
            };
            self.imports.insert(local.to_id(), target);
        }
        self.remove(import.span);
    }

    fn module_decl(&mut self, decl: &ModuleDecl) {
        match decl {
            ModuleDecl::ExportDecl(export) => {
                let keyword_end = BytePos(export.span.lo.0 + "export".len() as u32);
                self.replace(export.span.lo, keyword_end, "");
                match &export.decl {
                    Decl::Fn(f) => self.export(&f.ident.sym, &f.ident.sym),
                    Decl::Class(c) => self.export(&c.ident.sym, &c.ident.sym),
                    Decl::Var(var) => {
                        let mut names = Vec::new();
                        for declarator in &var.decls {
                            bindings(&declarator.name, &mut names);
                        }
                        for name in names {
                            self.export(&name, &name);
                        }
                    }
                    _ => {}
                }
            }
            ModuleDecl::ExportDefaultDecl(export) => {
                let keyword_end = self.default_keyword_end(export.span);
                let ident = match &export.decl {
                    DefaultDecl::Fn(f) => f.ident.as_ref(),
                    DefaultDecl::Class(c) => c.ident.as_ref(),
                    _ => {
                        self.remove(export.span);
                        return;
                    }
                };
                match ident {
                    Some(ident) => {
                        self.replace(export.span.lo, keyword_end, "");
                        self.export("default", &ident.sym);
                    }
                    None => {
                        self.replace(export.span.lo, keyword_end, "exports.default =");
                        self.replace(export.span.hi, export.span.hi, ";");
                    }
                }
            }
            ModuleDecl::ExportDefaultExpr(export) => {
                let keyword_end = self.default_keyword_end(export.span);
                self.replace(export.span.lo, keyword_end, "exports.default =");
                self.replace(export.span.hi, export.span.hi, ";");
            }
            ModuleDecl::ExportNamed(named) => {
                let from = named.src.as_ref().map(|src| self.namespace(src.span));
                for specifier in &named.specifiers {
                    match (specifier, &from) {
                        (ExportSpecifier::Namespace(ns), Some(from)) => {
                            let name = self.export_name(&ns.name);
                            self.export(&name, from);
                        }
                        (ExportSpecifier::Default(spec), Some(from)) => {
                            self.export(&spec.exported.sym, &format!("__importDefault({})", from));
                        }
                        (ExportSpecifier::Named(spec), _) => {
                            let orig = self.export_name(&spec.orig);
                            let exported = spec
                                .exported
                                .as_ref()
                                .map(|name| self.export_name(name))
                                .unwrap_or_else(|| orig.clone());
                            let value = match (&from, &spec.orig) {
                                (Some(from), _) if orig == "default" => {
                                    format!("__importDefault({})", from)
                                }
                                (Some(from), _) => format!("{}[{}]", from, quoted(&orig)),
                                (None, ModuleExportName::Ident(ident)) => self
                                    .imports
                                    .get(&ident.to_id())
                                    .or_else(|| {
                                        self.imports
                                            .iter()
                                            .find(|(id, _)| id.0 == ident.sym)
                                            .map(|(_, target)| target)
                                    })
                                    .cloned()
                                    .unwrap_or(orig),
                                (None, ModuleExportName::Str(_)) => orig,
                            };
                            self.export(&exported, &value);
                        }
                        _ => {}
                    }
                }
                self.remove(named.span);
            }
            ModuleDecl::ExportAll(all) => {
                let from = self.namespace(all.src.span);
                self.requires
                    .push(format!("__exportStar({}, exports);", from));
                self.remove(all.span);
            }
            _ => {}
        }
    }
}

/// Finds every read of an imported binding and what to read instead.
struct References<'r> {
    imports: &'r HashMap<Id, String>,
    found: Vec<(Span, String)>,
}

impl References<'_> {
    fn target(&self, ident: &swc_core::ecma::ast::Ident) -> Option<String> {
        self.imports.get(&ident.to_id()).cloned()
    }
}

impl Visit for References<'_> {
    fn visit_expr(&mut self, expr: &Expr) {
        if let Expr::Ident(ident) = expr {
            if let Some(target) = self.target(ident) {
                self.found.push((ident.span, target));
            }
            return;
        }
        expr.visit_children_with(self);
    }

    fn visit_callee(&mut self, callee: &Callee) {
        if let Callee::Expr(expr) = callee {
            if let Expr::Ident(ident) = &**expr {
                if let Some(target) = self.target(ident) {
                    // Called without the namespace as `this`.
                    self.found.push((ident.span, format!("(0, {})", target)));
                    return;
                }
            }
        }
        callee.visit_children_with(self);
    }

    fn visit_prop(&mut self, prop: &Prop) {
        if let Prop::Shorthand(ident) = prop {
            if let Some(target) = self.target(ident) {
                self.found
                    .push((ident.span, format!("{}: {}", ident.sym, target)));
            }
            return;
        }
        prop.visit_children_with(self);
    }
}

/// Names bound by a declaration pattern.
fn bindings(pat: &Pat, out: &mut Vec<String>) {
    match pat {
        Pat::Ident(binding) => out.push(binding.id.sym.to_string()),
        Pat::Array(array) => {
            for element in array.elems.iter().flatten() {
                bindings(element, out);
            }
        }
        Pat::Object(object) => {
            for prop in &object.props {
                match prop {
                    ObjectPatProp::KeyValue(kv) => bindings(&kv.value, out),
                    ObjectPatProp::Assign(prop) => out.push(prop.key.sym.to_string()),
                    ObjectPatProp::Rest(rest) => bindings(&rest.arg, out),
                }
            }
        }
        Pat::Rest(rest) => bindings(&rest.arg, out),
        Pat::Assign(pat) => bindings(&pat.left, out),
        _ => {}
    }
}

fn apply_edits(source: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by_key(|e| (e.start, e.end));
    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    for edit in edits {
        if edit.start < cursor {
            continue;
        }
        out.push_str(&source[cursor..edit.start]);
        out.push_str(&edit.text);
        cursor = edit.end;
    }
    out.push_str(&source[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn options_in(dir: &std::path::Path) -> TransformOptions {
        TransformOptions {
            resolve_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_script_has_no_diagnostics() {
        let unit = transform(
            "export const config = { url: 'https://e.com' };\nexport default function ({ doc }) { return doc.text(); }",
            &TransformOptions::default(),
        )
        .unwrap();
        assert!(unit.contains("module.exports = __main.exports;"));
        assert!(unit.contains(r#"__export(exports, "config", function () { return config; });"#));
        assert!(unit.contains("exports.default = function ({ doc })"));
        assert!(!unit.contains("export const"));
    }

    #[test]
    fn test_syntax_error_reports_position() {
        let err = transform("export default function () {\n  return 1 +;\n}", &TransformOptions::default())
            .unwrap_err();
        let diagnostics = err.diagnostics();
        assert!(!diagnostics.is_empty());
        assert_eq!(diagnostics[0].line, 2);
        assert!(diagnostics[0].file.is_none());
    }

    #[test]
    fn test_collects_errors_across_modules() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("broken.js"), "export const = 1;").unwrap();
        let source = "import { a } from './broken.js';\nimport b from './missing.js';\nexport default () => a + b;";

        let err = transform(source, &options_in(dir.path())).unwrap_err();
        let diagnostics = err.diagnostics();
        assert!(diagnostics.len() >= 2, "{:?}", diagnostics);
        assert!(diagnostics
            .iter()
            .any(|d| d.line == 2 && d.text == "Could not resolve \"./missing.js\""));
        assert!(diagnostics
            .iter()
            .any(|d| d.file.as_deref() == Some("broken.js")));
    }

    #[test]
    fn test_framework_and_host_modules_stay_external() {
        let options = TransformOptions {
            external: vec!["host".to_string()],
            ..Default::default()
        };
        let unit = transform(
            "import { fetch } from 'scrape-sandbox/http';\nimport * as host from 'host';\nexport default () => host.x;",
            &options,
        )
        .unwrap();
        assert!(unit.contains(r#"var __imp0 = require("scrape-sandbox/http");"#));
        assert!(unit.contains(r#"var __imp1 = require("host");"#));
        assert!(unit.contains("exports.default = () => __imp1.x;"));
        assert!(unit.ends_with("})();\n"));
    }

    #[test]
    fn test_unknown_bare_specifier_fails() {
        let err = transform("import x from 'lodash';\nexport default x;", &TransformOptions::default())
            .unwrap_err();
        assert_eq!(err.diagnostics()[0].text, "Could not resolve \"lodash\"");
        assert_eq!(err.diagnostics()[0].line, 1);
        assert_eq!(err.diagnostics()[0].column, 14);
    }

    #[test]
    fn test_bundles_json_and_text_assets() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("sites.json"), "{\"start\": \"https://e.com\"}").unwrap();
        fs::write(dir.path().join("banner.txt"), "hello \"world\"").unwrap();
        let source = "import sites from './sites.json';\nimport banner from './banner.txt';\nexport default () => [sites.start, banner];";

        let unit = transform(source, &options_in(dir.path())).unwrap();
        assert!(unit.contains("module.exports = {\"start\": \"https://e.com\"};"));
        assert!(unit.contains(r#"module.exports = "hello \"world\"";"#));
        assert!(unit.contains(r#"{"./banner.txt":2,"./sites.json":1}"#));
    }

    #[test]
    fn test_invalid_json_asset_is_a_diagnostic() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("bad.json"), "{\n  \"a\": ,\n}").unwrap();
        let err = transform("import bad from './bad.json';\nexport default () => bad;", &options_in(dir.path()))
            .unwrap_err();
        let diagnostic = &err.diagnostics()[0];
        assert_eq!(diagnostic.file.as_deref(), Some("bad.json"));
        assert_eq!(diagnostic.line, 2);
    }

    #[test]
    fn test_script_without_exports_still_compiles() {
        let unit = transform("const x = 1;", &TransformOptions::default()).unwrap();
        assert!(!unit.contains("__esModule = true"));
    }

    #[test]
    fn test_export_lists_and_reexports() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("lib.js"), "export const a = 1;\nexport default 2;").unwrap();
        let source = "export { a as b, default as c } from './lib.js';\nexport * from './lib.js';\nconst d = 4;\nexport { d as default };";

        let unit = transform(source, &options_in(dir.path())).unwrap();
        assert!(unit.contains(r#"__export(exports, "b", function () { return __imp0["a"]; });"#));
        assert!(unit.contains(r#"__export(exports, "c", function () { return __importDefault(__imp0); });"#));
        assert!(unit.contains(r#"__exportStar(__imp0, exports);"#));
        assert!(unit.contains(r#"__export(exports, "default", function () { return d; });"#));
        // One require per specifier.
        assert_eq!(unit.matches(r#"require("./lib.js")"#).count(), 1);
    }

    #[test]
    fn test_imports_are_hoisted_and_read_live() {
        let options = TransformOptions {
            external: vec!["host".to_string()],
            ..Default::default()
        };
        let source = "const early = () => [n, inc];\nimport { n, inc } from 'host';\nexport default () => { inc(); return { n }; };";
        let unit = transform(source, &options).unwrap();

        let require_at = unit.find(r#"var __imp0 = require("host");"#).unwrap();
        let early_at = unit.find("const early").unwrap();
        assert!(require_at < early_at);
        assert!(unit.contains(r#"const early = () => [__imp0["n"], __imp0["inc"]];"#));
        assert!(unit.contains(r#"(0, __imp0["inc"])();"#));
        assert!(unit.contains(r#"return { n: __imp0["n"] };"#));
    }

    #[test]
    fn test_shadowed_import_names_are_left_alone() {
        let options = TransformOptions {
            external: vec!["host".to_string()],
            ..Default::default()
        };
        let source = "import { item } from 'host';\nexport default (item) => item + 1;";
        let unit = transform(source, &options).unwrap();
        assert!(unit.contains("exports.default = (item) => item + 1;"));
    }

    #[test]
    fn test_exports_are_getters_defined_before_requires() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("dep.js"), "export const dep = 1;").unwrap();
        let source = "import { dep } from './dep.js';\nexport let n = dep;\nexport function inc() { n++; }\nexport default () => n;";

        let unit = transform(source, &options_in(dir.path())).unwrap();
        let getter_at = unit
            .find(r#"__export(exports, "n", function () { return n; });"#)
            .unwrap();
        let require_at = unit.find(r#"var __imp0 = require("./dep.js");"#).unwrap();
        assert!(getter_at < require_at);
        assert!(unit.contains(r#"__export(exports, "inc", function () { return inc; });"#));
        assert!(unit.contains(r#"let n = __imp0["dep"];"#));
    }

    #[test]
    fn test_reexported_import_reads_through_namespace() {
        let options = TransformOptions {
            external: vec!["host".to_string()],
            ..Default::default()
        };
        let unit = transform(
            "import { x as y } from 'host';\nexport { y as z };\nexport default () => y;",
            &options,
        )
        .unwrap();
        assert!(unit.contains(r#"__export(exports, "z", function () { return __imp0["x"]; });"#));
    }

    #[test]
    fn test_entry_without_exports_leaves_module_exports_unset() {
        let unit = transform("const draft = 1;", &TransformOptions::default()).unwrap();
        assert!(unit.contains("if (__main.exports !== __blank"));
        assert!(!unit.contains("module.exports = __load(0);"));
    }

    #[test]
    fn test_apply_edits_in_order() {
        let edits = vec![
            Edit { start: 6, end: 11, text: "there".into() },
            Edit { start: 0, end: 5, text: "hi".into() },
            Edit { start: 11, end: 11, text: "!".into() },
        ];
        assert_eq!(apply_edits("hello world", edits), "hi there!");
    }
}
