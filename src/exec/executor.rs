use std::collections::BTreeSet;

use rhai::module_resolvers::StaticModuleResolver;
use rhai::{CallFnOptions, Dynamic, Engine, ParseErrorType, Scope, AST};

use super::modules;

/// Operation ceiling for a single script evaluation. Strategies are pure
/// per-day computations over at most a decade of daily candles; anything
/// that trips this is runaway.
const MAX_OPERATIONS: u64 = 25_000_000;
const MAX_CALL_LEVELS: usize = 64;
const MAX_EXPR_DEPTH: usize = 64;
const MAX_STRING_SIZE: usize = 1_000_000;
const MAX_ARRAY_SIZE: usize = 1_000_000;
const MAX_MAP_SIZE: usize = 10_000;

/// Errors surfaced by the sandbox, split by phase: `Validation` covers
/// everything detectable before the first strategy invocation (parse
/// failures, banned symbols, blocked imports, entry-point mismatches,
/// module-body failures), `Runtime` covers faults raised by the script
/// body during a call.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Runtime(String),
}

/// Compiles user-supplied Rhai source under a restricted engine and hands
/// back a callable script.
///
/// The policy has two halves. Banned symbols are disabled on the engine, so
/// any use of them is rejected by the parser before the script ever runs.
/// Imports resolve through a static resolver that only knows the allowed
/// modules; Rhai restricts `import` to the global level of a script, and the
/// module body runs once during [`LoadedScript::run_module_body`], so a
/// blocked import also surfaces before the first per-day call.
pub struct SandboxExecutor {
    allowed_modules: BTreeSet<String>,
    banned_symbols: BTreeSet<String>,
}

impl Default for SandboxExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxExecutor {
    pub fn new() -> Self {
        Self::with_policy(["num", "tab"], ["eval", "debug"])
    }

    pub fn with_policy<'a>(
        allowed_modules: impl IntoIterator<Item = &'a str>,
        banned_symbols: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            allowed_modules: allowed_modules.into_iter().map(str::to_owned).collect(),
            banned_symbols: banned_symbols.into_iter().map(str::to_owned).collect(),
        }
    }

    /// Parse and screen `source`, returning a script whose module body has
    /// not yet been executed.
    pub fn compile(&self, source: &str) -> Result<LoadedScript, ExecError> {
        if source.trim().is_empty() {
            return Err(ExecError::Validation(
                "source must be a non-empty string.".to_string(),
            ));
        }

        let engine = self.build_engine();
        let ast = engine.compile(source).map_err(classify_parse_error)?;

        Ok(LoadedScript {
            engine,
            ast,
            scope: Scope::new(),
        })
    }

    /// A fresh engine per compile/execute cycle; nothing is shared between
    /// scripts, so module-level assignments cannot leak across runs.
    fn build_engine(&self) -> Engine {
        let mut engine = Engine::new();

        engine.set_max_operations(MAX_OPERATIONS);
        engine.set_max_call_levels(MAX_CALL_LEVELS);
        engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH);
        engine.set_max_string_size(MAX_STRING_SIZE);
        engine.set_max_array_size(MAX_ARRAY_SIZE);
        engine.set_max_map_size(MAX_MAP_SIZE);

        for symbol in &self.banned_symbols {
            engine.disable_symbol(symbol);
        }

        let mut resolver = StaticModuleResolver::new();
        for (name, module) in modules::standard_library() {
            if self.allowed_modules.contains(name) {
                resolver.insert(name, module.clone());
                engine.register_static_module(name, module.into());
            }
        }
        engine.set_module_resolver(resolver);

        engine
    }
}

fn classify_parse_error(err: rhai::ParseError) -> ExecError {
    match *err.0 {
        ParseErrorType::Reserved(ref symbol) => ExecError::Validation(format!(
            "use of banned name is not allowed: {symbol}"
        )),
        _ => ExecError::Validation(format!("provided code has a syntax error: {err}")),
    }
}

/// A compiled script plus the engine and scope it runs under. The scope is
/// owned by this script and survives across calls, so a run's state never
/// bleeds into another run.
#[derive(Debug)]
pub struct LoadedScript {
    engine: Engine,
    ast: AST,
    scope: Scope<'static>,
}

impl LoadedScript {
    /// Check that a top-level function `name` exists with exactly `arity`
    /// parameters. `signature` is the human-readable form used in errors,
    /// e.g. `"run(df, holdings)"`.
    pub fn require_fn(&self, name: &str, arity: usize, signature: &str) -> Result<(), ExecError> {
        let mut found_arities: Vec<usize> = Vec::new();
        for f in self.ast.iter_functions() {
            if f.name == name {
                if f.params.len() == arity {
                    return Ok(());
                }
                found_arities.push(f.params.len());
            }
        }
        match found_arities.first() {
            Some(n) => Err(ExecError::Validation(format!(
                "{name} must accept exactly {arity} argument(s) ({signature}), found {n}."
            ))),
            None => Err(ExecError::Validation(format!(
                "code must define a top-level function named {signature}."
            ))),
        }
    }

    /// Execute the module body once. Top-level statements (including
    /// imports) run here; sibling function definitions become visible to
    /// each other for all later calls.
    pub fn run_module_body(&mut self) -> Result<(), ExecError> {
        self.engine
            .run_ast_with_scope(&mut self.scope, &self.ast)
            .map_err(|e| ExecError::Validation(format!("module body failed to execute: {e}")))
    }

    /// Invoke a named function without re-running the module body.
    pub fn call(&mut self, name: &str, args: impl rhai::FuncArgs) -> Result<Dynamic, ExecError> {
        let options = CallFnOptions::new().eval_ast(false);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut self.scope, &self.ast, name, args)
            .map_err(|e| ExecError::Runtime(e.to_string()))
    }
}
