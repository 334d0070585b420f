pub mod executor;
pub mod modules;

pub use executor::{ExecError, LoadedScript, SandboxExecutor};

/// Strip LLM-style markdown fences from around a script, if present.
/// Source arriving from an authoring layer is often wrapped in
/// ```` ```rhai … ``` ```` blocks.
pub fn strip_code_fences(source: &str) -> String {
    if let Some((_, rest)) = source.split_once("```rhai") {
        if let Some((body, _)) = rest.split_once("```") {
            return body.trim().to_string();
        }
    }
    source.to_string()
}
