//! Per-language launch strategies.
//!
//! Hosting applications register a `LanguageErrorHandler` per language id to
//! wrap code (for richer tracebacks, say) and to choose the launch command.
//! Languages without a handler run as `<interpreter> <file>`.

use std::collections::HashMap;
use std::sync::Arc;

/// Prepares code and builds the command that runs it.
pub trait LanguageErrorHandler: Send + Sync {
    /// Transforms the code before it is written into the sandbox.
    fn prepare_code(&self, code: &str) -> String;

    /// Shell command that runs the staged file.
    fn build_execution_command(&self, interpreter: &str, file_path: &str) -> String;
}

/// Runs the file with the bare interpreter.
#[derive(Debug, Default, Clone, Copy)]
pub struct BareInterpreter;

impl LanguageErrorHandler for BareInterpreter {
    fn prepare_code(&self, code: &str) -> String {
        code.to_string()
    }

    fn build_execution_command(&self, interpreter: &str, file_path: &str) -> String {
        format!("{interpreter} {}", shell_words::quote(file_path))
    }
}

/// Handlers keyed by language id.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn LanguageErrorHandler>>,
}

impl HandlerRegistry {
    /// An empty registry; every language uses the bare interpreter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `language`, replacing any previous one.
    pub fn register(&mut self, language: impl Into<String>, handler: Arc<dyn LanguageErrorHandler>) {
        self.handlers.insert(language.into(), handler);
    }

    /// Returns true if `language` has a dedicated handler.
    pub fn has(&self, language: &str) -> bool {
        self.handlers.contains_key(language)
    }

    /// Handler for `language`, or the bare interpreter.
    pub fn get(&self, language: &str) -> Arc<dyn LanguageErrorHandler> {
        self.handlers
            .get(language)
            .cloned()
            .unwrap_or_else(|| Arc::new(BareInterpreter))
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut languages: Vec<&String> = self.handlers.keys().collect();
        languages.sort();
        f.debug_struct("HandlerRegistry")
            .field("languages", &languages)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Runs Python unbuffered with a marker line prepended.
    pub(crate) struct UnbufferedPython;

    impl LanguageErrorHandler for UnbufferedPython {
        fn prepare_code(&self, code: &str) -> String {
            format!("# sandman\n{code}")
        }

        fn build_execution_command(&self, interpreter: &str, file_path: &str) -> String {
            format!("{interpreter} -u {file_path}")
        }
    }

    #[test]
    fn test_bare_interpreter_quotes_path() {
        let handler = BareInterpreter;
        assert_eq!(handler.prepare_code("print(1)"), "print(1)");
        assert_eq!(
            handler.build_execution_command("python3", "/tmp/code_1.py"),
            "python3 /tmp/code_1.py"
        );
        assert_eq!(
            handler.build_execution_command("node", "/tmp/my dir/a.js"),
            "node '/tmp/my dir/a.js'"
        );
    }

    #[test]
    fn test_registry_falls_back_to_bare_interpreter() {
        let mut registry = HandlerRegistry::new();
        registry.register("python", Arc::new(UnbufferedPython));

        assert!(registry.has("python"));
        assert!(!registry.has("ruby"));
        assert_eq!(
            registry.get("python").build_execution_command("python3", "/tmp/a.py"),
            "python3 -u /tmp/a.py"
        );
        assert_eq!(
            registry.get("ruby").build_execution_command("ruby", "/tmp/a.rb"),
            "ruby /tmp/a.rb"
        );
        assert_eq!(format!("{registry:?}"), "HandlerRegistry { languages: [\"python\"] }");
    }
}
