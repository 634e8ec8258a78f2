//! Static registry mapping language names to execution specs.

use std::collections::HashMap;

use crate::error::EngineError;

/// How to run code for one language: which image, where the source file
/// goes inside the workspace, and the compile/run argument vectors.
#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    pub name: &'static str,
    pub image: &'static str,
    pub file_name: &'static str,
    pub compile_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
}

/// Lookup table populated once at startup.
pub struct LanguageRegistry {
    specs: HashMap<&'static str, ExecutionSpec>,
}

impl LanguageRegistry {
    /// Registry with the built-in language set.
    pub fn builtin() -> Self {
        let mut registry = Self {
            specs: HashMap::new(),
        };
        registry.register(ExecutionSpec {
            name: "python",
            image: "python:3.11-alpine",
            file_name: "main.py",
            compile_command: None,
            run_command: args(&["python", "-u", "/workspace/main.py"]),
        });
        registry.register(ExecutionSpec {
            name: "javascript",
            image: "node:20-alpine",
            file_name: "main.js",
            compile_command: None,
            run_command: args(&["node", "/workspace/main.js"]),
        });
        registry.register(ExecutionSpec {
            name: "cpp",
            image: "gcc:latest",
            file_name: "main.cpp",
            compile_command: Some(args(&[
                "g++",
                "/workspace/main.cpp",
                "-O2",
                "-o",
                "/workspace/a.out",
            ])),
            run_command: args(&["/workspace/a.out"]),
        });
        registry.register(ExecutionSpec {
            name: "java",
            image: "eclipse-temurin:21-jdk-alpine",
            file_name: "Main.java",
            compile_command: Some(args(&["javac", "/workspace/Main.java"])),
            run_command: args(&["java", "-cp", "/workspace", "Main"]),
        });
        registry
    }

    fn register(&mut self, spec: ExecutionSpec) {
        self.specs.insert(spec.name, spec);
    }

    pub fn resolve(&self, name: &str) -> Result<&ExecutionSpec, EngineError> {
        self.specs
            .get(name)
            .ok_or_else(|| EngineError::UnsupportedLanguage(name.to_string()))
    }

    pub fn all(&self) -> impl Iterator<Item = &ExecutionSpec> {
        self.specs.values()
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}
