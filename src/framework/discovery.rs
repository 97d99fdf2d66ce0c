//! Test file recognition and identifier extraction per framework.

use std::sync::OnceLock;

use regex::Regex;

use super::Framework;

fn python_def() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("valid regex")
    })
}

fn js_test_call() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\b(?:test|it)(?:\.(?:only|skip))?\(\s*(?:'([^']*)'|"([^"]*)"|`([^`]*)`)"#)
            .expect("valid regex")
    })
}

impl Framework {
    /// Whether a file name (no directory part) is a test file for this framework.
    pub fn is_test_file(&self, file_name: &str) -> bool {
        let js_like = |suffixes: &[&str]| {
            suffixes
                .iter()
                .any(|s| file_name.ends_with(&format!("{}.js", s)) || file_name.ends_with(&format!("{}.ts", s)))
        };
        match self {
            Framework::Pytest => file_name.starts_with("test_") && file_name.ends_with(".py"),
            Framework::Unittest => file_name.ends_with("_test.py") || file_name.ends_with("Test.py"),
            Framework::Robot => file_name.ends_with(".robot"),
            Framework::Playwright => js_like(&[".spec", ".test"]),
            Framework::Cypress => js_like(&[".cy", ".spec"]),
        }
    }

    /// Extract test identifiers from a test file's source, in file order.
    pub fn extract_tests(&self, source: &str) -> Vec<String> {
        let found = match self {
            Framework::Pytest | Framework::Unittest => extract_python(source),
            Framework::Robot => extract_robot(source),
            Framework::Cypress | Framework::Playwright => extract_js(source),
        };
        dedup_in_order(found)
    }
}

fn dedup_in_order(names: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names.into_iter().filter(|n| seen.insert(n.clone())).collect()
}

/// Functions named `test_*`/`should_*`, or decorated with a bare `@test`.
fn extract_python(source: &str) -> Vec<String> {
    let mut tests = Vec::new();
    let mut decorated_as_test = false;

    for line in source.lines() {
        let trimmed = line.trim();
        if let Some(decorator) = trimmed.strip_prefix('@') {
            let name = decorator
                .split(|c: char| c == '(' || c.is_whitespace())
                .next()
                .unwrap_or_default();
            decorated_as_test |= name == "test";
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(caps) = python_def().captures(line) {
            let name = &caps[1];
            if decorated_as_test || name.starts_with("test_") || name.starts_with("should_") {
                tests.push(name.to_string());
            }
        }
        decorated_as_test = false;
    }
    tests
}

/// Non-indented lines inside a `*** Test Cases ***` section.
fn extract_robot(source: &str) -> Vec<String> {
    let mut tests = Vec::new();
    let mut in_cases = false;

    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("***") {
            let header = trimmed.trim_matches('*').trim().to_ascii_lowercase();
            in_cases = header == "test cases" || header == "test case";
            continue;
        }
        if !in_cases || trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            continue;
        }
        // Cells are separated by two or more spaces or a tab.
        let name = trimmed
            .split("  ")
            .next()
            .and_then(|s| s.split('\t').next())
            .unwrap_or(trimmed)
            .trim();
        if !name.is_empty() {
            tests.push(name.to_string());
        }
    }
    tests
}

fn extract_js(source: &str) -> Vec<String> {
    js_test_call()
        .captures_iter(source)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)))
        .map(|m| m.as_str().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}
