//! Static admission control over submitted component source.
//!
//! Scans for capability-revealing patterns and rewrites imports so that no
//! executable `import` survives. Trusted libraries are provided as globals by
//! the preview document, never imported.
//!
//! Matching is textual. Obfuscated access (string concatenation, computed
//! property names, aliasing through `constructor`) is not detected.

use crate::error::PreviewError;
use regex::{Captures, Regex};
use std::sync::LazyLock;
use tracing::debug;

/// Modules whose imports are kept as comments. Everything else is removed.
pub const ALLOWED_MODULES: &[&str] = &[
    "react",
    "react-dom",
    "react-dom/client",
    "next/link",
    "next/navigation",
    "next/router",
];

/// Longest excerpt kept on a violation
const MAX_EXCERPT: usize = 80;

/// A denylisted capability found in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub pattern_id: &'static str,
    pub description: &'static str,
    /// 1-based line of the match
    pub line: usize,
    pub excerpt: String,
}

/// Output of [`validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizationResult {
    pub sanitized_code: String,
    pub violations: Vec<Violation>,
}

/// Output of [`validate_imports`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub is_valid: bool,
    pub blocked_imports: Vec<String>,
}

/// Sanitized source that passed validation and is not empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedSource(String);

impl AdmittedSource {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl SanitizationResult {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// Admit the sanitized code for synthesis.
    ///
    /// # Errors
    /// - `SecurityViolation` when any violation was recorded
    /// - `EmptySource` when nothing renderable is left
    pub fn into_admitted(self) -> Result<AdmittedSource, PreviewError> {
        if !self.violations.is_empty() {
            return Err(PreviewError::SecurityViolation(self.violations));
        }
        if self.sanitized_code.trim().is_empty() {
            return Err(PreviewError::EmptySource);
        }
        Ok(AdmittedSource(self.sanitized_code))
    }
}

struct DenyPattern {
    id: &'static str,
    description: &'static str,
    regex: Regex,
}

fn pattern(id: &'static str, description: &'static str, re: &str) -> DenyPattern {
    DenyPattern {
        id,
        description,
        regex: Regex::new(re).expect("denylist pattern must compile"),
    }
}

static DENYLIST: LazyLock<Vec<DenyPattern>> = LazyLock::new(|| {
    vec![
        pattern(
            "process-access",
            "process and runtime globals expose the host environment",
            r"\bprocess\s*\.\s*(?:env|exit|kill|argv|binding|cwd|chdir|mainModule)\b|\bprocess\s*\[|\b(?:Deno|Bun)\s*\.",
        ),
        pattern(
            "filesystem-module",
            "filesystem modules are not available to previews",
            r#"['"](?:node:)?fs(?:/promises)?['"]"#,
        ),
        pattern(
            "child-process-module",
            "process-spawning and VM modules are not available to previews",
            r#"['"](?:node:)?(?:child_process|worker_threads|cluster|vm)['"]"#,
        ),
        pattern(
            "eval",
            "eval() executes arbitrary strings as code",
            r"\beval\s*\(",
        ),
        pattern(
            "function-constructor",
            "the Function constructor builds code from strings",
            r"\b(?:new\s+)?Function\s*\(",
        ),
        pattern(
            "string-timer",
            "timers with string bodies are evaluated as code",
            r#"\bset(?:Timeout|Interval)\s*\(\s*['"`]"#,
        ),
        pattern(
            "dynamic-import",
            "dynamic import() loads code at runtime",
            r"\bimport\s*\(",
        ),
        pattern(
            "document-write",
            "document.write/open replace the preview document",
            r"\bdocument\s*\.\s*(?:write|writeln|open)\s*\(",
        ),
        pattern(
            "script-element",
            "creating script or frame elements injects executable content",
            r#"(?i)createElement\s*\(\s*['"`](?:script|iframe|frame|object|embed)['"`]"#,
        ),
        pattern(
            "embedded-tag",
            "embedded script or frame tags",
            r"(?i)<\s*/?\s*(?:script|iframe|frameset|frame|object|embed)\b",
        ),
        pattern(
            "cross-context-navigation",
            "reaching the embedding page or opening new browsing contexts",
            r"\b(?:top|parent|opener)\s*\.\s*(?:location|postMessage|document|frames)\b|\bwindow\s*\.\s*(?:open\s*\(|top\b|parent\b|opener\b)",
        ),
        pattern(
            "storage-access",
            "persistent client storage is shared with the embedding origin",
            r"\b(?:localStorage|sessionStorage|indexedDB)\b|\bdocument\s*\.\s*cookie\b",
        ),
    ]
});

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^[ \t]*import\s+(?:type\s+)?(?:[\w$*{}\s,]+?\s+from\s*)?['"]([^'"\n]+)['"][ \t]*;?"#,
    )
    .expect("import pattern must compile")
});

static REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\brequire\s*\(\s*['"]([^'"\n]+)['"]\s*\)"#).expect("require pattern must compile")
});

/// (pattern, replacement) pairs applied in order to strip module syntax.
static EXPORT_REWRITES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    let rules = [
        // anonymous default exports become the entry component
        (
            r"(?m)^([ \t]*)export\s+default\s+(async\s+)?function\s*\(",
            "${1}${2}function Component(",
        ),
        (
            r"(?m)^([ \t]*)export\s+default\s+(async\s+)?\(",
            "${1}const Component = ${2}(",
        ),
        (
            r"(?m)^([ \t]*)export\s+default\s+(async\s+)?(function|class)\b",
            "${1}${2}${3}",
        ),
        (
            r"(?m)^[ \t]*export\s+default\s+[A-Za-z_$][\w$]*[ \t]*;?[ \t]*$",
            "",
        ),
        (
            r"(?m)^([ \t]*)export\s+(async\s+)?(const|let|var|function|class)\b",
            "${1}${2}${3}",
        ),
    ];
    rules
        .into_iter()
        .map(|(re, rep)| (Regex::new(re).expect("export pattern must compile"), rep))
        .collect()
});

pub fn is_allowed_module(specifier: &str) -> bool {
    ALLOWED_MODULES.contains(&specifier)
}

/// Scan `source` against the denylist and produce sanitized code.
///
/// Never fails: every match is reported so the author sees all of them at once.
pub fn validate(source: &str) -> SanitizationResult {
    let mut found: Vec<(usize, Violation)> = Vec::new();

    for deny in DENYLIST.iter() {
        for m in deny.regex.find_iter(source) {
            found.push((
                m.start(),
                Violation {
                    pattern_id: deny.id,
                    description: deny.description,
                    line: line_of(source, m.start()),
                    excerpt: excerpt(m.as_str()),
                },
            ));
        }
    }
    found.sort_by_key(|(offset, _)| *offset);
    let violations: Vec<Violation> = found.into_iter().map(|(_, v)| v).collect();

    let sanitized_code = rewrite_exports(&rewrite_imports(source));

    debug!(
        violations = violations.len(),
        bytes = sanitized_code.len(),
        "validated component source"
    );

    SanitizationResult {
        sanitized_code,
        violations,
    }
}

/// Report imported modules that are not on the allowlist.
pub fn validate_imports(source: &str) -> ImportReport {
    let mut blocked_imports: Vec<String> = Vec::new();

    let imports = IMPORT_RE.captures_iter(source).map(|c| c[1].to_string());
    let requires = REQUIRE_RE.captures_iter(source).map(|c| c[1].to_string());

    for module in imports.chain(requires) {
        if !is_allowed_module(&module) && !blocked_imports.contains(&module) {
            blocked_imports.push(module);
        }
    }

    ImportReport {
        is_valid: blocked_imports.is_empty(),
        blocked_imports,
    }
}

fn rewrite_imports(source: &str) -> String {
    IMPORT_RE
        .replace_all(source, |caps: &Captures| {
            if is_allowed_module(&caps[1]) {
                caps[0]
                    .lines()
                    .map(|line| format!("// {}", line.trim_start()))
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                String::new()
            }
        })
        .into_owned()
}

fn rewrite_exports(source: &str) -> String {
    EXPORT_REWRITES
        .iter()
        .fold(source.to_string(), |code, (re, replacement)| {
            re.replace_all(&code, *replacement).into_owned()
        })
}

fn line_of(source: &str, offset: usize) -> usize {
    source[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}

fn excerpt(matched: &str) -> String {
    let trimmed = matched.trim();
    match trimmed.char_indices().nth(MAX_EXCERPT) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(source: &str) -> Vec<&'static str> {
        validate(source)
            .violations
            .iter()
            .map(|v| v.pattern_id)
            .collect()
    }

    #[test]
    fn test_plain_component_is_clean() {
        let result = validate("function Component(){ return null }");
        assert!(result.is_clean());
        assert_eq!(result.sanitized_code, "function Component(){ return null }");
    }

    #[test]
    fn test_eval_reports_single_violation() {
        let result = validate("eval('1')");
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].pattern_id, "eval");
        assert_eq!(result.violations[0].line, 1);
    }

    #[test]
    fn test_reports_every_violation_in_source_order() {
        let source = "const a = localStorage.getItem('x');\nconst b = process.env.SECRET;\nnew Function('return 1')();";
        assert_eq!(
            ids(source),
            vec!["storage-access", "process-access", "function-constructor"]
        );
        let lines: Vec<usize> = validate(source).violations.iter().map(|v| v.line).collect();
        assert_eq!(lines, vec![1, 2, 3]);
    }

    #[test]
    fn test_detects_denylisted_capabilities() {
        assert_eq!(ids("import fs from 'fs';"), vec!["filesystem-module"]);
        assert_eq!(ids("const cp = require(\"node:child_process\")"), vec!["child-process-module"]);
        assert_eq!(ids("setTimeout('alert(1)', 10)"), vec!["string-timer"]);
        assert_eq!(ids("const m = await import('./x.js')"), vec!["dynamic-import"]);
        assert_eq!(ids("document.write('<b>')"), vec!["document-write"]);
        assert_eq!(ids("document.createElement('SCRIPT')"), vec!["script-element"]);
        assert_eq!(ids("return <iframe src='x' />"), vec!["embedded-tag"]);
        assert_eq!(ids("window.top.location = 'https://evil'"), vec!["cross-context-navigation"]);
        assert_eq!(ids("parent.postMessage({type:'ready'}, '*')"), vec!["cross-context-navigation"]);
        assert_eq!(ids("const c = document.cookie"), vec!["storage-access"]);
    }

    #[test]
    fn test_closing_script_tag_is_flagged() {
        assert_eq!(ids("const s = '</script>'"), vec!["embedded-tag"]);
    }

    #[test]
    fn test_empty_source() {
        let result = validate("");
        assert!(result.is_clean());
        assert!(result.sanitized_code.is_empty());
        assert!(matches!(result.into_admitted(), Err(PreviewError::EmptySource)));
    }

    #[test]
    fn test_violations_block_admission() {
        let result = validate("eval('1')");
        match result.into_admitted() {
            Err(PreviewError::SecurityViolation(v)) => assert_eq!(v[0].pattern_id, "eval"),
            other => panic!("expected security violation, got {:?}", other),
        }
    }

    #[test]
    fn test_allowed_imports_become_comments() {
        let source = "import React, { useState } from 'react';\nfunction App() { return null }";
        let result = validate(source);
        assert!(result.is_clean());
        assert_eq!(
            result.sanitized_code,
            "// import React, { useState } from 'react';\nfunction App() { return null }"
        );
    }

    #[test]
    fn test_multiline_allowed_import_is_fully_commented() {
        let source = "import {\n  useState,\n  useEffect,\n} from \"react\";\nfunction App() {}";
        let sanitized = validate(source).sanitized_code;
        assert!(sanitized.starts_with("// import {\n// useState,\n// useEffect,\n// } from \"react\";"));
        assert!(sanitized.ends_with("function App() {}"));
    }

    #[test]
    fn test_blocked_imports_are_removed() {
        let source = "import leftPad from 'left-pad';\nfunction App() { return null }";
        let result = validate(source);
        assert!(!result.sanitized_code.contains("left-pad"));
        assert!(result.sanitized_code.contains("function App()"));
    }

    #[test]
    fn test_validate_imports_reports_left_pad() {
        let report = validate_imports("import leftPad from \"left-pad\";\nimport React from 'react';");
        assert!(!report.is_valid);
        assert_eq!(report.blocked_imports, vec!["left-pad".to_string()]);
    }

    #[test]
    fn test_validate_imports_dedups_and_includes_require() {
        let source = "import a from 'lodash';\nimport 'lodash';\nconst b = require('axios');";
        let report = validate_imports(source);
        assert_eq!(report.blocked_imports, vec!["lodash".to_string(), "axios".to_string()]);
    }

    #[test]
    fn test_validate_imports_allowlist_only() {
        let report = validate_imports("import Link from 'next/link';\nimport { createRoot } from 'react-dom/client';");
        assert!(report.is_valid);
        assert!(report.blocked_imports.is_empty());
    }

    #[test]
    fn test_export_syntax_is_stripped() {
        let sanitized = validate("export default function App() { return null }").sanitized_code;
        assert_eq!(sanitized, "function App() { return null }");

        let sanitized = validate("export const Component = () => null;").sanitized_code;
        assert_eq!(sanitized, "const Component = () => null;");

        let sanitized = validate("function Card() {}\nexport default Card;").sanitized_code;
        assert_eq!(sanitized, "function Card() {}\n");
    }

    #[test]
    fn test_anonymous_default_export_becomes_component() {
        let sanitized = validate("export default function () { return null }").sanitized_code;
        assert_eq!(sanitized, "function Component() { return null }");

        let sanitized = validate("export default ({ data }) => null;").sanitized_code;
        assert_eq!(sanitized, "const Component = ({ data }) => null;");
    }

    #[test]
    fn test_long_excerpt_is_truncated() {
        let long = excerpt(&"x".repeat(200));
        assert_eq!(long.len(), MAX_EXCERPT + 3);
        assert!(long.ends_with("..."));
        assert_eq!(excerpt("  eval( "), "eval(");
    }
}
