//! Static pre-execution screening of user code
//!
//! Patterns are matched on identifier boundaries, so `load` blocks `load(...)`
//! but not `payload`. Rejection is reported to the caller as an
//! application-level failure, not an invocation error.

use crate::sandbox::Language;

const LUA_PATTERNS: &[&str] = &[
    "os.", "io.", "debug.", "package.", "require", "load", "dofile", "loadfile",
    "loadstring", "rawget", "rawset", "getmetatable", "setmetatable", "_G", "_ENV",
    "coroutine", "collectgarbage",
];

const PYTHON_PATTERNS: &[&str] = &[
    "eval(", "exec(", "compile(", "__import__", "open(", "file(", "execfile(",
    "input(", "raw_input(", "globals(", "locals(", "vars(", "getattr(", "setattr(",
    "delattr(", "importlib", "__loader__", "__builtins__", "__subclasses__",
];

/// Modules Python code may not import
const PYTHON_MODULES: &[&str] = &[
    "os", "sys", "subprocess", "socket", "urllib", "urllib2", "requests", "http",
    "httplib", "ftplib", "smtplib", "shutil", "ctypes", "multiprocessing", "pty",
    "importlib", "builtins",
];

const JAVASCRIPT_PATTERNS: &[&str] = &[
    "require(", "import(", "process.", "global.", "globalThis", "Buffer.", "__proto__",
    "constructor", "prototype", "eval(", "Function(", "setTimeout(", "setInterval(",
    "child_process",
];

const SHELL_PATTERNS: &[&str] = &[
    "|", "&&", ";", ">", "<", "`", "$(", "&", "/dev/", "eval", "exec", "curl", "wget",
    "nc", "ncat", "ssh", "sudo", "rm", "chmod", "chown", "mkfifo",
];

/// First disallowed pattern found in `code`, if any
pub fn find_forbidden(code: &str, language: Language) -> Option<&'static str> {
    let patterns = match language {
        Language::Lua => LUA_PATTERNS,
        Language::Python => {
            if let Some(module) = forbidden_python_import(code) {
                return Some(module);
            }
            PYTHON_PATTERNS
        }
        Language::JavaScript => JAVASCRIPT_PATTERNS,
        Language::Shell => SHELL_PATTERNS,
    };
    patterns
        .iter()
        .copied()
        .find(|pattern| contains_token(code, pattern))
}

/// Whether a condition expression is safe to evaluate
pub fn is_safe_expression(expr: &str) -> bool {
    expr.len() <= 512 && find_forbidden(expr, Language::Lua).is_none()
}

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// `pattern` occurs in `code` without being glued to a longer identifier
fn contains_token(code: &str, pattern: &str) -> bool {
    let starts_ident = pattern.chars().next().is_some_and(is_ident);
    let ends_ident = pattern.chars().last().is_some_and(is_ident);

    code.match_indices(pattern).any(|(at, _)| {
        let before = code[..at].chars().next_back();
        let after = code[at + pattern.len()..].chars().next();
        let clean_start = !starts_ident || !before.is_some_and(is_ident);
        let clean_end = !ends_ident || !after.is_some_and(is_ident);
        clean_start && clean_end
    })
}

fn forbidden_python_import(code: &str) -> Option<&'static str> {
    for line in code.lines() {
        let line = line.trim_start();
        let modules: Vec<&str> = if let Some(rest) = line.strip_prefix("import ") {
            rest.split(',').collect()
        } else if let Some(rest) = line.strip_prefix("from ") {
            rest.split_whitespace().next().into_iter().collect()
        } else {
            continue;
        };

        for module in modules {
            let root = module
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .split('.')
                .next()
                .unwrap_or_default();
            if let Some(blocked) = PYTHON_MODULES.iter().copied().find(|m| *m == root) {
                return Some(blocked);
            }
        }
    }
    None
}
