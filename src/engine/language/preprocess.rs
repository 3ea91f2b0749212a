//! Source transforms that turn bare snippets into complete programs.
//!
//! Each transform leaves code untouched when it already carries its own entry
//! point, so full programs and snippets are both accepted.

use std::sync::LazyLock;

use regex::Regex;

static C_MAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)\b(?:int|void)\s+main\s*\(").expect("valid C main pattern")
});
/// Type declarations only count at the start of a line, after modifiers, so
/// `"class Foo"` inside a string or comment is not mistaken for one.
static JAVA_CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*(?:(?:public|protected|private|abstract|final|static|sealed|strictfp)[ \t]+)*(?:class|interface|enum|record)[ \t]+([A-Za-z_]\w*)",
    )
    .expect("valid class pattern")
});
static JAVA_PUBLIC_CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^[ \t]*public[ \t]+(?:(?:abstract|final|sealed|strictfp)[ \t]+)*class[ \t]+([A-Za-z_]\w*)",
    )
    .expect("valid public class pattern")
});
static JAVA_MAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bstatic\b[^;{}()]*\bvoid\s+main\s*\(").expect("valid Java main pattern")
});
static GO_PACKAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*package\s+\w+").expect("valid package pattern"));
static GO_MAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)\bfunc\s+main\s*\(").expect("valid Go main pattern"));
static KOTLIN_MAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)\bfun\s+main\s*\(").expect("valid Kotlin main pattern"));
static JS_READS_STDIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"process\.stdin|readline|readFileSync\(\s*(?:0|'/dev/stdin'|\x22/dev/stdin\x22)")
        .expect("valid stdin pattern")
});
static JS_DEFINES_INPUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:function|const|let|var)\s+input\b").expect("valid input pattern")
});
static JS_CALLS_INPUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\binput\s*\(").expect("valid call pattern"));

/// Go standard packages imported automatically when a snippet uses them.
const GO_AUTO_IMPORTS: &[&str] = &["bufio", "fmt", "math", "os", "sort", "strconv", "strings"];

const JS_INPUT_PRELUDE: &str = "\
const __stdinLines = (() => {
  try { return require('fs').readFileSync(0, 'utf8').split(/\\r?\\n/); } catch (_) { return []; }
})();
let __stdinCursor = 0;
function input() {
  return __stdinCursor < __stdinLines.length ? __stdinLines[__stdinCursor++] : '';
}
";

const TS_INPUT_PRELUDE: &str = "\
declare var require: any;
const __stdinLines: string[] = (() => {
  try { return require('fs').readFileSync(0, 'utf8').split(/\\r?\\n/); } catch (_) { return []; }
})();
let __stdinCursor = 0;
function input(): string {
  return __stdinCursor < __stdinLines.length ? __stdinLines[__stdinCursor++] : '';
}
";

pub fn c(code: &str) -> String {
    if C_MAIN.is_match(code) {
        return code.to_string();
    }
    let (hoisted, body) = hoist(code, |line| line.starts_with('#'));
    let mut out = String::from("#include <stdio.h>\n#include <stdlib.h>\n#include <string.h>\n");
    push_lines(&mut out, &hoisted, "");
    out.push_str("\nint main(void) {\n");
    push_lines(&mut out, &body, "    ");
    out.push_str("    return 0;\n}\n");
    out
}

pub fn cpp(code: &str) -> String {
    if C_MAIN.is_match(code) {
        return code.to_string();
    }
    let (hoisted, body) = hoist(code, |line| line.starts_with('#') || line.starts_with("using "));
    let mut out = String::from("#include <bits/stdc++.h>\nusing namespace std;\n");
    push_lines(&mut out, &hoisted, "");
    out.push_str("\nint main() {\n");
    push_lines(&mut out, &body, "    ");
    out.push_str("    return 0;\n}\n");
    out
}

pub fn java(code: &str) -> String {
    if JAVA_CLASS.is_match(code) {
        return code.to_string();
    }
    let (hoisted, body) = hoist(code, |line| line.starts_with("import "));
    let mut out = String::from("import java.util.*;\nimport java.io.*;\n");
    push_lines(&mut out, &hoisted, "");
    out.push_str("\npublic class Main {\n    public static void main(String[] args) throws Exception {\n");
    push_lines(&mut out, &body, "        ");
    out.push_str("    }\n}\n");
    out
}

/// Class the source file is named after and the JVM is started with: the
/// public class, else the last class declared before `main`, else the first
/// declared type. Bare snippets are wrapped in `Main`.
pub fn java_class_name(code: &str) -> Option<String> {
    if let Some(caps) = JAVA_PUBLIC_CLASS.captures(code) {
        return Some(caps[1].to_string());
    }

    let declared: Vec<_> = JAVA_CLASS.captures_iter(code).collect();
    let Some(first) = declared.first() else {
        return Some("Main".to_string());
    };
    let owner = JAVA_MAIN.find(code).and_then(|main| {
        declared
            .iter()
            .take_while(|caps| caps.get(0).is_some_and(|decl| decl.start() < main.start()))
            .last()
    });
    Some(owner.unwrap_or(first)[1].to_string())
}

pub fn go(code: &str) -> String {
    let has_package = GO_PACKAGE.is_match(code);
    let has_main = GO_MAIN.is_match(code);
    if has_package && has_main {
        return code.to_string();
    }

    let lines: Vec<&str> = code.lines().collect();
    let mut imports = Vec::new();
    let mut body = Vec::new();
    let mut in_block = false;
    for line in lines {
        let trimmed = line.trim_start();
        if in_block {
            imports.push(line);
            if trimmed.starts_with(')') {
                in_block = false;
            }
        } else if trimmed.starts_with("package ") {
            continue;
        } else if trimmed.starts_with("import ") || trimmed.starts_with("import(") {
            in_block = trimmed.contains('(') && !trimmed.contains(')');
            imports.push(line);
        } else {
            body.push(line);
        }
    }

    let imported = imports.join("\n");
    let mut out = String::from("package main\n\n");
    for pkg in GO_AUTO_IMPORTS {
        if uses_package(code, pkg) && !imported.contains(&format!("\"{pkg}\"")) {
            out.push_str(&format!("import \"{pkg}\"\n"));
        }
    }
    push_lines(&mut out, &imports, "");
    out.push('\n');
    if has_main {
        push_lines(&mut out, &body, "");
    } else {
        out.push_str("func main() {\n");
        push_lines(&mut out, &body, "\t");
        out.push_str("}\n");
    }
    out
}

pub fn kotlin(code: &str) -> String {
    if KOTLIN_MAIN.is_match(code) {
        return code.to_string();
    }
    let (hoisted, body) = hoist(code, |line| line.starts_with("import "));
    let mut out = String::new();
    push_lines(&mut out, &hoisted, "");
    out.push_str("fun main() {\n");
    push_lines(&mut out, &body, "    ");
    out.push_str("}\n");
    out
}

pub fn php(code: &str) -> String {
    if code.trim_start().starts_with("<?") {
        return code.to_string();
    }
    format!("<?php\n{code}")
}

pub fn javascript(code: &str) -> String {
    with_input_prelude(code, JS_INPUT_PRELUDE)
}

pub fn typescript(code: &str) -> String {
    with_input_prelude(code, TS_INPUT_PRELUDE)
}

fn with_input_prelude(code: &str, prelude: &str) -> String {
    let wants_input = JS_CALLS_INPUT.is_match(code)
        && !JS_DEFINES_INPUT.is_match(code)
        && !JS_READS_STDIN.is_match(code);
    if !wants_input {
        return code.to_string();
    }
    format!("{prelude}\n{code}")
}

fn uses_package(code: &str, pkg: &str) -> bool {
    let needle = format!("{pkg}.");
    code.match_indices(&needle).any(|(at, _)| {
        code[..at]
            .chars()
            .next_back()
            .is_none_or(|prev| !(prev.is_alphanumeric() || prev == '_' || prev == '.'))
    })
}

/// Splits `code` into lines matching `keep_on_top` (compared after leading
/// whitespace) and everything else, preserving order within each group.
fn hoist<'a>(code: &'a str, keep_on_top: impl Fn(&str) -> bool) -> (Vec<&'a str>, Vec<&'a str>) {
    code.lines()
        .partition(|line| keep_on_top(line.trim_start()))
}

fn push_lines(out: &mut String, lines: &[&str], indent: &str) {
    for line in lines {
        if line.trim().is_empty() {
            out.push('\n');
        } else {
            out.push_str(indent);
            out.push_str(line);
            out.push('\n');
        }
    }
}
