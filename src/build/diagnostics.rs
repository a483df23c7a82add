//! Compiler output to structured diagnostics.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::{Diagnostic, Severity};

/// Turns raw compiler output into diagnostics.
pub trait ErrorParser: Send + Sync {
    fn parse(&self, output: &str) -> Vec<Diagnostic>;
}

static ANSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid ANSI regex"));

/// `file:line:col: [severity:] message`
static FILE_LINE_COL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>(?:[A-Za-z]:)?[^:\s][^:]*):(?P<line>\d+):(?P<col>\d+):\s*(?:(?P<sev>error|warning|warn|note|info|hint):\s*)?(?P<msg>.+)$",
    )
    .expect("valid location regex")
});

/// `file:line: [severity:] message`
static FILE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>(?:[A-Za-z]:)?[^:\s][^:]*):(?P<line>\d+):\s*(?:(?P<sev>error|warning|warn|note|info|hint):\s*)?(?P<msg>.+)$",
    )
    .expect("valid location regex")
});

/// `file: message (line N, col M)`
static PAREN_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>(?:[A-Za-z]:)?[^:\s][^:]*):\s*(?:(?P<sev>error|warning|warn|note|info|hint):\s*)?(?P<msg>.+?)\s*\(line (?P<line>\d+),\s*col(?:umn)? (?P<col>\d+)\)$",
    )
    .expect("valid location regex")
});

/// Recognises the three common location shapes. Lines that match none of
/// them are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocationParser;

impl ErrorParser for LocationParser {
    fn parse(&self, output: &str) -> Vec<Diagnostic> {
        let clean = ANSI.replace_all(output, "");
        clean
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .filter_map(parse_line)
            .collect()
    }
}

fn parse_line(line: &str) -> Option<Diagnostic> {
    let caps = [&*PAREN_LOCATION, &*FILE_LINE_COL, &*FILE_LINE]
        .iter()
        .find_map(|re| re.captures(line))?;

    let number = |name: &str| caps.name(name).and_then(|m| m.as_str().parse::<usize>().ok());
    let line_no = number("line")?;
    let severity = caps
        .name("sev")
        .map_or(Severity::Error, |m| Severity::parse(m.as_str()));

    Some(Diagnostic {
        file: Some(PathBuf::from(caps["file"].trim())),
        line: Some(line_no),
        column: number("col"),
        message: caps["msg"].trim().to_string(),
        severity,
    })
}

/// The single error reported when a failed build produced nothing parseable.
pub fn fallback_error(output: &str, exit_code: Option<i32>) -> Diagnostic {
    let clean = ANSI.replace_all(output, "");
    let text = clean.trim();
    if text.is_empty() {
        match exit_code {
            Some(code) => Diagnostic::error(format!("compiler exited with status {code}")),
            None => Diagnostic::error("compiler terminated by signal"),
        }
    } else {
        Diagnostic::error(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn parse(output: &str) -> Vec<Diagnostic> {
        LocationParser.parse(output)
    }

    #[test]
    fn test_file_line_col() {
        let diags = parse("ui/button.component:12:5: error: unexpected token `}`");
        assert_eq!(diags.len(), 1);
        let d = &diags[0];
        assert_eq!(d.file.as_deref(), Some(Path::new("ui/button.component")));
        assert_eq!((d.line, d.column), (Some(12), Some(5)));
        assert_eq!(d.message, "unexpected token `}`");
        assert_eq!(d.severity, Severity::Error);
    }

    #[test]
    fn test_file_line_without_severity() {
        let diags = parse("card.templ:3: missing closing brace");
        assert_eq!(diags[0].line, Some(3));
        assert_eq!(diags[0].column, None);
        assert_eq!(diags[0].message, "missing closing brace");
    }

    #[test]
    fn test_parenthesised_location() {
        let diags = parse("nav.component: expected identifier (line 4, col 17)");
        assert_eq!(diags[0].file.as_deref(), Some(Path::new("nav.component")));
        assert_eq!((diags[0].line, diags[0].column), (Some(4), Some(17)));
        assert_eq!(diags[0].message, "expected identifier");
    }

    #[test]
    fn test_warning_severity_and_ansi() {
        let diags = parse("\x1b[33ma.component:1:1: warning: unused parameter\x1b[0m");
        assert_eq!(diags[0].severity, Severity::Warning);
        assert_eq!(diags[0].message, "unused parameter");
    }

    #[test]
    fn test_multiple_and_noise_lines() {
        let output = "compiling...\na.component:1:2: error: one\n\nb.component:3:4: error: two\ndone";
        let diags = parse(output);
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[1].message, "two");
    }

    #[test]
    fn test_unstructured_output_yields_nothing() {
        assert!(parse("panic: something went wrong").is_empty());
    }

    #[test]
    fn test_fallback_error() {
        assert_eq!(fallback_error("  boom\n", Some(1)).message, "boom");
        assert_eq!(
            fallback_error("", Some(2)).message,
            "compiler exited with status 2"
        );
    }
}
