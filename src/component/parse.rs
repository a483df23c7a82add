//! Component source parser.
//!
//! A single forward pass over the bytes. Top-level text that is not a
//! `component`/`templ` declaration (imports, helper code) is skipped, with
//! braces kept balanced so keywords inside helper blocks are not mistaken
//! for declarations.
//!
//! In [`ParseMode::Reduced`] bodies are only brace-matched; no dependency
//! list is built, so memory stays bounded by the number of declarations.

use serde::{Deserialize, Serialize};

use super::{ParseError, Parameter, qualify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Full,
    Reduced,
}

/// One `component Name(...) { ... }` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    /// Unqualified name as written.
    pub name: String,
    pub params: Vec<Parameter>,
    /// Qualified dependency names, first-seen order, self excluded.
    pub dependencies: Vec<String>,
    pub line: usize,
}

/// Everything the scanner needs from one file. This is the value stored in
/// the metadata cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub package: Option<String>,
    /// Empty when `error` is set.
    pub declarations: Vec<Declaration>,
    pub error: Option<ParseError>,
    pub reduced: bool,
}

impl FileMetadata {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Parse a component file.
pub fn parse(source: &str, mode: ParseMode) -> FileMetadata {
    let mut parser = Parser::new(source.as_bytes(), mode);
    let reduced = mode == ParseMode::Reduced;
    match parser.file() {
        Ok(()) => FileMetadata {
            package: parser.package,
            declarations: parser.decls,
            error: None,
            reduced,
        },
        Err(error) => FileMetadata {
            package: parser.package,
            declarations: Vec::new(),
            error: Some(error),
            reduced,
        },
    }
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    pos: usize,
    line: usize,
    column: usize,
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    line_start: usize,
    mode: ParseMode,
    package: Option<String>,
    decls: Vec<Declaration>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a [u8], mode: ParseMode) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            line_start: 0,
            mode,
            package: None,
            decls: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // cursor
    // ------------------------------------------------------------------

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.line_start = self.pos;
        }
        Some(b)
    }

    fn mark(&self) -> Mark {
        Mark {
            pos: self.pos,
            line: self.line,
            column: self.pos - self.line_start + 1,
        }
    }

    fn error_at(&self, mark: Mark, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            line: mark.line,
            column: mark.column,
        }
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        self.error_at(self.mark(), message)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.bump();
        }
    }

    /// Whitespace plus `//` and `/* */` comments.
    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            self.skip_whitespace();
            match (self.peek(), self.peek_at(1)) {
                (Some(b'/'), Some(b'/')) => self.skip_line(),
                (Some(b'/'), Some(b'*')) => {
                    let start = self.mark();
                    self.pos += 2;
                    loop {
                        match self.bump() {
                            Some(b'*') if self.peek() == Some(b'/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => return Err(self.error_at(start, "unterminated block comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(b) = self.bump() {
            if b == b'\n' {
                break;
            }
        }
    }

    fn ident(&mut self) -> Option<String> {
        let start = self.pos;
        if !self.peek().is_some_and(is_ident_start) {
            return None;
        }
        while self.peek().is_some_and(is_ident_continue) {
            self.bump();
        }
        Some(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    /// `"..."` ends at the closing quote or end of line; backtick strings
    /// may span lines and must be closed.
    fn skip_string(&mut self) -> Result<(), ParseError> {
        let start = self.mark();
        let Some(quote) = self.bump() else {
            return Ok(());
        };
        while let Some(b) = self.peek() {
            if quote != b'`' && b == b'\n' {
                return Ok(());
            }
            self.bump();
            if b == b'\\' && quote != b'`' {
                self.bump();
            } else if b == quote {
                return Ok(());
            }
        }
        if quote == b'`' {
            Err(self.error_at(start, "unterminated raw string"))
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // grammar
    // ------------------------------------------------------------------

    fn file(&mut self) -> Result<(), ParseError> {
        self.skip_trivia()?;
        if self.at_keyword(b"package") {
            self.pos += b"package".len();
            self.skip_whitespace();
            let name = self
                .ident()
                .ok_or_else(|| self.error_here("expected package name"))?;
            self.package = Some(name);
        }

        loop {
            self.skip_trivia()?;
            let Some(b) = self.peek() else {
                return Ok(());
            };

            if is_ident_start(b) {
                let start = self.mark();
                let word = self.ident().unwrap_or_default();
                if (word == "component" || word == "templ")
                    && self.peek().is_some_and(|b| b.is_ascii_whitespace())
                {
                    self.declaration(start)?;
                }
                continue;
            }

            match b {
                b'{' => {
                    let open = self.mark();
                    self.bump();
                    self.skip_block(open, None)?;
                }
                b'}' => return Err(self.error_here("unexpected '}'")),
                b'"' | b'`' | b'\'' => self.skip_string()?,
                _ => {
                    self.bump();
                }
            }
        }
    }

    fn at_keyword(&self, keyword: &[u8]) -> bool {
        self.src[self.pos..].starts_with(keyword)
            && self
                .src
                .get(self.pos + keyword.len())
                .is_some_and(|b| b.is_ascii_whitespace())
    }

    fn declaration(&mut self, start: Mark) -> Result<(), ParseError> {
        self.skip_whitespace();
        let name_mark = self.mark();
        let name = self
            .ident()
            .ok_or_else(|| self.error_here("expected component name"))?;
        if self.decls.iter().any(|d| d.name == name) {
            return Err(self.error_at(name_mark, format!("duplicate component `{name}` in file")));
        }

        self.skip_whitespace();
        if self.peek() != Some(b'(') {
            return Err(self.error_here(format!("expected '(' after component name `{name}`")));
        }
        let params = self.params()?;

        self.skip_trivia()?;
        if self.peek() != Some(b'{') {
            return Err(self.error_here(format!("expected '{{' to open component `{name}`")));
        }
        let open = self.mark();
        self.bump();

        let mut dependencies = Vec::new();
        let collect = (self.mode == ParseMode::Full).then_some(&mut dependencies);
        self.skip_block(open, collect.map(|deps| (deps, name.as_str())))
            .map_err(|e| {
                if e.message == UNTERMINATED {
                    self.error_at(start, format!("unterminated component `{name}`: missing '}}'"))
                } else {
                    e
                }
            })?;

        self.decls.push(Declaration {
            name,
            params,
            dependencies,
            line: start.line,
        });
        Ok(())
    }

    fn params(&mut self) -> Result<Vec<Parameter>, ParseError> {
        let open = self.mark();
        self.bump();

        let mut segments: Vec<(usize, usize, Mark)> = Vec::new();
        let mut seg_start: Option<Mark> = None;
        let mut depth = 0usize;

        loop {
            let Some(b) = self.peek() else {
                return Err(self.error_at(open, "unterminated parameter list"));
            };
            match b {
                b',' | b')' if depth == 0 => {
                    let here = self.pos;
                    let mark = seg_start.take().unwrap_or_else(|| self.mark());
                    segments.push((mark.pos, here, mark));
                    self.bump();
                    if b == b')' {
                        break;
                    }
                    continue;
                }
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => depth = depth.saturating_sub(1),
                b'"' | b'`' => {
                    if seg_start.is_none() {
                        seg_start = Some(self.mark());
                    }
                    self.skip_string()?;
                    continue;
                }
                _ => {}
            }
            if seg_start.is_none() && !b.is_ascii_whitespace() {
                seg_start = Some(self.mark());
            }
            self.bump();
        }

        let last = segments.len().saturating_sub(1);
        let mut params: Vec<Parameter> = Vec::new();
        let mut pending: Vec<(String, Mark)> = Vec::new();

        for (i, &(from, to, mark)) in segments.iter().enumerate() {
            let text = String::from_utf8_lossy(&self.src[from..to]);
            let text = text.trim();
            if text.is_empty() {
                // `()` and a trailing comma are fine
                if i == last {
                    continue;
                }
                return Err(self.error_at(mark, "empty parameter"));
            }

            let name_len = text
                .bytes()
                .take_while(|b| is_ident_continue(*b))
                .count();
            let name = &text[..name_len];
            if name.is_empty() || !name.bytes().next().is_some_and(is_ident_start) {
                return Err(self.error_at(mark, format!("invalid parameter `{text}`")));
            }
            if params.iter().any(|p| p.name == name) || pending.iter().any(|(p, _)| p == name) {
                return Err(self.error_at(mark, format!("duplicate parameter `{name}`")));
            }

            let ty = text[name_len..].trim();
            if ty.is_empty() {
                pending.push((name.to_string(), mark));
                continue;
            }
            // `a, b string` groups share the next type
            for (grouped, _) in pending.drain(..) {
                params.push(Parameter {
                    name: grouped,
                    ty: ty.to_string(),
                });
            }
            params.push(Parameter {
                name: name.to_string(),
                ty: ty.to_string(),
            });
        }

        if let Some((name, mark)) = pending.first() {
            return Err(self.error_at(*mark, format!("parameter `{name}` is missing a type")));
        }
        Ok(params)
    }

    /// Consume up to the brace matching an already-consumed `{`.
    fn skip_block(
        &mut self,
        open: Mark,
        mut deps: Option<(&mut Vec<String>, &str)>,
    ) -> Result<(), ParseError> {
        let mut depth = 1usize;
        while let Some(b) = self.peek() {
            match b {
                b'"' | b'`' => {
                    self.skip_string()?;
                    continue;
                }
                b'/' if self.peek_at(1) == Some(b'/') => {
                    self.skip_line();
                    continue;
                }
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        self.bump();
                        return Ok(());
                    }
                }
                b'@' => {
                    self.bump();
                    if let Some((list, own)) = deps.as_mut() {
                        self.call(list, own);
                    }
                    continue;
                }
                _ => {}
            }
            self.bump();
        }
        Err(self.error_at(open, UNTERMINATED))
    }

    /// After `@`: record `Name(` / `pkg.Name(` as a dependency.
    fn call(&mut self, deps: &mut Vec<String>, own: &str) {
        let Some(mut callee) = self.ident() else {
            return;
        };
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(is_ident_start) {
            self.bump();
            if let Some(member) = self.ident() {
                callee.push('.');
                callee.push_str(&member);
            }
        }
        if self.peek() != Some(b'(') {
            return;
        }
        let package = self.package.as_deref();
        let qualified = qualify(package, &callee);
        if qualified == qualify(package, own) || deps.contains(&qualified) {
            return;
        }
        deps.push(qualified);
    }
}

const UNTERMINATED: &str = "unterminated block";

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_ident_continue(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(src: &str) -> FileMetadata {
        parse(src, ParseMode::Full)
    }

    fn param(name: &str, ty: &str) -> Parameter {
        Parameter {
            name: name.into(),
            ty: ty.into(),
        }
    }

    #[test]
    fn test_single_component() {
        let meta = full(
            "package ui\n\ncomponent Button(label string, disabled bool) {\n  <button>{ label }</button>\n  @Icon(\"check\")\n}\n",
        );
        assert!(meta.is_ok(), "{:?}", meta.error);
        assert_eq!(meta.package.as_deref(), Some("ui"));
        assert_eq!(meta.declarations.len(), 1);
        let decl = &meta.declarations[0];
        assert_eq!(decl.name, "Button");
        assert_eq!(decl.line, 3);
        assert_eq!(decl.params, vec![param("label", "string"), param("disabled", "bool")]);
        assert_eq!(decl.dependencies, vec!["ui.Icon"]);
    }

    #[test]
    fn test_multiple_components_and_templ_keyword() {
        let meta = full(
            "templ Card(title string) {\n  @Header(title)\n  @icons.Star()\n  @Header(title)\n}\n\ncomponent Header(text string) { <h1>{ text }</h1> }\n",
        );
        assert!(meta.is_ok());
        let names: Vec<_> = meta.declarations.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Card", "Header"]);
        assert_eq!(meta.declarations[0].dependencies, vec!["Header", "icons.Star"]);
        assert!(meta.declarations[1].dependencies.is_empty());
    }

    #[test]
    fn test_grouped_and_complex_types() {
        let meta = full("component List(a, b string, items []map[string]int, user *User, f func(int) bool) {}");
        assert!(meta.is_ok(), "{:?}", meta.error);
        assert_eq!(
            meta.declarations[0].params,
            vec![
                param("a", "string"),
                param("b", "string"),
                param("items", "[]map[string]int"),
                param("user", "*User"),
                param("f", "func(int) bool"),
            ]
        );
    }

    #[test]
    fn test_empty_params_and_trailing_comma() {
        let meta = full("component A() {}\ncomponent B(\n  x int,\n) {}");
        assert!(meta.is_ok(), "{:?}", meta.error);
        assert!(meta.declarations[0].params.is_empty());
        assert_eq!(meta.declarations[1].params, vec![param("x", "int")]);
    }

    #[test]
    fn test_self_reference_excluded() {
        let meta = full("package tree\ncomponent Node(n int) { @Node(n) @tree.Node(n) @Leaf() }");
        assert_eq!(meta.declarations[0].dependencies, vec!["tree.Leaf"]);
    }

    #[test]
    fn test_at_without_call_is_not_a_dependency() {
        let meta = full("component Mail() { <a href=\"mailto:x@y.z\">me@example.com</a> @Icon }");
        assert!(meta.declarations[0].dependencies.is_empty());
    }

    #[test]
    fn test_braces_in_strings_and_comments_ignored() {
        let meta = full(
            "component A() {\n  <p>{ \"}\" }</p>\n  // stray }\n  <pre>{ `{{` }</pre>\n}\ncomponent B() {}",
        );
        assert!(meta.is_ok(), "{:?}", meta.error);
        assert_eq!(meta.declarations.len(), 2);
    }

    #[test]
    fn test_top_level_helper_code_is_skipped() {
        let meta = full(
            "package ui\n\nimport \"strings\"\n\nfunc helper() string {\n  templ := \"component Fake() {\"\n  return templ\n}\n\ncomponent Real() {}\n",
        );
        assert!(meta.is_ok(), "{:?}", meta.error);
        let names: Vec<_> = meta.declarations.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Real"]);
    }

    #[test]
    fn test_unterminated_component() {
        let meta = full("package ui\n\ncomponent Broken(x int) {\n  <div>\n");
        let err = meta.error.unwrap();
        assert_eq!(err.line, 3);
        assert_eq!(err.column, 1);
        assert!(err.message.contains("unterminated component `Broken`"));
        assert!(meta.declarations.is_empty());
        assert_eq!(meta.package.as_deref(), Some("ui"));
    }

    #[test]
    fn test_missing_paren() {
        let err = full("component Broken {\n}").error.unwrap();
        assert_eq!((err.line, err.column), (1, 18));
        assert!(err.message.contains("expected '('"));
    }

    #[test]
    fn test_unterminated_params() {
        let err = full("component A(x int {").error.unwrap();
        assert_eq!((err.line, err.column), (1, 12));
        assert_eq!(err.message, "unterminated parameter list");
    }

    #[test]
    fn test_param_missing_type() {
        let err = full("component A(x int, y) {}").error.unwrap();
        assert_eq!(err.message, "parameter `y` is missing a type");
        assert_eq!((err.line, err.column), (1, 20));
    }

    #[test]
    fn test_duplicate_declaration() {
        let err = full("component A() {}\ncomponent A() {}").error.unwrap();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("duplicate component `A`"));
    }

    #[test]
    fn test_stray_closing_brace() {
        let err = full("component A() {}\n}").error.unwrap();
        assert_eq!((err.line, err.column), (2, 1));
    }

    #[test]
    fn test_reduced_mode_skips_dependencies() {
        let meta = parse("component A(x int) { @B() @C() }", ParseMode::Reduced);
        assert!(meta.is_ok());
        assert!(meta.reduced);
        assert_eq!(meta.declarations[0].params, vec![param("x", "int")]);
        assert!(meta.declarations[0].dependencies.is_empty());
    }

    #[test]
    fn test_empty_file() {
        let meta = full("// nothing here\n");
        assert!(meta.is_ok());
        assert!(meta.declarations.is_empty());
    }
}
