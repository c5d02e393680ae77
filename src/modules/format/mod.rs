// Copyright © 2025 mailforge.dev
// Licensed under MailForge License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use std::collections::HashMap;

use chrono::{DateTime, Local};

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailForgeResult;
use crate::modules::utils::shell_quote;
use crate::raise_error;

/// A pre-parsed `%`-escape template. Supports plain escapes with an
/// optional width (`%-10n`), the conditional form `%?x?then&else?`,
/// `%%` for a literal percent, and `%{fmt}`-style strftime dates via
/// the `d` escape.
#[derive(Clone, Debug)]
pub struct Template {
    items: Vec<Item>,
}

#[derive(Clone, Debug)]
enum Item {
    Literal(String),
    Escape {
        code: char,
        width: Option<isize>,
        strftime: Option<String>,
    },
    Conditional {
        code: char,
        then_branch: Template,
        else_branch: Template,
    },
}

/// Values a template draws from. Date-bearing contexts provide `date`
/// so `%d` can honor an embedded strftime format.
#[derive(Clone, Debug, Default)]
pub struct FormatContext {
    values: HashMap<char, String>,
    /// Codes whose values are already shell-safe and must be inserted
    /// verbatim by `render_command` (multi-argument clauses).
    raw: Vec<char>,
    pub date: Option<DateTime<Local>>,
}

impl FormatContext {
    pub fn new() -> Self {
        FormatContext::default()
    }

    pub fn set(&mut self, code: char, value: impl Into<String>) -> &mut Self {
        self.values.insert(code, value.into());
        self
    }

    /// Insert a value `render_command` must not quote again. The
    /// caller is responsible for having escaped each embedded word.
    pub fn set_raw(&mut self, code: char, value: impl Into<String>) -> &mut Self {
        self.values.insert(code, value.into());
        if !self.raw.contains(&code) {
            self.raw.push(code);
        }
        self
    }

    fn get(&self, code: char) -> Option<&str> {
        self.values.get(&code).map(|s| s.as_str())
    }

    fn is_raw(&self, code: char) -> bool {
        self.raw.contains(&code)
    }
}

impl Template {
    pub fn parse(input: &str) -> MailForgeResult<Self> {
        let mut chars = input.chars().peekable();
        Template::parse_until(&mut chars, &[])
    }

    fn parse_until(
        chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
        stops: &[char],
    ) -> MailForgeResult<Self> {
        let mut items = Vec::new();
        let mut literal = String::new();

        while let Some(&c) = chars.peek() {
            if stops.contains(&c) {
                break;
            }
            chars.next();
            if c != '%' {
                literal.push(c);
                continue;
            }
            if !literal.is_empty() {
                items.push(Item::Literal(std::mem::take(&mut literal)));
            }
            match chars.peek() {
                Some('%') => {
                    chars.next();
                    literal.push('%');
                }
                Some('?') => {
                    chars.next();
                    let code = chars.next().ok_or_else(|| {
                        raise_error!(
                            "Conditional escape missing its code".into(),
                            ErrorCode::TemplateSyntax
                        )
                    })?;
                    if chars.next() != Some('?') {
                        return Err(raise_error!(
                            "Conditional escape missing '?'".into(),
                            ErrorCode::TemplateSyntax
                        ));
                    }
                    let then_branch = Template::parse_until(chars, &['&', '?'])?;
                    let else_branch = if chars.peek() == Some(&'&') {
                        chars.next();
                        Template::parse_until(chars, &['?'])?
                    } else {
                        Template { items: Vec::new() }
                    };
                    if chars.next() != Some('?') {
                        return Err(raise_error!(
                            "Unterminated conditional escape".into(),
                            ErrorCode::TemplateSyntax
                        ));
                    }
                    items.push(Item::Conditional {
                        code,
                        then_branch,
                        else_branch,
                    });
                }
                Some(_) => {
                    let mut width_digits = String::new();
                    if chars.peek() == Some(&'-') {
                        width_digits.push('-');
                        chars.next();
                    }
                    while let Some(&digit) = chars.peek() {
                        if !digit.is_ascii_digit() {
                            break;
                        }
                        width_digits.push(digit);
                        chars.next();
                    }
                    let mut strftime = None;
                    let code = if chars.peek() == Some(&'{') {
                        chars.next();
                        let mut fmt = String::new();
                        for inner in chars.by_ref() {
                            if inner == '}' {
                                break;
                            }
                            fmt.push(inner);
                        }
                        strftime = Some(fmt);
                        'd'
                    } else {
                        chars.next().ok_or_else(|| {
                            raise_error!(
                                "Dangling '%' at end of template".into(),
                                ErrorCode::TemplateSyntax
                            )
                        })?
                    };
                    let width = if width_digits.is_empty() {
                        None
                    } else {
                        width_digits.parse::<isize>().ok()
                    };
                    items.push(Item::Escape {
                        code,
                        width,
                        strftime,
                    });
                }
                None => {
                    return Err(raise_error!(
                        "Dangling '%' at end of template".into(),
                        ErrorCode::TemplateSyntax
                    ))
                }
            }
        }
        if !literal.is_empty() {
            items.push(Item::Literal(literal));
        }
        Ok(Template { items })
    }

    pub fn render(&self, ctx: &FormatContext) -> String {
        let mut out = String::new();
        for item in &self.items {
            match item {
                Item::Literal(text) => out.push_str(text),
                Item::Escape {
                    code,
                    width,
                    strftime,
                } => {
                    let value = match (code, strftime, ctx.date) {
                        ('d', Some(fmt), Some(date)) => date.format(fmt).to_string(),
                        _ => ctx.get(*code).unwrap_or_default().to_string(),
                    };
                    out.push_str(&pad(&value, *width));
                }
                Item::Conditional {
                    code,
                    then_branch,
                    else_branch,
                } => {
                    let truthy = ctx.get(*code).is_some_and(|v| !v.is_empty());
                    let branch = if truthy { then_branch } else { else_branch };
                    out.push_str(&branch.render(ctx));
                }
            }
        }
        out
    }

    /// Render a subprocess command template: every substituted value
    /// is single-quoted with the `'\''` idiom so hostile filenames or
    /// key ids cannot smuggle shell syntax into `/bin/sh -c`.
    pub fn render_command(&self, ctx: &FormatContext) -> String {
        let mut out = String::new();
        for item in &self.items {
            match item {
                Item::Literal(text) => out.push_str(text),
                Item::Escape { code, .. } => {
                    if let Some(value) = ctx.get(*code) {
                        if !value.is_empty() {
                            if ctx.is_raw(*code) {
                                out.push_str(value);
                            } else {
                                out.push_str(&shell_quote(value));
                            }
                        }
                    }
                }
                Item::Conditional {
                    code,
                    then_branch,
                    else_branch,
                } => {
                    let truthy = ctx.get(*code).is_some_and(|v| !v.is_empty());
                    let branch = if truthy { then_branch } else { else_branch };
                    out.push_str(&branch.render_command(ctx));
                }
            }
        }
        out
    }
}

fn pad(value: &str, width: Option<isize>) -> String {
    match width {
        None => value.to_string(),
        Some(w) if w < 0 => {
            let w = (-w) as usize;
            format!("{:<width$}", value, width = w)
        }
        Some(w) => format!("{:>width$}", value, width = w as usize),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_escapes_substitute() {
        let t = Template::parse("On %d, %n wrote:").unwrap();
        let mut ctx = FormatContext::new();
        ctx.set('n', "Jane Doe");
        ctx.set('d', "Mon, Jan 1");
        assert_eq!(t.render(&ctx), "On Mon, Jan 1, Jane Doe wrote:");
    }

    #[test]
    fn conditional_picks_branch() {
        let t = Template::parse("%?k?-u %k&default?").unwrap();
        let mut ctx = FormatContext::new();
        ctx.set('k', "0xDEADBEEF");
        assert_eq!(t.render(&ctx), "-u 0xDEADBEEF");
        let empty = FormatContext::new();
        assert_eq!(t.render(&empty), "default");
    }

    #[test]
    fn literal_percent_and_width() {
        let t = Template::parse("100%% %-6nX").unwrap();
        let mut ctx = FormatContext::new();
        ctx.set('n', "ab");
        assert_eq!(t.render(&ctx), "100% ab    X");
    }

    #[test]
    fn command_rendering_quotes_substitutions() {
        let t = Template::parse("gpg --sign %f").unwrap();
        let mut ctx = FormatContext::new();
        ctx.set('f', "/tmp/it's here; rm -rf /");
        assert_eq!(
            t.render_command(&ctx),
            "gpg --sign '/tmp/it'\\''s here; rm -rf /'"
        );
    }

    #[test]
    fn strftime_escape_uses_context_date() {
        let t = Template::parse("%{%Y}").unwrap();
        let mut ctx = FormatContext::new();
        ctx.date = Some(Local::now());
        let rendered = t.render(&ctx);
        assert_eq!(rendered.len(), 4);
        assert!(rendered.chars().all(|c| c.is_ascii_digit()));
    }
}
