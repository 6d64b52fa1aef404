//! Cast template language
//!
//! Cast recipes are small text templates with exactly two named
//! substitutions, `{{ .Src }}` and `{{ .Dst }}`, plus calls to named
//! zero-argument generator functions such as `{{ StructKeyword }}`. The
//! function table is closed: it is built by the registration code (and by
//! [`crate::builder::Builder::set_features`]) from the active feature mask,
//! so the same catalog renders differently on different hosts.

use std::rc::Rc;

use anyhow::{anyhow, bail};
use indexmap::IndexMap;

/// Named zero-argument generator callable from cast templates.
pub type CastFunction = Rc<dyn Fn() -> anyhow::Result<String>>;

/// Closed table of named generators available to templates.
pub type CastFunctionMap = IndexMap<String, CastFunction>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Src,
    Dst,
    Func(String),
}

/// A parsed cast template.
#[derive(Debug, Clone)]
pub struct CastTemplate {
    tokens: Vec<Token>,
}

impl CastTemplate {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut tokens = Vec::new();
        let mut rest = text;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                tokens.push(Token::Literal(rest[..start].to_string()));
            }

            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| anyhow!("unterminated '{{{{' in cast template"))?;

            let name = after[..end].trim();
            let token = match name {
                ".Src" => Token::Src,
                ".Dst" => Token::Dst,
                _ if name.starts_with('.') => {
                    bail!("unknown substitution {name:?} in cast template")
                }
                _ if name.is_empty() => bail!("empty substitution in cast template"),
                _ => Token::Func(name.to_string()),
            };
            tokens.push(token);

            rest = &after[end + 2..];
        }

        if !rest.is_empty() {
            tokens.push(Token::Literal(rest.to_string()));
        }

        Ok(Self { tokens })
    }

    /// Renders the template with the given source and destination variables.
    pub fn render(&self, src: &str, dst: &str, funcs: &CastFunctionMap) -> anyhow::Result<String> {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Src => out.push_str(src),
                Token::Dst => out.push_str(dst),
                Token::Func(name) => {
                    let f = funcs
                        .get(name)
                        .ok_or_else(|| anyhow!("unknown function {name:?} in cast template"))?;
                    out.push_str(&f()?);
                }
            }
        }
        Ok(out)
    }
}
