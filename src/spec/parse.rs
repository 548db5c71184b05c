//! Hand-rolled parser for the abstract-spec grammar:
//!
//! ```text
//! spec       = node { ^node }
//! node       = [name] { @version-list | %compiler | +variant | ~variant
//!                     | key=value }
//! compiler   = name [@version-list]
//! key=value  = variant assignment, or one of the reserved keys
//!              arch=platform-os-target, platform=, os=, target=
//! ```
//!
//! A node without a leading name is an anonymous constraint spec, as used
//! in `when=` predicates.

use indexmap::map::Entry;

use super::{Arch, CompilerSpec, Spec, VariantValue};
use crate::error::ParseError;
use crate::version::VersionList;

pub(super) fn parse_spec(text: &str) -> Result<Spec, ParseError> {
    let mut cur = Cursor { text, pos: 0 };
    let mut root = parse_node(&mut cur)?;
    loop {
        cur.skip_ws();
        if cur.eat('^') {
            let dep = parse_node(&mut cur)?;
            if dep.name.is_none() {
                return Err(cur.err("dependency spec must be named"));
            }
            root.dependencies.push(dep);
        } else {
            debug_assert!(cur.at_eof());
            return Ok(root);
        }
    }
}

struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn at_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn eat_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if pred(c) {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        &self.text[start..self.pos]
    }

    fn err(&self, reason: impl Into<String>) -> ParseError {
        ParseError::new(self.text, reason, self.pos)
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_version_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | ',' | '-')
}

fn is_value_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ',' | '*' | '-' | '/')
}

fn parse_node(cur: &mut Cursor<'_>) -> Result<Spec, ParseError> {
    let mut spec = Spec::default();
    cur.skip_ws();

    // A leading identifier is the package name, unless it turns out to be
    // the key of a key=value pair.
    if cur.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
        let save = cur.pos;
        let ident = cur.eat_while(is_name_char);
        if cur.peek() == Some('=') {
            cur.pos = save;
        } else {
            spec.name = Some(ident.to_string());
        }
    }

    loop {
        cur.skip_ws();
        match cur.peek() {
            None | Some('^') => return Ok(spec),
            Some('@') => {
                cur.pos += 1;
                if !spec.versions.is_any() {
                    return Err(cur.err("version constraint specified twice"));
                }
                spec.versions = parse_versions(cur)?;
            }
            Some('%') => {
                cur.pos += 1;
                if spec.compiler.is_some() {
                    return Err(cur.err("compiler specified twice"));
                }
                let name = cur.eat_while(is_name_char);
                if name.is_empty() {
                    return Err(cur.err("expected compiler name after `%`"));
                }
                let versions = if cur.eat('@') {
                    parse_versions(cur)?
                } else {
                    VersionList::any()
                };
                spec.compiler = Some(CompilerSpec {
                    name: name.to_string(),
                    versions,
                });
            }
            Some(sigil @ ('+' | '~')) => {
                cur.pos += 1;
                let name = cur.eat_while(is_name_char);
                if name.is_empty() {
                    return Err(cur.err(format!("expected variant name after `{sigil}`")));
                }
                insert_variant(cur, &mut spec, name, VariantValue::Bool(sigil == '+'))?;
            }
            Some(c) if c.is_ascii_alphanumeric() || c == '_' => {
                let key = cur.eat_while(is_name_char);
                if !cur.eat('=') {
                    return Err(cur.err(format!("expected `=` after `{key}`")));
                }
                let start = cur.pos;
                let value = cur.eat_while(is_value_char);
                if value.is_empty() {
                    return Err(cur.err(format!("expected a value for `{key}=`")));
                }
                match key {
                    "arch" => {
                        let arch = Arch::from_triple_text(value).ok_or_else(|| {
                            ParseError::new(
                                cur.text,
                                "expected `platform-os-target` after `arch=`",
                                start,
                            )
                        })?;
                        merge_arch(cur, &mut spec, arch)?;
                    }
                    "platform" => {
                        let arch = Arch {
                            platform: Some(value.to_string()),
                            ..Arch::default()
                        };
                        merge_arch(cur, &mut spec, arch)?;
                    }
                    "os" => {
                        let arch = Arch {
                            os: Some(value.to_string()),
                            ..Arch::default()
                        };
                        merge_arch(cur, &mut spec, arch)?;
                    }
                    "target" => {
                        let arch = Arch {
                            target: Some(value.to_string()),
                            ..Arch::default()
                        };
                        merge_arch(cur, &mut spec, arch)?;
                    }
                    _ => {
                        let value = if value.contains(',') {
                            VariantValue::multi(value.split(','))
                        } else {
                            VariantValue::Single(value.to_string())
                        };
                        insert_variant(cur, &mut spec, key, value)?;
                    }
                }
            }
            Some(c) => return Err(cur.err(format!("unexpected `{c}`"))),
        }
    }
}

fn parse_versions(cur: &mut Cursor<'_>) -> Result<VersionList, ParseError> {
    let start = cur.pos;
    let text = cur.eat_while(is_version_char);
    if text.is_empty() {
        return Err(cur.err("expected a version constraint after `@`"));
    }
    VersionList::parse(text).map_err(|e| ParseError::new(cur.text, e.reason, start + e.offset))
}

fn insert_variant(
    cur: &Cursor<'_>,
    spec: &mut Spec,
    name: &str,
    value: VariantValue,
) -> Result<(), ParseError> {
    match spec.variants.entry(name.to_string()) {
        Entry::Occupied(_) => Err(cur.err(format!("variant `{name}` specified more than once"))),
        Entry::Vacant(slot) => {
            slot.insert(value);
            Ok(())
        }
    }
}

fn merge_arch(cur: &Cursor<'_>, spec: &mut Spec, arch: Arch) -> Result<(), ParseError> {
    spec.arch = spec
        .arch
        .constrain(&arch)
        .ok_or_else(|| cur.err("conflicting architecture constraints"))?;
    Ok(())
}
