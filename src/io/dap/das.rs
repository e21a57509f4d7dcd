//! DAS (Dataset Attribute Structure) parsing.

use super::dds::AtomicType;
use super::lexer::{Token, Tokens};
use super::DapError;
use crate::dataset::{AttrValue, Attributes};
use std::collections::BTreeMap;

/// Container holding dataset-level attributes.
pub const GLOBAL_CONTAINER: &str = "NC_GLOBAL";

/// Server bookkeeping, not dataset metadata.
const EXTRA_CONTAINER: &str = "DODS_EXTRA";

/// Parsed attributes, keyed by container. Nested containers use dotted names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Das {
    containers: BTreeMap<String, Attributes>,
}

impl Das {
    /// Attributes of a variable, empty if the server sent none.
    pub fn attributes(&self, variable: &str) -> Attributes {
        self.containers.get(variable).cloned().unwrap_or_default()
    }

    /// Dataset-level attributes.
    pub fn global(&self) -> Attributes {
        self.containers
            .iter()
            .find(|(name, _)| {
                name.eq_ignore_ascii_case(GLOBAL_CONTAINER) || name.eq_ignore_ascii_case("global")
            })
            .map(|(_, attrs)| attrs.clone())
            .unwrap_or_default()
    }

    pub fn containers(&self) -> impl Iterator<Item = &String> {
        self.containers.keys()
    }
}

/// Parse DAS text.
pub fn parse_das(text: &str) -> Result<Das, DapError> {
    let mut tokens = Tokens::new(text)?;

    let keyword = tokens.word()?;
    if !keyword.eq_ignore_ascii_case("attributes") {
        return Err(DapError::Parse(format!("expected 'Attributes', found {:?}", keyword)));
    }
    tokens.expect(Token::LBrace)?;

    let mut das = Das::default();
    while !matches!(tokens.peek(), Some(Token::RBrace) | None) {
        let name = tokens.name()?;
        tokens.expect(Token::LBrace)?;
        parse_container(&mut tokens, &name, &mut das)?;
    }
    tokens.expect(Token::RBrace)?;
    das.containers.remove(EXTRA_CONTAINER);
    Ok(das)
}

/// Container body up to and including its closing brace.
fn parse_container(tokens: &mut Tokens, path: &str, das: &mut Das) -> Result<(), DapError> {
    let mut attrs = Attributes::new();

    loop {
        match tokens.peek() {
            Some(Token::RBrace) => {
                tokens.next()?;
                break;
            }
            None => return Err(DapError::Parse(format!("unterminated container {:?}", path))),
            _ => {}
        }

        if tokens.peek_at(1) == Some(&Token::LBrace) {
            let name = tokens.name()?;
            tokens.expect(Token::LBrace)?;
            parse_container(tokens, &format!("{}.{}", path, name), das)?;
            continue;
        }

        let type_name = tokens.word()?;
        if type_name.eq_ignore_ascii_case("alias") {
            while tokens.next()? != Token::Semicolon {}
            continue;
        }
        let atomic = AtomicType::parse(&type_name)
            .ok_or_else(|| DapError::Parse(format!("unknown attribute type {:?}", type_name)))?;
        let name = tokens.name()?;

        let mut raw = vec![tokens.name()?];
        loop {
            match tokens.next()? {
                Token::Comma => raw.push(tokens.name()?),
                Token::Semicolon => break,
                other => {
                    return Err(DapError::Parse(format!(
                        "unexpected {} in attribute {:?}",
                        other.describe(),
                        name
                    )))
                }
            }
        }
        attrs.insert(name.clone(), convert_values(atomic, raw, &name)?);
    }

    das.containers.insert(path.to_string(), attrs);
    Ok(())
}

fn convert_values(atomic: AtomicType, raw: Vec<String>, name: &str) -> Result<AttrValue, DapError> {
    let bad = |v: &str| DapError::Parse(format!("invalid {} value {:?} for attribute {:?}", atomic, v, name));
    match atomic {
        AtomicType::String | AtomicType::Url => Ok(AttrValue::Text(raw)),
        AtomicType::Float32 | AtomicType::Float64 => raw
            .iter()
            .map(|v| v.parse::<f64>().map_err(|_| bad(v)))
            .collect::<Result<Vec<_>, _>>()
            .map(AttrValue::Float),
        _ => raw
            .iter()
            .map(|v| v.parse::<i64>().map_err(|_| bad(v)))
            .collect::<Result<Vec<_>, _>>()
            .map(AttrValue::Int),
    }
}
