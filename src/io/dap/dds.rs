//! DDS (Dataset Descriptor Structure) parsing.
//!
//! A DDS describes the shape and types of every variable a DAP2 server
//! exposes:
//!
//! ```text
//! Dataset {
//!     Float64 time[time = 248];
//!     Grid {
//!       ARRAY:
//!         Float32 air[time = 248][y = 277][x = 349];
//!       MAPS:
//!         Float64 time[time = 248];
//!         Float32 y[y = 277];
//!         Float32 x[x = 349];
//!     } air;
//!     Int32 Lambert_Conformal;
//! } air.mon.mean.nc;
//! ```

use super::lexer::{Token, Tokens};
use super::DapError;
use crate::dataset::DataType;
use std::fmt;

/// DAP2 atomic types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicType {
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
    String,
    Url,
}

impl AtomicType {
    pub fn parse(word: &str) -> Option<Self> {
        let t = match word.to_ascii_lowercase().as_str() {
            "byte" => AtomicType::Byte,
            "int16" => AtomicType::Int16,
            "uint16" => AtomicType::UInt16,
            "int32" => AtomicType::Int32,
            "uint32" => AtomicType::UInt32,
            "float32" => AtomicType::Float32,
            "float64" => AtomicType::Float64,
            "string" => AtomicType::String,
            "url" => AtomicType::Url,
            _ => return None,
        };
        Some(t)
    }

    pub fn data_type(&self) -> DataType {
        match self {
            AtomicType::Byte => DataType::UInt8,
            AtomicType::Int16 => DataType::Int16,
            AtomicType::UInt16 => DataType::UInt16,
            AtomicType::Int32 => DataType::Int32,
            AtomicType::UInt32 => DataType::UInt32,
            AtomicType::Float32 => DataType::Float32,
            AtomicType::Float64 => DataType::Float64,
            AtomicType::String | AtomicType::Url => DataType::String,
        }
    }
}

impl fmt::Display for AtomicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AtomicType::Byte => "Byte",
            AtomicType::Int16 => "Int16",
            AtomicType::UInt16 => "UInt16",
            AtomicType::Int32 => "Int32",
            AtomicType::UInt32 => "UInt32",
            AtomicType::Float32 => "Float32",
            AtomicType::Float64 => "Float64",
            AtomicType::String => "String",
            AtomicType::Url => "Url",
        };
        f.write_str(name)
    }
}

/// One array dimension; DAP2 allows anonymous dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimDecl {
    pub name: Option<String>,
    pub size: usize,
}

/// A scalar (no dims) or array of an atomic type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayDecl {
    pub name: String,
    pub atomic: AtomicType,
    pub dims: Vec<DimDecl>,
}

impl ArrayDecl {
    pub fn shape(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.size).collect()
    }

    /// Number of values, or a parse error if the declared sizes overflow.
    pub fn element_count(&self) -> Result<usize, DapError> {
        self.dims.iter().try_fold(1usize, |count, d| {
            count.checked_mul(d.size).ok_or_else(|| {
                DapError::Parse(format!("dimensions of {:?} are too large: {:?}", self.name, self.shape()))
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Base(ArrayDecl),
    Grid {
        name: String,
        array: ArrayDecl,
        maps: Vec<ArrayDecl>,
    },
    Structure {
        name: String,
        members: Vec<Declaration>,
    },
    Sequence {
        name: String,
        members: Vec<Declaration>,
    },
}

impl Declaration {
    pub fn name(&self) -> &str {
        match self {
            Declaration::Base(a) => &a.name,
            Declaration::Grid { name, .. }
            | Declaration::Structure { name, .. }
            | Declaration::Sequence { name, .. } => name,
        }
    }
}

/// A variable after flattening structures and grids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatVariable {
    /// Dotted path for structure members
    pub name: String,
    pub atomic: AtomicType,
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
}

/// A parsed DDS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dds {
    pub name: String,
    pub declarations: Vec<Declaration>,
}

impl Dds {
    /// Flatten into variables.
    ///
    /// Grids contribute their array under the grid's name and each map as its
    /// own variable; a map already declared elsewhere is listed once.
    /// Sequences are rejected.
    pub fn variables(&self) -> Result<Vec<FlatVariable>, DapError> {
        let mut out = Vec::new();
        flatten(&self.declarations, "", &mut out)?;
        Ok(out)
    }
}

fn flatten(decls: &[Declaration], prefix: &str, out: &mut Vec<FlatVariable>) -> Result<(), DapError> {
    let qualify = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", prefix, name)
        }
    };

    for decl in decls {
        match decl {
            Declaration::Base(a) => push_unique(out, flat(qualify(&a.name), a, None)),
            Declaration::Grid { name, array, maps } => {
                let map_names: Vec<&str> = maps.iter().map(|m| m.name.as_str()).collect();
                push_unique(out, flat(qualify(name), array, Some(&map_names)));
                for map in maps {
                    push_unique(out, flat(qualify(&map.name), map, None));
                }
            }
            Declaration::Structure { name, members } => flatten(members, &qualify(name), out)?,
            Declaration::Sequence { name, .. } => {
                return Err(DapError::Unsupported(format!("sequence {:?}", qualify(name))))
            }
        }
    }
    Ok(())
}

fn flat(name: String, array: &ArrayDecl, map_names: Option<&[&str]>) -> FlatVariable {
    let dims = array
        .dims
        .iter()
        .enumerate()
        .map(|(i, d)| match (&d.name, map_names.and_then(|m| m.get(i))) {
            (Some(n), _) => n.clone(),
            (None, Some(m)) => m.to_string(),
            (None, None) => format!("{}_dim_{}", name, i),
        })
        .collect();
    FlatVariable {
        name,
        atomic: array.atomic,
        dims,
        shape: array.shape(),
    }
}

fn push_unique(out: &mut Vec<FlatVariable>, var: FlatVariable) {
    if !out.iter().any(|v| v.name == var.name) {
        out.push(var);
    }
}

/// Parse DDS text.
pub fn parse_dds(text: &str) -> Result<Dds, DapError> {
    let mut tokens = Tokens::new(text)?;

    let keyword = tokens.word()?;
    if !keyword.eq_ignore_ascii_case("dataset") {
        return Err(DapError::Parse(format!("expected 'Dataset', found {:?}", keyword)));
    }
    tokens.expect(Token::LBrace)?;
    let declarations = parse_declarations(&mut tokens)?;
    tokens.expect(Token::RBrace)?;
    let name = parse_trailing_name(&mut tokens)?;

    Ok(Dds { name, declarations })
}

/// Declarations up to (not including) the closing brace.
fn parse_declarations(tokens: &mut Tokens) -> Result<Vec<Declaration>, DapError> {
    let mut decls = Vec::new();
    while !matches!(tokens.peek(), Some(Token::RBrace) | None) {
        decls.push(parse_declaration(tokens)?);
    }
    Ok(decls)
}

fn parse_declaration(tokens: &mut Tokens) -> Result<Declaration, DapError> {
    let keyword = tokens.word()?;
    match keyword.to_ascii_lowercase().as_str() {
        "grid" => {
            tokens.expect(Token::LBrace)?;
            expect_section(tokens, "array")?;
            let array = parse_array(tokens)?;
            expect_section(tokens, "maps")?;
            let mut maps = Vec::new();
            while !matches!(tokens.peek(), Some(Token::RBrace) | None) {
                maps.push(parse_array(tokens)?);
            }
            tokens.expect(Token::RBrace)?;
            let name = parse_trailing_name(tokens)?;
            Ok(Declaration::Grid { name, array, maps })
        }
        "structure" => {
            tokens.expect(Token::LBrace)?;
            let members = parse_declarations(tokens)?;
            tokens.expect(Token::RBrace)?;
            let name = parse_trailing_name(tokens)?;
            Ok(Declaration::Structure { name, members })
        }
        "sequence" => {
            tokens.expect(Token::LBrace)?;
            let members = parse_declarations(tokens)?;
            tokens.expect(Token::RBrace)?;
            let name = parse_trailing_name(tokens)?;
            Ok(Declaration::Sequence { name, members })
        }
        _ => {
            let atomic = AtomicType::parse(&keyword)
                .ok_or_else(|| DapError::Parse(format!("unknown type {:?}", keyword)))?;
            parse_array_body(tokens, atomic).map(Declaration::Base)
        }
    }
}

fn expect_section(tokens: &mut Tokens, section: &str) -> Result<(), DapError> {
    let word = tokens.word()?;
    if !word.eq_ignore_ascii_case(section) {
        return Err(DapError::Parse(format!(
            "expected '{}:' in grid, found {:?}",
            section.to_ascii_uppercase(),
            word
        )));
    }
    tokens.expect(Token::Colon)
}

fn parse_array(tokens: &mut Tokens) -> Result<ArrayDecl, DapError> {
    let keyword = tokens.word()?;
    let atomic = AtomicType::parse(&keyword)
        .ok_or_else(|| DapError::Parse(format!("expected an atomic type, found {:?}", keyword)))?;
    parse_array_body(tokens, atomic)
}

/// `name[dim = size]...;` after the type keyword.
fn parse_array_body(tokens: &mut Tokens, atomic: AtomicType) -> Result<ArrayDecl, DapError> {
    let name = tokens.name()?;
    let mut dims = Vec::new();
    while tokens.peek() == Some(&Token::LBracket) {
        tokens.next()?;
        let first = tokens.word()?;
        let dim = if tokens.peek() == Some(&Token::Equals) {
            tokens.next()?;
            let size = tokens.word()?;
            DimDecl {
                name: Some(first),
                size: parse_size(&size)?,
            }
        } else {
            DimDecl {
                name: None,
                size: parse_size(&first)?,
            }
        };
        tokens.expect(Token::RBracket)?;
        dims.push(dim);
    }
    tokens.expect(Token::Semicolon)?;
    Ok(ArrayDecl { name, atomic, dims })
}

fn parse_size(word: &str) -> Result<usize, DapError> {
    word.parse()
        .map_err(|_| DapError::Parse(format!("invalid dimension size {:?}", word)))
}

/// `name;` after a closing brace. Dataset names may contain dots.
fn parse_trailing_name(tokens: &mut Tokens) -> Result<String, DapError> {
    let name = tokens.name()?;
    if tokens.peek() == Some(&Token::Semicolon) {
        tokens.next()?;
    }
    Ok(name)
}
