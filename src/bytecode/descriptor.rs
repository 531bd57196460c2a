//! JVM type and method descriptor parsing.
//!
//! Descriptors are the compact string encoding the class file format uses for
//! field types (`I`, `J`, `Ljava/lang/String;`, `[[D`) and method signatures
//! (`(ILjava/lang/Object;)V`). This module parses them into [`JavaType`] and
//! [`MethodDescriptor`], the typed representations the analyses work with.
//!
//! Two-word primitives (`long`, `double`) are the reason slot arithmetic lives
//! here: [`JavaType::slots`] is consulted by the instruction dispatch layer to
//! decide between single- and paired-slot frame accessors.

use std::fmt;
use std::sync::Arc;

use crate::{Error, Result};

/// Primitive (base) JVM types as they appear in descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    /// `B` - 8-bit signed integer.
    Byte,
    /// `C` - 16-bit unsigned character.
    Char,
    /// `D` - 64-bit IEEE float (two slots).
    Double,
    /// `F` - 32-bit IEEE float.
    Float,
    /// `I` - 32-bit signed integer.
    Int,
    /// `J` - 64-bit signed integer (two slots).
    Long,
    /// `S` - 16-bit signed integer.
    Short,
    /// `Z` - boolean, stored as an int on stack and in locals.
    Boolean,
}

impl BaseType {
    /// Parses a single base-type descriptor character.
    #[must_use]
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'B' => Some(BaseType::Byte),
            'C' => Some(BaseType::Char),
            'D' => Some(BaseType::Double),
            'F' => Some(BaseType::Float),
            'I' => Some(BaseType::Int),
            'J' => Some(BaseType::Long),
            'S' => Some(BaseType::Short),
            'Z' => Some(BaseType::Boolean),
            _ => None,
        }
    }

    /// The descriptor character for this base type.
    #[must_use]
    pub fn descriptor_char(self) -> char {
        match self {
            BaseType::Byte => 'B',
            BaseType::Char => 'C',
            BaseType::Double => 'D',
            BaseType::Float => 'F',
            BaseType::Int => 'I',
            BaseType::Long => 'J',
            BaseType::Short => 'S',
            BaseType::Boolean => 'Z',
        }
    }

    /// Returns `true` for the two-word primitives (`long`, `double`).
    #[must_use]
    pub fn is_wide(self) -> bool {
        matches!(self, BaseType::Long | BaseType::Double)
    }
}

/// A parsed JVM field type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JavaType {
    /// A primitive type.
    Base(BaseType),
    /// A class or interface type, by internal name (`java/lang/String`).
    Object(Arc<str>),
    /// An array type with the given element type.
    Array(Box<JavaType>),
}

impl JavaType {
    /// Shorthand for the `java/lang/Object` reference type.
    #[must_use]
    pub fn object() -> Self {
        JavaType::Object(Arc::from("java/lang/Object"))
    }

    /// Number of stack/local slots a value of this type occupies (1 or 2).
    #[must_use]
    pub fn slots(&self) -> u16 {
        match self {
            JavaType::Base(b) if b.is_wide() => 2,
            _ => 1,
        }
    }

    /// Returns `true` if this is a reference (object or array) type.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self, JavaType::Object(_) | JavaType::Array(_))
    }

    /// Parses a field descriptor, consuming exactly one type from `chars`.
    fn parse_from(chars: &mut std::str::Chars<'_>, full: &str) -> Result<Self> {
        let c = chars
            .next()
            .ok_or_else(|| Error::Lookup(format!("truncated descriptor `{full}`")))?;
        if let Some(base) = BaseType::from_char(c) {
            return Ok(JavaType::Base(base));
        }
        match c {
            'L' => {
                let mut name = String::new();
                for n in chars.by_ref() {
                    if n == ';' {
                        return Ok(JavaType::Object(Arc::from(name.as_str())));
                    }
                    name.push(n);
                }
                Err(Error::Lookup(format!("unterminated class in `{full}`")))
            }
            '[' => Ok(JavaType::Array(Box::new(Self::parse_from(chars, full)?))),
            _ => Err(Error::Lookup(format!(
                "unknown descriptor char `{c}` in `{full}`"
            ))),
        }
    }

    /// Parses a complete field descriptor string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lookup`] if the descriptor is malformed or has
    /// trailing characters.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let mut chars = descriptor.chars();
        let ty = Self::parse_from(&mut chars, descriptor)?;
        if chars.next().is_some() {
            return Err(Error::Lookup(format!(
                "trailing characters in descriptor `{descriptor}`"
            )));
        }
        Ok(ty)
    }
}

impl fmt::Display for JavaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JavaType::Base(b) => write!(f, "{}", b.descriptor_char()),
            JavaType::Object(name) => write!(f, "L{name};"),
            JavaType::Array(elem) => write!(f, "[{elem}"),
        }
    }
}

/// A parsed method descriptor: parameter types and an optional return type.
///
/// `None` as the return type encodes `void`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    /// Declared parameter types, left to right. The receiver is not included.
    pub params: Vec<JavaType>,
    /// Return type, or `None` for `void`.
    pub ret: Option<JavaType>,
}

impl MethodDescriptor {
    /// Parses a method descriptor string such as `(I[Ljava/lang/String;)J`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lookup`] if the descriptor is malformed.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let mut chars = descriptor.chars();
        if chars.next() != Some('(') {
            return Err(Error::Lookup(format!(
                "method descriptor `{descriptor}` must start with `(`"
            )));
        }
        let mut params = Vec::new();
        loop {
            let rest = chars.as_str();
            if rest.starts_with(')') {
                chars.next();
                break;
            }
            if rest.is_empty() {
                return Err(Error::Lookup(format!(
                    "unterminated parameter list in `{descriptor}`"
                )));
            }
            params.push(JavaType::parse_from(&mut chars, descriptor)?);
        }
        let ret = match chars.as_str() {
            "V" => None,
            _ => Some(JavaType::parse_from(&mut chars, descriptor)?),
        };
        if ret.is_some() && chars.next().is_some() {
            return Err(Error::Lookup(format!(
                "trailing characters in method descriptor `{descriptor}`"
            )));
        }
        Ok(MethodDescriptor { params, ret })
    }

    /// Total number of local slots the parameters occupy (excluding the receiver).
    #[must_use]
    pub fn param_slots(&self) -> u16 {
        self.params.iter().map(JavaType::slots).sum()
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for p in &self.params {
            write!(f, "{p}")?;
        }
        write!(f, ")")?;
        match &self.ret {
            None => write!(f, "V"),
            Some(ty) => write!(f, "{ty}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_primitives_and_objects() {
        assert_eq!(JavaType::parse("I").unwrap(), JavaType::Base(BaseType::Int));
        assert_eq!(
            JavaType::parse("Ljava/lang/String;").unwrap(),
            JavaType::Object(Arc::from("java/lang/String"))
        );
        let arr = JavaType::parse("[[D").unwrap();
        assert_eq!(arr.slots(), 1); // arrays are references
        assert!(arr.is_reference());
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(JavaType::parse("Ix").is_err());
        assert!(JavaType::parse("Ljava/lang/String").is_err());
        assert!(JavaType::parse("Q").is_err());
    }

    #[test]
    fn parses_method_descriptors() {
        let d = MethodDescriptor::parse("(I[Ljava/lang/String;J)V").unwrap();
        assert_eq!(d.params.len(), 3);
        assert_eq!(d.param_slots(), 4); // int + array ref + long
        assert!(d.ret.is_none());

        let d = MethodDescriptor::parse("()Ljava/lang/Object;").unwrap();
        assert!(d.params.is_empty());
        assert_eq!(d.ret.unwrap(), JavaType::object());
    }

    #[test]
    fn display_round_trips() {
        for s in ["(I[Ljava/lang/String;J)V", "()D", "(Lfoo/Bar;)[I"] {
            let d = MethodDescriptor::parse(s).unwrap();
            assert_eq!(d.to_string(), s);
        }
    }
}
