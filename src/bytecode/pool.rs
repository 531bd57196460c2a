//! Constant pool model and resolved symbolic references.
//!
//! The analyses never touch raw class-file constant pool bytes; a
//! [`ConstPool`] holds already-resolved entries so that every symbolic
//! reference an instruction carries (class, field, method, dynamic call site)
//! resolves to a typed descriptor in one lookup. Resolution failures surface
//! as [`Error::Lookup`](crate::Error::Lookup) and are fatal to the method
//! being analyzed, never to the process.
//!
//! # Key Types
//!
//! - [`ConstPool`] - indexed entry table, entry 0 unused as in the class file format
//! - [`PoolEntry`] - loadable constants and member references
//! - [`ClassRef`] / [`FieldRef`] / [`MethodRef`] - resolved member references
//! - [`CallSiteRef`] - `invokedynamic` call site with bootstrap method and static arguments
//! - [`MemberId`] - stable member identifier used for policy lookups and caches

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::{
    bytecode::descriptor::{JavaType, MethodDescriptor},
    Error, Result,
};

bitflags! {
    /// Access flags of a referenced field, restricted to the bits the
    /// analyses consume.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FieldFlags: u16 {
        /// `ACC_STATIC`.
        const STATIC = 0x0008;
        /// `ACC_FINAL`.
        const FINAL = 0x0010;
    }
}

/// A resolved class or interface reference, by internal name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassRef {
    /// Internal binary name, e.g. `java/lang/String`.
    pub name: Arc<str>,
}

impl ClassRef {
    /// Creates a class reference from an internal name.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        ClassRef { name: name.into() }
    }
}

impl fmt::Display for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A resolved field reference.
///
/// The flags are resolved at pool-construction time (by the class-loading
/// boundary, which has the declaring class at hand), so the constant analysis
/// can recognize `static final` reads without a class-loading service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    /// Declaring class.
    pub class: ClassRef,
    /// Field name.
    pub name: Arc<str>,
    /// Declared field type.
    pub descriptor: JavaType,
    /// Resolved access flags.
    pub flags: FieldFlags,
}

impl FieldRef {
    /// Stable identifier of this field for policy lookups.
    #[must_use]
    pub fn member_id(&self) -> MemberId {
        MemberId {
            class: self.class.name.clone(),
            name: self.name.clone(),
            descriptor: Arc::from(self.descriptor.to_string().as_str()),
        }
    }

    /// Returns `true` if the field is `static final`.
    #[must_use]
    pub fn is_static_final(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC | FieldFlags::FINAL)
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.class, self.name, self.descriptor)
    }
}

/// A resolved method reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodRef {
    /// Declaring class or interface.
    pub class: ClassRef,
    /// Method name (`<init>` for constructors).
    pub name: Arc<str>,
    /// Parsed method descriptor.
    pub descriptor: MethodDescriptor,
}

impl MethodRef {
    /// Stable identifier of this method for policy lookups.
    #[must_use]
    pub fn member_id(&self) -> MemberId {
        MemberId {
            class: self.class.name.clone(),
            name: self.name.clone(),
            descriptor: Arc::from(self.descriptor.to_string().as_str()),
        }
    }

    /// Returns `true` if this references an instance initializer.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        &*self.name == "<init>"
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class, self.name, self.descriptor)
    }
}

/// The kind of member operation a method handle performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// `REF_getField`.
    GetField,
    /// `REF_getStatic`.
    GetStatic,
    /// `REF_putField`.
    PutField,
    /// `REF_putStatic`.
    PutStatic,
    /// `REF_invokeVirtual`.
    InvokeVirtual,
    /// `REF_invokeStatic`.
    InvokeStatic,
    /// `REF_invokeSpecial`.
    InvokeSpecial,
    /// `REF_newInvokeSpecial`.
    NewInvokeSpecial,
    /// `REF_invokeInterface`.
    InvokeInterface,
}

/// A resolved `CONSTANT_MethodHandle` entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodHandleRef {
    /// What the handle does when invoked.
    pub kind: HandleKind,
    /// The referenced method (field handles are modeled as accessor methods
    /// by the resolution boundary).
    pub method: MethodRef,
}

/// A static (bootstrap) argument of an `invokedynamic` call site.
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapArg {
    /// An integer constant.
    Int(i32),
    /// A long constant.
    Long(i64),
    /// A float constant (by bit pattern, so `NaN` compares equal to itself).
    Float(u32),
    /// A double constant (by bit pattern).
    Double(u64),
    /// A string constant.
    Str(Arc<str>),
    /// A class constant.
    Class(ClassRef),
    /// A method handle constant.
    Handle(MethodHandleRef),
    /// A method type constant.
    MethodType(MethodDescriptor),
}

/// A resolved `invokedynamic` call site.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSiteRef {
    /// The bootstrap method that links this call site.
    pub bootstrap: MethodHandleRef,
    /// Static arguments passed to the bootstrap method.
    pub static_args: Vec<BootstrapArg>,
    /// Name component of the call site's name-and-type.
    pub name: Arc<str>,
    /// The dynamic call descriptor: what the rewritten call pops and pushes.
    pub descriptor: MethodDescriptor,
}

impl CallSiteRef {
    /// Returns the implementation method handle if this call site is an
    /// auto-generated lambda factory (`LambdaMetafactory.metafactory` or
    /// `altMetafactory`).
    ///
    /// The implementation handle is the second static argument per the
    /// metafactory contract.
    #[must_use]
    pub fn lambda_impl_handle(&self) -> Option<&MethodHandleRef> {
        let bsm = &self.bootstrap.method;
        if &*bsm.class.name != "java/lang/invoke/LambdaMetafactory" {
            return None;
        }
        if &*bsm.name != "metafactory" && &*bsm.name != "altMetafactory" {
            return None;
        }
        match self.static_args.get(1) {
            Some(BootstrapArg::Handle(h)) => Some(h),
            _ => None,
        }
    }

    /// Returns `true` if the call site captures no dynamic arguments.
    #[must_use]
    pub fn is_non_capturing(&self) -> bool {
        self.descriptor.params.is_empty()
    }
}

/// One resolved constant pool entry.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEntry {
    /// `CONSTANT_Integer`.
    Int(i32),
    /// `CONSTANT_Long` (loadable only via `ldc2_w`).
    Long(i64),
    /// `CONSTANT_Float`.
    Float(f32),
    /// `CONSTANT_Double` (loadable only via `ldc2_w`).
    Double(f64),
    /// `CONSTANT_String`.
    Str(Arc<str>),
    /// `CONSTANT_Class`.
    Class(ClassRef),
    /// `CONSTANT_Fieldref`.
    Field(FieldRef),
    /// `CONSTANT_Methodref`.
    Method(MethodRef),
    /// `CONSTANT_InterfaceMethodref`.
    InterfaceMethod(MethodRef),
    /// `CONSTANT_MethodHandle`.
    MethodHandle(MethodHandleRef),
    /// `CONSTANT_MethodType`.
    MethodType(MethodDescriptor),
    /// `CONSTANT_InvokeDynamic`.
    InvokeDynamic(CallSiteRef),
}

/// The resolved constant pool of one method's declaring class.
///
/// Entry 0 is unused, matching class-file numbering; two-word constants do
/// not occupy a phantom second entry here because the indirection is already
/// resolved.
#[derive(Debug, Clone, Default)]
pub struct ConstPool {
    entries: Vec<Option<PoolEntry>>,
}

impl ConstPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        ConstPool {
            entries: vec![None],
        }
    }

    /// Appends an entry, returning its index.
    pub fn push(&mut self, entry: PoolEntry) -> u16 {
        let idx = self.entries.len();
        self.entries.push(Some(entry));
        u16::try_from(idx).expect("constant pool overflow")
    }

    /// Looks up an entry by index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lookup`] for index 0, out-of-range indices, and holes.
    pub fn entry(&self, index: u16) -> Result<&PoolEntry> {
        self.entries
            .get(index as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::Lookup(format!("constant pool index {index} is not populated")))
    }

    /// Resolves a class reference at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lookup`] if the entry is missing or not a class.
    pub fn class_at(&self, index: u16) -> Result<&ClassRef> {
        match self.entry(index)? {
            PoolEntry::Class(c) => Ok(c),
            other => Err(Error::Lookup(format!(
                "pool entry {index} is {other:?}, expected a class"
            ))),
        }
    }

    /// Resolves a field reference at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lookup`] if the entry is missing or not a field.
    pub fn field_at(&self, index: u16) -> Result<&FieldRef> {
        match self.entry(index)? {
            PoolEntry::Field(f) => Ok(f),
            other => Err(Error::Lookup(format!(
                "pool entry {index} is {other:?}, expected a field"
            ))),
        }
    }

    /// Resolves a (class or interface) method reference at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lookup`] if the entry is missing or not a method.
    pub fn method_at(&self, index: u16) -> Result<&MethodRef> {
        match self.entry(index)? {
            PoolEntry::Method(m) | PoolEntry::InterfaceMethod(m) => Ok(m),
            other => Err(Error::Lookup(format!(
                "pool entry {index} is {other:?}, expected a method"
            ))),
        }
    }

    /// Resolves an `invokedynamic` call site at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lookup`] if the entry is missing or not a call site.
    pub fn call_site_at(&self, index: u16) -> Result<&CallSiteRef> {
        match self.entry(index)? {
            PoolEntry::InvokeDynamic(cs) => Ok(cs),
            other => Err(Error::Lookup(format!(
                "pool entry {index} is {other:?}, expected an invokedynamic call site"
            ))),
        }
    }

    /// Number of populated entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Iterates over `(index, entry)` for all populated entries.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &PoolEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (i as u16, e)))
    }

    /// Returns `true` if the pool holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stable identifier of a field or method, used as the key for staging
/// annotation lookups and their read-through cache.
///
/// Keyed by declaring-type name plus signature rather than by object
/// identity, so lookups are reproducible across pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberId {
    /// Internal name of the declaring class.
    pub class: Arc<str>,
    /// Member name.
    pub name: Arc<str>,
    /// Field or method descriptor string.
    pub descriptor: Arc<str>,
}

impl MemberId {
    /// Creates a member identifier from its three components.
    pub fn new(
        class: impl Into<Arc<str>>,
        name: impl Into<Arc<str>>,
        descriptor: impl Into<Arc<str>>,
    ) -> Self {
        MemberId {
            class: class.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}:{}", self.class, self.name, self.descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(flags: FieldFlags) -> FieldRef {
        FieldRef {
            class: ClassRef::new("demo/Lang"),
            name: Arc::from("staged"),
            descriptor: JavaType::parse("I").unwrap(),
            flags,
        }
    }

    #[test]
    fn pool_rejects_index_zero_and_mismatches() {
        let mut pool = ConstPool::new();
        let idx = pool.push(PoolEntry::Int(7));
        assert!(pool.entry(0).is_err());
        assert!(pool.class_at(idx).is_err());
        assert!(matches!(pool.entry(idx).unwrap(), PoolEntry::Int(7)));
    }

    #[test]
    fn iter_visits_every_populated_entry() {
        let mut pool = ConstPool::new();
        pool.push(PoolEntry::Int(1));
        pool.push(PoolEntry::Field(field(FieldFlags::STATIC)));
        let indexed: Vec<u16> = pool.iter().map(|(i, _)| i).collect();
        assert_eq!(indexed, vec![1, 2]);
        assert!(pool
            .iter()
            .any(|(_, e)| matches!(e, PoolEntry::Field(_))));
    }

    #[test]
    fn static_final_detection() {
        assert!(field(FieldFlags::STATIC | FieldFlags::FINAL).is_static_final());
        assert!(!field(FieldFlags::STATIC).is_static_final());
    }

    #[test]
    fn lambda_site_recognition() {
        let handle = MethodHandleRef {
            kind: HandleKind::InvokeStatic,
            method: MethodRef {
                class: ClassRef::new("demo/Fns"),
                name: Arc::from("lambda$main$0"),
                descriptor: MethodDescriptor::parse("(I)I").unwrap(),
            },
        };
        let site = CallSiteRef {
            bootstrap: MethodHandleRef {
                kind: HandleKind::InvokeStatic,
                method: MethodRef {
                    class: ClassRef::new("java/lang/invoke/LambdaMetafactory"),
                    name: Arc::from("metafactory"),
                    descriptor: MethodDescriptor::parse("()V").unwrap(),
                },
            },
            static_args: vec![
                BootstrapArg::Int(0),
                BootstrapArg::Handle(handle.clone()),
            ],
            name: Arc::from("apply"),
            descriptor: MethodDescriptor::parse("()Ljava/util/function/IntUnaryOperator;")
                .unwrap(),
        };
        assert!(site.is_non_capturing());
        assert_eq!(site.lambda_impl_handle(), Some(&handle));
    }
}
