//! External call surfaces of the weave phase.
//!
//! Two collaborators live behind this module. [`RuntimeSurface`] describes
//! the fixed foreign functions the rewritten bytecode invokes: lift a
//! concrete value into a carrier, materialize a carrier back, wrap a known
//! constant, record a path-trace step, and consult the trace cache. One
//! overload exists per primitive word kind plus one for references; their
//! signatures are fixed per runtime class and never inspected further.
//!
//! [`SiteEmitter`] is the code-emission service: given the description of a
//! staged site it produces the generated entry point the rewrite calls into.
//! The core treats the returned symbol as opaque, but its signature must
//! match the requested one exactly, since the surrounding stack bookkeeping
//! is derived from the request.

use std::sync::Arc;

use crate::{
    bytecode::{BaseType, ClassRef, JavaType, MemberId, MethodDescriptor, MethodRef},
    stage::Language,
    Error, Result,
};

/// Word kind used to pick a runtime overload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl CallKind {
    fn of(ty: &JavaType) -> CallKind {
        match ty {
            JavaType::Base(BaseType::Long) => CallKind::Long,
            JavaType::Base(BaseType::Float) => CallKind::Float,
            JavaType::Base(BaseType::Double) => CallKind::Double,
            JavaType::Base(_) => CallKind::Int,
            _ => CallKind::Reference,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            CallKind::Int => "Int",
            CallKind::Long => "Long",
            CallKind::Float => "Float",
            CallKind::Double => "Double",
            CallKind::Reference => "Reference",
        }
    }

    fn descriptor(self) -> &'static str {
        match self {
            CallKind::Int => "I",
            CallKind::Long => "J",
            CallKind::Float => "F",
            CallKind::Double => "D",
            CallKind::Reference => "Ljava/lang/Object;",
        }
    }
}

/// The fixed runtime call surface the rewritten bytecode targets.
#[derive(Debug, Clone)]
pub struct RuntimeSurface {
    class: ClassRef,
    carrier: ClassRef,
}

impl RuntimeSurface {
    /// Builds the surface over a runtime class and its carrier type.
    pub fn new(runtime_class: impl Into<Arc<str>>, carrier_class: impl Into<Arc<str>>) -> Self {
        RuntimeSurface {
            class: ClassRef::new(runtime_class),
            carrier: ClassRef::new(carrier_class),
        }
    }

    /// The carrier class the lazy representation uses.
    #[must_use]
    pub fn carrier_class(&self) -> &ClassRef {
        &self.carrier
    }

    /// The carrier type as a descriptor type.
    #[must_use]
    pub fn carrier_type(&self) -> JavaType {
        JavaType::Object(self.carrier.name.clone())
    }

    fn carrier_descriptor(&self) -> String {
        format!("L{};", self.carrier.name)
    }

    fn method(&self, name: String, descriptor: &str) -> MethodRef {
        MethodRef {
            class: self.class.clone(),
            name: name.into(),
            descriptor: MethodDescriptor::parse(descriptor).expect("fixed runtime signature"),
        }
    }

    /// Wraps a concrete value of `ty` into a carrier.
    #[must_use]
    pub fn lift(&self, ty: &JavaType) -> MethodRef {
        let kind = CallKind::of(ty);
        self.method(
            format!("lift{}", kind.suffix()),
            &format!("({}){}", kind.descriptor(), self.carrier_descriptor()),
        )
    }

    /// Forces a carrier back into a concrete value of `ty`.
    #[must_use]
    pub fn materialize(&self, ty: &JavaType) -> MethodRef {
        let kind = CallKind::of(ty);
        self.method(
            format!("materialize{}", kind.suffix()),
            &format!("({}){}", self.carrier_descriptor(), kind.descriptor()),
        )
    }

    /// Wraps a provably-constant value of `ty` into a constant carrier.
    #[must_use]
    pub fn make_constant(&self, ty: &JavaType) -> MethodRef {
        let kind = CallKind::of(ty);
        self.method(
            format!("constant{}", kind.suffix()),
            &format!("({}){}", kind.descriptor(), self.carrier_descriptor()),
        )
    }

    /// Records one path-trace step, keyed by the merge-point id.
    #[must_use]
    pub fn trace_record(&self) -> MethodRef {
        self.method("traceRecord".into(), "(I)V")
    }

    /// Resets the path trace on method entry, bounding it to the given
    /// depth.
    #[must_use]
    pub fn trace_enter(&self) -> MethodRef {
        self.method("traceEnter".into(), "(I)V")
    }

    /// Consults the bounded trace cache for a site: returns the cached
    /// closure for the current path, storing the fresh one when absent.
    #[must_use]
    pub fn cached_closure(&self) -> MethodRef {
        let c = self.carrier_descriptor();
        self.method("cachedClosure".into(), &format!("({c}I){c}"))
    }
}

impl Default for RuntimeSurface {
    fn default() -> Self {
        RuntimeSurface::new("byteloom/rt/Stage", "byteloom/rt/Carrier")
    }
}

/// Description of one staged site handed to the code-emission service.
#[derive(Debug, Clone)]
pub struct StagedSiteDesc {
    /// The staged member.
    pub member: MemberId,
    /// Staging language of the site.
    pub language: Language,
    /// Whether the site evaluates immediately.
    pub strict: bool,
    /// Opaque static-info elements from the annotation.
    pub static_info: Vec<Arc<str>>,
    /// Required signature of the generated entry point: carrier-typed
    /// parameters where the argument position accepts the site's language,
    /// declared types elsewhere; carrier return when the site produces a
    /// value.
    pub descriptor: MethodDescriptor,
}

/// The code-emission service invoked once per staged site.
pub trait SiteEmitter {
    /// Produces the generated static entry point for `site`. The returned
    /// symbol must carry exactly the requested descriptor.
    ///
    /// # Errors
    ///
    /// An emitter may refuse a site; the method is then left unwoven.
    fn emit_invoke_site(&mut self, site: &StagedSiteDesc) -> Result<MethodRef>;
}

/// An emitter for setups without a code-emission service. Any staged site
/// fails its method's weave, leaving the method unchanged.
pub struct NullEmitter;

impl SiteEmitter for NullEmitter {
    fn emit_invoke_site(&mut self, site: &StagedSiteDesc) -> Result<MethodRef> {
        Err(Error::Lookup(format!(
            "no code-emission service configured for staged site {}",
            site.member
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overloads_follow_the_word_kind() {
        let rt = RuntimeSurface::new("rt/Stage", "rt/Carrier");
        let lift = rt.lift(&JavaType::parse("S").unwrap());
        assert_eq!(&*lift.name, "liftInt");
        assert_eq!(lift.descriptor.to_string(), "(I)Lrt/Carrier;");

        let materialize = rt.materialize(&JavaType::parse("J").unwrap());
        assert_eq!(&*materialize.name, "materializeLong");
        assert_eq!(materialize.descriptor.to_string(), "(Lrt/Carrier;)J");

        let reference = rt.lift(&JavaType::parse("Ljava/lang/String;").unwrap());
        assert_eq!(&*reference.name, "liftReference");
        assert_eq!(
            reference.descriptor.to_string(),
            "(Ljava/lang/Object;)Lrt/Carrier;"
        );
    }

    #[test]
    fn cache_calls_are_fixed() {
        let rt = RuntimeSurface::new("rt/Stage", "rt/Carrier");
        assert_eq!(rt.trace_record().descriptor.to_string(), "(I)V");
        assert_eq!(
            rt.cached_closure().descriptor.to_string(),
            "(Lrt/Carrier;I)Lrt/Carrier;"
        );
    }
}
