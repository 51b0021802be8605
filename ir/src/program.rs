use std::collections::HashSet;

use anyhow::{ensure, Result};
use derive_more::Display;
#[cfg(feature = "serialize")]
use serde::{Deserialize, Serialize};

use crate::cfg::Cfg;

/// Register index within a method frame.
pub type Reg = u16;

/// Interned class identity, an index into [`Program::classes`].
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[display("class@{_0}")]
pub struct ClassId(pub u32);

/// Interned method-definition identity, an index into [`Program::methods`].
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[display("def@{_0}")]
pub struct MethodId(pub u32);

/// Interned field reference, an index into [`Program::fields`].
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[display("field@{_0}")]
pub struct FieldId(pub u32);

/// Interned method reference (a call target, which need not be defined in
/// this program), an index into [`Program::method_refs`].
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
#[display("method@{_0}")]
pub struct MethodRefId(pub u32);

/// A class definition with its place in the hierarchy.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct Class {
    pub name: String,
    pub superclass: Option<ClassId>,
    pub methods: Vec<MethodId>,
}

/// A method definition. `code: None` means the method body is not available
/// (abstract, native); such methods are skipped by the analyses.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct Method {
    pub owner: ClassId,
    pub name: String,
    pub code: Option<Cfg>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct FieldRef {
    pub owner: ClassId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct MethodRef {
    pub owner: ClassId,
    pub name: String,
}

/// A loaded program: arenas of classes and method bodies plus the reference
/// tables instructions point into. All identities are arena indexes, which
/// gives every class, method, field and instruction a stable handle for the
/// lifetime of the program.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serialize", derive(Serialize, Deserialize))]
pub struct Program {
    pub classes: Vec<Class>,
    pub methods: Vec<Method>,
    pub fields: Vec<FieldRef>,
    pub method_refs: Vec<MethodRef>,
}

impl Program {
    #[must_use]
    pub fn class(&self, id: ClassId) -> &Class { &self.classes[id.0 as usize] }

    #[must_use]
    pub fn method(&self, id: MethodId) -> &Method { &self.methods[id.0 as usize] }

    #[must_use]
    pub fn field(&self, id: FieldId) -> &FieldRef { &self.fields[id.0 as usize] }

    #[must_use]
    pub fn method_ref(&self, id: MethodRefId) -> &MethodRef {
        &self.method_refs[id.0 as usize]
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn class_by_name(&self, name: &str) -> Option<ClassId> {
        self.classes
            .iter()
            .position(|c| c.name == name)
            .map(|i| ClassId(i as u32))
    }

    /// Resolves a `Owner::name` string to a method reference.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn resolve_method_ref(&self, target: &str) -> Option<MethodRefId> {
        let (owner, name) = target.split_once("::")?;
        let owner = self.class_by_name(owner)?;
        self.method_refs
            .iter()
            .position(|m| m.owner == owner && m.name == name)
            .map(|i| MethodRefId(i as u32))
    }

    /// True when `child` is `parent` or transitively extends it.
    #[must_use]
    pub fn is_descendant(&self, child: ClassId, parent: ClassId) -> bool {
        let mut cursor = Some(child);
        // Bounded walk; a malformed cyclic hierarchy must not hang us.
        for _ in 0..=self.classes.len() {
            match cursor {
                Some(c) if c == parent => return true,
                Some(c) => cursor = self.class(c).superclass,
                None => return false,
            }
        }
        false
    }

    /// Proper descendants of `root`, i.e. `root` itself is not included.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn descendants_of(&self, root: ClassId) -> HashSet<ClassId> {
        (0..self.classes.len() as u32)
            .map(ClassId)
            .filter(|&c| c != root && self.is_descendant(c, root))
            .collect()
    }

    /// True when the superclass chain starting at `class` reaches a root.
    fn chain_terminates(&self, class: ClassId) -> bool {
        let mut cursor = self.class(class).superclass;
        for _ in 0..self.classes.len() {
            match cursor {
                None => return true,
                Some(c) => cursor = self.class(c).superclass,
            }
        }
        false
    }

    /// Structural sanity of a freshly loaded program: all arena indexes in
    /// range, method/class cross-links consistent, superclass chains acyclic
    /// and CFG block/instruction references well formed.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformation found.
    pub fn validate(&self) -> Result<()> {
        let class_count = self.classes.len();
        for class in &self.classes {
            if let Some(sup) = class.superclass {
                ensure!(
                    (sup.0 as usize) < class_count,
                    "class {} has out-of-range superclass {sup}",
                    class.name
                );
            }
        }
        for (i, class) in self.classes.iter().enumerate() {
            ensure!(
                self.chain_terminates(ClassId(i as u32)),
                "superclass chain of {} is cyclic",
                class.name
            );
            for &m in &class.methods {
                ensure!(
                    (m.0 as usize) < self.methods.len(),
                    "class {} lists out-of-range method {m}",
                    class.name
                );
                ensure!(
                    self.method(m).owner.0 as usize == i,
                    "method {} is listed by a class that does not own it",
                    self.method(m).name
                );
            }
        }
        for field in &self.fields {
            ensure!(
                (field.owner.0 as usize) < class_count,
                "field {} has out-of-range owner",
                field.name
            );
        }
        for mref in &self.method_refs {
            ensure!(
                (mref.owner.0 as usize) < class_count,
                "method ref {} has out-of-range owner",
                mref.name
            );
        }
        for method in &self.methods {
            ensure!(
                (method.owner.0 as usize) < class_count,
                "method {} has out-of-range owner",
                method.name
            );
            if let Some(cfg) = &method.code {
                cfg.validate(self)
                    .map_err(|e| e.context(format!("in method {}", method.name)))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::test_utils::ProgramBuilder;

    fn hierarchy() -> (Program, ClassId, ClassId, ClassId, ClassId) {
        let mut b = ProgramBuilder::default();
        let root = b.class("Base", None);
        let mid = b.class("Mid", Some(root));
        let leaf = b.class("Leaf", Some(mid));
        let other = b.class("Other", None);
        (b.build(), root, mid, leaf, other)
    }

    #[test_case("Leaf", "Base" => true)]
    #[test_case("Mid", "Base" => true)]
    #[test_case("Mid", "Mid" => true)]
    #[test_case("Base", "Leaf" => false)]
    #[test_case("Other", "Base" => false)]
    fn descendant_queries(child: &str, parent: &str) -> bool {
        let (p, ..) = hierarchy();
        let child = p.class_by_name(child).unwrap();
        let parent = p.class_by_name(parent).unwrap();
        p.is_descendant(child, parent)
    }

    #[test]
    fn descendants_exclude_the_root_itself() {
        let (p, root, mid, leaf, _) = hierarchy();
        assert_eq!(p.descendants_of(root), [mid, leaf].into_iter().collect());
    }

    #[test]
    fn cyclic_hierarchy_is_rejected() {
        let mut b = ProgramBuilder::default();
        let a = b.class("A", None);
        let c = b.class("B", Some(a));
        let mut p = b.build_unchecked();
        p.classes[a.0 as usize].superclass = Some(c);
        assert!(p.validate().is_err());
        assert!(!p.is_descendant(a, ClassId(99)));
    }

    #[test]
    fn method_ref_resolution() {
        let mut b = ProgramBuilder::default();
        let owner = b.class("Util", None);
        let keep = b.method_ref(owner, "keep");
        b.method_ref(owner, "leak");
        let p = b.build();
        assert_eq!(p.resolve_method_ref("Util::keep"), Some(keep));
        assert_eq!(p.resolve_method_ref("Util::missing"), None);
        assert_eq!(p.resolve_method_ref("Nope::keep"), None);
        assert_eq!(p.resolve_method_ref("garbage"), None);
    }
}
