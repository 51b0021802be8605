//! The program-wide index of tracked-object creations.

use std::collections::BTreeMap;
use std::fmt::Write;

use dexopt_ir::cfg::InsnId;
use dexopt_ir::program::{ClassId, MethodId, Program};
use itertools::Itertools;

use crate::tracked::{MergedUses, ObjectUses};
use crate::uses::Uses;

/// Construction records for one tracked type:
/// defining class → method → construction instruction → records.
#[derive(Debug, Default)]
pub struct TypeInits {
    pub sites: BTreeMap<ClassId, BTreeMap<MethodId, BTreeMap<InsnId, Vec<ObjectUses>>>>,
    pub count: usize,
}

/// Four-level init index plus the promoted merged values per method.
///
/// Each method's analysis fills a private index which the work queue then
/// reduces with [`InitIndex::absorb`]; two methods never produce the same
/// slot, so the reduction is associative and order-independent.
#[derive(Debug, Default)]
pub struct InitIndex {
    inits: BTreeMap<ClassId, TypeInits>,
    merged: BTreeMap<MethodId, Vec<MergedUses>>,
}

impl InitIndex {
    /// Stores a finalized construction record under the constructed type
    /// and the (class, method, instruction) site it came from.
    pub fn update_object(&mut self, class: ClassId, method: MethodId, object: ObjectUses) {
        let by_type = self.inits.entry(object.class).or_default();
        by_type.count += 1;
        by_type
            .sites
            .entry(class)
            .or_default()
            .entry(method)
            .or_default()
            .entry(object.insn)
            .or_default()
            .push(object);
    }

    pub fn update_merged(&mut self, method: MethodId, merged: MergedUses) {
        self.merged.entry(method).or_default().push(merged);
    }

    /// Folds another index into this one.
    #[must_use]
    pub fn absorb(mut self, other: InitIndex) -> InitIndex {
        for (ty, theirs) in other.inits {
            let ours = self.inits.entry(ty).or_default();
            ours.count += theirs.count;
            for (class, methods) in theirs.sites {
                let by_class = ours.sites.entry(class).or_default();
                for (method, insns) in methods {
                    let by_method = by_class.entry(method).or_default();
                    for (insn, mut records) in insns {
                        by_method.entry(insn).or_default().append(&mut records);
                    }
                }
            }
        }
        for (method, mut records) in other.merged {
            self.merged.entry(method).or_default().append(&mut records);
        }
        self
    }

    #[must_use]
    pub fn type_to_inits(&self) -> &BTreeMap<ClassId, TypeInits> {
        &self.inits
    }

    #[must_use]
    pub fn merged_uses(&self) -> &BTreeMap<MethodId, Vec<MergedUses>> {
        &self.merged
    }

    /// Every record observed for instances of `ty` inside `method`: the
    /// per-site object records plus the merged values involving `ty`.
    #[must_use]
    pub fn all_uses_from(
        &self,
        ty: ClassId,
        method: MethodId,
    ) -> (Vec<&ObjectUses>, Vec<&MergedUses>) {
        let objects = self.inits.get(&ty).map_or_else(Vec::new, |inits| {
            inits
                .sites
                .values()
                .filter_map(|methods| methods.get(&method))
                .flat_map(|insns| insns.values().flatten())
                .collect()
        });
        let merged = self.merged.get(&method).map_or_else(Vec::new, |records| {
            records.iter().filter(|m| m.classes.contains(&ty)).collect()
        });
        (objects, merged)
    }

    /// Total number of construction records for `ty`.
    #[must_use]
    pub fn count_for(&self, ty: ClassId) -> usize {
        self.inits.get(&ty).map_or(0, |inits| inits.count)
    }

    /// Human-readable dump of the whole table.
    ///
    /// # Panics
    ///
    /// Panics when formatting into the output string fails, which it cannot.
    #[must_use]
    pub fn debug_show_table(&self, program: &Program) -> String {
        let mut out = String::new();
        for (ty, inits) in &self.inits {
            writeln!(
                out,
                "== {} instance(s) of {}",
                inits.count,
                program.class(*ty).name
            )
            .unwrap();
            for (class, methods) in &inits.sites {
                for (method, insns) in methods {
                    for (insn, records) in insns {
                        for object in records {
                            writeln!(
                                out,
                                "  {}::{} {insn}: created {:?}, {}",
                                program.class(*class).name,
                                program.method(*method).name,
                                object.created,
                                describe(&object.uses, program),
                            )
                            .unwrap();
                        }
                    }
                }
            }
        }
        for (method, records) in &self.merged {
            for merged in records {
                writeln!(
                    out,
                    "== merged {{{}}} in {}::{}{}: created {:?}, {}",
                    merged.insns.iter().join(", "),
                    program.class(program.method(*method).owner).name,
                    program.method(*method).name,
                    if merged.nullable { " (nullable)" } else { "" },
                    merged.created,
                    describe(&merged.uses, program),
                )
                .unwrap();
            }
        }
        out
    }
}

fn describe(uses: &Uses, program: &Program) -> String {
    let fields_set = uses
        .fields_set
        .keys()
        .map(|f| program.field(*f).name.as_str())
        .join(" ");
    let fields_read = uses
        .fields_read
        .keys()
        .map(|f| program.field(*f).name.as_str())
        .join(" ");
    let calls = uses
        .method_calls
        .keys()
        .map(|m| program.method_ref(*m).name.as_str())
        .join(" ");
    format!(
        "sets [{fields_set}], reads [{fields_read}], calls [{calls}], {} escape(s), {} safe",
        uses.escapes.insns().len(),
        uses.safe_escapes.insns().len(),
    )
}
