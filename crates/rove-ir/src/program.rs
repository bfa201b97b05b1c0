//! Class, method and field descriptors and the immutable program registry.

use crate::error::{MetadataError, MetadataResult};
use crate::insn::{FieldRef, Insn, MethodRef};
use crate::prelude;
use crate::types::{MethodSig, Type};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl ClassId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId {
    pub class: ClassId,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: Arc<str>,
    pub ty: Type,
    /// Declaring class.
    pub owner: ClassId,
    /// Index into the object's field vector (instance) or the class's static area.
    pub slot: usize,
    pub is_static: bool,
    pub is_final: bool,
}

/// Exception handler covering `[start, end)`; `class == None` catches everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handler {
    pub start: usize,
    pub end: usize,
    pub target: usize,
    pub class: Option<Arc<str>>,
}

impl Handler {
    pub fn covers(&self, pc: usize) -> bool {
        self.start <= pc && pc < self.end
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodFlags {
    pub is_static: bool,
    pub is_synchronized: bool,
    pub is_native: bool,
    pub is_abstract: bool,
}

#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub id: MethodId,
    pub owner: ClassId,
    pub class_name: Arc<str>,
    pub name: Arc<str>,
    pub sig: MethodSig,
    pub flags: MethodFlags,
    pub max_locals: usize,
    pub code: Arc<[Insn]>,
    pub handlers: Vec<Handler>,
}

impl MethodDescriptor {
    pub fn is_static(&self) -> bool {
        self.flags.is_static
    }

    pub fn is_native(&self) -> bool {
        self.flags.is_native
    }

    pub fn is_synchronized(&self) -> bool {
        self.flags.is_synchronized
    }

    /// `Class.name(desc)`, the key used for native peers and perturbation targets.
    pub fn full_name(&self) -> String {
        format!("{}.{}{}", self.class_name, self.name, self.sig)
    }

    pub fn is_class_initializer(&self) -> bool {
        &*self.name == "<clinit>"
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class_name, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    pub id: ClassId,
    pub name: Arc<str>,
    pub superclass: Option<ClassId>,
    /// Instance fields declared by this class.
    pub fields: Vec<FieldDescriptor>,
    /// All instance fields, inherited ones first; `slot` indexes this vector.
    pub instance_layout: Vec<FieldDescriptor>,
    pub static_fields: Vec<FieldDescriptor>,
    pub methods: Vec<MethodDescriptor>,
    /// Registered from the built-in prelude rather than user input.
    pub builtin: bool,
}

impl ClassDescriptor {
    pub fn declared_method(&self, name: &str, sig: &MethodSig) -> Option<&MethodDescriptor> {
        self.methods
            .iter()
            .find(|m| &*m.name == name && &m.sig == sig)
    }

    pub fn class_initializer(&self) -> Option<&MethodDescriptor> {
        self.methods
            .iter()
            .find(|m| m.is_class_initializer() && m.is_static())
    }
}

/// Immutable registry of all classes of one program.
///
/// Descriptors never change after [`ProgramBuilder::build`]; a `Program` is
/// shared by every state and thread of a run.
#[derive(Debug, Clone)]
pub struct Program {
    classes: Vec<Arc<ClassDescriptor>>,
    by_name: HashMap<Arc<str>, ClassId>,
    entry: Option<MethodId>,
}

impl Program {
    pub fn class(&self, id: ClassId) -> &ClassDescriptor {
        &self.classes[id.index()]
    }

    pub fn class_id(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    pub fn class_by_name(&self, name: &str) -> Option<&ClassDescriptor> {
        self.class_id(name).map(|id| self.class(id))
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.classes.iter().map(|c| c.as_ref())
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Classes that did not come from the prelude, in registration order.
    pub fn user_classes(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.classes().filter(|c| !c.builtin)
    }

    pub fn method(&self, id: MethodId) -> &MethodDescriptor {
        &self.classes[id.class.index()].methods[id.index as usize]
    }

    pub fn entry(&self) -> Option<MethodId> {
        self.entry
    }

    /// Iterate `class` and its superclasses, most derived first.
    pub fn superclass_chain(&self, class: ClassId) -> impl Iterator<Item = ClassId> + '_ {
        std::iter::successors(Some(class), move |c| self.class(*c).superclass)
    }

    pub fn is_subclass(&self, sub: ClassId, sup: ClassId) -> bool {
        self.superclass_chain(sub).any(|c| c == sup)
    }

    /// Find a method by name and signature starting at `class` and walking up
    /// the superclass chain. Used for virtual, special and static dispatch.
    pub fn find_method(&self, class: ClassId, name: &str, sig: &MethodSig) -> Option<MethodId> {
        self.superclass_chain(class)
            .find_map(|c| self.class(c).declared_method(name, sig).map(|m| m.id))
    }

    pub fn resolve_method(&self, r: &MethodRef) -> Option<MethodId> {
        let class = self.class_id(&r.class)?;
        self.find_method(class, &r.name, &r.sig)
    }

    /// Methods declared by `class` with the given name, any signature.
    pub fn methods_named(&self, class: ClassId, name: &str) -> Vec<MethodId> {
        self.class(class)
            .methods
            .iter()
            .filter(|m| &*m.name == name)
            .map(|m| m.id)
            .collect()
    }

    pub fn instance_field(&self, class: ClassId, name: &str) -> Option<&FieldDescriptor> {
        self.class(class)
            .instance_layout
            .iter()
            .rev()
            .find(|f| &*f.name == name)
    }

    /// Static fields are inherited: look in `class`, then its superclasses.
    pub fn static_field(&self, class: ClassId, name: &str) -> Option<&FieldDescriptor> {
        self.superclass_chain(class).find_map(|c| {
            self.class(c)
                .static_fields
                .iter()
                .find(|f| &*f.name == name)
        })
    }

    pub fn lookup_instance_field(&self, r: &FieldRef) -> Option<&FieldDescriptor> {
        self.instance_field(self.class_id(&r.class)?, &r.name)
    }

    pub fn lookup_static_field(&self, r: &FieldRef) -> Option<&FieldDescriptor> {
        self.static_field(self.class_id(&r.class)?, &r.name)
    }
}

/// Input description of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ty: Type,
    pub is_static: bool,
    pub is_final: bool,
}

impl FieldDef {
    pub fn new(name: &str, ty: Type) -> Self {
        Self {
            name: name.to_string(),
            ty,
            is_static: false,
            is_final: false,
        }
    }

    pub fn static_field(name: &str, ty: Type) -> Self {
        Self {
            is_static: true,
            ..Self::new(name, ty)
        }
    }

    pub fn final_field(mut self) -> Self {
        self.is_final = true;
        self
    }
}

/// Input description of one method.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    pub name: String,
    pub sig: MethodSig,
    pub flags: MethodFlags,
    /// Computed from the code when `None`.
    pub max_locals: Option<usize>,
    pub code: Vec<Insn>,
    pub handlers: Vec<Handler>,
}

impl MethodDef {
    pub fn new(name: &str, sig: MethodSig, code: Vec<Insn>) -> Self {
        Self {
            name: name.to_string(),
            sig,
            flags: MethodFlags::default(),
            max_locals: None,
            code,
            handlers: Vec::new(),
        }
    }

    pub fn native(name: &str, sig: MethodSig) -> Self {
        let mut m = Self::new(name, sig, Vec::new());
        m.flags.is_native = true;
        m
    }

    pub fn with_static(mut self) -> Self {
        self.flags.is_static = true;
        self
    }

    pub fn with_synchronized(mut self) -> Self {
        self.flags.is_synchronized = true;
        self
    }

    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handlers.push(handler);
        self
    }

    fn computed_max_locals(&self) -> usize {
        let params = self.sig.arg_slots(self.flags.is_static);
        self.code
            .iter()
            .filter_map(|insn| match insn {
                Insn::Load(k, i) | Insn::Store(k, i) => Some(*i as usize + k.width()),
                Insn::Inc(i, _) => Some(*i as usize + 1),
                _ => None,
            })
            .chain(std::iter::once(params))
            .max()
            .unwrap_or(params)
    }
}

/// Input description of one class.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    pub name: String,
    /// Defaults to `Object` for everything but `Object` itself.
    pub superclass: Option<String>,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodDef>,
}

impl ClassDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            superclass: None,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn extends(mut self, superclass: &str) -> Self {
        self.superclass = Some(superclass.to_string());
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }
}

/// Registers classes and produces an immutable [`Program`].
#[derive(Debug, Clone)]
pub struct ProgramBuilder {
    classes: Vec<(ClassDef, bool)>,
    entry: Option<String>,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    /// A builder pre-populated with the built-in prelude classes.
    pub fn new() -> Self {
        Self {
            classes: prelude::classes().into_iter().map(|c| (c, true)).collect(),
            entry: None,
        }
    }

    pub fn add_class(&mut self, class: ClassDef) -> &mut Self {
        self.classes.push((class, false));
        self
    }

    /// Entry point as `Class.method`. Defaults to the first user class with a
    /// static `main()V`.
    pub fn entry(&mut self, name: &str) -> &mut Self {
        self.entry = Some(name.to_string());
        self
    }

    pub fn build(&self) -> MetadataResult<Program> {
        let mut by_name: HashMap<Arc<str>, ClassId> = HashMap::new();
        for (i, (def, _)) in self.classes.iter().enumerate() {
            let name: Arc<str> = Arc::from(def.name.as_str());
            if by_name.insert(name, ClassId(i as u32)).is_some() {
                return Err(MetadataError::DuplicateClass {
                    name: def.name.clone(),
                });
            }
        }

        let mut supers = Vec::with_capacity(self.classes.len());
        for (def, _) in &self.classes {
            let sup = match (&def.superclass, def.name.as_str()) {
                (None, prelude::OBJECT) => None,
                (None, _) => Some(prelude::OBJECT),
                (Some(s), _) => Some(s.as_str()),
            };
            let sup = match sup {
                None => None,
                Some(s) => Some(*by_name.get(s).ok_or_else(|| {
                    MetadataError::UnknownSuperclass {
                        class: def.name.clone(),
                        superclass: s.to_string(),
                    }
                })?),
            };
            supers.push(sup);
        }

        let order = layout_order(&self.classes, &supers)?;
        let mut layouts: Vec<Vec<FieldDescriptor>> = vec![Vec::new(); self.classes.len()];
        let mut classes: Vec<Option<ClassDescriptor>> = vec![None; self.classes.len()];

        for idx in order {
            let (def, builtin) = &self.classes[idx];
            let id = ClassId(idx as u32);
            let name: Arc<str> = Arc::from(def.name.as_str());

            let mut layout = supers[idx]
                .map(|s| layouts[s.index()].clone())
                .unwrap_or_default();
            let mut fields = Vec::new();
            let mut static_fields = Vec::new();
            for f in &def.fields {
                let dup = fields
                    .iter()
                    .chain(static_fields.iter())
                    .any(|d: &FieldDescriptor| *d.name == *f.name);
                if dup {
                    return Err(MetadataError::DuplicateMember {
                        class: def.name.clone(),
                        member: f.name.clone(),
                    });
                }
                let desc = FieldDescriptor {
                    name: Arc::from(f.name.as_str()),
                    ty: f.ty.clone(),
                    owner: id,
                    slot: if f.is_static {
                        static_fields.len()
                    } else {
                        layout.len()
                    },
                    is_static: f.is_static,
                    is_final: f.is_final,
                };
                if f.is_static {
                    static_fields.push(desc);
                } else {
                    layout.push(desc.clone());
                    fields.push(desc);
                }
            }

            let mut methods: Vec<MethodDescriptor> = Vec::with_capacity(def.methods.len());
            for (mi, m) in def.methods.iter().enumerate() {
                if methods
                    .iter()
                    .any(|d| *d.name == *m.name && d.sig == m.sig)
                {
                    return Err(MetadataError::DuplicateMember {
                        class: def.name.clone(),
                        member: format!("{}{}", m.name, m.sig),
                    });
                }
                methods.push(MethodDescriptor {
                    id: MethodId {
                        class: id,
                        index: mi as u32,
                    },
                    owner: id,
                    class_name: name.clone(),
                    name: Arc::from(m.name.as_str()),
                    sig: m.sig.clone(),
                    flags: m.flags,
                    max_locals: m.max_locals.unwrap_or_else(|| m.computed_max_locals()),
                    code: Arc::from(m.code.clone()),
                    handlers: m.handlers.clone(),
                });
            }

            layouts[idx] = layout.clone();
            classes[idx] = Some(ClassDescriptor {
                id,
                name,
                superclass: supers[idx],
                fields,
                instance_layout: layout,
                static_fields,
                methods,
                builtin: *builtin,
            });
        }

        let classes: Vec<Arc<ClassDescriptor>> = classes
            .into_iter()
            .flatten()
            .map(Arc::new)
            .collect();

        let mut program = Program {
            classes,
            by_name,
            entry: None,
        };
        program.entry = self.resolve_entry(&program)?;
        debug!(
            classes = program.num_classes(),
            entry = ?program.entry.map(|e| program.method(e).to_string()),
            "program registered"
        );
        Ok(program)
    }

    fn resolve_entry(&self, program: &Program) -> MetadataResult<Option<MethodId>> {
        let main_sig = MethodSig::new(Vec::new(), Type::Void);
        let Some(name) = &self.entry else {
            return Ok(program.user_classes().find_map(|c| {
                c.declared_method("main", &main_sig)
                    .filter(|m| m.is_static())
                    .map(|m| m.id)
            }));
        };
        let missing = || MetadataError::MissingEntry { name: name.clone() };
        let (class, method) = name.rsplit_once('.').ok_or_else(missing)?;
        let class = program.class_by_name(class).ok_or_else(missing)?;
        let candidates = program.methods_named(class.id, method);
        let id = *candidates.first().ok_or_else(missing)?;
        let m = program.method(id);
        if !m.is_static() || m.sig.param_slots() != 0 || candidates.len() != 1 {
            return Err(MetadataError::InvalidEntry { name: name.clone() });
        }
        Ok(Some(id))
    }
}

/// Order classes so every superclass precedes its subclasses.
fn layout_order(
    classes: &[(ClassDef, bool)],
    supers: &[Option<ClassId>],
) -> MetadataResult<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        None,
        Visiting,
        Done,
    }
    let mut marks = vec![Mark::None; classes.len()];
    let mut order = Vec::with_capacity(classes.len());
    for start in 0..classes.len() {
        let mut path = Vec::new();
        let mut cur = Some(start);
        while let Some(c) = cur {
            match marks[c] {
                Mark::Done => break,
                Mark::Visiting => {
                    return Err(MetadataError::InheritanceCycle {
                        class: classes[c].0.name.clone(),
                    })
                }
                Mark::None => {
                    marks[c] = Mark::Visiting;
                    path.push(c);
                    cur = supers[c].map(ClassId::index);
                }
            }
        }
        for c in path.into_iter().rev() {
            marks[c] = Mark::Done;
            order.push(c);
        }
    }
    Ok(order)
}
