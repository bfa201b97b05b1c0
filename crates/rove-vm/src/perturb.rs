//! Argument perturbation.
//!
//! Calls to selected methods get their primitive arguments replaced by each
//! tuple of a small set of representative values. The tuples are the
//! cartesian product of one value vector per primitive parameter, computed
//! once per method and run from a seeded generator.

use crate::error::{VmError, VmResult};
use crate::value::Value;
use ahash::AHashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rove_ir::{MethodDescriptor, MethodId, MethodSig, Program, Type};
use std::sync::Arc;
use tracing::{debug, warn};

/// Perturbation of one method.
#[derive(Debug, Clone, PartialEq)]
pub struct Perturbation {
    /// Generator id, `perturb(Class.name(desc))`.
    pub id: Arc<str>,
    /// Positions of the perturbed parameters within the argument slots.
    pub offsets: Vec<usize>,
    pub valuations: Arc<Vec<Vec<Value>>>,
}

impl Perturbation {
    fn new(method: &MethodDescriptor, rng: &mut StdRng) -> Option<Self> {
        let mut offsets = Vec::new();
        let mut vectors = Vec::new();
        let mut slot = usize::from(!method.is_static());
        for ty in &method.sig.params {
            if let Some(values) = representative_values(ty, rng) {
                offsets.push(slot);
                vectors.push(values);
            }
            slot += ty.slot_width();
        }
        if vectors.is_empty() {
            return None;
        }
        Some(Self {
            id: Arc::from(format!("perturb({})", method.full_name())),
            offsets,
            valuations: Arc::new(cartesian_product(&vectors)),
        })
    }

    /// Overwrite the perturbed parameters in the argument slots of a call.
    pub fn apply(&self, slots: &mut [Value], valuation: &[Value]) {
        for (&offset, &v) in self.offsets.iter().zip(valuation) {
            slots[offset] = v;
            if v.is_wide() {
                slots[offset + 1] = Value::Top;
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Perturbator {
    targets: AHashMap<MethodId, Perturbation>,
}

impl Perturbator {
    /// Resolve every `Class.method` or `Class.method(desc)` in `specs`.
    pub fn new(program: &Program, specs: &[String], seed: u64) -> VmResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut targets = AHashMap::new();
        for spec in specs {
            for id in resolve_targets(program, spec)? {
                if targets.contains_key(&id) {
                    continue;
                }
                let method = program.method(id);
                match Perturbation::new(method, &mut rng) {
                    Some(p) => {
                        debug!(method = %method.full_name(), tuples = p.valuations.len(), "perturbing");
                        targets.insert(id, p);
                    }
                    None => warn!(method = %method.full_name(), "no primitive parameters to perturb"),
                }
            }
        }
        Ok(Self { targets })
    }

    pub fn get(&self, method: MethodId) -> Option<&Perturbation> {
        self.targets.get(&method)
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }
}

pub(crate) fn resolve_targets(program: &Program, spec: &str) -> VmResult<Vec<MethodId>> {
    let unknown = || VmError::UnknownPerturbTarget {
        spec: spec.to_string(),
    };
    let (path, desc) = match spec.find('(') {
        Some(i) => (&spec[..i], Some(&spec[i..])),
        None => (spec, None),
    };
    let (class, name) = path.rsplit_once('.').ok_or_else(unknown)?;
    let class = program.class_id(class).ok_or_else(unknown)?;
    let sig = desc.map(MethodSig::parse).transpose()?;
    let ids: Vec<MethodId> = program
        .methods_named(class, name)
        .into_iter()
        .filter(|&id| sig.as_ref().map_or(true, |s| program.method(id).sig == *s))
        .collect();
    if ids.is_empty() {
        return Err(unknown());
    }
    Ok(ids)
}

fn representative_values(ty: &Type, rng: &mut StdRng) -> Option<Vec<Value>> {
    let values = match ty {
        Type::Int | Type::Short => {
            let pos = (rng.gen::<i32>() % 100).abs();
            let neg = (rng.gen::<i32>() % 100).abs();
            vec![Value::Int(pos), Value::Int(0), Value::Int(-neg)]
        }
        Type::Long => {
            let pos = (rng.gen::<i64>() % 100).abs();
            let neg = (rng.gen::<i64>() % 100).abs();
            vec![Value::Long(pos), Value::Long(0), Value::Long(-neg)]
        }
        Type::Byte => {
            let hi = (rng.gen::<i32>() % 128).abs();
            let lo = (rng.gen::<i32>() % 127).abs();
            vec![Value::Int(hi), Value::Int(0), Value::Int(-lo)]
        }
        Type::Char => {
            let a = rng.gen::<u32>() % 255;
            let b = rng.gen::<u32>() % 255;
            vec![Value::Int(a as i32), Value::Int(0), Value::Int(b as i32)]
        }
        Type::Boolean => vec![Value::bool(false), Value::bool(true)],
        Type::Float => {
            let pos = rng.gen::<f32>();
            let neg = rng.gen::<f32>();
            vec![Value::float(pos), Value::float(0.0), Value::float(-neg)]
        }
        Type::Double => vec![
            Value::double(-1.414),
            Value::double(0.0),
            Value::double(3.141),
        ],
        Type::Ref(_) | Type::Array(_) | Type::Void => return None,
    };
    Some(values)
}

/// All tuples taking one value from each vector, last vector varying fastest.
fn cartesian_product(vectors: &[Vec<Value>]) -> Vec<Vec<Value>> {
    let mut tuples: Vec<Vec<Value>> = vec![Vec::new()];
    for values in vectors {
        tuples = tuples
            .into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |&v| {
                    let mut tuple = prefix.clone();
                    tuple.push(v);
                    tuple
                })
            })
            .collect();
    }
    tuples
}

#[cfg(test)]
mod tests {
    use super::*;
    use rove_ir::{ClassDef, Insn, MethodDef, ProgramBuilder};

    #[test]
    fn test_positive_and_negative_values_are_drawn_separately() {
        let asymmetric = (0..32u64).any(|seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let values = representative_values(&Type::Int, &mut rng).unwrap();
            values[2] != Value::Int(-values[0].as_int().unwrap_or_default())
        });
        assert!(asymmetric);
    }

    fn program() -> Program {
        let mut b = ProgramBuilder::new();
        b.add_class(
            ClassDef::new("Calc")
                .method(
                    MethodDef::new(
                        "scale",
                        MethodSig::parse("(I)V").unwrap(),
                        vec![Insn::Return(None)],
                    )
                    .with_static(),
                )
                .method(MethodDef::new(
                    "mix",
                    MethodSig::parse("(LCalc;JZ)V").unwrap(),
                    vec![Insn::Return(None)],
                ))
                .method(MethodDef::new(
                    "name",
                    MethodSig::parse("(LCalc;)V").unwrap(),
                    vec![Insn::Return(None)],
                )),
        );
        b.build().unwrap()
    }

    #[test]
    fn test_single_int_parameter() {
        let p = program();
        let perturbator = Perturbator::new(&p, &["Calc.scale".to_string()], 5).unwrap();
        let calc = p.class_id("Calc").unwrap();
        let target = perturbator.get(p.methods_named(calc, "scale")[0]).unwrap();
        assert_eq!(&*target.id, "perturb(Calc.scale(I)V)");
        assert_eq!(target.offsets, vec![0]);
        assert_eq!(target.valuations.len(), 3);
        assert_eq!(target.valuations[1], vec![Value::Int(0)]);
        let (Value::Int(pos), Value::Int(neg)) = (target.valuations[0][0], target.valuations[2][0])
        else {
            panic!("expected ints");
        };
        assert!((0..100).contains(&pos));
        assert!((-99..=0).contains(&neg));
    }

    #[test]
    fn test_product_skips_references() {
        let p = program();
        let perturbator =
            Perturbator::new(&p, &["Calc.mix(LCalc;JZ)V".to_string()], 5).unwrap();
        let calc = p.class_id("Calc").unwrap();
        let target = perturbator.get(p.methods_named(calc, "mix")[0]).unwrap();
        // receiver, then the reference, then the long (two slots), then the boolean
        assert_eq!(target.offsets, vec![2, 4]);
        assert_eq!(target.valuations.len(), 6);
        assert_eq!(target.valuations[0][1], Value::bool(false));
        assert_eq!(target.valuations[1][1], Value::bool(true));
        assert_eq!(target.valuations[2][0], Value::Long(0));

        let mut slots = vec![
            Value::Null,
            Value::Null,
            Value::Long(7),
            Value::Top,
            Value::Int(0),
        ];
        target.apply(&mut slots, &target.valuations[3]);
        assert_eq!(slots[2], Value::Long(0));
        assert_eq!(slots[3], Value::Top);
        assert_eq!(slots[4], Value::bool(true));
    }

    #[test]
    fn test_same_seed_same_values() {
        let p = program();
        let specs = vec!["Calc.scale".to_string(), "Calc.mix".to_string()];
        let a = Perturbator::new(&p, &specs, 11).unwrap();
        let b = Perturbator::new(&p, &specs, 11).unwrap();
        let calc = p.class_id("Calc").unwrap();
        let mix = p.methods_named(calc, "mix")[0];
        assert_eq!(a.get(mix), b.get(mix));
    }

    #[test]
    fn test_unknown_and_reference_only_targets() {
        let p = program();
        assert!(matches!(
            Perturbator::new(&p, &["Calc.missing".to_string()], 5),
            Err(VmError::UnknownPerturbTarget { .. })
        ));
        assert!(matches!(
            Perturbator::new(&p, &["Nope.scale".to_string()], 5),
            Err(VmError::UnknownPerturbTarget { .. })
        ));
        let none = Perturbator::new(&p, &["Calc.name".to_string()], 5).unwrap();
        assert!(none.is_empty());
    }
}
