//! Exception injection.
//!
//! An injection names an exception and a site:
//!
//! ```text
//! Exc@Class.method[(desc)]            calls of the method throw Exc
//! Exc("detail")@Class.method:pc       the instruction at pc throws Exc
//! ```
//!
//! The exception is thrown in the running thread in place of the call or
//! instruction, so the program's handlers see it like any other.

use crate::error::{VmError, VmResult};
use crate::perturb::resolve_targets;
use ahash::AHashMap;
use rove_ir::prelude::THROWABLE;
use rove_ir::{MethodId, Program};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    pub exception: Arc<str>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Injector {
    at_pc: AHashMap<(MethodId, usize), Injection>,
    on_call: AHashMap<MethodId, Injection>,
}

impl Injector {
    pub fn new(program: &Program, specs: &[String]) -> VmResult<Self> {
        let mut injector = Self::default();
        for spec in specs {
            injector.add(program, spec)?;
        }
        Ok(injector)
    }

    fn add(&mut self, program: &Program, spec: &str) -> VmResult<()> {
        let invalid = |reason: &str| VmError::InvalidInjection {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };
        let (exception, site) = spec
            .rsplit_once('@')
            .ok_or_else(|| invalid("expected 'Exception@Class.method'"))?;
        let injection = parse_exception(exception.trim()).ok_or_else(|| invalid("bad exception"))?;
        let class = program
            .class_id(&injection.exception)
            .ok_or_else(|| invalid("unknown exception class"))?;
        let throwable = program
            .class_id(THROWABLE)
            .ok_or_else(|| invalid("no Throwable class"))?;
        if !program.is_subclass(class, throwable) {
            return Err(invalid("not a Throwable"));
        }

        let site = site.trim();
        // the pc follows the descriptor, which never contains ':'
        let (target, pc) = match site.rsplit_once(':') {
            Some((target, pc)) => {
                let pc: usize = pc.trim().parse().map_err(|_| invalid("bad pc"))?;
                (target.trim(), Some(pc))
            }
            None => (site, None),
        };
        let methods = resolve_targets(program, target).map_err(|e| match e {
            VmError::UnknownPerturbTarget { .. } => VmError::UnknownInjectTarget {
                spec: spec.to_string(),
            },
            other => other,
        })?;
        for id in methods {
            let method = program.method(id);
            match pc {
                Some(pc) => {
                    if pc >= method.code.len() {
                        return Err(invalid("pc past the end of the code"));
                    }
                    debug!(method = %method, pc, exception = %injection.exception, "injecting");
                    self.at_pc.insert((id, pc), injection.clone());
                }
                None => {
                    debug!(method = %method, exception = %injection.exception, "injecting on call");
                    self.on_call.insert(id, injection.clone());
                }
            }
        }
        Ok(())
    }

    /// Exception thrown in place of the instruction at `pc` of `method`.
    pub fn at(&self, method: MethodId, pc: usize) -> Option<&Injection> {
        if self.at_pc.is_empty() {
            return None;
        }
        self.at_pc.get(&(method, pc))
    }

    /// Exception thrown in place of a call of `method`.
    pub fn on_call(&self, method: MethodId) -> Option<&Injection> {
        if self.on_call.is_empty() {
            return None;
        }
        self.on_call.get(&method)
    }

    pub fn len(&self) -> usize {
        self.at_pc.len() + self.on_call.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `Exc`, `Exc()` or `Exc("detail")`.
fn parse_exception(text: &str) -> Option<Injection> {
    let (class, detail) = match text.split_once('(') {
        Some((class, rest)) => {
            let inner = rest.strip_suffix(')')?.trim();
            let inner = inner
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(inner);
            (class.trim(), (!inner.is_empty()).then(|| inner.to_string()))
        }
        None => (text, None),
    };
    if class.is_empty() {
        return None;
    }
    Some(Injection {
        exception: Arc::from(class),
        detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> Program {
        rove_asm::parse(
            r#"
class Store
  static method put(II)V
    return
  end
  static method get()I
    iconst 0
    ireturn
  end
end
entry Store.get
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_exception() {
        assert_eq!(
            parse_exception(r#"Error("disk full")"#),
            Some(Injection {
                exception: Arc::from("Error"),
                detail: Some("disk full".into())
            })
        );
        assert_eq!(parse_exception("Error()").unwrap().detail, None);
        assert_eq!(parse_exception("Error").unwrap().detail, None);
        assert_eq!(parse_exception("Error(oops").map(|i| i.exception), None);
        assert_eq!(parse_exception("(\"x\")"), None);
    }

    #[test]
    fn test_sites() {
        let program = program();
        let specs = [
            "Error@Store.put(II)V".to_string(),
            r#"RuntimeException("late")@Store.get:1"#.to_string(),
        ];
        let injector = Injector::new(&program, &specs).unwrap();
        assert_eq!(injector.len(), 2);
        let class = program.class_id("Store").unwrap();
        let put = program.methods_named(class, "put")[0];
        let get = program.methods_named(class, "get")[0];
        assert_eq!(&*injector.on_call(put).unwrap().exception, "Error");
        assert!(injector.on_call(get).is_none());
        assert_eq!(injector.at(get, 1).unwrap().detail.as_deref(), Some("late"));
        assert!(injector.at(get, 0).is_none());
    }

    #[test]
    fn test_rejects_bad_injections() {
        let program = program();
        let err = |spec: &str| Injector::new(&program, &[spec.to_string()]).unwrap_err();
        assert!(matches!(err("Error"), VmError::InvalidInjection { .. }));
        assert!(matches!(err("Store@Store.get"), VmError::InvalidInjection { .. }));
        assert!(matches!(err("Missing@Store.get"), VmError::InvalidInjection { .. }));
        assert!(matches!(err("Error@Store.get:9"), VmError::InvalidInjection { .. }));
        assert!(matches!(err("Error@Store.get:x"), VmError::InvalidInjection { .. }));
        assert!(matches!(err("Error@Store.drop"), VmError::UnknownInjectTarget { .. }));
    }
}
