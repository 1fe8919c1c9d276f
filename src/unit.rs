use std::sync::{Arc, Mutex};

use crate::args::DriverArgs;
use crate::front::ast::TranslationUnit;
use crate::ir::Module;

/// Container owning the shared IR module and the ordered set of translation
/// units feeding it.
///
/// One mutex guards the TU set; CC workers take it to register pragma
/// library imports and insert their TU at its ordinal. The module's symbol
/// table has its own lock and is not covered here.
pub struct CompilationUnit {
    module: Module,
    tus: Mutex<Vec<Option<Arc<TranslationUnit>>>>,
}

impl CompilationUnit {
    #[must_use]
    pub fn new(module: Module) -> Self {
        Self {
            module,
            tus: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Register one TU under the unit lock: first append its
    /// `#pragma comment(lib, ...)` imports to `args.libraries`, then insert
    /// the TU at its ordinal.
    pub fn register(&self, args: &DriverArgs, imports: &[String], tu: Arc<TranslationUnit>) {
        let mut tus = self.tus.lock().unwrap();
        for import in imports {
            args.push_library(import.clone());
        }
        let ordinal = tu.ordinal();
        if tus.len() <= ordinal {
            tus.resize_with(ordinal + 1, || None);
        }
        tus[ordinal] = Some(tu);
    }

    /// Registered TUs in ordinal order.
    #[must_use]
    pub fn translation_units(&self) -> Vec<Arc<TranslationUnit>> {
        self.tus.lock().unwrap().iter().flatten().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tus.lock().unwrap().iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registered TU; the module stays.
    pub fn clear(&self) {
        self.tus.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::CompilationUnit;
    use crate::args::{Arch, DriverArgs, TargetOs};
    use crate::front::ast::TranslationUnit;
    use crate::ir::Module;
    use std::sync::Arc;

    fn unit() -> CompilationUnit {
        CompilationUnit::new(Module::new(Arch::X86_64, TargetOs::Linux, false))
    }

    fn tu(path: &str, ordinal: usize) -> Arc<TranslationUnit> {
        let mut tu = TranslationUnit::new(path);
        tu.set_ordinal(ordinal);
        Arc::new(tu)
    }

    #[test]
    fn registration_is_ordinal_ordered_even_out_of_order() {
        let args = DriverArgs::default();
        let cu = unit();
        cu.register(&args, &[], tu("b.c", 1));
        cu.register(&args, &["winmm".to_string()], tu("a.c", 0));

        let tus = cu.translation_units();
        assert_eq!(tus.len(), 2);
        assert_eq!(tus[0].path, "a.c");
        assert_eq!(tus[1].path, "b.c");
        assert_eq!(args.libraries_snapshot(), vec!["winmm".to_string()]);
    }

    #[test]
    fn clear_drops_the_tus_but_keeps_the_module() {
        let args = DriverArgs::default();
        let cu = unit();
        cu.register(&args, &[], tu("a.c", 0));
        assert!(!cu.is_empty());
        cu.clear();
        assert!(cu.is_empty());
        let _ = cu.module();
    }
}
