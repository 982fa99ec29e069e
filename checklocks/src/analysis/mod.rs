//! Lock-state analysis
//!
//! Each function is lowered, resolved against the shared [`Registry`], and
//! propagated on its own. Functions have no data dependency on each other,
//! so they are analyzed in parallel and their diagnostic lists merged in
//! declaration order.

mod check;
mod propagate;
mod state;

pub use check::{FieldAccess, Finding, apply_call, apply_force, apply_lock_op, check_access, check_exit};
pub use propagate::{fixpoint, propagate};
pub use state::LockState;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::ast::{FnDef, Program};
use crate::config::Config;
use crate::contract::{FnKey, Registry};
use crate::diagnostics::Diagnostic;
use crate::mir::lower_function;
use crate::resolve::resolve_function;

/// Analyze a single function body
pub fn analyze_function(def: &FnDef, registry: &Registry, config: &Config) -> Vec<Diagnostic> {
    let key = FnKey::of(def);
    if registry.is_rejected(&key) {
        debug!(function = %key, "skipping function with invalid annotations");
        return Vec::new();
    }
    if registry.function_contract(&key).is_some_and(|c| c.ignored) {
        debug!(function = %key, "skipping ignored function body");
        return Vec::new();
    }

    let (mir, mut diagnostics) = lower_function(def, config);
    let (resolved, resolve_diagnostics) = resolve_function(&mir, registry, config);
    diagnostics.extend(resolve_diagnostics);
    diagnostics.extend(propagate(&resolved, config));

    debug!(
        function = %key,
        blocks = resolved.blocks.len(),
        locks = resolved.locks.len(),
        diagnostics = diagnostics.len(),
        "analyzed function"
    );
    diagnostics
}

/// Analyze every function of a compilation unit
pub fn analyze_program(program: &Program, registry: &Registry, config: &Config) -> Vec<Diagnostic> {
    let functions: Vec<&FnDef> = program.functions().collect();
    let run = || -> Vec<Diagnostic> {
        functions
            .par_iter()
            .map(|def| analyze_function(def, registry, config))
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect()
    };

    let diagnostics = if config.analysis.jobs > 0 {
        match rayon::ThreadPoolBuilder::new().num_threads(config.analysis.jobs).build() {
            Ok(pool) => pool.install(run),
            Err(err) => {
                warn!(error = %err, "failed to build thread pool, using the global pool");
                run()
            }
        }
    } else {
        run()
    };

    info!(
        functions = functions.len(),
        diagnostics = diagnostics.len(),
        "analysis finished"
    );
    diagnostics
}
