//! The packing layer: translates between the "expanded" vector (one
//! value per declared-parameter × dataset slot) and the "packed" or
//! "reduced" vector the solver actually sees (one value per `Free`
//! slot) — spec §4.2.

use std::collections::HashMap;

use crate::errors::FitError;
use crate::expression::VarRef;
use crate::fit_parameter::{FitParameter, ParameterKind, GLOBAL_DATASET};
use crate::parameter_definition::ParameterDefinition;

/// Free-entry indices grouped the two ways §4.2 asks for: by declared
/// parameter, and by dataset (with a separate bucket for globals,
/// since `Vec` has no natural `-1` slot).
#[derive(Debug, Default, Clone)]
pub struct PackingPlan {
    pub free_count: usize,
    /// `parameters_by_definition[param_index]` = free-entry indices
    /// (into the owning `ParameterSet::entries`) for that declared parameter.
    pub parameters_by_definition: Vec<Vec<usize>>,
    /// Free-entry indices whose `ds_index == GLOBAL_DATASET`.
    pub global_free: Vec<usize>,
    /// `per_dataset_free[ds]` = free-entry indices for dataset `ds`.
    pub per_dataset_free: Vec<Vec<usize>>,
    /// `fit_index_entry[fit_index]` = position in `ParameterSet::entries`,
    /// the inverse of each free entry's `fit_index` — convenient for
    /// derivative-queue jobs, which are tagged by `fit_index` alone.
    pub fit_index_entry: Vec<usize>,
}

/// Owns the declared-parameter metadata and the per-slot entries, and
/// mediates every pack/unpack operation between them.
#[derive(Debug, Clone)]
pub struct ParameterSet {
    pub definitions: Vec<ParameterDefinition>,
    pub entries: Vec<FitParameter>,
    pub num_datasets: usize,
    pub plan: PackingPlan,
    name_to_index: HashMap<String, usize>,
    entry_of: HashMap<(usize, i64), usize>,
    /// Turn a true formula-dependency cycle into `FitError::Internal`
    /// instead of silently accepting the last value of a fixed-pass-count
    /// loop (spec §4.2/§9 Open Questions; this crate's resolution).
    pub detect_cycles: bool,
}

impl ParameterSet {
    /// Implements `initializeParameters`: stable-sorts `entries` so
    /// fixed/formula precede free (free entries get a `fit_index`,
    /// the others never do), then builds the by-definition / by-dataset
    /// free-entry indices.
    pub fn initialize(
        definitions: Vec<ParameterDefinition>,
        mut entries: Vec<FitParameter>,
        num_datasets: usize,
    ) -> Result<Self, FitError> {
        entries.sort_by_key(|e| e.is_free());

        let mut next_fit_index = 0usize;
        for e in entries.iter_mut() {
            if e.is_free() {
                e.set_fit_index(next_fit_index);
                next_fit_index += 1;
            }
        }

        let mut parameters_by_definition = vec![Vec::new(); definitions.len()];
        let mut global_free = Vec::new();
        let mut per_dataset_free = vec![Vec::new(); num_datasets];
        let mut fit_index_entry = vec![0usize; next_fit_index];
        let mut entry_of = HashMap::with_capacity(entries.len());

        for (idx, e) in entries.iter().enumerate() {
            entry_of.insert((e.param_index, e.ds_index), idx);
            if let ParameterKind::Free { fit_index: Some(fi) } = e.kind {
                fit_index_entry[fi] = idx;
                // Plan groupings are keyed by fit_index, since that is
                // what the packed vector and the jacobian's columns are
                // indexed by; `entry_of` above stays keyed by entries-array
                // position, since that is what the expanded vector uses.
                parameters_by_definition
                    .get_mut(e.param_index)
                    .ok_or_else(|| FitError::internal("free entry references unknown parameter"))?
                    .push(fi);
                if e.ds_index == GLOBAL_DATASET {
                    global_free.push(fi);
                } else {
                    let ds = usize::try_from(e.ds_index)
                        .map_err(|_| FitError::internal("negative non-global dataset index"))?;
                    per_dataset_free
                        .get_mut(ds)
                        .ok_or_else(|| FitError::internal("dataset index out of range"))?
                        .push(fi);
                }
            }
        }

        let name_to_index = definitions
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();

        let plan = PackingPlan {
            free_count: next_fit_index,
            parameters_by_definition,
            global_free,
            per_dataset_free,
            fit_index_entry,
        };

        let set = ParameterSet {
            definitions,
            entries,
            num_datasets,
            plan,
            name_to_index,
            entry_of,
            detect_cycles: true,
        };
        set.check_formula_cycles()?;
        Ok(set)
    }

    pub fn free_count(&self) -> usize {
        self.plan.free_count
    }

    /// The `FitParameter` entry owning a given `fit_index` (inverse of
    /// `FitParameter::fit_index`).
    pub fn entry_for_fit_index(&self, fi: usize) -> &FitParameter {
        &self.entries[self.plan.fit_index_entry[fi]]
    }

    /// `packParameters`: copies free values from the expanded vector
    /// into their `fit_index` slot in `packed`.
    pub fn pack(&self, expanded: &[f64], packed: &mut [f64]) {
        for e in &self.entries {
            if let ParameterKind::Free { fit_index: Some(fi) } = e.kind {
                packed[fi] = expanded[self.slot(&e)];
            }
        }
    }

    /// `unpackParameters`: the reverse, then evaluates formula-tied
    /// entries, repeating until stable or `entries.len()` passes.
    pub fn unpack(&self, packed: &[f64], expanded: &mut [f64]) -> Result<(), FitError> {
        for (idx, e) in self.entries.iter().enumerate() {
            match &e.kind {
                ParameterKind::Free { fit_index: Some(fi) } => expanded[idx] = packed[*fi],
                ParameterKind::Fixed { value } => expanded[idx] = *value,
                ParameterKind::Free { fit_index: None } => {
                    return Err(FitError::internal("free entry has no fit_index"))
                }
                ParameterKind::Formula { .. } => {}
            }
        }
        self.evaluate_formulas(expanded)
    }

    fn slot(&self, e: &FitParameter) -> usize {
        self.entry_of[&(e.param_index, e.ds_index)]
    }

    fn resolve(&self, owner: &FitParameter, var: &VarRef) -> Result<usize, FitError> {
        let param_index = *self
            .name_to_index
            .get(&var.name)
            .ok_or_else(|| FitError::runtime(format!("unknown parameter '{}'", var.name)))?;
        let def = &self.definitions[param_index];

        let candidate_ds = match var.index {
            Some(explicit) => explicit as i64,
            None if !def.can_be_per_dataset => GLOBAL_DATASET,
            None => owner.ds_index,
        };

        if let Some(&idx) = self.entry_of.get(&(param_index, candidate_ds)) {
            return Ok(idx);
        }
        if let Some(&idx) = self.entry_of.get(&(param_index, GLOBAL_DATASET)) {
            return Ok(idx);
        }
        Err(FitError::runtime(format!(
            "parameter '{}' has no entry for the requested dataset context",
            var.name
        )))
    }

    fn evaluate_formulas(&self, expanded: &mut [f64]) -> Result<(), FitError> {
        let formula_indices: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_formula())
            .map(|(i, _)| i)
            .collect();
        if formula_indices.is_empty() {
            return Ok(());
        }

        let max_passes = self.entries.len().max(1);
        for _ in 0..max_passes {
            let mut max_delta = 0.0f64;
            for &idx in &formula_indices {
                let owner = &self.entries[idx];
                let formula = match &owner.kind {
                    ParameterKind::Formula { formula } => formula,
                    _ => unreachable!(),
                };
                let lookup = |v: &VarRef| -> Option<f64> {
                    self.resolve(owner, v).ok().map(|i| expanded[i])
                };
                let new_value = formula.evaluate(&lookup)?;
                max_delta = max_delta.max((new_value - expanded[idx]).abs());
                expanded[idx] = new_value;
            }
            if max_delta < 1e-15 {
                break;
            }
        }
        Ok(())
    }

    /// Static dependency-cycle check: a formula entry that transitively
    /// refers to itself through other formula entries cannot converge
    /// by repeated evaluation and is treated as an internal error.
    fn check_formula_cycles(&self) -> Result<(), FitError> {
        if !self.detect_cycles {
            return Ok(());
        }
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let n = self.entries.len();
        let mut color = vec![Color::White; n];

        fn visit(
            set: &ParameterSet,
            idx: usize,
            color: &mut [Color],
        ) -> Result<(), FitError> {
            color[idx] = Color::Gray;
            if let ParameterKind::Formula { formula } = &set.entries[idx].kind {
                let owner = &set.entries[idx];
                for var in formula.variables() {
                    let Ok(target) = set.resolve(owner, var) else {
                        continue;
                    };
                    if !set.entries[target].is_formula() {
                        continue;
                    }
                    match color[target] {
                        Color::White => visit(set, target, color)?,
                        Color::Gray => {
                            return Err(FitError::internal(
                                "formula parameter dependency cycle detected",
                            ))
                        }
                        Color::Black => {}
                    }
                }
            }
            color[idx] = Color::Black;
            Ok(())
        }

        for idx in 0..n {
            if color[idx] == Color::White && self.entries[idx].is_formula() {
                visit(self, idx, &mut color)?;
            }
        }
        Ok(())
    }
}
