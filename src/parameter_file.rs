//! The parameter-file text format (spec §6): a plain-text, tab-separated
//! dump of one fit's parameter shape and initial values, round-tripped
//! by [`FitWorkspace`](crate::fit_workspace::FitWorkspace)'s
//! import/export. Loading collects unrecognised lines as diagnostics
//! rather than aborting on the first one, up to a cap of 500 — past
//! that the whole load is abandoned.

use std::collections::{BTreeMap, HashMap};

use crate::errors::{FitError, ParameterFileError};
use crate::expression::Formula;
use crate::fit_data::default_entries;
use crate::fit_parameter::{FitParameter, ParameterKind, GLOBAL_DATASET};
use crate::parameter_definition::ParameterDefinition;

const MAX_DIAGNOSTICS: usize = 500;

/// One line the loader could not make sense of.
#[derive(Debug, Clone, PartialEq)]
pub struct LineDiagnostic {
    pub line_number: usize,
    pub line: String,
    pub message: String,
}

/// The result of a successful (possibly partial) parameter-file load.
#[derive(Debug, Clone, Default)]
pub struct ParsedParameterFile {
    /// `# Fit used: <name>`, if present.
    pub fit_name: Option<String>,
    /// `# Buffer #N : <label>` comments, keyed by dataset index.
    pub buffer_labels: BTreeMap<usize, String>,
    /// One entry per (declared parameter × dataset) slot, same shape
    /// `crate::fit_data::default_entries` would produce, with any
    /// lines found in the file overlaid on top.
    pub entries: Vec<FitParameter>,
    /// Initial value for each `Free` entry in `entries` (by position);
    /// meaningless for `Fixed`/`Formula` entries, which already carry
    /// their value/formula.
    pub initial_values: Vec<f64>,
    pub buffer_weights: Vec<f64>,
    pub z_values: Vec<Option<f64>>,
    pub diagnostics: Vec<LineDiagnostic>,
}

/// Parses `text` against `definitions`, the model's declared parameters,
/// producing a complete entry list (unmentioned slots keep their
/// `ParameterDefinition::defaults_to_fixed` shape, as if freshly built
/// by [`crate::fit_data::FitData::rebuild_parameters`]).
pub fn parse(
    text: &str,
    definitions: &[ParameterDefinition],
    num_datasets: usize,
) -> Result<ParsedParameterFile, ParameterFileError> {
    let name_to_def: HashMap<&str, usize> = definitions
        .iter()
        .enumerate()
        .map(|(i, d)| (d.name.as_str(), i))
        .collect();

    let mut entries = default_entries(definitions, num_datasets);
    let mut initial_values = vec![0.0; entries.len()];
    let entry_of: HashMap<(usize, i64), usize> = entries
        .iter()
        .enumerate()
        .map(|(idx, e)| ((e.param_index, e.ds_index), idx))
        .collect();

    let mut buffer_weights = vec![1.0; num_datasets];
    let mut z_values = vec![None; num_datasets];
    let mut fit_name = None;
    let mut buffer_labels = BTreeMap::new();
    let mut diagnostics = Vec::new();

    for (line_number, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            let comment = comment.trim();
            if let Some(name) = comment.strip_prefix("Fit used:") {
                fit_name = Some(name.trim().to_string());
            } else if let Some(rest) = comment.strip_prefix("Buffer #") {
                if let Some((index_part, label_part)) = rest.split_once(':') {
                    if let Ok(index) = index_part.trim().parse::<usize>() {
                        buffer_labels.insert(index, label_part.trim().to_string());
                    }
                }
            }
            continue;
        }

        if let Err(message) = parse_line(
            line,
            &name_to_def,
            &entry_of,
            num_datasets,
            &mut entries,
            &mut initial_values,
            &mut buffer_weights,
            &mut z_values,
        ) {
            diagnostics.push(LineDiagnostic {
                line_number: line_number + 1,
                line: raw_line.to_string(),
                message,
            });
            if diagnostics.len() > MAX_DIAGNOSTICS {
                return Err(ParameterFileError::TooManyErrors {
                    count: diagnostics.len(),
                });
            }
        }
    }

    Ok(ParsedParameterFile {
        fit_name,
        buffer_labels,
        entries,
        initial_values,
        buffer_weights,
        z_values,
        diagnostics,
    })
}

#[allow(clippy::too_many_arguments)]
fn parse_line(
    line: &str,
    name_to_def: &HashMap<&str, usize>,
    entry_of: &HashMap<(usize, i64), usize>,
    num_datasets: usize,
    entries: &mut [FitParameter],
    initial_values: &mut [f64],
    buffer_weights: &mut [f64],
    z_values: &mut [Option<f64>],
) -> Result<(), String> {
    let (key_part, value_part) = line
        .split_once('\t')
        .or_else(|| line.split_once(char::is_whitespace))
        .ok_or_else(|| "expected <name>\\t<value>".to_string())?;
    let (name, index) = split_indexed_key(key_part.trim());
    let value_part = value_part.trim();

    match name {
        "buffer_weight" => {
            let ds = index.ok_or("buffer_weight requires a [#i] dataset index")?;
            check_dataset(ds, num_datasets)?;
            let value: f64 = value_part
                .parse()
                .map_err(|_| format!("bad buffer_weight value '{value_part}'"))?;
            buffer_weights[ds] = value;
            Ok(())
        }
        "Z" => {
            let ds = index.ok_or("Z requires a [#i] dataset index")?;
            check_dataset(ds, num_datasets)?;
            let value: f64 = value_part
                .parse()
                .map_err(|_| format!("bad Z value '{value_part}'"))?;
            z_values[ds] = Some(value);
            Ok(())
        }
        name => {
            let &param_index = name_to_def.get(name).ok_or_else(|| {
                ParameterFileError::UnknownParameter {
                    name: name.to_string(),
                }
                .to_string()
            })?;
            let ds_index = match index {
                Some(i) => {
                    check_dataset(i, num_datasets)?;
                    i as i64
                }
                None => GLOBAL_DATASET,
            };
            let position = *entry_of
                .get(&(param_index, ds_index))
                .ok_or_else(|| format!("parameter '{name}' has no slot for this dataset index"))?;

            entries[position] = build_parameter(param_index, ds_index, value_part)?;
            if entries[position].is_free() {
                let v: f64 = value_part
                    .parse()
                    .map_err(|_| format!("bad value for '{name}': '{value_part}'"))?;
                initial_values[position] = v;
            }
            Ok(())
        }
    }
}

fn build_parameter(param_index: usize, ds_index: i64, value_part: &str) -> Result<FitParameter, String> {
    if let Some(rest) = value_part.strip_suffix('!') {
        let value: f64 = rest.trim().parse().map_err(|_| format!("bad fixed value '{value_part}'"))?;
        return Ok(FitParameter::fixed(param_index, ds_index, value));
    }
    if let Some(source) = value_part.strip_prefix('=') {
        let formula =
            Formula::parse(source.trim()).map_err(|e| format!("bad formula '{source}': {e}"))?;
        return Ok(FitParameter::formula(param_index, ds_index, formula));
    }
    if let Some(alias) = value_part.strip_prefix('$') {
        // An alias is exactly a formula that is a single variable
        // reference; reusing the formula machinery avoids a third
        // `ParameterKind` variant just for this syntax.
        let formula =
            Formula::parse(alias.trim()).map_err(|e| format!("bad alias '{alias}': {e}"))?;
        return Ok(FitParameter::formula(param_index, ds_index, formula));
    }
    if value_part.parse::<f64>().is_err() {
        return Err(format!("not a number, fixed value, formula or alias: '{value_part}'"));
    }
    Ok(FitParameter::free(param_index, ds_index))
}

/// Splits `tau[#2]` into `("tau", Some(2))`, or `tau` into `("tau", None)`.
fn split_indexed_key(key: &str) -> (&str, Option<usize>) {
    if let Some(start) = key.find("[#") {
        if let Some(end) = key[start..].find(']') {
            let index_str = &key[start + 2..start + end];
            if let Ok(index) = index_str.parse::<usize>() {
                return (&key[..start], Some(index));
            }
        }
    }
    (key, None)
}

fn check_dataset(index: usize, num_datasets: usize) -> Result<(), String> {
    if index >= num_datasets {
        Err(ParameterFileError::DatasetOutOfRange {
            index,
            count: num_datasets,
        }
        .to_string())
    } else {
        Ok(())
    }
}

/// Writes `entries`/`expanded_values` back out in the same format
/// `parse` reads (spec §6). `expanded_values` must be aligned with
/// `entries` the way `FitData::expand` produces it.
pub fn export(
    fit_name: &str,
    definitions: &[ParameterDefinition],
    entries: &[FitParameter],
    expanded_values: &[f64],
    buffer_labels: &BTreeMap<usize, String>,
    buffer_weights: &[f64],
    z_values: &[Option<f64>],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Fit used: {fit_name}\n"));
    for (index, label) in buffer_labels {
        out.push_str(&format!("# Buffer #{index} : {label}\n"));
    }

    for (position, entry) in entries.iter().enumerate() {
        let name = &definitions[entry.param_index].name;
        let key = format_key(name, entry.ds_index);
        match &entry.kind {
            ParameterKind::Free { .. } => {
                out.push_str(&format!("{key}\t{}\n", format_float(expanded_values[position])));
            }
            ParameterKind::Fixed { value } => {
                out.push_str(&format!("{key}\t{}!\n", format_float(*value)));
            }
            ParameterKind::Formula { formula } => {
                out.push_str(&format!("{key}\t={}\n", formula.source()));
            }
        }
    }

    for (ds, &weight) in buffer_weights.iter().enumerate() {
        if (weight - 1.0).abs() > f64::EPSILON {
            out.push_str(&format!("buffer_weight[#{ds}]\t{}\n", format_float(weight)));
        }
    }
    for (ds, z) in z_values.iter().enumerate() {
        if let Some(z) = z {
            out.push_str(&format!("Z[#{ds}]\t{}\n", format_float(*z)));
        }
    }

    out
}

fn format_key(name: &str, ds_index: i64) -> String {
    if ds_index == GLOBAL_DATASET {
        name.to_string()
    } else {
        format!("{name}[#{ds_index}]")
    }
}

fn format_float(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

/// Converts load diagnostics into a hard error once the 500-line cap
/// (`MAX_DIAGNOSTICS`) is crossed; callers that only want to warn can
/// ignore this and inspect `ParsedParameterFile::diagnostics` directly.
pub fn ensure_within_diagnostic_cap(parsed: &ParsedParameterFile) -> Result<(), FitError> {
    if parsed.diagnostics.len() > MAX_DIAGNOSTICS {
        Err(FitError::runtime(format!(
            "parameter file had {} unrecognised lines",
            parsed.diagnostics.len()
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defs() -> Vec<ParameterDefinition> {
        vec![
            ParameterDefinition::new("a").global(),
            ParameterDefinition::new("tau"),
            ParameterDefinition::new("offset").global().fixed_by_default(),
        ]
    }

    #[test]
    fn test_parses_free_fixed_and_formula_lines() {
        let text = "\
# Fit used: exponential
# Buffer #0 : run-1
a\t2.5
tau[#0]\t1.2
tau[#1]\t3.4!
offset\t=1/tau[#0]
";
        let parsed = parse(text, &defs(), 2).unwrap();
        assert_eq!(parsed.fit_name.as_deref(), Some("exponential"));
        assert_eq!(parsed.buffer_labels.get(&0).unwrap(), "run-1");
        assert!(parsed.diagnostics.is_empty());

        let a_pos = parsed
            .entries
            .iter()
            .position(|e| e.param_index == 0)
            .unwrap();
        assert!(parsed.entries[a_pos].is_free());
        assert_eq!(parsed.initial_values[a_pos], 2.5);

        let tau1_pos = parsed
            .entries
            .iter()
            .position(|e| e.param_index == 1 && e.ds_index == 1)
            .unwrap();
        assert!(parsed.entries[tau1_pos].is_fixed());

        let offset_pos = parsed
            .entries
            .iter()
            .position(|e| e.param_index == 2)
            .unwrap();
        assert!(parsed.entries[offset_pos].is_formula());
    }

    #[test]
    fn test_unrecognised_parameter_is_a_diagnostic() {
        let parsed = parse("bogus\t1.0\n", &defs(), 1).unwrap();
        assert_eq!(parsed.diagnostics.len(), 1);
        assert!(parsed.diagnostics[0].message.contains("bogus"));
    }

    #[test]
    fn test_buffer_weight_and_z_lines() {
        let text = "buffer_weight[#0]\t2.0\nZ[#1]\t-3.5\n";
        let parsed = parse(text, &defs(), 2).unwrap();
        assert_eq!(parsed.buffer_weights[0], 2.0);
        assert_eq!(parsed.z_values[1], Some(-3.5));
    }

    #[test]
    fn test_alias_syntax_becomes_a_formula() {
        let parsed = parse("offset\t$a\n", &defs(), 1).unwrap();
        let pos = parsed.entries.iter().position(|e| e.param_index == 2).unwrap();
        assert!(parsed.entries[pos].is_formula());
    }

    #[test]
    fn test_too_many_diagnostics_aborts() {
        let mut text = String::new();
        for _ in 0..501 {
            text.push_str("nope\t1.0\n");
        }
        let err = parse(&text, &defs(), 1).unwrap_err();
        assert!(matches!(err, ParameterFileError::TooManyErrors { .. }));
    }

    #[test]
    fn test_export_round_trips_through_parse() {
        let parsed = parse("a\t2.5\ntau[#0]\t1.2!\n", &defs(), 1).unwrap();
        let expanded: Vec<f64> = parsed
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| match &e.kind {
                ParameterKind::Fixed { value } => *value,
                ParameterKind::Free { .. } => parsed.initial_values[i],
                ParameterKind::Formula { .. } => 0.0,
            })
            .collect();
        let text = export(
            "exponential",
            &defs(),
            &parsed.entries,
            &expanded,
            &parsed.buffer_labels,
            &parsed.buffer_weights,
            &parsed.z_values,
        );
        assert!(text.contains("# Fit used: exponential"));
        assert!(text.contains("a\t2.5"));
        assert!(text.contains("tau[#0]\t1.2!"));

        let reparsed = parse(&text, &defs(), 1).unwrap();
        assert!(reparsed.diagnostics.is_empty());
    }
}
