//! Model/engine options consumed from the caller (spec §6):
//! `/debug=`, `/threads=`, `/engine=`, `/iterations=`,
//! `/extra-parameters=`, `/parameters=`, `/set-from-meta=`, and the
//! per-engine tuning knobs. Collects parse diagnostics rather than
//! aborting on the first malformed option (mirroring the parameter
//! file's "collect diagnostics" policy from §6), so a single typo
//! doesn't lose the rest of a long option string.

use std::collections::HashMap;

/// One option that failed to parse, with enough context to report it.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionDiagnostic {
    pub option: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct FitOptions {
    pub debug: i32,
    pub threads: usize,
    pub engine: Option<String>,
    pub iterations: Option<usize>,
    pub extra_parameters: Vec<String>,
    pub parameters_file: Option<String>,
    pub set_from_meta: HashMap<String, String>,
    /// Everything else, verbatim, for model-specific hard/soft option
    /// consumption (`Fit::parse_hard_options`/`parse_soft_options`).
    pub model_options: HashMap<String, String>,
    pub diagnostics: Vec<OptionDiagnostic>,
}

impl FitOptions {
    /// Parses a list of `/key=value` (or bare `/key`) tokens, as they
    /// would appear on a command line. Unknown keys land in
    /// `model_options`, available to the concrete model's option
    /// parser; `threads=0` or negative means "auto" and is normalized
    /// to 1 here (the actual thread-count policy is the caller's).
    pub fn parse(tokens: &[&str]) -> Self {
        let mut opts = FitOptions {
            threads: 1,
            ..Default::default()
        };
        for token in tokens {
            let token = token.strip_prefix('/').unwrap_or(token);
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token, None),
            };
            opts.apply(key, value);
        }
        opts
    }

    fn apply(&mut self, key: &str, value: Option<&str>) {
        match (key, value) {
            ("debug", Some(v)) => match v.parse() {
                Ok(n) => self.debug = n,
                Err(_) => self.diagnostic(key, v, "expected an integer"),
            },
            ("threads", Some(v)) => match v.parse::<i64>() {
                Ok(n) if n <= 0 => self.threads = num_cpus_fallback(),
                Ok(n) => self.threads = n as usize,
                Err(_) => self.diagnostic(key, v, "expected an integer"),
            },
            ("engine", Some(v)) => self.engine = Some(v.to_string()),
            ("iterations", Some(v)) => match v.parse() {
                Ok(n) => self.iterations = Some(n),
                Err(_) => self.diagnostic(key, v, "expected an integer"),
            },
            ("extra-parameters", Some(v)) => {
                self.extra_parameters = v.split(',').map(str::trim).map(String::from).collect();
            }
            ("parameters", Some(v)) => self.parameters_file = Some(v.to_string()),
            ("set-from-meta", Some(v)) => {
                for pair in v.split(',') {
                    if let Some((name, meta)) = pair.split_once('=') {
                        self.set_from_meta
                            .insert(name.trim().to_string(), meta.trim().to_string());
                    } else {
                        self.diagnostic(key, pair, "expected name=meta");
                    }
                }
            }
            (key, Some(v)) => {
                self.model_options.insert(key.to_string(), v.to_string());
            }
            (key, None) => {
                self.model_options.insert(key.to_string(), String::new());
            }
        }
    }

    fn diagnostic(&mut self, option: &str, value: &str, message: &str) {
        self.diagnostics.push(OptionDiagnostic {
            option: format!("{option}={value}"),
            message: message.to_string(),
        });
    }

    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}

/// A conservative stand-in for "auto thread count": this crate has no
/// business guessing hardware concurrency for the caller, so `/threads=0`
/// or a negative value falls back to single-threaded rather than
/// reaching for a platform API the core doesn't otherwise need.
fn num_cpus_fallback() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_options() {
        let opts = FitOptions::parse(&["/debug=2", "/threads=4", "/engine=lm", "/iterations=100"]);
        assert_eq!(opts.debug, 2);
        assert_eq!(opts.threads, 4);
        assert_eq!(opts.engine.as_deref(), Some("lm"));
        assert_eq!(opts.iterations, Some(100));
        assert!(!opts.has_errors());
    }

    #[test]
    fn test_unknown_option_goes_to_model_options() {
        let opts = FitOptions::parse(&["/rbkg=1.2"]);
        assert_eq!(opts.model_options.get("rbkg").unwrap(), "1.2");
    }

    #[test]
    fn test_malformed_numeric_option_is_a_diagnostic_not_a_panic() {
        let opts = FitOptions::parse(&["/debug=oops"]);
        assert_eq!(opts.debug, 0);
        assert!(opts.has_errors());
        assert_eq!(opts.diagnostics[0].option, "debug=oops");
    }

    #[test]
    fn test_threads_non_positive_falls_back() {
        let opts = FitOptions::parse(&["/threads=0"]);
        assert_eq!(opts.threads, 1);
        let opts = FitOptions::parse(&["/threads=-3"]);
        assert_eq!(opts.threads, 1);
    }

    #[test]
    fn test_extra_parameters_and_set_from_meta() {
        let opts = FitOptions::parse(&["/extra-parameters=a,b,c", "/set-from-meta=k=temperature"]);
        assert_eq!(opts.extra_parameters, vec!["a", "b", "c"]);
        assert_eq!(opts.set_from_meta.get("k").unwrap(), "temperature");
    }
}
