//! Minimal dataset content: one experimental curve's `x`/`y` columns.
//!
//! Per spec §1, the full dataset container (multi-segment buffers,
//! file readers, metadata) is an external collaborator and out of
//! scope here. This type is the thin stand-in the fitting core needs
//! in order to actually call a model's `function` and to drive the
//! end-to-end test scenarios (§8): it is a plain value holding the
//! x/y columns a [`crate::fit_model::Fit`] implementation reads, not a
//! re-implementation of the excluded container.

#[derive(Debug, Clone)]
pub struct Dataset {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    /// Optional per-point "Z" perpendicular coordinate (§6's `Z[#i]`
    /// parameter-file line); unused by the core itself, carried through
    /// for models that need a third coordinate (e.g. potential-step
    /// families of curves).
    pub z: Option<f64>,
    /// Optional human label, echoed back in `# Buffer #N : <label>`
    /// parameter-file comments (§6).
    pub label: Option<String>,
}

impl Dataset {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Self {
        assert_eq!(x.len(), y.len(), "x and y must have the same length");
        Dataset {
            x,
            y,
            z: None,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_z(mut self, z: f64) -> Self {
        self.z = Some(z);
        self
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }
}
