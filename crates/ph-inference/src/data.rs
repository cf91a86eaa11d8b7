//! Subject data: one identifier plus aligned per-step input and output
//! vectors, with an optional per-step observed mask for missed visits.

use ph_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::model::{EmissionFamily, ModelSpec};

/// One tracked subject's longitudinal record.
///
/// `inputs[t]` holds the covariates in effect at step `t` and `outputs[t]`
/// the measurements taken there; the two are aligned index-for-index.
/// Steps where the visit happened but no measurement was taken carry
/// `observed[t] = false` and contribute no emission likelihood — the state
/// chain coasts on transitions across them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    id: String,
    inputs: Vec<Vec<f64>>,
    outputs: Vec<Vec<f64>>,
    observed: Vec<bool>,
}

impl Subject {
    /// Build a fully-observed subject. Sequences must be non-empty and of
    /// equal length.
    pub fn new(
        id: impl Into<String>,
        inputs: Vec<Vec<f64>>,
        outputs: Vec<Vec<f64>>,
    ) -> Result<Self> {
        let observed = vec![true; inputs.len()];
        Self::with_mask(id, inputs, outputs, observed)
    }

    /// Build a subject with an explicit per-step observed mask.
    ///
    /// `outputs[t]` must still be present (and finite-shaped) for masked
    /// steps; its values are simply never evaluated.
    pub fn with_mask(
        id: impl Into<String>,
        inputs: Vec<Vec<f64>>,
        outputs: Vec<Vec<f64>>,
        observed: Vec<bool>,
    ) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::Configuration("subject id must be non-empty".to_string()));
        }
        if inputs.is_empty() {
            return Err(Error::Configuration(format!(
                "subject '{id}' has an empty sequence"
            )));
        }
        if inputs.len() != outputs.len() || inputs.len() != observed.len() {
            return Err(Error::Configuration(format!(
                "subject '{id}': inputs ({}), outputs ({}) and mask ({}) lengths differ",
                inputs.len(),
                outputs.len(),
                observed.len()
            )));
        }
        Ok(Self { id, inputs, outputs, observed })
    }

    /// Subject identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sequence length T.
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// Whether the sequence is empty. Construction forbids it; this exists
    /// for the conventional `len`/`is_empty` pair.
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Input vector at step `t`.
    pub fn input(&self, t: usize) -> &[f64] {
        &self.inputs[t]
    }

    /// Output vector at step `t`.
    pub fn output(&self, t: usize) -> &[f64] {
        &self.outputs[t]
    }

    /// Whether step `t` carries an evaluated measurement.
    pub fn is_observed(&self, t: usize) -> bool {
        self.observed[t]
    }

    /// Check this subject's shapes against a specification.
    ///
    /// Row widths must match `n_inputs`/`n_outputs`, and categorical
    /// outputs must be integral and inside the category range. Non-finite
    /// *values* are deliberately not rejected here: they surface as a
    /// per-subject numerical instability during the E-step, which keeps
    /// one corrupt subject from masquerading as a configuration problem.
    pub fn validate_against(&self, spec: &ModelSpec) -> Result<()> {
        for (t, row) in self.inputs.iter().enumerate() {
            if row.len() != spec.n_inputs() {
                return Err(Error::Configuration(format!(
                    "subject '{}': input row {t} has {} columns, expected {}",
                    self.id,
                    row.len(),
                    spec.n_inputs()
                )));
            }
        }
        for (t, row) in self.outputs.iter().enumerate() {
            if row.len() != spec.n_outputs() {
                return Err(Error::Configuration(format!(
                    "subject '{}': output row {t} has {} columns, expected {}",
                    self.id,
                    row.len(),
                    spec.n_outputs()
                )));
            }
        }
        match spec.emission_family() {
            EmissionFamily::Categorical { n_categories } => {
                for t in 0..self.len() {
                    if !self.observed[t] {
                        continue;
                    }
                    let y = self.outputs[t][0];
                    if y.is_finite() && (y.fract() != 0.0 || y < 0.0 || y >= n_categories as f64) {
                        return Err(Error::Configuration(format!(
                            "subject '{}': output at step {t} is {y}, expected an integer in 0..{n_categories}",
                            self.id
                        )));
                    }
                }
            }
            EmissionFamily::Poisson => {
                for t in 0..self.len() {
                    if !self.observed[t] {
                        continue;
                    }
                    for (d, &y) in self.outputs[t].iter().enumerate() {
                        if y.is_finite() && (y.fract() != 0.0 || y < 0.0) {
                            return Err(Error::Configuration(format!(
                                "subject '{}': output[{d}] at step {t} is {y}, expected a non-negative count",
                                self.id
                            )));
                        }
                    }
                }
            }
            EmissionFamily::Gaussian => {}
        }
        Ok(())
    }
}
