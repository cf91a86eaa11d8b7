//! Model specification: state count, emission family, covariate layout,
//! transition structure, and the personalization scheme.
//!
//! A [`ModelSpec`] is validated at construction and immutable afterwards;
//! every other component treats it as read-only shape information. There is
//! no implicit intercept anywhere in the engine: an intercept is expressed
//! as a constant input column selected by the covariate index lists, which
//! is also how the covariate matrices of the clinical datasets this engine
//! targets are laid out.

use ph_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Conditional distribution family of the observed outputs given a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmissionFamily {
    /// Continuous outputs: one Gaussian per (state, channel), mean driven
    /// by the emission covariates, variance estimated per (state, channel).
    Gaussian,
    /// A single categorical output channel with `n_categories` levels;
    /// per-state category logits driven by the emission covariates.
    Categorical {
        /// Number of category levels (>= 2).
        n_categories: usize,
    },
    /// Count outputs: one Poisson per (state, channel) with a log link.
    Poisson,
}

/// Which transitions between latent states are structurally allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionStructure {
    /// Every state can reach every state.
    Full,
    /// States are ordered by severity and transitions only go to the same
    /// or a higher index. Cells below the diagonal are structural zeros.
    Progressive,
}

/// Which parameter blocks carry subject-specific offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersonalizationScheme {
    /// Per-subject additive offset on each (state, channel) emission
    /// linear predictor.
    pub emission: bool,
    /// Per-subject additive offset on each state's self-transition logit
    /// (subject-specific persistence).
    pub transition: bool,
}

impl PersonalizationScheme {
    /// No subject-specific offsets anywhere (plain IOHMM).
    pub fn none() -> Self {
        Self { emission: false, transition: false }
    }

    /// Offsets on the emission linear predictors only.
    pub fn emission_only() -> Self {
        Self { emission: true, transition: false }
    }
}

/// Immutable, validated model shape shared by every engine component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    n_states: usize,
    n_inputs: usize,
    n_outputs: usize,
    emission_family: EmissionFamily,
    transition_covariates: Vec<usize>,
    emission_covariates: Vec<usize>,
    transition_structure: TransitionStructure,
    personalization: PersonalizationScheme,
}

impl ModelSpec {
    /// Build and validate a specification.
    ///
    /// `transition_covariates` and `emission_covariates` index columns of
    /// every subject's per-step input vector and must be non-empty, unique,
    /// and in bounds.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        n_states: usize,
        n_inputs: usize,
        n_outputs: usize,
        emission_family: EmissionFamily,
        transition_covariates: Vec<usize>,
        emission_covariates: Vec<usize>,
        transition_structure: TransitionStructure,
        personalization: PersonalizationScheme,
    ) -> Result<Self> {
        let spec = Self {
            n_states,
            n_inputs,
            n_outputs,
            emission_family,
            transition_covariates,
            emission_covariates,
            transition_structure,
            personalization,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Intercept-only specification: a single constant input column feeds
    /// both the transition and the emission model.
    pub fn intercept_only(
        n_states: usize,
        n_outputs: usize,
        emission_family: EmissionFamily,
        personalization: PersonalizationScheme,
    ) -> Result<Self> {
        Self::new(
            n_states,
            1,
            n_outputs,
            emission_family,
            vec![0],
            vec![0],
            TransitionStructure::Full,
            personalization,
        )
    }

    /// Re-check every construction invariant.
    ///
    /// `new` calls this; the fitting and decoding entry points call it
    /// again so hand-deserialized specifications cannot smuggle in a bad
    /// shape.
    pub fn validate(&self) -> Result<()> {
        if self.n_states < 2 {
            return Err(Error::Configuration(format!(
                "n_states must be >= 2, got {}",
                self.n_states
            )));
        }
        if self.n_inputs == 0 {
            return Err(Error::Configuration("n_inputs must be >= 1".to_string()));
        }
        if self.n_outputs == 0 {
            return Err(Error::Configuration("n_outputs must be >= 1".to_string()));
        }
        if let EmissionFamily::Categorical { n_categories } = self.emission_family {
            if n_categories < 2 {
                return Err(Error::Configuration(format!(
                    "categorical family needs >= 2 categories, got {n_categories}"
                )));
            }
            if self.n_outputs != 1 {
                return Err(Error::Configuration(format!(
                    "categorical family uses a single output channel, got n_outputs = {}",
                    self.n_outputs
                )));
            }
        }
        validate_covariates("transition_covariates", &self.transition_covariates, self.n_inputs)?;
        validate_covariates("emission_covariates", &self.emission_covariates, self.n_inputs)?;
        Ok(())
    }

    /// Number of latent states K.
    pub fn n_states(&self) -> usize {
        self.n_states
    }

    /// Expected width of every per-step input vector.
    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    /// Expected width of every per-step output vector.
    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    /// Emission family.
    pub fn emission_family(&self) -> EmissionFamily {
        self.emission_family
    }

    /// Transition structure.
    pub fn transition_structure(&self) -> TransitionStructure {
        self.transition_structure
    }

    /// Personalization scheme.
    pub fn personalization(&self) -> PersonalizationScheme {
        self.personalization
    }

    /// Input columns feeding the transition logits.
    pub fn transition_covariates(&self) -> &[usize] {
        &self.transition_covariates
    }

    /// Input columns feeding the emission linear predictors.
    pub fn emission_covariates(&self) -> &[usize] {
        &self.emission_covariates
    }

    /// Rows of the per-state emission coefficient block: output channels
    /// for Gaussian/Poisson, category levels for the categorical family.
    pub fn n_channels(&self) -> usize {
        match self.emission_family {
            EmissionFamily::Gaussian | EmissionFamily::Poisson => self.n_outputs,
            EmissionFamily::Categorical { n_categories } => n_categories,
        }
    }

    /// Whether a `from -> to` transition is structurally allowed.
    pub fn allows_transition(&self, from: usize, to: usize) -> bool {
        match self.transition_structure {
            TransitionStructure::Full => true,
            TransitionStructure::Progressive => to >= from,
        }
    }

    /// Length of a subject's personalization vector under this spec.
    ///
    /// Layout: the emission block (state-major, `K * n_channels` entries)
    /// followed by the transition block (`K` self-transition offsets).
    pub fn personalization_dim(&self) -> usize {
        let mut dim = 0;
        if self.personalization.emission {
            dim += self.n_states * self.n_channels();
        }
        if self.personalization.transition {
            dim += self.n_states;
        }
        dim
    }

    /// Index of the emission offset for `(state, channel)` inside a
    /// personalization vector, if the emission block is enabled.
    pub fn emission_offset_index(&self, state: usize, channel: usize) -> Option<usize> {
        if !self.personalization.emission {
            return None;
        }
        Some(state * self.n_channels() + channel)
    }

    /// Index of the self-transition offset for `state` inside a
    /// personalization vector, if the transition block is enabled.
    pub fn transition_offset_index(&self, state: usize) -> Option<usize> {
        if !self.personalization.transition {
            return None;
        }
        let base = if self.personalization.emission {
            self.n_states * self.n_channels()
        } else {
            0
        };
        Some(base + state)
    }
}

fn validate_covariates(name: &str, indices: &[usize], n_inputs: usize) -> Result<()> {
    if indices.is_empty() {
        return Err(Error::Configuration(format!("{name} must be non-empty")));
    }
    for (pos, &idx) in indices.iter().enumerate() {
        if idx >= n_inputs {
            return Err(Error::Configuration(format!(
                "{name}[{pos}] = {idx} out of bounds for {n_inputs} input columns"
            )));
        }
        if indices[..pos].contains(&idx) {
            return Err(Error::Configuration(format!("{name} repeats column {idx}")));
        }
    }
    Ok(())
}
