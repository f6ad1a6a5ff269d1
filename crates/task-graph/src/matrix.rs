//! Cross-product expansion of evaluation requests.

use crate::{Result, TaskGraph};
use ewb_cache::{EvaluationRequest, ParameterSet};

/// The dimensions of a batch of evaluations.
///
/// Expands to one request per (model, event type, variable, parameter set)
/// combination, nested in that order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestMatrix {
    /// Event categories to evaluate.
    pub event_types: Vec<String>,
    /// Forecast models to evaluate.
    pub model_ids: Vec<String>,
    /// Variables to evaluate.
    pub variables: Vec<String>,
    /// Parameter sets to evaluate; empty means a single empty set.
    pub parameter_sets: Vec<ParameterSet>,
}

impl RequestMatrix {
    /// Create an empty matrix.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event types.
    #[must_use]
    pub fn event_types<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = values.into_iter().map(Into::into).collect();
        self
    }

    /// Set the models.
    #[must_use]
    pub fn model_ids<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.model_ids = values.into_iter().map(Into::into).collect();
        self
    }

    /// Set the variables.
    #[must_use]
    pub fn variables<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables = values.into_iter().map(Into::into).collect();
        self
    }

    /// Set the parameter sets.
    #[must_use]
    pub fn parameter_sets(mut self, values: impl IntoIterator<Item = ParameterSet>) -> Self {
        self.parameter_sets = values.into_iter().collect();
        self
    }

    /// Number of requests the matrix expands to.
    #[must_use]
    pub fn len(&self) -> usize {
        self.model_ids
            .len()
            .saturating_mul(self.event_types.len())
            .saturating_mul(self.variables.len())
            .saturating_mul(self.parameter_sets.len().max(1))
    }

    /// Whether the matrix expands to no requests.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expand into requests.
    #[must_use]
    pub fn requests(&self) -> Vec<EvaluationRequest> {
        let empty = [ParameterSet::new()];
        let parameter_sets: &[ParameterSet] = if self.parameter_sets.is_empty() {
            &empty
        } else {
            &self.parameter_sets
        };

        let mut requests = Vec::with_capacity(self.len());
        for model in &self.model_ids {
            for event in &self.event_types {
                for variable in &self.variables {
                    for params in parameter_sets {
                        requests.push(EvaluationRequest::new(
                            event.clone(),
                            model.clone(),
                            variable.clone(),
                            params.clone(),
                        ));
                    }
                }
            }
        }
        requests
    }

    /// Expand into a deduplicated task graph.
    ///
    /// # Errors
    ///
    /// Returns an error if a request cannot be keyed.
    pub fn into_graph(self) -> Result<TaskGraph> {
        TaskGraph::build(self.requests())
    }
}
