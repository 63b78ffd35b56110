// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use rudder_config::Parameters;

use crate::metrics::Metrics;
#[cfg(test)]
use crate::metrics::test_metrics;

/// Context contains the configuration and metrics shared by all components of
/// this instance.
#[derive(Clone)]
pub struct Context {
    /// Parameters of this instance.
    pub parameters: Parameters,
    /// Metrics of this instance.
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(parameters: Parameters, metrics: Arc<Metrics>) -> Self {
        Self {
            parameters,
            metrics,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Arc<Context> {
        Arc::new(Context::new(Parameters::default(), test_metrics()))
    }

    #[cfg(test)]
    pub(crate) fn new_for_test_with(parameters: Parameters) -> Arc<Context> {
        Arc::new(Context::new(parameters, test_metrics()))
    }
}
