//! Observed, model output and benchmark plots.
//!
//! The three families share one handler. The analysis kind suffix after the
//! family prefix (`OBSFluxDiurnal` → `FluxDiurnal`) is passed to the
//! analysis function as `analysisType` and names the produced plot.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{HandlerContext, RequestHandler, RESULT_VAR};
use crate::engine::{Engine, StatementBuilder};
use crate::error::AnalysisError;
use crate::request::{AnalysisKind, AnalysisReply, AnalysisRequest, Arguments, PlotFamily};

/// Result key for the plot location.
pub const PLOT: &str = "plot";

const ANALYSIS_TYPE: &str = "analysisType";

fn input_names(family: PlotFamily) -> &'static [&'static str] {
    match family {
        PlotFamily::Observed => &["obsNC"],
        PlotFamily::ModelOutput => &["modelNC", "obsNC"],
        PlotFamily::Benchmark => &["modelNC", "obsNC", "benchNC"],
    }
}

fn function_name(family: PlotFamily) -> &'static str {
    match family {
        PlotFamily::Observed => "obsAnalysis",
        PlotFamily::ModelOutput => "modelAnalysis",
        PlotFamily::Benchmark => "benchAnalysis",
    }
}

/// Handler for one plot family.
#[derive(Debug, Clone)]
pub struct PlotHandler {
    family: PlotFamily,
    context: HandlerContext,
}

impl PlotHandler {
    pub fn new(family: PlotFamily, context: HandlerContext) -> Self {
        Self { family, context }
    }

    pub fn family(&self) -> PlotFamily {
        self.family
    }

    /// Returns the analysis type for this family, rejecting empty or
    /// path-like values.
    fn analysis_type<'k>(&self, kind: &'k AnalysisKind) -> Result<&'k str, AnalysisError> {
        let variant = match kind {
            AnalysisKind::Plot { family, variant } if *family == self.family => variant,
            other => return Err(AnalysisError::UnrecognizedAnalysisKind(other.name())),
        };

        if variant.is_empty() {
            return Err(AnalysisError::invalid_argument(
                ANALYSIS_TYPE,
                format!("no analysis type after '{}'", self.family.prefix()),
            ));
        }
        if !variant
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(AnalysisError::invalid_argument(
                ANALYSIS_TYPE,
                format!("'{}' contains unsupported characters", variant),
            ));
        }
        Ok(variant)
    }
}

#[async_trait]
impl RequestHandler for PlotHandler {
    async fn run(
        &self,
        engine: &mut dyn Engine,
        request: &AnalysisRequest,
        kind: &AnalysisKind,
    ) -> Result<AnalysisReply, AnalysisError> {
        let analysis_type = self.analysis_type(kind)?;

        let args = Arguments::new(request.arguments());
        let names = input_names(self.family);
        let mut inputs = Vec::with_capacity(names.len());
        for name in names {
            let url = args.url(name)?;
            let remote = self.context.resolve(&url)?;
            inputs.push((*name, url, remote));
        }

        let id = request.id();
        let staging = self.context.staging();
        let plot = staging.output_path(id, &format!(".{}.png", analysis_type));

        let mut builder = StatementBuilder::new().library(self.context.api_package());
        let mut staged = Vec::with_capacity(inputs.len() + 1);
        for (name, url, remote) in &inputs {
            let local = staging.input_path(id, &format!(".{}.nc", name));
            self.context.fetch_input(remote.as_ref(), url, &local).await?;
            builder = builder.assign_path(name, &local);
            staged.push(local);
        }

        let mut call_args: Vec<&str> = names.to_vec();
        call_args.push(PLOT);
        call_args.push(ANALYSIS_TYPE);
        let statements = builder
            .assign_path(PLOT, &plot)
            .assign_str(ANALYSIS_TYPE, analysis_type)
            .call(RESULT_VAR, function_name(self.family), &call_args)
            .build();
        engine.evaluate_all(&statements).await?;

        // Inputs are non-empty for every family; the plot goes next to the first.
        let (_, primary_url, primary_remote) = &inputs[0];
        let plot_url = self
            .context
            .store_output(
                primary_remote.as_ref(),
                primary_url,
                &plot,
                &format!("{}.{}.png", id, analysis_type),
            )
            .await?;

        staged.push(plot);
        let staged_refs: Vec<_> = staged.iter().map(|p| p.as_path()).collect();
        self.context
            .cleanup(primary_remote.as_ref(), &staged_refs, &[&plot_url])
            .await?;

        info!(
            request_id = %id,
            family = %self.family,
            analysis_type,
            plot = %plot_url,
            "Produced plot"
        );

        let mut results = HashMap::new();
        results.insert(PLOT.to_string(), Value::String(plot_url.to_string()));
        Ok(AnalysisReply::normal(id, results))
    }
}
