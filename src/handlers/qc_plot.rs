//! Quality-control plot of an observed NetCDF data set.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{HandlerContext, RequestHandler, RESULT_VAR};
use crate::engine::{Engine, StatementBuilder};
use crate::error::AnalysisError;
use crate::request::{AnalysisKind, AnalysisReply, AnalysisRequest, Arguments};

const QC_FUNCTION: &str = "qcPlots";

/// Result key for the plot location.
pub const QC_PLOT: &str = "qcPlot";

/// Handler for `QCPLOT` requests.
#[derive(Debug, Clone)]
pub struct QcPlotHandler {
    context: HandlerContext,
}

impl QcPlotHandler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl RequestHandler for QcPlotHandler {
    async fn run(
        &self,
        engine: &mut dyn Engine,
        request: &AnalysisRequest,
        _kind: &AnalysisKind,
    ) -> Result<AnalysisReply, AnalysisError> {
        let args = Arguments::new(request.arguments());
        let obs_nc = args.url("obsNC")?;
        let user_name = args.string("userName")?;
        let data_set_name = args.string("dataSetName")?;
        let data_set_version_name = args.string("dataSetVersionName")?;

        let remote = self.context.resolve(&obs_nc)?;

        let id = request.id();
        let input = self.context.staging().input_path(id, ".nc");
        let plot = self.context.staging().output_path(id, ".qc.png");

        self.context
            .fetch_input(remote.as_ref(), &obs_nc, &input)
            .await?;

        let statements = StatementBuilder::new()
            .library(self.context.api_package())
            .assign_path("obsNC", &input)
            .assign_path(QC_PLOT, &plot)
            .assign_str("userName", user_name)
            .assign_str("dataSetName", data_set_name)
            .assign_str("dataSetVersionName", data_set_version_name)
            .call(
                RESULT_VAR,
                QC_FUNCTION,
                &["obsNC", QC_PLOT, "userName", "dataSetName", "dataSetVersionName"],
            )
            .build();
        engine.evaluate_all(&statements).await?;

        let plot_url = self
            .context
            .store_output(remote.as_ref(), &obs_nc, &plot, &format!("{}.qc.png", id))
            .await?;
        self.context
            .cleanup(
                remote.as_ref(),
                &[input.as_path(), plot.as_path()],
                &[&plot_url],
            )
            .await?;

        info!(request_id = %id, plot = %plot_url, "Produced QC plot");

        let mut results = HashMap::new();
        results.insert(QC_PLOT.to_string(), Value::String(plot_url.to_string()));
        Ok(AnalysisReply::normal(id, results))
    }
}
