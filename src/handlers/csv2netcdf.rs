//! CSV to NetCDF conversion.
//!
//! Converts an observed flux tower CSV file into a flux NetCDF file and a
//! meteorological NetCDF file, both stored next to the source CSV.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::{HandlerContext, RequestHandler, RESULT_VAR};
use crate::engine::{Engine, StatementBuilder};
use crate::error::AnalysisError;
use crate::request::{AnalysisKind, AnalysisReply, AnalysisRequest, Arguments};

const CONVERT_FUNCTION: &str = "convertCSV2NetCDF";

/// Result key for the flux NetCDF location.
pub const OBS_FLUX: &str = "obsFlux";
/// Result key for the meteorological NetCDF location.
pub const OBS_MET: &str = "obsMet";

const CALL_ARGS: [&str; 10] = [
    "obsCSV",
    "obsFlux",
    "obsMet",
    "userName",
    "dataSetName",
    "dataSetVersionName",
    "longitude",
    "latitude",
    "elevation",
    "towerHeight",
];

/// Handler for `CVS2NETCDF` requests.
#[derive(Debug, Clone)]
pub struct Csv2NetCdfHandler {
    context: HandlerContext,
}

impl Csv2NetCdfHandler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl RequestHandler for Csv2NetCdfHandler {
    async fn run(
        &self,
        engine: &mut dyn Engine,
        request: &AnalysisRequest,
        _kind: &AnalysisKind,
    ) -> Result<AnalysisReply, AnalysisError> {
        let args = Arguments::new(request.arguments());
        let obs_csv = args.url("obsCSV")?;
        let user_name = args.string("userName")?;
        let data_set_name = args.string("dataSetName")?;
        let data_set_version_name = args.string("dataSetVersionName")?;
        let longitude = args.number("longitude")?;
        let latitude = args.number("latitude")?;
        let elevation = args.number("elevation")?;
        let tower_height = args.number("towerHeight")?;

        let remote = self.context.resolve(&obs_csv)?;

        let id = request.id();
        let staging = self.context.staging();
        let input = staging.input_path(id, ".csv");
        let flux = staging.output_path(id, ".flux.nc");
        let met = staging.output_path(id, ".met.nc");

        self.context
            .fetch_input(remote.as_ref(), &obs_csv, &input)
            .await?;

        let statements = StatementBuilder::new()
            .library(self.context.api_package())
            .assign_path("obsCSV", &input)
            .assign_path("obsFlux", &flux)
            .assign_path("obsMet", &met)
            .assign_str("userName", user_name)
            .assign_str("dataSetName", data_set_name)
            .assign_str("dataSetVersionName", data_set_version_name)
            .assign_num("longitude", longitude)
            .assign_num("latitude", latitude)
            .assign_num("elevation", elevation)
            .assign_num("towerHeight", tower_height)
            .call(RESULT_VAR, CONVERT_FUNCTION, &CALL_ARGS)
            .build();
        engine.evaluate_all(&statements).await?;

        let flux_url = self
            .context
            .store_output(remote.as_ref(), &obs_csv, &flux, &format!("{}.flux.nc", id))
            .await?;
        let met_url = self
            .context
            .store_output(remote.as_ref(), &obs_csv, &met, &format!("{}.met.nc", id))
            .await?;

        self.context
            .cleanup(
                remote.as_ref(),
                &[input.as_path(), flux.as_path(), met.as_path()],
                &[&flux_url, &met_url],
            )
            .await?;

        info!(request_id = %id, flux = %flux_url, met = %met_url, "Converted CSV to NetCDF");

        let mut results = HashMap::new();
        results.insert(OBS_FLUX.to_string(), Value::String(flux_url.to_string()));
        results.insert(OBS_MET.to_string(), Value::String(met_url.to_string()));
        Ok(AnalysisReply::normal(id, results))
    }
}
