//! Request dispatcher.
//!
//! An [`Analyser`] parses a request's kind, picks the matching handler and
//! hands it the engine session. The session is created on the first routed
//! request and kept until it reports itself unusable, so session startup is
//! paid once per worker rather than once per request.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineFactory};
use crate::error::AnalysisError;
use crate::handlers::{
    Csv2NetCdfHandler, EmpBenchmarkHandler, HandlerContext, PlotHandler, QcPlotHandler,
    RequestHandler,
};
use crate::request::{AnalysisKind, AnalysisReply, AnalysisRequest, PlotFamily};

/// Routes requests to handlers and owns one engine session.
pub struct Analyser {
    engine_factory: Arc<dyn EngineFactory>,
    engine: Option<Box<dyn Engine>>,
    handlers: Handlers,
}

/// One handler per analysis kind.
struct Handlers {
    csv2netcdf: Csv2NetCdfHandler,
    qc_plot: QcPlotHandler,
    emp_benchmark: EmpBenchmarkHandler,
    observed: PlotHandler,
    model_output: PlotHandler,
    benchmark: PlotHandler,
}

impl Handlers {
    fn new(context: HandlerContext) -> Self {
        Self {
            csv2netcdf: Csv2NetCdfHandler::new(context.clone()),
            qc_plot: QcPlotHandler::new(context.clone()),
            emp_benchmark: EmpBenchmarkHandler::new(),
            observed: PlotHandler::new(PlotFamily::Observed, context.clone()),
            model_output: PlotHandler::new(PlotFamily::ModelOutput, context.clone()),
            benchmark: PlotHandler::new(PlotFamily::Benchmark, context),
        }
    }

    /// Returns the engine-driven handler for a kind, or `None` for kinds
    /// answered without an engine session.
    fn handler_for(&self, kind: &AnalysisKind) -> Option<&dyn RequestHandler> {
        match kind {
            AnalysisKind::Csv2NetCdf => Some(&self.csv2netcdf),
            AnalysisKind::QcPlot => Some(&self.qc_plot),
            AnalysisKind::EmpBenchmark => None,
            AnalysisKind::Plot { family, .. } => match family {
                PlotFamily::Observed => Some(&self.observed),
                PlotFamily::ModelOutput => Some(&self.model_output),
                PlotFamily::Benchmark => Some(&self.benchmark),
            },
        }
    }
}

impl Analyser {
    pub fn new(engine_factory: Arc<dyn EngineFactory>, context: HandlerContext) -> Self {
        Self {
            engine_factory,
            engine: None,
            handlers: Handlers::new(context),
        }
    }

    /// Returns true once an engine session has been created and is held.
    pub fn has_engine(&self) -> bool {
        self.engine.is_some()
    }

    /// Analyses one request.
    ///
    /// Fails only when the kind is unrecognized or no engine session can be
    /// created; handler failures are already `ERROR` replies. Kinds without
    /// an engine-driven handler never create a session.
    pub async fn analyse(
        &mut self,
        request: &AnalysisRequest,
    ) -> Result<AnalysisReply, AnalysisError> {
        let kind = AnalysisKind::parse(request.kind())
            .ok_or_else(|| AnalysisError::UnrecognizedAnalysisKind(request.kind().to_string()))?;

        let Some(handler) = self.handlers.handler_for(&kind) else {
            return Ok(self.handlers.emp_benchmark.reply(request));
        };

        let mut engine = match self.engine.take() {
            Some(engine) => engine,
            None => {
                info!("Creating engine session");
                self.engine_factory.create().await?
            }
        };

        debug!(request_id = %request.id(), kind = %kind, "Routing request");
        let reply = handler.handle(engine.as_mut(), request, &kind).await;

        if engine.is_usable() {
            self.engine = Some(engine);
        } else {
            warn!(request_id = %request.id(), "Discarding unusable engine session");
            engine.shutdown().await;
        }

        Ok(reply)
    }

    /// Analyses one request, turning any failure into an `ERROR` reply.
    pub async fn respond(&mut self, request: &AnalysisRequest) -> AnalysisReply {
        match self.analyse(request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    request_id = %request.id(),
                    kind = %request.kind(),
                    error = %e,
                    "Request rejected"
                );
                AnalysisReply::from_error(request, &e)
            }
        }
    }

    /// Ends the engine session, if any.
    pub async fn shutdown(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.shutdown().await;
        }
    }
}

impl std::fmt::Debug for Analyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyser")
            .field("has_engine", &self.has_engine())
            .finish()
    }
}
