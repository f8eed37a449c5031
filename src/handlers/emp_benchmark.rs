//! Empirical benchmark analysis. Not available yet: every request is
//! answered with an `ERROR` reply without touching the engine session.

use tracing::warn;

use crate::error::AnalysisError;
use crate::request::kind::EMPBENCH;
use crate::request::{AnalysisReply, AnalysisRequest};

/// Handler for `EMPBENCH` requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmpBenchmarkHandler;

impl EmpBenchmarkHandler {
    pub fn new() -> Self {
        Self
    }

    /// Builds the `ERROR` reply.
    pub fn reply(&self, request: &AnalysisRequest) -> AnalysisReply {
        let error = AnalysisError::NotImplemented(EMPBENCH.to_string());
        warn!(request_id = %request.id(), error = %error, "Analysis not available");
        AnalysisReply::from_error(request, &error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ReplyStatus;

    #[test]
    fn test_empirical_benchmark_is_an_error_reply() {
        let request = AnalysisRequest::new("EMPBENCH").with_argument("obsNC", "file:///tmp/o.nc");

        let reply = EmpBenchmarkHandler::new().reply(&request);

        assert_eq!(reply.status(), ReplyStatus::Error);
        assert_eq!(reply.request_id(), request.id());
        assert!(reply.error_message().expect("diagnostic").contains("EMPBENCH"));
    }
}
