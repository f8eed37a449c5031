//! Analysis kinds and routing rules.
//!
//! Singleton kinds are matched exactly. The three plot families are matched
//! by case-sensitive prefix, in the order observed, model output, benchmark;
//! the remainder of the name after the prefix selects a variant inside the
//! family handler. Exact matches are always tried before prefixes.

use std::fmt;

/// Name of the CSV to NetCDF conversion.
pub const CSV2NETCDF: &str = "CVS2NETCDF";
/// Name of the quality-control plot analysis.
pub const QCPLOT: &str = "QCPLOT";
/// Name of the empirical benchmark analysis.
pub const EMPBENCH: &str = "EMPBENCH";

/// Prefix of observed-data plot analyses.
pub const OBS_PREFIX: &str = "OBS";
/// Prefix of model-output plot analyses.
pub const MODEL_PREFIX: &str = "MODEL";
/// Prefix of benchmark plot analyses.
pub const BENCH_PREFIX: &str = "BENCH";

/// Plot family selected by prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlotFamily {
    Observed,
    ModelOutput,
    Benchmark,
}

impl PlotFamily {
    /// Families in matching priority order.
    pub const ALL: [PlotFamily; 3] = [
        PlotFamily::Observed,
        PlotFamily::ModelOutput,
        PlotFamily::Benchmark,
    ];

    /// Returns the name prefix of this family.
    pub fn prefix(&self) -> &'static str {
        match self {
            PlotFamily::Observed => OBS_PREFIX,
            PlotFamily::ModelOutput => MODEL_PREFIX,
            PlotFamily::Benchmark => BENCH_PREFIX,
        }
    }
}

impl fmt::Display for PlotFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlotFamily::Observed => write!(f, "observed"),
            PlotFamily::ModelOutput => write!(f, "model_output"),
            PlotFamily::Benchmark => write!(f, "benchmark"),
        }
    }
}

/// A parsed analysis kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisKind {
    Csv2NetCdf,
    QcPlot,
    EmpBenchmark,
    Plot { family: PlotFamily, variant: String },
}

impl AnalysisKind {
    /// Parses an analysis name. Returns `None` for unrecognized names.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            CSV2NETCDF => return Some(AnalysisKind::Csv2NetCdf),
            QCPLOT => return Some(AnalysisKind::QcPlot),
            EMPBENCH => return Some(AnalysisKind::EmpBenchmark),
            _ => {}
        }

        PlotFamily::ALL.iter().find_map(|family| {
            name.strip_prefix(family.prefix())
                .map(|variant| AnalysisKind::Plot {
                    family: *family,
                    variant: variant.to_string(),
                })
        })
    }

    /// Returns the wire name of this kind.
    pub fn name(&self) -> String {
        match self {
            AnalysisKind::Csv2NetCdf => CSV2NETCDF.to_string(),
            AnalysisKind::QcPlot => QCPLOT.to_string(),
            AnalysisKind::EmpBenchmark => EMPBENCH.to_string(),
            AnalysisKind::Plot { family, variant } => format!("{}{}", family.prefix(), variant),
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_kinds() {
        assert_eq!(AnalysisKind::parse("CVS2NETCDF"), Some(AnalysisKind::Csv2NetCdf));
        assert_eq!(AnalysisKind::parse("QCPLOT"), Some(AnalysisKind::QcPlot));
        assert_eq!(AnalysisKind::parse("EMPBENCH"), Some(AnalysisKind::EmpBenchmark));
    }

    #[test]
    fn test_family_prefixes_carry_variant() {
        assert_eq!(
            AnalysisKind::parse("OBSAnnualCycle"),
            Some(AnalysisKind::Plot {
                family: PlotFamily::Observed,
                variant: "AnnualCycle".to_string()
            })
        );
        assert_eq!(
            AnalysisKind::parse("MODELTaylor"),
            Some(AnalysisKind::Plot {
                family: PlotFamily::ModelOutput,
                variant: "Taylor".to_string()
            })
        );
        assert_eq!(
            AnalysisKind::parse("BENCHScatter"),
            Some(AnalysisKind::Plot {
                family: PlotFamily::Benchmark,
                variant: "Scatter".to_string()
            })
        );
    }

    #[test]
    fn test_bare_prefix_has_empty_variant() {
        assert_eq!(
            AnalysisKind::parse("OBS"),
            Some(AnalysisKind::Plot {
                family: PlotFamily::Observed,
                variant: String::new()
            })
        );
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        assert_eq!(AnalysisKind::parse("cvs2netcdf"), None);
        assert_eq!(AnalysisKind::parse("obsAnnualCycle"), None);
        assert_eq!(AnalysisKind::parse("Model"), None);
    }

    #[test]
    fn test_unknown_kinds() {
        assert_eq!(AnalysisKind::parse(""), None);
        assert_eq!(AnalysisKind::parse("CSV2NETCDF"), None);
        assert_eq!(AnalysisKind::parse("XOBS"), None);
    }

    #[test]
    fn test_family_prefix_must_lead_the_name() {
        // A family name appearing later in the name does not route.
        assert_eq!(AnalysisKind::parse("EMPBENCH"), Some(AnalysisKind::EmpBenchmark));
        assert_eq!(AnalysisKind::parse("EMPBENCHX"), None);
        assert_eq!(AnalysisKind::parse("XOBSAnnualCycle"), None);
        assert_eq!(
            AnalysisKind::parse("BENCHEMP"),
            Some(AnalysisKind::Plot {
                family: PlotFamily::Benchmark,
                variant: "EMP".to_string(),
            })
        );
    }

    #[test]
    fn test_name_round_trips() {
        for name in ["CVS2NETCDF", "QCPLOT", "EMPBENCH", "OBSFoo", "MODELBar", "BENCH"] {
            let kind = AnalysisKind::parse(name).expect("known kind");
            assert_eq!(kind.name(), name);
            assert_eq!(kind.to_string(), name);
        }
    }
}
