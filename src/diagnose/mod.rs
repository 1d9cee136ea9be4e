//! Free-time diagnosis and exit reporting.

pub mod diagnosis;
pub mod report;

pub use diagnosis::{
    CacheLineSummary, CallSiteDiagnosis, ObjectDiagnosis, PageDiagnosis, SharingCause,
};
