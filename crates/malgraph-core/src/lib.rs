//! Behavior-graph analysis of npm packages.
//!
//! Graph exports of a package are stitched into a whole-package behavior
//! graph, reduced to its sensitive API calls and matched against a library
//! of malicious behavior patterns.

pub mod behavior;
pub mod builder;
pub mod category;
pub mod config;
pub mod cpg;
pub mod deadline;
pub mod dot;
pub mod error;
pub mod knowledge;
pub mod manifest;
pub mod matcher;
pub mod oracle;
pub mod package;
pub mod pattern;
pub mod pdg;
pub mod probe;
pub mod refine;
pub mod report;
pub mod scope;
pub mod sensitive;
pub mod sources;
pub mod status;
pub mod syntax;

pub use error::{AnalysisError, Result, ServiceError};
pub use package::{AnalysisOptions, Outcome, PackageAnalyzer, Workspace};
pub use report::{Phase, Report};
pub use status::Status;
