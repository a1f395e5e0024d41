//! Terminal outcome of analyzing one package

use std::fmt;

use serde::Serialize;

use crate::error::AnalysisError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Benign,
    Malicious,
    Timeout,
    IngestionError,
    ManifestMissing,
    CodeMissing,
    EmptyPackage,
    NoSourceFiles,
    SyntacticError,
    Obfuscated,
    ExternalServiceError,
    ProgramError,
}

impl Status {
    pub const ALL: [Status; 12] = [
        Status::Benign,
        Status::Malicious,
        Status::Timeout,
        Status::IngestionError,
        Status::ManifestMissing,
        Status::CodeMissing,
        Status::EmptyPackage,
        Status::NoSourceFiles,
        Status::SyntacticError,
        Status::Obfuscated,
        Status::ExternalServiceError,
        Status::ProgramError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Benign => "benign",
            Status::Malicious => "malicious",
            Status::Timeout => "timeout",
            Status::IngestionError => "ingestion-error",
            Status::ManifestMissing => "manifest-missing",
            Status::CodeMissing => "code-missing",
            Status::EmptyPackage => "empty-package",
            Status::NoSourceFiles => "no-source-files",
            Status::SyntacticError => "syntactic-error",
            Status::Obfuscated => "obfuscated",
            Status::ExternalServiceError => "external-service-error",
            Status::ProgramError => "program-error",
        }
    }

    /// Process exit code. `0` and `1` keep their usual meaning for scripts
    /// that only care about the verdict.
    pub fn exit_code(&self) -> i32 {
        match self {
            Status::Benign => 0,
            Status::Malicious => 1,
            Status::Timeout => 10,
            Status::IngestionError => 11,
            Status::ManifestMissing => 12,
            Status::CodeMissing => 13,
            Status::EmptyPackage => 14,
            Status::NoSourceFiles => 15,
            Status::SyntacticError => 16,
            Status::Obfuscated => 17,
            Status::ExternalServiceError => 18,
            Status::ProgramError => 19,
        }
    }

    /// Both verdicts that flag a package.
    pub fn is_flagged(&self) -> bool {
        matches!(self, Status::Malicious | Status::Obfuscated)
    }

    pub fn from_verdict(malicious: bool) -> Self {
        if malicious {
            Status::Malicious
        } else {
            Status::Benign
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&AnalysisError> for Status {
    fn from(err: &AnalysisError) -> Self {
        match err {
            AnalysisError::MissingExport { .. } | AnalysisError::InvalidExport { .. } => {
                Status::IngestionError
            }
            AnalysisError::ManifestMissing { .. } | AnalysisError::InvalidManifest { .. } => {
                Status::ManifestMissing
            }
            AnalysisError::Timeout(_) => Status::Timeout,
            AnalysisError::Service(_) => Status::ExternalServiceError,
            AnalysisError::Io { .. } | AnalysisError::Report(_) => Status::ProgramError,
        }
    }
}
