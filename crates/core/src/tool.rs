//! Tool catalogue, executor trait, and the startup-validated registry.
//!
//! Every tool identifier the platform understands is listed once in the
//! [`ToolName`] table below. A [`ToolRegistry`] can only be built when each
//! of them has a handler, so an unknown or unwired tool is a startup failure
//! instead of a runtime surprise.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::CoreError;
use crate::job::JobResult;
use crate::types::JobId;

macro_rules! define_tools {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $variant:ident => $id:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $( $variant ),+
        }

        impl $name {
            /// Every known tool, in catalogue order.
            pub const ALL: &'static [$name] = &[ $( $name::$variant ),+ ];

            /// The wire identifier, e.g. `"extract-text"`.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $id ),+
                }
            }
        }
    };
}

define_tools! {
    /// Document tools that can be submitted as jobs.
    ToolName {
        Merge => "merge",
        Split => "split",
        Compress => "compress",
        Rotate => "rotate",
        Watermark => "watermark",
        Encrypt => "encrypt",
        Decrypt => "decrypt",
        ExtractText => "extract-text",
        ExtractImages => "extract-images",
        ExtractMetadata => "extract-metadata",
        AddPageNumbers => "add-page-numbers",
        RemovePages => "remove-pages",
        CropPages => "crop-pages",
        ResizePages => "resize-pages",
        ReorderPages => "reorder-pages",
        InsertPages => "insert-pages",
        ExtractPages => "extract-pages",
        DeletePages => "delete-pages",
        AddBlankPage => "add-blank-page",
        PdfToImage => "pdf-to-image",
        ImageToPdf => "image-to-pdf",
        PdfToText => "pdf-to-text",
        TextToPdf => "text-to-pdf",
        PdfToWord => "pdf-to-word",
        PdfToExcel => "pdf-to-excel",
        PdfToPpt => "pdf-to-ppt",
        PdfToHtml => "pdf-to-html",
        WordToPdf => "word-to-pdf",
        ExcelToPdf => "excel-to-pdf",
        PptToPdf => "ppt-to-pdf",
        HtmlToPdf => "html-to-pdf",
        MarkdownToPdf => "markdown-to-pdf",
        TxtToPdf => "txt-to-pdf",
        CsvToPdf => "csv-to-pdf",
        JsonToPdf => "json-to-pdf",
        OcrPdf => "ocr-pdf",
        ComparePdfs => "compare-pdfs",
        PdfaConvert => "pdfa-convert",
        Linearize => "linearize",
        Optimize => "optimize",
        MetadataEdit => "metadata-edit",
        SignPdf => "sign-pdf",
        VerifySignature => "verify-signature",
        RedactPdf => "redact-pdf",
        FlattenPdf => "flatten-pdf",
        RepairPdf => "repair-pdf",
        SplitByBookmarks => "split-by-bookmarks",
        SplitBySize => "split-by-size",
        AutoRotate => "auto-rotate",
        AutoCrop => "auto-crop",
        ValidatePdf => "validate-pdf",
        SanitizePdf => "sanitize-pdf",
        AnalyzeHiddenData => "analyze-hidden-data",
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|tool| tool.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| CoreError::Validation(format!("Unknown tool '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Executor contract
// ---------------------------------------------------------------------------

/// Everything a tool needs to process one job.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub job_id: JobId,
    pub tool: ToolName,
    pub input_ref: String,
    pub parameters: serde_json::Value,
}

/// Errors a tool executor can report.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The executor observed its cancel token and stopped.
    #[error("Cancelled")]
    Cancelled,

    /// A subprocess exceeded its deadline and was killed.
    #[error("Timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Any other failure, tagged with the underlying cause's kind.
    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Receives progress reports from a running tool.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Report progress in percent (clamped by the receiver) plus a short
    /// human-readable stage description.
    async fn report(&self, percent: u8, message: &str);
}

/// A document transformation.
///
/// Implementations must poll `cancel` at safe checkpoints and release their
/// own resources (temp files, child processes) before returning
/// [`ToolError::Cancelled`].
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        request: ToolRequest,
        progress: Arc<dyn ProgressSink>,
        cancel: CancelToken,
    ) -> Result<JobResult, ToolError>;
}

#[cfg(test)]
impl std::fmt::Debug for dyn ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ToolExecutor")
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable mapping from every [`ToolName`] to its executor.
pub struct ToolRegistry {
    handlers: HashMap<ToolName, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    /// Resolve a wire identifier to its tool and executor.
    pub fn resolve(&self, name: &str) -> Result<(ToolName, Arc<dyn ToolExecutor>), CoreError> {
        let tool: ToolName = name.parse()?;
        let executor = self
            .handlers
            .get(&tool)
            .cloned()
            .ok_or_else(|| CoreError::Internal(format!("No handler for tool '{tool}'")))?;
        Ok((tool, executor))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Collects handlers and validates coverage on [`build`](Self::build).
pub struct ToolRegistryBuilder {
    handlers: HashMap<ToolName, Arc<dyn ToolExecutor>>,
}

impl ToolRegistryBuilder {
    pub fn register(mut self, tool: ToolName, executor: Arc<dyn ToolExecutor>) -> Self {
        self.handlers.insert(tool, executor);
        self
    }

    /// Register `executor` for every tool that has no handler yet.
    pub fn register_remaining(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        for tool in ToolName::ALL {
            self.handlers
                .entry(*tool)
                .or_insert_with(|| Arc::clone(&executor));
        }
        self
    }

    /// Fails with a validation error naming every tool without a handler.
    pub fn build(self) -> Result<ToolRegistry, CoreError> {
        let missing: Vec<&str> = ToolName::ALL
            .iter()
            .filter(|tool| !self.handlers.contains_key(tool))
            .map(|tool| tool.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(CoreError::Validation(format!(
                "Tools without a registered handler: {}",
                missing.join(", ")
            )));
        }
        Ok(ToolRegistry {
            handlers: self.handlers,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
