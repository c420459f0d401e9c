//! Error types for regridding.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{MaskVariant, Method};

/// The grid pair and method a failing call was working on.
///
/// Carried by every error raised once signatures are known, so that a user
/// can reproduce the failure outside the calling workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegridContext {
    pub source: String,
    pub source_digest: String,
    pub target: String,
    pub target_digest: String,
    pub method: Method,
    pub mask_variant: MaskVariant,
    pub vertical_dim: Option<String>,
}

impl fmt::Display for RegridContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "source={} ({}) target={} ({}) method={} variant={}",
            self.source,
            short(&self.source_digest),
            self.target,
            short(&self.target_digest),
            self.method,
            self.mask_variant,
        )?;
        if let Some(dim) = &self.vertical_dim {
            write!(f, " levels={}", dim)?;
        }
        Ok(())
    }
}

fn short(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

fn with_context(context: &Option<Box<RegridContext>>) -> String {
    match context {
        Some(ctx) => format!(" [{}]", ctx),
        None => String::new(),
    }
}

/// Errors that can occur while resolving grids, caching weights or regridding.
#[derive(Error, Debug, Clone)]
pub enum RegridError {
    /// The logical grid name has no registered definition.
    #[error("unknown grid '{0}'")]
    UnknownGrid(String),

    /// A path template references a parameter missing from the context.
    #[error("cannot resolve path template for grid '{grid}': parameter '{parameter}' is not set")]
    TemplateResolution { grid: String, parameter: String },

    /// The external weight generator failed.
    #[error("weight generation failed [{context}]: {message}")]
    WeightGeneration {
        context: Box<RegridContext>,
        message: String,
    },

    /// A promoted cache entry failed its structural check.
    #[error("corrupt cache entry {path:?} [{context}]: {reason}")]
    CacheCorruption {
        context: Box<RegridContext>,
        path: PathBuf,
        reason: String,
    },

    /// The array's spatial dimensions do not match its grid.
    #[error("grid shape mismatch on '{grid}': {message}{}", with_context(.context))]
    GridShapeMismatch {
        grid: String,
        message: String,
        context: Option<Box<RegridContext>>,
    },

    /// Raised only when a caller asks for ambiguity warnings to be fatal.
    #[error("ambiguous vertical selection for '{variable}' [{context}]: {message}")]
    AmbiguousVerticalSelection {
        variable: String,
        context: Box<RegridContext>,
        message: String,
    },

    /// Unrecognised interpolation method name.
    #[error("invalid interpolation method '{0}'")]
    InvalidMethod(String),

    /// A field was constructed or sliced inconsistently.
    #[error("invalid field: {0}")]
    InvalidField(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage/IO error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Metadata parsing error.
    #[error("metadata error: {0}")]
    Metadata(String),
}

impl RegridError {
    /// Create a Config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an InvalidField error.
    pub fn invalid_field(msg: impl Into<String>) -> Self {
        Self::InvalidField(msg.into())
    }

    /// Create a WeightGeneration error.
    pub fn weight_generation(context: &RegridContext, msg: impl Into<String>) -> Self {
        Self::WeightGeneration {
            context: Box::new(context.clone()),
            message: msg.into(),
        }
    }

    /// Create a GridShapeMismatch error.
    pub fn shape_mismatch(
        grid: impl Into<String>,
        msg: impl Into<String>,
        context: Option<&RegridContext>,
    ) -> Self {
        Self::GridShapeMismatch {
            grid: grid.into(),
            message: msg.into(),
            context: context.map(|c| Box::new(c.clone())),
        }
    }

    /// The grid pair and method this error refers to, if known.
    pub fn context(&self) -> Option<&RegridContext> {
        match self {
            Self::WeightGeneration { context, .. }
            | Self::CacheCorruption { context, .. }
            | Self::AmbiguousVerticalSelection { context, .. } => Some(context.as_ref()),
            Self::GridShapeMismatch { context, .. } => context.as_deref(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RegridError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RegridError {
    fn from(err: serde_json::Error) -> Self {
        Self::Metadata(err.to_string())
    }
}

/// Result type for regridding operations.
pub type Result<T> = std::result::Result<T, RegridError>;
