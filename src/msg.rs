//! The framed messages exchanged between a collector and its worker.
//!
//! Frames are single UTF-8 lines: either a fixed literal (`exit`, `next`,
//! `restart`, `done`), a literal with a payload (`do <path-json>`), or one
//! JSON object per line. Every frame matches exactly one variant, by
//! literal value or by the presence of a distinguishing key (`children`,
//! `drvPath`, `error`).

use serde::{Deserialize, Serialize};

use crate::accessor::{Accessor, AccessorPath};
use crate::error::{DrvStreamError, Result};
use crate::job::Drv;

/// Collector to worker.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectMsg {
    /// Shut down cleanly. The collector closes the pipe after sending.
    Exit,
    /// Evaluate the node addressed by this path.
    Do(AccessorPath),
}

impl CollectMsg {
    pub fn to_frame(&self) -> String {
        match self {
            Self::Exit => "exit".to_string(),
            Self::Do(path) => format!("do {}", path.to_json()),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s == "exit" {
            return Ok(Self::Exit);
        }
        if let Some(payload) = s.strip_prefix("do ") {
            return Ok(Self::Do(AccessorPath::parse(payload)?));
        }
        Err(DrvStreamError::Protocol(format!(
            "expecting \"exit\" or \"do\" followed by a path, got: {}",
            s
        )))
    }
}

/// Worker to collector, between jobs.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkMsg {
    /// Ready for another path.
    Next,
    /// Memory threshold exceeded (or clean teardown); the worker is exiting.
    Restart,
    /// Fatal worker failure, typically during initialization.
    Error(ErrorFrame),
}

impl WorkMsg {
    pub fn to_frame(&self) -> String {
        match self {
            Self::Next => "next".to_string(),
            Self::Restart => "restart".to_string(),
            Self::Error(e) => e.to_frame(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "next" => Ok(Self::Next),
            "restart" => Ok(Self::Restart),
            _ => match ErrorFrame::try_parse(s) {
                Some(e) => Ok(Self::Error(e)),
                None => Err(DrvStreamError::Protocol(format!(
                    "expecting \"next\", \"restart\" or an error frame, got: {}",
                    s
                ))),
            },
        }
    }
}

/// Worker to collector, in response to a `do`.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkJob {
    /// A leaf derivation found at (or under) the requested path.
    Drv(DrvFrame),
    /// The requested path is an inner node with these children.
    Children(ChildrenFrame),
    /// End of responses for the current `do`.
    Done,
    /// The requested path failed to evaluate.
    Error(ErrorFrame),
}

impl WorkJob {
    pub fn to_frame(&self) -> String {
        match self {
            Self::Drv(d) => d.to_frame(),
            Self::Children(c) => c.to_frame(),
            Self::Done => "done".to_string(),
            Self::Error(e) => e.to_frame(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        if s == "done" {
            return Ok(Self::Done);
        }

        let value: serde_json::Value = serde_json::from_str(s).map_err(|_| {
            DrvStreamError::Protocol(format!("could not parse a job response frame: {}", s))
        })?;
        let obj = value.as_object().ok_or_else(|| {
            DrvStreamError::Protocol(format!("expected a json object frame, got: {}", s))
        })?;

        if obj.contains_key("children") {
            let frame = serde_json::from_value(value)
                .map_err(|e| DrvStreamError::Protocol(format!("bad children frame: {}", e)))?;
            Ok(Self::Children(frame))
        } else if obj.contains_key("drvPath") {
            let frame = serde_json::from_value(value)
                .map_err(|e| DrvStreamError::Protocol(format!("bad derivation frame: {}", e)))?;
            Ok(Self::Drv(frame))
        } else if obj.contains_key("error") {
            let frame = serde_json::from_value(value)
                .map_err(|e| DrvStreamError::Protocol(format!("bad error frame: {}", e)))?;
            Ok(Self::Error(frame))
        } else {
            Err(DrvStreamError::Protocol(format!(
                "unrecognized job response frame: {}",
                s
            )))
        }
    }
}

/// A leaf derivation result, tagged with the path it was found at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrvFrame {
    #[serde(flatten)]
    pub drv: Drv,
    pub path: AccessorPath,
}

impl DrvFrame {
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).expect("drv frame serialization cannot fail")
    }
}

/// An inner-node result: the children of `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildrenFrame {
    pub path: AccessorPath,
    pub children: Vec<Accessor>,
}

impl ChildrenFrame {
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).expect("children frame serialization cannot fail")
    }
}

/// A failure report. With a path it is a per-path evaluation failure and
/// the run continues; without one (worker initialization) it is fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<AccessorPath>,
}

impl ErrorFrame {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            path: None,
        }
    }

    pub fn at(error: impl Into<String>, path: AccessorPath) -> Self {
        Self {
            error: error.into(),
            path: Some(path),
        }
    }

    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).expect("error frame serialization cannot fail")
    }

    fn try_parse(s: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(s).ok()?;
        value.get("error")?;
        serde_json::from_value(value).ok()
    }
}
