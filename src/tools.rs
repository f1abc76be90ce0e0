//! Tool invocation seam.
//!
//! The model requests a tool with a `[tool:NAME ARGS]BODY[/tool]` span. The
//! dispatcher hands the parsed invocation to a [`ToolExecutor`] and appends
//! whatever it returns to thread history as a tool turn, so the next
//! generation can see the result.

use crate::ThreadId;
use crate::error::Result;

use serde::{Deserialize, Serialize};

/// A completed tool span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    /// Everything after the name inside the opening tag, trimmed.
    pub args: String,
    pub body: String,
}

impl std::fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} {}", self.name, self.args)
        }
    }
}

#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync + 'static {
    /// Run the tool and return its textual result.
    async fn execute(&self, thread_id: &ThreadId, invocation: &ToolInvocation) -> Result<String>;
}

/// Executor that answers every invocation by echoing it back. Used by the
/// console binary so tool spans have a visible effect without side effects.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoTools;

#[async_trait::async_trait]
impl ToolExecutor for EchoTools {
    async fn execute(&self, _thread_id: &ThreadId, invocation: &ToolInvocation) -> Result<String> {
        Ok(format!("{invocation} -> {}", invocation.body))
    }
}
