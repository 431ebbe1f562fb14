use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

use super::Remediator;
use crate::worker::{AgentInvoker, InvocationRequest};

/// Asks the agent to fix failing items and reads its `<resolved>` claim.
pub struct AgentRemediator {
    invoker: Arc<dyn AgentInvoker>,
    base: InvocationRequest,
}

impl AgentRemediator {
    /// `base` supplies the workspace and identity; its prompt is the task
    /// context prepended to each remediation request.
    pub fn new(invoker: Arc<dyn AgentInvoker>, base: InvocationRequest) -> Self {
        Self { invoker, base }
    }

    fn prompt(&self, failing: &[String]) -> String {
        let mut prompt = String::new();
        if !self.base.prompt.is_empty() {
            prompt.push_str(&self.base.prompt);
            prompt.push_str("\n\n");
        }
        prompt.push_str("The following checks are failing:\n");
        for item in failing {
            prompt.push_str("- ");
            prompt.push_str(item);
            prompt.push('\n');
        }
        prompt.push_str(
            "\nFix as many as you can. When done, report how many you fixed as \
             <resolved>N</resolved>.\n",
        );
        prompt
    }
}

#[async_trait]
impl Remediator for AgentRemediator {
    async fn remediate(&self, failing: &[String]) -> Result<u32> {
        let request = InvocationRequest {
            prompt: self.prompt(failing),
            ..self.base.clone()
        };
        let output = self.invoker.invoke(&request).await?;
        if !output.success {
            warn!(task_id = request.task_id, "Remediation worker failed; counting no fixes");
            return Ok(0);
        }
        Ok(output.resolved.unwrap_or(0))
    }
}
