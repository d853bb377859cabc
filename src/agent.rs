//! Bounded multi-step tool-invocation loop.
//!
//! One request = one workspace scope + at most [`MAX_TOOL_STEPS`] tool-call
//! round trips. Each round trip streams model output to the caller; when the
//! model requests a `runPython` invocation, the loop synchronously chains
//! validate -> execute -> collect and feeds the structured result back as
//! the tool's result before asking for the next step. Steps are strictly
//! sequential: a second execution never starts before the first has fully
//! returned, because its result is part of the context for the next model
//! decision.

use crate::artifacts;
use crate::errors::{AnalystError, Result};
use crate::executor::{ExecutionResult, PythonExecutor};
use crate::llm::{ChatMessage, ChatProvider, ChatRequest, StreamEvent, ToolDefinition};
use crate::profile::SecurityProfile;
use crate::validator;
use crate::workspace::{self, Workspace};
use base64::Engine as _;
use futures::StreamExt;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

/// Hard cap on tool-call round trips within one user turn.
pub const MAX_TOOL_STEPS: usize = 10;

/// Name of the single tool declared to the model.
pub const TOOL_NAME: &str = "runPython";

const MAX_TOKENS: u32 = 4096;

const SYSTEM_PROMPT: &str = "You are a Python Data Analyst assistant. You help users analyze data by writing and executing Python code.

When the user provides a dataset, it will be available as a file named 'data.csv' in the current directory.

Guidelines:
- Write clear, well-commented Python code
- Use pandas for data manipulation
- Use matplotlib or seaborn for visualizations
- Save any generated charts as .png files (e.g., plt.savefig('chart.png'))
- Print results and insights to stdout
- Handle errors gracefully

Available libraries: pandas, matplotlib, numpy, seaborn (standard data science stack)

When generating visualizations:
1. Create informative titles and labels
2. Use appropriate chart types for the data
3. Save figures with plt.savefig() before plt.show()
4. Close figures with plt.close() after saving to free memory";

const TOOL_DESCRIPTION: &str = "Run Python code to analyze data. A file named \"data.csv\" may be available in the current directory if the user uploaded a dataset.";

/// One emission of the loop: streamed assistant text, or a finished tool
/// step.
#[derive(Debug)]
pub enum AgentEvent {
    TextDelta(String),
    ToolStep(ToolStepRecord),
}

/// One request/response pair in the invocation loop.
#[derive(Debug)]
pub struct ToolStepRecord {
    /// 1-based position in the turn's append-only step sequence.
    pub index: usize,
    pub code: String,
    pub result: ExecutionResult,
}

/// Drives the model capability and the sandbox pipeline for one turn at a
/// time. Shared read-only across requests.
pub struct ToolInvocationLoop {
    provider: Arc<dyn ChatProvider>,
    executor: Arc<PythonExecutor>,
    profile: SecurityProfile,
    workspace_base: PathBuf,
}

impl ToolInvocationLoop {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        executor: Arc<PythonExecutor>,
        profile: SecurityProfile,
    ) -> Self {
        Self {
            provider,
            executor,
            profile,
            workspace_base: workspace::default_base(),
        }
    }

    /// Override the workspace base root.
    pub fn with_workspace_base(mut self, base: PathBuf) -> Self {
        self.workspace_base = base;
        self
    }

    /// Run one user turn. The returned stream yields text deltas and tool
    /// steps; dropping it cancels the turn, kills any in-flight child, and
    /// tears the workspace down.
    pub fn run(
        self: Arc<Self>,
        messages: Vec<ChatMessage>,
        dataset: Option<String>,
    ) -> ReceiverStream<Result<AgentEvent>> {
        let (tx, rx) = mpsc::channel(32);
        let this = self;
        tokio::spawn(async move {
            if let Err(e) = this.drive(messages, dataset, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        ReceiverStream::new(rx)
    }

    async fn drive(
        &self,
        mut messages: Vec<ChatMessage>,
        dataset: Option<String>,
        tx: &mpsc::Sender<Result<AgentEvent>>,
    ) -> Result<()> {
        // Workspace lifetime covers every exit path below; Drop removes it.
        let mut ws = Workspace::create(&self.workspace_base)?;
        if let Some(data) = dataset {
            ws.write_dataset(data.as_bytes())?;
        }

        let mut steps = 0usize;
        loop {
            // Once the bound is reached the model is offered no tools,
            // forcing a text-only closing turn.
            let tools = if steps < MAX_TOOL_STEPS {
                vec![tool_definition()]
            } else {
                Vec::new()
            };
            let request = ChatRequest {
                system: SYSTEM_PROMPT.to_string(),
                messages: messages.clone(),
                tools,
                max_tokens: MAX_TOKENS,
            };

            let mut stream = self.provider.stream(request).await?;
            let mut turn = None;
            while let Some(event) = stream.next().await {
                match event? {
                    StreamEvent::TextDelta(delta) => {
                        if tx.send(Ok(AgentEvent::TextDelta(delta))).await.is_err() {
                            // Caller went away: cancel the turn.
                            return Ok(());
                        }
                    }
                    StreamEvent::Completed(t) => turn = Some(t),
                }
            }
            let turn = turn.ok_or_else(|| {
                AnalystError::Upstream("stream ended without a completed turn".to_string())
            })?;

            if turn.tool_calls.is_empty() || steps >= MAX_TOOL_STEPS {
                info!("turn finished after {steps} tool step(s)");
                return Ok(());
            }

            let calls = turn.tool_calls.clone();
            messages.push(turn.into_message());

            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                steps += 1;
                let code = call
                    .input
                    .get("code")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string();
                let result = self.run_code(&ws, &code).await;
                let payload = tool_result_json(&result).to_string();
                let record = ToolStepRecord {
                    index: steps,
                    code,
                    result,
                };
                if tx.send(Ok(AgentEvent::ToolStep(record))).await.is_err() {
                    return Ok(());
                }
                results.push((call.id, payload));
            }
            messages.push(ChatMessage::tool_results(results));
        }
    }

    /// The per-step pipeline: validate -> execute -> collect, in order. The
    /// validator runs before any workspace or process resource is touched
    /// for this step; artifacts are collected only on completion.
    pub async fn run_code(&self, ws: &Workspace, code: &str) -> ExecutionResult {
        if let Err(reason) = validator::validate(code) {
            return ExecutionResult::Rejected { reason };
        }
        match self.executor.execute(ws, code, &self.profile).await {
            ExecutionResult::Completed { logs, stderr, .. } => {
                let images = artifacts::collect(ws);
                ExecutionResult::Completed {
                    logs,
                    stderr,
                    images,
                }
            }
            other => other,
        }
    }
}

fn tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: TOOL_NAME.to_string(),
        description: TOOL_DESCRIPTION.to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The Python code to execute"
                }
            },
            "required": ["code"]
        }),
    }
}

/// Serialize an execution outcome as the tool result fed back to the model.
/// Image bytes are base64-encoded here, at the transport boundary.
pub fn tool_result_json(result: &ExecutionResult) -> Value {
    match result {
        ExecutionResult::Rejected { reason } => json!({
            "error": reason,
            "logs": "",
            "images": [],
        }),
        ExecutionResult::Completed {
            logs,
            stderr,
            images,
        } => {
            let images: Vec<Value> = images
                .iter()
                .map(|image| {
                    json!({
                        "filename": image.filename,
                        "base64": base64::engine::general_purpose::STANDARD.encode(&image.bytes),
                    })
                })
                .collect();
            let mut value = json!({
                "logs": if logs.is_empty() { "(No output)" } else { logs.as_str() },
                "images": images,
            });
            if let Some(stderr) = stderr {
                value["errors"] = json!(stderr);
            }
            value
        }
        ExecutionResult::Failed { error, logs } => json!({
            "error": error,
            "logs": logs,
            "images": [],
        }),
    }
}
