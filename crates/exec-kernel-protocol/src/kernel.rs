//! The embedded execution kernel's `shell`/`iopub` serving loop (§4.4).

use serde_json::json;

use crate::interpreter::Interpreter;
use crate::message::Message;
use crate::socket::{HeartbeatChannel, MessageChannel};
use crate::ExecKernelError;

pub struct ExecutionKernel {
    interpreter: Interpreter,
    execution_count: u64,
    session_key: Vec<u8>,
}

impl ExecutionKernel {
    pub fn new(session_key: Vec<u8>) -> Self {
        ExecutionKernel {
            interpreter: Interpreter::new(),
            execution_count: 0,
            session_key,
        }
    }

    /// Serve `shell`/`iopub`/`hb` until a channel closes (the paired
    /// Connection disconnected, or the worker is shutting down).
    pub async fn run(
        mut self,
        mut shell: MessageChannel,
        mut iopub: MessageChannel,
        mut hb: HeartbeatChannel,
    ) -> Result<(), ExecKernelError> {
        loop {
            tokio::select! {
                request = shell.recv(&self.session_key) => {
                    match request {
                        Some(Ok(request)) => self.handle_shell(request, &mut shell, &mut iopub).await?,
                        Some(Err(e)) => tracing::warn!(error = %e, "bad shell message"),
                        None => return Ok(()),
                    }
                }
                ping = hb.recv() => {
                    match ping {
                        Some(Ok(payload)) => hb.send(payload).await?,
                        Some(Err(e)) => tracing::warn!(error = %e, "bad heartbeat frame"),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn handle_shell(
        &mut self,
        request: Message,
        shell: &mut MessageChannel,
        iopub: &mut MessageChannel,
    ) -> Result<(), ExecKernelError> {
        if request.header.msg_type != "execute_request" {
            return Ok(());
        }

        let code = request
            .content
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_owned();

        iopub
            .send(
                &request.reply("status", json!({"execution_state": "busy"})),
                &self.session_key,
            )
            .await?;

        self.execution_count += 1;

        match self.interpreter.run(&code) {
            Ok(lines) => {
                for line in lines {
                    iopub
                        .send(
                            &request.reply(
                                "stream",
                                json!({"name": "stdout", "text": format!("{line}\n")}),
                            ),
                            &self.session_key,
                        )
                        .await?;
                }
                shell
                    .send(
                        &request.reply(
                            "execute_reply",
                            json!({"status": "ok", "execution_count": self.execution_count}),
                        ),
                        &self.session_key,
                    )
                    .await?;
            }
            Err(e) => {
                iopub
                    .send(
                        &request.reply(
                            "error",
                            json!({"ename": "Error", "evalue": e.to_string(), "traceback": vec![e.to_string()]}),
                        ),
                        &self.session_key,
                    )
                    .await?;
                shell
                    .send(
                        &request.reply(
                            "execute_reply",
                            json!({"status": "error", "execution_count": self.execution_count}),
                        ),
                        &self.session_key,
                    )
                    .await?;
            }
        }

        iopub
            .send(
                &request.reply("status", json!({"execution_state": "idle"})),
                &self.session_key,
            )
            .await?;

        Ok(())
    }
}
