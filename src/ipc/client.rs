// src/ipc/client.rs
//! IPC client
//!
//! Replies come back in request order; events that arrive while waiting
//! for a reply are buffered and handed out by [`IpcClient::next_event`].

use crate::controller::{TaskId, TaskInfo};
use crate::ipc::protocol::{self, Request, ServerMessage, SourceSpec, MAX_FRAME_LEN};
use crate::runtime::ExecutionConfig;
use crate::utils::errors::{EngineError, Result};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LinesCodec};

pub struct IpcClient<S> {
    framed: Framed<S, LinesCodec>,
    events: VecDeque<ServerMessage>,
}

impl IpcClient<TcpStream> {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }
}

impl<S> IpcClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
            events: VecDeque::new(),
        }
    }

    /// Send a request and wait for its reply
    pub async fn call(&mut self, request: Request) -> Result<ServerMessage> {
        self.framed
            .send(protocol::encode(&request)?)
            .await
            .map_err(|e| EngineError::Ipc(e.to_string()))?;

        loop {
            let message = self
                .read()
                .await?
                .ok_or_else(|| EngineError::Ipc("connection closed before reply".into()))?;
            if message.is_reply() {
                return Ok(message);
            }
            self.events.push_back(message);
        }
    }

    /// Next log or task event; `None` once the server hangs up
    pub async fn next_event(&mut self) -> Result<Option<ServerMessage>> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        loop {
            match self.read().await? {
                Some(message) if message.is_reply() => {
                    tracing::warn!("Dropping unsolicited reply: {:?}", message);
                }
                other => return Ok(other),
            }
        }
    }

    pub async fn run(&mut self, source: SourceSpec, config: ExecutionConfig) -> Result<TaskInfo> {
        match self.call(Request::Run { source, config }).await? {
            ServerMessage::Submitted { task } => Ok(task),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stop(&mut self, task_id: TaskId) -> Result<bool> {
        match self.call(Request::Stop { task_id }).await? {
            ServerMessage::Stopped { issued, .. } => Ok(issued),
            other => Err(unexpected(other)),
        }
    }

    pub async fn tasks(&mut self) -> Result<Vec<TaskInfo>> {
        match self.call(Request::ListTasks).await? {
            ServerMessage::Tasks { tasks } => Ok(tasks),
            other => Err(unexpected(other)),
        }
    }

    /// Read events until `task_id` reaches a terminal state
    pub async fn wait_for(&mut self, task_id: TaskId) -> Result<TaskInfo> {
        while let Some(message) = self.next_event().await? {
            if let ServerMessage::TaskEvent { event } = message {
                if event.task.id == task_id && event.state.is_terminal() {
                    return Ok(event.task);
                }
            }
        }
        Err(EngineError::Ipc("connection closed".into()))
    }

    async fn read(&mut self) -> Result<Option<ServerMessage>> {
        match self.framed.next().await {
            Some(Ok(line)) => Ok(Some(protocol::decode(&line)?)),
            Some(Err(e)) => Err(EngineError::Ipc(e.to_string())),
            None => Ok(None),
        }
    }
}

fn unexpected(message: ServerMessage) -> EngineError {
    match message {
        ServerMessage::Error { message } => EngineError::Ipc(message),
        other => EngineError::Ipc(format!("unexpected reply: {:?}", other)),
    }
}
