// src/ipc/server.rs
//! IPC server
//!
//! Serves one controller to any number of connections. Each connection
//! receives the replies to its own requests plus the global console
//! stream and every task transition.

use crate::console::ConsoleEvent;
use crate::controller::{EngineController, NoopListener, TaskEvent, TaskState};
use crate::ipc::protocol::{self, Request, ServerMessage, MAX_FRAME_LEN};
use crate::utils::errors::{EngineError, Result};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

/// Messages buffered per connection before a non-reading client is dropped
pub const EVENT_BUFFER: usize = 1024;

#[derive(Clone)]
pub struct IpcServer {
    controller: EngineController,
    event_buffer: usize,
}

impl IpcServer {
    pub fn new(controller: EngineController) -> Self {
        Self {
            controller,
            event_buffer: EVENT_BUFFER,
        }
    }

    /// Override the per-connection buffer size
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Accept TCP connections until `shutdown` resolves
    pub async fn serve_tcp(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        info!("IPC server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("IPC server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "IPC client connected");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_connection(stream).await {
                            warn!(%peer, "IPC connection closed with error: {}", e);
                        }
                    });
                }
            }
        }
    }

    /// Serve a single connection until the client hangs up. A client that
    /// stops reading is disconnected once its event buffer is full.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
        let (mut sink, mut lines) = framed.split();
        let (tx, mut rx) = mpsc::channel::<ServerMessage>(self.event_buffer);
        let lagged = Arc::new(Notify::new());

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let line = protocol::encode(&message)?;
                sink.send(line)
                    .await
                    .map_err(|e| EngineError::Ipc(e.to_string()))?;
            }
            Ok::<_, EngineError>(())
        });

        let console_events = EventSender::new(tx.clone(), Arc::clone(&lagged));
        let console_subscription = self.controller.runtime().console().subscribe_fn(move |event| {
            console_events.push(match event {
                ConsoleEvent::Log { entry } => ServerMessage::Log { entry },
                ConsoleEvent::Cleared => ServerMessage::LogCleared,
            });
        });

        // A connected client counts as an input surface for the tasks it sees start
        let task_events = EventSender::new(tx.clone(), Arc::clone(&lagged));
        let controller = self.controller.clone();
        let task_subscription = self.controller.subscribe(Arc::new(move |event: &TaskEvent| {
            if event.state == TaskState::Running {
                if let Ok(console) = controller.task_console(event.task.id) {
                    console.attach_input_surface(true);
                }
            }
            task_events.push(ServerMessage::TaskEvent {
                event: event.clone(),
            });
        }));

        let result = loop {
            let line = tokio::select! {
                next = lines.next() => match next {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => break Err(EngineError::Ipc(e.to_string())),
                    None => break Ok(()),
                },
                _ = lagged.notified() => break Err(slow_client()),
            };
            if line.trim().is_empty() {
                continue;
            }

            let reply = match protocol::decode::<Request>(&line) {
                Ok(request) => self.handle(request),
                Err(e) => ServerMessage::Error {
                    message: format!("Malformed request: {}", e),
                },
            };
            tokio::select! {
                sent = tx.send(reply) => if sent.is_err() {
                    break Ok(());
                },
                _ = lagged.notified() => break Err(slow_client()),
            }
        };

        drop(task_subscription);
        drop(console_subscription);
        drop(tx);
        if result.is_err() {
            writer.abort();
            return result;
        }
        match writer.await {
            Ok(written) => written,
            Err(e) => Err(EngineError::Ipc(format!("writer task failed: {}", e))),
        }
    }

    fn handle(&self, request: Request) -> ServerMessage {
        debug!("IPC request: {:?}", request);
        match request {
            Request::Run { source, config } => {
                let task = self
                    .controller
                    .run_script(source.into(), config, Arc::new(NoopListener));
                ServerMessage::Submitted { task }
            }
            Request::Stop { task_id } => match self.controller.stop(task_id) {
                Ok(issued) => ServerMessage::Stopped { task_id, issued },
                Err(e) => ServerMessage::Error { message: e.to_string() },
            },
            Request::StopAll => ServerMessage::StoppedAll {
                count: self.controller.stop_all_scripts(),
            },
            Request::ListTasks => ServerMessage::Tasks {
                tasks: self.controller.tasks(),
            },
            Request::ClearConsole => {
                self.controller.runtime().console().clear();
                ServerMessage::Ack
            }
            Request::SubmitInput { task_id, text } => self.submit_input(task_id, text),
        }
    }

    /// Hand input to the named task, or to the oldest task waiting for it
    fn submit_input(&self, task_id: Option<u64>, text: String) -> ServerMessage {
        let candidates = match task_id {
            Some(id) => vec![id],
            None => self
                .controller
                .running_tasks()
                .into_iter()
                .map(|task| task.id)
                .collect(),
        };

        let delivered = candidates.into_iter().any(|id| {
            self.controller
                .task_console(id)
                .map(|console| console.submit_input(text.clone()))
                .unwrap_or(false)
        });
        if delivered {
            ServerMessage::Ack
        } else {
            ServerMessage::Error {
                message: "No script is waiting for input".into(),
            }
        }
    }
}

/// Event side of a connection's outbox; flags the connection as lagging
/// instead of blocking the console or the controller
struct EventSender {
    tx: mpsc::Sender<ServerMessage>,
    lagged: Arc<Notify>,
}

impl EventSender {
    fn new(tx: mpsc::Sender<ServerMessage>, lagged: Arc<Notify>) -> Self {
        Self { tx, lagged }
    }

    fn push(&self, message: ServerMessage) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(message) {
            self.lagged.notify_one();
        }
    }
}

fn slow_client() -> EngineError {
    EngineError::Ipc("client is not reading events; disconnecting".into())
}
